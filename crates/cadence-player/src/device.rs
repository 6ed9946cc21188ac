//! Output device discovery and negotiation (§4.5: "before producing PCM,
//! negotiates the device: declares bits-per-sample, sample rate, channel
//! count; the audio-sink returns the accepted parameters or fails
//! fatally").

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Pick an output device by substring match (case-insensitive), or the
/// host default if `needle` is `None`.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let mut devices: Vec<cpal::Device> = host.output_devices().context("no output devices")?.collect();

    if let Some(needle) = needle {
        let needle_lc = needle.to_lowercase();
        if let Some(d) = devices
            .drain(..)
            .find(|d| d.description().ok().map(|n| n.name().to_lowercase().contains(&needle_lc)).unwrap_or(false))
        {
            return Ok(d);
        }
        return Err(anyhow!("no output device matched: {needle}"));
    }

    host.default_output_device().ok_or_else(|| anyhow!("no default output device"))
}

/// Choose the best supported output config for a target sample rate.
///
/// Prefers a config whose range covers `target_rate` exactly; otherwise
/// clamps to the nearest supported rate. When `target_rate` is `None`,
/// picks the device's highest supported rate. This is the "negotiate the
/// device" step: the caller gets back the accepted parameters, never the
/// ones it asked for.
pub fn pick_output_config(device: &cpal::Device, target_rate: Option<u32>) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device.supported_output_configs()?.collect();
    if ranges.is_empty() {
        return Err(anyhow!("no supported output configs"));
    }

    let mut best: Option<(bool, u32, u8, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let below = target_rate.map(|t| rate <= t).unwrap_or(true);
        let format_rank = sample_format_rank(range.sample_format());
        let cfg = range.with_sample_rate(rate);
        let replace = match &best {
            None => true,
            Some((b_below, b_rate, b_rank, _)) => {
                is_better_candidate(below, rate, format_rank, *b_below, *b_rate, *b_rank)
            }
        };
        if replace {
            best = Some((below, rate, format_rank, cfg));
        }
    }

    Ok(best.expect("ranges is non-empty").3)
}

/// Prefer a fixed, generous buffer size over the device default to
/// reduce the odds of an underrun; `None` leaves it to CPAL.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            const MAX_FRAMES: u32 = 16_384;
            let chosen = if *max > MAX_FRAMES { (*min).max(MAX_FRAMES) } else { *max };
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        None => max,
        Some(target) if target < min => min,
        Some(target) if target > max => max,
        Some(target) => target,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(below: bool, rate: u32, format_rank: u8, best_below: bool, best_rate: u32, best_rank: u8) -> bool {
    if below != best_below {
        below && !best_below
    } else if rate != best_rate {
        rate > best_rate
    } else {
        format_rank < best_rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_rate_for_range_prefers_target_when_in_range() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(48_000)), 48_000);
    }

    #[test]
    fn pick_rate_for_range_clamps_below_min() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(22_050)), 44_100);
    }

    #[test]
    fn pick_rate_for_range_clamps_above_max() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(192_000)), 96_000);
    }

    #[test]
    fn pick_rate_for_range_defaults_to_max() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, None), 96_000);
    }

    #[test]
    fn is_better_candidate_prefers_below_target() {
        assert!(is_better_candidate(true, 48_000, 1, false, 48_000, 1));
    }

    #[test]
    fn is_better_candidate_prefers_lower_rank_at_equal_rate() {
        assert!(is_better_candidate(true, 48_000, 0, true, 48_000, 2));
    }
}
