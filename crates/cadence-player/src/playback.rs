//! Playback stage: builds the CPAL output stream and its real-time
//! callback.
//!
//! The callback refills a small local buffer from the shared queue
//! without blocking, applies basic channel mapping (mono<->stereo,
//! best-effort otherwise), and converts `f32` samples to the device's
//! sample format. It never blocks on a lock longer than a `try_lock`-free
//! mutex acquisition and never waits on a condition variable; underruns
//! are filled with silence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::queue::{PopStrategy, SharedAudio};

#[derive(Clone, Debug, Default)]
pub struct PlaybackConfig {
    /// Maximum frames pulled from the queue per refill.
    pub refill_max_frames: usize,
    /// Silences output and skips draining the queue while `true` (§4.3, Pause).
    pub paused: Option<Arc<AtomicBool>>,
    /// Incremented by output frames actually produced (drives position reporting).
    pub played_frames: Option<Arc<AtomicU64>>,
    /// Incremented on underrun, for diagnostics only.
    pub underrun_events: Option<Arc<AtomicU64>>,
}

pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    dstq: &Arc<SharedAudio>,
    cfg: PlaybackConfig,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, dstq, cfg),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, dstq, cfg),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, dstq, cfg),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, dstq, cfg),
        other => Err(anyhow!("unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    dstq: &Arc<SharedAudio>,
    cfg: PlaybackConfig,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let refill_max_frames = cfg.refill_max_frames.max(1);

    let state = Arc::new(Mutex::new(PlaybackState { pos: 0, src_channels: dstq.channels(), src: Vec::new() }));
    let dstq_cb = dstq.clone();
    let paused_flag = cfg.paused;
    let played_frames = cfg.played_frames;
    let underrun_events = cfg.underrun_events;

    let err_fn = |err| tracing::warn!("stream error: {err}");
    let state_cb = state.clone();

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            if let Some(p) = &paused_flag {
                if p.load(Ordering::Relaxed) {
                    data.fill(<T as cpal::Sample>::from_sample::<f32>(0.0));
                    return;
                }
            }

            let mut st = state_cb.lock().unwrap();
            let frames = data.len() / channels_out;
            let mut filled_frames = 0usize;

            for frame in 0..frames {
                if st.pos >= st.src.len() {
                    st.pos = 0;
                    st.src.clear();
                    if let Some(v) = dstq_cb.pop(PopStrategy::NonBlocking { max_frames: refill_max_frames }) {
                        st.src = v;
                    } else {
                        if let Some(events) = &underrun_events {
                            events.fetch_add(1, Ordering::Relaxed);
                        }
                        for idx in (frame * channels_out)..data.len() {
                            data[idx] = <T as cpal::Sample>::from_sample::<f32>(0.0);
                        }
                        break;
                    }
                }
                for ch in 0..channels_out {
                    let sample = next_sample_mapped_from_vec(&mut st, channels_out, ch);
                    data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(sample);
                }
                filled_frames += 1;
            }

            if filled_frames > 0 {
                if let Some(counter) = &played_frames {
                    counter.fetch_add(filled_frames as u64, Ordering::Relaxed);
                }
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Local playback buffer state for the CPAL callback, kept small so the
/// queue's mutex is held only briefly per refill.
struct PlaybackState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

/// Read the next output sample for `dst_ch`, applying a simple channel
/// mapping: mono<->stereo duplicates/averages; anything else clamps to
/// the nearest available source channel. `st.pos` advances once per
/// destination frame (after the last channel is read).
fn next_sample_mapped_from_vec(st: &mut PlaybackState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let get_src = |ch: usize, st: &PlaybackState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() { st.src[frame_start + ch] } else { 0.0 }
    };

    let out = match (st.src_channels, dst_channels) {
        (1, 1) => get_src(0, st),
        (2, 2) => get_src(dst_ch.min(1), st),
        (2, 1) => 0.5 * (get_src(0, st) + get_src(1, st)),
        (1, 2) => get_src(0, st),
        _ => get_src(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_to_stereo_duplicates() {
        let mut st = PlaybackState { pos: 0, src_channels: 1, src: vec![0.25] };
        let left = next_sample_mapped_from_vec(&mut st, 2, 0);
        let right = next_sample_mapped_from_vec(&mut st, 2, 1);
        assert_eq!(left, 0.25);
        assert_eq!(right, 0.25);
        assert_eq!(st.pos, 1);
    }

    #[test]
    fn stereo_to_mono_averages() {
        let mut st = PlaybackState { pos: 0, src_channels: 2, src: vec![0.5, -0.5] };
        assert_eq!(next_sample_mapped_from_vec(&mut st, 1, 0), 0.0);
        assert_eq!(st.pos, 2);
    }

    #[test]
    fn stereo_passthrough() {
        let mut st = PlaybackState { pos: 0, src_channels: 2, src: vec![0.1, 0.2] };
        assert_eq!(next_sample_mapped_from_vec(&mut st, 2, 0), 0.1);
        assert_eq!(next_sample_mapped_from_vec(&mut st, 2, 1), 0.2);
        assert_eq!(st.pos, 2);
    }

    #[test]
    fn empty_buffer_returns_silence() {
        let mut st = PlaybackState { pos: 0, src_channels: 2, src: Vec::new() };
        assert_eq!(next_sample_mapped_from_vec(&mut st, 2, 0), 0.0);
        assert_eq!(st.pos, 0);
    }
}
