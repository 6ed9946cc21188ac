//! Streaming decode stage.
//!
//! Uses Symphonia to probe the container/codec, decode packets into
//! interleaved `f32` samples, and push them into a bounded
//! [`SharedAudio`] queue from a background thread. The source is always
//! an already-open [`std::fs::File`] handed to us by main over the
//! privileged link (§4.4, "Player-fd delivery") — the worker never opens
//! a path itself.

use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::CodecParameters;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::{
    audio::SignalSpec, codecs::DecoderOptions, formats::FormatOptions, meta::MetadataOptions, probe::Hint,
};

use crate::codec::Codec;
use crate::queue::{SharedAudio, calc_max_buffered_samples};

/// Best-effort metadata captured while probing, used for logging and the
/// `TrackStarted` duration report.
#[derive(Clone, Debug, Default)]
pub struct SourceInfo {
    pub codec: Option<String>,
    pub duration_secs: Option<i64>,
}

/// Start a background decoder thread streaming interleaved `f32` samples
/// from `file`, starting at `seek_ms` if given (used by `Seek`).
///
/// The decode loop polls `stop` between packets so a `Stop`/re-`Play`
/// command can cut it off promptly (§4.5, "should_stop predicate")
/// instead of waiting for natural EOF.
pub fn start_streaming_decode(
    file: File,
    sniffed: Codec,
    buffer_seconds: f32,
    seek_ms: Option<u64>,
    stop: Arc<AtomicBool>,
) -> Result<(SignalSpec, Arc<SharedAudio>, SourceInfo)> {
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = sniffed.extension_hint() {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .context("probe audio container")?;

    let mut format = probed.format;
    if let Some(ms) = seek_ms.filter(|ms| *ms > 0) {
        let secs = ms / 1000;
        let frac = (ms % 1000) as f64 / 1000.0;
        let time = symphonia::core::units::Time::new(secs, frac);
        let _ = format.seek(
            symphonia::core::formats::SeekMode::Accurate,
            symphonia::core::formats::SeekTo::Time { time, track_id: None },
        );
    }

    let track = format.default_track().ok_or_else(|| anyhow!("no default audio track"))?;
    let channels = track.codec_params.channels.ok_or_else(|| anyhow!("unknown channels"))?.count();
    let rate = track.codec_params.sample_rate.ok_or_else(|| anyhow!("unknown sample rate"))?;
    let spec = SignalSpec::new(rate, track.codec_params.channels.unwrap());

    let codec_params: CodecParameters = track.codec_params.clone();
    let source_info = SourceInfo {
        codec: codec_name_from_params(&codec_params).or_else(|| Some(sniffed.label().to_string())),
        duration_secs: duration_secs_from_codec_params(&codec_params),
    };

    let max_buffered_samples = calc_max_buffered_samples(rate, channels, buffer_seconds);
    let shared = Arc::new(SharedAudio::new(channels, max_buffered_samples));
    let shared_for_thread = shared.clone();

    thread::spawn(move || {
        if let Err(e) = decode_format_loop(format, codec_params, &shared_for_thread, &stop) {
            tracing::warn!("decoder thread error: {e:#}");
        }
        shared_for_thread.close();
    });

    Ok((spec, shared, source_info))
}

fn decode_format_loop(
    mut format: Box<dyn symphonia::core::formats::FormatReader>,
    codec_params: CodecParameters,
    shared: &Arc<SharedAudio>,
    stop: &Arc<AtomicBool>,
) -> Result<()> {
    let mut decoder = symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(_) => break, // EOF or fatal container error; treated the same as end of stream
        };

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(_) => continue,
        };

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);
        shared.push_interleaved_blocking(sample_buf.samples());
    }

    Ok(())
}

fn duration_secs_from_codec_params(params: &CodecParameters) -> Option<i64> {
    let frames = params.n_frames?;
    let rate = params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some((frames / rate) as i64)
}

fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "flac",
        CODEC_TYPE_MP3 => "mp3",
        CODEC_TYPE_AAC => "aac",
        CODEC_TYPE_VORBIS => "vorbis",
        _ => return None,
    };
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use symphonia::core::codecs::*;

    #[test]
    fn duration_secs_from_codec_params_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(duration_secs_from_codec_params(&params).is_none());
    }

    #[test]
    fn duration_secs_from_codec_params_computes() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(48_000);
        params.n_frames = Some(96_000);
        assert_eq!(duration_secs_from_codec_params(&params), Some(2));
    }

    #[test]
    fn codec_name_from_params_maps_known_codecs() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_FLAC;
        assert_eq!(codec_name_from_params(&params), Some("flac".to_string()));
    }

    #[test]
    fn codec_name_from_params_unknown_returns_none() {
        let params = CodecParameters::new();
        assert!(codec_name_from_params(&params).is_none());
    }
}
