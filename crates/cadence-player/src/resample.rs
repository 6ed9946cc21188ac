//! Streaming resample stage: converts decoded audio at the source rate to
//! the negotiated device rate (§4.5, "Sample-rate changes mid-stream").
//!
//! Runs in a background thread on top of Rubato's streaming sinc
//! resampler and writes into a bounded [`SharedAudio`] queue consumed by
//! the playback stage.

use std::sync::Arc;
use std::thread;

use anyhow::Result;
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};
use symphonia::core::audio::SignalSpec;

use crate::queue::{PopStrategy, SharedAudio, calc_max_buffered_samples};

#[derive(Clone, Copy, Debug)]
pub struct ResampleConfig {
    pub chunk_frames: usize,
    pub buffer_seconds: f32,
}

impl Default for ResampleConfig {
    fn default() -> Self {
        Self { chunk_frames: 1024, buffer_seconds: 2.0 }
    }
}

/// Start a background resampler thread. Closes `dstq` once `srcq` closes
/// and drains.
pub fn start_resampler(
    srcq: Arc<SharedAudio>,
    src_spec: SignalSpec,
    dst_rate: u32,
    cfg: ResampleConfig,
) -> Result<Arc<SharedAudio>> {
    let src_rate = src_spec.rate;
    let channels = src_spec.channels.count();

    let max_buffered_samples = calc_max_buffered_samples(dst_rate, channels, cfg.buffer_seconds);
    let dstq = Arc::new(SharedAudio::new(channels, max_buffered_samples));

    let f_ratio = dst_rate as f64 / src_rate as f64;

    let sinc_len = 128;
    let oversampling_factor = 256;
    let interpolation = SincInterpolationType::Cubic;
    let window = WindowFunction::BlackmanHarris2;
    let f_cutoff = calculate_cutoff(sinc_len, window);

    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff,
        interpolation,
        oversampling_factor,
        window,
    };

    let chunk_in_frames = cfg.chunk_frames.max(1);

    let dstq_thread = dstq.clone();
    thread::spawn(move || {
        let mut resampler: Box<dyn Resampler<f32>> = match Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            chunk_in_frames,
            channels,
            FixedAsync::Input,
        ) {
            Ok(r) => Box::new(r),
            Err(e) => {
                tracing::error!("resampler init error: {e:#}");
                dstq_thread.close();
                return;
            }
        };

        let mut out_interleaved = vec![0.0f32; channels * chunk_in_frames * 3];
        let mut indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: None,
        };

        loop {
            let interleaved = match srcq.pop(PopStrategy::BlockingExact { frames: chunk_in_frames }) {
                Some(v) => v,
                None => break,
            };

            let produced = match resample_chunk(
                &mut *resampler,
                &interleaved,
                chunk_in_frames,
                channels,
                &mut out_interleaved,
                &mut indexing,
                None,
            ) {
                Some(n) => n,
                None => break,
            };
            dstq_thread.push_interleaved_blocking(&out_interleaved[..produced]);
        }

        while let Some(tail) = srcq.pop(PopStrategy::BlockingUpTo { max_frames: chunk_in_frames }) {
            let tail_frames = tail.len() / channels;
            if tail_frames == 0 {
                continue;
            }
            let produced = match resample_chunk(
                &mut *resampler,
                &tail,
                tail_frames,
                channels,
                &mut out_interleaved,
                &mut indexing,
                Some(tail_frames),
            ) {
                Some(n) => n,
                None => break,
            };
            if produced > 0 {
                dstq_thread.push_interleaved_blocking(&out_interleaved[..produced]);
            }
        }

        dstq_thread.close();
    });

    Ok(dstq)
}

/// Run one resampler step over `input` (exactly `input_frames` frames),
/// writing into `out_interleaved`. Returns the number of produced
/// samples, or `None` on a fatal adapter/resampler error.
#[allow(clippy::too_many_arguments)]
fn resample_chunk(
    resampler: &mut dyn Resampler<f32>,
    input: &[f32],
    input_frames: usize,
    channels: usize,
    out_interleaved: &mut [f32],
    indexing: &mut Indexing,
    partial_len: Option<usize>,
) -> Option<usize> {
    let input_adapter = InterleavedSlice::new(input, channels, input_frames)
        .map_err(|e| tracing::error!("interleaved slice (input) error: {e:#}"))
        .ok()?;

    let out_capacity_frames = out_interleaved.len() / channels;
    let mut output_adapter = InterleavedSlice::new_mut(out_interleaved, channels, out_capacity_frames)
        .map_err(|e| tracing::error!("interleaved slice (output) error: {e:#}"))
        .ok()?;

    indexing.input_offset = 0;
    indexing.output_offset = 0;
    indexing.partial_len = partial_len;

    let (_nbr_in, nbr_out) = resampler
        .process_into_buffer(&input_adapter, &mut output_adapter, Some(indexing))
        .map_err(|e| tracing::error!("resampler process error: {e:#}"))
        .ok()?;

    Some(nbr_out * channels)
}
