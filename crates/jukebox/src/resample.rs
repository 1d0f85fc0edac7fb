//! Sample-rate conversion with Rubato.
//!
//! [`StreamResampler`] is the synchronous core: feed it interleaved `f32` of any length and it
//! emits converted samples chunk by chunk. The transcoder drives it inline; the playback path
//! wraps it in a background thread with [`start_resampler`].

use std::sync::Arc;
use std::thread;

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::queue::{PopStrategy, SharedAudio, calc_max_buffered_samples};

/// Streaming sinc resampler over interleaved samples.
pub struct StreamResampler {
    resampler: Box<dyn Resampler<f32>>,
    channels: usize,
    chunk_frames: usize,
    pending: Vec<f32>,
    out_interleaved: Vec<f32>,
    indexing: Indexing,
}

impl StreamResampler {
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        if src_rate == 0 || dst_rate == 0 || channels == 0 {
            return Err(anyhow!(
                "invalid resampler shape: {src_rate} Hz -> {dst_rate} Hz, {channels} ch"
            ));
        }
        let chunk_frames = chunk_frames.max(1);
        let f_ratio = dst_rate as f64 / src_rate as f64;

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let resampler = Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| anyhow!("resampler init: {e}"))?;
        let out_frames = (chunk_frames as f64 * f_ratio * 1.1).ceil() as usize + chunk_frames;

        Ok(Self {
            resampler: Box::new(resampler),
            channels,
            chunk_frames,
            pending: Vec::with_capacity(chunk_frames * channels * 2),
            out_interleaved: vec![0.0; out_frames * channels],
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    /// Queue `input` and convert every complete chunk; converted samples are appended to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        self.pending.extend_from_slice(input);
        let chunk_samples = self.chunk_frames * self.channels;
        let mut consumed = 0;
        while self.pending.len() - consumed >= chunk_samples {
            let chunk = self.pending[consumed..consumed + chunk_samples].to_vec();
            self.run_chunk(&chunk, None, out)?;
            consumed += chunk_samples;
        }
        self.pending.drain(..consumed);
        Ok(())
    }

    /// Convert whatever partial chunk is still pending.
    pub fn finish(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let tail_frames = self.pending.len() / self.channels;
        if tail_frames == 0 {
            self.pending.clear();
            return Ok(());
        }
        let mut chunk = std::mem::take(&mut self.pending);
        chunk.truncate(tail_frames * self.channels);
        chunk.resize(self.chunk_frames * self.channels, 0.0);
        self.run_chunk(&chunk, Some(tail_frames), out)
    }

    fn run_chunk(
        &mut self,
        interleaved: &[f32],
        partial_len: Option<usize>,
        out: &mut Vec<f32>,
    ) -> Result<()> {
        let input_adapter = InterleavedSlice::new(interleaved, self.channels, self.chunk_frames)
            .map_err(|e| anyhow!("interleaved slice (input): {e}"))?;
        let out_capacity_frames = self.out_interleaved.len() / self.channels;
        let mut output_adapter =
            InterleavedSlice::new_mut(&mut self.out_interleaved, self.channels, out_capacity_frames)
                .map_err(|e| anyhow!("interleaved slice (output): {e}"))?;

        self.indexing.input_offset = 0;
        self.indexing.output_offset = 0;
        self.indexing.partial_len = partial_len;

        let (_nbr_in, nbr_out) = self
            .resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&self.indexing))
            .map_err(|e| anyhow!("resampler process: {e}"))?;
        out.extend_from_slice(&self.out_interleaved[..nbr_out * self.channels]);
        Ok(())
    }
}

/// Start a background resampler thread between two queues.
///
/// When `srcq` closes and drains, the tail is flushed and the returned queue is closed. Closing
/// the returned queue early makes the thread stop and close `srcq` too.
pub fn start_resampler(
    srcq: Arc<SharedAudio>,
    src_rate: u32,
    dst_rate: u32,
    chunk_frames: usize,
    buffer_seconds: f32,
) -> Result<Arc<SharedAudio>> {
    let channels = srcq.channels();
    let mut resampler = StreamResampler::new(src_rate, dst_rate, channels, chunk_frames)?;
    let dstq = Arc::new(SharedAudio::new(
        channels,
        calc_max_buffered_samples(dst_rate, channels, buffer_seconds),
    ));

    let dstq_thread = dstq.clone();
    let chunk = chunk_frames.max(1);
    thread::spawn(move || {
        let mut out = Vec::new();
        while let Some(block) = srcq.pop(PopStrategy::BlockingUpTo { max_frames: chunk }) {
            out.clear();
            if let Err(e) = resampler.process(&block, &mut out) {
                tracing::error!("resampler error: {e:#}");
                break;
            }
            if !dstq_thread.push_interleaved_blocking(&out) {
                break;
            }
        }
        out.clear();
        if !dstq_thread.is_closed() {
            if let Err(e) = resampler.finish(&mut out) {
                tracing::error!("resampler tail error: {e:#}");
            } else {
                dstq_thread.push_interleaved_blocking(&out);
            }
        }
        srcq.close();
        dstq_thread.close();
    });

    Ok(dstq)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frames: usize, rate: u32, channels: usize) -> Vec<f32> {
        let mut v = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            let s = (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / rate as f32).sin() * 0.5;
            for _ in 0..channels {
                v.push(s);
            }
        }
        v
    }

    #[test]
    fn rejects_zero_rates() {
        assert!(StreamResampler::new(0, 44_100, 2, 1024).is_err());
        assert!(StreamResampler::new(22_050, 44_100, 0, 1024).is_err());
    }

    #[test]
    fn doubling_rate_roughly_doubles_frames() {
        let mut rs = StreamResampler::new(22_050, 44_100, 2, 1024).unwrap();
        let input = sine(22_050, 22_050, 2);
        let mut out = Vec::new();
        for block in input.chunks(3_000) {
            rs.process(block, &mut out).unwrap();
        }
        rs.finish(&mut out).unwrap();
        let frames = out.len() / 2;
        assert_eq!(out.len() % 2, 0);
        assert!(frames > 40_000 && frames < 46_000, "frames = {frames}");
    }

    #[test]
    fn process_holds_back_partial_chunks_until_finish() {
        let mut rs = StreamResampler::new(48_000, 44_100, 1, 512).unwrap();
        let mut out = Vec::new();
        rs.process(&sine(100, 48_000, 1), &mut out).unwrap();
        assert!(out.is_empty());
        rs.finish(&mut out).unwrap();
        assert!(!out.is_empty());
    }

    #[test]
    fn threaded_stage_closes_output_after_input() {
        let srcq = Arc::new(SharedAudio::new(2, 1 << 16));
        let dstq = start_resampler(srcq.clone(), 22_050, 44_100, 256, 1.0).unwrap();
        let producer = {
            let srcq = srcq.clone();
            thread::spawn(move || {
                srcq.push_interleaved_blocking(&sine(4_410, 22_050, 2));
                srcq.close();
            })
        };
        let mut total = 0usize;
        while let Some(block) = dstq.pop(PopStrategy::BlockingUpTo { max_frames: 4096 }) {
            total += block.len() / 2;
        }
        producer.join().unwrap();
        assert!(total > 8_000, "total = {total}");
        assert!(dstq.is_drained());
    }
}
