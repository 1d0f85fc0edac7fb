//! Audio output: the handle the session drives, and the CPAL implementation of it.
//!
//! A [`CpalOutput`] opens a canonical file on a dedicated thread that owns the CPAL stream
//! (streams are not `Send` on every backend). The stream is built paused; the session calls
//! [`PlaybackHandle::play`] once it has committed to the track. Position comes from the frames
//! the callback actually wrote, so it never runs ahead of what was heard.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::config::PlaybackConfig;
use crate::decode;
use crate::device;
use crate::error::TranscodeError;
use crate::queue::{PopStrategy, SharedAudio};
use crate::resample;
use crate::transcode::{CANONICAL_CHANNELS, CANONICAL_SAMPLE_RATE};

/// Opens canonical files for playback.
pub trait AudioOutput: Send + Sync {
    /// Prepare `path` for playback. The returned handle starts paused.
    fn open(&self, path: &Path) -> Result<Box<dyn PlaybackHandle>, TranscodeError>;
}

/// A track loaded on the output device.
pub trait PlaybackHandle: Send {
    fn play(&self);
    fn pause(&self);
    /// Milliseconds actually rendered so far.
    fn position_ms(&self) -> u64;
    fn duration_ms(&self) -> u64;
    /// All audio has been rendered.
    fn is_finished(&self) -> bool;
    /// Stop output and free the device. Blocks until the output thread has exited.
    fn release(self: Box<Self>);
}

/// CPAL-backed [`AudioOutput`].
pub struct CpalOutput {
    playback: PlaybackConfig,
}

impl CpalOutput {
    pub fn new(playback: PlaybackConfig) -> Self {
        Self { playback }
    }
}

enum OutputCommand {
    Play,
    Pause,
    Stop,
}

struct Opened {
    duration_ms: u64,
    output_rate: u32,
}

impl AudioOutput for CpalOutput {
    fn open(&self, path: &Path) -> Result<Box<dyn PlaybackHandle>, TranscodeError> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let played_frames = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let join = {
            let path = path.to_path_buf();
            let playback = self.playback.clone();
            let played_frames = played_frames.clone();
            let finished = finished.clone();
            thread::Builder::new()
                .name("jukebox-output".into())
                .spawn(move || {
                    output_thread_main(path, playback, played_frames, finished, cmd_rx, ready_tx)
                })?
        };

        match ready_rx.recv() {
            Ok(Ok(opened)) => Ok(Box::new(CpalHandle {
                cmd_tx,
                played_frames,
                finished,
                duration_ms: opened.duration_ms,
                output_rate: opened.output_rate,
                join: Some(join),
            })),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                Err(TranscodeError::DeviceUnavailable(
                    "output thread exited during open".into(),
                ))
            }
        }
    }
}

struct CpalHandle {
    cmd_tx: Sender<OutputCommand>,
    played_frames: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
    duration_ms: u64,
    output_rate: u32,
    join: Option<JoinHandle<()>>,
}

impl CpalHandle {
    fn shutdown(&mut self) {
        let _ = self.cmd_tx.send(OutputCommand::Stop);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::warn!("output thread panicked");
            }
        }
    }
}

impl PlaybackHandle for CpalHandle {
    fn play(&self) {
        let _ = self.cmd_tx.send(OutputCommand::Play);
    }

    fn pause(&self) {
        let _ = self.cmd_tx.send(OutputCommand::Pause);
    }

    fn position_ms(&self) -> u64 {
        let frames = self.played_frames.load(Ordering::Relaxed);
        frames.saturating_mul(1000) / self.output_rate.max(1) as u64
    }

    fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    fn release(mut self: Box<Self>) {
        self.shutdown();
    }
}

impl Drop for CpalHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct OpenStream {
    stream: cpal::Stream,
    paused: Arc<AtomicBool>,
    srcq: Arc<SharedAudio>,
    dstq: Arc<SharedAudio>,
}

fn output_thread_main(
    path: PathBuf,
    playback: PlaybackConfig,
    played_frames: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
    cmd_rx: Receiver<OutputCommand>,
    ready_tx: Sender<Result<Opened, TranscodeError>>,
) {
    let (open, opened) = match open_stream(&path, &playback, played_frames) {
        Ok(v) => v,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    tracing::info!(
        path = %path.display(),
        duration_ms = opened.duration_ms,
        rate_hz = opened.output_rate,
        "output ready"
    );
    if ready_tx.send(Ok(opened)).is_err() {
        open.srcq.close();
        open.dstq.close();
        return;
    }

    loop {
        match cmd_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(OutputCommand::Play) => {
                open.paused.store(false, Ordering::Relaxed);
                if let Err(e) = open.stream.play() {
                    tracing::warn!("stream play failed: {e}");
                }
            }
            Ok(OutputCommand::Pause) => {
                open.paused.store(true, Ordering::Relaxed);
                if let Err(e) = open.stream.pause() {
                    tracing::debug!("stream pause unsupported: {e}");
                }
            }
            Ok(OutputCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if !finished.load(Ordering::Relaxed) && open.dstq.is_drained() {
            finished.store(true, Ordering::Relaxed);
            tracing::debug!("output drained");
        }
    }

    open.paused.store(true, Ordering::Relaxed);
    open.srcq.close();
    open.dstq.close();
    drop(open.stream);
    tracing::debug!("output closed");
}

fn open_stream(
    path: &Path,
    playback: &PlaybackConfig,
    played_frames: Arc<AtomicU64>,
) -> Result<(OpenStream, Opened), TranscodeError> {
    let host = cpal::default_host();
    let device = device::pick_device(&host, playback.device.as_deref())
        .map_err(|e| TranscodeError::DeviceUnavailable(format!("{e:#}")))?;
    let config = device::pick_output_config(&device, CANONICAL_SAMPLE_RATE, CANONICAL_CHANNELS)
        .map_err(|e| TranscodeError::DeviceUnavailable(format!("{e:#}")))?;
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(buf) = device::pick_buffer_size(&config) {
        stream_config.buffer_size = buf;
    }

    let (src_spec, srcq, duration_ms) =
        decode::start_streaming_decode(path, playback.buffer_seconds)?;
    let close_on_err = |e: TranscodeError| {
        srcq.close();
        e
    };
    let duration_ms = duration_ms
        .filter(|ms| *ms > 0)
        .ok_or_else(|| TranscodeError::UnsupportedFormat("stream has no audio frames".into()))
        .map_err(close_on_err)?;

    let dst_rate = stream_config.sample_rate;
    let dstq = if src_spec.rate == dst_rate {
        srcq.clone()
    } else {
        tracing::info!(from_hz = src_spec.rate, to_hz = dst_rate, "resampling for device");
        resample::start_resampler(
            srcq.clone(),
            src_spec.rate,
            dst_rate,
            playback.chunk_frames,
            playback.buffer_seconds,
        )
        .map_err(|e| TranscodeError::DeviceUnavailable(format!("{e:#}")))
        .map_err(close_on_err)?
    };

    let paused = Arc::new(AtomicBool::new(true));
    let stream = build_output_stream(
        &device,
        &stream_config,
        config.sample_format(),
        &dstq,
        CallbackConfig {
            refill_max_frames: playback.refill_max_frames,
            paused: paused.clone(),
            played_frames,
        },
    )
    .map_err(|e| {
        dstq.close();
        close_on_err(e)
    })?;
    if let Err(e) = stream.pause() {
        tracing::debug!("stream pause unsupported: {e}");
    }

    Ok((
        OpenStream {
            stream,
            paused,
            srcq,
            dstq,
        },
        Opened {
            duration_ms,
            output_rate: dst_rate,
        },
    ))
}

struct CallbackConfig {
    refill_max_frames: usize,
    /// While set the callback writes silence and leaves the queue untouched.
    paused: Arc<AtomicBool>,
    played_frames: Arc<AtomicU64>,
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    dstq: &Arc<SharedAudio>,
    cfg: CallbackConfig,
) -> Result<cpal::Stream, TranscodeError> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, dstq, cfg),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, dstq, cfg),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, dstq, cfg),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, dstq, cfg),
        other => Err(TranscodeError::DeviceUnavailable(format!(
            "unsupported device sample format: {other:?}"
        ))),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    dstq: &Arc<SharedAudio>,
    cfg: CallbackConfig,
) -> Result<cpal::Stream, TranscodeError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let dst_channels = (config.channels as usize).max(1);
    let src_channels = dstq.channels();
    let refill_max_frames = cfg.refill_max_frames.max(1);
    let dstq_cb = dstq.clone();
    let mut pending: Vec<f32> = Vec::new();
    let mut pos = 0usize;
    let mut frame_buf = vec![0.0f32; dst_channels];

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                if cfg.paused.load(Ordering::Relaxed) {
                    data.fill(silence::<T>());
                    return;
                }
                let frames = data.len() / dst_channels;
                let mut written = 0usize;
                for frame in 0..frames {
                    if pos >= pending.len() {
                        pos = 0;
                        match dstq_cb.pop(PopStrategy::NonBlocking {
                            max_frames: refill_max_frames,
                        }) {
                            Some(v) => pending = v,
                            None => {
                                pending.clear();
                                data[frame * dst_channels..].fill(silence::<T>());
                                break;
                            }
                        }
                    }
                    map_frame(&pending[pos..pos + src_channels], &mut frame_buf);
                    pos += src_channels;
                    for (out, s) in data[frame * dst_channels..(frame + 1) * dst_channels]
                        .iter_mut()
                        .zip(&frame_buf)
                    {
                        *out = <T as cpal::Sample>::from_sample::<f32>(*s);
                    }
                    written += 1;
                }
                if written > 0 {
                    cfg.played_frames.fetch_add(written as u64, Ordering::Relaxed);
                }
            },
            |err| tracing::warn!("stream error: {err}"),
            None,
        )
        .map_err(|e| TranscodeError::DeviceUnavailable(e.to_string()))
}

/// Equilibrium value of the device sample type (`0` for signed and float, mid-scale for unsigned).
fn silence<T>() -> T
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    <T as cpal::Sample>::from_sample::<f32>(0.0)
}

/// Map one interleaved source frame onto the device channel layout.
///
/// Mono is duplicated, stereo downmixes to mono by averaging, and wider devices get silence on
/// the channels past the source's.
fn map_frame(src: &[f32], dst: &mut [f32]) {
    match (src.len(), dst.len()) {
        (2, 1) => dst[0] = 0.5 * (src[0] + src[1]),
        (1, _) => dst.fill(src[0]),
        _ => {
            for (ch, out) in dst.iter_mut().enumerate() {
                *out = src.get(ch).copied().unwrap_or(0.0);
            }
        }
    }
}
