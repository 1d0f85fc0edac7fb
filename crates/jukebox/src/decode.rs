//! Symphonia probing and the streaming decode stage.
//!
//! [`open_source`] probes a file and picks its default track; both the transcoder and the
//! playback path start from it. [`start_streaming_decode`] runs the decode loop on a background
//! thread and feeds a bounded [`SharedAudio`] queue.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::TranscodeError;
use crate::queue::{SharedAudio, calc_max_buffered_samples};

/// A probed input with its selected track.
pub struct ProbedSource {
    pub format: Box<dyn FormatReader>,
    pub track_id: u32,
    pub codec_params: CodecParameters,
    pub spec: SignalSpec,
}

impl ProbedSource {
    pub fn make_decoder(&self) -> Result<Box<dyn Decoder>, TranscodeError> {
        symphonia::default::get_codecs()
            .make(&self.codec_params, &DecoderOptions::default())
            .map_err(map_symphonia_error)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        duration_ms_from_codec_params(&self.codec_params)
    }
}

/// Probe `path` and select its default track.
///
/// Anything Symphonia cannot recognize, including short garbage that runs out of bytes while
/// probing, is reported as [`TranscodeError::UnsupportedFormat`].
pub fn open_source(path: &Path) -> Result<ProbedSource, TranscodeError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| match e {
            SymphoniaError::IoError(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                TranscodeError::UnsupportedFormat("unrecognized audio data".into())
            }
            other => map_symphonia_error(other),
        })?;

    let format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| TranscodeError::UnsupportedFormat("no audio track".into()))?;
    let codec_params = track.codec_params.clone();
    let track_id = track.id;

    let channels = codec_params
        .channels
        .ok_or_else(|| TranscodeError::UnsupportedFormat("unknown channel layout".into()))?;
    let rate = codec_params
        .sample_rate
        .filter(|r| *r > 0)
        .ok_or_else(|| TranscodeError::UnsupportedFormat("unknown sample rate".into()))?;

    Ok(ProbedSource {
        format,
        track_id,
        codec_params,
        spec: SignalSpec::new(rate, channels),
    })
}

pub fn map_symphonia_error(err: SymphoniaError) -> TranscodeError {
    match err {
        SymphoniaError::IoError(e) => TranscodeError::Io(e),
        SymphoniaError::Unsupported(what) => TranscodeError::UnsupportedFormat(what.to_string()),
        other => TranscodeError::UnsupportedFormat(other.to_string()),
    }
}

/// Read the next packet of `track_id`, or `None` at end of stream.
pub fn next_track_packet(
    format: &mut dyn FormatReader,
    track_id: u32,
) -> Result<Option<symphonia::core::formats::Packet>, TranscodeError> {
    loop {
        match format.next_packet() {
            Ok(packet) if packet.track_id() == track_id => return Ok(Some(packet)),
            Ok(_) => continue,
            Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(SymphoniaError::ResetRequired) => return Ok(None),
            Err(e) => return Err(map_symphonia_error(e)),
        }
    }
}

/// Start a background decoder thread for `path`.
///
/// Returns the stream spec, the queue and the duration reported by the container. The queue is
/// closed on EOF or error; closing it from the consumer side stops the thread.
pub fn start_streaming_decode(
    path: &Path,
    buffer_seconds: f32,
) -> Result<(SignalSpec, Arc<SharedAudio>, Option<u64>), TranscodeError> {
    let source = open_source(path)?;
    let mut decoder = source.make_decoder()?;
    let spec = source.spec;
    let duration_ms = source.duration_ms();
    let channels = spec.channels.count();

    let shared = Arc::new(SharedAudio::new(
        channels,
        calc_max_buffered_samples(spec.rate, channels, buffer_seconds),
    ));
    let shared_for_thread = shared.clone();
    let ProbedSource {
        mut format,
        track_id,
        ..
    } = source;

    thread::Builder::new()
        .name("jukebox-decode".into())
        .spawn(move || {
            loop {
                let packet = match next_track_packet(format.as_mut(), track_id) {
                    Ok(Some(p)) => p,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("decoder thread error: {e}");
                        break;
                    }
                };
                let decoded = match decoder.decode(&packet) {
                    Ok(d) => d,
                    Err(SymphoniaError::DecodeError(e)) => {
                        tracing::debug!("skipping undecodable packet: {e}");
                        continue;
                    }
                    Err(e) => {
                        tracing::error!("decoder thread error: {e}");
                        break;
                    }
                };
                let mut sample_buf =
                    SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
                sample_buf.copy_interleaved_ref(decoded);
                if !shared_for_thread.push_interleaved_blocking(sample_buf.samples()) {
                    break;
                }
            }
            shared_for_thread.close();
        })?;

    Ok((spec, shared, duration_ms))
}

/// Duration in milliseconds from codec metadata, when the container reports total frames.
pub fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Short codec label for log lines.
pub fn codec_name(params: &CodecParameters) -> &'static str {
    use symphonia::core::codecs::*;
    match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use symphonia::core::codecs::{CODEC_TYPE_FLAC, CODEC_TYPE_PCM_S16LE};

    use super::*;
    use crate::queue::PopStrategy;

    fn write_wav(path: &Path, rate: u32, channels: u16, frames: u32) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            for _ in 0..channels {
                writer.write_sample(((i % 100) as i16) * 100).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn duration_ms_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(duration_ms_from_codec_params(&params).is_none());
    }

    #[test]
    fn duration_ms_computes() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(48_000);
        params.n_frames = Some(96_000);
        assert_eq!(duration_ms_from_codec_params(&params), Some(2000));
    }

    #[test]
    fn codec_name_maps_known_types() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_FLAC;
        assert_eq!(codec_name(&params), "FLAC");
        params.codec = CODEC_TYPE_PCM_S16LE;
        assert_eq!(codec_name(&params), "PCM_S16");
    }

    #[test]
    fn open_source_reads_wav_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 22_050, 1, 22_050);
        let source = open_source(&path).unwrap();
        assert_eq!(source.spec.rate, 22_050);
        assert_eq!(source.spec.channels.count(), 1);
        assert_eq!(source.duration_ms(), Some(1000));
    }

    #[test]
    fn open_source_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"definitely not audio")
            .unwrap();
        assert!(matches!(
            open_source(&path),
            Err(TranscodeError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn streaming_decode_delivers_all_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 44_100, 2, 4_410);
        let (spec, queue, duration) = start_streaming_decode(&path, 1.0).unwrap();
        assert_eq!(spec.rate, 44_100);
        assert_eq!(duration, Some(100));
        let mut frames = 0;
        while let Some(block) = queue.pop(PopStrategy::BlockingUpTo { max_frames: 1024 }) {
            frames += block.len() / 2;
        }
        assert_eq!(frames, 4_410);
    }
}
