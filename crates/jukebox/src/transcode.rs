//! Normalization of fetched audio to the canonical playback format.
//!
//! The canonical format is 16-bit little-endian PCM WAV, 44.1 kHz, stereo. Files already in that
//! shape are copied byte for byte; anything else Symphonia can decode is converted (channel
//! mapping, Rubato resampling, `i16` quantization) and written with `hound`.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::CODEC_TYPE_PCM_S16LE;
use symphonia::core::errors::Error as SymphoniaError;

use crate::decode::{self, ProbedSource};
use crate::error::TranscodeError;
use crate::resample::StreamResampler;
use crate::scratch::ScratchSet;

pub const CANONICAL_SAMPLE_RATE: u32 = 44_100;
pub const CANONICAL_CHANNELS: u16 = 2;
pub const CANONICAL_BITS_PER_SAMPLE: u16 = 16;

/// Converts an input file into a canonical-format scratch file.
pub trait Transcoder: Send + Sync {
    /// On failure no output file is left in `scratch`; the input is never touched.
    /// Raising `cancel` abandons the conversion with [`TranscodeError::Cancelled`].
    fn transcode(
        &self,
        input: &Path,
        scratch: &ScratchSet,
        cancel: &AtomicBool,
    ) -> Result<PathBuf, TranscodeError>;
}

/// Symphonia + Rubato + hound transcoder.
#[derive(Debug, Clone)]
pub struct CanonicalTranscoder {
    chunk_frames: usize,
}

impl Default for CanonicalTranscoder {
    fn default() -> Self {
        Self { chunk_frames: 1024 }
    }
}

impl CanonicalTranscoder {
    pub fn new(chunk_frames: usize) -> Self {
        Self {
            chunk_frames: chunk_frames.max(1),
        }
    }

    fn transcode_into(
        &self,
        input: &Path,
        output: File,
        cancel: &AtomicBool,
    ) -> Result<(), TranscodeError> {
        let source = decode::open_source(input)?;
        if is_canonical(input, &source)? {
            tracing::debug!(input = %input.display(), "already canonical, copying");
            let mut output = BufWriter::new(output);
            io::copy(&mut File::open(input)?, &mut output)?;
            output.flush()?;
            return Ok(());
        }
        tracing::debug!(
            input = %input.display(),
            codec = decode::codec_name(&source.codec_params),
            rate_hz = source.spec.rate,
            channels = source.spec.channels.count(),
            "re-encoding to canonical format"
        );
        self.reencode(source, output, cancel)
    }

    fn reencode(
        &self,
        source: ProbedSource,
        output: File,
        cancel: &AtomicBool,
    ) -> Result<(), TranscodeError> {
        let mut decoder = source.make_decoder()?;
        let src_rate = source.spec.rate;
        let ProbedSource {
            mut format,
            track_id,
            ..
        } = source;

        let mut resampler = if src_rate == CANONICAL_SAMPLE_RATE {
            None
        } else {
            Some(
                StreamResampler::new(
                    src_rate,
                    CANONICAL_SAMPLE_RATE,
                    CANONICAL_CHANNELS as usize,
                    self.chunk_frames,
                )
                .map_err(|e| {
                    TranscodeError::UnsupportedFormat(format!("cannot resample {src_rate} Hz: {e:#}"))
                })?,
            )
        };

        let mut writer = hound::WavWriter::new(BufWriter::new(output), canonical_wav_spec())
            .map_err(map_hound_error)?;
        let mut converted = Vec::new();
        let mut frames_written = 0u64;

        while let Some(packet) = decode::next_track_packet(format.as_mut(), track_id)? {
            if cancel.load(Ordering::SeqCst) {
                return Err(TranscodeError::Cancelled);
            }
            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!("skipping undecodable packet: {e}");
                    continue;
                }
                Err(e) => return Err(decode::map_symphonia_error(e)),
            };
            let spec = *decoded.spec();
            let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);
            let stereo = to_stereo(sample_buf.samples(), spec.channels.count());

            converted.clear();
            match resampler.as_mut() {
                Some(rs) => rs
                    .process(&stereo, &mut converted)
                    .map_err(|e| TranscodeError::UnsupportedFormat(format!("{e:#}")))?,
                None => converted.extend_from_slice(&stereo),
            }
            frames_written += write_samples(&mut writer, &converted)?;
        }

        if let Some(rs) = resampler.as_mut() {
            converted.clear();
            rs.finish(&mut converted)
                .map_err(|e| TranscodeError::UnsupportedFormat(format!("{e:#}")))?;
            frames_written += write_samples(&mut writer, &converted)?;
        }

        writer.finalize().map_err(map_hound_error)?;
        if frames_written == 0 {
            return Err(TranscodeError::UnsupportedFormat(
                "no decodable audio frames".into(),
            ));
        }
        Ok(())
    }
}

impl Transcoder for CanonicalTranscoder {
    fn transcode(
        &self,
        input: &Path,
        scratch: &ScratchSet,
        cancel: &AtomicBool,
    ) -> Result<PathBuf, TranscodeError> {
        let (file, output) = scratch.create("out", ".wav")?;
        match self.transcode_into(input, file, cancel) {
            Ok(()) => Ok(output),
            Err(e) => {
                if let Err(rm) = scratch.discard(&output) {
                    tracing::warn!(path = %output.display(), "scratch cleanup warning: {rm}");
                }
                Err(e)
            }
        }
    }
}

pub fn canonical_wav_spec() -> hound::WavSpec {
    hound::WavSpec {
        channels: CANONICAL_CHANNELS,
        sample_rate: CANONICAL_SAMPLE_RATE,
        bits_per_sample: CANONICAL_BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Int,
    }
}

/// RIFF/WAVE container holding 16-bit LE PCM at 44.1 kHz stereo.
fn is_canonical(input: &Path, source: &ProbedSource) -> Result<bool, TranscodeError> {
    let params = &source.codec_params;
    let shape_matches = params.codec == CODEC_TYPE_PCM_S16LE
        && source.spec.rate == CANONICAL_SAMPLE_RATE
        && source.spec.channels.count() == CANONICAL_CHANNELS as usize;
    if !shape_matches {
        return Ok(false);
    }
    let mut magic = [0u8; 12];
    let mut file = File::open(input)?;
    if file.read_exact(&mut magic).is_err() {
        return Ok(false);
    }
    Ok(&magic[0..4] == b"RIFF" && &magic[8..12] == b"WAVE")
}

/// Interleaved samples of any layout to interleaved stereo.
///
/// Mono is duplicated; layouts wider than stereo keep the front left/right pair.
fn to_stereo(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.iter().flat_map(|s| [*s, *s]).collect(),
        2 => samples.to_vec(),
        n => samples
            .chunks_exact(n)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

fn write_samples<W>(writer: &mut hound::WavWriter<W>, samples: &[f32]) -> Result<u64, TranscodeError>
where
    W: Write + Seek,
{
    for s in samples {
        writer
            .write_sample(to_i16(*s))
            .map_err(map_hound_error)?;
    }
    Ok((samples.len() / CANONICAL_CHANNELS as usize) as u64)
}

fn to_i16(sample: f32) -> i16 {
    (sample * 32767.0).round().clamp(-32768.0, 32767.0) as i16
}

fn map_hound_error(err: hound::Error) -> TranscodeError {
    match err {
        hound::Error::IoError(e) => TranscodeError::Io(e),
        other => TranscodeError::UnsupportedFormat(other.to_string()),
    }
}
