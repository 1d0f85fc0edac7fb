//! Output device discovery and stream configuration.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Pick the output device whose name contains `needle` (case-insensitive), or the host default.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let Some(needle) = needle.filter(|n| !n.trim().is_empty()) else {
        return host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default output device"));
    };
    host.output_devices()
        .context("enumerate output devices")?
        .find(|d| {
            d.description()
                .map(|desc| matches_device_name(&desc.name(), needle))
                .unwrap_or(false)
        })
        .ok_or_else(|| anyhow!("no output device matched: {needle}"))
}

/// Names of the host's output devices, in enumeration order.
pub fn list_devices(host: &cpal::Host) -> Result<Vec<String>> {
    let devices = host.output_devices().context("enumerate output devices")?;
    let mut names = Vec::new();
    for d in devices {
        names.push(d.description()?.name().to_string());
    }
    Ok(names)
}

/// Choose the output config closest to `target_rate` with `target_channels`.
///
/// Candidates are ranked by: exact rate, channel count match, rate not above target, higher
/// rate, then sample format.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: u32,
    target_channels: u16,
) -> Result<cpal::SupportedStreamConfig> {
    device
        .supported_output_configs()
        .context("query output configs")?
        .map(|range| {
            let rate = clamp_rate(range.min_sample_rate(), range.max_sample_rate(), target_rate);
            let rank = CandidateRank::new(
                rate,
                range.channels(),
                range.sample_format(),
                target_rate,
                target_channels,
            );
            (rank, range.with_sample_rate(rate))
        })
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("device reports no output configs"))
}

/// Fixed buffer size when the device advertises a range, capped at 16k frames.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    const MAX_FRAMES: u32 = 16_384;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed((*max).min(MAX_FRAMES).max(*min)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Ordering key for config candidates; larger is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct CandidateRank {
    exact_rate: bool,
    channels_match: bool,
    not_above: bool,
    rate: u32,
    format: u8,
}

impl CandidateRank {
    fn new(
        rate: u32,
        channels: u16,
        format: cpal::SampleFormat,
        target_rate: u32,
        target_channels: u16,
    ) -> Self {
        Self {
            exact_rate: rate == target_rate,
            channels_match: channels == target_channels,
            not_above: rate <= target_rate,
            rate,
            format: sample_format_score(format),
        }
    }
}

fn clamp_rate(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn sample_format_score(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 4,
        cpal::SampleFormat::I32 => 3,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 1,
        _ => 0,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    !needle.is_empty() && name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use cpal::SampleFormat;

    use super::*;

    #[test]
    fn device_name_match_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", " USB "));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", ""));
    }

    #[test]
    fn clamp_rate_stays_inside_range() {
        assert_eq!(clamp_rate(8_000, 192_000, 44_100), 44_100);
        assert_eq!(clamp_rate(48_000, 96_000, 44_100), 48_000);
        assert_eq!(clamp_rate(8_000, 32_000, 44_100), 32_000);
    }

    #[test]
    fn exact_rate_beats_channel_match() {
        let exact = CandidateRank::new(44_100, 8, SampleFormat::I16, 44_100, 2);
        let stereo = CandidateRank::new(48_000, 2, SampleFormat::F32, 44_100, 2);
        assert!(exact > stereo);
    }

    #[test]
    fn lower_rate_preferred_over_higher_when_neither_exact() {
        let below = CandidateRank::new(32_000, 2, SampleFormat::I16, 44_100, 2);
        let above = CandidateRank::new(48_000, 2, SampleFormat::F32, 44_100, 2);
        assert!(below > above);
    }

    #[test]
    fn float_format_breaks_ties() {
        let f32_rank = CandidateRank::new(44_100, 2, SampleFormat::F32, 44_100, 2);
        let i16_rank = CandidateRank::new(44_100, 2, SampleFormat::I16, 44_100, 2);
        assert!(f32_rank > i16_rank);
    }
}
