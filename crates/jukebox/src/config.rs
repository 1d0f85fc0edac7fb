//! Configuration loading and parsing.
//!
//! Every field in the TOML file is optional; [`JukeboxConfig::resolve`] fills in defaults and
//! produces the typed settings the rest of the crate consumes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_RESOLVER_ENDPOINT: &str = "https://api.vkeys.cn/v2/music/netease";
const DEFAULT_RESOLVER_QUALITY: u32 = 2;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_BODY_TIMEOUT_MS: u64 = 1_800_000;
const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
const DEFAULT_END_EPSILON_MS: u64 = 250;

/// Top-level configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct JukeboxConfig {
    pub resolver: Option<ResolverSection>,
    pub fetch: Option<FetchSection>,
    pub playback: Option<PlaybackSection>,
    pub session: Option<SessionSection>,
}

/// `[resolver]` table.
#[derive(Debug, Default, Deserialize)]
pub struct ResolverSection {
    /// Search endpoint (defaults to the public NetEase mirror).
    pub endpoint: Option<String>,
    /// Quality selector passed through to the endpoint.
    pub quality: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
}

/// `[fetch]` table.
#[derive(Debug, Default, Deserialize)]
pub struct FetchSection {
    pub connect_timeout_ms: Option<u64>,
    /// Longest wait for the response headers, and for each body chunk after that.
    pub read_timeout_ms: Option<u64>,
    /// Upper bound on the whole download, however steadily bytes arrive.
    pub body_timeout_ms: Option<u64>,
}

/// `[playback]` table.
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackSection {
    /// Output device substring match; default device when absent.
    pub device: Option<String>,
    pub buffer_seconds: Option<f32>,
    pub chunk_frames: Option<usize>,
    pub refill_max_frames: Option<usize>,
}

/// `[session]` table.
#[derive(Debug, Default, Deserialize)]
pub struct SessionSection {
    /// Where scratch files are written (OS temp dir when absent).
    pub scratch_dir: Option<String>,
    pub tick_interval_ms: Option<u64>,
    pub end_epsilon_ms: Option<u64>,
}

/// Resolved search client settings.
#[derive(Clone, Debug)]
pub struct ResolverSettings {
    pub endpoint: String,
    pub quality: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// Resolved download settings.
#[derive(Clone, Debug)]
pub struct FetchSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub body_timeout: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            body_timeout: Duration::from_millis(DEFAULT_BODY_TIMEOUT_MS),
        }
    }
}

/// Playback tuning parameters shared by decode/resample/playback stages.
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Output device substring match.
    pub device: Option<String>,
    /// Decoder/resampler chunk size in frames.
    pub chunk_frames: usize,
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
    /// Target buffer duration for queue sizing.
    pub buffer_seconds: f32,
}

impl Default for PlaybackConfig {
    /// Defaults tuned for low-risk playback across common devices.
    fn default() -> Self {
        Self {
            device: None,
            chunk_frames: 1024,
            refill_max_frames: 4096,
            buffer_seconds: 2.0,
        }
    }
}

/// Resolved session timing and scratch location.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub scratch_dir: PathBuf,
    /// Period of the progress tick.
    pub tick_interval: Duration,
    /// Slack subtracted from the duration when deciding a track has finished.
    pub end_epsilon_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir(),
            tick_interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
            end_epsilon_ms: DEFAULT_END_EPSILON_MS,
        }
    }
}

/// All settings after defaults have been applied.
#[derive(Clone, Debug)]
pub struct Settings {
    pub resolver: ResolverSettings,
    pub fetch: FetchSettings,
    pub playback: PlaybackConfig,
    pub session: SessionSettings,
}

impl JukeboxConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<JukeboxConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }

    /// Apply defaults to every missing field.
    pub fn resolve(&self) -> Settings {
        let resolver = self.resolver.as_ref();
        let fetch = self.fetch.as_ref();
        let playback = self.playback.as_ref();
        let session = self.session.as_ref();
        let playback_defaults = PlaybackConfig::default();

        Settings {
            resolver: ResolverSettings {
                endpoint: resolver
                    .and_then(|r| non_empty(r.endpoint.as_deref()))
                    .unwrap_or(DEFAULT_RESOLVER_ENDPOINT)
                    .trim_end_matches('/')
                    .to_string(),
                quality: resolver
                    .and_then(|r| r.quality)
                    .unwrap_or(DEFAULT_RESOLVER_QUALITY),
                connect_timeout: millis(
                    resolver.and_then(|r| r.connect_timeout_ms),
                    DEFAULT_CONNECT_TIMEOUT_MS,
                ),
                read_timeout: millis(
                    resolver.and_then(|r| r.read_timeout_ms),
                    DEFAULT_READ_TIMEOUT_MS,
                ),
            },
            fetch: FetchSettings {
                connect_timeout: millis(
                    fetch.and_then(|f| f.connect_timeout_ms),
                    DEFAULT_CONNECT_TIMEOUT_MS,
                ),
                read_timeout: millis(
                    fetch.and_then(|f| f.read_timeout_ms),
                    DEFAULT_READ_TIMEOUT_MS,
                ),
                body_timeout: millis(
                    fetch.and_then(|f| f.body_timeout_ms),
                    DEFAULT_BODY_TIMEOUT_MS,
                ),
            },
            playback: PlaybackConfig {
                device: playback
                    .and_then(|p| non_empty(p.device.as_deref()))
                    .map(str::to_string),
                chunk_frames: playback
                    .and_then(|p| p.chunk_frames)
                    .unwrap_or(playback_defaults.chunk_frames),
                refill_max_frames: playback
                    .and_then(|p| p.refill_max_frames)
                    .unwrap_or(playback_defaults.refill_max_frames),
                buffer_seconds: playback
                    .and_then(|p| p.buffer_seconds)
                    .unwrap_or(playback_defaults.buffer_seconds),
            },
            session: SessionSettings {
                scratch_dir: session
                    .and_then(|s| non_empty(s.scratch_dir.as_deref()))
                    .map(PathBuf::from)
                    .unwrap_or_else(std::env::temp_dir),
                tick_interval: millis(
                    session.and_then(|s| s.tick_interval_ms),
                    DEFAULT_TICK_INTERVAL_MS,
                ),
                end_epsilon_ms: session
                    .and_then(|s| s.end_epsilon_ms)
                    .unwrap_or(DEFAULT_END_EPSILON_MS),
            },
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn millis(value: Option<u64>, default_ms: u64) -> Duration {
    Duration::from_millis(value.filter(|ms| *ms > 0).unwrap_or(default_ms))
}
