use serde::{Deserialize, Serialize};

/// What a `play` invocation asks for.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrackRequest {
    /// Play a direct audio URL.
    Url(String),
    /// Search the remote index and play the first match.
    Keywords(String),
}

impl TrackRequest {
    /// Short label used in logs and "loading" notices.
    pub fn label(&self) -> &str {
        match self {
            TrackRequest::Url(url) => url,
            TrackRequest::Keywords(keywords) => keywords,
        }
    }
}

/// Descriptive data for the active track.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackMetadata {
    /// Song title, if known.
    pub title: Option<String>,
    /// Artist name, if known. Manual URL plays leave this empty.
    pub artist: Option<String>,
    /// Direct audio URL the bytes are fetched from.
    pub source_url: String,
}

impl TrackMetadata {
    /// Metadata for a manual URL play: the title is the last path segment, the artist is empty.
    pub fn from_url(url: &str) -> Self {
        let file_name = url.rsplit('/').next().unwrap_or(url);
        Self {
            title: Some(file_name.to_string()),
            artist: Some(String::new()),
            source_url: url.to_string(),
        }
    }

    /// `"title - artist"`, or just the title when there is no artist.
    pub fn display_name(&self) -> String {
        let title = self.title.as_deref().unwrap_or(&self.source_url);
        match self.artist.as_deref() {
            Some(artist) if !artist.is_empty() => format!("{title} - {artist}"),
            _ => title.to_string(),
        }
    }
}

/// Lifecycle state of the playback session.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    Stopping,
}

impl SessionState {
    /// `true` while a track occupies the session (Loading, Playing or Paused).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Loading | SessionState::Playing | SessionState::Paused
        )
    }
}

/// Reason why playback returned to idle.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of the track.
    Eof,
    /// Loading or playback failed.
    Error,
    /// Playback was explicitly stopped by a command.
    Stopped,
}

/// Point-in-time view of the session returned by `info`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaybackInfo {
    pub state: SessionState,
    pub title: Option<String>,
    pub artist: Option<String>,
    /// Elapsed playback time in milliseconds.
    pub position_ms: u64,
    /// Total track duration in milliseconds (0 until playback starts).
    pub duration_ms: u64,
}

/// Notifications published by the session for broadcast to connected users.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A request was accepted and the track is being prepared.
    Loading { request: TrackRequest },
    /// A keyword search resolved to a concrete track.
    Resolved { metadata: TrackMetadata },
    /// Playback began.
    Started {
        metadata: TrackMetadata,
        duration_ms: u64,
    },
    Paused,
    Resumed,
    /// Playback ended and the session is idle again.
    Ended { reason: PlaybackEndReason },
    /// Loading failed; the session is idle again.
    Failed { reason: String },
}

/// Format milliseconds as `minutes:seconds`; minutes are not wrapped at 60.
pub fn format_clock(ms: u64) -> String {
    let total_secs = ms / 1000;
    format!("{}:{:02}", total_secs / 60, total_secs % 60)
}
