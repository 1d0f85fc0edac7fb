//! Typed failures for each stage of the loading pipeline.

use thiserror::Error;

/// Failure while downloading a track into a scratch file.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("connection timed out")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("server answered with HTTP {0}")]
    HttpStatus(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("download cancelled")]
    Cancelled,
}

/// Failure while normalizing a track to the canonical format or opening it for playback.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("file read/write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("transcode cancelled")]
    Cancelled,
}

/// Failure while querying the remote track index.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("search request failed with HTTP {0}")]
    HttpStatus(u16),
    #[error("search service error: {0}")]
    Remote(String),
    #[error("search request failed: {0}")]
    Transport(String),
    #[error("unexpected search response: {0}")]
    Malformed(String),
}

/// An operation that is not valid in the session's current state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("a track is already playing")]
    AlreadyActive,
    #[error("nothing is playing")]
    NothingPlaying,
    #[error("the track is still loading")]
    Loading,
}

/// Everything that can abort the Loading phase.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no track found for \"{0}\"")]
    NotFound(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Transcode(#[from] TranscodeError),
    #[error("loading was cancelled")]
    Cancelled,
}
