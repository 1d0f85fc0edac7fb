//! Text command surface: parses user lines, drives the session, and formats replies.
//!
//! Replies go back to whoever typed the command; [`format_event`] produces the lines that are
//! broadcast to every connected user.

use jukebox_types::{
    PlaybackEndReason, PlaybackInfo, SessionEvent, SessionState, TrackRequest, format_clock,
};
use thiserror::Error;

use crate::error::StateError;
use crate::session::PlaybackSession;

/// A parsed user command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Play { url: String },
    Search { keywords: String },
    Pause,
    Info,
    Stop,
    Help,
}

/// Malformed command line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("usage: play <url>")]
    MissingUrl,
    #[error("usage: search <song or artist>")]
    MissingKeywords,
    #[error("unknown command \"{0}\"; type `help` for the list of commands")]
    Unknown(String),
}

pub fn parse(line: &str) -> Result<Command, UsageError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(Command::Help);
    };
    match verb.to_lowercase().as_str() {
        "play" => words
            .next()
            .map(|url| Command::Play {
                url: url.to_string(),
            })
            .ok_or(UsageError::MissingUrl),
        "search" | "netease" => {
            let keywords = words.collect::<Vec<_>>().join(" ");
            if keywords.is_empty() {
                Err(UsageError::MissingKeywords)
            } else {
                Ok(Command::Search { keywords })
            }
        }
        "pause" => Ok(Command::Pause),
        "info" => Ok(Command::Info),
        "stop" => Ok(Command::Stop),
        "help" => Ok(Command::Help),
        other => Err(UsageError::Unknown(other.to_string())),
    }
}

/// Run `command` against `session` and return the reply lines for the caller.
pub fn dispatch(session: &PlaybackSession, command: Command) -> Vec<String> {
    match command {
        Command::Play { url } => match session.start(TrackRequest::Url(url)) {
            Ok(()) => Vec::new(),
            Err(e) => vec![state_reply(e)],
        },
        Command::Search { keywords } => {
            match session.start(TrackRequest::Keywords(keywords.clone())) {
                Ok(()) => vec![format!("Searching for {keywords}, please wait...")],
                Err(e) => vec![state_reply(e)],
            }
        }
        Command::Pause => match session.toggle_pause() {
            Ok(_) => Vec::new(),
            Err(e) => vec![state_reply(e)],
        },
        Command::Info => match session.info() {
            Ok(info) => format_info(&info),
            Err(e) => vec![state_reply(e)],
        },
        Command::Stop => {
            if session.stop() {
                Vec::new()
            } else {
                vec![state_reply(StateError::NothingPlaying)]
            }
        }
        Command::Help => help_lines(),
    }
}

/// Parse and dispatch one input line.
pub fn handle_line(session: &PlaybackSession, line: &str) -> Vec<String> {
    match parse(line) {
        Ok(command) => dispatch(session, command),
        Err(e) => vec![e.to_string()],
    }
}

fn state_reply(err: StateError) -> String {
    match err {
        StateError::AlreadyActive => {
            "A track is already playing; use `stop` before starting another.".to_string()
        }
        StateError::NothingPlaying => "Nothing is playing.".to_string(),
        StateError::Loading => "The track is still loading, please wait.".to_string(),
    }
}

pub fn format_info(info: &PlaybackInfo) -> Vec<String> {
    let title = info.title.as_deref().unwrap_or("unknown");
    let name = match info.artist.as_deref() {
        Some(artist) if !artist.is_empty() => format!("{title} - {artist}"),
        _ => title.to_string(),
    };
    let heading = match info.state {
        SessionState::Loading => format!("Loading: {name}"),
        SessionState::Paused => format!("Paused: {name}"),
        _ => format!("Now playing: {name}"),
    };
    vec![
        heading,
        format!(
            "Progress: {}/{}",
            format_clock(info.position_ms),
            format_clock(info.duration_ms)
        ),
    ]
}

/// Broadcast text for a session event.
pub fn format_event(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Loading { request } => match request {
            TrackRequest::Url(url) => format!("Loading {url}..."),
            TrackRequest::Keywords(keywords) => format!("Searching for {keywords}..."),
        },
        SessionEvent::Resolved { metadata } => format!("Found: {}", metadata.display_name()),
        SessionEvent::Started {
            metadata,
            duration_ms,
        } => format!(
            "Now playing: {} ({})",
            metadata.display_name(),
            format_clock(*duration_ms)
        ),
        SessionEvent::Paused => "Playback paused.".to_string(),
        SessionEvent::Resumed => "Playback resumed.".to_string(),
        SessionEvent::Ended { reason } => match reason {
            PlaybackEndReason::Eof => "Playback finished.".to_string(),
            PlaybackEndReason::Stopped => "Playback stopped.".to_string(),
            PlaybackEndReason::Error => "Playback stopped after an error.".to_string(),
        },
        SessionEvent::Failed { reason } => format!("Playback failed: {reason}"),
    }
}

pub fn help_lines() -> Vec<String> {
    [
        "===== jukebox commands =====",
        "play <url>          play an audio file from a URL (mp3/flac/wav/ogg/aac)",
        "search <keywords>   search the music index and play the first match",
        "pause               pause or resume the current track",
        "info                show the current track and its progress",
        "stop                stop playback",
        "help                show this list",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
