//! Download stage: stream a remote file into a scratch file.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;

use crate::config::FetchSettings;
use crate::error::FetchError;
use crate::scratch::ScratchSet;

const CHUNK_BYTES: usize = 64 * 1024;
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Retrieves the bytes behind a URL into a local scratch file. No retries.
pub trait Fetcher: Send + Sync {
    /// Download `url` into a new file created through `scratch`.
    ///
    /// The file is registered with `scratch` before any byte is written, so a partial download
    /// is still owned (and later deleted) by the set when this returns an error. Raising
    /// `cancel` makes the download give up with [`FetchError::Cancelled`].
    fn fetch(
        &self,
        url: &str,
        scratch: &ScratchSet,
        cancel: &AtomicBool,
    ) -> Result<PathBuf, FetchError>;
}

/// [`Fetcher`] backed by a blocking `ureq` agent.
///
/// `read_timeout` bounds both the wait for the response headers and every gap between body
/// chunks; `body_timeout` caps the whole transfer.
pub struct HttpFetcher {
    agent: ureq::Agent,
    idle_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(settings: &FetchSettings) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_connect(Some(settings.connect_timeout))
            .timeout_recv_response(Some(settings.read_timeout))
            .timeout_recv_body(Some(settings.body_timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
            idle_timeout: settings.read_timeout,
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        scratch: &ScratchSet,
        cancel: &AtomicBool,
    ) -> Result<PathBuf, FetchError> {
        let extension = infer_ext_from_url(url)
            .map(|ext| format!(".{ext}"))
            .unwrap_or_else(|| ".tmp".to_string());
        let (mut file, path) = scratch
            .create("in", &extension)
            .map_err(|e| FetchError::Transport(format!("create scratch file: {e}")))?;

        tracing::debug!(url = %url, path = ?path, "fetch start");
        let resp = self.agent.get(url).call().map_err(map_ureq_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }
        if cancel.load(Ordering::SeqCst) {
            return Err(FetchError::Cancelled);
        }

        let reader = resp.into_body().into_reader();
        let bytes = copy_body(reader, &mut file, self.idle_timeout, cancel)?;
        file.flush().map_err(map_io_error)?;
        tracing::info!(url = %url, bytes, "fetch complete");
        Ok(path)
    }
}

/// Copy `reader` into `file` chunk by chunk.
///
/// Reads happen on a helper thread so a stalled socket can neither outlast `idle` nor hide a
/// raised `cancel`. An abandoned reader exits on its next read once the receiver is gone.
fn copy_body<R>(
    mut reader: R,
    file: &mut File,
    idle: Duration,
    cancel: &AtomicBool,
) -> Result<u64, FetchError>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded::<io::Result<Vec<u8>>>(4);
    thread::Builder::new()
        .name("jukebox-fetch-read".into())
        .spawn(move || {
            loop {
                let mut buf = vec![0u8; CHUNK_BYTES];
                let chunk = match reader.read(&mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        Ok(buf)
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => Err(e),
                };
                let last = !matches!(&chunk, Ok(b) if !b.is_empty());
                if tx.send(chunk).is_err() || last {
                    return;
                }
            }
        })
        .map_err(|e| FetchError::Transport(format!("spawn body reader: {e}")))?;

    let poll = CANCEL_POLL.min(idle);
    let mut total = 0u64;
    let mut last_progress = Instant::now();
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(FetchError::Cancelled);
        }
        match rx.recv_timeout(poll) {
            Ok(Ok(chunk)) if chunk.is_empty() => return Ok(total),
            Ok(Ok(chunk)) => {
                file.write_all(&chunk).map_err(map_io_error)?;
                total += chunk.len() as u64;
                last_progress = Instant::now();
            }
            Ok(Err(e)) => return Err(map_io_error(e)),
            Err(RecvTimeoutError::Timeout) => {
                if last_progress.elapsed() >= idle {
                    tracing::warn!(bytes = total, idle_ms = idle.as_millis() as u64, "body stalled");
                    return Err(FetchError::Timeout);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(FetchError::Transport("body reader stopped unexpectedly".into()));
            }
        }
    }
}

fn map_ureq_error(err: ureq::Error) -> FetchError {
    match err {
        ureq::Error::Timeout(_) => FetchError::Timeout,
        ureq::Error::StatusCode(code) => FetchError::HttpStatus(code),
        ureq::Error::ConnectionFailed => FetchError::ConnectionRefused,
        ureq::Error::Io(e) => map_io_error(e),
        other => FetchError::Transport(other.to_string()),
    }
}

fn map_io_error(err: io::Error) -> FetchError {
    // Body read failures arrive as io::Error wrapping the agent's own error.
    if let Some(inner) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<ureq::Error>())
    {
        if matches!(inner, ureq::Error::Timeout(_)) {
            return FetchError::Timeout;
        }
    }
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FetchError::Timeout,
        io::ErrorKind::ConnectionRefused => FetchError::ConnectionRefused,
        _ => FetchError::Transport(err.to_string()),
    }
}

/// Infer a file extension from the URL path if present.
pub(crate) fn infer_ext_from_url(url: &str) -> Option<String> {
    let tail = url.split(['?', '#']).next().unwrap_or(url);
    let file = tail.rsplit('/').next().unwrap_or(tail);
    let mut parts = file.rsplit('.');
    let ext = parts.next()?;
    if parts.next().is_some() && !ext.is_empty() {
        Some(ext.to_ascii_lowercase())
    } else {
        None
    }
}
