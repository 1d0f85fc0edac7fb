//! Host glue: wires the real pipeline stages into a session and runs the front-ends.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, select};
use jukebox_types::{PlaybackEndReason, SessionEvent, TrackRequest};

use crate::commands;
use crate::config::Settings;
use crate::device;
use crate::fetch::HttpFetcher;
use crate::output::CpalOutput;
use crate::resolver::HttpResolver;
use crate::scratch;
use crate::session::{Components, PlaybackSession};
use crate::transcode::CanonicalTranscoder;

type SharedOut = Arc<Mutex<dyn Write + Send>>;

/// Build a session backed by the HTTP clients, the Symphonia transcoder and the CPAL output.
pub fn build_session(settings: &Settings) -> (PlaybackSession, Receiver<SessionEvent>) {
    let components = Components {
        resolver: Arc::new(HttpResolver::new(&settings.resolver)),
        fetcher: Arc::new(HttpFetcher::new(&settings.fetch)),
        transcoder: Arc::new(CanonicalTranscoder::new(settings.playback.chunk_frames)),
        output: Arc::new(CpalOutput::new(settings.playback.clone())),
    };
    PlaybackSession::new(components, settings.session.clone())
}

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    for (i, name) in device::list_devices(&host)?.iter().enumerate() {
        println!("#{i}: {name}");
    }
    Ok(())
}

/// Remove scratch files left behind by an earlier run.
pub fn sweep_scratch(dir: &Path) {
    match scratch::cleanup_stale(dir) {
        Ok(0) => {}
        Ok(n) => tracing::info!(count = n, "cleaned up stale scratch files"),
        Err(e) => tracing::warn!("scratch cleanup warning: {e}"),
    }
}

/// On Ctrl-C: stop the session (releasing its files and device), sweep, exit 130.
pub fn install_ctrlc(session: PlaybackSession, scratch_dir: PathBuf) {
    let result = ctrlc::set_handler(move || {
        session.stop();
        let _ = scratch::cleanup_stale(&scratch_dir);
        std::process::exit(130);
    });
    if let Err(e) = result {
        tracing::warn!("failed to install Ctrl-C handler: {e}");
    }
}

/// Interactive host: stdin lines are commands, events are broadcast to stdout.
pub fn run_console(session: &PlaybackSession, events: Receiver<SessionEvent>) -> Result<()> {
    let out: SharedOut = Arc::new(Mutex::new(io::stdout()));
    run_console_io(session, events, io::stdin().lock(), out)
}

fn run_console_io(
    session: &PlaybackSession,
    events: Receiver<SessionEvent>,
    input: impl BufRead,
    out: SharedOut,
) -> Result<()> {
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
    let broadcaster = {
        let out = out.clone();
        thread::Builder::new()
            .name("jukebox-broadcast".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(events) -> event => match event {
                            Ok(event) => write_lines(&out, &[commands::format_event(&event)]),
                            Err(_) => return,
                        },
                        recv(done_rx) -> _ => {
                            for event in events.try_iter() {
                                write_lines(&out, &[commands::format_event(&event)]);
                            }
                            return;
                        }
                    }
                }
            })?
    };

    write_lines(&out, &["jukebox ready; type `help` for commands.".to_string()]);
    for line in input.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case("quit") || trimmed.eq_ignore_ascii_case("exit") {
            break;
        }
        let replies = commands::handle_line(session, trimmed);
        write_lines(&out, &replies);
    }

    session.stop();
    drop(done_tx);
    broadcaster
        .join()
        .map_err(|_| anyhow!("broadcast thread panicked"))?;
    Ok(())
}

/// One-shot host: play `request`, print events, return when it ends.
pub fn run_once(
    session: &PlaybackSession,
    events: Receiver<SessionEvent>,
    request: TrackRequest,
) -> Result<()> {
    let out: SharedOut = Arc::new(Mutex::new(io::stdout()));
    run_once_io(session, events, request, &out)
}

fn run_once_io(
    session: &PlaybackSession,
    events: Receiver<SessionEvent>,
    request: TrackRequest,
    out: &SharedOut,
) -> Result<()> {
    session
        .start(request)
        .map_err(|e| anyhow!("cannot start playback: {e}"))?;
    for event in events.iter() {
        write_lines(out, &[commands::format_event(&event)]);
        match event {
            SessionEvent::Ended {
                reason: PlaybackEndReason::Error,
            } => return Err(anyhow!("playback stopped after an error")),
            SessionEvent::Ended { .. } => return Ok(()),
            SessionEvent::Failed { reason } => return Err(anyhow!("playback failed: {reason}")),
            _ => {}
        }
    }
    Ok(())
}

fn write_lines(out: &SharedOut, lines: &[String]) {
    let mut guard = out.lock().unwrap_or_else(|e| e.into_inner());
    for line in lines {
        if writeln!(guard, "{line}").is_err() {
            return;
        }
    }
    let _ = guard.flush();
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, ResponseTemplate};

    use super::*;
    use crate::config::JukeboxConfig;
    use crate::test_http::{MockHttp, refused_url};

    /// `Write` sink the test can read back after the host is done.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn test_settings(dir: &Path, resolver_endpoint: &str) -> Settings {
        let mut settings = JukeboxConfig::default().resolve();
        settings.resolver.endpoint = resolver_endpoint.to_string();
        settings.fetch.connect_timeout = Duration::from_millis(500);
        settings.session.scratch_dir = dir.to_path_buf();
        settings
    }

    fn scratch_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn console_answers_commands_while_idle() {
        let dir = tempfile::tempdir().unwrap();
        let (session, events) = build_session(&test_settings(dir.path(), &refused_url()));
        let captured = Captured::default();
        let out: SharedOut = Arc::new(Mutex::new(captured.clone()));

        run_console_io(
            &session,
            events,
            Cursor::new("help\ninfo\npause\nstop\nplay\nshuffle\nquit\ninfo\n"),
            out,
        )
        .unwrap();

        let text = captured.text();
        assert!(text.contains("===== jukebox commands ====="));
        assert_eq!(text.matches("Nothing is playing.").count(), 3);
        assert!(text.contains("usage: play <url>"));
        assert!(text.contains("unknown command \"shuffle\""));
    }

    #[test]
    fn one_shot_play_reports_fetch_failure_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (session, events) = build_session(&test_settings(dir.path(), &refused_url()));
        let captured = Captured::default();
        let out: SharedOut = Arc::new(Mutex::new(captured.clone()));

        let err = run_once_io(
            &session,
            events,
            TrackRequest::Url(refused_url()),
            &out,
        )
        .unwrap_err();

        assert!(err.to_string().contains("connection refused"), "{err:#}");
        assert!(captured.text().contains("Playback failed: connection refused"));
        assert_eq!(scratch_count(dir.path()), 0);
    }

    #[test]
    fn one_shot_search_reports_remote_miss_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let http = MockHttp::start();
        http.mount(
            Mock::given(method("GET"))
                .and(path("/v2/music/netease"))
                .and(query_param("word", "unknown-song-xyz"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_string(r#"{"code":200,"data":null}"#),
                ),
        );
        let endpoint = format!("{}/v2/music/netease", http.uri());
        let (session, events) = build_session(&test_settings(dir.path(), &endpoint));
        let out: SharedOut = Arc::new(Mutex::new(Captured::default()));

        let err = run_once_io(
            &session,
            events,
            TrackRequest::Keywords("unknown-song-xyz".into()),
            &out,
        )
        .unwrap_err();

        assert!(err.to_string().contains("no track found"), "{err:#}");
        assert_eq!(http.requests().len(), 1);
        assert_eq!(scratch_count(dir.path()), 0);
    }
}
