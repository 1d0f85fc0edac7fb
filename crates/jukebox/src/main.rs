//! Jukebox: fetch a track by URL or keyword search, normalize it to 44.1 kHz / 16-bit stereo,
//! and play it on a local output device while broadcasting progress.
//!
//! ## Modes
//! - `console` (default): read `play`/`search`/`pause`/`info`/`stop`/`help` lines from stdin.
//! - `play <url>` / `search <keywords>`: play one track and exit when it ends.

use anyhow::Result;
use clap::Parser;
use jukebox::config::JukeboxConfig;
use jukebox::{cli, runtime};
use jukebox_types::TrackRequest;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,jukebox=info")),
        )
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let config = match &args.config {
        Some(path) => JukeboxConfig::load(path)?,
        None => JukeboxConfig::default(),
    };
    let mut settings = config.resolve();
    if let Some(device) = args.device.clone() {
        settings.playback.device = Some(device);
    }
    if let Some(dir) = args.temp_dir.clone() {
        settings.session.scratch_dir = dir;
    }
    tracing::info!(
        scratch_dir = %settings.session.scratch_dir.display(),
        device = settings.playback.device.as_deref().unwrap_or("default"),
        "jukebox starting"
    );

    runtime::sweep_scratch(&settings.session.scratch_dir);
    let (session, events) = runtime::build_session(&settings);
    runtime::install_ctrlc(session.clone(), settings.session.scratch_dir.clone());

    match args.cmd {
        None | Some(cli::Command::Console) => runtime::run_console(&session, events),
        Some(cli::Command::Play { url }) => {
            runtime::run_once(&session, events, TrackRequest::Url(url))
        }
        Some(cli::Command::Search { keywords }) => runtime::run_once(
            &session,
            events,
            TrackRequest::Keywords(keywords.join(" ")),
        ),
    }
}
