use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "jukebox", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Directory for scratch files (defaults to the OS temp dir)
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read commands from stdin and print playback events (default)
    Console,

    /// Play one track from a URL, then exit
    Play {
        /// Direct audio URL
        url: String,
    },

    /// Search the music index, play the first match, then exit
    Search {
        /// Song and/or artist
        #[arg(required = true, num_args = 1..)]
        keywords: Vec<String>,
    },
}
