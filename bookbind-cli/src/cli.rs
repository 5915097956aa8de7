use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::error::{AppError, Result};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only errors, no progress bar
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Extra query parameter sent with every request (key=value)
    #[arg(long = "param", global = true, value_name = "KEY=VALUE")]
    pub params: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the audiobook described by a job file (JSON or TOML)
    Run {
        job: PathBuf,

        /// Keep intermediate files after a successful run
        #[arg(long)]
        keep_work: bool,

        #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
        ffmpeg: PathBuf,

        #[arg(long, env = "FFPROBE_PATH", default_value = "ffprobe")]
        ffprobe: PathBuf,
    },

    /// List the renditions of a playlist and the one that would be used
    Resolve {
        url: String,

        /// Lowest acceptable bandwidth in bit/s
        #[arg(long, default_value_t = 0)]
        min_bandwidth: u64,

        /// Lowest acceptable height in pixels
        #[arg(long)]
        min_height: Option<u64>,
    },

    /// Print the chapter table of the items already extracted for a job
    Chapters {
        job: PathBuf,

        /// Print the FFMETADATA1 document instead of a table
        #[arg(long)]
        ffmetadata: bool,
    },
}

/// Splits `key=value` pairs at the first `=`.
pub fn parse_params(params: &[String]) -> Result<Vec<(String, String)>> {
    params
        .iter()
        .map(|param| {
            param
                .split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| AppError::InvalidInput(format!("Invalid param format: {param}")))
        })
        .collect()
}
