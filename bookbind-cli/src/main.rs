mod cli;
mod error;
mod progress;

use bookbind_engine::chapters::ChapterTable;
use bookbind_engine::config::HttpConfig;
use bookbind_engine::fetch::{HttpSource, RetryPolicy};
use bookbind_engine::job::{AssemblyJob, JobConfig};
use bookbind_engine::loader::PlaylistLoader;
use bookbind_engine::pipeline::{AssemblyPipeline, ItemStatus, JobOutcome, JobReport, plan_from_checkpoints};
use bookbind_engine::playlist::{ParsedPlaylist, PlaylistResolver, QualityThreshold};
use bookbind_engine::{AssemblyError, FfmpegEncoder};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use url::Url;

use crate::cli::{Args, Commands, parse_params};
use crate::error::{AppError, Result};
use crate::progress::Progress;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("{e}");
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("bookbind=debug,bookbind_engine=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("bookbind=info,bookbind_engine=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(verbose).with_writer(std::io::stderr))
        .init();
}

async fn run(args: Args) -> Result<()> {
    let http = HttpConfig {
        params: parse_params(&args.params)?,
        ..Default::default()
    };

    match args.command {
        Commands::Run {
            job,
            keep_work,
            ffmpeg,
            ffprobe,
        } => run_job(&job, http, keep_work, ffmpeg, ffprobe, args.quiet).await,
        Commands::Resolve {
            url,
            min_bandwidth,
            min_height,
        } => {
            let threshold = QualityThreshold {
                min_bandwidth,
                min_height,
            };
            resolve(&url, http, threshold).await
        }
        Commands::Chapters { job, ffmetadata } => {
            let job = AssemblyJob::from_config(load_job_config(&job).await?)?;
            let chapters = plan_from_checkpoints(&job).await?;
            print_chapters(&chapters, ffmetadata);
            Ok(())
        }
    }
}

/// Reads a job file; `.toml` files are TOML, anything else JSON.
async fn load_job_config(path: &Path) -> Result<JobConfig> {
    let text = tokio::fs::read_to_string(path).await?;
    let parsed = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("toml") => toml::from_str(&text).map_err(|e| e.to_string()),
        _ => serde_json::from_str(&text).map_err(|e| e.to_string()),
    };
    parsed.map_err(|reason| AppError::JobFile {
        path: path.to_path_buf(),
        reason,
    })
}

async fn run_job(
    path: &Path,
    http: HttpConfig,
    keep_work: bool,
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    quiet: bool,
) -> Result<()> {
    let mut job = AssemblyJob::from_config(load_job_config(path).await?)?;
    info!(
        items = job.items.len(),
        output = %job.output.display(),
        work_dir = %job.work_dir.display(),
        "Starting job"
    );

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            signal_token.cancel();
        }
    });

    let progress = Progress::new(quiet);
    let pipeline = AssemblyPipeline::new(
        Arc::new(HttpSource::new(&http)?),
        Arc::new(FfmpegEncoder::with_paths(ffmpeg, ffprobe)),
        token,
    )
    .with_events(progress.sink())
    .with_cleanup(!keep_work);

    let report = pipeline.run(&mut job).await;
    progress.finish();
    let report = report?;

    print_report(&report);
    match report.outcome {
        JobOutcome::Completed { output, chapters } => {
            println!(
                "Wrote {} ({} chapters, {})",
                output.display(),
                chapters.len(),
                format_timestamp(chapters.total_ms())
            );
            Ok(())
        }
        JobOutcome::Failed { error, unprocessed } => {
            if !matches!(error, AssemblyError::Cancelled) {
                println!("Partial results kept in {}", job.work_dir.display());
            }
            Err(AppError::JobFailed {
                error: error.to_string(),
                unprocessed,
            })
        }
    }
}

async fn resolve(url: &str, http: HttpConfig, threshold: QualityThreshold) -> Result<()> {
    let url = Url::parse(url).map_err(|e| AppError::InvalidInput(format!("{url}: {e}")))?;
    let resolver = PlaylistResolver::new(threshold);
    let loader = PlaylistLoader::new(
        Arc::new(HttpSource::new(&http)?),
        resolver.clone(),
        RetryPolicy::default(),
        CancellationToken::new(),
    );

    match loader.fetch_playlist(&url).await? {
        ParsedPlaylist::Master { renditions } => {
            let selection = resolver.select(&renditions)?;
            for rendition in &renditions {
                let marker = if rendition.uri == selection.rendition.uri { "*" } else { " " };
                let resolution = rendition
                    .resolution
                    .map(|r| format!("{}x{}", r.width, r.height))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{marker} {:>10} bit/s  {:>10}  {}",
                    rendition.bandwidth, resolution, rendition.uri
                );
            }
            if !selection.meets_threshold {
                println!("No rendition meets the threshold; the highest one is used.");
            }
        }
        ParsedPlaylist::Media { segments, ended } => {
            let hinted: Duration = segments.iter().map(|s| s.duration_hint).sum();
            println!(
                "Media playlist: {} segments, about {}{}",
                segments.len(),
                format_timestamp(hinted.as_millis() as u64),
                if ended { "" } else { " (no end marker)" }
            );
        }
    }
    Ok(())
}

fn print_report(report: &JobReport) {
    for item in &report.items {
        let status = match &item.status {
            ItemStatus::Complete => "ok".to_string(),
            ItemStatus::Failed(reason) => format!("failed: {reason}"),
            ItemStatus::Unprocessed => "not processed".to_string(),
        };
        let duration = item
            .duration
            .map(|d| format_timestamp(d.as_millis() as u64))
            .unwrap_or_default();
        println!("{:<40} {:>12}  {status}", item.title, duration);
    }
}

fn print_chapters(chapters: &ChapterTable, ffmetadata: bool) {
    if ffmetadata {
        print!("{}", chapters.to_ffmetadata());
        return;
    }
    for chapter in chapters.chapters() {
        println!(
            "{} - {}  {}",
            format_timestamp(chapter.start_ms),
            format_timestamp(chapter.end_ms),
            chapter.title
        );
    }
}

/// `H:MM:SS.mmm`
fn format_timestamp(ms: u64) -> String {
    let (secs, millis) = (ms / 1000, ms % 1000);
    format!(
        "{}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        millis
    )
}
