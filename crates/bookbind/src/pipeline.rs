//! Job-level orchestration.
//!
//! Source items run through resolve, fetch, assemble and extract independently, up to
//! the configured item parallelism. Chapter planning waits for every item and then
//! the muxer writes the final container.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::assemble::StreamAssembler;
use crate::chapters::{ChapterPlanner, ChapterTable};
use crate::encoder::Encoder;
use crate::error::{AssemblyError, Result};
use crate::events::{self, EventSink, PipelineEvent};
use crate::extract::AudioExtractor;
use crate::fetch::{RemoteSource, SegmentFetcher, write_atomic};
use crate::job::{AssemblyJob, EncodingConfig, ItemMedia, ItemState, MediaUnit, SourceItem};
use crate::loader::PlaylistLoader;
use crate::mux::{ContainerMuxer, MuxRequest};
use crate::playlist::PlaylistResolver;

pub const ITEM_CHECKPOINT_FILE: &str = "item.json";

/// Terminal status of one source item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Complete,
    Failed(String),
    /// Never reached a terminal state, usually because the job was cancelled.
    Unprocessed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport {
    pub key: String,
    pub title: String,
    pub status: ItemStatus,
    pub duration: Option<Duration>,
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed {
        output: PathBuf,
        chapters: ChapterTable,
    },
    Failed {
        /// First fatal error, in the order errors occurred.
        error: AssemblyError,
        unprocessed: usize,
    },
}

#[derive(Debug)]
pub struct JobReport {
    /// In declaration order.
    pub items: Vec<ItemReport>,
    pub outcome: JobOutcome,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Completed { .. })
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &ItemReport> {
        self.items
            .iter()
            .filter(|i| matches!(i.status, ItemStatus::Failed(_)))
    }
}

/// Extraction result persisted next to an item's media.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct ItemCheckpoint {
    key: String,
    url: String,
    encoding: String,
    audio: PathBuf,
    duration_nanos: u64,
}

impl ItemCheckpoint {
    fn duration(&self) -> Duration {
        Duration::from_nanos(self.duration_nanos)
    }
}

/// Settings that change the extracted audio; a checkpoint taken under other settings is stale.
fn encoding_signature(config: &EncodingConfig) -> String {
    format!(
        "{}:{}:{}:{}",
        config.codec.codec_name(),
        config.bitrate_kbps,
        config.channels.count(),
        config.sample_rate
    )
}

async fn load_item_checkpoint(
    dir: &Path,
    item: &SourceItem,
    encoding: &EncodingConfig,
) -> Option<ItemCheckpoint> {
    let data = tokio::fs::read(dir.join(ITEM_CHECKPOINT_FILE)).await.ok()?;
    let checkpoint: ItemCheckpoint = match serde_json::from_slice(&data) {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            warn!(item = %item.key, error = %e, "Ignoring unreadable item checkpoint");
            return None;
        }
    };
    if checkpoint.key != item.key
        || checkpoint.url != item.url.as_str()
        || checkpoint.encoding != encoding_signature(encoding)
        || checkpoint.duration_nanos == 0
    {
        debug!(item = %item.key, "Item checkpoint is stale");
        return None;
    }
    if !tokio::fs::try_exists(&checkpoint.audio).await.unwrap_or(false) {
        debug!(item = %item.key, audio = %checkpoint.audio.display(), "Checkpointed audio is gone");
        return None;
    }
    Some(checkpoint)
}

/// Plans chapters from the items already extracted in the job's work directory.
pub async fn plan_from_checkpoints(job: &AssemblyJob) -> Result<ChapterTable> {
    let mut entries = Vec::with_capacity(job.items.len());
    for (pos, item) in job.items.iter().enumerate() {
        let checkpoint = load_item_checkpoint(&job.item_dir(pos), item, &job.encoding)
            .await
            .ok_or_else(|| {
                AssemblyError::chapter_integrity(pos, format!("`{}` has not been extracted", item.key))
            })?;
        entries.push((item.title.as_str(), checkpoint.duration()));
    }
    ChapterPlanner.plan(&entries)
}

/// Per-item stages, shared by every concurrently processed item.
struct ItemStages {
    loader: PlaylistLoader,
    fetcher: SegmentFetcher,
    assembler: StreamAssembler,
    extractor: AudioExtractor,
    encoding: EncodingConfig,
    token: CancellationToken,
    events: EventSink,
}

impl ItemStages {
    #[instrument(skip_all, fields(item = %item.key))]
    async fn process(&self, dir: &Path, item: &mut SourceItem) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(AssemblyError::Cancelled);
        }
        (self.events)(PipelineEvent::ItemStarted {
            item: item.key.clone(),
        });

        if let Some(checkpoint) = load_item_checkpoint(dir, item, &self.encoding).await {
            info!(duration_ms = checkpoint.duration().as_millis() as u64, "Reusing extracted audio");
            self.mark_extracted(item, MediaUnit::new(checkpoint.audio.clone()), checkpoint.duration());
            return Ok(());
        }

        let resolved = self.loader.load(&item.url).await?;
        if let Some(selection) = &resolved.selection {
            (self.events)(PipelineEvent::RenditionSelected {
                item: item.key.clone(),
                bandwidth: selection.rendition.bandwidth,
                height: selection.rendition.height(),
                meets_threshold: selection.meets_threshold,
            });
        }
        let segments = resolved.segments;
        let extension = segments.first().map_or("ts", |s| s.extension()).to_string();
        item.media = ItemMedia::Segments(segments.clone());
        item.state = ItemState::Resolved;

        let report = self
            .fetcher
            .fetch_all(&item.key, &segments, &dir.join("segments"))
            .await?;
        item.state = ItemState::Fetched;

        let assembled = self
            .assembler
            .assemble(&item.key, report.files, &dir.join(format!("assembled.{extension}")))
            .await?;
        (self.events)(PipelineEvent::ItemAssembled {
            item: item.key.clone(),
            path: assembled.path.clone(),
        });
        item.media = ItemMedia::Assembled(assembled.clone());
        item.state = ItemState::Assembled;

        let audio_path = dir.join(format!("audio.{}", self.encoding.codec.extension()));
        let extraction = self.extractor.extract(&item.key, &assembled, &audio_path).await?;

        let checkpoint = ItemCheckpoint {
            key: item.key.clone(),
            url: item.url.to_string(),
            encoding: encoding_signature(&self.encoding),
            audio: extraction.unit.path.clone(),
            duration_nanos: extraction.duration.as_nanos() as u64,
        };
        write_atomic(
            &dir.join(ITEM_CHECKPOINT_FILE),
            &serde_json::to_vec_pretty(&checkpoint)?,
        )
        .await?;

        self.mark_extracted(item, extraction.unit, extraction.duration);
        Ok(())
    }

    fn mark_extracted(&self, item: &mut SourceItem, unit: MediaUnit, duration: Duration) {
        item.media = ItemMedia::Extracted(unit);
        item.duration = Some(duration);
        item.state = ItemState::Extracted;
        (self.events)(PipelineEvent::ItemExtracted {
            item: item.key.clone(),
            duration,
        });
    }
}

/// Runs a whole [`AssemblyJob`] from playlists to the final container.
pub struct AssemblyPipeline {
    source: Arc<dyn RemoteSource>,
    encoder: Arc<dyn Encoder>,
    token: CancellationToken,
    events: EventSink,
    cleanup: bool,
}

impl AssemblyPipeline {
    pub fn new(source: Arc<dyn RemoteSource>, encoder: Arc<dyn Encoder>, token: CancellationToken) -> Self {
        Self {
            source,
            encoder,
            token,
            events: events::discard(),
            cleanup: false,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Removes intermediate files once the container has been written and verified.
    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    fn stages(&self, job: &AssemblyJob) -> ItemStages {
        ItemStages {
            loader: PlaylistLoader::new(
                self.source.clone(),
                PlaylistResolver::new(job.fetch.quality_threshold()),
                job.fetch.retry_policy(),
                self.token.clone(),
            ),
            fetcher: SegmentFetcher::new(self.source.clone(), &job.fetch, self.token.clone())
                .with_events(self.events.clone()),
            assembler: StreamAssembler::new(self.encoder.clone()),
            extractor: AudioExtractor::new(
                self.encoder.clone(),
                job.encoding.clone(),
                self.token.clone(),
            ),
            encoding: job.encoding.clone(),
            token: self.token.clone(),
            events: self.events.clone(),
        }
    }

    /// Processes every item, then plans chapters and muxes the final container.
    ///
    /// Returns `Err` only when the job is rejected before any work starts. Failures
    /// after that are reported through [`JobOutcome::Failed`] together with the
    /// per-item statuses; artifacts already produced stay on disk for a re-run.
    #[instrument(skip_all, fields(output = %job.output.display(), items = job.items.len()))]
    pub async fn run(&self, job: &mut AssemblyJob) -> Result<JobReport> {
        job.metadata.validate()?;
        tokio::fs::create_dir_all(&job.work_dir).await?;

        let stages = self.stages(job);
        let dirs: Vec<PathBuf> = (0..job.items.len()).map(|pos| job.item_dir(pos)).collect();
        let parallelism = job.fetch.item_parallelism.max(1);
        info!(parallelism, "Processing source items");

        let results: Vec<(usize, Result<()>)> = stream::iter(job.items.iter_mut().enumerate())
            .map(|(pos, item)| {
                let stages = &stages;
                let dir = dirs[pos].as_path();
                async move { (pos, stages.process(dir, item).await) }
            })
            .buffer_unordered(parallelism)
            .collect()
            .await;

        // Completion order, so the first error here is the first one that happened.
        let mut first_error = None;
        for (pos, result) in results {
            let Err(e) = result else { continue };
            let item = &mut job.items[pos];
            if !matches!(e, AssemblyError::Cancelled) {
                if e.is_structural() {
                    error!(item = %item.key, error = %e, "Source item is structurally broken");
                } else {
                    error!(item = %item.key, error = %e, "Source item failed, partial results kept for a re-run");
                }
                item.state = ItemState::Failed(e.to_string());
                (self.events)(PipelineEvent::ItemFailed {
                    item: item.key.clone(),
                    reason: e.to_string(),
                });
            }
            if first_error.is_none() {
                first_error = Some(e);
            }
        }

        if let Some(error) = first_error {
            return Ok(self.failed(job, error));
        }

        match self.finish(job).await {
            Ok(chapters) => {
                (self.events)(PipelineEvent::JobCompleted {
                    output: job.output.clone(),
                    chapters: chapters.len(),
                });
                if self.cleanup {
                    self.remove_intermediates(job).await;
                }
                Ok(JobReport {
                    items: item_reports(job),
                    outcome: JobOutcome::Completed {
                        output: job.output.clone(),
                        chapters,
                    },
                })
            }
            Err(e) => {
                error!(error = %e, "Final container could not be written");
                Ok(self.failed(job, e))
            }
        }
    }

    /// Plans chapters in declaration order and muxes the extracted audio.
    async fn finish(&self, job: &AssemblyJob) -> Result<ChapterTable> {
        let mut entries = Vec::with_capacity(job.items.len());
        let mut units = Vec::with_capacity(job.items.len());
        for (pos, item) in job.items.iter().enumerate() {
            match (&item.media, item.duration) {
                (ItemMedia::Extracted(unit), Some(duration)) => {
                    entries.push((item.title.as_str(), duration));
                    units.push(unit.clone());
                }
                _ => {
                    return Err(AssemblyError::chapter_integrity(
                        pos,
                        format!("`{}` has no extracted audio", item.key),
                    ));
                }
            }
        }
        let chapters = ChapterPlanner.plan(&entries)?;
        info!(
            chapters = chapters.len(),
            total_ms = chapters.total_ms(),
            "Chapter table planned"
        );

        let mux_dir = job.mux_dir();
        let muxer = ContainerMuxer::new(self.encoder.clone(), self.token.clone())
            .with_events(self.events.clone());
        let report = muxer
            .mux(MuxRequest {
                units: &units,
                chapters: &chapters,
                metadata: &job.metadata,
                cover_art: job.cover_art.as_deref(),
                encoding: &job.encoding,
                work_dir: &mux_dir,
                output: &job.output,
            })
            .await?;
        info!(
            output = %report.output.path().display(),
            skipped = report.skipped.len(),
            "Audiobook written"
        );
        Ok(chapters)
    }

    fn failed(&self, job: &AssemblyJob, error: AssemblyError) -> JobReport {
        let unprocessed = job.items.iter().filter(|i| !i.state.is_terminal()).count();
        warn!(unprocessed, error = %error, "Job failed");
        JobReport {
            items: item_reports(job),
            outcome: JobOutcome::Failed { error, unprocessed },
        }
    }

    async fn remove_intermediates(&self, job: &AssemblyJob) {
        for dir in [job.work_dir.join("items"), job.mux_dir()] {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %dir.display(), error = %e, "Failed to remove intermediate files");
                }
            }
        }
        // Only removed when nothing else lives there.
        let _ = tokio::fs::remove_dir(&job.work_dir).await;
    }
}

fn item_reports(job: &AssemblyJob) -> Vec<ItemReport> {
    job.items
        .iter()
        .map(|item| ItemReport {
            key: item.key.clone(),
            title: item.title.clone(),
            status: match &item.state {
                ItemState::Extracted => ItemStatus::Complete,
                ItemState::Failed(reason) => ItemStatus::Failed(reason.clone()),
                _ => ItemStatus::Unprocessed,
            },
            duration: item.duration,
        })
        .collect()
}
