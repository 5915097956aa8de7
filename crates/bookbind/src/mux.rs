//! Final container assembly.
//!
//! Steps run in a fixed order, each writing a new file in the mux directory:
//!
//! 1. `01-concat`: all audio units joined
//! 2. `02-tagged`: metadata and media type
//! 3. `03-chaptered`: chapter table, with the step 2 tags kept
//! 4. `04-final`: cover art, then published to the output path
//!
//! A failed step leaves the earlier files intact. `mux.json` records finished steps
//! under a fingerprint of the inputs, so a re-run with the same inputs resumes after
//! the last finished step.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::chapters::ChapterTable;
use crate::encoder::{ConcatMode, Encoder, EncodingError, MediaProbe};
use crate::error::{AssemblyError, Result};
use crate::events::{self, EventSink, PipelineEvent};
use crate::fetch::write_atomic;
use crate::job::{AudiobookMetadata, EncodingConfig, MediaUnit};

pub const CHECKPOINT_FILE: &str = "mux.json";
pub const CHAPTERS_FILE: &str = "chapters.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuxStep {
    Concat,
    Tagged,
    Chaptered,
    Final,
}

impl MuxStep {
    pub fn name(self) -> &'static str {
        match self {
            Self::Concat => "concat",
            Self::Tagged => "tagged",
            Self::Chaptered => "chaptered",
            Self::Final => "final",
        }
    }

    fn file_name(self, extension: &str) -> String {
        let prefix = match self {
            Self::Concat => "01",
            Self::Tagged => "02",
            Self::Chaptered => "03",
            Self::Final => "04",
        };
        format!("{prefix}-{}.{extension}", self.name())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MuxCheckpoint {
    fingerprint: String,
    completed: Vec<MuxStep>,
}

/// Everything the muxer needs for one book.
#[derive(Debug, Clone, Copy)]
pub struct MuxRequest<'a> {
    /// Extracted audio in chapter order.
    pub units: &'a [MediaUnit],
    pub chapters: &'a ChapterTable,
    pub metadata: &'a AudiobookMetadata,
    pub cover_art: Option<&'a Path>,
    pub encoding: &'a EncodingConfig,
    /// Directory for intermediate files and the checkpoint.
    pub work_dir: &'a Path,
    pub output: &'a Path,
}

impl MuxRequest<'_> {
    /// Intermediate files share the output's extension so the muxer is inferred the same way.
    fn step_path(&self, step: MuxStep) -> PathBuf {
        let extension = self
            .output
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(self.encoding.codec.container_extension());
        self.work_dir.join(step.file_name(extension))
    }

    /// Digest of everything that influences the output.
    async fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for unit in self.units {
            hash_file_identity(&mut hasher, unit.path()).await;
        }
        hasher.update(self.chapters.to_ffmetadata().as_bytes());
        for (key, value) in self.metadata.tags() {
            hasher.update(key.as_bytes());
            hasher.update([0]);
            hasher.update(value.as_bytes());
            hasher.update([0]);
        }
        hasher.update([self.metadata.media_kind.stik()]);
        if let Some(cover) = self.cover_art {
            hash_file_identity(&mut hasher, cover).await;
        }
        hasher.update(self.encoding.codec.codec_name().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Path, length and modification time; a file replaced in place changes the digest.
async fn hash_file_identity(hasher: &mut Sha256, path: &Path) {
    hasher.update(path.to_string_lossy().as_bytes());
    let (len, modified) = match tokio::fs::metadata(path).await {
        Ok(meta) => {
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_nanos());
            (meta.len(), modified)
        }
        Err(_) => (0, 0),
    };
    hasher.update(len.to_le_bytes());
    hasher.update(modified.to_le_bytes());
}

#[derive(Debug, Clone)]
pub struct MuxReport {
    pub output: MediaUnit,
    pub probe: MediaProbe,
    /// Steps skipped because a valid checkpoint covered them.
    pub skipped: Vec<MuxStep>,
}

pub struct ContainerMuxer {
    encoder: Arc<dyn Encoder>,
    token: CancellationToken,
    events: EventSink,
}

impl ContainerMuxer {
    pub fn new(encoder: Arc<dyn Encoder>, token: CancellationToken) -> Self {
        Self {
            encoder,
            token,
            events: events::discard(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    #[instrument(skip_all, fields(output = %request.output.display(), units = request.units.len()))]
    pub async fn mux(&self, request: MuxRequest<'_>) -> Result<MuxReport> {
        request.metadata.validate()?;
        if request.units.len() != request.chapters.len() {
            return Err(AssemblyError::chapter_integrity(
                request.chapters.len(),
                format!(
                    "{} chapters for {} audio units",
                    request.chapters.len(),
                    request.units.len()
                ),
            ));
        }

        tokio::fs::create_dir_all(request.work_dir).await?;
        let checkpoint_path = request.work_dir.join(CHECKPOINT_FILE);
        let fingerprint = request.fingerprint().await;
        let mut checkpoint = load_checkpoint(&checkpoint_path, &fingerprint).await;
        let mut skipped = Vec::new();

        let concat = request.step_path(MuxStep::Concat);
        let tagged = request.step_path(MuxStep::Tagged);
        let chaptered = request.step_path(MuxStep::Chaptered);
        let staged = request.step_path(MuxStep::Final);

        for step in [MuxStep::Concat, MuxStep::Tagged, MuxStep::Chaptered, MuxStep::Final] {
            if self.token.is_cancelled() {
                info!(step = step.name(), "Cancelled before mux step");
                return Err(AssemblyError::Cancelled);
            }

            let target = request.step_path(step);
            let done = checkpoint.completed.contains(&step)
                && tokio::fs::try_exists(&target).await.unwrap_or(false)
                && (step != MuxStep::Final || tokio::fs::try_exists(request.output).await.unwrap_or(false));
            if done {
                debug!(step = step.name(), "Checkpoint valid, skipping");
                skipped.push(step);
                (self.events)(PipelineEvent::MuxStep {
                    step: step.name(),
                    skipped: true,
                });
                continue;
            }
            // Later steps depend on this one's output.
            checkpoint.completed.retain(|s| *s < step);

            match step {
                MuxStep::Concat => self.concatenate(&request, &concat).await?,
                MuxStep::Tagged => self.tag(&request, &concat, &tagged).await?,
                MuxStep::Chaptered => self.chapter(&request, &tagged, &chaptered).await?,
                MuxStep::Final => self.finalize(&request, &chaptered, &staged).await?,
            }

            checkpoint.completed.push(step);
            write_atomic(&checkpoint_path, &serde_json::to_vec_pretty(&checkpoint)?).await?;
            (self.events)(PipelineEvent::MuxStep {
                step: step.name(),
                skipped: false,
            });
        }

        let probe = self.verify(&request, request.output).await?;
        info!(chapters = probe.chapter_count, duration_ms = probe.duration.as_millis() as u64, "Container written");
        Ok(MuxReport {
            output: MediaUnit::new(request.output),
            probe,
            skipped,
        })
    }

    async fn concatenate(&self, request: &MuxRequest<'_>, output: &Path) -> Result<()> {
        let inputs: Vec<PathBuf> = request.units.iter().map(|u| u.path().to_path_buf()).collect();
        let copied = match self.encoder.concatenate(&inputs, output, ConcatMode::Copy).await {
            Ok(unit) => match self.encoder.probe(unit.path()).await {
                Ok(probe) if probe.has_audio => Ok(()),
                Ok(_) => Err(EncodingError::invalid_output("joined audio has no audio stream")),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = copied {
            warn!(error = %e, "Stream-copy concatenation failed, re-encoding");
            self.encoder
                .concatenate(&inputs, output, ConcatMode::Reencode)
                .await
                .map_err(|e| AssemblyError::encoding("concatenate", e))?;
        }
        Ok(())
    }

    async fn tag(&self, request: &MuxRequest<'_>, input: &Path, output: &Path) -> Result<()> {
        self.encoder
            .apply_metadata(input, output, request.metadata)
            .await
            .map_err(|e| AssemblyError::encoding("metadata", e))?;
        self.encoder
            .set_media_kind(output, request.metadata.media_kind)
            .await
            .map_err(|e| AssemblyError::encoding("media kind", e))
    }

    async fn chapter(&self, request: &MuxRequest<'_>, input: &Path, output: &Path) -> Result<()> {
        let chapters_file = request.work_dir.join(CHAPTERS_FILE);
        write_atomic(&chapters_file, request.chapters.to_ffmetadata().as_bytes()).await?;
        self.encoder
            .apply_chapters(input, &chapters_file, output)
            .await
            .map_err(|e| AssemblyError::encoding("chapters", e))?;
        Ok(())
    }

    async fn finalize(&self, request: &MuxRequest<'_>, input: &Path, staged: &Path) -> Result<()> {
        tokio::fs::copy(input, staged).await?;
        if let Some(cover) = request.cover_art {
            self.encoder
                .embed_cover_art(staged, cover)
                .await
                .map_err(|e| AssemblyError::encoding("cover art", e))?;
        }
        self.verify(request, staged).await?;

        if let Some(parent) = request.output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut part = request.output.as_os_str().to_owned();
        part.push(".part");
        let part = PathBuf::from(part);
        tokio::fs::copy(staged, &part).await?;
        tokio::fs::rename(&part, request.output).await?;
        Ok(())
    }

    /// Checks chapter count, required tags, media type and total duration.
    async fn verify(&self, request: &MuxRequest<'_>, path: &Path) -> Result<MediaProbe> {
        let probe = self
            .encoder
            .probe(path)
            .await
            .map_err(|e| AssemblyError::encoding("verify", e))?;

        if probe.chapter_count != request.chapters.len() {
            return Err(AssemblyError::chapter_integrity(
                probe.chapter_count.min(request.chapters.len()),
                format!(
                    "container has {} chapters, expected {}",
                    probe.chapter_count,
                    request.chapters.len()
                ),
            ));
        }

        let media_type = request.metadata.media_kind.stik().to_string();
        let expected_tags = [
            ("title", request.metadata.title.as_deref()),
            ("artist", request.metadata.author.as_deref()),
            ("media_type", Some(media_type.as_str())),
        ];
        for (key, expected) in expected_tags {
            let Some(expected) = expected else { continue };
            if probe.tag(key) != Some(expected) {
                return Err(AssemblyError::encoding(
                    "verify",
                    EncodingError::invalid_output(format!(
                        "tag `{key}` is {:?}, expected {expected:?}",
                        probe.tag(key)
                    )),
                ));
            }
        }

        let tolerance = duration_tolerance(request.encoding, request.chapters.len());
        let expected = request.chapters.total_duration();
        if probe.duration.abs_diff(expected) > tolerance {
            return Err(AssemblyError::chapter_integrity(
                request.chapters.len().saturating_sub(1),
                format!(
                    "chapters cover {} ms but the container lasts {} ms",
                    expected.as_millis(),
                    probe.duration.as_millis()
                ),
            ));
        }
        Ok(probe)
    }
}

/// One encoder frame, plus the half millisecond each chapter may lose to rounding.
fn duration_tolerance(encoding: &EncodingConfig, chapters: usize) -> Duration {
    encoding.frame_duration() + Duration::from_micros(500) * chapters as u32
}

async fn load_checkpoint(path: &Path, fingerprint: &str) -> MuxCheckpoint {
    let loaded = match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice::<MuxCheckpoint>(&raw).ok(),
        Err(_) => None,
    };
    match loaded {
        Some(checkpoint) if checkpoint.fingerprint == fingerprint => checkpoint,
        Some(_) => {
            info!("Mux inputs changed since the last run, starting over");
            MuxCheckpoint {
                fingerprint: fingerprint.to_string(),
                completed: Vec::new(),
            }
        }
        None => MuxCheckpoint {
            fingerprint: fingerprint.to_string(),
            completed: Vec::new(),
        },
    }
}
