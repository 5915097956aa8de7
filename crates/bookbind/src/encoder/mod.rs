//! Interface to the external encoder/muxer.
//!
//! The pipeline never touches codec data itself. Every media transformation goes
//! through [`Encoder`], and its results are checked with [`Encoder::probe`].

mod command;
mod ffmpeg;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::job::{AudiobookMetadata, EncodingConfig, MediaKind, MediaUnit};

pub use ffmpeg::FfmpegEncoder;

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {}: {stderr}", code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}")))]
    Failed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("invalid output: {reason}")]
    InvalidOutput { reason: String },

    #[error("probe failed: {reason}")]
    Probe { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl EncodingError {
    pub fn invalid_output(reason: impl Into<String>) -> Self {
        Self::InvalidOutput {
            reason: reason.into(),
        }
    }

    pub fn probe(reason: impl Into<String>) -> Self {
        Self::Probe {
            reason: reason.into(),
        }
    }
}

/// What a probe reports about a media file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaProbe {
    pub duration: Duration,
    pub has_video: bool,
    pub has_audio: bool,
    pub audio_codec: Option<String>,
    pub channels: Option<u32>,
    pub sample_rate: Option<u32>,
    pub chapter_count: usize,
    /// Container tags with lowercased keys.
    pub tags: BTreeMap<String, String>,
}

impl MediaProbe {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(&key.to_ascii_lowercase()).map(String::as_str)
    }
}

/// How media units are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcatMode {
    /// Stream copy; no re-encoding.
    Copy,
    /// Full re-encode, for inputs whose encodings do not line up.
    Reencode,
}

/// External encoder/muxer operations.
///
/// Methods that take an `output` path write a new file; the others update the
/// container in place. Implementations must leave their inputs untouched.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaProbe, EncodingError>;

    async fn concatenate(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        mode: ConcatMode,
    ) -> Result<MediaUnit, EncodingError>;

    /// Returns the audio-only unit and its measured duration.
    async fn extract_audio(
        &self,
        input: &Path,
        output: &Path,
        config: &EncodingConfig,
    ) -> Result<(MediaUnit, Duration), EncodingError>;

    /// Writes the metadata tags, keeping every stream and any chapters as they are.
    async fn apply_metadata(
        &self,
        container: &Path,
        output: &Path,
        metadata: &AudiobookMetadata,
    ) -> Result<MediaUnit, EncodingError>;

    /// Sets the container's media type marker in place.
    async fn set_media_kind(&self, container: &Path, kind: MediaKind) -> Result<(), EncodingError>;

    /// Writes the chapter table from an `FFMETADATA1` file, keeping existing tags.
    async fn apply_chapters(
        &self,
        container: &Path,
        chapters: &Path,
        output: &Path,
    ) -> Result<MediaUnit, EncodingError>;

    /// Attaches cover art in place.
    async fn embed_cover_art(&self, container: &Path, image: &Path) -> Result<(), EncodingError>;
}
