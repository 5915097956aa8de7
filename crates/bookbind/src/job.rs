//! The assembly job aggregate and the configuration it is built from.
//!
//! A job is constructed once per run from a [`JobConfig`]. Its source items keep the
//! order they were declared in; the pipeline only updates per-item state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::config::FetchConfig;
use crate::error::{AssemblyError, Result};
use crate::playlist::Segment;
use crate::title::derive_title;

/// Container-level media type marker (the MP4 `stik` atom).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Audiobook,
    Music,
    Movie,
}

impl MediaKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Audiobook => "audiobook",
            Self::Music => "music",
            Self::Movie => "movie",
        }
    }

    /// Value written to the `stik` atom.
    pub fn stik(self) -> u8 {
        match self {
            Self::Music => 1,
            Self::Audiobook => 2,
            Self::Movie => 9,
        }
    }
}

/// Audio codec of the extracted tracks and the final container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    #[default]
    Aac,
    Mp3,
    Opus,
    Flac,
}

impl AudioCodec {
    /// Encoder name passed to `-c:a`.
    pub fn encoder_name(self) -> &'static str {
        match self {
            Self::Aac => "aac",
            Self::Mp3 => "libmp3lame",
            Self::Opus => "libopus",
            Self::Flac => "flac",
        }
    }

    /// Codec name as reported by a probe of an encoded stream.
    pub fn codec_name(self) -> &'static str {
        match self {
            Self::Aac => "aac",
            Self::Mp3 => "mp3",
            Self::Opus => "opus",
            Self::Flac => "flac",
        }
    }

    /// File extension for a standalone track in this codec.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Aac => "m4a",
            Self::Mp3 => "mp3",
            Self::Opus => "opus",
            Self::Flac => "flac",
        }
    }

    /// Extension of the final container; AAC books go into an `.m4b`.
    pub fn container_extension(self) -> &'static str {
        match self {
            Self::Aac => "m4b",
            other => other.extension(),
        }
    }

    /// Samples per encoded frame, used for duration tolerances.
    pub fn frame_samples(self) -> u32 {
        match self {
            Self::Aac => 1024,
            Self::Mp3 => 1152,
            Self::Opus => 960,
            Self::Flac => 4608,
        }
    }

    pub fn is_lossless(self) -> bool {
        matches!(self, Self::Flac)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channels {
    #[default]
    Mono,
    Stereo,
}

impl Channels {
    pub fn count(self) -> u8 {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
        }
    }
}

/// Codec settings applied by the audio extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingConfig {
    pub codec: AudioCodec,
    /// Target bitrate in kbit/s; ignored for lossless codecs.
    pub bitrate_kbps: u32,
    pub channels: Channels,
    pub sample_rate: u32,
}

impl EncodingConfig {
    pub fn bitrate_arg(&self) -> String {
        format!("{}k", self.bitrate_kbps)
    }

    /// Duration of one encoded frame, the tolerance for duration comparisons.
    pub fn frame_duration(&self) -> Duration {
        let rate = self.sample_rate.max(1) as u64;
        let nanos = (self.codec.frame_samples() as u64 * 1_000_000_000).div_ceil(rate);
        Duration::from_nanos(nanos)
    }
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            codec: AudioCodec::Aac,
            bitrate_kbps: default_bitrate(),
            channels: Channels::Mono,
            sample_rate: default_sample_rate(),
        }
    }
}

/// Tags written onto the final container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudiobookMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub album_artist: Option<String>,
    pub year: Option<String>,
    pub genre: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub media_kind: MediaKind,
}

impl AudiobookMetadata {
    /// Checks the fields required before anything is written.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.title.as_deref().is_none_or(|t| t.trim().is_empty()) {
            missing.push("title");
        }
        if self.author.as_deref().is_none_or(|a| a.trim().is_empty()) {
            missing.push("author");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AssemblyError::MetadataValidation { missing })
        }
    }

    /// Container tag pairs in write order. The album artist falls back to the author.
    pub fn tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = Vec::new();
        if let Some(title) = &self.title {
            tags.push(("title", title.clone()));
            tags.push(("album", title.clone()));
        }
        if let Some(author) = &self.author {
            tags.push(("artist", author.clone()));
        }
        if let Some(album_artist) = self.album_artist.as_ref().or(self.author.as_ref()) {
            tags.push(("album_artist", album_artist.clone()));
        }
        if let Some(year) = &self.year {
            tags.push(("date", year.clone()));
        }
        if let Some(genre) = &self.genre {
            tags.push(("genre", genre.clone()));
        }
        if let Some(description) = &self.description {
            tags.push(("description", description.clone()));
            tags.push(("comment", description.clone()));
        }
        if let Some(language) = &self.language {
            tags.push(("language", language.clone()));
        }
        tags
    }
}

/// A media file produced by one of the pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaUnit {
    pub path: PathBuf,
}

impl MediaUnit {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// What a source item currently holds.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemMedia {
    Unresolved,
    Segments(Vec<Segment>),
    Assembled(MediaUnit),
    Extracted(MediaUnit),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Resolved,
    Fetched,
    Assembled,
    Extracted,
    Failed(String),
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Extracted | Self::Failed(_))
    }
}

/// One lecture/video tracked from playlist to extracted audio.
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub key: String,
    pub url: Url,
    pub title: String,
    pub media: ItemMedia,
    /// Measured after extraction; playlist hints are never used here.
    pub duration: Option<Duration>,
    pub state: ItemState,
}

impl SourceItem {
    pub fn new(key: impl Into<String>, url: Url, title: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url,
            title: title.into(),
            media: ItemMedia::Unresolved,
            duration: None,
            state: ItemState::Pending,
        }
    }

    /// Filesystem-safe directory name, prefixed with the item's position.
    pub fn work_dir_name(&self, position: usize) -> String {
        let slug: String = self
            .key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{position:03}-{slug}")
    }
}

/// Root aggregate for one run.
#[derive(Debug, Clone)]
pub struct AssemblyJob {
    pub items: Vec<SourceItem>,
    pub output: PathBuf,
    pub work_dir: PathBuf,
    pub metadata: AudiobookMetadata,
    pub cover_art: Option<PathBuf>,
    pub encoding: EncodingConfig,
    pub fetch: FetchConfig,
}

impl AssemblyJob {
    pub fn from_config(config: JobConfig) -> Result<Self> {
        if config.sources.is_empty() {
            return Err(AssemblyError::config("job has no sources"));
        }
        if config.media_type != MediaKind::Audiobook {
            return Err(AssemblyError::config(format!(
                "mediaType `{}` is not supported, output is always marked as an audiobook",
                config.media_type.name()
            )));
        }

        let mut seen = std::collections::HashSet::new();
        let mut items = Vec::with_capacity(config.sources.len());
        for source in &config.sources {
            if !seen.insert(source.key.as_str()) {
                return Err(AssemblyError::config(format!(
                    "duplicate source key `{}`",
                    source.key
                )));
            }
            let url = Url::parse(&source.url)
                .map_err(|e| AssemblyError::invalid_url(&source.url, e.to_string()))?;
            let title = config
                .chapter_title_overrides
                .get(&source.key)
                .or(source.title.as_ref())
                .cloned()
                .unwrap_or_else(|| derive_title(&source.key));
            items.push(SourceItem::new(source.key.clone(), url, title));
        }

        let work_dir = config.work_dir.clone().unwrap_or_else(|| {
            let mut dir = config.output.clone().into_os_string();
            dir.push(".work");
            PathBuf::from(dir)
        });

        Ok(Self {
            items,
            output: config.output,
            work_dir,
            metadata: AudiobookMetadata {
                title: config.title,
                author: config.author,
                album_artist: config.album_artist,
                year: config.year,
                genre: config.genre,
                description: config.description,
                language: config.language,
                media_kind: config.media_type,
            },
            cover_art: config.cover_art_path,
            encoding: EncodingConfig {
                codec: config.codec,
                bitrate_kbps: config.bitrate,
                channels: config.channels,
                sample_rate: config.sample_rate,
            },
            fetch: config.fetch,
        })
    }

    pub fn item_dir(&self, position: usize) -> PathBuf {
        self.work_dir
            .join("items")
            .join(self.items[position].work_dir_name(position))
    }

    pub fn mux_dir(&self) -> PathBuf {
        self.work_dir.join("mux")
    }
}

/// One declared source in the job file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceSpec {
    /// Stable identity, usually the original file name of the lecture.
    pub key: String,
    /// Master or media playlist URL.
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Job file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub title: Option<String>,
    pub author: Option<String>,
    #[serde(default)]
    pub album_artist: Option<String>,
    #[serde(default)]
    pub year: Option<String>,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    /// Only `audiobook` is accepted; other kinds are rejected when the job is built.
    #[serde(default)]
    pub media_type: MediaKind,

    /// Audio bitrate in kbit/s.
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    #[serde(default)]
    pub channels: Channels,
    #[serde(default)]
    pub codec: AudioCodec,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default)]
    pub cover_art_path: Option<PathBuf>,
    #[serde(default)]
    pub chapter_title_overrides: HashMap<String, String>,

    pub sources: Vec<SourceSpec>,
    pub output: PathBuf,
    /// Defaults to `<output>.work`.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    #[serde(default)]
    pub fetch: FetchConfig,
}

fn default_bitrate() -> u32 {
    64
}

fn default_sample_rate() -> u32 {
    44_100
}
