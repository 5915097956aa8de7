//! [`Encoder`] backed by the `ffmpeg` and `ffprobe` binaries.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::command::{run_tool, tool_command};
use super::{ConcatMode, Encoder, EncodingError, MediaProbe};
use crate::job::{AudiobookMetadata, EncodingConfig, MediaKind, MediaUnit};

#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegEncoder {
    /// Uses `FFMPEG_PATH` and `FFPROBE_PATH` when set, otherwise the binaries on `PATH`.
    pub fn new() -> Self {
        Self {
            ffmpeg: std::env::var("FFMPEG_PATH")
                .unwrap_or_else(|_| "ffmpeg".to_string())
                .into(),
            ffprobe: std::env::var("FFPROBE_PATH")
                .unwrap_or_else(|_| "ffprobe".to_string())
                .into(),
        }
    }

    pub fn with_paths(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    async fn ffmpeg(&self, args: Vec<String>) -> Result<(), EncodingError> {
        debug!(?args, "Running ffmpeg");
        let mut cmd = tool_command(&self.ffmpeg);
        cmd.args(&args);
        let output = run_tool("ffmpeg", &mut cmd).await?;
        debug!(elapsed_secs = output.elapsed_secs, "ffmpeg finished");
        Ok(())
    }

    /// Runs an in-place edit through a sibling temporary file.
    async fn rewrite_in_place(
        &self,
        container: &Path,
        build: impl FnOnce(&Path) -> Vec<String>,
    ) -> Result<(), EncodingError> {
        let tmp = sibling_tmp(container);
        let result = self.ffmpeg(build(&tmp)).await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp, container).await?;
        Ok(())
    }
}

fn base_args() -> Vec<String> {
    ["-y", "-hide_banner", "-nostats", "-loglevel", "warning"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// `name.tmp.ext` next to `path`, keeping the extension so the muxer is inferred.
fn sibling_tmp(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.tmp.{}", ext.to_string_lossy()),
        None => format!("{stem}.tmp"),
    };
    path.with_file_name(name)
}

/// Body of a concat demuxer list file.
pub(crate) fn concat_list(inputs: &[PathBuf]) -> String {
    inputs
        .iter()
        .map(|p| format!("file '{}'\n", path_arg(p).replace('\'', r"'\''")))
        .collect()
}

pub(crate) fn concat_args(list: &Path, output: &Path, mode: ConcatMode) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-f", "concat", "-safe", "0"].map(String::from));
    args.extend(["-i".to_string(), path_arg(list)]);
    match mode {
        ConcatMode::Copy => {
            args.extend(["-map", "0", "-c", "copy"].map(String::from));
        }
        ConcatMode::Reencode => {
            // Encoders default to the output container's codecs.
            args.extend(["-map", "0:v?", "-map", "0:a?"].map(String::from));
        }
    }
    args.push(path_arg(output));
    args
}

pub(crate) fn extract_args(input: &Path, output: &Path, config: &EncodingConfig) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i".to_string(), path_arg(input)]);
    args.extend(["-vn", "-sn", "-dn", "-map", "0:a:0"].map(String::from));
    args.extend(["-c:a".to_string(), config.codec.encoder_name().to_string()]);
    if !config.codec.is_lossless() {
        args.extend(["-b:a".to_string(), config.bitrate_arg()]);
    }
    args.extend(["-ac".to_string(), config.channels.count().to_string()]);
    args.extend(["-ar".to_string(), config.sample_rate.to_string()]);
    args.push(path_arg(output));
    args
}

pub(crate) fn metadata_args(container: &Path, output: &Path, metadata: &AudiobookMetadata) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i".to_string(), path_arg(container)]);
    args.extend(["-map", "0", "-map_metadata", "0", "-map_chapters", "0", "-c", "copy"].map(String::from));
    for (key, value) in metadata.tags() {
        args.extend(["-metadata".to_string(), format!("{key}={value}")]);
    }
    args.push(path_arg(output));
    args
}

pub(crate) fn media_kind_args(container: &Path, output: &Path, kind: MediaKind) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i".to_string(), path_arg(container)]);
    args.extend(["-map", "0", "-map_metadata", "0", "-map_chapters", "0", "-c", "copy"].map(String::from));
    args.extend(["-metadata".to_string(), format!("media_type={}", kind.stik())]);
    args.push(path_arg(output));
    args
}

pub(crate) fn chapters_args(container: &Path, chapters: &Path, output: &Path) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i".to_string(), path_arg(container)]);
    args.extend(["-i".to_string(), path_arg(chapters)]);
    // Tags come from the container, chapters from the metadata file.
    args.extend(["-map", "0", "-map_metadata", "0", "-map_chapters", "1", "-c", "copy"].map(String::from));
    args.push(path_arg(output));
    args
}

pub(crate) fn cover_args(container: &Path, image: &Path, output: &Path) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i".to_string(), path_arg(container)]);
    args.extend(["-i".to_string(), path_arg(image)]);
    args.extend(
        [
            "-map",
            "0:a",
            "-map",
            "1",
            "-map_metadata",
            "0",
            "-map_chapters",
            "0",
            "-c",
            "copy",
            "-disposition:v:0",
            "attached_pic",
        ]
        .map(String::from),
    );
    args.push(path_arg(output));
    args
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    chapters: Vec<serde_json::Value>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    disposition: BTreeMap<String, i64>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

fn parse_seconds(value: Option<&String>) -> Option<Duration> {
    let secs: f64 = value?.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Converts `ffprobe -print_format json` output into a [`MediaProbe`].
pub(crate) fn parse_probe(json: &[u8]) -> Result<MediaProbe, EncodingError> {
    let output: ProbeOutput =
        serde_json::from_slice(json).map_err(|e| EncodingError::probe(format!("unreadable ffprobe output: {e}")))?;

    let is_cover = |s: &ProbeStream| s.disposition.get("attached_pic").copied().unwrap_or(0) == 1;
    let audio = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));
    let has_video = output
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("video") && !is_cover(s));

    let format_duration = output.format.as_ref().and_then(|f| parse_seconds(f.duration.as_ref()));
    let duration = format_duration
        .or_else(|| {
            output
                .streams
                .iter()
                .filter_map(|s| parse_seconds(s.duration.as_ref()))
                .max()
        })
        .unwrap_or_default();

    let tags = output
        .format
        .map(|f| {
            f.tags
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect()
        })
        .unwrap_or_default();

    Ok(MediaProbe {
        duration,
        has_video,
        has_audio: audio.is_some(),
        audio_codec: audio.and_then(|s| s.codec_name.clone()),
        channels: audio.and_then(|s| s.channels),
        sample_rate: audio
            .and_then(|s| s.sample_rate.as_deref())
            .and_then(|r| r.parse().ok()),
        chapter_count: output.chapters.len(),
        tags,
    })
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn probe(&self, path: &Path) -> Result<MediaProbe, EncodingError> {
        let mut cmd = tool_command(&self.ffprobe);
        cmd.args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams", "-show_chapters"])
            .arg(path);
        let output = run_tool("ffprobe", &mut cmd).await?;
        parse_probe(&output.stdout)
    }

    async fn concatenate(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        mode: ConcatMode,
    ) -> Result<MediaUnit, EncodingError> {
        if inputs.is_empty() {
            return Err(EncodingError::invalid_output("nothing to concatenate"));
        }
        let mut list = output.as_os_str().to_owned();
        list.push(".concat.txt");
        let list = PathBuf::from(list);
        tokio::fs::write(&list, concat_list(inputs)).await?;

        info!(inputs = inputs.len(), output = %output.display(), ?mode, "Concatenating");
        let result = self.ffmpeg(concat_args(&list, output, mode)).await;
        let _ = tokio::fs::remove_file(&list).await;
        result?;
        Ok(MediaUnit::new(output))
    }

    async fn extract_audio(
        &self,
        input: &Path,
        output: &Path,
        config: &EncodingConfig,
    ) -> Result<(MediaUnit, Duration), EncodingError> {
        info!(input = %input.display(), codec = config.codec.encoder_name(), "Extracting audio");
        self.ffmpeg(extract_args(input, output, config)).await?;
        let probe = self.probe(output).await?;
        Ok((MediaUnit::new(output), probe.duration))
    }

    async fn apply_metadata(
        &self,
        container: &Path,
        output: &Path,
        metadata: &AudiobookMetadata,
    ) -> Result<MediaUnit, EncodingError> {
        self.ffmpeg(metadata_args(container, output, metadata)).await?;
        Ok(MediaUnit::new(output))
    }

    async fn set_media_kind(&self, container: &Path, kind: MediaKind) -> Result<(), EncodingError> {
        self.rewrite_in_place(container, |tmp| media_kind_args(container, tmp, kind))
            .await
    }

    async fn apply_chapters(
        &self,
        container: &Path,
        chapters: &Path,
        output: &Path,
    ) -> Result<MediaUnit, EncodingError> {
        self.ffmpeg(chapters_args(container, chapters, output)).await?;
        Ok(MediaUnit::new(output))
    }

    async fn embed_cover_art(&self, container: &Path, image: &Path) -> Result<(), EncodingError> {
        self.rewrite_in_place(container, |tmp| cover_args(container, image, tmp))
            .await
    }
}
