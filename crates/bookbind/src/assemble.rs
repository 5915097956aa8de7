//! Joins a complete segment set into one media unit per source item.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use crate::encoder::{ConcatMode, Encoder, EncodingError};
use crate::error::{AssemblyError, Result};
use crate::fetch::FetchedSegment;
use crate::job::MediaUnit;

/// Sorts `segments` by index and checks they are exactly `0..len`.
pub fn order_segments(item: &str, segments: &mut [FetchedSegment]) -> Result<()> {
    segments.sort_by_key(|s| s.index);
    for (expected, segment) in segments.iter().enumerate() {
        let expected = expected as u64;
        if segment.index != expected {
            return Err(AssemblyError::Discontinuity {
                item: item.to_string(),
                expected,
                found: segment.index,
            });
        }
    }
    Ok(())
}

pub struct StreamAssembler {
    encoder: Arc<dyn Encoder>,
}

impl StreamAssembler {
    pub fn new(encoder: Arc<dyn Encoder>) -> Self {
        Self { encoder }
    }

    /// Byte-joins the segments in index order into `output`.
    ///
    /// If the joined file does not probe as valid media, the segments are re-encoded
    /// once through the encoder; a second failure is returned.
    #[instrument(skip_all, fields(item = %item, segments = segments.len()))]
    pub async fn assemble(
        &self,
        item: &str,
        mut segments: Vec<FetchedSegment>,
        output: &Path,
    ) -> Result<MediaUnit> {
        if segments.is_empty() {
            return Err(AssemblyError::encoding(
                "assemble",
                EncodingError::invalid_output(format!("`{item}` has no segments")),
            ));
        }
        order_segments(item, &mut segments)?;
        let paths: Vec<PathBuf> = segments.into_iter().map(|s| s.path).collect();

        let bytes = join_files(&paths, output).await?;
        debug!(bytes, output = %output.display(), "Segments joined");

        let failure = match self.encoder.probe(output).await {
            Ok(probe) if probe.has_audio => return Ok(MediaUnit::new(output)),
            Ok(_) => EncodingError::invalid_output("joined stream has no audio"),
            Err(e) => e,
        };

        warn!(error = %failure, "Joined stream rejected, re-encoding segments");
        let unit = self
            .encoder
            .concatenate(&paths, output, ConcatMode::Reencode)
            .await
            .map_err(|e| AssemblyError::encoding("assemble", e))?;

        let probe = self
            .encoder
            .probe(unit.path())
            .await
            .map_err(|e| AssemblyError::encoding("assemble", e))?;
        if !probe.has_audio {
            return Err(AssemblyError::encoding(
                "assemble",
                EncodingError::invalid_output("re-encoded stream has no audio"),
            ));
        }
        info!(output = %unit.path().display(), "Re-encoded stream accepted");
        Ok(unit)
    }
}

/// Concatenates `inputs` into `output` through a `.part` file.
async fn join_files(inputs: &[PathBuf], output: &Path) -> Result<u64> {
    let mut part = output.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);

    let mut writer = BufWriter::new(tokio::fs::File::create(&part).await?);
    let mut total = 0;
    for input in inputs {
        let mut reader = tokio::fs::File::open(input).await?;
        total += tokio::io::copy(&mut reader, &mut writer).await?;
    }
    writer.flush().await?;
    writer.into_inner().sync_all().await?;

    tokio::fs::rename(&part, output).await?;
    Ok(total)
}
