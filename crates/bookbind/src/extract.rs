//! Audio-only tracks derived from assembled media units.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::encoder::{Encoder, EncodingError, MediaProbe};
use crate::error::{AssemblyError, Result};
use crate::job::{EncodingConfig, MediaUnit};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub unit: MediaUnit,
    /// Measured on the produced track.
    pub duration: Duration,
    /// True when the input already matched the target and was used as-is.
    pub passthrough: bool,
}

pub struct AudioExtractor {
    encoder: Arc<dyn Encoder>,
    config: EncodingConfig,
    token: CancellationToken,
}

impl AudioExtractor {
    pub fn new(encoder: Arc<dyn Encoder>, config: EncodingConfig, token: CancellationToken) -> Self {
        Self {
            encoder,
            config,
            token,
        }
    }

    fn matches_target(&self, probe: &MediaProbe) -> bool {
        !probe.has_video
            && probe.has_audio
            && probe.audio_codec.as_deref() == Some(self.config.codec.codec_name())
            && probe.channels == Some(u32::from(self.config.channels.count()))
            && probe.sample_rate.is_none_or(|rate| rate == self.config.sample_rate)
    }

    #[instrument(skip_all, fields(item = %item))]
    pub async fn extract(&self, item: &str, input: &MediaUnit, output: &Path) -> Result<Extraction> {
        match self.encoder.probe(input.path()).await {
            Ok(probe) if self.matches_target(&probe) && !probe.duration.is_zero() => {
                info!(input = %input.path().display(), "Input is already audio in the target format");
                return Ok(Extraction {
                    unit: input.clone(),
                    duration: probe.duration,
                    passthrough: true,
                });
            }
            Ok(probe) => debug!(
                has_video = probe.has_video,
                codec = ?probe.audio_codec,
                "Input needs extraction"
            ),
            Err(e) => warn!(error = %e, "Could not probe input, extracting anyway"),
        }

        let (unit, reported) = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(AssemblyError::Cancelled),
            result = self.encoder.extract_audio(input.path(), output, &self.config) => {
                result.map_err(|e| AssemblyError::encoding("extract", e))?
            }
        };

        let probe = self
            .encoder
            .probe(unit.path())
            .await
            .map_err(|e| AssemblyError::encoding("extract", e))?;
        if probe.has_video {
            return Err(AssemblyError::encoding(
                "extract",
                EncodingError::invalid_output("extracted track still has a video stream"),
            ));
        }
        if !probe.has_audio {
            return Err(AssemblyError::encoding(
                "extract",
                EncodingError::invalid_output("extracted track has no audio stream"),
            ));
        }

        let duration = if reported.is_zero() { probe.duration } else { reported };
        if duration.is_zero() {
            return Err(AssemblyError::encoding(
                "extract",
                EncodingError::invalid_output("extracted track has zero duration"),
            ));
        }

        info!(duration_ms = duration.as_millis() as u64, "Audio extracted");
        Ok(Extraction {
            unit,
            duration,
            passthrough: false,
        })
    }
}
