use reqwest::StatusCode;

use crate::encoder::EncodingError;

pub type Result<T, E = AssemblyError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("malformed playlist at line {line}: {reason}")]
    MalformedPlaylist { line: usize, reason: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("segment {sequence} ({url}) failed: {reason}")]
    SegmentFetch {
        sequence: u64,
        url: String,
        reason: String,
        retryable: bool,
    },

    #[error("source item `{item}` blocked: {failed} of {total} segments failed")]
    SourceItemBlocked {
        item: String,
        failed: usize,
        total: usize,
    },

    #[error("discontinuity in `{item}`: expected segment index {expected}, found {found}")]
    Discontinuity {
        item: String,
        expected: u64,
        found: u64,
    },

    #[error("encoder failed during {stage}: {source}")]
    Encoding {
        stage: &'static str,
        #[source]
        source: EncodingError,
    },

    #[error("chapter table broken at chapter {index}: {reason}")]
    ChapterIntegrity { index: usize, reason: String },

    #[error("missing required metadata: {}", missing.join(", "))]
    MetadataValidation { missing: Vec<&'static str> },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl AssemblyError {
    pub fn malformed(line: usize, reason: impl Into<String>) -> Self {
        Self::MalformedPlaylist {
            line,
            reason: reason.into(),
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn encoding(stage: &'static str, source: EncodingError) -> Self {
        Self::Encoding { stage, source }
    }

    pub fn chapter_integrity(index: usize, reason: impl Into<String>) -> Self {
        Self::ChapterIntegrity {
            index,
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether a fetch that failed with this error is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Network { source } => is_retryable_reqwest_error(source),
            Self::SegmentFetch { retryable, .. } => *retryable,
            Self::Io { .. } => true,
            Self::Cancelled
            | Self::MalformedPlaylist { .. }
            | Self::InvalidUrl { .. }
            | Self::SourceItemBlocked { .. }
            | Self::Discontinuity { .. }
            | Self::Encoding { .. }
            | Self::ChapterIntegrity { .. }
            | Self::MetadataValidation { .. }
            | Self::Configuration { .. }
            | Self::Serialization { .. } => false,
        }
    }

    /// Structural errors are never recovered locally; they always reach the job report.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::MalformedPlaylist { .. }
                | Self::Discontinuity { .. }
                | Self::ChapterIntegrity { .. }
        )
    }
}

/// Retryable: connect, timeout, request, body read and decode errors.
/// Non-retryable: redirect and builder errors.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}
