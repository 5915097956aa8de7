use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Progress notifications emitted while a job runs.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    ItemStarted {
        item: String,
    },
    /// A rendition was chosen for an item.
    RenditionSelected {
        item: String,
        bandwidth: u64,
        height: Option<u64>,
        /// False when the best available rendition was taken below threshold
        meets_threshold: bool,
    },
    /// Segment list known; `resumed` of them were already on disk.
    FetchStarted {
        item: String,
        total: usize,
        resumed: usize,
    },
    SegmentCompleted {
        item: String,
        index: u64,
        bytes: u64,
    },
    SegmentRetrying {
        item: String,
        index: u64,
        attempt: u32,
    },
    SegmentFailed {
        item: String,
        index: u64,
        reason: String,
    },
    ItemAssembled {
        item: String,
        path: PathBuf,
    },
    ItemExtracted {
        item: String,
        duration: Duration,
    },
    ItemFailed {
        item: String,
        reason: String,
    },
    /// A muxing step finished, or was skipped because its checkpoint was valid.
    MuxStep {
        step: &'static str,
        skipped: bool,
    },
    JobCompleted {
        output: PathBuf,
        chapters: usize,
    },
}

impl PipelineEvent {
    /// Item key the event refers to, if any.
    pub fn item(&self) -> Option<&str> {
        match self {
            Self::ItemStarted { item }
            | Self::RenditionSelected { item, .. }
            | Self::FetchStarted { item, .. }
            | Self::SegmentCompleted { item, .. }
            | Self::SegmentRetrying { item, .. }
            | Self::SegmentFailed { item, .. }
            | Self::ItemAssembled { item, .. }
            | Self::ItemExtracted { item, .. }
            | Self::ItemFailed { item, .. } => Some(item),
            Self::MuxStep { .. } | Self::JobCompleted { .. } => None,
        }
    }
}

pub type EventSink = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

/// Sink that drops every event.
pub fn discard() -> EventSink {
    Arc::new(|_| {})
}
