//! Network side of the pipeline: transport, retry, and the segment worker pool.

mod fetcher;
mod manifest;
mod retry;
mod source;

pub use fetcher::{FetchReport, FetchedSegment, SegmentFetcher, SegmentState, segment_file_name};
pub use manifest::{MANIFEST_FILE, ManifestEntry, SegmentManifest};
pub(crate) use manifest::write_atomic;
pub use retry::{RetryAction, RetryPolicy, retry_with_backoff};
pub use source::{HttpSource, RemoteSource};
