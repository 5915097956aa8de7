//! # bookbind engine
//!
//! Turns HLS-hosted lecture videos into one chaptered audiobook container.
//!
//! Each source item is resolved to a rendition ([`playlist`], [`loader`]), its
//! segments are fetched with bounded concurrency and resumable on-disk state
//! ([`fetch`]), joined into one stream ([`assemble`]) and reduced to an audio track
//! ([`extract`]). Once every item has a measured duration, [`chapters`] builds the
//! chapter table and [`mux`] writes the final container through the [`encoder`]
//! collaborator. [`pipeline`] drives all of it for an [`job::AssemblyJob`].

pub mod assemble;
pub mod chapters;
pub mod config;
pub mod encoder;
pub mod error;
pub mod events;
pub mod extract;
pub mod fetch;
pub mod job;
pub mod loader;
pub mod mux;
pub mod pipeline;
pub mod playlist;
pub mod title;

pub use chapters::{Chapter, ChapterPlanner, ChapterTable};
pub use config::{FetchConfig, HttpConfig};
pub use encoder::{Encoder, EncodingError, FfmpegEncoder, MediaProbe};
pub use error::{AssemblyError, Result};
pub use events::{EventSink, PipelineEvent};
pub use fetch::{HttpSource, RemoteSource};
pub use job::{AssemblyJob, AudiobookMetadata, JobConfig};
pub use pipeline::{AssemblyPipeline, ItemReport, ItemStatus, JobOutcome, JobReport};
pub use playlist::{PlaylistResolver, QualityThreshold};
