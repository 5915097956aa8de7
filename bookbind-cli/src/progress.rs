use bookbind_engine::events::{EventSink, PipelineEvent};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;

/// Segment progress across every item of a job.
pub struct Progress {
    bar: ProgressBar,
}

impl Progress {
    pub fn new(hidden: bool) -> Self {
        let bar = if hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} segments {msg}",
            )
            .unwrap()
            .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    pub fn sink(&self) -> EventSink {
        let bar = self.bar.clone();
        Arc::new(move |event| match event {
            PipelineEvent::FetchStarted { total, resumed, .. } => {
                bar.inc_length(total as u64);
                bar.inc(resumed as u64);
            }
            PipelineEvent::SegmentCompleted { .. } => bar.inc(1),
            PipelineEvent::RenditionSelected {
                item,
                bandwidth,
                meets_threshold: false,
                ..
            } => bar.println(format!(
                "{item}: no rendition meets the quality threshold, using {bandwidth} bit/s"
            )),
            PipelineEvent::SegmentRetrying { item, index, attempt } => {
                bar.set_message(format!("{item}: retrying segment {index} (attempt {attempt})"))
            }
            PipelineEvent::ItemExtracted { item, duration } => {
                bar.set_message(format!("{item}: {:.1}s of audio", duration.as_secs_f64()))
            }
            PipelineEvent::ItemFailed { item, reason } => bar.println(format!("{item} failed: {reason}")),
            PipelineEvent::MuxStep { step, skipped } => bar.set_message(if skipped {
                format!("{step} (already done)")
            } else {
                format!("{step} done")
            }),
            _ => {}
        })
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
