//! End-to-end runs against an in-memory CDN and a fake encoder.
//!
//! Segment bodies are `seg <millis>` lines. The fake encoder writes its outputs as JSON
//! descriptions, so files copied around by the muxer keep their probed properties.

use async_trait::async_trait;
use bookbind_engine::chapters::{Chapter, ChapterTable};
use bookbind_engine::config::FetchConfig;
use bookbind_engine::encoder::{ConcatMode, Encoder, EncodingError, MediaProbe};
use bookbind_engine::events::PipelineEvent;
use bookbind_engine::fetch::RemoteSource;
use bookbind_engine::job::{AssemblyJob, AudiobookMetadata, EncodingConfig, JobConfig, MediaKind, MediaUnit};
use bookbind_engine::pipeline::{AssemblyPipeline, ItemStatus, JobOutcome, plan_from_checkpoints};
use bookbind_engine::playlist::ByteRange;
use bookbind_engine::{AssemblyError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

const ORIGIN: &str = "https://cdn.example";

#[derive(Default)]
struct Cdn {
    bodies: HashMap<String, Bytes>,
    forbidden: HashSet<String>,
    requests: AtomicUsize,
}

impl Cdn {
    /// Publishes one lecture as a master playlist with two renditions, where only the
    /// low one is backed by segments.
    fn publish(&mut self, lecture: &str, segment_ms: &[u64]) {
        self.bodies.insert(
            format!("{ORIGIN}/{lecture}/master.m3u8"),
            Bytes::from(
                "#EXTM3U\n\
                 #EXT-X-STREAM-INF:BANDWIDTH=1500000,RESOLUTION=1280x720\n720/index.m3u8\n\
                 #EXT-X-STREAM-INF:BANDWIDTH=300000,RESOLUTION=640x360\n360/index.m3u8\n",
            ),
        );
        let mut media = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:600\n#EXT-X-MEDIA-SEQUENCE:0\n");
        for (i, ms) in segment_ms.iter().enumerate() {
            media.push_str(&format!("#EXTINF:{:.3},\nseg{i}.ts\n", *ms as f64 / 1000.0));
            self.bodies.insert(
                format!("{ORIGIN}/{lecture}/360/seg{i}.ts"),
                Bytes::from(format!("seg {ms}\n")),
            );
        }
        media.push_str("#EXT-X-ENDLIST\n");
        self.bodies
            .insert(format!("{ORIGIN}/{lecture}/360/index.m3u8"), Bytes::from(media));
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSource for Cdn {
    async fn fetch(&self, url: &Url, _range: Option<ByteRange>) -> Result<Bytes> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.forbidden.contains(url.as_str()) {
            return Err(AssemblyError::http_status(StatusCode::FORBIDDEN, url.as_str()));
        }
        self.bodies
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| AssemblyError::http_status(StatusCode::NOT_FOUND, url.as_str()))
    }
}

/// What the fake encoder knows about a file it produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FakeMedia {
    duration_ms: u64,
    has_video: bool,
    chapters: usize,
    tags: BTreeMap<String, String>,
    cover: bool,
}

#[derive(Default)]
struct FakeEncoder {
    calls: Mutex<Vec<&'static str>>,
}

impl FakeEncoder {
    fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    async fn read(path: &Path) -> std::result::Result<FakeMedia, EncodingError> {
        let raw = tokio::fs::read(path).await?;
        if raw.first() == Some(&b'{') {
            return serde_json::from_slice(&raw).map_err(|e| EncodingError::probe(e.to_string()));
        }
        // Raw segment data straight from the CDN.
        let text = String::from_utf8_lossy(&raw);
        let mut duration_ms = 0;
        for line in text.lines() {
            let ms = line
                .strip_prefix("seg ")
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| EncodingError::probe(format!("not a stream: {line:?}")))?;
            duration_ms += ms;
        }
        Ok(FakeMedia {
            duration_ms,
            has_video: true,
            ..Default::default()
        })
    }

    async fn write(path: &Path, media: &FakeMedia) -> std::result::Result<(), EncodingError> {
        let raw = serde_json::to_vec(media).map_err(|e| EncodingError::invalid_output(e.to_string()))?;
        tokio::fs::write(path, raw).await?;
        Ok(())
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn probe(&self, path: &Path) -> std::result::Result<MediaProbe, EncodingError> {
        let media = Self::read(path).await?;
        let mut tags = media.tags.clone();
        if media.cover {
            tags.insert("cover".into(), "1".into());
        }
        Ok(MediaProbe {
            duration: Duration::from_millis(media.duration_ms),
            has_video: media.has_video,
            has_audio: true,
            audio_codec: Some("aac".into()),
            channels: Some(if media.has_video { 2 } else { 1 }),
            sample_rate: Some(44_100),
            chapter_count: media.chapters,
            tags,
        })
    }

    async fn concatenate(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        _mode: ConcatMode,
    ) -> std::result::Result<MediaUnit, EncodingError> {
        self.record("concatenate");
        let mut joined = FakeMedia::default();
        for input in inputs {
            joined.duration_ms += Self::read(input).await?.duration_ms;
        }
        Self::write(output, &joined).await?;
        Ok(MediaUnit::new(output))
    }

    async fn extract_audio(
        &self,
        input: &Path,
        output: &Path,
        _config: &EncodingConfig,
    ) -> std::result::Result<(MediaUnit, Duration), EncodingError> {
        self.record("extract_audio");
        let source = Self::read(input).await?;
        let audio = FakeMedia {
            duration_ms: source.duration_ms,
            ..Default::default()
        };
        Self::write(output, &audio).await?;
        Ok((MediaUnit::new(output), Duration::from_millis(audio.duration_ms)))
    }

    async fn apply_metadata(
        &self,
        container: &Path,
        output: &Path,
        metadata: &AudiobookMetadata,
    ) -> std::result::Result<MediaUnit, EncodingError> {
        self.record("apply_metadata");
        let mut media = Self::read(container).await?;
        for (key, value) in metadata.tags() {
            media.tags.insert(key.to_string(), value);
        }
        Self::write(output, &media).await?;
        Ok(MediaUnit::new(output))
    }

    async fn set_media_kind(&self, container: &Path, kind: MediaKind) -> std::result::Result<(), EncodingError> {
        self.record("set_media_kind");
        let mut media = Self::read(container).await?;
        media.tags.insert("media_type".into(), kind.stik().to_string());
        Self::write(container, &media).await
    }

    async fn apply_chapters(
        &self,
        container: &Path,
        chapters: &Path,
        output: &Path,
    ) -> std::result::Result<MediaUnit, EncodingError> {
        self.record("apply_chapters");
        let text = tokio::fs::read_to_string(chapters).await?;
        let table = ChapterTable::parse_ffmetadata(&text)
            .map_err(|e| EncodingError::invalid_output(e.to_string()))?;
        let mut media = Self::read(container).await?;
        media.chapters = table.len();
        Self::write(output, &media).await?;
        Ok(MediaUnit::new(output))
    }

    async fn embed_cover_art(&self, container: &Path, _image: &Path) -> std::result::Result<(), EncodingError> {
        self.record("embed_cover_art");
        let mut media = Self::read(container).await?;
        media.cover = true;
        Self::write(container, &media).await
    }
}

fn course_cdn() -> Cdn {
    let mut cdn = Cdn::default();
    cdn.publish("intro", &[200_000, 200_000, 200_000]);
    cdn.publish("basics", &[450_000, 450_500]);
    cdn.publish("advanced", &[300_250]);
    cdn
}

fn job(dir: &Path, title: Option<&str>) -> AssemblyJob {
    let config: JobConfig = serde_json::from_value(serde_json::json!({
        "title": title,
        "author": "Jane Doe",
        "year": "2024",
        "sources": [
            { "key": "00_intro.mp4", "url": format!("{ORIGIN}/intro/master.m3u8") },
            { "key": "01_01_basics.mp4", "url": format!("{ORIGIN}/basics/master.m3u8") },
            { "key": "01_02_advanced.mp4", "url": format!("{ORIGIN}/advanced/master.m3u8") }
        ],
        "output": dir.join("course.m4b"),
    }))
    .unwrap();
    let mut job = AssemblyJob::from_config(config).unwrap();
    job.fetch = FetchConfig {
        concurrency: 3,
        request_delay_ms: 0,
        max_retries: 1,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 2,
        retry_jitter: false,
        item_parallelism: 3,
        ..Default::default()
    };
    job
}

fn expected_chapters() -> Vec<Chapter> {
    vec![
        Chapter {
            start_ms: 0,
            end_ms: 600_000,
            title: "Introduction".into(),
        },
        Chapter {
            start_ms: 600_000,
            end_ms: 1_500_500,
            title: "1.1 Basics".into(),
        },
        Chapter {
            start_ms: 1_500_500,
            end_ms: 1_800_750,
            title: "1.2 Advanced".into(),
        },
    ]
}

#[tokio::test]
async fn course_becomes_chaptered_audiobook() {
    let dir = tempfile::tempdir().unwrap();
    let cdn = Arc::new(course_cdn());
    let encoder = Arc::new(FakeEncoder::default());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();

    let mut job = job(dir.path(), Some("Rust in Depth"));
    let report = AssemblyPipeline::new(cdn.clone(), encoder.clone(), CancellationToken::new())
        .with_events(Arc::new(move |event| sink.lock().push(event)))
        .run(&mut job)
        .await
        .unwrap();

    let JobOutcome::Completed { output, chapters } = &report.outcome else {
        panic!("job failed: {:?}", report.outcome);
    };
    assert_eq!(chapters.chapters(), expected_chapters().as_slice());
    assert!(report.items.iter().all(|i| i.status == ItemStatus::Complete));

    // Declaration order survives whatever order the items finished in.
    let keys: Vec<_> = report.items.iter().map(|i| i.key.as_str()).collect();
    assert_eq!(keys, vec!["00_intro.mp4", "01_01_basics.mp4", "01_02_advanced.mp4"]);

    let probe = encoder.probe(output).await.unwrap();
    assert_eq!(probe.tag("title"), Some("Rust in Depth"));
    assert_eq!(probe.tag("artist"), Some("Jane Doe"));
    assert_eq!(probe.tag("media_type"), Some("2"));
    assert_eq!(probe.chapter_count, 3);
    assert_eq!(probe.duration, Duration::from_millis(1_800_750));

    let events = events.lock();
    let selected: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::RenditionSelected { bandwidth, .. } => Some(*bandwidth),
            _ => None,
        })
        .collect();
    assert_eq!(selected, vec![300_000; 3]);
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::JobCompleted { chapters: 3, .. })
    ));
}

#[tokio::test]
async fn rerun_reuses_everything_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let cdn = Arc::new(course_cdn());
    let encoder = Arc::new(FakeEncoder::default());

    let mut first = job(dir.path(), Some("Rust in Depth"));
    let report = AssemblyPipeline::new(cdn.clone(), encoder.clone(), CancellationToken::new())
        .run(&mut first)
        .await
        .unwrap();
    assert!(report.is_success());
    let requests = cdn.requests();
    let calls = encoder.calls().len();

    let mut second = job(dir.path(), Some("Rust in Depth"));
    let report = AssemblyPipeline::new(cdn.clone(), encoder.clone(), CancellationToken::new())
        .run(&mut second)
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(cdn.requests(), requests);
    assert_eq!(encoder.calls().len(), calls);

    let planned = plan_from_checkpoints(&second).await.unwrap();
    assert_eq!(planned.chapters(), expected_chapters().as_slice());
}

#[tokio::test]
async fn blocked_item_fails_job_but_not_its_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let mut cdn = course_cdn();
    cdn.forbidden.insert(format!("{ORIGIN}/basics/360/seg1.ts"));
    let cdn = Arc::new(cdn);
    let encoder = Arc::new(FakeEncoder::default());

    let mut job = job(dir.path(), Some("Rust in Depth"));
    let report = AssemblyPipeline::new(cdn, encoder.clone(), CancellationToken::new())
        .run(&mut job)
        .await
        .unwrap();

    match &report.outcome {
        JobOutcome::Failed { error, unprocessed } => {
            assert!(matches!(
                error,
                AssemblyError::SourceItemBlocked { failed: 1, total: 2, .. }
            ));
            assert_eq!(*unprocessed, 0);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(report.items[0].status, ItemStatus::Complete);
    assert!(matches!(report.items[1].status, ItemStatus::Failed(_)));
    assert_eq!(report.items[2].status, ItemStatus::Complete);
    assert_eq!(report.failed_items().count(), 1);

    assert!(!job.output.exists());
    assert!(!encoder.calls().contains(&"apply_metadata"));
}

#[tokio::test]
async fn malformed_playlist_is_reported_per_item() {
    let dir = tempfile::tempdir().unwrap();
    let mut cdn = course_cdn();
    cdn.bodies.insert(
        format!("{ORIGIN}/advanced/master.m3u8"),
        Bytes::from("#EXTM3U\n#EXT-X-STREAM-INF:RESOLUTION=640x360\n360/index.m3u8\n"),
    );

    let mut job = job(dir.path(), Some("Rust in Depth"));
    let report = AssemblyPipeline::new(Arc::new(cdn), Arc::new(FakeEncoder::default()), CancellationToken::new())
        .run(&mut job)
        .await
        .unwrap();

    assert!(matches!(
        report.outcome,
        JobOutcome::Failed {
            error: AssemblyError::MalformedPlaylist { .. },
            ..
        }
    ));
    assert!(matches!(report.items[2].status, ItemStatus::Failed(_)));
}

#[tokio::test]
async fn missing_metadata_stops_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let cdn = Arc::new(course_cdn());
    let encoder = Arc::new(FakeEncoder::default());

    let mut job = job(dir.path(), None);
    let err = AssemblyPipeline::new(cdn.clone(), encoder.clone(), CancellationToken::new())
        .run(&mut job)
        .await
        .unwrap_err();

    assert!(matches!(err, AssemblyError::MetadataValidation { ref missing } if missing == &vec!["title"]));
    assert_eq!(cdn.requests(), 0);
    assert!(encoder.calls().is_empty());
    assert!(!job.work_dir.exists());
}

#[tokio::test]
async fn cancelled_job_leaves_items_unprocessed() {
    let dir = tempfile::tempdir().unwrap();
    let cdn = Arc::new(course_cdn());
    let token = CancellationToken::new();
    token.cancel();

    let mut job = job(dir.path(), Some("Rust in Depth"));
    let report = AssemblyPipeline::new(cdn.clone(), Arc::new(FakeEncoder::default()), token)
        .run(&mut job)
        .await
        .unwrap();

    match report.outcome {
        JobOutcome::Failed { error, unprocessed } => {
            assert!(matches!(error, AssemblyError::Cancelled));
            assert_eq!(unprocessed, 3);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(report.items.iter().all(|i| i.status == ItemStatus::Unprocessed));
    assert_eq!(cdn.requests(), 0);
}
