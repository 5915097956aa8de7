//! Bounded, resumable segment downloads for one source item.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::manifest::SegmentManifest;
use super::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use super::source::RemoteSource;
use crate::config::FetchConfig;
use crate::error::{AssemblyError, Result};
use crate::events::{self, EventSink, PipelineEvent};
use crate::playlist::Segment;

/// Lifecycle of a single segment download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentState {
    Pending,
    InFlight,
    Retrying { attempt: u32 },
    Complete { bytes: u64 },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSegment {
    pub index: u64,
    pub sequence: u64,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub total: usize,
    pub completed: usize,
    /// Segments found on disk and not requested again.
    pub resumed: usize,
    /// Requests issued during this run, retries included.
    pub requests: usize,
    /// Completed segments in playlist order.
    pub files: Vec<FetchedSegment>,
}

/// On-disk name of a segment inside its item directory.
pub fn segment_file_name(segment: &Segment) -> String {
    format!("{:06}.{}", segment.index, segment.extension())
}

fn part_path(path: &Path) -> PathBuf {
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    PathBuf::from(part)
}

/// Enforces a minimum gap between request starts issued by one worker.
struct Pacer {
    gap: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl Pacer {
    fn new(gap: Duration) -> Self {
        Self {
            gap,
            last_start: Mutex::new(None),
        }
    }

    async fn ready(&self) {
        let wait_until = self.last_start.lock().map(|last| last + self.gap);
        if let Some(deadline) = wait_until {
            tokio::time::sleep_until(deadline).await;
        }
        *self.last_start.lock() = Some(Instant::now());
    }
}

struct FetchRun<'a> {
    item: &'a str,
    segments: &'a [Segment],
    dest: &'a Path,
    manifest: SegmentManifest,
    states: Mutex<Vec<SegmentState>>,
    queue: Mutex<VecDeque<usize>>,
    requests: AtomicUsize,
}

impl FetchRun<'_> {
    fn set_state(&self, pos: usize, state: SegmentState) {
        self.states.lock()[pos] = state;
    }
}

pub struct SegmentFetcher {
    source: Arc<dyn RemoteSource>,
    concurrency: usize,
    request_delay: Duration,
    retry: RetryPolicy,
    token: CancellationToken,
    events: EventSink,
}

impl SegmentFetcher {
    pub fn new(source: Arc<dyn RemoteSource>, config: &FetchConfig, token: CancellationToken) -> Self {
        Self {
            source,
            concurrency: config.concurrency.max(1),
            request_delay: config.request_delay(),
            retry: config.retry_policy(),
            token,
            events: events::discard(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Downloads every segment into `dest`, skipping ones already stored.
    ///
    /// A terminal failure of any segment blocks the item, but remaining segments are
    /// still fetched so a later run has less to do.
    #[instrument(skip_all, fields(item = %item, segments = segments.len()))]
    pub async fn fetch_all(&self, item: &str, segments: &[Segment], dest: &Path) -> Result<FetchReport> {
        tokio::fs::create_dir_all(dest).await?;

        let run = FetchRun {
            item,
            segments,
            dest,
            manifest: SegmentManifest::load(dest).await,
            states: Mutex::new(vec![SegmentState::Pending; segments.len()]),
            queue: Mutex::new(VecDeque::new()),
            requests: AtomicUsize::new(0),
        };

        let mut resumed = 0;
        for (pos, segment) in segments.iter().enumerate() {
            match self.stored_len(&run, segment).await {
                Some(bytes) => {
                    run.set_state(pos, SegmentState::Complete { bytes });
                    resumed += 1;
                }
                None => run.queue.lock().push_back(pos),
            }
        }

        (self.events)(PipelineEvent::FetchStarted {
            item: item.to_string(),
            total: segments.len(),
            resumed,
        });
        if resumed > 0 {
            info!(resumed, "Resuming with segments already on disk");
        }

        let pending = run.queue.lock().len();
        let workers = self.concurrency.min(pending);
        futures::future::join_all((0..workers).map(|id| self.worker(id, &run))).await;

        let states = run.states.into_inner();
        let failed = states
            .iter()
            .filter(|s| matches!(s, SegmentState::Failed { .. }))
            .count();
        if failed > 0 {
            return Err(AssemblyError::SourceItemBlocked {
                item: item.to_string(),
                failed,
                total: segments.len(),
            });
        }

        let mut files = Vec::with_capacity(segments.len());
        for (segment, state) in segments.iter().zip(&states) {
            match state {
                SegmentState::Complete { bytes } => files.push(FetchedSegment {
                    index: segment.index,
                    sequence: segment.sequence,
                    path: dest.join(segment_file_name(segment)),
                    bytes: *bytes,
                }),
                _ => return Err(AssemblyError::Cancelled),
            }
        }

        let requests = run.requests.load(Ordering::Relaxed);
        debug!(completed = files.len(), resumed, requests, "Segment fetch finished");
        Ok(FetchReport {
            total: segments.len(),
            completed: files.len(),
            resumed,
            requests,
            files,
        })
    }

    /// Length of a stored segment when it can be trusted without a request.
    ///
    /// A manifest entry recorded for another URI or byte range (a different rendition
    /// picked on an earlier run) is dropped along with its file.
    async fn stored_len(&self, run: &FetchRun<'_>, segment: &Segment) -> Option<u64> {
        let path = run.dest.join(segment_file_name(segment));
        let on_disk = tokio::fs::metadata(&path).await.ok()?.len();
        let expected = match run.manifest.recorded(segment.index).await {
            Some(entry) if entry.describes(segment) => entry.bytes,
            Some(entry) => {
                debug!(
                    index = segment.index,
                    stored = %entry.uri,
                    current = %segment.uri,
                    "Stored segment came from another resource, fetching again"
                );
                self.discard_stored(run, segment, &path).await;
                return None;
            }
            None => segment.byte_length()?,
        };
        if on_disk == expected {
            Some(on_disk)
        } else {
            debug!(
                index = segment.index,
                on_disk, expected, "Stored segment length mismatch, fetching again"
            );
            self.discard_stored(run, segment, &path).await;
            None
        }
    }

    async fn discard_stored(&self, run: &FetchRun<'_>, segment: &Segment, path: &Path) {
        if let Err(e) = run.manifest.forget(segment.index).await {
            warn!(index = segment.index, error = %e, "Failed to update segment manifest");
        }
        if let Err(e) = tokio::fs::remove_file(path).await {
            debug!(index = segment.index, error = %e, "Could not remove stale segment");
        }
    }

    async fn worker(&self, id: usize, run: &FetchRun<'_>) {
        let pacer = Pacer::new(self.request_delay);

        loop {
            if self.token.is_cancelled() {
                debug!(worker = id, "Cancelled, not scheduling further segments");
                break;
            }
            let Some(pos) = run.queue.lock().pop_front() else {
                break;
            };
            let segment = &run.segments[pos];
            let path = run.dest.join(segment_file_name(segment));
            run.set_state(pos, SegmentState::InFlight);

            let pacer_ref = &pacer;
            let path_ref = &path;
            let result = retry_with_backoff(&self.retry, &self.token, move |attempt| async move {
                if attempt > 0 {
                    run.set_state(pos, SegmentState::Retrying { attempt });
                    (self.events)(PipelineEvent::SegmentRetrying {
                        item: run.item.to_string(),
                        index: segment.index,
                        attempt,
                    });
                }
                pacer_ref.ready().await;
                run.requests.fetch_add(1, Ordering::Relaxed);
                RetryAction::from_result(self.download(segment, path_ref).await)
            })
            .await;

            match result {
                Ok(bytes) => {
                    if let Err(e) = run.manifest.record(segment, bytes).await {
                        warn!(index = segment.index, error = %e, "Failed to update segment manifest");
                    }
                    run.set_state(pos, SegmentState::Complete { bytes });
                    (self.events)(PipelineEvent::SegmentCompleted {
                        item: run.item.to_string(),
                        index: segment.index,
                        bytes,
                    });
                }
                Err(AssemblyError::Cancelled) => {
                    run.set_state(pos, SegmentState::Pending);
                }
                Err(e) => {
                    warn!(worker = id, index = segment.index, error = %e, "Segment failed");
                    let reason = e.to_string();
                    (self.events)(PipelineEvent::SegmentFailed {
                        item: run.item.to_string(),
                        index: segment.index,
                        reason: reason.clone(),
                    });
                    run.set_state(pos, SegmentState::Failed { reason });
                }
            }
        }
    }

    async fn download(&self, segment: &Segment, path: &Path) -> Result<u64> {
        let fetched = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(AssemblyError::Cancelled),
            fetched = self.source.fetch(&segment.uri, segment.byte_range) => fetched,
        };
        let body = fetched.map_err(|e| match e {
            AssemblyError::Cancelled => e,
            other => AssemblyError::SegmentFetch {
                sequence: segment.sequence,
                url: segment.uri.to_string(),
                retryable: other.is_retryable(),
                reason: other.to_string(),
            },
        })?;

        let received = body.len() as u64;
        if let Some(expected) = segment.byte_length() {
            if received != expected {
                return Err(AssemblyError::SegmentFetch {
                    sequence: segment.sequence,
                    url: segment.uri.to_string(),
                    reason: format!("expected {expected} bytes, received {received}"),
                    retryable: true,
                });
            }
        }

        let part = part_path(path);
        tokio::fs::write(&part, &body).await?;
        tokio::fs::rename(&part, path).await?;
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::ByteRange;
    use async_trait::async_trait;
    use bytes::Bytes;
    use reqwest::StatusCode;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::Notify;
    use url::Url;

    /// Serves canned bodies; scripted statuses are consumed before the body is served.
    /// Requests for held URLs never answer.
    #[derive(Default)]
    struct ScriptedSource {
        bodies: HashMap<String, Bytes>,
        failures: Mutex<HashMap<String, Vec<StatusCode>>>,
        calls: Mutex<Vec<(String, Instant)>>,
        held: HashSet<String>,
        held_started: AtomicUsize,
        started: Notify,
    }

    impl ScriptedSource {
        fn with_segments(count: u64) -> Self {
            Self::serving("item", count, |i| format!("segment-{i}"))
        }

        fn serving(rendition: &str, count: u64, body: impl Fn(u64) -> String) -> Self {
            let bodies = (0..count)
                .map(|i| (rendition_url(rendition, i).to_string(), Bytes::from(body(i))))
                .collect();
            Self {
                bodies,
                ..Default::default()
            }
        }

        fn hold(mut self, index: u64) -> Self {
            self.held.insert(segment_url(index).to_string());
            self
        }

        /// Resolves once `count` held requests are waiting.
        async fn held_in_flight(&self, count: usize) {
            while self.held_started.load(Ordering::SeqCst) < count {
                self.started.notified().await;
            }
        }

        fn requested_urls(&self) -> Vec<String> {
            let mut urls: Vec<_> = self.calls.lock().iter().map(|(url, _)| url.clone()).collect();
            urls.sort();
            urls
        }

        fn fail(self, index: u64, statuses: &[StatusCode]) -> Self {
            self.failures
                .lock()
                .insert(segment_url(index).to_string(), statuses.to_vec());
            self
        }

        fn request_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl RemoteSource for ScriptedSource {
        async fn fetch(&self, url: &Url, _range: Option<ByteRange>) -> Result<Bytes> {
            self.calls.lock().push((url.to_string(), Instant::now()));
            if self.held.contains(url.as_str()) {
                self.held_started.fetch_add(1, Ordering::SeqCst);
                self.started.notify_one();
                std::future::pending::<()>().await;
            }
            if let Some(statuses) = self.failures.lock().get_mut(url.as_str()) {
                if !statuses.is_empty() {
                    let status = statuses.remove(0);
                    return Err(AssemblyError::http_status(status, url.as_str()));
                }
            }
            self.bodies
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| AssemblyError::http_status(StatusCode::NOT_FOUND, url.as_str()))
        }
    }

    fn rendition_url(rendition: &str, index: u64) -> Url {
        Url::parse(&format!("https://cdn.example/{rendition}/seg{index}.ts")).unwrap()
    }

    fn segment_url(index: u64) -> Url {
        rendition_url("item", index)
    }

    fn rendition_segments(rendition: &str, count: u64) -> Vec<Segment> {
        (0..count)
            .map(|i| Segment {
                index: i,
                sequence: 100 + i,
                uri: rendition_url(rendition, i),
                duration_hint: Duration::from_secs(6),
                byte_range: None,
            })
            .collect()
    }

    fn segments(count: u64) -> Vec<Segment> {
        rendition_segments("item", count)
    }

    fn config(concurrency: usize) -> FetchConfig {
        FetchConfig {
            concurrency,
            request_delay_ms: 0,
            max_retries: 3,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            retry_jitter: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn writes_one_file_per_segment() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::with_segments(5));
        let fetcher = SegmentFetcher::new(source.clone(), &config(3), CancellationToken::new());

        let report = fetcher.fetch_all("lecture", &segments(5), dir.path()).await.unwrap();
        assert_eq!(report.completed, 5);
        assert_eq!(report.requests, 5);
        assert_eq!(report.files[2].sequence, 102);
        let body = std::fs::read(dir.path().join("000002.ts")).unwrap();
        assert_eq!(body, b"segment-2");
        assert!(!dir.path().join("000002.ts.part").exists());
    }

    #[tokio::test]
    async fn rerun_makes_no_requests_for_stored_segments() {
        let dir = tempfile::tempdir().unwrap();
        let first = Arc::new(ScriptedSource::with_segments(4));
        SegmentFetcher::new(first, &config(2), CancellationToken::new())
            .fetch_all("lecture", &segments(4), dir.path())
            .await
            .unwrap();

        let second = Arc::new(ScriptedSource::with_segments(4));
        let report = SegmentFetcher::new(second.clone(), &config(2), CancellationToken::new())
            .fetch_all("lecture", &segments(4), dir.path())
            .await
            .unwrap();
        assert_eq!(report.resumed, 4);
        assert_eq!(report.requests, 0);
        assert_eq!(second.request_count(), 0);
    }

    #[tokio::test]
    async fn rerun_against_other_rendition_fetches_again() {
        let dir = tempfile::tempdir().unwrap();
        SegmentFetcher::new(
            Arc::new(ScriptedSource::with_segments(3)),
            &config(2),
            CancellationToken::new(),
        )
        .fetch_all("lecture", &segments(3), dir.path())
        .await
        .unwrap();

        // same lengths, different resources
        let upgraded = Arc::new(ScriptedSource::serving("hi", 3, |i| format!("SEGMENT-{i}")));
        let report = SegmentFetcher::new(upgraded.clone(), &config(2), CancellationToken::new())
            .fetch_all("lecture", &rendition_segments("hi", 3), dir.path())
            .await
            .unwrap();
        assert_eq!(report.resumed, 0);
        assert_eq!(report.requests, 3);
        assert_eq!(upgraded.request_count(), 3);
        assert_eq!(std::fs::read(dir.path().join("000001.ts")).unwrap(), b"SEGMENT-1");

        let manifest = SegmentManifest::load(dir.path()).await;
        let entry = manifest.recorded(1).await.unwrap();
        assert_eq!(entry.uri, rendition_url("hi", 1).as_str());
    }

    #[tokio::test]
    async fn truncated_file_is_fetched_again() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::with_segments(2));
        SegmentFetcher::new(source.clone(), &config(1), CancellationToken::new())
            .fetch_all("lecture", &segments(2), dir.path())
            .await
            .unwrap();
        std::fs::write(dir.path().join("000001.ts"), b"seg").unwrap();

        let source = Arc::new(ScriptedSource::with_segments(2));
        let report = SegmentFetcher::new(source.clone(), &config(1), CancellationToken::new())
            .fetch_all("lecture", &segments(2), dir.path())
            .await
            .unwrap();
        assert_eq!(report.resumed, 1);
        assert_eq!(source.request_count(), 1);
        assert_eq!(std::fs::read(dir.path().join("000001.ts")).unwrap(), b"segment-1");
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(
            ScriptedSource::with_segments(3)
                .fail(1, &[StatusCode::SERVICE_UNAVAILABLE, StatusCode::BAD_GATEWAY]),
        );
        let report = SegmentFetcher::new(source.clone(), &config(2), CancellationToken::new())
            .fetch_all("lecture", &segments(3), dir.path())
            .await
            .unwrap();
        assert_eq!(report.completed, 3);
        assert_eq!(report.requests, 5);
    }

    #[tokio::test]
    async fn terminal_failure_blocks_item() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::with_segments(3).fail(1, &[StatusCode::FORBIDDEN]));
        let err = SegmentFetcher::new(source.clone(), &config(1), CancellationToken::new())
            .fetch_all("lecture", &segments(3), dir.path())
            .await
            .unwrap_err();
        match err {
            AssemblyError::SourceItemBlocked { item, failed, total } => {
                assert_eq!(item, "lecture");
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // 403 is not retried, the other segments still land on disk
        assert_eq!(source.request_count(), 3);
        assert!(dir.path().join("000000.ts").exists());
        assert!(dir.path().join("000002.ts").exists());
    }

    #[tokio::test]
    async fn exhausted_retries_block_item() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(
            ScriptedSource::with_segments(1).fail(0, &[StatusCode::INTERNAL_SERVER_ERROR; 10]),
        );
        let err = SegmentFetcher::new(source.clone(), &config(1), CancellationToken::new())
            .fetch_all("lecture", &segments(1), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AssemblyError::SourceItemBlocked { failed: 1, .. }));
        assert_eq!(source.request_count(), 4);
    }

    #[tokio::test]
    async fn cancelled_run_schedules_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::with_segments(3));
        let token = CancellationToken::new();
        token.cancel();
        let err = SegmentFetcher::new(source.clone(), &config(2), token)
            .fetch_all("lecture", &segments(3), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AssemblyError::Cancelled));
        assert_eq!(source.request_count(), 0);
    }

    #[tokio::test]
    async fn cancel_mid_run_leaves_interrupted_segments_for_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::with_segments(4).hold(2).hold(3));
        let token = CancellationToken::new();
        let fetcher = SegmentFetcher::new(source.clone(), &config(2), token.clone());
        let list = segments(4);

        let cancel_once_held = async {
            source.held_in_flight(2).await;
            token.cancel();
        };
        let (result, ()) = tokio::join!(fetcher.fetch_all("lecture", &list, dir.path()), cancel_once_held);

        assert!(matches!(result, Err(AssemblyError::Cancelled)));
        assert!(dir.path().join("000000.ts").exists());
        assert!(dir.path().join("000001.ts").exists());
        for name in ["000002.ts", "000003.ts"] {
            assert!(!dir.path().join(name).exists(), "{name} should not look complete");
        }

        let second = Arc::new(ScriptedSource::with_segments(4));
        let report = SegmentFetcher::new(second.clone(), &config(2), CancellationToken::new())
            .fetch_all("lecture", &list, dir.path())
            .await
            .unwrap();
        assert_eq!(report.completed, 4);
        assert_eq!(report.resumed, 2);
        assert_eq!(report.requests, 2);
        assert_eq!(
            second.requested_urls(),
            vec![segment_url(2).to_string(), segment_url(3).to_string()]
        );
        assert_eq!(std::fs::read(dir.path().join("000003.ts")).unwrap(), b"segment-3");
    }

    #[tokio::test(start_paused = true)]
    async fn worker_spaces_out_request_starts() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::with_segments(4));
        let config = FetchConfig {
            request_delay_ms: 1_000,
            ..config(1)
        };
        SegmentFetcher::new(source.clone(), &config, CancellationToken::new())
            .fetch_all("lecture", &segments(4), dir.path())
            .await
            .unwrap();

        let calls = source.calls.lock();
        assert_eq!(calls.len(), 4);
        for pair in calls.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn byte_length_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::with_segments(1));
        let mut list = segments(1);
        list[0].byte_range = Some(ByteRange {
            offset: 0,
            length: 4_096,
        });
        let err = SegmentFetcher::new(source.clone(), &config(1), CancellationToken::new())
            .fetch_all("lecture", &list, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AssemblyError::SourceItemBlocked { .. }));
        assert_eq!(source.request_count(), 4);
        assert!(!dir.path().join("000000.ts").exists());
    }
}
