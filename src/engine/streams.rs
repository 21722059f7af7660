use crate::engine::payload::PayloadPool;
use crate::engine::server::TestServerClient;
use crate::model::{ConfigCandidate, Direction, StreamKind, TestEvent};
use bytes::Bytes;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Bounded wait for a worker to observe its stop flag before the task is
/// aborted outright.
const TERMINATION_GRACE: Duration = Duration::from_secs(1);
/// Per-POST cap; a chunk that exceeds it counts zero bytes and the window
/// refills.
const UPLOAD_CHUNK_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause after a failed request so a dead server does not spin the worker.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct DownloadStreamOpts {
    pub kind: StreamKind,
    /// Stop after this many bytes (speed-probe mode).
    pub target_bytes: Option<u64>,
    pub max_duration: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct UploadStreamOpts {
    pub kind: StreamKind,
    /// In-flight POST window for this worker.
    pub pending_uploads: usize,
    pub stream_index: usize,
    pub target_bytes: Option<u64>,
    pub max_duration: Option<Duration>,
}

/// Shared state of one transfer stream. The worker task is the only writer
/// of `bytes`/`last_activity`; termination paths are the only writers of
/// `stop`/`terminated`.
pub struct StreamRecord {
    pub id: u64,
    pub direction: Direction,
    pub kind: StreamKind,
    pub created_at: Instant,
    last_activity_ms: AtomicU64,
    bytes: AtomicU64,
    stop: AtomicBool,
    terminated: AtomicBool,
}

impl StreamRecord {
    fn new(id: u64, direction: Direction, kind: StreamKind) -> Self {
        Self {
            id,
            direction,
            kind,
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Relaxed)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Credit received/sent bytes to this record and the direction total.
    /// A stopped record refuses credit, so a terminated stream can never
    /// report further bytes.
    fn credit(&self, n: u64, direction_total: &AtomicU64) -> bool {
        if self.stopped() {
            return false;
        }
        self.bytes.fetch_add(n, Ordering::Relaxed);
        direction_total.fetch_add(n, Ordering::Relaxed);
        self.last_activity_ms.store(
            self.created_at.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );
        true
    }
}

struct StreamHandle {
    record: Arc<StreamRecord>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    download: HashMap<u64, StreamHandle>,
    upload: HashMap<u64, StreamHandle>,
}

impl Registry {
    fn map_mut(&mut self, direction: Direction) -> &mut HashMap<u64, StreamHandle> {
        match direction {
            Direction::Download => &mut self.download,
            Direction::Upload => &mut self.upload,
        }
    }

    fn map(&self, direction: Direction) -> &HashMap<u64, StreamHandle> {
        match direction {
            Direction::Download => &self.download,
            Direction::Upload => &self.upload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCounts {
    pub download: usize,
    pub upload: usize,
    pub total: usize,
}

/// Lifecycle registry for concurrent transfer workers and the single
/// source of truth for what is running. Insertions and removals happen
/// under one lock with no await points in between.
pub struct StreamManager {
    client: TestServerClient,
    next_id: AtomicU64,
    registry: Mutex<Registry>,
    download_total: Arc<AtomicU64>,
    upload_total: Arc<AtomicU64>,
    event_tx: UnboundedSender<TestEvent>,
}

impl StreamManager {
    pub fn new(client: TestServerClient, event_tx: UnboundedSender<TestEvent>) -> Arc<Self> {
        Arc::new(Self {
            client,
            next_id: AtomicU64::new(1),
            registry: Mutex::new(Registry::default()),
            download_total: Arc::new(AtomicU64::new(0)),
            upload_total: Arc::new(AtomicU64::new(0)),
            event_tx,
        })
    }

    fn direction_total(&self, direction: Direction) -> &Arc<AtomicU64> {
        match direction {
            Direction::Download => &self.download_total,
            Direction::Upload => &self.upload_total,
        }
    }

    /// Cumulative bytes moved in `direction` across all streams, live and
    /// completed. Monotonic; frozen while no worker is live.
    pub fn total_bytes(&self, direction: Direction) -> u64 {
        self.direction_total(direction).load(Ordering::Relaxed)
    }

    pub fn stream_bytes(&self, id: u64, direction: Direction) -> Option<u64> {
        let registry = self.registry.lock().expect("registry poisoned");
        registry
            .map(direction)
            .get(&id)
            .map(|h| h.record.bytes_transferred())
    }

    pub fn active_streams(&self, direction: Direction) -> Vec<u64> {
        let registry = self.registry.lock().expect("registry poisoned");
        registry.map(direction).keys().copied().collect()
    }

    pub fn active_stream_counts(&self) -> StreamCounts {
        let registry = self.registry.lock().expect("registry poisoned");
        let download = registry.download.len();
        let upload = registry.upload.len();
        StreamCounts {
            download,
            upload,
            total: download + upload,
        }
    }

    pub fn create_download_stream(&self, opts: DownloadStreamOpts) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(StreamRecord::new(id, Direction::Download, opts.kind));
        let task = tokio::spawn(run_download_worker(
            self.client.http.clone(),
            self.client.download_url(),
            record.clone(),
            self.download_total.clone(),
            opts,
        ));
        self.registry
            .lock()
            .expect("registry poisoned")
            .download
            .insert(id, StreamHandle { record, task });
        id
    }

    pub fn create_upload_stream(&self, opts: UploadStreamOpts, chunks: Arc<Vec<Bytes>>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(StreamRecord::new(id, Direction::Upload, opts.kind));
        let task = tokio::spawn(run_upload_worker(
            self.client.http.clone(),
            self.client.upload_url(),
            record.clone(),
            self.upload_total.clone(),
            chunks,
            opts,
        ));
        self.registry
            .lock()
            .expect("registry poisoned")
            .upload
            .insert(id, StreamHandle { record, task });
        id
    }

    /// Convenience: start every stream a candidate calls for. `chunk_size`
    /// is ignored for downloads.
    pub fn launch_config(
        &self,
        payloads: &PayloadPool,
        direction: Direction,
        candidate: ConfigCandidate,
        chunk_size: usize,
        kind: StreamKind,
    ) -> Vec<u64> {
        match direction {
            Direction::Download => (0..candidate.stream_count)
                .map(|_| {
                    self.create_download_stream(DownloadStreamOpts {
                        kind,
                        ..Default::default()
                    })
                })
                .collect(),
            Direction::Upload => {
                let chunks = payloads.chunks(chunk_size);
                (0..candidate.stream_count)
                    .map(|i| {
                        self.create_upload_stream(
                            UploadStreamOpts {
                                kind,
                                pending_uploads: candidate.pending_uploads,
                                stream_index: i,
                                target_bytes: None,
                                max_duration: None,
                            },
                            chunks.clone(),
                        )
                    })
                    .collect()
            }
        }
    }

    /// Fire the stream's stop flag, wait a bounded grace for the task to
    /// exit, then abort it. Removing an unknown id is a no-op, which makes
    /// every termination path idempotent.
    pub async fn terminate_stream(&self, id: u64, direction: Direction) {
        let handle = self
            .registry
            .lock()
            .expect("registry poisoned")
            .map_mut(direction)
            .remove(&id);
        let Some(handle) = handle else { return };

        handle.record.stop.store(true, Ordering::Relaxed);
        handle.record.terminated.store(true, Ordering::Relaxed);
        let mut task = handle.task;
        if tokio::time::timeout(TERMINATION_GRACE, &mut task)
            .await
            .is_err()
        {
            warn!(
                "{} stream {id} did not exit within {TERMINATION_GRACE:?}; aborting",
                direction.as_str()
            );
            task.abort();
        }
        debug!("{} stream {id} terminated", direction.as_str());
    }

    pub async fn terminate_direction(&self, direction: Direction) {
        let ids = self.active_streams(direction);
        futures::future::join_all(
            ids.into_iter()
                .map(|id| self.terminate_stream(id, direction)),
        )
        .await;
    }

    /// Terminate everything, both directions in parallel. Idempotent; on
    /// return both registries are empty.
    pub async fn terminate_all_streams(&self) {
        tokio::join!(
            self.terminate_direction(Direction::Download),
            self.terminate_direction(Direction::Upload),
        );
    }

    /// Emergency cleanup: drop all records without waiting. Used only when
    /// barrier verification fails; dependents resynchronize via the
    /// RegistryReset event.
    pub fn reset_registry(&self) {
        let (download, upload) = {
            let mut registry = self.registry.lock().expect("registry poisoned");
            (
                registry.download.drain().collect::<Vec<_>>(),
                registry.upload.drain().collect::<Vec<_>>(),
            )
        };
        let dropped_download = download.len();
        let dropped_upload = upload.len();
        for (_, handle) in download.into_iter().chain(upload) {
            handle.record.stop.store(true, Ordering::Relaxed);
            handle.record.terminated.store(true, Ordering::Relaxed);
            handle.task.abort();
        }
        if dropped_download + dropped_upload > 0 {
            warn!("registry reset dropped {dropped_download} download / {dropped_upload} upload streams");
        }
        let _ = self.event_tx.send(TestEvent::RegistryReset {
            dropped_download,
            dropped_upload,
        });
    }
}

/// Streaming GET reader. Re-issues the request when the server closes the
/// body (saturation mode); exits on stop, target size, or deadline.
async fn run_download_worker(
    http: reqwest::Client,
    url: reqwest::Url,
    record: Arc<StreamRecord>,
    total: Arc<AtomicU64>,
    opts: DownloadStreamOpts,
) {
    let deadline = opts.max_duration.map(|d| Instant::now() + d);
    let expired = |deadline: Option<Instant>| deadline.is_some_and(|d| Instant::now() >= d);
    let done = |record: &StreamRecord| {
        opts.target_bytes
            .is_some_and(|t| record.bytes_transferred() >= t)
    };

    'outer: while !record.stopped() && !expired(deadline) && !done(&record) {
        let resp = http
            .get(url.clone())
            .header("X-Speed-Test", "true")
            .header("X-Discovery-Phase", record.kind.as_str())
            .send()
            .await;

        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!("download stream {} got {}", record.id, r.status());
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
            Err(e) => {
                debug!("download stream {} failed: {e}", record.id);
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        };

        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let Ok(chunk) = chunk else { break };
            if !record.credit(chunk.len() as u64, &total) {
                break 'outer;
            }
            if expired(deadline) || done(&record) {
                break 'outer;
            }
        }
        // Dropping `body` cancels the in-flight response and releases the
        // connection before the next iteration.
    }
}

/// POST window writer. Keeps up to `pending_uploads` requests in flight,
/// drawing payload chunks cyclically from the shared pool.
async fn run_upload_worker(
    http: reqwest::Client,
    url: reqwest::Url,
    record: Arc<StreamRecord>,
    total: Arc<AtomicU64>,
    chunks: Arc<Vec<Bytes>>,
    opts: UploadStreamOpts,
) {
    if chunks.is_empty() {
        return;
    }
    let window = opts.pending_uploads.max(1);
    let deadline = opts.max_duration.map(|d| Instant::now() + d);
    let expired = |deadline: Option<Instant>| deadline.is_some_and(|d| Instant::now() >= d);
    let done = |record: &StreamRecord| {
        opts.target_bytes
            .is_some_and(|t| record.bytes_transferred() >= t)
    };

    let mut next_chunk = opts.stream_index;
    let mut in_flight = FuturesUnordered::new();

    loop {
        if record.stopped() || expired(deadline) || done(&record) {
            break;
        }

        while in_flight.len() < window {
            let chunk = chunks[next_chunk % chunks.len()].clone();
            next_chunk += 1;
            let len = chunk.len() as u64;
            let req = http
                .post(url.clone())
                .header("Content-Type", "application/octet-stream")
                .header("Connection", "keep-alive")
                .header("Keep-Alive", "timeout=30, max=100")
                .header("Cache-Control", "no-store")
                .header("Pragma", "no-cache")
                .header("Accept-Encoding", "identity")
                .header("X-Speed-Test", "true")
                .header("X-Stream-Index", opts.stream_index.to_string())
                .header("X-Discovery-Phase", record.kind.as_str())
                .timeout(UPLOAD_CHUNK_TIMEOUT)
                .body(chunk);
            in_flight.push(async move {
                match req.send().await {
                    Ok(r) if r.status().is_success() => Ok(len),
                    Ok(r) => Err(format!("upload chunk got {}", r.status())),
                    Err(e) => Err(e.to_string()),
                }
            });
        }

        match in_flight.next().await {
            Some(Ok(len)) => {
                record.credit(len, &total);
            }
            Some(Err(e)) => {
                // Timed-out or failed chunk: zero bytes, refill the window.
                debug!("upload stream {}: {e}", record.id);
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
            None => break,
        }
    }
    // Dropping `in_flight` cancels any outstanding POSTs.
}
