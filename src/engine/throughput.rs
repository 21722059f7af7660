use crate::engine::streams::StreamManager;
use crate::model::{Direction, TestEvent};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

const TICK: Duration = Duration::from_millis(100);
/// Rolling window the current-throughput reading is computed over.
const WINDOW: Duration = Duration::from_secs(1);

#[derive(Default)]
struct DirectionWindow {
    samples: VecDeque<(Instant, u64)>,
}

impl DirectionWindow {
    fn push(&mut self, at: Instant, total: u64) {
        self.samples.push_back((at, total));
        while let Some(&(front, _)) = self.samples.front() {
            if at.duration_since(front) > WINDOW && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn mbps(&self) -> Option<f64> {
        let (first_t, first_b) = *self.samples.front()?;
        let (last_t, last_b) = *self.samples.back()?;
        let dt = last_t.duration_since(first_t).as_secs_f64();
        if dt <= 0.0 {
            return None;
        }
        let bytes = last_b.saturating_sub(first_b);
        Some((bytes as f64 * 8.0) / dt / 1_000_000.0)
    }

    fn instant_bps(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let (t0, b0) = self.samples[n - 2];
        let (t1, b1) = self.samples[n - 1];
        let dt = t1.duration_since(t0).as_secs_f64().max(1e-9);
        (b1.saturating_sub(b0) as f64) / dt
    }
}

/// Aggregates the manager's per-direction byte totals on a 100 ms tick and
/// serves Mbps over the most recent window. Workers are the only writers of
/// the totals, and they stop crediting at termination, so a tick after
/// `terminate_all_streams` reads a frozen value.
pub struct ThroughputTracker {
    manager: Arc<StreamManager>,
    download: Mutex<DirectionWindow>,
    upload: Mutex<DirectionWindow>,
    stop: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThroughputTracker {
    pub fn new(manager: Arc<StreamManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            download: Mutex::new(DirectionWindow::default()),
            upload: Mutex::new(DirectionWindow::default()),
            stop: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    fn window(&self, direction: Direction) -> &Mutex<DirectionWindow> {
        match direction {
            Direction::Download => &self.download,
            Direction::Upload => &self.upload,
        }
    }

    pub fn start(self: &Arc<Self>, event_tx: UnboundedSender<TestEvent>) {
        let tracker = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while !tracker.stop.load(Ordering::Relaxed) {
                ticker.tick().await;
                tracker.sample_once(&event_tx);
            }
        });
        *self.handle.lock().expect("tracker handle poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.lock().expect("tracker handle poisoned").take() {
            h.abort();
        }
    }

    fn sample_once(&self, event_tx: &UnboundedSender<TestEvent>) {
        let now = Instant::now();
        for direction in [Direction::Download, Direction::Upload] {
            let total = self.manager.total_bytes(direction);
            let bps = {
                let mut w = self.window(direction).lock().expect("window poisoned");
                w.push(now, total);
                w.instant_bps()
            };
            let _ = event_tx.send(TestEvent::ThroughputTick {
                direction,
                bytes_total: total,
                bps_instant: bps,
            });
        }
    }

    /// Mbps over the most recent window, or None until two ticks have been
    /// observed (callers fall back to their own counter deltas).
    pub fn window_mbps(&self, direction: Direction) -> Option<f64> {
        self.window(direction)
            .lock()
            .expect("window poisoned")
            .mbps()
    }

    #[cfg(test)]
    fn push_sample(&self, direction: Direction, at: Instant, total: u64) {
        self.window(direction)
            .lock()
            .expect("window poisoned")
            .push(at, total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::server::TestServerClient;
    use crate::model::{PhaseDurations, ProbeConfig, RunConfig, WarmupConfig};
    use tokio::sync::mpsc;

    fn tracker() -> Arc<ThroughputTracker> {
        let cfg = RunConfig {
            base_url: "http://127.0.0.1:9".into(),
            ping_base_url: None,
            meas_id: "test".into(),
            user_agent: "bufferbloat-cli/test".into(),
            phases: PhaseDurations::default(),
            warmup: WarmupConfig::default(),
            probe: ProbeConfig::default(),
        };
        let client = TestServerClient::new(&cfg).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        ThroughputTracker::new(StreamManager::new(client, tx))
    }

    #[tokio::test]
    async fn window_mbps_needs_two_samples() {
        let t = tracker();
        assert!(t.window_mbps(Direction::Download).is_none());
        t.push_sample(Direction::Download, Instant::now(), 0);
        assert!(t.window_mbps(Direction::Download).is_none());
    }

    #[tokio::test]
    async fn window_mbps_computes_rate_over_window() {
        let t = tracker();
        let t0 = Instant::now();
        // 1_250_000 bytes over one second is 10 Mbit.
        t.push_sample(Direction::Upload, t0, 0);
        t.push_sample(Direction::Upload, t0 + Duration::from_secs(1), 1_250_000);
        let mbps = t.window_mbps(Direction::Upload).unwrap();
        assert!((mbps - 10.0).abs() < 0.1, "mbps was {mbps}");
    }

    #[tokio::test]
    async fn directions_are_independent() {
        let t = tracker();
        let t0 = Instant::now();
        t.push_sample(Direction::Download, t0, 0);
        t.push_sample(Direction::Download, t0 + Duration::from_millis(500), 5_000_000);
        assert!(t.window_mbps(Direction::Download).unwrap() > 1.0);
        assert!(t.window_mbps(Direction::Upload).is_none());
    }

    #[tokio::test]
    async fn frozen_totals_read_as_zero_rate() {
        let t = tracker();
        let t0 = Instant::now();
        t.push_sample(Direction::Download, t0, 9_000);
        t.push_sample(Direction::Download, t0 + Duration::from_millis(100), 9_000);
        t.push_sample(Direction::Download, t0 + Duration::from_millis(200), 9_000);
        assert_eq!(t.window_mbps(Direction::Download).unwrap(), 0.0);
    }
}
