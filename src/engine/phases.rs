use crate::engine::streams::StreamManager;
use crate::model::{PhaseDurations, PhaseRecord, TestEvent, TestPhase};
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    Start,
    End,
}

/// Broadcast to in-process subscribers (the warmup engine arms
/// force-termination off these); the UI event channel gets the same
/// information as `TestEvent`s.
#[derive(Debug, Clone, Copy)]
pub struct PhaseEvent {
    pub transition: PhaseTransition,
    pub phase: TestPhase,
    pub elapsed_ms: u64,
    pub total_elapsed_ms: u64,
}

/// Barrier timing. Tests shrink these; production uses the defaults.
#[derive(Debug, Clone, Copy)]
pub struct BarrierTuning {
    pub quiesce: Duration,
    pub verify_attempts: u32,
    pub verify_base_delay: Duration,
}

impl Default for BarrierTuning {
    fn default() -> Self {
        Self {
            quiesce: Duration::from_millis(200),
            verify_attempts: 15,
            verify_base_delay: Duration::from_millis(100),
        }
    }
}

struct ControllerState {
    test_start: Option<Instant>,
    current: Option<(TestPhase, Instant)>,
    transitioning: bool,
}

/// Sequences test phases and enforces the phase barrier: terminate all
/// streams, wait for network quiescence, verify the registry drained.
/// The barrier never errors; on verification failure it falls back to an
/// emergency registry reset.
pub struct PhaseController {
    manager: Arc<StreamManager>,
    durations: PhaseDurations,
    tuning: BarrierTuning,
    event_tx: UnboundedSender<TestEvent>,
    phase_tx: broadcast::Sender<PhaseEvent>,
    state: Mutex<ControllerState>,
    history: Mutex<Vec<PhaseRecord>>,
    phase_cell: Arc<Mutex<Option<TestPhase>>>,
}

impl PhaseController {
    pub fn new(
        manager: Arc<StreamManager>,
        durations: PhaseDurations,
        event_tx: UnboundedSender<TestEvent>,
    ) -> Arc<Self> {
        Self::with_tuning(manager, durations, event_tx, BarrierTuning::default())
    }

    pub fn with_tuning(
        manager: Arc<StreamManager>,
        durations: PhaseDurations,
        event_tx: UnboundedSender<TestEvent>,
        tuning: BarrierTuning,
    ) -> Arc<Self> {
        let (phase_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            manager,
            durations,
            tuning,
            event_tx,
            phase_tx,
            state: Mutex::new(ControllerState {
                test_start: None,
                current: None,
                transitioning: false,
            }),
            history: Mutex::new(Vec::new()),
            phase_cell: Arc::new(Mutex::new(None)),
        })
    }

    pub fn initialize(&self, test_start: Instant) {
        let mut state = self.state.lock().expect("phase state poisoned");
        state.test_start = Some(test_start);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhaseEvent> {
        self.phase_tx.subscribe()
    }

    /// Shared cell holding the phase currently in flight; the latency probe
    /// reads it to tag samples.
    pub fn phase_cell(&self) -> Arc<Mutex<Option<TestPhase>>> {
        self.phase_cell.clone()
    }

    pub fn current_phase(&self) -> Option<TestPhase> {
        self.state
            .lock()
            .expect("phase state poisoned")
            .current
            .map(|(p, _)| p)
    }

    pub fn phase_elapsed(&self) -> Option<Duration> {
        self.state
            .lock()
            .expect("phase state poisoned")
            .current
            .map(|(_, started)| started.elapsed())
    }

    /// Budget left in the current phase; the upload warmup derives its
    /// deadline from this.
    pub fn phase_remaining(&self) -> Option<Duration> {
        self.state
            .lock()
            .expect("phase state poisoned")
            .current
            .map(|(phase, started)| {
                self.durations
                    .for_phase(phase)
                    .saturating_sub(started.elapsed())
            })
    }

    pub fn total_elapsed(&self) -> Duration {
        self.state
            .lock()
            .expect("phase state poisoned")
            .test_start
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub fn history(&self) -> Vec<PhaseRecord> {
        self.history.lock().expect("phase history poisoned").clone()
    }

    /// Transition into `phase`. A phase already active is ended first; the
    /// barrier runs exactly once per transition. Returns the barrier
    /// verdict: `false` means the emergency reset fired, and the new
    /// phase still starts.
    pub async fn start_phase(&self, phase: TestPhase) -> bool {
        self.seal_current();
        self.enter_transition();
        let clean = self.run_barrier().await;

        let now = Instant::now();
        let total_elapsed_ms = {
            let mut state = self.state.lock().expect("phase state poisoned");
            if state.test_start.is_none() {
                state.test_start = Some(now);
            }
            state.transitioning = false;
            state.current = Some((phase, now));
            state
                .test_start
                .map(|t| now.duration_since(t).as_millis() as u64)
                .unwrap_or(0)
        };
        *self.phase_cell.lock().expect("phase cell poisoned") = Some(phase);
        self.history
            .lock()
            .expect("phase history poisoned")
            .push(PhaseRecord {
                phase,
                started_at_ms: total_elapsed_ms,
                ended_at_ms: None,
            });

        debug!("phase {} started (barrier clean: {clean})", phase.as_str());
        let _ = self.phase_tx.send(PhaseEvent {
            transition: PhaseTransition::Start,
            phase,
            elapsed_ms: 0,
            total_elapsed_ms,
        });
        let _ = self.event_tx.send(TestEvent::PhaseStarted {
            phase,
            total_elapsed_ms,
        });
        clean
    }

    /// End the active phase and return to idle through the barrier.
    /// A no-op when idle.
    pub async fn end_phase(&self) -> bool {
        if !self.seal_current() {
            return true;
        }
        self.enter_transition();
        let clean = self.run_barrier().await;
        let mut state = self.state.lock().expect("phase state poisoned");
        state.transitioning = false;
        clean
    }

    /// Seal the active phase record and emit its end events. Returns false
    /// when no phase was active.
    fn seal_current(&self) -> bool {
        let (phase, started, total_elapsed_ms) = {
            let mut state = self.state.lock().expect("phase state poisoned");
            let Some((phase, started)) = state.current.take() else {
                return false;
            };
            let total = state
                .test_start
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0);
            (phase, started, total)
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        {
            let mut history = self.history.lock().expect("phase history poisoned");
            if let Some(record) = history
                .iter_mut()
                .rev()
                .find(|r| r.phase == phase && r.ended_at_ms.is_none())
            {
                record.ended_at_ms = Some(total_elapsed_ms);
            }
        }

        let _ = self.phase_tx.send(PhaseEvent {
            transition: PhaseTransition::End,
            phase,
            elapsed_ms,
            total_elapsed_ms,
        });
        let _ = self.event_tx.send(TestEvent::PhaseEnded {
            phase,
            elapsed_ms,
            total_elapsed_ms,
        });
        debug!("phase {} ended after {elapsed_ms} ms", phase.as_str());
        true
    }

    fn enter_transition(&self) {
        let mut state = self.state.lock().expect("phase state poisoned");
        state.transitioning = true;
        drop(state);
        *self.phase_cell.lock().expect("phase cell poisoned") = None;
    }

    /// The phase barrier: terminate, quiesce, verify-drained. Verification
    /// retries with exponentially widening delays and re-terminates on the
    /// next-to-last attempt; exhaustion triggers the emergency reset.
    async fn run_barrier(&self) -> bool {
        self.manager.terminate_all_streams().await;
        tokio::time::sleep(self.tuning.quiesce).await;

        for attempt in 0..self.tuning.verify_attempts {
            if self.manager.active_stream_counts().total == 0 {
                return true;
            }
            if attempt == self.tuning.verify_attempts.saturating_sub(2) {
                self.manager.terminate_all_streams().await;
            }
            let delay = self
                .tuning
                .verify_base_delay
                .mul_f64(1.5f64.powi(attempt as i32));
            tokio::time::sleep(delay).await;
        }

        if self.manager.active_stream_counts().total == 0 {
            return true;
        }
        let counts = self.manager.active_stream_counts();
        warn!(
            "phase barrier verification failed with {} residual streams; resetting registry",
            counts.total
        );
        self.manager.reset_registry();
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::server::TestServerClient;
    use crate::engine::streams::DownloadStreamOpts;
    use crate::model::{ProbeConfig, RunConfig, StreamKind, WarmupConfig};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    fn fixture() -> (
        Arc<StreamManager>,
        Arc<PhaseController>,
        mpsc::UnboundedReceiver<TestEvent>,
    ) {
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
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = StreamManager::new(client, tx.clone());
        let tuning = BarrierTuning {
            quiesce: Duration::from_millis(10),
            verify_attempts: 5,
            verify_base_delay: Duration::from_millis(5),
        };
        let controller = PhaseController::with_tuning(
            manager.clone(),
            PhaseDurations::default(),
            tx,
            tuning,
        );
        (manager, controller, rx)
    }

    #[tokio::test]
    async fn start_phase_sets_current_and_drains_streams() {
        let (manager, controller, _rx) = fixture();
        controller.initialize(Instant::now());

        manager.create_download_stream(DownloadStreamOpts {
            kind: StreamKind::Warmup,
            ..Default::default()
        });
        manager.create_download_stream(DownloadStreamOpts {
            kind: StreamKind::Warmup,
            ..Default::default()
        });

        let clean = controller.start_phase(TestPhase::DownloadWarmup).await;
        assert!(clean);
        assert_eq!(
            controller.current_phase(),
            Some(TestPhase::DownloadWarmup)
        );
        assert_eq!(manager.active_stream_counts().total, 0);
    }

    #[tokio::test]
    async fn phase_history_records_and_seals() {
        let (_manager, controller, _rx) = fixture();
        controller.initialize(Instant::now());

        controller.start_phase(TestPhase::Baseline).await;
        controller.start_phase(TestPhase::DownloadWarmup).await;
        controller.end_phase().await;

        let history = controller.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].phase, TestPhase::Baseline);
        assert!(history[0].ended_at_ms.is_some());
        assert_eq!(history[1].phase, TestPhase::DownloadWarmup);
        assert!(history[1].ended_at_ms.is_some());
        assert_eq!(controller.current_phase(), None);
    }

    #[tokio::test]
    async fn a_phase_can_be_reentered() {
        let (_manager, controller, _rx) = fixture();
        controller.initialize(Instant::now());

        controller.start_phase(TestPhase::Baseline).await;
        controller.end_phase().await;
        controller.start_phase(TestPhase::Baseline).await;
        assert_eq!(controller.current_phase(), Some(TestPhase::Baseline));
        assert_eq!(controller.history().len(), 2);
    }

    #[tokio::test]
    async fn end_phase_when_idle_is_a_noop() {
        let (_manager, controller, _rx) = fixture();
        controller.initialize(Instant::now());
        assert!(controller.end_phase().await);
        assert!(controller.history().is_empty());
    }

    #[tokio::test]
    async fn transitions_are_broadcast() {
        let (_manager, controller, _rx) = fixture();
        controller.initialize(Instant::now());
        let mut events = controller.subscribe();

        controller.start_phase(TestPhase::UploadSaturation).await;
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.transition, PhaseTransition::Start);
        assert_eq!(ev.phase, TestPhase::UploadSaturation);

        controller.end_phase().await;
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.transition, PhaseTransition::End);
        assert_eq!(ev.phase, TestPhase::UploadSaturation);
    }

    #[tokio::test]
    async fn barrier_resets_registry_when_streams_keep_appearing() {
        let (manager, controller, mut rx) = fixture();
        controller.initialize(Instant::now());

        // Adversarial spawner that keeps refilling the registry while the
        // barrier verifies, defeating every re-terminate.
        let stop = Arc::new(AtomicBool::new(false));
        let spawner = {
            let manager = manager.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                while !stop.load(Ordering::Relaxed) {
                    manager.create_download_stream(DownloadStreamOpts {
                        kind: StreamKind::Discovery,
                        ..Default::default()
                    });
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };

        let clean = controller.start_phase(TestPhase::Baseline).await;
        assert!(!clean, "barrier should report the emergency path");

        stop.store(true, Ordering::Relaxed);
        let _ = spawner.await;
        manager.terminate_all_streams().await;

        let saw_reset = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|ev| matches!(ev, TestEvent::RegistryReset { .. }));
        assert!(saw_reset);
        // The phase still starts after the emergency reset.
        assert_eq!(controller.current_phase(), Some(TestPhase::Baseline));
    }
}
