pub mod payload;
pub mod phases;
pub mod probe;
pub mod server;
pub mod streams;
pub mod throughput;
pub mod warmup;

use crate::model::{
    Direction, LatencySummary, RunConfig, RunResult, StreamKind, TestEvent, TestPhase,
    ThroughputSummary, WarmupOutcome,
};
use crate::stats::{latency_summary_from_samples, OnlineStats};
use anyhow::Result;
use log::{info, warn};
use payload::PayloadPool;
use phases::PhaseController;
use probe::LatencyProbe;
use server::TestServerClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use streams::StreamManager;
use throughput::ThroughputTracker;
use tokio::sync::mpsc;
use warmup::WarmupContext;

/// Download warmup gets a fixed slice of its phase; upload derives its
/// deadline from the remaining phase budget instead.
const DOWNLOAD_WARMUP_BUDGET: Duration = Duration::from_millis(5250);
const UPLOAD_WARMUP_BUDGET_SHARE: f64 = 0.8;
const UPLOAD_WARMUP_BUDGET_CAP: Duration = Duration::from_secs(10);
/// Used when the baseline phase produced no RTT sample at all.
const NOMINAL_BASELINE_MS: f64 = 50.0;

const SAMPLE_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub enum EngineControl {
    /// Cancel the test entirely
    Cancel,
}

pub struct TestEngine {
    cfg: RunConfig,
}

impl TestEngine {
    pub fn new(cfg: RunConfig) -> Self {
        Self { cfg }
    }

    pub async fn run(
        self,
        event_tx: mpsc::UnboundedSender<TestEvent>,
        mut control_rx: mpsc::UnboundedReceiver<EngineControl>,
    ) -> Result<RunResult> {
        let client = TestServerClient::new(&self.cfg)?;

        let manager = StreamManager::new(client.clone(), event_tx.clone());
        let tracker = ThroughputTracker::new(manager.clone());
        let controller = PhaseController::new(
            manager.clone(),
            self.cfg.phases.clone(),
            event_tx.clone(),
        );
        let probe = LatencyProbe::new(&client, self.cfg.probe.clone(), controller.phase_cell());
        let payloads = Arc::new(PayloadPool::new());

        let cancel = Arc::new(AtomicBool::new(false));
        let cancel2 = cancel.clone();
        let control_handle = tokio::spawn(async move {
            while let Some(msg) = control_rx.recv().await {
                match msg {
                    EngineControl::Cancel => {
                        cancel2.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            }
        });

        let test_start = Instant::now();
        controller.initialize(test_start);
        tracker.start(event_tx.clone());

        // Phase 1: baseline latency, probe only.
        controller.start_phase(TestPhase::Baseline).await;
        probe.start(event_tx.clone());
        let baseline_start = Instant::now();
        sleep_phase(self.cfg.phases.baseline, &cancel).await;

        let baseline_window = probe.window_since(baseline_start);
        let mut baseline_fallback = false;
        let baseline_ms = match probe.median_rtt_since(baseline_start) {
            Some(ms) => ms,
            None => {
                warn!("no baseline RTT sample; assuming {NOMINAL_BASELINE_MS} ms");
                baseline_fallback = true;
                NOMINAL_BASELINE_MS
            }
        };
        let baseline_latency = window_summary(&baseline_window);
        info!("baseline latency {baseline_ms:.1} ms");

        let wctx = WarmupContext {
            cfg: self.cfg.warmup.clone(),
            manager: manager.clone(),
            tracker: tracker.clone(),
            probe: probe.clone(),
            payloads: payloads.clone(),
            event_tx: event_tx.clone(),
        };

        // Phase 2: download warmup, then stabilize through the phase end.
        controller.start_phase(TestPhase::DownloadWarmup).await;
        let warmup_download = self
            .direction_warmup(
                &wctx,
                &controller,
                Direction::Download,
                baseline_ms,
                Instant::now() + DOWNLOAD_WARMUP_BUDGET,
                &cancel,
            )
            .await;
        sleep_remaining(&controller, &cancel).await;

        // Phase 3: download saturation.
        controller.start_phase(TestPhase::DownloadSaturation).await;
        launch_outcome(&manager, &payloads, &warmup_download, &cancel);
        let (mut dl_summaries, loaded_latency_download) = sample_loaded(
            &tracker,
            &probe,
            &manager,
            &[Direction::Download],
            self.cfg.phases.download_saturation,
            &cancel,
        )
        .await;
        let download = dl_summaries.remove(0);

        // Phase 4: upload warmup.
        controller.start_phase(TestPhase::UploadWarmup).await;
        let upload_deadline = upload_warmup_deadline(&controller);
        let warmup_upload = self
            .direction_warmup(
                &wctx,
                &controller,
                Direction::Upload,
                baseline_ms,
                upload_deadline,
                &cancel,
            )
            .await;
        sleep_remaining(&controller, &cancel).await;

        // Phase 5: upload saturation.
        controller.start_phase(TestPhase::UploadSaturation).await;
        launch_outcome(&manager, &payloads, &warmup_upload, &cancel);
        let (mut ul_summaries, loaded_latency_upload) = sample_loaded(
            &tracker,
            &probe,
            &manager,
            &[Direction::Upload],
            self.cfg.phases.upload_saturation,
            &cancel,
        )
        .await;
        let upload = ul_summaries.remove(0);

        // Phase 6: both directions at once.
        controller.start_phase(TestPhase::Bidirectional).await;
        launch_outcome(&manager, &payloads, &warmup_download, &cancel);
        launch_outcome(&manager, &payloads, &warmup_upload, &cancel);
        let (mut bidi_summaries, loaded_latency_bidirectional) = sample_loaded(
            &tracker,
            &probe,
            &manager,
            &[Direction::Download, Direction::Upload],
            self.cfg.phases.bidirectional,
            &cancel,
        )
        .await;
        let bidirectional_upload = bidi_summaries.remove(1);
        let bidirectional_download = bidi_summaries.remove(0);

        controller.end_phase().await;
        probe.stop();
        tracker.stop();
        manager.terminate_all_streams().await;
        control_handle.abort();
        info!(
            "test completed in {:.1}s",
            controller.total_elapsed().as_secs_f64()
        );

        let warmup_fallback =
            baseline_fallback || warmup_download.fallback || warmup_upload.fallback;

        Ok(RunResult {
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            timestamp_utc: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
            base_url: self.cfg.base_url.clone(),
            meas_id: self.cfg.meas_id.clone(),
            baseline_latency,
            loaded_latency_download,
            loaded_latency_upload,
            loaded_latency_bidirectional,
            download,
            upload,
            bidirectional_download,
            bidirectional_upload,
            warmup_download: Some(warmup_download),
            warmup_upload: Some(warmup_upload),
            warmup_fallback,
            phase_history: controller.history(),
        })
    }

    async fn direction_warmup(
        &self,
        wctx: &WarmupContext,
        controller: &PhaseController,
        direction: Direction,
        baseline_ms: f64,
        deadline: Instant,
        cancel: &AtomicBool,
    ) -> WarmupOutcome {
        if !self.cfg.warmup.enabled || cancel.load(Ordering::Relaxed) {
            return warmup::conservative_outcome(direction);
        }
        warmup::run_warmup(
            wctx,
            direction,
            baseline_ms,
            deadline,
            controller.subscribe(),
        )
        .await
    }
}

/// 80% of what is left of the upload-warmup phase, capped.
fn upload_warmup_deadline(controller: &PhaseController) -> Instant {
    let remaining = controller
        .phase_remaining()
        .unwrap_or(UPLOAD_WARMUP_BUDGET_CAP);
    let budget = remaining
        .mul_f64(UPLOAD_WARMUP_BUDGET_SHARE)
        .min(UPLOAD_WARMUP_BUDGET_CAP);
    Instant::now() + budget
}

/// Start a warmup outcome's optimal configuration as saturation streams.
fn launch_outcome(
    manager: &StreamManager,
    payloads: &PayloadPool,
    outcome: &WarmupOutcome,
    cancel: &AtomicBool,
) {
    if cancel.load(Ordering::Relaxed) {
        return;
    }
    let chunk_size = outcome
        .optimal_chunk_size
        .unwrap_or(payload::MIB);
    manager.launch_config(
        payloads,
        outcome.direction,
        outcome.optimal_config,
        chunk_size,
        StreamKind::Saturation,
    );
}

/// Sample throughput and latency for one saturation window. Returns one
/// ThroughputSummary per requested direction (same order) and the latency
/// summary over the window.
async fn sample_loaded(
    tracker: &ThroughputTracker,
    probe: &LatencyProbe,
    manager: &StreamManager,
    directions: &[Direction],
    duration: Duration,
    cancel: &AtomicBool,
) -> (Vec<ThroughputSummary>, LatencySummary) {
    let t0 = Instant::now();
    let bases: Vec<u64> = directions.iter().map(|&d| manager.total_bytes(d)).collect();
    let mut points: Vec<Vec<f64>> = vec![Vec::new(); directions.len()];

    while t0.elapsed() < duration && !cancel.load(Ordering::Relaxed) {
        tokio::time::sleep(SAMPLE_TICK).await;
        for (i, &d) in directions.iter().enumerate() {
            points[i].push(tracker.window_mbps(d).unwrap_or(0.0));
        }
    }
    let elapsed = t0.elapsed();

    let summaries = directions
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            let bytes = manager.total_bytes(d).saturating_sub(bases[i]);
            throughput_summary(bytes, elapsed, &points[i])
        })
        .collect();

    let window = probe.window_since(t0);
    (summaries, window_summary(&window))
}

fn throughput_summary(bytes: u64, duration: Duration, mbps_samples: &[f64]) -> ThroughputSummary {
    // Too few ticks to talk about spread: report the byte-count average.
    let spread = crate::metrics::rate_spread(mbps_samples).unwrap_or_else(|| {
        let secs = duration.as_secs_f64().max(1e-9);
        let mbps = (bytes as f64 * 8.0) / secs / 1_000_000.0;
        crate::metrics::RateSpread {
            mean_mbps: mbps,
            median_mbps: mbps,
            p25_mbps: mbps,
            p75_mbps: mbps,
        }
    });

    ThroughputSummary {
        bytes,
        duration_ms: duration.as_millis() as u64,
        mbps: spread.mean_mbps,
        mean_mbps: Some(spread.mean_mbps),
        median_mbps: Some(spread.median_mbps),
        p25_mbps: Some(spread.p25_mbps),
        p75_mbps: Some(spread.p75_mbps),
    }
}

fn window_summary(window: &probe::ProbeWindow) -> LatencySummary {
    let mut online = OnlineStats::default();
    for &s in &window.samples {
        online.push(s);
    }
    latency_summary_from_samples(window.sent, window.received, &window.samples, online.stddev())
}

/// Sleep out a phase in slices so a cancel is observed promptly.
async fn sleep_phase(duration: Duration, cancel: &AtomicBool) {
    let t0 = Instant::now();
    while t0.elapsed() < duration && !cancel.load(Ordering::Relaxed) {
        let left = duration - t0.elapsed();
        tokio::time::sleep(left.min(SAMPLE_TICK)).await;
    }
}

/// Idle until the controller reports the current phase budget exhausted.
async fn sleep_remaining(controller: &PhaseController, cancel: &AtomicBool) {
    while !cancel.load(Ordering::Relaxed) {
        match controller.phase_remaining() {
            Some(left) if !left.is_zero() => {
                tokio::time::sleep(left.min(SAMPLE_TICK)).await;
            }
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PhaseDurations, ProbeConfig, WarmupConfig};

    fn quick_config() -> RunConfig {
        RunConfig {
            base_url: "http://127.0.0.1:9".into(),
            ping_base_url: None,
            meas_id: "test".into(),
            user_agent: "bufferbloat-cli/test".into(),
            phases: PhaseDurations {
                baseline: Duration::from_millis(50),
                download_warmup: Duration::from_millis(50),
                download_saturation: Duration::from_millis(50),
                upload_warmup: Duration::from_millis(50),
                upload_saturation: Duration::from_millis(50),
                bidirectional: Duration::from_millis(50),
            },
            warmup: WarmupConfig {
                enabled: false,
                ..Default::default()
            },
            probe: ProbeConfig::default(),
        }
    }

    #[tokio::test]
    async fn cancelled_run_still_produces_a_result() {
        let (evt_tx, _evt_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        ctrl_tx.send(EngineControl::Cancel).unwrap();

        let engine = TestEngine::new(quick_config());
        let result = engine.run(evt_tx, ctrl_rx).await.unwrap();
        // No server was reachable, so every stage degraded to defaults.
        assert!(result.warmup_fallback);
        assert_eq!(result.meas_id, "test");
        assert!(!result.phase_history.is_empty());
    }

    #[tokio::test]
    async fn unreachable_server_degrades_but_completes() {
        let (evt_tx, _evt_rx) = mpsc::unbounded_channel();
        let (_ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        let engine = TestEngine::new(quick_config());
        let result = engine.run(evt_tx, ctrl_rx).await.unwrap();
        assert!(result.warmup_fallback);
        assert_eq!(result.download.bytes, 0);
        // Every phase made it into the history and was sealed.
        assert_eq!(result.phase_history.len(), 6);
        assert!(result
            .phase_history
            .iter()
            .all(|r| r.ended_at_ms.is_some()));
    }
}
