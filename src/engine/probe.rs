use crate::engine::server::TestServerClient;
use crate::model::{ProbeConfig, TestEvent, TestPhase};
use anyhow::{Context, Result};
use log::{debug, warn};
use rand::RngCore;
use reqwest::Url;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// One probe outcome. `rtt_ms` is None for timeouts and errors; an RTT is
/// never synthesized for a probe that did not complete.
#[derive(Debug, Clone, Copy)]
struct ProbeEntry {
    at: Instant,
    rtt_ms: Option<f64>,
}

/// Counts and successful samples inside a time window.
#[derive(Debug, Clone, Default)]
pub struct ProbeWindow {
    pub sent: u64,
    pub received: u64,
    pub samples: Vec<f64>,
}

/// Out-of-band RTT sampler on the dedicated ping endpoint.
///
/// Runs in its own spawned task on the multi-thread runtime so large upload
/// bodies cannot starve probe scheduling. The per-request timeout backs off
/// by `timeout_step_ms` per consecutive prior timeout, up to
/// `timeout_max_ms`; a success resets the streak.
pub struct LatencyProbe {
    http: reqwest::Client,
    cfg: ProbeConfig,
    ping_url: Mutex<Url>,
    phase_cell: Arc<Mutex<Option<TestPhase>>>,
    log: Mutex<Vec<ProbeEntry>>,
    consecutive_timeouts: AtomicU32,
    stop: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LatencyProbe {
    pub fn new(
        client: &TestServerClient,
        cfg: ProbeConfig,
        phase_cell: Arc<Mutex<Option<TestPhase>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            http: client.http.clone(),
            cfg,
            ping_url: Mutex::new(client.ping_url()),
            phase_cell,
            log: Mutex::new(Vec::with_capacity(1024)),
            consecutive_timeouts: AtomicU32::new(0),
            stop: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// Repoint probes at a different server. Fails only if the URL cannot
    /// be resolved to a ping endpoint; sampling continues on the old URL
    /// in that case.
    pub fn set_server(&self, base: &str) -> Result<()> {
        let base = Url::parse(base).context("invalid ping server url")?;
        let url = base.join("/ping").context("join /ping")?;
        *self.ping_url.lock().expect("ping url poisoned") = url;
        Ok(())
    }

    pub fn start(self: &Arc<Self>, event_tx: UnboundedSender<TestEvent>) {
        let probe = self.clone();
        let handle = tokio::spawn(async move { probe.sample_loop(event_tx).await });
        *self.handle.lock().expect("probe handle poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.lock().expect("probe handle poisoned").take() {
            // The loop is read-only; aborting a mid-flight GET loses at most
            // one sample.
            h.abort();
        }
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::Relaxed)
    }

    /// Probe outcomes at or after `t`, oldest first.
    pub fn window_since(&self, t: Instant) -> ProbeWindow {
        let log = self.log.lock().expect("probe log poisoned");
        let mut w = ProbeWindow::default();
        for e in log.iter().filter(|e| e.at >= t) {
            w.sent += 1;
            if let Some(ms) = e.rtt_ms {
                w.received += 1;
                w.samples.push(ms);
            }
        }
        w
    }

    pub fn median_rtt_since(&self, t: Instant) -> Option<f64> {
        let mut samples = self.window_since(t).samples;
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Some(samples[samples.len() / 2])
    }

    pub fn mean_rtt_since(&self, t: Instant) -> Option<f64> {
        let samples = self.window_since(t).samples;
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    async fn sample_loop(&self, event_tx: UnboundedSender<TestEvent>) {
        let interval = Duration::from_millis(self.cfg.interval_ms);
        while !self.stop.load(Ordering::Relaxed) {
            self.probe_once(&event_tx).await;
            tokio::time::sleep(interval).await;
        }
    }

    async fn probe_once(&self, event_tx: &UnboundedSender<TestEvent>) {
        let streak = self.consecutive_timeouts.load(Ordering::Relaxed);
        let timeout = compute_timeout(&self.cfg, streak);
        let url = {
            let mut url = self.ping_url.lock().expect("ping url poisoned").clone();
            url.query_pairs_mut()
                .append_pair("cb", &rand::thread_rng().next_u64().to_string());
            url
        };
        let phase = *self.phase_cell.lock().expect("phase cell poisoned");

        let start = Instant::now();
        let resp = self
            .http
            .get(url)
            .header("Pragma", "no-cache")
            .header("Cache-Control", "no-store, no-cache, must-revalidate")
            .header("X-Priority", "high")
            .header("X-Ping-Attempt", streak.to_string())
            .timeout(timeout)
            .send()
            .await;

        match resp {
            Ok(r) if r.status().is_success() => {
                // RTT is wall time to response headers; the body is noise.
                let rtt_ms = start.elapsed().as_secs_f64() * 1000.0;
                let _ = r.bytes().await;
                self.consecutive_timeouts.store(0, Ordering::Relaxed);
                self.log
                    .lock()
                    .expect("probe log poisoned")
                    .push(ProbeEntry {
                        at: start,
                        rtt_ms: Some(rtt_ms),
                    });
                let _ = event_tx.send(TestEvent::LatencySample {
                    phase,
                    rtt_ms: Some(rtt_ms),
                    consecutive_timeouts: 0,
                    ok: true,
                });
            }
            Ok(r) => {
                let streak = self.record_miss(start);
                warn!("ping returned {}; streak {streak}", r.status());
                let _ = event_tx.send(TestEvent::Info {
                    message: format!("ping returned {}", r.status()),
                });
                let _ = event_tx.send(TestEvent::LatencySample {
                    phase,
                    rtt_ms: None,
                    consecutive_timeouts: streak,
                    ok: false,
                });
            }
            Err(e) => {
                let streak = self.record_miss(start);
                if e.is_timeout() {
                    debug!("ping timed out after {timeout:?}; streak {streak}");
                } else {
                    debug!("ping failed: {e}; streak {streak}");
                }
                let _ = event_tx.send(TestEvent::LatencySample {
                    phase,
                    rtt_ms: None,
                    consecutive_timeouts: streak,
                    ok: false,
                });
            }
        }
    }

    fn record_miss(&self, at: Instant) -> u32 {
        let streak = self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        self.log
            .lock()
            .expect("probe log poisoned")
            .push(ProbeEntry { at, rtt_ms: None });
        streak
    }
}

/// Timeout for the next probe given the consecutive-timeout streak.
pub(crate) fn compute_timeout(cfg: &ProbeConfig, consecutive_timeouts: u32) -> Duration {
    let ms = cfg
        .timeout_base_ms
        .saturating_add(cfg.timeout_step_ms.saturating_mul(consecutive_timeouts as u64))
        .min(cfg.timeout_max_ms);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_backs_off_and_caps() {
        let cfg = ProbeConfig::default();
        assert_eq!(compute_timeout(&cfg, 0), Duration::from_millis(500));
        assert_eq!(compute_timeout(&cfg, 1), Duration::from_millis(600));
        assert_eq!(compute_timeout(&cfg, 4), Duration::from_millis(900));
        assert_eq!(compute_timeout(&cfg, 5), Duration::from_millis(1000));
        // Well past the ceiling the cap still holds.
        assert_eq!(compute_timeout(&cfg, 100), Duration::from_millis(1000));
    }

    #[test]
    fn window_separates_timeouts_from_samples() {
        let t0 = Instant::now();
        let cfg = ProbeConfig::default();
        let client = TestServerClient::new(&crate::model::RunConfig {
            base_url: "http://127.0.0.1:8080".into(),
            ping_base_url: None,
            meas_id: "1".into(),
            user_agent: "test".into(),
            phases: Default::default(),
            warmup: Default::default(),
            probe: cfg.clone(),
        })
        .unwrap();
        let probe = LatencyProbe::new(&client, cfg, Arc::new(Mutex::new(None)));

        {
            let mut log = probe.log.lock().unwrap();
            log.push(ProbeEntry {
                at: t0,
                rtt_ms: Some(12.0),
            });
            log.push(ProbeEntry {
                at: t0,
                rtt_ms: None,
            });
            log.push(ProbeEntry {
                at: t0,
                rtt_ms: Some(18.0),
            });
        }

        let w = probe.window_since(t0);
        assert_eq!(w.sent, 3);
        assert_eq!(w.received, 2);
        assert_eq!(w.samples, vec![12.0, 18.0]);
        assert_eq!(probe.median_rtt_since(t0), Some(18.0));
        assert!((probe.mean_rtt_since(t0).unwrap() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn miss_streak_counts_and_resets() {
        let cfg = ProbeConfig::default();
        let client = TestServerClient::new(&crate::model::RunConfig {
            base_url: "http://127.0.0.1:8080".into(),
            ping_base_url: None,
            meas_id: "1".into(),
            user_agent: "test".into(),
            phases: Default::default(),
            warmup: Default::default(),
            probe: cfg.clone(),
        })
        .unwrap();
        let probe = LatencyProbe::new(&client, cfg, Arc::new(Mutex::new(None)));

        for expect in 1..=6 {
            assert_eq!(probe.record_miss(Instant::now()), expect);
        }
        assert_eq!(probe.consecutive_timeouts(), 6);
        probe.consecutive_timeouts.store(0, Ordering::Relaxed);
        assert_eq!(probe.consecutive_timeouts(), 0);
    }
}
