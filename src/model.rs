use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub base_url: String,
    /// Dedicated ping host for latency probes; falls back to `base_url`.
    #[serde(default)]
    pub ping_base_url: Option<String>,
    pub meas_id: String,
    pub user_agent: String,
    pub phases: PhaseDurations,
    pub warmup: WarmupConfig,
    pub probe: ProbeConfig,
}

impl RunConfig {
    pub fn ping_base(&self) -> &str {
        self.ping_base_url.as_deref().unwrap_or(&self.base_url)
    }
}

/// Wall-clock budget for each phase of the test plan (`test.phases.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDurations {
    #[serde(with = "humantime_serde")]
    pub baseline: Duration,
    #[serde(with = "humantime_serde")]
    pub download_warmup: Duration,
    #[serde(with = "humantime_serde")]
    pub download_saturation: Duration,
    #[serde(with = "humantime_serde")]
    pub upload_warmup: Duration,
    #[serde(with = "humantime_serde")]
    pub upload_saturation: Duration,
    #[serde(with = "humantime_serde")]
    pub bidirectional: Duration,
}

impl Default for PhaseDurations {
    fn default() -> Self {
        Self {
            baseline: Duration::from_secs(5),
            download_warmup: Duration::from_secs(15),
            download_saturation: Duration::from_secs(5),
            upload_warmup: Duration::from_secs(15),
            upload_saturation: Duration::from_secs(5),
            bidirectional: Duration::from_secs(5),
        }
    }
}

impl PhaseDurations {
    pub fn for_phase(&self, phase: TestPhase) -> Duration {
        match phase {
            TestPhase::Baseline => self.baseline,
            TestPhase::DownloadWarmup => self.download_warmup,
            TestPhase::DownloadSaturation => self.download_saturation,
            TestPhase::UploadWarmup => self.upload_warmup,
            TestPhase::UploadSaturation => self.upload_saturation,
            TestPhase::Bidirectional => self.bidirectional,
        }
    }
}

/// Tunables for the adaptive warmup engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupConfig {
    pub enabled: bool,
    /// Cap for each Stage 1 sub-probe transfer.
    #[serde(with = "humantime_serde")]
    pub speed_estimation_timeout: Duration,
    /// Per-candidate sampling window in Stage 2.
    #[serde(with = "humantime_serde")]
    pub config_trial_duration: Duration,
    /// Overrides the tier-derived trial cap when set.
    #[serde(default)]
    pub max_trials: Option<usize>,
    /// normThroughput cutoff for "goal reached" early termination.
    pub early_termination_threshold: f64,
    pub throughput_weight: f64,
    pub latency_weight: f64,
    /// latencyThreshold = baseline * latency_multiplier.
    pub latency_multiplier: f64,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            speed_estimation_timeout: Duration::from_secs(5),
            config_trial_duration: Duration::from_millis(600),
            max_trials: None,
            early_termination_threshold: 0.95,
            throughput_weight: 0.7,
            latency_weight: 0.3,
            latency_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub interval_ms: u64,
    pub timeout_base_ms: u64,
    /// Added per consecutive prior timeout.
    pub timeout_step_ms: u64,
    pub timeout_max_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            timeout_base_ms: 500,
            timeout_step_ms: 100,
            timeout_max_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        }
    }
}

/// What a stream was created for; carried in the registry and in the
/// `X-Discovery-Phase` header so the server can account for probe traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    SpeedProbe,
    Discovery,
    Warmup,
    Saturation,
    Stabilization,
}

impl Default for StreamKind {
    fn default() -> Self {
        StreamKind::Saturation
    }
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::SpeedProbe => "speed-probe",
            StreamKind::Discovery => "discovery",
            StreamKind::Warmup => "warmup",
            StreamKind::Saturation => "saturation",
            StreamKind::Stabilization => "stabilization",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestPhase {
    Baseline,
    DownloadWarmup,
    DownloadSaturation,
    UploadWarmup,
    UploadSaturation,
    Bidirectional,
}

impl TestPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TestPhase::Baseline => "baseline",
            TestPhase::DownloadWarmup => "download-warmup",
            TestPhase::DownloadSaturation => "download-saturation",
            TestPhase::UploadWarmup => "upload-warmup",
            TestPhase::UploadSaturation => "upload-saturation",
            TestPhase::Bidirectional => "bidirectional",
        }
    }

    /// The direction whose saturation begins with this phase, if any.
    /// The warmup engine uses this to arm force-termination.
    pub fn saturates(self) -> Option<Direction> {
        match self {
            TestPhase::DownloadSaturation => Some(Direction::Download),
            TestPhase::UploadSaturation => Some(Direction::Upload),
            _ => None,
        }
    }
}

/// Link speed class. Boundaries differ by direction; a value exactly on a
/// boundary classifies into the higher tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeedTier {
    Slow,
    Medium,
    Fast,
    Gigabit,
    Ultragig,
}

impl SpeedTier {
    pub fn classify(direction: Direction, mbps: f64) -> Self {
        match direction {
            Direction::Upload => {
                if mbps < 10.0 {
                    SpeedTier::Slow
                } else if mbps < 100.0 {
                    SpeedTier::Medium
                } else if mbps < 300.0 {
                    SpeedTier::Fast
                } else {
                    SpeedTier::Gigabit
                }
            }
            Direction::Download => {
                if mbps < 25.0 {
                    SpeedTier::Slow
                } else if mbps < 200.0 {
                    SpeedTier::Medium
                } else if mbps < 600.0 {
                    SpeedTier::Fast
                } else if mbps < 700.0 {
                    SpeedTier::Gigabit
                } else {
                    SpeedTier::Ultragig
                }
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SpeedTier::Slow => "slow",
            SpeedTier::Medium => "medium",
            SpeedTier::Fast => "fast",
            SpeedTier::Gigabit => "gigabit",
            SpeedTier::Ultragig => "ultragig",
        }
    }
}

/// One point in the warmup parameter space. `pending_uploads` is the
/// in-flight POST window per worker and is fixed at 1 for downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigCandidate {
    pub stream_count: usize,
    pub pending_uploads: usize,
}

impl ConfigCandidate {
    pub const fn download(stream_count: usize) -> Self {
        Self {
            stream_count,
            pending_uploads: 1,
        }
    }

    pub const fn upload(stream_count: usize, pending_uploads: usize) -> Self {
        Self {
            stream_count,
            pending_uploads,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialResult {
    pub candidate: ConfigCandidate,
    pub throughput_mbps: f64,
    pub latency_ms: f64,
    pub score: f64,
    pub acceptable: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupOutcome {
    pub direction: Direction,
    pub optimal_config: ConfigCandidate,
    /// Chosen upload chunk size in bytes; None for download.
    #[serde(default)]
    pub optimal_chunk_size: Option<usize>,
    pub estimated_speed_mbps: f64,
    pub tier: SpeedTier,
    pub trials: Vec<TrialResult>,
    pub duration_secs: f64,
    /// True when any stage fell back to defaults instead of measuring.
    pub fallback: bool,
}

/// Append-only phase history entry; `ended_at_ms` is sealed exactly once.
/// Timestamps are milliseconds relative to test start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: TestPhase,
    pub started_at_ms: u64,
    #[serde(default)]
    pub ended_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TestEvent {
    PhaseStarted {
        phase: TestPhase,
        total_elapsed_ms: u64,
    },
    PhaseEnded {
        phase: TestPhase,
        elapsed_ms: u64,
        total_elapsed_ms: u64,
    },
    LatencySample {
        phase: Option<TestPhase>,
        rtt_ms: Option<f64>,
        consecutive_timeouts: u32,
        ok: bool,
    },
    ThroughputTick {
        direction: Direction,
        bytes_total: u64,
        bps_instant: f64,
    },
    WarmupTrial {
        direction: Direction,
        trial: TrialResult,
    },
    WarmupComplete {
        outcome: WarmupOutcome,
    },
    /// Emergency registry reset; dependents should resynchronize.
    RegistryReset {
        dropped_download: usize,
        dropped_upload: usize,
    },
    Info {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySummary {
    pub sent: u64,
    pub received: u64,
    pub loss: f64,
    pub min_ms: Option<f64>,
    pub mean_ms: Option<f64>,
    pub median_ms: Option<f64>,
    pub p25_ms: Option<f64>,
    pub p75_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
}

impl Default for LatencySummary {
    fn default() -> Self {
        Self {
            sent: 0,
            received: 0,
            loss: 0.0,
            min_ms: None,
            mean_ms: None,
            median_ms: None,
            p25_ms: None,
            p75_ms: None,
            max_ms: None,
            jitter_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputSummary {
    pub bytes: u64,
    pub duration_ms: u64,
    pub mbps: f64,
    pub mean_mbps: Option<f64>,
    pub median_mbps: Option<f64>,
    pub p25_mbps: Option<f64>,
    pub p75_mbps: Option<f64>,
}

impl ThroughputSummary {
    pub fn empty() -> Self {
        Self {
            bytes: 0,
            duration_ms: 0,
            mbps: 0.0,
            mean_mbps: None,
            median_mbps: None,
            p25_mbps: None,
            p75_mbps: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timestamp_utc: String,
    pub base_url: String,
    pub meas_id: String,
    pub baseline_latency: LatencySummary,
    pub loaded_latency_download: LatencySummary,
    pub loaded_latency_upload: LatencySummary,
    pub loaded_latency_bidirectional: LatencySummary,
    pub download: ThroughputSummary,
    pub upload: ThroughputSummary,
    pub bidirectional_download: ThroughputSummary,
    pub bidirectional_upload: ThroughputSummary,
    #[serde(default)]
    pub warmup_download: Option<WarmupOutcome>,
    #[serde(default)]
    pub warmup_upload: Option<WarmupOutcome>,
    /// Set when any stage had to fall back to conservative defaults.
    #[serde(default)]
    pub warmup_fallback: bool,
    pub phase_history: Vec<PhaseRecord>,
}
