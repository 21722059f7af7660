use crate::engine::{EngineControl, TestEngine};
use crate::model::{
    Direction, PhaseDurations, ProbeConfig, RunConfig, TestEvent, WarmupConfig,
};
use anyhow::{Context, Result};
use clap::Parser;
use rand::RngCore;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "bufferbloat-cli",
    version,
    about = "Bufferbloat test: latency under load with adaptive bandwidth discovery"
)]
pub struct Cli {
    /// Base URL of the transfer endpoints (/download, /upload)
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub base_url: String,

    /// Dedicated ping host for latency probes (defaults to the base URL)
    #[arg(long)]
    pub ping_url: Option<String>,

    /// Print JSON result and exit
    #[arg(long)]
    pub json: bool,

    /// Baseline latency phase duration
    #[arg(long, default_value = "5s")]
    pub baseline_duration: humantime::Duration,

    /// Download warmup phase duration
    #[arg(long, default_value = "15s")]
    pub download_warmup_duration: humantime::Duration,

    /// Download saturation phase duration
    #[arg(long, default_value = "5s")]
    pub download_duration: humantime::Duration,

    /// Upload warmup phase duration
    #[arg(long, default_value = "15s")]
    pub upload_warmup_duration: humantime::Duration,

    /// Upload saturation phase duration
    #[arg(long, default_value = "5s")]
    pub upload_duration: humantime::Duration,

    /// Bidirectional saturation phase duration
    #[arg(long, default_value = "5s")]
    pub bidirectional_duration: humantime::Duration,

    /// Use --adaptive-warmup true/false to toggle bandwidth discovery
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub adaptive_warmup: bool,

    /// Cap for each warmup speed-estimation sub-probe
    #[arg(long, default_value = "5s")]
    pub speed_estimation_timeout: humantime::Duration,

    /// Sampling window per warmup configuration trial
    #[arg(long, default_value = "600ms")]
    pub trial_duration: humantime::Duration,

    /// Cap on warmup configuration trials (default: per speed tier)
    #[arg(long)]
    pub max_trials: Option<usize>,

    /// Stop the warmup search once this share of the estimate is reached
    #[arg(long, default_value_t = 0.95)]
    pub early_termination_threshold: f64,

    /// Loaded latency budget as a multiple of the baseline
    #[arg(long, default_value_t = 2.0)]
    pub latency_multiplier: f64,

    /// Latency probe interval in milliseconds
    #[arg(long, default_value_t = 100)]
    pub probe_interval_ms: u64,

    /// Export results as JSON
    #[arg(long)]
    pub export_json: Option<std::path::PathBuf>,

    /// Export results as CSV
    #[arg(long)]
    pub export_csv: Option<std::path::PathBuf>,

    /// Use --auto-save true or --auto-save false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_save: bool,
}

pub async fn run(args: Cli) -> Result<()> {
    if args.json {
        return run_json(args).await;
    }
    run_text(args).await
}

/// Generate a random measurement ID for the test run.
fn gen_meas_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    u64::from_le_bytes(b).to_string()
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> RunConfig {
    RunConfig {
        base_url: args.base_url.clone(),
        ping_base_url: args.ping_url.clone(),
        meas_id: gen_meas_id(),
        user_agent: format!("bufferbloat-cli/{}", env!("CARGO_PKG_VERSION")),
        phases: PhaseDurations {
            baseline: Duration::from(args.baseline_duration),
            download_warmup: Duration::from(args.download_warmup_duration),
            download_saturation: Duration::from(args.download_duration),
            upload_warmup: Duration::from(args.upload_warmup_duration),
            upload_saturation: Duration::from(args.upload_duration),
            bidirectional: Duration::from(args.bidirectional_duration),
        },
        warmup: WarmupConfig {
            enabled: args.adaptive_warmup,
            speed_estimation_timeout: Duration::from(args.speed_estimation_timeout),
            config_trial_duration: Duration::from(args.trial_duration),
            max_trials: args.max_trials,
            early_termination_threshold: args.early_termination_threshold,
            latency_multiplier: args.latency_multiplier,
            ..Default::default()
        },
        probe: ProbeConfig {
            interval_ms: args.probe_interval_ms,
            ..Default::default()
        },
    }
}

async fn run_json(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let (evt_tx, _evt_rx) = mpsc::unbounded_channel::<TestEvent>();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<EngineControl>();
    drop(ctrl_tx);

    let engine = TestEngine::new(cfg);
    let result = engine
        .run(evt_tx, ctrl_rx)
        .await
        .context("bufferbloat test failed")?;

    handle_exports(&args, &result)?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if args.auto_save {
        if let Ok(p) = crate::storage::save_run(&result) {
            eprintln!("Saved: {}", p.display());
        }
    }
    Ok(())
}

async fn run_text(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<TestEvent>();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<EngineControl>();
    drop(ctrl_tx);

    let engine = TestEngine::new(cfg);
    let handle = tokio::spawn(async move { engine.run(evt_tx, ctrl_rx).await });

    while let Some(ev) = evt_rx.recv().await {
        match ev {
            TestEvent::PhaseStarted { phase, .. } => {
                eprintln!("== {} ==", phase.as_str());
            }
            TestEvent::PhaseEnded { .. } => {}
            TestEvent::ThroughputTick {
                direction,
                bps_instant,
                ..
            } => {
                if bps_instant > 0.0 {
                    let mbps = (bps_instant * 8.0) / 1_000_000.0;
                    eprintln!("{}: {:.2} Mbps", direction.as_str(), mbps);
                }
            }
            TestEvent::LatencySample {
                rtt_ms: Some(ms),
                ok: true,
                phase,
                ..
            } => {
                if phase == Some(crate::model::TestPhase::Baseline) {
                    eprintln!("baseline rtt: {:.1} ms", ms);
                }
            }
            TestEvent::LatencySample { .. } => {}
            TestEvent::WarmupTrial { direction, trial } => {
                eprintln!(
                    "{} trial {}x{}: {:.1} Mbps, {:.1} ms, score {:.2}{}",
                    direction.as_str(),
                    trial.candidate.stream_count,
                    trial.candidate.pending_uploads,
                    trial.throughput_mbps,
                    trial.latency_ms,
                    trial.score,
                    if trial.acceptable { "" } else { " (rejected)" },
                );
            }
            TestEvent::WarmupComplete { outcome } => {
                eprintln!(
                    "{} warmup: {:.1} Mbps ({}), config {}x{}{}",
                    outcome.direction.as_str(),
                    outcome.estimated_speed_mbps,
                    outcome.tier.as_str(),
                    outcome.optimal_config.stream_count,
                    outcome.optimal_config.pending_uploads,
                    if outcome.fallback { " [fallback]" } else { "" },
                );
            }
            TestEvent::RegistryReset {
                dropped_download,
                dropped_upload,
            } => {
                eprintln!(
                    "registry reset: dropped {dropped_download} download / {dropped_upload} upload streams"
                );
            }
            TestEvent::Info { message } => eprintln!("{message}"),
        }
    }

    let result = handle.await??;

    handle_exports(&args, &result)?;
    print_summary(&result);

    if args.auto_save {
        if let Ok(p) = crate::storage::save_run(&result) {
            eprintln!("Saved: {}", p.display());
        }
    }
    Ok(())
}

fn print_summary(result: &crate::model::RunResult) {
    let fmt_lat = |l: &crate::model::LatencySummary| {
        format!(
            "med {:.1} p75 {:.1} max {:.1} ms (loss {:.1}%)",
            l.median_ms.unwrap_or(f64::NAN),
            l.p75_ms.unwrap_or(f64::NAN),
            l.max_ms.unwrap_or(f64::NAN),
            l.loss * 100.0
        )
    };

    println!("Baseline latency: {}", fmt_lat(&result.baseline_latency));
    println!(
        "Download: {:.2} Mbps, loaded latency {}",
        result.download.mbps,
        fmt_lat(&result.loaded_latency_download)
    );
    println!(
        "Upload:   {:.2} Mbps, loaded latency {}",
        result.upload.mbps,
        fmt_lat(&result.loaded_latency_upload)
    );
    println!(
        "Bidirectional: down {:.2} / up {:.2} Mbps, loaded latency {}",
        result.bidirectional_download.mbps,
        result.bidirectional_upload.mbps,
        fmt_lat(&result.loaded_latency_bidirectional)
    );

    // Latency inflation under load, the number this tool exists for.
    if let (Some(base), Some(loaded)) = (
        result.baseline_latency.median_ms,
        result
            .loaded_latency_download
            .median_ms
            .into_iter()
            .chain(result.loaded_latency_upload.median_ms)
            .reduce(f64::max),
    ) {
        println!("Latency inflation under load: +{:.1} ms", (loaded - base).max(0.0));
    }

    for outcome in [&result.warmup_download, &result.warmup_upload]
        .into_iter()
        .flatten()
    {
        let chunk = outcome
            .optimal_chunk_size
            .map(|c| format!(", chunk {} KiB", c / 1024))
            .unwrap_or_default();
        println!(
            "Warmup {}: {:.1} Mbps ({}), config {}x{}{} in {:.1}s",
            match outcome.direction {
                Direction::Download => "download",
                Direction::Upload => "upload",
            },
            outcome.estimated_speed_mbps,
            outcome.tier.as_str(),
            outcome.optimal_config.stream_count,
            outcome.optimal_config.pending_uploads,
            chunk,
            outcome.duration_secs,
        );
    }
}

/// Handle export operations (JSON and CSV) for both text and JSON modes.
fn handle_exports(args: &Cli, result: &crate::model::RunResult) -> Result<()> {
    if let Some(p) = args.export_json.as_deref() {
        crate::storage::export_json(p, result)?;
    }
    if let Some(p) = args.export_csv.as_deref() {
        crate::storage::export_csv(p, result)?;
    }
    Ok(())
}
