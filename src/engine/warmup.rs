use crate::engine::payload::{PayloadPool, KIB, MIB};
use crate::engine::phases::{PhaseEvent, PhaseTransition};
use crate::engine::probe::LatencyProbe;
use crate::engine::streams::{
    DownloadStreamOpts, StreamManager, UploadStreamOpts,
};
use crate::engine::throughput::ThroughputTracker;
use crate::model::{
    ConfigCandidate, Direction, SpeedTier, StreamKind, TestEvent, TrialResult, WarmupConfig,
    WarmupOutcome,
};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedSender;

/// Seed transfer sizes for the rough bandwidth estimate.
const SEED_DOWNLOAD_BYTES: u64 = MIB as u64;
const SEED_UPLOAD_BYTES: u64 = 2 * MIB as u64;
/// The precision sub-probe targets a transfer of roughly this long.
const PRECISE_TRANSFER_SECS: f64 = 2.5;
/// Keep Stage 1 on screen at least this long.
const MIN_STAGE1_DURATION: Duration = Duration::from_millis(1500);
/// Quiesce between the discovery streams and the parameter search.
const STAGE_BARRIER_PAUSE: Duration = Duration::from_millis(300);
const CHUNK_TRIAL_DURATION: Duration = Duration::from_secs(1);
const TRIAL_STABILIZATION: Duration = Duration::from_millis(250);
const SAMPLE_TICK: Duration = Duration::from_millis(100);
/// Remaining-budget floors below which a stage is skipped outright.
const STAGE2_MIN_BUDGET: Duration = Duration::from_secs(1);
const CHUNK_PROBE_MIN_BUDGET: Duration = Duration::from_secs(2);

/// Conservative estimates when no bytes could be obtained at all.
pub const DEFAULT_DOWNLOAD_MBPS: f64 = 200.0;
pub const DEFAULT_UPLOAD_MBPS: f64 = 50.0;

/// Shared handles the warmup engine drives.
pub struct WarmupContext {
    pub cfg: WarmupConfig,
    pub manager: Arc<StreamManager>,
    pub tracker: Arc<ThroughputTracker>,
    pub probe: Arc<LatencyProbe>,
    pub payloads: Arc<PayloadPool>,
    pub event_tx: UnboundedSender<TestEvent>,
}

/// Two-stage adaptive warmup for one direction: estimate bandwidth, then
/// search the (stream count, in-flight window, chunk size) space for the
/// configuration that saturates without collapsing latency. Leaves the
/// winning configuration running as stabilization streams; the next phase
/// barrier reaps them.
pub async fn run_warmup(
    ctx: &WarmupContext,
    direction: Direction,
    baseline_ms: f64,
    deadline: Instant,
    phase_events: broadcast::Receiver<PhaseEvent>,
) -> WarmupOutcome {
    let started = Instant::now();
    let force = Arc::new(AtomicBool::new(false));
    let armer = tokio::spawn(watch_for_saturation(
        phase_events,
        direction,
        force.clone(),
    ));

    // Stage 1: bandwidth estimation.
    let (estimated, estimation_fallback) =
        estimate_speed(ctx, direction, deadline, &force).await;
    if started.elapsed() < MIN_STAGE1_DURATION && !force.load(Ordering::Relaxed) {
        tokio::time::sleep(MIN_STAGE1_DURATION - started.elapsed()).await;
    }
    let tier = SpeedTier::classify(direction, estimated);
    info!(
        "{} warmup: estimated {estimated:.1} Mbps, tier {}",
        direction.as_str(),
        tier.as_str()
    );

    // Stage 1.5: upload chunk-size probe.
    let chunk_size = if direction == Direction::Upload {
        probe_chunk_size(ctx, tier, baseline_ms, deadline, &force).await
    } else {
        default_chunk_size(tier)
    };

    // Let discovery traffic drain before the search measures anything.
    ctx.manager.terminate_direction(direction).await;
    tokio::time::sleep(STAGE_BARRIER_PAUSE).await;

    // Stage 2: scored parameter search.
    let latency_threshold = baseline_ms * ctx.cfg.latency_multiplier;
    let mut trials = Vec::new();
    let mut search = SearchTracker::default();
    let budget = deadline.saturating_duration_since(Instant::now());
    if budget >= STAGE2_MIN_BUDGET && !force.load(Ordering::Relaxed) {
        let mut candidates = candidate_matrix(direction, tier);
        candidates.truncate(ctx.cfg.max_trials.unwrap_or(trial_cap(tier)));

        for candidate in candidates {
            if force.load(Ordering::Relaxed) {
                debug!("{} warmup preempted mid-search", direction.as_str());
                break;
            }
            let trial_cost = TRIAL_STABILIZATION + ctx.cfg.config_trial_duration;
            if Instant::now() + trial_cost > deadline {
                break;
            }

            let (trial, norm) = run_trial(
                ctx,
                direction,
                candidate,
                chunk_size,
                baseline_ms,
                estimated,
                &force,
            )
            .await;
            let _ = ctx.event_tx.send(TestEvent::WarmupTrial {
                direction,
                trial: trial.clone(),
            });
            let verdict = search.observe(
                &trial,
                norm,
                latency_threshold,
                ctx.cfg.early_termination_threshold,
            );
            trials.push(trial);
            match verdict {
                SearchVerdict::Continue => {}
                SearchVerdict::GoalReached => {
                    debug!("{} warmup: goal reached", direction.as_str());
                    break;
                }
                SearchVerdict::Stalled => {
                    debug!("{} warmup: search stalled", direction.as_str());
                    break;
                }
                SearchVerdict::LatencyCollapse => {
                    warn!(
                        "{} warmup: latency collapse, stopping search",
                        direction.as_str()
                    );
                    break;
                }
            }
        }
    }

    let config_fallback = search.best_candidate().is_none();
    let optimal_config = search
        .best_candidate()
        .unwrap_or_else(|| tier_default(direction, tier, estimated));

    // Stabilize: keep the winner running until the phase controller moves
    // on. Skipped when the saturation phase has already begun.
    if !force.load(Ordering::Relaxed) {
        ctx.manager.launch_config(
            &ctx.payloads,
            direction,
            optimal_config,
            chunk_size,
            StreamKind::Stabilization,
        );
    }
    armer.abort();

    let outcome = WarmupOutcome {
        direction,
        optimal_config,
        optimal_chunk_size: (direction == Direction::Upload).then_some(chunk_size),
        estimated_speed_mbps: estimated,
        tier,
        trials,
        duration_secs: started.elapsed().as_secs_f64(),
        fallback: estimation_fallback || config_fallback,
    };
    let _ = ctx.event_tx.send(TestEvent::WarmupComplete {
        outcome: outcome.clone(),
    });
    outcome
}

/// Outcome used when the warmup engine is disabled: conservative estimate,
/// tier defaults, no trials.
pub fn conservative_outcome(direction: Direction) -> WarmupOutcome {
    let estimated = match direction {
        Direction::Download => DEFAULT_DOWNLOAD_MBPS,
        Direction::Upload => DEFAULT_UPLOAD_MBPS,
    };
    let tier = SpeedTier::classify(direction, estimated);
    WarmupOutcome {
        direction,
        optimal_config: tier_default(direction, tier, estimated),
        optimal_chunk_size: (direction == Direction::Upload).then(|| default_chunk_size(tier)),
        estimated_speed_mbps: estimated,
        tier,
        trials: Vec::new(),
        duration_secs: 0.0,
        fallback: true,
    }
}

async fn watch_for_saturation(
    mut rx: broadcast::Receiver<PhaseEvent>,
    direction: Direction,
    force: Arc<AtomicBool>,
) {
    loop {
        match rx.recv().await {
            Ok(ev)
                if ev.transition == PhaseTransition::Start
                    && ev.phase.saturates() == Some(direction) =>
            {
                force.store(true, Ordering::Relaxed);
                return;
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Stage 1: rough seed transfer, then an adaptively sized precision
/// transfer. Returns (estimated Mbps, fallback flag).
async fn estimate_speed(
    ctx: &WarmupContext,
    direction: Direction,
    deadline: Instant,
    force: &Arc<AtomicBool>,
) -> (f64, bool) {
    let stage_start = Instant::now();
    let cap_a = ctx
        .cfg
        .speed_estimation_timeout
        .min(deadline.saturating_duration_since(stage_start));

    let rough = match direction {
        Direction::Download => {
            measure_download(ctx, SEED_DOWNLOAD_BYTES, 1, cap_a, stage_start, force).await
        }
        Direction::Upload => {
            // Parallel seed POSTs so fast links are not under-measured.
            measure_upload(ctx, SEED_UPLOAD_BYTES, 4, 512 * KIB, cap_a, stage_start, force).await
        }
    };

    let default = match direction {
        Direction::Download => DEFAULT_DOWNLOAD_MBPS,
        Direction::Upload => DEFAULT_UPLOAD_MBPS,
    };
    let rough_mbps = rough.unwrap_or(default);
    debug!(
        "{} stage 1A: rough {rough_mbps:.1} Mbps (measured: {})",
        direction.as_str(),
        rough.is_some()
    );

    let precise = if force.load(Ordering::Relaxed) {
        None
    } else {
        let cap_b = (ctx.cfg.speed_estimation_timeout + Duration::from_secs(1))
            .min(deadline.saturating_duration_since(Instant::now()));
        let target = precise_target_bytes(direction, rough_mbps);
        let t0 = Instant::now();
        match direction {
            Direction::Download => {
                let streams = if rough_mbps >= 100.0 { 4 } else { 1 };
                measure_download(ctx, target, streams, cap_b, t0, force).await
            }
            Direction::Upload => {
                let chunk = precise_upload_chunk(rough_mbps);
                let streams = ((target / chunk as u64).max(1) as usize).min(16);
                measure_upload(ctx, target, streams, chunk, cap_b, t0, force).await
            }
        }
    };

    match (precise, rough) {
        (Some(p), _) => (p, false),
        (None, Some(r)) => (r, false),
        (None, None) => (default, true),
    }
}

/// 1–4 MiB precision-probe chunks, sized so slow links still finish a
/// chunk inside the probe window.
fn precise_upload_chunk(rough_mbps: f64) -> usize {
    if rough_mbps < 100.0 {
        MIB
    } else if rough_mbps < 500.0 {
        2 * MIB
    } else {
        4 * MIB
    }
}

async fn measure_download(
    ctx: &WarmupContext,
    total_bytes: u64,
    streams: usize,
    cap: Duration,
    elapsed_from: Instant,
    force: &Arc<AtomicBool>,
) -> Option<f64> {
    let streams = streams.max(1);
    let per_stream = (total_bytes / streams as u64).max(1);
    // Wait on what the workers were actually asked to move; integer
    // division can leave the sum a few bytes short of `total_bytes`.
    let goal = per_stream * streams as u64;
    let ids: Vec<u64> = (0..streams)
        .map(|_| {
            ctx.manager.create_download_stream(DownloadStreamOpts {
                kind: StreamKind::SpeedProbe,
                target_bytes: Some(per_stream),
                max_duration: Some(cap),
            })
        })
        .collect();
    let moved = await_transfer(ctx, Direction::Download, &ids, goal, cap, force).await;
    finish_probe(ctx, Direction::Download, ids, moved, elapsed_from).await
}

async fn measure_upload(
    ctx: &WarmupContext,
    total_bytes: u64,
    streams: usize,
    chunk_size: usize,
    cap: Duration,
    elapsed_from: Instant,
    force: &Arc<AtomicBool>,
) -> Option<f64> {
    let chunks = ctx.payloads.chunks(chunk_size);
    let streams = streams.max(1);
    let per_stream = (total_bytes / streams as u64).max(1);
    let goal = per_stream * streams as u64;
    let ids: Vec<u64> = (0..streams)
        .map(|i| {
            ctx.manager.create_upload_stream(
                UploadStreamOpts {
                    kind: StreamKind::SpeedProbe,
                    pending_uploads: 2,
                    stream_index: i,
                    target_bytes: Some(per_stream),
                    max_duration: Some(cap),
                },
                chunks.clone(),
            )
        })
        .collect();
    let moved = await_transfer(ctx, Direction::Upload, &ids, goal, cap, force).await;
    finish_probe(ctx, Direction::Upload, ids, moved, elapsed_from).await
}

/// Poll the probe streams' own counters until they moved the payload, the
/// cap elapsed, or the warmup was preempted.
async fn await_transfer(
    ctx: &WarmupContext,
    direction: Direction,
    ids: &[u64],
    total_bytes: u64,
    cap: Duration,
    force: &Arc<AtomicBool>,
) -> u64 {
    let t0 = Instant::now();
    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let moved: u64 = ids
            .iter()
            .map(|&id| ctx.manager.stream_bytes(id, direction).unwrap_or(0))
            .sum();
        if moved >= total_bytes || t0.elapsed() >= cap || force.load(Ordering::Relaxed) {
            return moved;
        }
    }
}

async fn finish_probe(
    ctx: &WarmupContext,
    direction: Direction,
    ids: Vec<u64>,
    moved: u64,
    elapsed_from: Instant,
) -> Option<f64> {
    let elapsed = elapsed_from.elapsed().as_secs_f64();
    futures::future::join_all(
        ids.into_iter()
            .map(|id| ctx.manager.terminate_stream(id, direction)),
    )
    .await;
    if moved == 0 || elapsed <= 0.0 {
        return None;
    }
    Some((moved as f64 * 8.0) / elapsed / 1_000_000.0)
}

/// Stage 1.5: try the tier's chunk-size candidates at a fixed probing
/// config and keep the fastest one whose latency stays in the envelope.
async fn probe_chunk_size(
    ctx: &WarmupContext,
    tier: SpeedTier,
    baseline_ms: f64,
    deadline: Instant,
    force: &Arc<AtomicBool>,
) -> usize {
    if deadline.saturating_duration_since(Instant::now()) < CHUNK_PROBE_MIN_BUDGET {
        debug!("chunk probe skipped: budget exhausted");
        return default_chunk_size(tier);
    }

    let gigabit = matches!(tier, SpeedTier::Gigabit | SpeedTier::Ultragig);
    let probing = if gigabit {
        ConfigCandidate::upload(4, 8)
    } else {
        ConfigCandidate::upload(1, 3)
    };
    let threshold = baseline_ms * if gigabit { 4.0 } else { 2.0 };

    let mut best: Option<(usize, f64)> = None;
    let mut tested: Vec<usize> = Vec::new();

    for &size in chunk_candidates(tier) {
        if force.load(Ordering::Relaxed)
            || Instant::now() + CHUNK_TRIAL_DURATION > deadline
        {
            break;
        }
        let ids = ctx.manager.launch_config(
            &ctx.payloads,
            Direction::Upload,
            probing,
            size,
            StreamKind::Discovery,
        );
        let t0 = Instant::now();
        let base = ctx.manager.total_bytes(Direction::Upload);
        tokio::time::sleep(CHUNK_TRIAL_DURATION).await;
        let moved = ctx.manager.total_bytes(Direction::Upload).saturating_sub(base);
        let elapsed = t0.elapsed().as_secs_f64();
        futures::future::join_all(
            ids.into_iter()
                .map(|id| ctx.manager.terminate_stream(id, Direction::Upload)),
        )
        .await;

        let mbps = (moved as f64 * 8.0) / elapsed.max(1e-9) / 1_000_000.0;
        let latency = ctx.probe.mean_rtt_since(t0).unwrap_or(baseline_ms);
        tested.push(size);

        let beats_best = best.map_or(mbps > 0.0, |(_, b)| mbps > b);
        if beats_best && latency <= threshold {
            best = Some((size, mbps));
        }
        debug!(
            "chunk probe {size}: {mbps:.1} Mbps at {latency:.1} ms (best: {best:?})"
        );
    }

    resolve_chunk_choice(best.map(|(size, _)| size), &tested, gigabit, tier)
}

/// Final chunk-size decision: the accepted winner, else on gigabit the
/// largest candidate actually tested, else the tier default.
pub(crate) fn resolve_chunk_choice(
    best: Option<usize>,
    tested: &[usize],
    gigabit: bool,
    tier: SpeedTier,
) -> usize {
    best.or_else(|| if gigabit { tested.last().copied() } else { None })
        .unwrap_or_else(|| default_chunk_size(tier))
}

/// One Stage 2 trial: start the candidate, stabilize, sample throughput
/// and latency at the tick cadence, stop, score.
async fn run_trial(
    ctx: &WarmupContext,
    direction: Direction,
    candidate: ConfigCandidate,
    chunk_size: usize,
    baseline_ms: f64,
    estimated_mbps: f64,
    force: &Arc<AtomicBool>,
) -> (TrialResult, f64) {
    let ids = ctx.manager.launch_config(
        &ctx.payloads,
        direction,
        candidate,
        chunk_size,
        StreamKind::Warmup,
    );
    tokio::time::sleep(TRIAL_STABILIZATION).await;

    let t0 = Instant::now();
    let base = ctx.manager.total_bytes(direction);
    let mut mbps_samples = Vec::new();
    while t0.elapsed() < ctx.cfg.config_trial_duration && !force.load(Ordering::Relaxed) {
        tokio::time::sleep(SAMPLE_TICK).await;
        let mbps = ctx.tracker.window_mbps(direction).unwrap_or_else(|| {
            // Tracker unavailable: fall back to the counter delta.
            let moved = ctx.manager.total_bytes(direction).saturating_sub(base);
            (moved as f64 * 8.0) / t0.elapsed().as_secs_f64().max(1e-9) / 1_000_000.0
        });
        mbps_samples.push(mbps);
    }
    let latency_ms = ctx.probe.mean_rtt_since(t0).unwrap_or(baseline_ms);

    futures::future::join_all(
        ids.into_iter()
            .map(|id| ctx.manager.terminate_stream(id, direction)),
    )
    .await;

    finalize_trial(
        &ctx.cfg,
        candidate,
        &mbps_samples,
        latency_ms,
        estimated_mbps,
        baseline_ms,
    )
}

/// Score a finished trial. A trial with no throughput samples is
/// unacceptable regardless of latency.
pub(crate) fn finalize_trial(
    cfg: &WarmupConfig,
    candidate: ConfigCandidate,
    mbps_samples: &[f64],
    latency_ms: f64,
    estimated_mbps: f64,
    baseline_ms: f64,
) -> (TrialResult, f64) {
    let throughput_mbps = if mbps_samples.is_empty() {
        0.0
    } else {
        mbps_samples.iter().sum::<f64>() / mbps_samples.len() as f64
    };
    let norm = if estimated_mbps > 0.0 {
        (throughput_mbps / estimated_mbps).min(1.0)
    } else {
        0.0
    };
    let latency_threshold = baseline_ms * cfg.latency_multiplier;
    let latency_score = (1.0 - latency_ms / latency_threshold).max(0.0);
    let score = cfg.throughput_weight * norm + cfg.latency_weight * latency_score;
    let acceptable = !mbps_samples.is_empty() && latency_ms <= latency_threshold;

    (
        TrialResult {
            candidate,
            throughput_mbps,
            latency_ms,
            score,
            acceptable,
            error: None,
        },
        norm,
    )
}

#[derive(Debug, Clone, Copy)]
struct BestTrial {
    score: f64,
    norm_throughput: f64,
    candidate: ConfigCandidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchVerdict {
    Continue,
    GoalReached,
    Stalled,
    LatencyCollapse,
}

/// Early-termination bookkeeping for the Stage 2 search.
#[derive(Debug, Default)]
pub(crate) struct SearchTracker {
    best: Option<BestTrial>,
    no_improve: usize,
}

impl SearchTracker {
    pub(crate) fn observe(
        &mut self,
        trial: &TrialResult,
        norm_throughput: f64,
        latency_threshold: f64,
        early_threshold: f64,
    ) -> SearchVerdict {
        let improved = trial.acceptable
            && self.best.map_or(true, |b| trial.score > b.score);
        if improved {
            self.best = Some(BestTrial {
                score: trial.score,
                norm_throughput,
                candidate: trial.candidate,
            });
            self.no_improve = 0;
        } else {
            self.no_improve += 1;
        }

        if self
            .best
            .is_some_and(|b| b.norm_throughput >= early_threshold)
        {
            return SearchVerdict::GoalReached;
        }
        if self.no_improve >= 3 {
            return SearchVerdict::Stalled;
        }
        if trial.latency_ms > latency_threshold {
            return SearchVerdict::LatencyCollapse;
        }
        SearchVerdict::Continue
    }

    pub(crate) fn best_candidate(&self) -> Option<ConfigCandidate> {
        self.best.map(|b| b.candidate)
    }
}

/// Candidate configurations per direction and tier. Downloads never exceed
/// four streams; uploads trade stream count against the in-flight window.
pub(crate) fn candidate_matrix(direction: Direction, tier: SpeedTier) -> Vec<ConfigCandidate> {
    use ConfigCandidate as C;
    match direction {
        Direction::Download => match tier {
            SpeedTier::Slow => vec![C::download(1), C::download(2)],
            SpeedTier::Medium => vec![C::download(2), C::download(3), C::download(4)],
            SpeedTier::Fast => vec![C::download(3), C::download(4)],
            SpeedTier::Gigabit | SpeedTier::Ultragig => vec![C::download(4)],
        },
        Direction::Upload => match tier {
            SpeedTier::Slow => vec![
                C::upload(1, 1),
                C::upload(1, 2),
                C::upload(1, 3),
                C::upload(2, 1),
            ],
            SpeedTier::Medium => vec![
                C::upload(1, 4),
                C::upload(2, 2),
                C::upload(2, 3),
                C::upload(2, 4),
                C::upload(3, 2),
            ],
            SpeedTier::Fast => vec![
                C::upload(2, 6),
                C::upload(3, 4),
                C::upload(3, 6),
                C::upload(4, 4),
            ],
            SpeedTier::Gigabit | SpeedTier::Ultragig => vec![
                C::upload(8, 12),
                C::upload(10, 10),
                C::upload(12, 8),
                C::upload(8, 16),
                C::upload(10, 12),
                C::upload(12, 10),
                C::upload(16, 8),
                C::upload(14, 10),
            ],
        },
    }
}

pub(crate) fn trial_cap(tier: SpeedTier) -> usize {
    match tier {
        SpeedTier::Slow => 3,
        SpeedTier::Medium => 4,
        SpeedTier::Fast => 6,
        SpeedTier::Gigabit | SpeedTier::Ultragig => 8,
    }
}

/// Fallback configuration when no candidate was acceptable.
pub(crate) fn tier_default(
    direction: Direction,
    tier: SpeedTier,
    estimated_mbps: f64,
) -> ConfigCandidate {
    use ConfigCandidate as C;
    match direction {
        Direction::Download => match tier {
            SpeedTier::Slow => C::download(1),
            SpeedTier::Medium => C::download(2),
            SpeedTier::Fast => C::download(3),
            SpeedTier::Gigabit | SpeedTier::Ultragig => C::download(4),
        },
        Direction::Upload => match tier {
            SpeedTier::Slow => C::upload(1, 2),
            SpeedTier::Medium => C::upload(2, 2),
            SpeedTier::Fast => C::upload(3, 4),
            SpeedTier::Gigabit | SpeedTier::Ultragig => {
                if estimated_mbps >= 600.0 {
                    C::upload(16, 8)
                } else {
                    C::upload(8, 12)
                }
            }
        },
    }
}

/// Upload chunk-size candidates per tier, in bytes, ascending.
pub(crate) fn chunk_candidates(tier: SpeedTier) -> &'static [usize] {
    const SLOW: &[usize] = &[64 * KIB];
    const MEDIUM: &[usize] = &[64 * KIB, 128 * KIB];
    const FAST: &[usize] = &[64 * KIB, 128 * KIB, 256 * KIB];
    const GIGABIT: &[usize] = &[256 * KIB, 512 * KIB, MIB, 2 * MIB];
    match tier {
        SpeedTier::Slow => SLOW,
        SpeedTier::Medium => MEDIUM,
        SpeedTier::Fast => FAST,
        SpeedTier::Gigabit | SpeedTier::Ultragig => GIGABIT,
    }
}

pub(crate) fn default_chunk_size(tier: SpeedTier) -> usize {
    match tier {
        SpeedTier::Slow => 64 * KIB,
        SpeedTier::Medium => 128 * KIB,
        SpeedTier::Fast => 256 * KIB,
        SpeedTier::Gigabit | SpeedTier::Ultragig => MIB,
    }
}

/// Size the precision sub-probe so a transfer at the rough estimate takes
/// about 2.5 s, clamped to the per-tier envelope.
pub(crate) fn precise_target_bytes(direction: Direction, rough_mbps: f64) -> u64 {
    let ideal = (rough_mbps * 1_000_000.0 / 8.0 * PRECISE_TRANSFER_SECS) as u64;
    let (lo_mib, hi_mib) = match direction {
        Direction::Download => {
            if rough_mbps < 10.0 {
                (2, 5)
            } else if rough_mbps < 100.0 {
                (5, 25)
            } else if rough_mbps < 500.0 {
                (25, 125)
            } else {
                (125, 500)
            }
        }
        Direction::Upload => {
            if rough_mbps < 5.0 {
                (2, 5)
            } else if rough_mbps < 25.0 {
                (5, 15)
            } else if rough_mbps < 100.0 {
                (15, 50)
            } else if rough_mbps < 500.0 {
                (50, 150)
            } else if rough_mbps < 1500.0 {
                (150, 500)
            } else {
                (500, 1024)
            }
        }
    };
    ideal.clamp(lo_mib * MIB as u64, hi_mib * MIB as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trial(candidate: ConfigCandidate, score: f64, latency: f64, acceptable: bool) -> TrialResult {
        TrialResult {
            candidate,
            throughput_mbps: 0.0,
            latency_ms: latency,
            score,
            acceptable,
            error: None,
        }
    }

    #[test]
    fn download_matrix_never_exceeds_four_streams() {
        for tier in [
            SpeedTier::Slow,
            SpeedTier::Medium,
            SpeedTier::Fast,
            SpeedTier::Gigabit,
            SpeedTier::Ultragig,
        ] {
            for c in candidate_matrix(Direction::Download, tier) {
                assert!(c.stream_count <= 4, "{tier:?} has {}", c.stream_count);
                assert_eq!(c.pending_uploads, 1);
            }
        }
    }

    #[test]
    fn upload_gigabit_matrix_matches_trial_cap() {
        let m = candidate_matrix(Direction::Upload, SpeedTier::Gigabit);
        assert_eq!(m.len(), 8);
        assert_eq!(m[0], ConfigCandidate::upload(8, 12));
        assert!(m.contains(&ConfigCandidate::upload(16, 8)));
        assert_eq!(trial_cap(SpeedTier::Gigabit), 8);
        assert_eq!(trial_cap(SpeedTier::Slow), 3);
        assert_eq!(trial_cap(SpeedTier::Medium), 4);
        assert_eq!(trial_cap(SpeedTier::Fast), 6);
    }

    #[test]
    fn ultragig_aliases_gigabit_for_upload() {
        assert_eq!(
            candidate_matrix(Direction::Upload, SpeedTier::Ultragig),
            candidate_matrix(Direction::Upload, SpeedTier::Gigabit)
        );
        assert_eq!(
            chunk_candidates(SpeedTier::Ultragig),
            chunk_candidates(SpeedTier::Gigabit)
        );
    }

    #[test]
    fn fast_upload_tier_default_is_medium_pressure() {
        assert_eq!(
            tier_default(Direction::Upload, SpeedTier::Medium, 50.0),
            ConfigCandidate::upload(2, 2)
        );
    }

    #[test]
    fn gigabit_upload_default_escalates_at_600_mbps() {
        assert_eq!(
            tier_default(Direction::Upload, SpeedTier::Gigabit, 640.0),
            ConfigCandidate::upload(16, 8)
        );
        assert_eq!(
            tier_default(Direction::Upload, SpeedTier::Gigabit, 400.0),
            ConfigCandidate::upload(8, 12)
        );
    }

    #[test]
    fn precise_target_clamps_to_envelope() {
        // 6 Mbps upload: ideal ~1.9 MiB clamps up to 5 MiB floor of <25.
        let t = precise_target_bytes(Direction::Upload, 6.0);
        assert_eq!(t, 5 * MIB as u64);
        // 400 Mbps upload: ideal 125 MB sits inside the 50-150 MiB band.
        let t = precise_target_bytes(Direction::Upload, 400.0);
        assert_eq!(t, 125_000_000);
        // 2000 Mbps upload: ideal 625 MB sits inside the 500 MiB-1 GiB band.
        let t = precise_target_bytes(Direction::Upload, 2000.0);
        assert_eq!(t, 625_000_000);
        // 3 Mbps download clamps into 2-5 MiB.
        let t = precise_target_bytes(Direction::Download, 3.0);
        assert!(t >= 2 * MIB as u64 && t <= 5 * MIB as u64);
    }

    #[test]
    fn gigabit_chunk_fallback_is_largest_tested() {
        let tested = [256 * KIB, 512 * KIB, MIB, 2 * MIB];
        assert_eq!(
            resolve_chunk_choice(None, &tested, true, SpeedTier::Gigabit),
            2 * MIB
        );
        // A winner always takes precedence over the fallback.
        assert_eq!(
            resolve_chunk_choice(Some(MIB), &tested, true, SpeedTier::Gigabit),
            MIB
        );
        // Preempted before any candidate ran: tier default.
        assert_eq!(
            resolve_chunk_choice(None, &[], true, SpeedTier::Gigabit),
            MIB
        );
        // Non-gigabit tiers fall back to the tier default, not the largest.
        assert_eq!(
            resolve_chunk_choice(None, &[64 * KIB, 128 * KIB], false, SpeedTier::Medium),
            128 * KIB
        );
    }

    #[test]
    fn zero_sample_trial_is_unacceptable() {
        let cfg = WarmupConfig::default();
        let (t, norm) = finalize_trial(
            &cfg,
            ConfigCandidate::upload(2, 2),
            &[],
            10.0,
            100.0,
            20.0,
        );
        assert_eq!(t.throughput_mbps, 0.0);
        assert!(!t.acceptable);
        assert_eq!(norm, 0.0);
    }

    #[test]
    fn scoring_blends_throughput_and_latency() {
        let cfg = WarmupConfig::default();
        // Full throughput at baseline latency: 0.7 + 0.3 * 0.5 = 0.85.
        let (t, norm) = finalize_trial(
            &cfg,
            ConfigCandidate::download(4),
            &[100.0, 100.0],
            20.0,
            100.0,
            20.0,
        );
        assert!((norm - 1.0).abs() < 1e-9);
        assert!((t.score - 0.85).abs() < 1e-9);
        assert!(t.acceptable);
    }

    #[test]
    fn latency_beyond_threshold_is_unacceptable() {
        let cfg = WarmupConfig::default();
        let (t, _) = finalize_trial(
            &cfg,
            ConfigCandidate::upload(2, 6),
            &[150.0],
            220.0,
            200.0,
            40.0,
        );
        assert!(!t.acceptable);
        // Latency score bottoms out at zero rather than going negative.
        assert!(t.score >= 0.0);
    }

    #[test]
    fn search_stops_on_goal_reached() {
        let mut s = SearchTracker::default();
        let c = ConfigCandidate::upload(16, 8);
        let v = s.observe(&trial(c, 0.9, 25.0, true), 0.96, 40.0, 0.95);
        assert_eq!(v, SearchVerdict::GoalReached);
        assert_eq!(s.best_candidate(), Some(c));
    }

    #[test]
    fn search_stalls_after_three_non_improving_trials() {
        let mut s = SearchTracker::default();
        let c = ConfigCandidate::upload(2, 2);
        assert_eq!(
            s.observe(&trial(c, 0.8, 25.0, true), 0.5, 40.0, 0.95),
            SearchVerdict::Continue
        );
        assert_eq!(
            s.observe(&trial(c, 0.5, 25.0, true), 0.4, 40.0, 0.95),
            SearchVerdict::Continue
        );
        assert_eq!(
            s.observe(&trial(c, 0.5, 25.0, true), 0.4, 40.0, 0.95),
            SearchVerdict::Continue
        );
        assert_eq!(
            s.observe(&trial(c, 0.5, 25.0, true), 0.4, 40.0, 0.95),
            SearchVerdict::Stalled
        );
        assert_eq!(s.best_candidate(), Some(c));
    }

    #[test]
    fn latency_collapse_stops_search_with_no_best() {
        // Baseline 40 ms, threshold 80 ms, trial at 220 ms.
        let mut s = SearchTracker::default();
        let c = ConfigCandidate::upload(2, 6);
        let v = s.observe(&trial(c, 0.3, 220.0, false), 0.75, 80.0, 0.95);
        assert_eq!(v, SearchVerdict::LatencyCollapse);
        assert_eq!(s.best_candidate(), None);
        // The caller then falls back to the tier default.
        assert_eq!(
            tier_default(Direction::Upload, SpeedTier::Medium, 150.0),
            ConfigCandidate::upload(2, 2)
        );
    }

    #[test]
    fn unacceptable_trials_never_become_best() {
        let mut s = SearchTracker::default();
        let c = ConfigCandidate::upload(3, 4);
        s.observe(&trial(c, 0.99, 300.0, false), 0.99, 80.0, 0.95);
        assert_eq!(s.best_candidate(), None);
    }

    #[test]
    fn conservative_outcomes_are_flagged() {
        let o = conservative_outcome(Direction::Upload);
        assert!(o.fallback);
        assert_eq!(o.estimated_speed_mbps, DEFAULT_UPLOAD_MBPS);
        assert_eq!(o.tier, SpeedTier::Medium);
        assert_eq!(o.optimal_config, ConfigCandidate::upload(2, 2));
        assert_eq!(o.optimal_chunk_size, Some(128 * KIB));

        let o = conservative_outcome(Direction::Download);
        assert_eq!(o.tier, SpeedTier::Fast);
        assert_eq!(o.optimal_config, ConfigCandidate::download(3));
        assert_eq!(o.optimal_chunk_size, None);
    }
}
