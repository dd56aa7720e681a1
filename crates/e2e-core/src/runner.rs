use crate::aggregate::{aggregate, Aggregate, RunSummary, RunWindow};
use crate::clock::RunClock;
use crate::collector::{CollectedRun, RequestOutcome, ResultCollector, SecondCounters};
use crate::config::Config;
use crate::executor::{Dispatcher, Executor, ExecutorReport};
use crate::poller::{ConfirmationMap, ConfirmationPoller, PollReport};
use crate::scheduler::{run_scheduler, SchedulerReport, TickPlan};
use crate::store::ConfirmationStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Collaborators shared by every run of a session.
pub struct RunContext {
    pub config: Config,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub store: Arc<dyn ConfirmationStore>,
    /// Operator abort
    pub cancel: CancellationToken,
    /// Progress log interval; `None` disables it
    pub progress_every: Option<Duration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirePhaseReport {
    pub planned: u64,
    pub emitted: u64,
    pub late_ticks: u64,
    pub dispatched: u64,
    pub abandoned: u64,
}

impl FirePhaseReport {
    fn new(scheduler: &SchedulerReport, executor: &ExecutorReport) -> Self {
        Self {
            planned: scheduler.planned,
            emitted: scheduler.emitted,
            late_ticks: scheduler.late,
            dispatched: executor.dispatched,
            abandoned: executor.abandoned,
        }
    }
}

/// Frozen output of one run.
#[derive(Debug)]
pub struct RunReport {
    pub rate: f64,
    pub started_at: DateTime<Utc>,
    pub window: RunWindow,
    pub log: Vec<RequestOutcome>,
    pub confirmations: ConfirmationMap,
    pub aggregate: Aggregate,
    pub fire: FirePhaseReport,
    pub poll: PollReport,
    pub aborted: bool,
}

impl RunReport {
    pub fn summary(&self) -> &RunSummary {
        &self.aggregate.summary
    }
}

/// One summary row per rate, in run order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepSummary {
    pub runs: Vec<RunSummary>,
    /// Requested rate with the highest mean throughput
    pub peak_rate: Option<f64>,
    pub peak_mean_tps: Option<f64>,
}

impl SweepSummary {
    pub fn from_runs(runs: Vec<RunSummary>) -> Self {
        let peak = runs
            .iter()
            .max_by(|a, b| a.mean_tps.total_cmp(&b.mean_tps));
        Self {
            peak_rate: peak.map(|s| s.requested_rate),
            peak_mean_tps: peak.map(|s| s.mean_tps),
            runs,
        }
    }
}

#[derive(Debug)]
pub struct SweepReport {
    pub runs: Vec<RunReport>,
    pub summary: SweepSummary,
}

/// Warm-up, fire, confirm, aggregate, for one target rate.
pub async fn run_once(ctx: &RunContext, rate: f64) -> Result<RunReport> {
    let config = &ctx.config;

    if config.run.warmup_s > 0.0 {
        info!("Warm-up: {} req/s for {}s", rate, config.run.warmup_s);
        let clock = RunClock::start();
        let (warm, report) = fire_phase(ctx, rate, config.run.warmup_s, clock).await?;
        info!(
            "Warm-up done: {} responses discarded ({} dispatched)",
            warm.log.len(),
            report.dispatched
        );
        if ctx.cancel.is_cancelled() {
            info!("Abort during warm-up; skipping measured run");
        }
    }

    let clock = RunClock::start();
    let started_at = clock.wall_origin();
    info!(
        "Fire phase: {} req/s for {}s ({:?} pacing, max {} in flight)",
        rate, config.run.duration_s, config.run.pacing, config.target.max_in_flight
    );
    let (collected, fire) = if ctx.cancel.is_cancelled() {
        (CollectedRun::default(), FirePhaseReport::default())
    } else {
        fire_phase(ctx, rate, config.run.duration_s, clock).await?
    };
    let window = RunWindow {
        start: 0.0,
        stop: clock.now_s(),
    };
    info!(
        "Fire phase done in {:.2}s: {} of {} ticks dispatched, {} responses",
        window.duration_s(),
        fire.dispatched,
        fire.planned,
        collected.log.len()
    );

    // the collector is finished, so the queue is ours alone now
    let CollectedRun { log, in_flight } = collected;
    let poller = ConfirmationPoller::new(ctx.store.clone(), &config.store);
    let (confirmations, poll) = poller.run(in_flight, &clock, &ctx.cancel).await;

    let aggregate = aggregate(&log, &confirmations, window, rate);

    Ok(RunReport {
        rate,
        started_at,
        window,
        log,
        confirmations,
        aggregate,
        fire,
        poll,
        aborted: ctx.cancel.is_cancelled(),
    })
}

/// `run_once` per rate, in order. Stops early on abort.
pub async fn run_sweep(ctx: &RunContext, rates: &[f64]) -> Result<SweepReport> {
    let mut runs = Vec::with_capacity(rates.len());
    for (idx, &rate) in rates.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            info!("Abort requested; skipping remaining {} rates", rates.len() - idx);
            break;
        }
        info!("Sweep point {}/{}: {} req/s", idx + 1, rates.len(), rate);
        runs.push(run_once(ctx, rate).await?);
    }

    let summary = SweepSummary::from_runs(runs.iter().map(|r| r.summary().clone()).collect());
    Ok(SweepReport { runs, summary })
}

/// Scheduler → executor → collector, joined before returning.
async fn fire_phase(
    ctx: &RunContext,
    rate: f64,
    duration_s: f64,
    clock: RunClock,
) -> Result<(CollectedRun, FirePhaseReport)> {
    let config = &ctx.config;
    let plan = TickPlan::new(rate, duration_s, config.run.pacing);

    let live = Arc::new(SecondCounters::new(duration_s));
    let collector = ResultCollector::spawn(live.clone());
    let executor = Executor::new(
        ctx.dispatcher.clone(),
        &config.target,
        &config.payload,
        clock,
        collector.handle(),
    );
    let gate = executor.gate();

    let (tick_tx, tick_rx) = mpsc::channel(tick_channel_capacity(rate));
    let scheduler = tokio::spawn(run_scheduler(
        plan,
        clock.origin(),
        tick_tx,
        ctx.cancel.clone(),
    ));

    let progress_stop = CancellationToken::new();
    let progress = ctx.progress_every.map(|every| {
        tokio::spawn(report_progress(
            live.clone(),
            clock,
            gate,
            config.target.max_in_flight as usize,
            every,
            progress_stop.clone(),
        ))
    });

    let executor_report = executor
        .run(tick_rx, ctx.cancel.clone(), config.run.drain_grace())
        .await?;
    let scheduler_report = scheduler.await.context("scheduler task failed")?;

    progress_stop.cancel();
    if let Some(handle) = progress {
        handle.await.context("progress reporter failed")?;
    }

    let collected = collector.finish().await?;
    Ok((
        collected,
        FirePhaseReport::new(&scheduler_report, &executor_report),
    ))
}

/// Largest tick buffer handed to the executor.
const MAX_TICK_BUFFER: usize = 65_536;

/// Two seconds of ticks, so short executor stalls do not block the scheduler.
fn tick_channel_capacity(rate: f64) -> usize {
    ((rate * 2.0).ceil() as usize).clamp(1, MAX_TICK_BUFFER)
}

async fn report_progress(
    live: Arc<SecondCounters>,
    clock: RunClock,
    gate: Arc<Semaphore>,
    max_in_flight: usize,
    every: Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = interval.tick() => {}
        }
        let (total, ok, fail) = live.totals();
        let in_flight = max_in_flight.saturating_sub(gate.available_permits());
        // last complete second
        let last_tps = (clock.now_s().floor() as usize)
            .checked_sub(1)
            .and_then(|s| live.snapshot().get(s).map(|b| b.total))
            .unwrap_or(0);
        info!(
            "Progress: responses={} ok={} fail={} in_flight={} last_tps={}",
            total, ok, fail, in_flight, last_tps
        );
    }
}
