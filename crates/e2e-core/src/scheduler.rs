use crate::config::Pacing;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A tick emitted later than this past its due time counts as late.
const LATE_THRESHOLD: Duration = Duration::from_millis(10);

/// One scheduled dispatch. Consumed exactly once by the executor.
#[derive(Debug, Clone, Copy)]
pub struct FireTick {
    pub index: u64,
    pub due: Instant,
}

/// Fire-time plan: `round(rate * duration)` ticks, each with a fixed offset
/// from a single start instant.
#[derive(Debug, Clone)]
pub struct TickPlan {
    rate: f64,
    total: u64,
    pacing: Pacing,
}

impl TickPlan {
    pub fn new(rate: f64, duration_s: f64, pacing: Pacing) -> Self {
        let total = if rate > 0.0 && duration_s > 0.0 {
            (rate * duration_s).round() as u64
        } else {
            0
        };
        Self {
            rate,
            total,
            pacing,
        }
    }

    pub fn total_ticks(&self) -> u64 {
        self.total
    }

    /// Offset of tick `n` from the start instant.
    pub fn offset(&self, n: u64) -> Duration {
        match self.pacing {
            Pacing::Smooth => Duration::from_nanos((n as f64 * 1e9 / self.rate).round() as u64),
            Pacing::PerSecond => Duration::from_secs(self.second_of(n)),
        }
    }

    /// Ticks that belong to seconds before `s` under per-second pacing.
    fn cumulative(&self, s: u64) -> u64 {
        ((self.rate * s as f64).round() as u64).min(self.total)
    }

    /// Second whose batch contains tick `n`.
    fn second_of(&self, n: u64) -> u64 {
        let mut s = (n as f64 / self.rate).floor() as u64;
        while s > 0 && n < self.cumulative(s) {
            s -= 1;
        }
        while n >= self.cumulative(s + 1) {
            s += 1;
        }
        s
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerReport {
    pub planned: u64,
    pub emitted: u64,
    pub late: u64,
    pub cancelled: bool,
}

/// Emit every tick of `plan` at `start + plan.offset(n)`.
///
/// The schedule never slips: when the channel is full the send blocks, and
/// once space frees the overdue ticks go out immediately, in order. Stops
/// early when `cancel` fires or the receiver is gone.
pub async fn run_scheduler(
    plan: TickPlan,
    start: Instant,
    tx: mpsc::Sender<FireTick>,
    cancel: CancellationToken,
) -> SchedulerReport {
    let mut report = SchedulerReport {
        planned: plan.total_ticks(),
        ..Default::default()
    };

    for index in 0..plan.total_ticks() {
        let due = start + plan.offset(index);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                report.cancelled = true;
                break;
            }
            _ = sleep_until(due) => {}
        }

        let tick = FireTick { index, due };
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                report.cancelled = true;
                break;
            }
            res = tx.send(tick) => res.is_ok(),
        };
        if !sent {
            debug!("Tick receiver closed after {} ticks", report.emitted);
            break;
        }

        if Instant::now().saturating_duration_since(due) > LATE_THRESHOLD {
            report.late += 1;
        }
        report.emitted += 1;
    }

    if report.late > 0 {
        warn!(
            "{} of {} ticks were emitted more than {}ms late (executor saturated)",
            report.late,
            report.emitted,
            LATE_THRESHOLD.as_millis()
        );
    }

    report
}
