use crate::collector::RequestOutcome;
use crate::poller::ConfirmationMap;
use serde::{Deserialize, Serialize};

/// Responses observed during one integer second of the fire phase.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PerSecondBucket {
    pub second: u64,
    pub total: u64,
    pub ok: u64,
    pub fail: u64,
    /// Mean request/response latency of this second's responses, 0 when empty
    pub avg_latency_ms: f64,
}

/// Fire-phase window on the run clock, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunWindow {
    pub start: f64,
    pub stop: f64,
}

impl RunWindow {
    pub fn duration_s(&self) -> f64 {
        (self.stop - self.start).max(0.0)
    }
}

/// Summary of one run (or one point of a sweep).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub requested_rate: f64,
    pub duration_s: f64,
    pub total: u64,
    pub ok: u64,
    pub fail: u64,
    pub confirmed: u64,
    pub ok_ratio: f64,
    pub confirm_ratio: f64,
    pub mean_tps: f64,
    pub max_tps: u64,
    pub latency_p50_s: Option<f64>,
    pub latency_p95_s: Option<f64>,
    pub latency_p99_s: Option<f64>,
    pub latency_mean_s: Option<f64>,
    pub latency_max_s: Option<f64>,
    /// Request/response latency (submit to HTTP reply), all outcomes
    pub request_latency_mean_s: Option<f64>,
    pub request_latency_p50_s: Option<f64>,
    pub request_latency_p95_s: Option<f64>,
}

/// Everything derived from a frozen run.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub buckets: Vec<PerSecondBucket>,
    /// End-to-end latencies, ascending
    pub latencies: Vec<f64>,
    pub summary: RunSummary,
}

impl Aggregate {
    /// Empirical CDF points `(latency, i/n)` for plotting.
    pub fn latency_cdf(&self) -> Vec<(f64, f64)> {
        latency_cdf(&self.latencies)
    }
}

/// Nearest-rank percentile: `sorted[round(q * (n - 1))]`, ties to even.
pub fn nearest_rank(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let last = sorted.len() - 1;
    let idx = (q.clamp(0.0, 1.0) * last as f64).round_ties_even() as usize;
    Some(sorted[idx.min(last)])
}

pub fn latency_cdf(sorted: &[f64]) -> Vec<(f64, f64)> {
    let n = sorted.len() as f64;
    sorted
        .iter()
        .enumerate()
        .map(|(i, &latency)| (latency, (i + 1) as f64 / n))
        .collect()
}

/// Bucket responses by `floor(response_time - start)` across
/// `[0, ceil(stop - start)]`, zero-filled. A response past the window
/// widens the series rather than being dropped.
pub fn per_second_buckets(log: &[RequestOutcome], window: RunWindow) -> Vec<PerSecondBucket> {
    let horizon = window.duration_s().ceil() as usize + 1;
    let mut buckets: Vec<PerSecondBucket> = (0..horizon)
        .map(|s| PerSecondBucket {
            second: s as u64,
            ..Default::default()
        })
        .collect();
    let mut latency_sums = vec![0.0; horizon];

    for outcome in log {
        let second = (outcome.response_time - window.start).max(0.0).floor() as usize;
        while buckets.len() <= second {
            let next = buckets.len() as u64;
            buckets.push(PerSecondBucket {
                second: next,
                ..Default::default()
            });
            latency_sums.push(0.0);
        }
        let bucket = &mut buckets[second];
        bucket.total += 1;
        if outcome.success {
            bucket.ok += 1;
        } else {
            bucket.fail += 1;
        }
        latency_sums[second] += outcome.request_latency_s();
    }

    for (bucket, sum) in buckets.iter_mut().zip(latency_sums) {
        if bucket.total > 0 {
            bucket.avg_latency_ms = sum * 1_000.0 / bucket.total as f64;
        }
    }
    buckets
}

/// `response_time - submit_time` for every outcome, ascending.
pub fn request_latency_samples(log: &[RequestOutcome]) -> Vec<f64> {
    let mut samples: Vec<f64> = log.iter().map(RequestOutcome::request_latency_s).collect();
    samples.sort_by(f64::total_cmp);
    samples
}

fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

/// `confirmed_at - submit_time` for every outcome whose id was found, ascending.
pub fn latency_samples(log: &[RequestOutcome], confirmations: &ConfirmationMap) -> Vec<f64> {
    let mut samples: Vec<f64> = log
        .iter()
        .filter(|o| !o.correlation_id.is_empty())
        .filter_map(|o| {
            let record = confirmations.get(&o.correlation_id)?;
            if !record.found {
                return None;
            }
            record.confirmed_at.map(|at| at - o.submit_time)
        })
        .collect();
    samples.sort_by(f64::total_cmp);
    samples
}

/// Pure function of its inputs: same log and map, same result.
pub fn aggregate(
    log: &[RequestOutcome],
    confirmations: &ConfirmationMap,
    window: RunWindow,
    requested_rate: f64,
) -> Aggregate {
    let buckets = per_second_buckets(log, window);
    let latencies = latency_samples(log, confirmations);
    let request_latencies = request_latency_samples(log);

    let total = log.len() as u64;
    let ok = log.iter().filter(|o| o.success).count() as u64;
    let fail = total - ok;
    let confirmed = latencies.len() as u64;

    let ratio = |part: u64| {
        if total > 0 {
            part as f64 / total as f64
        } else {
            0.0
        }
    };

    let mean_tps = if buckets.is_empty() {
        0.0
    } else {
        buckets.iter().map(|b| b.total).sum::<u64>() as f64 / buckets.len() as f64
    };
    let max_tps = buckets.iter().map(|b| b.total).max().unwrap_or(0);

    let summary = RunSummary {
        requested_rate,
        duration_s: window.duration_s(),
        total,
        ok,
        fail,
        confirmed,
        ok_ratio: ratio(ok),
        confirm_ratio: ratio(confirmed),
        mean_tps,
        max_tps,
        latency_p50_s: nearest_rank(&latencies, 0.50),
        latency_p95_s: nearest_rank(&latencies, 0.95),
        latency_p99_s: nearest_rank(&latencies, 0.99),
        latency_mean_s: mean(&latencies),
        latency_max_s: latencies.last().copied(),
        request_latency_mean_s: mean(&request_latencies),
        request_latency_p50_s: nearest_rank(&request_latencies, 0.50),
        request_latency_p95_s: nearest_rank(&request_latencies, 0.95),
    };

    Aggregate {
        buckets,
        latencies,
        summary,
    }
}
