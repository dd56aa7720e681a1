use crate::aggregate::PerSecondBucket;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// What happened to one dispatched request. Times are seconds on the run clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub correlation_id: String,
    pub submit_time: f64,
    pub response_time: f64,
    pub http_status: Option<u16>,
    pub success: bool,
    pub error_text: Option<String>,
}

impl RequestOutcome {
    /// Submit to HTTP reply, in seconds.
    pub fn request_latency_s(&self) -> f64 {
        (self.response_time - self.submit_time).max(0.0)
    }
}

/// A request waiting for its effect to show up in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightEntry {
    pub correlation_id: String,
    pub submit_time: f64,
}

/// Everything the fire phase produced, handed to the confirmation phase.
#[derive(Debug, Default)]
pub struct CollectedRun {
    /// Outcomes in completion order
    pub log: Vec<RequestOutcome>,
    pub in_flight: VecDeque<InFlightEntry>,
}

/// Cheap, cloneable recording side of a [`ResultCollector`].
#[derive(Clone)]
pub struct CollectorHandle {
    tx: mpsc::UnboundedSender<RequestOutcome>,
    live: Arc<SecondCounters>,
}

impl CollectorHandle {
    /// Record one outcome. Never blocks.
    pub fn record(&self, outcome: RequestOutcome) {
        self.live.record(
            outcome.response_time,
            outcome.request_latency_s(),
            outcome.success,
        );
        if self.tx.send(outcome).is_err() {
            warn!("Result collector already finished; outcome dropped");
        }
    }
}

/// Owns the result log and the in-flight queue while the fire phase runs.
///
/// Outcomes arrive over an unbounded channel so `record` is a plain append
/// from any number of completing requests. `finish` is the phase barrier:
/// it resolves once every handle is dropped and hands the frozen state over.
pub struct ResultCollector {
    handle: CollectorHandle,
    task: JoinHandle<CollectedRun>,
}

impl ResultCollector {
    pub fn spawn(live: Arc<SecondCounters>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RequestOutcome>();

        let task = tokio::spawn(async move {
            let mut run = CollectedRun::default();
            while let Some(outcome) = rx.recv().await {
                // failed requests are polled too: the store may have the row anyway
                if !outcome.correlation_id.is_empty() {
                    run.in_flight.push_back(InFlightEntry {
                        correlation_id: outcome.correlation_id.clone(),
                        submit_time: outcome.submit_time,
                    });
                }
                run.log.push(outcome);
            }
            run
        });

        Self {
            handle: CollectorHandle { tx, live },
            task,
        }
    }

    pub fn handle(&self) -> CollectorHandle {
        self.handle.clone()
    }

    /// Wait for all handles to drop, then take the collected state.
    pub async fn finish(self) -> Result<CollectedRun> {
        drop(self.handle);
        self.task.await.context("result collector task failed")
    }
}

#[derive(Debug, Default)]
struct BucketSlot {
    total: AtomicU64,
    ok: AtomicU64,
    fail: AtomicU64,
    latency_us: AtomicU64,
}

/// Upper bound on tracked seconds; later responses share the last slot.
pub const MAX_TRACKED_SECONDS: usize = 86_400;

/// Per-second response counters updated lock-free from completing requests.
///
/// Slots are indexed by the integer second of the response relative to the
/// fire-phase start. The last slot absorbs anything past the planned range.
#[derive(Debug)]
pub struct SecondCounters {
    slots: Vec<BucketSlot>,
}

impl SecondCounters {
    pub fn new(duration_s: f64) -> Self {
        let seconds = (duration_s.max(0.0).ceil() as usize).min(MAX_TRACKED_SECONDS) + 2;
        Self {
            slots: (0..seconds).map(|_| BucketSlot::default()).collect(),
        }
    }

    pub fn record(&self, response_time: f64, latency_s: f64, success: bool) {
        let second = response_time.max(0.0).floor() as usize;
        let slot = &self.slots[second.min(self.slots.len() - 1)];
        slot.total.fetch_add(1, Ordering::Relaxed);
        slot.latency_us.fetch_add((latency_s * 1e6).round() as u64, Ordering::Relaxed);
        if success {
            slot.ok.fetch_add(1, Ordering::Relaxed);
        } else {
            slot.fail.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> Vec<PerSecondBucket> {
        self.slots
            .iter()
            .enumerate()
            .map(|(idx, slot)| {
                let total = slot.total.load(Ordering::Relaxed);
                let latency_us = slot.latency_us.load(Ordering::Relaxed);
                PerSecondBucket {
                    second: idx as u64,
                    total,
                    ok: slot.ok.load(Ordering::Relaxed),
                    fail: slot.fail.load(Ordering::Relaxed),
                    avg_latency_ms: if total > 0 {
                        latency_us as f64 / 1_000.0 / total as f64
                    } else {
                        0.0
                    },
                }
            })
            .collect()
    }

    /// (total, ok, fail) across all slots
    pub fn totals(&self) -> (u64, u64, u64) {
        self.slots.iter().fold((0, 0, 0), |(t, o, f), slot| {
            (
                t + slot.total.load(Ordering::Relaxed),
                o + slot.ok.load(Ordering::Relaxed),
                f + slot.fail.load(Ordering::Relaxed),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, submit: f64, response: f64, success: bool) -> RequestOutcome {
        RequestOutcome {
            correlation_id: id.to_string(),
            submit_time: submit,
            response_time: response,
            http_status: if success { Some(200) } else { None },
            success,
            error_text: if success {
                None
            } else {
                Some("connection refused".to_string())
            },
        }
    }

    #[tokio::test]
    async fn test_collector_appends_in_completion_order() {
        let collector = ResultCollector::spawn(Arc::new(SecondCounters::new(2.0)));
        let handle = collector.handle();

        handle.record(outcome("b", 0.2, 0.3, true));
        handle.record(outcome("a", 0.1, 0.5, true));
        drop(handle);

        let run = collector.finish().await.unwrap();
        let ids: Vec<&str> = run.log.iter().map(|o| o.correlation_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(run.in_flight.len(), 2);
        assert_eq!(run.in_flight[1].submit_time, 0.1);
    }

    #[tokio::test]
    async fn test_failures_enter_in_flight_but_empty_ids_do_not() {
        let collector = ResultCollector::spawn(Arc::new(SecondCounters::new(1.0)));
        let handle = collector.handle();

        handle.record(outcome("failed", 0.0, 0.1, false));
        handle.record(outcome("", 0.0, 0.1, true));
        drop(handle);

        let run = collector.finish().await.unwrap();
        assert_eq!(run.log.len(), 2);
        assert_eq!(run.in_flight.len(), 1);
        assert_eq!(run.in_flight[0].correlation_id, "failed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_are_not_lost() {
        let live = Arc::new(SecondCounters::new(3.0));
        let collector = ResultCollector::spawn(live.clone());

        let mut tasks = Vec::new();
        for t in 0..8 {
            let handle = collector.handle();
            tasks.push(tokio::spawn(async move {
                for i in 0..250 {
                    let response = (i % 3) as f64 + 0.5;
                    handle.record(outcome(&format!("{t}-{i}"), 0.0, response, i % 5 != 0));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let run = collector.finish().await.unwrap();
        assert_eq!(run.log.len(), 2000);
        assert_eq!(run.in_flight.len(), 2000);
        assert_eq!(live.totals(), (2000, 1600, 400));
        let snapshot = live.snapshot();
        assert_eq!(snapshot[0].total + snapshot[1].total + snapshot[2].total, 2000);
    }

    #[test]
    fn test_second_counters_overflow_slot() {
        let live = SecondCounters::new(1.0);
        live.record(0.4, 0.1, true);
        live.record(0.9, 0.3, true);
        live.record(1.2, 0.05, false);
        live.record(42.0, 1.0, true);

        let snapshot = live.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].ok, 2);
        assert_eq!(snapshot[0].avg_latency_ms, 200.0);
        assert_eq!(snapshot[1].fail, 1);
        assert_eq!(snapshot[2].total, 1);
        assert_eq!(snapshot[2].avg_latency_ms, 1_000.0);
    }

    #[test]
    fn test_second_counters_slot_count_is_capped() {
        let live = SecondCounters::new(1e12);
        assert_eq!(live.snapshot().len(), MAX_TRACKED_SECONDS + 2);
        live.record(1e9, 0.01, true);
        assert_eq!(live.snapshot()[MAX_TRACKED_SECONDS + 1].total, 1);
    }
}
