use crate::clock::RunClock;
use crate::collector::InFlightEntry;
use crate::config::StoreConfig;
use crate::store::ConfirmationStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Final confirmation state of one correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    pub correlation_id: String,
    pub found: bool,
    /// Run-clock seconds at which the poller saw the row
    pub confirmed_at: Option<f64>,
    pub store_timestamp: Option<String>,
}

pub type ConfirmationMap = HashMap<String, ConfirmationRecord>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollReport {
    pub batches: u64,
    pub query_failures: u64,
    pub confirmed: u64,
    pub expired: u64,
    pub elapsed_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollState {
    Polling,
    Draining,
    Done,
}

/// Confirms in-flight requests against the store in batches until every
/// entry is found or the deadline passes.
pub struct ConfirmationPoller {
    store: Arc<dyn ConfirmationStore>,
    batch_size: usize,
    interval: Duration,
    deadline_after: Duration,
}

impl ConfirmationPoller {
    pub fn new(store: Arc<dyn ConfirmationStore>, config: &StoreConfig) -> Self {
        Self {
            store,
            batch_size: config.batch_size.max(1),
            interval: config.poll_interval(),
            deadline_after: config.db_timeout(),
        }
    }

    /// Takes ownership of the in-flight queue. Every id that entered it ends
    /// up with exactly one record. Cancel skips straight to draining.
    pub async fn run(
        &self,
        mut queue: VecDeque<InFlightEntry>,
        clock: &RunClock,
        cancel: &CancellationToken,
    ) -> (ConfirmationMap, PollReport) {
        let started = Instant::now();
        let deadline = started + self.deadline_after;
        let mut records = ConfirmationMap::with_capacity(queue.len());
        let mut report = PollReport::default();
        let mut state = PollState::Polling;

        info!(
            "Confirming {} requests against {} store (timeout {}ms, batch {})",
            queue.len(),
            self.store.name(),
            self.deadline_after.as_millis(),
            self.batch_size
        );

        while state != PollState::Done {
            state = match state {
                PollState::Polling => {
                    if queue.is_empty() || Instant::now() >= deadline || cancel.is_cancelled() {
                        PollState::Draining
                    } else {
                        let newly = self
                            .poll_batch(&mut queue, &mut records, &mut report, deadline, clock)
                            .await;
                        if newly == 0 && !queue.is_empty() {
                            let wake = (Instant::now() + self.interval).min(deadline);
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = sleep_until(wake) => {}
                            }
                        }
                        PollState::Polling
                    }
                }
                PollState::Draining => {
                    for entry in queue.drain(..) {
                        if records.contains_key(&entry.correlation_id) {
                            continue;
                        }
                        report.expired += 1;
                        records.insert(
                            entry.correlation_id.clone(),
                            ConfirmationRecord {
                                correlation_id: entry.correlation_id,
                                found: false,
                                confirmed_at: None,
                                store_timestamp: None,
                            },
                        );
                    }
                    PollState::Done
                }
                PollState::Done => PollState::Done,
            };
        }

        report.elapsed_s = started.elapsed().as_secs_f64();
        info!(
            "Confirmation done: {} confirmed, {} expired, {} batches, {} query failures in {:.2}s",
            report.confirmed,
            report.expired,
            report.batches,
            report.query_failures,
            report.elapsed_s
        );
        (records, report)
    }

    /// One store round-trip. Returns how many ids were newly confirmed;
    /// everything else goes back on the tail of the queue.
    async fn poll_batch(
        &self,
        queue: &mut VecDeque<InFlightEntry>,
        records: &mut ConfirmationMap,
        report: &mut PollReport,
        deadline: Instant,
        clock: &RunClock,
    ) -> u64 {
        let take = self.batch_size.min(queue.len());
        let batch: Vec<InFlightEntry> = queue.drain(..take).collect();
        let ids: Vec<String> = batch.iter().map(|e| e.correlation_id.clone()).collect();
        report.batches += 1;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let hits = match timeout(remaining, self.store.check_existence(&ids)).await {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                report.query_failures += 1;
                warn!("Store query failed, requeueing {} ids: {:#}", ids.len(), e);
                HashMap::new()
            }
            Err(_) => {
                debug!("Store query outlived the confirmation deadline");
                HashMap::new()
            }
        };
        let seen_at = clock.now_s();

        let mut newly = 0;
        for entry in batch {
            if records.contains_key(&entry.correlation_id) {
                // duplicate id already confirmed by an earlier entry
                continue;
            }
            match hits.get(&entry.correlation_id) {
                Some(hit) if hit.found => {
                    newly += 1;
                    records.insert(
                        entry.correlation_id.clone(),
                        ConfirmationRecord {
                            correlation_id: entry.correlation_id,
                            found: true,
                            confirmed_at: Some(seen_at),
                            store_timestamp: hit.store_timestamp.clone(),
                        },
                    );
                }
                _ => queue.push_back(entry),
            }
        }

        report.confirmed += newly;
        debug!(
            "Batch of {} ids: {} confirmed, {} still pending",
            ids.len(),
            newly,
            queue.len()
        );
        newly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreFuture};

    fn store_config(timeout_ms: u64, batch_size: usize) -> StoreConfig {
        StoreConfig {
            db_timeout_ms: timeout_ms,
            batch_size,
            ..StoreConfig::default()
        }
    }

    fn entries(ids: &[&str]) -> VecDeque<InFlightEntry> {
        ids.iter()
            .map(|id| InFlightEntry {
                correlation_id: id.to_string(),
                submit_time: 0.0,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_found_first_batch() {
        let store = Arc::new(MemoryStore::new());
        for id in ["a", "b", "c"] {
            store.insert_after(id, Duration::ZERO).await;
        }
        let poller = ConfirmationPoller::new(store.clone(), &store_config(1_000, 500));
        let clock = RunClock::start();

        let (records, report) = poller
            .run(entries(&["a", "b", "c"]), &clock, &CancellationToken::new())
            .await;

        assert_eq!(records.len(), 3);
        assert!(records.values().all(|r| r.found && r.confirmed_at == Some(0.0)));
        assert!(records.values().all(|r| r.store_timestamp.is_some()));
        assert_eq!(report.batches, 1);
        assert_eq!(store.query_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_found_expires_at_deadline() {
        let store = Arc::new(MemoryStore::new());
        let poller = ConfirmationPoller::new(store.clone(), &store_config(1_000, 500));
        let clock = RunClock::start();

        let ids: Vec<String> = (0..10).map(|i| format!("id-{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let (records, report) = poller
            .run(entries(&refs), &clock, &CancellationToken::new())
            .await;

        assert_eq!(records.len(), 10);
        assert!(records
            .values()
            .all(|r| !r.found && r.confirmed_at.is_none() && r.store_timestamp.is_none()));
        assert_eq!(report.expired, 10);
        // 100ms between empty batches: not earlier than the deadline, not much later
        assert!(clock.now_s() >= 1.0 && clock.now_s() < 1.1);
        assert!(store.query_count() >= 9 && store.query_count() <= 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_until_visible() {
        let store = Arc::new(MemoryStore::new());
        store.insert_after("slow", Duration::from_millis(350)).await;
        store.insert_after("fast", Duration::ZERO).await;
        let poller = ConfirmationPoller::new(store.clone(), &store_config(5_000, 1));
        let clock = RunClock::start();

        let (records, report) = poller
            .run(entries(&["slow", "fast"]), &clock, &CancellationToken::new())
            .await;

        assert!(records["fast"].found);
        assert!(records["slow"].found);
        let slow_at = records["slow"].confirmed_at.unwrap();
        assert!((0.35..0.5).contains(&slow_at), "slow confirmed at {slow_at}");
        assert_eq!(report.confirmed, 2);
        assert_eq!(report.expired, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_failures_requeue() {
        let store = Arc::new(MemoryStore::new());
        store.insert_after("a", Duration::ZERO).await;
        store.fail_next_queries(3);
        let poller = ConfirmationPoller::new(store.clone(), &store_config(2_000, 500));
        let clock = RunClock::start();

        let (records, report) = poller
            .run(entries(&["a"]), &clock, &CancellationToken::new())
            .await;

        assert!(records["a"].found);
        assert_eq!(report.query_failures, 3);
        assert_eq!(report.batches, 4);
        // three failed cycles of 100ms each
        assert!((records["a"].confirmed_at.unwrap() - 0.3).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_ids_get_one_record() {
        let store = Arc::new(MemoryStore::new());
        store.insert_after("dup", Duration::ZERO).await;
        let poller = ConfirmationPoller::new(store.clone(), &store_config(500, 500));
        let clock = RunClock::start();

        let (records, report) = poller
            .run(
                entries(&["dup", "dup", "missing", "missing"]),
                &clock,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(records.len(), 2);
        assert!(records["dup"].found);
        assert!(!records["missing"].found);
        assert_eq!(report.confirmed, 1);
        assert_eq!(report.expired, 1);
    }

    struct HangingStore;

    impl ConfirmationStore for HangingStore {
        fn name(&self) -> &'static str {
            "hanging"
        }

        fn check_existence<'a>(&'a self, _ids: &'a [String]) -> StoreFuture<'a> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_store_still_terminates() {
        let poller = ConfirmationPoller::new(Arc::new(HangingStore), &store_config(1_000, 500));
        let clock = RunClock::start();

        let (records, _) = poller
            .run(entries(&["a", "b"]), &clock, &CancellationToken::new())
            .await;

        assert_eq!(records.len(), 2);
        assert!(records.values().all(|r| !r.found));
        assert!((clock.now_s() - 1.0).abs() < 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drains_immediately() {
        let store = Arc::new(MemoryStore::new());
        let poller = ConfirmationPoller::new(store, &store_config(60_000, 500));
        let clock = RunClock::start();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (records, report) = poller.run(entries(&["a"]), &clock, &cancel).await;
        assert!(!records["a"].found);
        assert_eq!(report.batches, 0);
        assert_eq!(clock.now_s(), 0.0);
    }

    #[tokio::test]
    async fn test_empty_queue_returns_immediately() {
        let store = Arc::new(MemoryStore::new());
        let poller = ConfirmationPoller::new(store, &store_config(60_000, 500));
        let clock = RunClock::start();
        let (records, report) = poller
            .run(VecDeque::new(), &clock, &CancellationToken::new())
            .await;
        assert!(records.is_empty());
        assert_eq!(report.batches, 0);
    }
}
