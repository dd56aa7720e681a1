//! Full runs against the in-process dispatcher and store, on paused time.

use e2e_core::{run_once, run_sweep, Config, MemoryStore, MockDispatcher, RunContext};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config(extra_run: &str, extra_target: &str) -> Config {
    let text = format!(
        r#"
[run]
rate = 10.0
duration_s = 1.0
{extra_run}

[target]
urls = ["http://localhost:8080/payments"]
{extra_target}
"#
    );
    let mut config: Config = toml::from_str(&text).unwrap();
    config.store.poll_interval_ms = 10;
    config.store.db_timeout_ms = 5_000;
    config.validate(false).unwrap();
    config
}

fn context(config: Config, dispatcher: Arc<MockDispatcher>, store: Arc<MemoryStore>) -> RunContext {
    RunContext {
        config,
        dispatcher,
        store,
        cancel: CancellationToken::new(),
        progress_every: None,
    }
}

fn persisting(latency_ms: u64, persist_ms: u64) -> (Arc<MockDispatcher>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(
        MockDispatcher::new(Duration::from_millis(latency_ms))
            .persisting_into(store.clone(), Duration::from_millis(persist_ms)),
    );
    (dispatcher, store)
}

#[tokio::test(start_paused = true)]
async fn test_every_request_confirmed_with_store_delay() {
    let (dispatcher, store) = persisting(5, 50);
    let ctx = context(
        config(r#"pacing = "per_second""#, ""),
        dispatcher.clone(),
        store.clone(),
    );

    let report = run_once(&ctx, 10.0).await.unwrap();
    let s = report.summary();

    assert_eq!((s.total, s.ok, s.fail, s.confirmed), (10, 10, 0, 10));
    assert_eq!(s.ok_ratio, 1.0);
    assert_eq!(s.confirm_ratio, 1.0);
    assert!(!report.aborted);
    assert_eq!(report.fire.planned, 10);
    assert_eq!(report.fire.dispatched, 10);
    assert_eq!(store.row_count().await, 10);

    // 50ms ingestion delay, observed within one 10ms poll interval
    let p50 = s.latency_p50_s.unwrap();
    assert!((0.05..0.07).contains(&p50), "p50 was {p50}");
    assert!(report.confirmations.values().all(|r| r.found));
    assert_eq!(report.aggregate.buckets[0].total, 10);
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_requests_expire_at_deadline() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(MockDispatcher::new(Duration::from_millis(5)));
    let mut config = config("", "");
    config.store.db_timeout_ms = 1_000;
    config.store.poll_interval_ms = 100;
    let ctx = context(config, dispatcher, store);

    let report = run_once(&ctx, 10.0).await.unwrap();

    assert_eq!(report.summary().total, 10);
    assert_eq!(report.summary().ok, 10);
    assert_eq!(report.summary().confirmed, 0);
    assert_eq!(report.summary().latency_p50_s, None);
    assert_eq!(report.confirmations.len(), 10);
    assert!(report.confirmations.values().all(|r| !r.found));
    assert_eq!(report.poll.expired, 10);
    assert!(
        (1.0..1.1).contains(&report.poll.elapsed_s),
        "poll took {}",
        report.poll.elapsed_s
    );
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_ceiling_holds_without_losing_ticks() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(MockDispatcher::new(Duration::from_millis(500)));
    let mut config = config("", "max_in_flight = 5");
    config.store.db_timeout_ms = 200;
    let ctx = context(config, dispatcher.clone(), store);

    let report = run_once(&ctx, 50.0).await.unwrap();

    assert_eq!(dispatcher.peak_in_flight(), 5);
    assert_eq!(dispatcher.calls(), 50);
    assert_eq!(report.summary().total, 50);
    assert_eq!(report.fire.emitted, 50);
    // ten waves of 500ms
    assert!(report.window.duration_s() >= 5.0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_requests_are_still_confirmed() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(
        MockDispatcher::new(Duration::from_millis(5))
            .with_status(503)
            .persisting_into(store.clone(), Duration::from_millis(20)),
    );
    let ctx = context(config("", ""), dispatcher, store);

    let report = run_once(&ctx, 10.0).await.unwrap();
    let s = report.summary();

    assert_eq!((s.total, s.ok, s.fail), (10, 0, 10));
    assert_eq!(s.confirmed, 10);
    assert_eq!(s.ok_ratio, 0.0);
    assert!(report
        .log
        .iter()
        .all(|o| o.error_text.as_deref() == Some("status:503") && o.http_status == Some(503)));
}

#[tokio::test(start_paused = true)]
async fn test_store_id_taken_from_response_body() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(
        MockDispatcher::new(Duration::from_millis(5))
            .echoing_id("txId")
            .persisting_into(store.clone(), Duration::from_millis(20)),
    );
    let ctx = context(config("", ""), dispatcher, store);

    let report = run_once(&ctx, 10.0).await.unwrap();

    assert_eq!(report.summary().confirmed, 10);
    assert!(report.log.iter().all(|o| o.correlation_id.starts_with("srv-")));
    assert!(report
        .confirmations
        .keys()
        .all(|id| id.starts_with("srv-")));
}

#[tokio::test(start_paused = true)]
async fn test_abort_keeps_partial_results() {
    let (dispatcher, store) = persisting(5, 0);
    let ctx = context(config("", ""), dispatcher.clone(), store);
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
    });

    let report = run_once(&ctx, 10.0).await.unwrap();

    assert!(report.aborted);
    // ticks at 0, 100, 200 and 300ms
    assert_eq!(report.fire.emitted, 4);
    assert_eq!(report.summary().total, 4);
    assert_eq!(dispatcher.calls(), 4);
    assert_eq!(report.confirmations.len(), 4);
    assert_eq!(report.poll.batches, 0);
    assert!(report.window.duration_s() < 0.4);
}

#[tokio::test(start_paused = true)]
async fn test_warm_up_is_not_counted() {
    let (dispatcher, store) = persisting(5, 10);
    let mut ctx = context(config("warmup_s = 1.0", ""), dispatcher.clone(), store);
    ctx.progress_every = Some(Duration::from_millis(250));

    let report = run_once(&ctx, 10.0).await.unwrap();

    assert_eq!(dispatcher.calls(), 20);
    assert_eq!(report.summary().total, 10);
    assert_eq!(report.confirmations.len(), 10);
    assert_eq!(report.summary().confirmed, 10);
    // the measured clock restarts after warm-up
    assert!(report.log.iter().all(|o| o.submit_time < 1.0));
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_warm_up_skips_measured_run() {
    let (dispatcher, store) = persisting(5, 10);
    let ctx = context(config("warmup_s = 2.0", ""), dispatcher.clone(), store);
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(550)).await;
        cancel.cancel();
    });

    let report = run_once(&ctx, 10.0).await.unwrap();

    assert!(report.aborted);
    assert_eq!(report.summary().total, 0);
    assert_eq!(report.fire.planned, 0);
    assert_eq!(dispatcher.calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_runs_each_rate_in_order() {
    let (dispatcher, store) = persisting(5, 10);
    let ctx = context(config("", ""), dispatcher.clone(), store);

    let sweep = run_sweep(&ctx, &[5.0, 10.0, 20.0]).await.unwrap();

    assert_eq!(sweep.runs.len(), 3);
    let totals: Vec<u64> = sweep.summary.runs.iter().map(|s| s.total).collect();
    assert_eq!(totals, vec![5, 10, 20]);
    let rates: Vec<f64> = sweep.summary.runs.iter().map(|s| s.requested_rate).collect();
    assert_eq!(rates, vec![5.0, 10.0, 20.0]);
    assert!(sweep.summary.runs.iter().all(|s| s.confirm_ratio == 1.0));
    assert_eq!(sweep.summary.peak_rate, Some(20.0));
    assert_eq!(dispatcher.calls(), 35);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_sweep_stops_early() {
    let (dispatcher, store) = persisting(5, 10);
    let ctx = context(config("", ""), dispatcher, store);
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        cancel.cancel();
    });

    let sweep = run_sweep(&ctx, &[10.0, 10.0, 10.0]).await.unwrap();

    assert!(sweep.runs.len() < 3);
    assert!(sweep.runs.last().unwrap().aborted);
}

#[tokio::test(start_paused = true)]
async fn test_aggregate_recomputes_identically() {
    let (dispatcher, store) = persisting(5, 30);
    let ctx = context(config("", ""), dispatcher, store);

    let report = run_once(&ctx, 10.0).await.unwrap();
    let again = e2e_core::aggregate(&report.log, &report.confirmations, report.window, report.rate);

    assert_eq!(again, report.aggregate);
}
