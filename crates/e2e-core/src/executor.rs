use crate::clock::RunClock;
use crate::collector::{CollectorHandle, RequestOutcome};
use crate::config::{PayloadConfig, TargetConfig};
use crate::scheduler::FireTick;
use crate::store::MemoryStore;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A request ready to go on the wire.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Client-generated token, also embedded in `body`
    pub correlation_id: String,
    pub body: Value,
}

/// What the endpoint said. Transport failures are values, not errors.
#[derive(Debug, Clone, Default)]
pub struct DispatchReply {
    pub status: Option<u16>,
    pub body: Option<Value>,
    pub error: Option<String>,
}

impl DispatchReply {
    pub fn status(status: u16, body: Option<Value>) -> Self {
        Self {
            status: Some(status),
            body,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: None,
            body: None,
            error: Some(error.into()),
        }
    }
}

pub type DispatchFuture<'a> = Pin<Box<dyn Future<Output = DispatchReply> + Send + 'a>>;

/// Trait for request transport adapters
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn dispatch<'a>(&'a self, request: &'a OutboundRequest) -> DispatchFuture<'a>;
}

/// JSON POST over HTTP, round-robin across the configured endpoints.
pub struct HttpDispatcher {
    client: reqwest::Client,
    urls: Vec<String>,
    current_url_idx: AtomicUsize,
    idempotency_header: Option<String>,
}

impl HttpDispatcher {
    pub fn new(target: &TargetConfig) -> Result<Self> {
        if target.urls.is_empty() {
            anyhow::bail!("at least one target url is required");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(target.timeout_ms))
            .pool_max_idle_per_host(target.max_in_flight as usize)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            urls: target.urls.clone(),
            current_url_idx: AtomicUsize::new(0),
            idempotency_header: target.idempotency_header.clone(),
        })
    }

    fn next_url(&self) -> &str {
        let idx = self.current_url_idx.fetch_add(1, Ordering::Relaxed);
        &self.urls[idx % self.urls.len()]
    }
}

impl Dispatcher for HttpDispatcher {
    fn name(&self) -> &'static str {
        "http"
    }

    fn dispatch<'a>(&'a self, request: &'a OutboundRequest) -> DispatchFuture<'a> {
        Box::pin(async move {
            let url = self.next_url();
            let mut builder = self.client.post(url).json(&request.body);
            if let Some(header) = &self.idempotency_header {
                builder = builder.header(header.as_str(), request.correlation_id.as_str());
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    // bodies that are not JSON simply carry no id
                    let body = response.json::<Value>().await.ok();
                    DispatchReply::status(status, body)
                }
                Err(e) if e.is_timeout() => DispatchReply::failed("timeout"),
                Err(e) => DispatchReply::failed(e.to_string()),
            }
        })
    }
}

/// In-process endpoint for dry runs and tests.
///
/// Replies after a fixed latency. When given a store it also "persists"
/// every request it sees after `persist_delay`, whatever status it returns.
pub struct MockDispatcher {
    latency: Duration,
    status: u16,
    transport_error: Option<String>,
    echo_field: Option<String>,
    persist: Option<(Arc<MemoryStore>, Duration)>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl MockDispatcher {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            status: 200,
            transport_error: None,
            echo_field: None,
            persist: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Fail every request at the transport level.
    pub fn with_transport_error(mut self, error: impl Into<String>) -> Self {
        self.transport_error = Some(error.into());
        self
    }

    /// Answer with `{field: "srv-<token>"}` and persist under that id.
    pub fn echoing_id(mut self, field: impl Into<String>) -> Self {
        self.echo_field = Some(field.into());
        self
    }

    pub fn persisting_into(mut self, store: Arc<MemoryStore>, delay: Duration) -> Self {
        self.persist = Some((store, delay));
        self
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Dispatcher for MockDispatcher {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn dispatch<'a>(&'a self, request: &'a OutboundRequest) -> DispatchFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

            sleep(self.latency).await;

            let store_id = match &self.echo_field {
                Some(_) => format!("srv-{}", request.correlation_id),
                None => request.correlation_id.clone(),
            };
            if let Some((store, delay)) = &self.persist {
                store.insert_after(store_id.clone(), *delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(error) = &self.transport_error {
                return DispatchReply::failed(error.clone());
            }
            let body = self.echo_field.as_ref().map(|field| {
                let mut body = Map::new();
                body.insert(field.clone(), Value::String(store_id));
                Value::Object(body)
            });
            DispatchReply::status(self.status, body)
        })
    }
}

/// Merges a fresh correlation token into the fixed body template.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    template: Map<String, Value>,
    correlation_field: String,
}

impl PayloadBuilder {
    pub fn new(config: &PayloadConfig) -> Self {
        Self {
            template: config.template.as_object().cloned().unwrap_or_default(),
            correlation_field: config.correlation_field.clone(),
        }
    }

    pub fn build(&self, token: &str) -> Value {
        let mut body = self.template.clone();
        body.insert(self.correlation_field.clone(), Value::String(token.to_string()));
        Value::Object(body)
    }
}

/// First usable id among `fields`, in order. Strings and numbers qualify;
/// null, empty strings and other shapes are skipped.
pub fn extract_id(body: &Value, fields: &[String]) -> Option<String> {
    fields.iter().find_map(|field| match body.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Everything a single in-flight request needs, shared across tasks.
struct RequestJob {
    dispatcher: Arc<dyn Dispatcher>,
    payload: PayloadBuilder,
    id_fields: Vec<String>,
    target: TargetConfig,
    clock: RunClock,
}

impl RequestJob {
    async fn fire(&self, tick: FireTick) -> RequestOutcome {
        let token = Uuid::new_v4().to_string();
        let request = OutboundRequest {
            body: self.payload.build(&token),
            correlation_id: token,
        };

        let submit_time = self.clock.now_s();
        let reply = self.dispatcher.dispatch(&request).await;
        let response_time = self.clock.now_s();

        let (success, error_text) = match (reply.status, reply.error) {
            (_, Some(error)) => (false, Some(error)),
            (Some(status), None) if self.target.is_ok_status(status) => (true, None),
            (Some(status), None) => (false, Some(format!("status:{status}"))),
            (None, None) => (false, Some("no response".to_string())),
        };

        let correlation_id = if success {
            reply
                .body
                .as_ref()
                .and_then(|body| extract_id(body, &self.id_fields))
                .unwrap_or(request.correlation_id)
        } else {
            request.correlation_id
        };

        debug!(
            tick = tick.index,
            correlation_id = %correlation_id,
            success,
            "request completed"
        );

        RequestOutcome {
            correlation_id,
            submit_time,
            response_time,
            http_status: reply.status,
            success,
            error_text,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorReport {
    pub dispatched: u64,
    /// Requests still running when the abort grace period ran out
    pub abandoned: u64,
    pub cancelled: bool,
}

/// Dispatches one request per tick with at most `max_in_flight` between
/// submit and response.
pub struct Executor {
    job: Arc<RequestJob>,
    gate: Arc<Semaphore>,
    collector: CollectorHandle,
}

impl Executor {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        target: &TargetConfig,
        payload: &PayloadConfig,
        clock: RunClock,
        collector: CollectorHandle,
    ) -> Self {
        let job = RequestJob {
            dispatcher,
            payload: PayloadBuilder::new(payload),
            id_fields: payload.response_id_fields.clone(),
            target: target.clone(),
            clock,
        };
        Self {
            job: Arc::new(job),
            gate: Arc::new(Semaphore::new(target.max_in_flight as usize)),
            collector,
        }
    }

    /// The admission gate, for progress reporting.
    pub fn gate(&self) -> Arc<Semaphore> {
        self.gate.clone()
    }

    /// Consume ticks until the channel closes, then wait for every
    /// outstanding request. On cancel, stop taking ticks, give running
    /// requests `grace` to finish and abandon the rest.
    pub async fn run(
        self,
        mut ticks: mpsc::Receiver<FireTick>,
        cancel: CancellationToken,
        grace: Duration,
    ) -> Result<ExecutorReport> {
        let mut report = ExecutorReport::default();
        let mut tasks = JoinSet::new();

        loop {
            let tick = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                tick = ticks.recv() => match tick {
                    Some(tick) => tick,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = self.gate.clone().acquire_owned() => {
                    permit.context("admission gate closed")?
                }
            };

            let job = self.job.clone();
            let collector = self.collector.clone();
            tasks.spawn(async move {
                let outcome = job.fire(tick).await;
                drop(permit);
                collector.record(outcome);
            });
            report.dispatched += 1;

            while let Some(done) = tasks.try_join_next() {
                log_join(done);
            }
        }
        drop(ticks);

        // an abort can also land while the tail of the run is still in flight
        let drained = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = join_all(&mut tasks) => true,
        };

        if !drained {
            report.cancelled = true;
            info!(
                "Abort requested; waiting up to {}ms for {} in-flight requests",
                grace.as_millis(),
                tasks.len()
            );
            if timeout(grace, join_all(&mut tasks)).await.is_err() {
                report.abandoned = tasks.len() as u64;
                warn!("Abandoning {} requests after grace period", report.abandoned);
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
        }

        Ok(report)
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(done) = tasks.join_next().await {
        log_join(done);
    }
}

fn log_join(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        if e.is_panic() {
            warn!("Request task panicked: {}", e);
        }
    }
}
