use crate::config::StoreConfig;
use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Store-side view of one correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHit {
    pub found: bool,
    /// Store's own timestamp column, kept as opaque text
    pub store_timestamp: Option<String>,
}

pub type StoreFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HashMap<String, StoreHit>>> + Send + 'a>>;

/// Batched membership check against the persistence store.
///
/// Ids absent from the returned map are treated as not found.
pub trait ConfirmationStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn check_existence<'a>(&'a self, ids: &'a [String]) -> StoreFuture<'a>;
}

/// Postgres-backed store: one `= ANY($1)` query per batch.
pub struct PgStore {
    pool: PgPool,
    sql: String,
    with_timestamp: bool,
}

impl PgStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let dsn = config
            .dsn
            .as_deref()
            .filter(|d| !d.is_empty())
            .context("store.dsn is required for the postgres store")?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(dsn)
            .await
            .context("Failed to connect to postgres")?;

        Ok(Self::with_pool(pool, config))
    }

    pub fn with_pool(pool: PgPool, config: &StoreConfig) -> Self {
        let ts_column = config.ts_column();
        Self {
            pool,
            sql: existence_query(
                &config.table,
                &config.id_column,
                config.id_type(),
                ts_column,
            ),
            with_timestamp: ts_column.is_some(),
        }
    }
}

/// Build the batch query. Identifiers must already be validated.
///
/// The id column is compared uncast so an index on it can serve the lookup;
/// with `id_type` the text batch is cast to the column's type instead.
pub fn existence_query(
    table: &str,
    id_column: &str,
    id_type: Option<&str>,
    ts_column: Option<&str>,
) -> String {
    let mut select = format!("{id_column}::text AS id");
    if let Some(ts) = ts_column {
        select.push_str(&format!(", {ts}::text AS ts"));
    }
    let param = match id_type {
        Some(ty) => format!("$1::{ty}[]"),
        None => "$1".to_string(),
    };
    format!("SELECT {select} FROM {table} WHERE {id_column} = ANY({param})")
}

impl ConfirmationStore for PgStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn check_existence<'a>(&'a self, ids: &'a [String]) -> StoreFuture<'a> {
        Box::pin(async move {
            let rows = sqlx::query(&self.sql)
                .bind(ids.to_vec())
                .fetch_all(&self.pool)
                .await?;

            let mut hits = HashMap::with_capacity(rows.len());
            for row in rows {
                let id: String = row.try_get("id")?;
                let store_timestamp: Option<String> = if self.with_timestamp {
                    row.try_get("ts")?
                } else {
                    None
                };
                hits.entry(id).or_insert(StoreHit {
                    found: true,
                    store_timestamp,
                });
            }
            Ok(hits)
        })
    }
}

#[derive(Debug, Clone)]
struct StoredRow {
    visible_at: Instant,
    timestamp: String,
}

/// In-process store. Rows become visible at a chosen instant, which is how
/// the mock pipeline models asynchronous ingestion.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, StoredRow>>,
    failures_pending: AtomicU32,
    queries: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `id` visible after `delay`.
    pub async fn insert_after(&self, id: impl Into<String>, delay: Duration) {
        let visible_at = Instant::now() + delay;
        let timestamp = (chrono::Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()))
        .to_rfc3339();
        self.rows.lock().await.insert(
            id.into(),
            StoredRow {
                visible_at,
                timestamp,
            },
        );
    }

    /// The next `n` queries fail as if the connection dropped.
    pub fn fail_next_queries(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    pub async fn row_count(&self) -> usize {
        self.rows.lock().await.len()
    }
}

impl ConfirmationStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn check_existence<'a>(&'a self, ids: &'a [String]) -> StoreFuture<'a> {
        Box::pin(async move {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let should_fail = self
                .failures_pending
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                anyhow::bail!("memory store: injected query failure");
            }

            let now = Instant::now();
            let rows = self.rows.lock().await;
            let hits = ids
                .iter()
                .filter_map(|id| {
                    rows.get(id)
                        .filter(|row| row.visible_at <= now)
                        .map(|row| {
                            (
                                id.clone(),
                                StoreHit {
                                    found: true,
                                    store_timestamp: Some(row.timestamp.clone()),
                                },
                            )
                        })
                })
                .collect();
            Ok(hits)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_existence_query_shape() {
        assert_eq!(
            existence_query("payment_entity", "tx_id", None, Some("created_at")),
            "SELECT tx_id::text AS id, created_at::text AS ts \
             FROM payment_entity WHERE tx_id = ANY($1)"
        );
        assert_eq!(
            existence_query("payments", "request_id", None, None),
            "SELECT request_id::text AS id FROM payments WHERE request_id = ANY($1)"
        );
    }

    #[test]
    fn test_existence_query_keeps_id_column_uncast() {
        let sql = existence_query("payment_entity", "tx_id", Some("uuid"), Some("created_at"));
        assert!(sql.ends_with("WHERE tx_id = ANY($1::uuid[])"), "{sql}");
        assert!(!sql.contains("tx_id::text ="), "{sql}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_visibility() {
        let store = MemoryStore::new();
        store.insert_after("a", Duration::from_millis(50)).await;
        store.insert_after("b", Duration::ZERO).await;

        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let hits = store.check_existence(&ids).await.unwrap();
        assert!(!hits.contains_key("a"));
        assert!(hits["b"].found);
        assert!(hits["b"].store_timestamp.is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let hits = store.check_existence(&ids).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(!hits.contains_key("c"));
    }

    #[tokio::test]
    async fn test_memory_store_injected_failures() {
        let store = MemoryStore::new();
        store.insert_after("a", Duration::ZERO).await;
        store.fail_next_queries(2);

        let ids = vec!["a".to_string()];
        assert!(store.check_existence(&ids).await.is_err());
        assert!(store.check_existence(&ids).await.is_err());
        assert!(store.check_existence(&ids).await.unwrap()["a"].found);
        assert_eq!(store.query_count(), 3);
    }
}
