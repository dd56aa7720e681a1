use crate::aggregate::{PerSecondBucket, RunSummary};
use crate::collector::RequestOutcome;
use crate::poller::ConfirmationMap;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One line of the per-request results file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub correlation_id: String,
    pub http_status: Option<u16>,
    pub success: bool,
    pub submit_time: f64,
    pub response_time: f64,
    /// Empty when unconfirmed
    pub e2e_latency_s: Option<f64>,
    pub store_timestamp: Option<String>,
    pub error: Option<String>,
}

/// Rows in log (completion) order.
pub fn result_rows(log: &[RequestOutcome], confirmations: &ConfirmationMap) -> Vec<ResultRow> {
    log.iter()
        .map(|outcome| {
            let record = confirmations
                .get(&outcome.correlation_id)
                .filter(|r| r.found);
            ResultRow {
                correlation_id: outcome.correlation_id.clone(),
                http_status: outcome.http_status,
                success: outcome.success,
                submit_time: outcome.submit_time,
                response_time: outcome.response_time,
                e2e_latency_s: record
                    .and_then(|r| r.confirmed_at)
                    .map(|at| at - outcome.submit_time),
                store_timestamp: record.and_then(|r| r.store_timestamp.clone()),
                error: outcome.error_text.clone(),
            }
        })
        .collect()
}

fn write_csv<T: Serialize>(path: &Path, rows: impl IntoIterator<Item = T>) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_results(path: &Path, rows: &[ResultRow]) -> Result<()> {
    write_csv(path, rows)
}

pub fn write_buckets(path: &Path, buckets: &[PerSecondBucket]) -> Result<()> {
    write_csv(path, buckets)
}

#[derive(Serialize)]
struct CdfRow {
    latency_s: f64,
    cdf: f64,
}

pub fn write_cdf(path: &Path, cdf: &[(f64, f64)]) -> Result<()> {
    write_csv(
        path,
        cdf.iter().map(|&(latency_s, cdf)| CdfRow { latency_s, cdf }),
    )
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn write_summaries(path: &Path, summaries: &[RunSummary]) -> Result<()> {
    write_csv(path, summaries)
}

/// File locations for one run's artifacts.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub results: PathBuf,
    pub per_second: PathBuf,
    pub cdf: PathBuf,
    pub summary: PathBuf,
}

impl RunArtifacts {
    /// `point` is the 1-based position within a sweep, so a rate that
    /// appears twice in one sweep still gets its own files.
    pub fn new(dir: &Path, prefix: &str, point: Option<usize>, rate: f64, stamp: &str) -> Self {
        let base = match point {
            Some(n) => format!("{prefix}_p{n}_{}rps_{stamp}", rate_label(rate)),
            None => format!("{prefix}_{}rps_{stamp}", rate_label(rate)),
        };
        Self {
            results: dir.join(format!("{base}_results.csv")),
            per_second: dir.join(format!("{base}_tps.csv")),
            cdf: dir.join(format!("{base}_cdf.csv")),
            summary: dir.join(format!("{base}_summary.json")),
        }
    }
}

/// `100` for whole rates, `2.5` otherwise.
fn rate_label(rate: f64) -> String {
    if rate.fract() == 0.0 {
        format!("{}", rate as u64)
    } else {
        format!("{rate}")
    }
}

pub fn sweep_paths(dir: &Path, prefix: &str, stamp: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{prefix}_sweep_{stamp}.csv")),
        dir.join(format!("{prefix}_sweep_{stamp}.json")),
    )
}
