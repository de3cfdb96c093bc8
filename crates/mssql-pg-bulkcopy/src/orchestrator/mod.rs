//! Copy orchestrator - main workflow coordinator.

use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::partition::{self, ChunkSpec};
use crate::source::{MssqlPool, SourcePool, TableRef, TableSpec};
use crate::target::{CopyTarget, PgPool, TargetPool};
use crate::transfer::{ChunkReport, ChunkState, TransferConfig, TransferEngine, TransferJob};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Copy orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn SourcePool>,
    target: Arc<dyn TargetPool>,
}

/// Result of a copy run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status: `completed`, `completed_with_errors`, `cancelled` or
    /// `dry_run`.
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Tables requested.
    pub tables_total: usize,

    /// Tables whose chunks all completed.
    pub tables_processed: usize,

    /// Empty tables.
    pub tables_skipped: usize,

    /// Tables that could not be planned or had at least one failed chunk.
    pub tables_failed: usize,

    pub chunks_planned: usize,
    pub chunks_completed: usize,
    pub chunks_failed: usize,

    /// Total rows loaded into the target.
    pub rows_transferred: u64,

    /// Average throughput (rows/second).
    pub rows_per_second: u64,

    /// List of failed table names.
    pub failed_tables: Vec<String>,

    pub failed_chunks: Vec<FailedChunk>,

    /// Per-table breakdown in request order.
    pub tables: Vec<TableSummary>,
}

/// A chunk that did not complete.
#[derive(Debug, Clone, Serialize)]
pub struct FailedChunk {
    pub table: String,
    pub index: usize,
    pub start: i64,
    pub end: i64,
    /// State the chunk was in when it failed.
    pub failed_in: Option<ChunkState>,
    pub error: String,
}

/// Outcome of one requested table.
#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    /// Table name as requested.
    pub table: String,
    /// `planned`, `completed`, `skipped` or `failed`.
    pub status: String,
    /// Source row count at planning time.
    pub row_count: i64,
    /// `key_range` or `row_number`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    /// Inclusive `[start, end]` range of each chunk.
    pub chunks: Vec<(i64, i64)>,
    pub chunks_failed: usize,
    pub rows_transferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableSummary {
    fn failed(table: &str, error: &MigrateError) -> Self {
        Self {
            table: table.to_string(),
            status: "failed".to_string(),
            row_count: 0,
            strategy: None,
            chunks: Vec::new(),
            chunks_failed: 0,
            rows_transferred: 0,
            error: Some(error.to_string()),
        }
    }

    fn planned(table: &str, spec: &TableSpec, chunks: &[ChunkSpec]) -> Self {
        let status = if chunks.is_empty() { "skipped" } else { "planned" };
        Self {
            table: table.to_string(),
            status: status.to_string(),
            row_count: spec.row_count,
            strategy: chunks.first().map(|c| strategy_name(c).to_string()),
            chunks: chunks.iter().map(|c| (c.start, c.end)).collect(),
            chunks_failed: 0,
            rows_transferred: 0,
            error: None,
        }
    }
}

/// Connectivity of both endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
}

/// Row counts of one table on both sides.
#[derive(Debug, Clone, Serialize)]
pub struct TableValidation {
    pub table: String,
    pub source_rows: i64,
    pub target_rows: Option<i64>,
    pub matches: bool,
}

impl Orchestrator {
    /// Create a new orchestrator connected to both endpoints.
    pub async fn new(config: Config) -> Result<Self> {
        let connect_timeout = Duration::from_secs(config.migration.get_connect_timeout_secs());

        let mssql_pool_size = config.migration.get_max_mssql_connections() as u32;
        let source = MssqlPool::new(config.source.clone(), mssql_pool_size, connect_timeout).await?;

        let target = PgPool::new(
            &config.target,
            config.migration.get_max_pg_connections(),
            connect_timeout,
        )
        .await?;

        Ok(Self::with_pools(config, Arc::new(source), Arc::new(target)))
    }

    /// Create an orchestrator over existing pools.
    pub fn with_pools(
        config: Config,
        source: Arc<dyn SourcePool>,
        target: Arc<dyn TargetPool>,
    ) -> Self {
        Self {
            config,
            source,
            target,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the configured copy. A dry run plans every table and moves no data.
    pub async fn run(&self, cancel: CancellationToken, dry_run: bool) -> Result<MigrationResult> {
        let tables = &self.config.migration.tables;
        let workers = self.config.migration.get_workers();
        if dry_run {
            self.plan_tables(tables, workers).await
        } else {
            self.copy_tables(tables, workers, cancel).await
        }
    }

    /// Describe and partition each table without copying anything.
    pub async fn plan_tables(&self, tables: &[String], workers: usize) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut result = MigrationResult::new(started_at, tables.len());

        for name in tables {
            match self.plan_table(name, workers).await {
                Ok((spec, chunks)) => {
                    info!(
                        "{}: {} rows, {} chunks",
                        spec.full_name(),
                        spec.row_count,
                        chunks.len()
                    );
                    if chunks.is_empty() {
                        result.tables_skipped += 1;
                    }
                    result.chunks_planned += chunks.len();
                    result.tables.push(TableSummary::planned(name, &spec, &chunks));
                }
                Err(e) => {
                    error!("{}: {}", name, e);
                    result.record_table_failure(name, &e);
                }
            }
        }

        result.finish("dry_run", clock.elapsed());
        Ok(result)
    }

    /// Copy every table, at most `workers` chunks at a time across all tables.
    ///
    /// Only setup errors are returned. Table and chunk failures are
    /// recorded in the result and never stop the remaining work.
    pub async fn copy_tables(
        &self,
        tables: &[String],
        workers: usize,
        cancel: CancellationToken,
    ) -> Result<MigrationResult> {
        if workers == 0 {
            return Err(MigrateError::Config("workers must be at least 1".into()));
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let mut result = MigrationResult::new(started_at, tables.len());
        info!(
            "Starting run {}: {} tables, {} workers",
            result.run_id,
            tables.len(),
            workers
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let engine = Arc::new(TransferEngine::new(
            Arc::clone(&self.source),
            Arc::clone(&self.target),
            TransferConfig::from_migration(&self.config.migration),
        ));

        let mut handles: Vec<(usize, JoinHandle<ChunkReport>, ChunkSpec)> = Vec::new();

        for name in tables {
            if cancel.is_cancelled() {
                warn!("{}: cancelled before planning", name);
                result.record_table_failure(name, &MigrateError::Cancelled);
                continue;
            }

            let (spec, chunks) = match self.plan_table(name, workers).await {
                Ok(planned) => planned,
                Err(e) => {
                    error!("{}: skipping table: {}", name, e);
                    result.record_table_failure(name, &e);
                    continue;
                }
            };

            let slot = result.tables.len();
            result.tables.push(TableSummary::planned(name, &spec, &chunks));

            if chunks.is_empty() {
                info!("{}: empty table, skipping", spec.full_name());
                result.tables_skipped += 1;
                continue;
            }

            let target = Arc::new(CopyTarget {
                schema: self.config.target.schema.clone(),
                table: spec.name.to_lowercase(),
                columns: spec.target_columns(),
            });

            info!(
                "{}: {} rows in {} chunks -> {}",
                spec.full_name(),
                spec.row_count,
                chunks.len(),
                target.full_name()
            );
            result.chunks_planned += chunks.len();

            for chunk in chunks {
                let job = TransferJob {
                    chunk: chunk.clone(),
                    target: Arc::clone(&target),
                };
                let handle = spawn_chunk(
                    Arc::clone(&engine),
                    Arc::clone(&semaphore),
                    job,
                    cancel.child_token(),
                );
                handles.push((slot, handle, chunk));
            }
        }

        debug!("Waiting for {} chunks", handles.len());
        for (slot, handle, chunk) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!("{}: chunk task panicked: {}", chunk, e);
                    ChunkReport::not_started(
                        &chunk,
                        MigrateError::extraction(chunk.to_string(), format!("task failed: {}", e)),
                    )
                }
            };
            result.record_chunk(slot, report);
        }

        let status = if cancel.is_cancelled() {
            "cancelled"
        } else if result.chunks_failed > 0 || result.tables_failed > 0 {
            "completed_with_errors"
        } else {
            "completed"
        };
        result.finish(status, clock.elapsed());

        info!(
            "Run {} {}: {}/{} chunks, {} rows in {:.2}s ({} rows/sec)",
            result.run_id,
            result.status,
            result.chunks_completed,
            result.chunks_planned,
            result.rows_transferred,
            result.duration_seconds,
            result.rows_per_second
        );
        Ok(result)
    }

    async fn plan_table(&self, name: &str, workers: usize) -> Result<(Arc<TableSpec>, Vec<ChunkSpec>)> {
        let table = TableRef::parse(name, &self.config.source.schema)?;
        let spec = Arc::new(self.source.describe_table(&table).await?);
        let chunks = partition::plan(&spec, workers, self.config.migration.partition_strategy)?;
        Ok((spec, chunks))
    }

    /// Compare exact row counts of every configured table.
    pub async fn validate(&self) -> Result<Vec<TableValidation>> {
        let target_schema = &self.config.target.schema;
        let mut results = Vec::with_capacity(self.config.migration.tables.len());

        for name in &self.config.migration.tables {
            let table = TableRef::parse(name, &self.config.source.schema)?;
            let source_rows = self.source.row_count(&table).await?;
            let target_table = table.name.to_lowercase();
            let target_rows = match self.target.row_count(target_schema, &target_table).await {
                Ok(count) => Some(count),
                Err(e) => {
                    warn!("{}.{}: {}", target_schema, target_table, e);
                    None
                }
            };

            let matches = target_rows == Some(source_rows);
            if matches {
                info!("{}: {} rows (match)", table, source_rows);
            } else {
                warn!(
                    "{}: source={} target={} (MISMATCH)",
                    table,
                    source_rows,
                    target_rows.map_or_else(|| "missing".to_string(), |n| n.to_string())
                );
            }

            results.push(TableValidation {
                table: table.to_string(),
                source_rows,
                target_rows,
                matches,
            });
        }

        Ok(results)
    }

    /// Test both connections and measure their latency.
    pub async fn health_check(&self) -> HealthCheckResult {
        let clock = Instant::now();
        let source = self.source.test_connection().await;
        let source_latency_ms = clock.elapsed().as_millis() as u64;

        let clock = Instant::now();
        let target = self.target.test_connection().await;
        let target_latency_ms = clock.elapsed().as_millis() as u64;

        HealthCheckResult {
            healthy: source.is_ok() && target.is_ok(),
            source_connected: source.is_ok(),
            source_latency_ms,
            source_error: source.err().map(|e| e.to_string()),
            target_connected: target.is_ok(),
            target_latency_ms,
            target_error: target.err().map(|e| e.to_string()),
        }
    }

    /// Close both pools.
    pub async fn close(&self) {
        self.source.close().await;
        self.target.close().await;
    }
}

/// Spawn one chunk. The task waits for a worker slot before touching either
/// pool, so queued chunks hold no connections.
fn spawn_chunk(
    engine: Arc<TransferEngine>,
    semaphore: Arc<Semaphore>,
    job: TransferJob,
    cancel: CancellationToken,
) -> JoinHandle<ChunkReport> {
    tokio::spawn(async move {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = semaphore.acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            warn!("{}: cancelled before start", job.chunk);
            return ChunkReport::not_started(&job.chunk, MigrateError::Cancelled);
        };
        let report = engine.execute(job, cancel).await;
        drop(permit);
        report
    })
}

fn strategy_name(chunk: &ChunkSpec) -> &'static str {
    match chunk.strategy {
        partition::PartitionStrategy::KeyRange => "key_range",
        partition::PartitionStrategy::RowNumber => "row_number",
    }
}

impl MigrationResult {
    fn new(started_at: DateTime<Utc>, tables_total: usize) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            status: "running".to_string(),
            duration_seconds: 0.0,
            started_at,
            completed_at: started_at,
            tables_total,
            tables_processed: 0,
            tables_skipped: 0,
            tables_failed: 0,
            chunks_planned: 0,
            chunks_completed: 0,
            chunks_failed: 0,
            rows_transferred: 0,
            rows_per_second: 0,
            failed_tables: Vec::new(),
            failed_chunks: Vec::new(),
            tables: Vec::new(),
        }
    }

    fn record_table_failure(&mut self, table: &str, error: &MigrateError) {
        self.tables_failed += 1;
        self.failed_tables.push(table.to_string());
        self.tables.push(TableSummary::failed(table, error));
    }

    fn record_chunk(&mut self, slot: usize, report: ChunkReport) {
        let summary = &mut self.tables[slot];
        if report.is_completed() {
            self.chunks_completed += 1;
            self.rows_transferred += report.rows;
            summary.rows_transferred += report.rows;
        } else {
            self.chunks_failed += 1;
            summary.chunks_failed += 1;
            self.failed_chunks.push(FailedChunk {
                table: report.table,
                index: report.index,
                start: report.start,
                end: report.end,
                failed_in: report.failed_in,
                error: report
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }
    }

    /// Settle per-table statuses and totals.
    fn finish(&mut self, status: &str, elapsed: Duration) {
        let dry_run = status == "dry_run";
        for summary in &mut self.tables {
            match summary.status.as_str() {
                "planned" if dry_run => {}
                "planned" if summary.chunks_failed > 0 => {
                    summary.status = "failed".to_string();
                    self.tables_failed += 1;
                    self.failed_tables.push(summary.table.clone());
                }
                "planned" => {
                    summary.status = "completed".to_string();
                    self.tables_processed += 1;
                }
                _ => {}
            }
        }

        self.status = status.to_string();
        self.completed_at = Utc::now();
        self.duration_seconds = elapsed.as_secs_f64();
        self.rows_per_second = if self.duration_seconds > 0.0 {
            (self.rows_transferred as f64 / self.duration_seconds) as u64
        } else {
            0
        };
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_report(table: &str, index: usize, rows: u64, failed: bool) -> ChunkReport {
        ChunkReport {
            table: table.to_string(),
            index,
            start: 1,
            end: 10,
            state: if failed { ChunkState::Failed } else { ChunkState::Completed },
            failed_in: failed.then_some(ChunkState::Streaming),
            rows,
            duration: Duration::from_millis(5),
            error: failed.then(|| MigrateError::ingestion("dbo.t#1 [1..10]", "duplicate key")),
        }
    }

    fn planned_summary(table: &str) -> TableSummary {
        TableSummary {
            table: table.to_string(),
            status: "planned".to_string(),
            row_count: 20,
            strategy: Some("key_range".to_string()),
            chunks: vec![(1, 10), (11, 20)],
            chunks_failed: 0,
            rows_transferred: 0,
            error: None,
        }
    }

    #[test]
    fn test_result_aggregation() {
        let mut result = MigrationResult::new(Utc::now(), 3);
        result.tables.push(planned_summary("dbo.a"));
        result.tables.push(planned_summary("dbo.b"));
        result.record_table_failure("dbo.c", &MigrateError::metadata("dbo.c", "not found"));
        result.chunks_planned = 4;

        result.record_chunk(0, chunk_report("dbo.a", 0, 10, false));
        result.record_chunk(0, chunk_report("dbo.a", 1, 10, false));
        result.record_chunk(1, chunk_report("dbo.b", 0, 10, false));
        result.record_chunk(1, chunk_report("dbo.b", 1, 0, true));
        result.finish("completed_with_errors", Duration::from_secs(2));

        assert_eq!(result.chunks_completed, 3);
        assert_eq!(result.chunks_failed, 1);
        assert_eq!(result.rows_transferred, 30);
        assert_eq!(result.rows_per_second, 15);
        assert_eq!(result.tables_processed, 1);
        assert_eq!(result.tables_failed, 2);
        assert_eq!(result.failed_tables, vec!["dbo.c", "dbo.b"]);
        assert_eq!(result.tables[0].status, "completed");
        assert_eq!(result.tables[1].status, "failed");
        assert_eq!(result.failed_chunks[0].failed_in, Some(ChunkState::Streaming));
        assert!(result.failed_chunks[0].error.contains("duplicate key"));
    }

    #[test]
    fn test_dry_run_keeps_planned_status() {
        let mut result = MigrationResult::new(Utc::now(), 1);
        result.tables.push(planned_summary("dbo.a"));
        result.finish("dry_run", Duration::ZERO);
        assert_eq!(result.tables[0].status, "planned");
        assert_eq!(result.tables_processed, 0);
        assert_eq!(result.rows_per_second, 0);
    }

    #[test]
    fn test_result_json() {
        let mut result = MigrationResult::new(Utc::now(), 1);
        result.tables.push(planned_summary("dbo.a"));
        result.finish("completed", Duration::from_secs(1));

        let json: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["tables"][0]["chunks"][1][0], 11);
        assert!(json["tables"][0].get("error").is_none());
    }
}
