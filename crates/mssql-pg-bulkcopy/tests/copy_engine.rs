//! End-to-end runs of the copy engine against in-memory pools.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use mssql_pg_bulkcopy::bridge::BridgeReader;
use mssql_pg_bulkcopy::encode::decode_binary;
use mssql_pg_bulkcopy::source::RowStream;
use mssql_pg_bulkcopy::{
    ChunkSpec, ChunkState, ColumnMeta, Config, CopyTarget, MigrateError, Orchestrator, PartitionStrategy,
    Result, SourceConnection, SourcePool, SqlValue, TableRef, TableSpec, TargetConnection,
    TargetPool,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// =============================================================================
// In-memory source
// =============================================================================

#[derive(Clone)]
struct FakeTable {
    spec: TableSpec,
    /// Rows in key order, or in physical order for a heap.
    rows: Vec<Vec<SqlValue>>,
}

#[derive(Clone, Default)]
struct FakeSource {
    tables: Arc<HashMap<String, FakeTable>>,
    /// The read fails when it reaches the row with this key.
    broken_key: Option<i32>,
}

impl FakeSource {
    fn new(tables: Vec<FakeTable>) -> Self {
        let tables = tables
            .into_iter()
            .map(|t| (t.spec.full_name(), t))
            .collect();
        Self {
            tables: Arc::new(tables),
            broken_key: None,
        }
    }

    fn breaking_at(mut self, key: i32) -> Self {
        self.broken_key = Some(key);
        self
    }
}

#[async_trait]
impl SourcePool for FakeSource {
    async fn describe_table(&self, table: &TableRef) -> Result<TableSpec> {
        self.tables
            .get(&table.to_string())
            .map(|t| t.spec.clone())
            .ok_or_else(|| MigrateError::metadata(table.to_string(), "table not found"))
    }

    async fn acquire(&self) -> Result<Box<dyn SourceConnection>> {
        Ok(Box::new(FakeSourceConnection {
            tables: Arc::clone(&self.tables),
            broken_key: self.broken_key,
        }))
    }

    async fn row_count(&self, table: &TableRef) -> Result<i64> {
        Ok(self.describe_table(table).await?.row_count)
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

struct FakeSourceConnection {
    tables: Arc<HashMap<String, FakeTable>>,
    broken_key: Option<i32>,
}

#[async_trait]
impl SourceConnection for FakeSourceConnection {
    async fn open_chunk<'a>(&'a mut self, chunk: &'a ChunkSpec) -> Result<RowStream<'a>> {
        let table = self
            .tables
            .get(&chunk.table.full_name())
            .ok_or_else(|| MigrateError::extraction(chunk.to_string(), "table vanished"))?;

        let rows: Vec<Vec<SqlValue>> = match chunk.strategy {
            // Key column is the first column.
            PartitionStrategy::KeyRange => table
                .rows
                .iter()
                .filter(|row| match row[0] {
                    SqlValue::I32(id) => (chunk.start..=chunk.end).contains(&i64::from(id)),
                    _ => false,
                })
                .cloned()
                .collect(),
            PartitionStrategy::RowNumber => table
                .rows
                .iter()
                .skip((chunk.start - 1) as usize)
                .take(chunk.len() as usize)
                .cloned()
                .collect(),
        };

        let label = chunk.to_string();
        let broken_key = self.broken_key;
        let rows: Vec<Result<Vec<SqlValue>>> = rows
            .into_iter()
            .map(|row| {
                let broken = matches!((&row[0], broken_key), (SqlValue::I32(id), Some(key)) if *id == key);
                if broken {
                    Err(MigrateError::extraction(label.clone(), "connection reset by peer"))
                } else {
                    Ok(row)
                }
            })
            .collect();

        Ok(stream::iter(rows).boxed())
    }
}

// =============================================================================
// In-memory target
// =============================================================================

#[derive(Debug, Clone)]
struct Load {
    chunk: String,
    table: String,
    columns: Vec<String>,
    records: Vec<Vec<String>>,
}

#[derive(Clone, Default)]
struct FakeTarget {
    loads: Arc<Mutex<Vec<Load>>>,
    /// Chunk labels containing this text are rejected.
    reject: Option<String>,
    /// Hold every COPY open until cancelled.
    stall: bool,
    delay: Option<Duration>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl FakeTarget {
    fn loads(&self) -> Vec<Load> {
        self.loads.lock().unwrap().clone()
    }

    fn loaded_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .loads()
            .into_iter()
            .flat_map(|l| l.records.into_iter().map(|r| r[0].clone()))
            .collect();
        keys.sort_by_key(|k| k.parse::<i64>().unwrap());
        keys
    }
}

#[async_trait]
impl TargetPool for FakeTarget {
    async fn acquire(&self) -> Result<Box<dyn TargetConnection>> {
        Ok(Box::new(self.clone()))
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        let name = format!("{}.{}", schema, table);
        Ok(self
            .loads()
            .iter()
            .filter(|l| l.table == name)
            .map(|l| l.records.len() as i64)
            .sum())
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

#[async_trait]
impl TargetConnection for FakeTarget {
    async fn bulk_load(
        &mut self,
        chunk: &str,
        target: &CopyTarget,
        mut reader: BridgeReader,
    ) -> Result<u64> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let outcome = async {
            if self.stall {
                futures::future::pending::<()>().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let mut payload = Vec::new();
            while let Some(frame) = reader.next_frame().await? {
                payload.extend_from_slice(&frame);
            }

            if self.reject.as_deref().is_some_and(|r| chunk.contains(r)) {
                return Err(MigrateError::ingestion(
                    chunk,
                    "duplicate key value violates unique constraint (23505)",
                ));
            }

            let mut csv = csv::ReaderBuilder::new()
                .has_headers(false)
                .from_reader(payload.as_slice());
            let records: Vec<Vec<String>> = csv
                .records()
                .map(|r| r.unwrap().iter().map(str::to_string).collect())
                .collect();
            let count = records.len() as u64;

            self.loads.lock().unwrap().push(Load {
                chunk: chunk.to_string(),
                table: target.full_name(),
                columns: target.columns.clone(),
                records,
            });
            Ok(count)
        }
        .await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn config(tables: &[&str], workers: usize) -> Config {
    let yaml = format!(
        r#"
source:
  host: mssql.internal
  database: sales
  user: reader
  password: secret
target:
  host: pg.internal
  database: warehouse
  user: loader
  password: secret
migration:
  tables: [{}]
  workers: {}
  frame_bytes: 64
"#,
        tables.join(", "),
        workers
    );
    Config::from_yaml(&yaml).unwrap()
}

/// `Orders(OrderID int PK, Note nvarchar(50), Payload varbinary(max))`
/// with keys `1..=rows`.
fn orders(rows: i64) -> FakeTable {
    let data = (1..=rows)
        .map(|id| {
            let note = match id % 3 {
                0 => SqlValue::Null,
                1 => SqlValue::String(format!("say \"{}\"", id)),
                _ => SqlValue::String(format!("note, {}", id)),
            };
            vec![
                SqlValue::I32(id as i32),
                note,
                SqlValue::Bytes(vec![0, 0xff, id as u8]),
            ]
        })
        .collect();

    FakeTable {
        spec: TableSpec {
            schema: "dbo".into(),
            name: "Orders".into(),
            columns: vec![
                ColumnMeta::new("OrderID", "int", 4),
                ColumnMeta::new("Note", "nvarchar", 50),
                ColumnMeta::new("Payload", "varbinary", -1),
            ],
            primary_key: vec!["OrderID".into()],
            row_count: rows,
            key_bounds: (rows > 0).then_some((1, rows)),
        },
        rows: data,
    }
}

/// Heap table without a primary key.
fn events(rows: i64) -> FakeTable {
    let data = (1..=rows)
        .map(|n| vec![SqlValue::I32((n * 10) as i32), SqlValue::String(format!("e{}", n))])
        .collect();
    FakeTable {
        spec: TableSpec {
            schema: "dbo".into(),
            name: "Events".into(),
            columns: vec![
                ColumnMeta::new("Seq", "int", 4),
                ColumnMeta::new("Kind", "varchar", 10),
            ],
            primary_key: Vec::new(),
            row_count: rows,
            key_bounds: None,
        },
        rows: data,
    }
}

fn orchestrator(config: Config, source: FakeSource, target: &FakeTarget) -> Orchestrator {
    Orchestrator::with_pools(config, Arc::new(source), Arc::new(target.clone()))
}

fn chunk_ranges(target: &FakeTarget) -> Vec<String> {
    let mut chunks: Vec<String> = target.loads().into_iter().map(|l| l.chunk).collect();
    chunks.sort();
    chunks
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_keyed_table_copied_exactly_once() {
    let target = FakeTarget::default();
    let orch = orchestrator(config(&["Orders"], 3), FakeSource::new(vec![orders(10)]), &target);

    let result = orch.copy_tables(&["Orders".to_string()], 3, CancellationToken::new()).await.unwrap();

    assert_eq!(result.status, "completed");
    assert_eq!(result.chunks_planned, 3);
    assert_eq!(result.chunks_completed, 3);
    assert_eq!(result.chunks_failed, 0);
    assert_eq!(result.tables_processed, 1);
    assert_eq!(result.rows_transferred, 10);
    assert_eq!(result.tables[0].chunks, vec![(1, 4), (5, 8), (9, 10)]);
    assert_eq!(result.tables[0].strategy.as_deref(), Some("key_range"));

    assert_eq!(
        chunk_ranges(&target),
        vec![
            "dbo.Orders#0 [1..4]",
            "dbo.Orders#1 [5..8]",
            "dbo.Orders#2 [9..10]"
        ]
    );
    let expected: Vec<String> = (1..=10).map(|n| n.to_string()).collect();
    assert_eq!(target.loaded_keys(), expected);
}

#[tokio::test]
async fn test_rows_keep_cursor_order_within_a_chunk() {
    let target = FakeTarget::default();
    let orch = orchestrator(config(&["Orders"], 2), FakeSource::new(vec![orders(10)]), &target);

    orch.copy_tables(&["Orders".to_string()], 2, CancellationToken::new()).await.unwrap();

    for load in target.loads() {
        let keys: Vec<i64> = load.records.iter().map(|r| r[0].parse().unwrap()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted, "{} out of order", load.chunk);
    }
}

#[tokio::test]
async fn test_loaded_values_survive_encoding() {
    let target = FakeTarget::default();
    let orch = orchestrator(config(&["dbo.Orders"], 1), FakeSource::new(vec![orders(3)]), &target);

    orch.copy_tables(&["dbo.Orders".to_string()], 1, CancellationToken::new()).await.unwrap();

    let loads = target.loads();
    assert_eq!(loads.len(), 1);
    let load = &loads[0];
    assert_eq!(load.table, "public.orders");
    assert_eq!(load.columns, vec!["orderid", "note", "payload"]);

    assert_eq!(load.records[0][1], "say \"1\"");
    assert_eq!(load.records[1][1], "note, 2");
    assert_eq!(load.records[2][1], "");
    assert_eq!(decode_binary(&load.records[2][2]).unwrap(), vec![0, 0xff, 3]);
}

#[tokio::test]
async fn test_empty_table_is_skipped() {
    let target = FakeTarget::default();
    let orch = orchestrator(config(&["Orders"], 4), FakeSource::new(vec![orders(0)]), &target);

    let result = orch.copy_tables(&["Orders".to_string()], 4, CancellationToken::new()).await.unwrap();

    assert_eq!(result.status, "completed");
    assert_eq!(result.chunks_planned, 0);
    assert_eq!(result.tables_skipped, 1);
    assert_eq!(result.tables_processed, 0);
    assert_eq!(result.tables[0].status, "skipped");
    assert!(target.loads().is_empty());
}

#[tokio::test]
async fn test_heap_table_uses_row_numbers() {
    let target = FakeTarget::default();
    let orch = orchestrator(config(&["Events"], 2), FakeSource::new(vec![events(5)]), &target);

    let result = orch.copy_tables(&["Events".to_string()], 2, CancellationToken::new()).await.unwrap();

    assert_eq!(result.tables[0].strategy.as_deref(), Some("row_number"));
    assert_eq!(result.tables[0].chunks, vec![(1, 3), (4, 5)]);
    assert_eq!(result.chunks_completed, 2);
    assert_eq!(result.rows_transferred, 5);

    let mut kinds: Vec<String> = target
        .loads()
        .into_iter()
        .flat_map(|l| l.records.into_iter().map(|r| r[1].clone()))
        .collect();
    kinds.sort();
    assert_eq!(kinds, vec!["e1", "e2", "e3", "e4", "e5"]);
}

#[tokio::test]
async fn test_rejected_chunk_does_not_stop_siblings() {
    let target = FakeTarget {
        reject: Some("#1 ".to_string()),
        ..Default::default()
    };
    let orch = orchestrator(config(&["Orders"], 3), FakeSource::new(vec![orders(10)]), &target);

    let result = orch.copy_tables(&["Orders".to_string()], 3, CancellationToken::new()).await.unwrap();

    assert_eq!(result.status, "completed_with_errors");
    assert_eq!(result.chunks_completed, 2);
    assert_eq!(result.chunks_failed, 1);
    assert_eq!(result.tables_failed, 1);
    assert_eq!(result.failed_tables, vec!["Orders"]);

    let failed = &result.failed_chunks[0];
    assert_eq!((failed.index, failed.start, failed.end), (1, 5, 8));
    assert!(failed.error.contains("23505"), "{}", failed.error);

    let expected: Vec<String> = [1, 2, 3, 4, 9, 10].iter().map(|n| n.to_string()).collect();
    assert_eq!(target.loaded_keys(), expected);
}

#[tokio::test]
async fn test_source_error_mid_chunk_fails_only_that_chunk() {
    let target = FakeTarget::default();
    let source = FakeSource::new(vec![orders(10)]).breaking_at(7);
    let orch = orchestrator(config(&["Orders"], 3), source, &target);

    let result = orch.copy_tables(&["Orders".to_string()], 3, CancellationToken::new()).await.unwrap();

    assert_eq!(result.status, "completed_with_errors");
    assert_eq!(result.chunks_completed, 2);
    assert_eq!(result.chunks_failed, 1);

    let failed = &result.failed_chunks[0];
    assert_eq!((failed.index, failed.start, failed.end), (1, 5, 8));
    assert_eq!(failed.failed_in, Some(ChunkState::Streaming));
    assert!(failed.error.starts_with("Extraction failed"), "{}", failed.error);
    assert!(failed.error.contains("connection reset"), "{}", failed.error);
    assert!(!failed.error.contains("Stream aborted"), "{}", failed.error);

    assert_eq!(
        chunk_ranges(&target),
        vec!["dbo.Orders#0 [1..4]", "dbo.Orders#2 [9..10]"]
    );
    let expected: Vec<String> = [1, 2, 3, 4, 9, 10].iter().map(|n| n.to_string()).collect();
    assert_eq!(target.loaded_keys(), expected);
}

#[tokio::test]
async fn test_oversized_value_fails_only_its_chunk() {
    let mut table = orders(10);
    table.rows[1][2] = SqlValue::Bytes(vec![7; 64]);
    let mut config = config(&["Orders"], 3);
    config.migration.max_lob_bytes = Some(16);

    let target = FakeTarget::default();
    let orch = orchestrator(config, FakeSource::new(vec![table]), &target);

    let result = orch.copy_tables(&["Orders".to_string()], 3, CancellationToken::new()).await.unwrap();

    assert_eq!(result.chunks_completed, 2);
    assert_eq!(result.chunks_failed, 1);

    let failed = &result.failed_chunks[0];
    assert_eq!((failed.index, failed.start, failed.end), (0, 1, 4));
    assert_eq!(failed.failed_in, Some(ChunkState::Streaming));
    assert!(failed.error.starts_with("Encoding failed"), "{}", failed.error);
    assert!(failed.error.contains("at row 2"), "{}", failed.error);
    assert!(!failed.error.contains("Stream aborted"), "{}", failed.error);

    assert!(target.loads().iter().all(|l| !l.chunk.starts_with("dbo.Orders#0 ")));
    let expected: Vec<String> = (5..=10).map(|n| n.to_string()).collect();
    assert_eq!(target.loaded_keys(), expected);
}

#[tokio::test]
async fn test_missing_table_does_not_stop_run() {
    let target = FakeTarget::default();
    let orch = orchestrator(
        config(&["Missing", "Orders"], 2),
        FakeSource::new(vec![orders(4)]),
        &target,
    );

    let result = orch.run(CancellationToken::new(), false).await.unwrap();

    assert_eq!(result.tables_total, 2);
    assert_eq!(result.tables_failed, 1);
    assert_eq!(result.tables_processed, 1);
    assert_eq!(result.failed_tables, vec!["Missing"]);
    assert!(result.tables[0].error.as_deref().unwrap().contains("table not found"));
    assert_eq!(result.rows_transferred, 4);
}

#[tokio::test]
async fn test_parallelism_is_capped_across_tables() {
    let target = FakeTarget {
        delay: Some(Duration::from_millis(20)),
        ..Default::default()
    };
    let orch = orchestrator(
        config(&["Orders", "Events"], 2),
        FakeSource::new(vec![orders(12), events(6)]),
        &target,
    );

    let result = orch.run(CancellationToken::new(), false).await.unwrap();

    assert_eq!(result.chunks_completed, 4);
    assert_eq!(result.rows_transferred, 18);
    assert!(target.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_cancel_fails_running_chunks() {
    let target = FakeTarget {
        stall: true,
        ..Default::default()
    };
    let orch = orchestrator(config(&["Orders"], 2), FakeSource::new(vec![orders(8)]), &target);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), orch.run(cancel, false))
        .await
        .expect("run should stop after cancellation")
        .unwrap();

    assert_eq!(result.status, "cancelled");
    assert_eq!(result.chunks_failed, 2);
    assert_eq!(result.chunks_completed, 0);
    assert!(result.failed_chunks.iter().all(|c| c.error.contains("cancelled")));
    assert!(target.loads().is_empty());
}

#[tokio::test]
async fn test_dry_run_plans_without_copying() {
    let target = FakeTarget::default();
    let orch = orchestrator(
        config(&["Orders", "Events"], 3),
        FakeSource::new(vec![orders(10), events(2)]),
        &target,
    );

    let result = orch.run(CancellationToken::new(), true).await.unwrap();

    assert_eq!(result.status, "dry_run");
    assert_eq!(result.chunks_planned, 5);
    assert_eq!(result.tables[1].chunks, vec![(1, 1), (2, 2)]);
    assert!(target.loads().is_empty());
}

#[tokio::test]
async fn test_validate_compares_row_counts() {
    let target = FakeTarget {
        reject: Some("#0 ".to_string()),
        ..Default::default()
    };
    let orch = orchestrator(
        config(&["Orders", "Events"], 2),
        FakeSource::new(vec![orders(6), events(1)]),
        &target,
    );
    orch.run(CancellationToken::new(), false).await.unwrap();

    let report = orch.validate().await.unwrap();
    assert_eq!(report.len(), 2);
    assert_eq!(report[0].table, "dbo.Orders");
    assert_eq!((report[0].source_rows, report[0].target_rows), (6, Some(3)));
    assert!(!report[0].matches);
    // The single Events chunk is #0 and was rejected too.
    assert_eq!(report[1].target_rows, Some(0));
}

#[tokio::test]
async fn test_health_check_reports_both_sides() {
    let target = FakeTarget::default();
    let orch = orchestrator(config(&["Orders"], 1), FakeSource::new(vec![]), &target);

    let health = orch.health_check().await;
    assert!(health.healthy);
    assert!(health.source_connected && health.target_connected);
    assert!(health.source_error.is_none());
}
