//! Splitting a table into contiguous row-range chunks.
//!
//! A table of `R` rows copied by `W` workers is cut into ranges of
//! `c = max(1, ceil(R / W))` positions: `[1, c]`, `[c + 1, 2c]`, ... with the
//! last range ending exactly at `R`. Ranges never overlap and leave no gaps.
//!
//! Each chunk carries a rendered T-SQL query with two parameters, `@P1`
//! (first position) and `@P2` (last position, inclusive). Positions are
//! interpreted either as primary key values ([`PartitionStrategy::KeyRange`])
//! or as row numbers over a deterministic ordering
//! ([`PartitionStrategy::RowNumber`]).

use crate::config::PartitionMode;
use crate::error::{MigrateError, Result};
use crate::identifier::{qualify_mssql, quote_mssql};
use crate::source::TableSpec;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Alias of the row-number column in row-numbered chunk queries.
const ROW_NUMBER_ALIAS: &str = "__chunk_rn";

/// How a chunk's `[start, end]` range selects rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStrategy {
    /// `key BETWEEN start AND end` on the primary key columns.
    KeyRange,
    /// `ROW_NUMBER() BETWEEN start AND end` ordered by the primary key, or by
    /// the physical row locator when the table has none.
    RowNumber,
}

/// One unit of work: a row range of one table.
#[derive(Debug, Clone)]
pub struct ChunkSpec {
    pub table: Arc<TableSpec>,
    /// 0-based position of the chunk within its table.
    pub index: usize,
    /// First row position, inclusive.
    pub start: i64,
    /// Last row position, inclusive.
    pub end: i64,
    pub strategy: PartitionStrategy,
    /// Extraction query; bind `start` to `@P1` and `end` to `@P2`.
    pub query: String,
}

impl ChunkSpec {
    /// Number of row positions the chunk covers.
    pub fn len(&self) -> i64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }
}

impl fmt::Display for ChunkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} [{}..{}]",
            self.table.full_name(),
            self.index,
            self.start,
            self.end
        )
    }
}

/// Inclusive `(start, end)` ranges covering `1..=row_count`.
///
/// Returns `None` for a negative row count, zero workers, or a range that
/// cannot be computed without overflow.
pub fn chunk_ranges(row_count: i64, workers: usize) -> Option<Vec<(i64, i64)>> {
    if row_count < 0 || workers == 0 {
        return None;
    }
    if row_count == 0 {
        return Some(Vec::new());
    }

    let workers = i64::try_from(workers).ok()?;
    let size = (row_count / workers + i64::from(row_count % workers != 0)).max(1);

    let mut ranges = Vec::with_capacity(usize::try_from(row_count.min(workers)).ok()?);
    let mut start = 1i64;
    while start <= row_count {
        let end = start.saturating_add(size - 1).min(row_count);
        ranges.push((start, end));
        match end.checked_add(1) {
            Some(next) => start = next,
            None => break,
        }
    }
    Some(ranges)
}

/// Plan the chunks of one table.
///
/// An empty table yields no chunks.
pub fn plan(table: &Arc<TableSpec>, workers: usize, mode: PartitionMode) -> Result<Vec<ChunkSpec>> {
    let ranges = chunk_ranges(table.row_count, workers).ok_or_else(|| {
        MigrateError::partition(
            table.full_name(),
            format!(
                "cannot split {} rows across {} workers",
                table.row_count, workers
            ),
        )
    })?;
    if ranges.is_empty() {
        return Ok(Vec::new());
    }

    let strategy = choose_strategy(table, mode);
    let query = render_query(table, strategy)
        .map_err(|e| MigrateError::partition(table.full_name(), e.to_string()))?;

    debug!(
        "{}: {} chunks of up to {} rows using {:?}",
        table.full_name(),
        ranges.len(),
        ranges[0].1 - ranges[0].0 + 1,
        strategy
    );

    Ok(ranges
        .into_iter()
        .enumerate()
        .map(|(index, (start, end))| ChunkSpec {
            table: Arc::clone(table),
            index,
            start,
            end,
            strategy,
            query: query.clone(),
        })
        .collect())
}

/// Pick the strategy for a table.
pub fn choose_strategy(table: &TableSpec, mode: PartitionMode) -> PartitionStrategy {
    match mode {
        PartitionMode::Auto if table.has_dense_key() => PartitionStrategy::KeyRange,
        PartitionMode::Auto => PartitionStrategy::RowNumber,
        PartitionMode::KeyRange if table.has_pk() => {
            if !table.has_dense_key() {
                warn!(
                    "{}: key values are not a dense 1..{} sequence, key ranges may \
                     select uneven or missing rows",
                    table.full_name(),
                    table.row_count
                );
            }
            PartitionStrategy::KeyRange
        }
        PartitionMode::KeyRange => {
            warn!(
                "{}: no primary key, falling back to row numbering",
                table.full_name()
            );
            PartitionStrategy::RowNumber
        }
        PartitionMode::RowNumber => PartitionStrategy::RowNumber,
    }
}

/// Render the parameterised extraction query for a table.
pub fn render_query(table: &TableSpec, strategy: PartitionStrategy) -> Result<String> {
    if table.columns.is_empty() {
        return Err(MigrateError::partition(table.full_name(), "table has no columns"));
    }

    let select_list = table
        .columns
        .iter()
        .map(|c| c.select_expression())
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    let from = qualify_mssql(&table.schema, &table.name)?;
    let keys = table
        .primary_key
        .iter()
        .map(|k| quote_mssql(k))
        .collect::<Result<Vec<_>>>()?;

    match strategy {
        PartitionStrategy::KeyRange => {
            if keys.is_empty() {
                return Err(MigrateError::partition(
                    table.full_name(),
                    "key range partitioning requires a primary key",
                ));
            }
            let predicate = keys
                .iter()
                .map(|k| format!("{k} BETWEEN @P1 AND @P2"))
                .collect::<Vec<_>>()
                .join(" AND ");
            Ok(format!(
                "SELECT {select_list} FROM {from} WHERE {predicate} ORDER BY {}",
                keys.join(", ")
            ))
        }
        PartitionStrategy::RowNumber => {
            if table
                .columns
                .iter()
                .any(|c| c.source_name.eq_ignore_ascii_case(ROW_NUMBER_ALIAS))
            {
                return Err(MigrateError::partition(
                    table.full_name(),
                    format!("column name {} is reserved for row numbering", ROW_NUMBER_ALIAS),
                ));
            }
            let order_by = if keys.is_empty() {
                "%%physloc%%".to_string()
            } else {
                keys.join(", ")
            };
            let outer_list = table
                .columns
                .iter()
                .map(|c| quote_mssql(&c.source_name))
                .collect::<Result<Vec<_>>>()?
                .join(", ");
            let rn = quote_mssql(ROW_NUMBER_ALIAS)?;
            Ok(format!(
                "SELECT {outer_list} FROM (SELECT {select_list}, ROW_NUMBER() OVER (ORDER BY {order_by}) AS {rn} \
                 FROM {from}) AS [numbered] WHERE {rn} BETWEEN @P1 AND @P2 ORDER BY {rn}"
            ))
        }
    }
}
