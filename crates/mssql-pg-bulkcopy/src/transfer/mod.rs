//! Per-chunk copy: extract, encode, and load one row range.
//!
//! Each chunk moves through `Pending -> Extracting -> Streaming -> Completed`,
//! or ends in `Failed` from any active state. Extraction and loading run
//! concurrently on the same task, coupled only by a bounded bridge, so a
//! chunk never holds more than `bridge_capacity` frames in memory.

use crate::bridge::{self, BridgeWriter};
use crate::config::MigrationConfig;
use crate::encode::RowEncoder;
use crate::error::{MigrateError, Result};
use crate::partition::ChunkSpec;
use crate::source::{RowStream, SourcePool};
use crate::target::{CopyTarget, TargetPool};
use bytes::BytesMut;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tunables for chunk execution.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Frames in flight between extractor and loader.
    pub bridge_capacity: usize,
    /// Encoded bytes accumulated before a frame is handed over.
    pub frame_bytes: usize,
    /// Largest large-object value that is inlined.
    pub max_lob_bytes: usize,
    /// Deadline for one chunk.
    pub chunk_timeout: Option<Duration>,
}

impl TransferConfig {
    pub fn from_migration(config: &MigrationConfig) -> Self {
        Self {
            bridge_capacity: config.get_bridge_capacity(),
            frame_bytes: config.get_frame_bytes(),
            max_lob_bytes: config.get_max_lob_bytes(),
            chunk_timeout: config.chunk_timeout_secs.map(Duration::from_secs),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::from_migration(&MigrationConfig::default())
    }
}

/// One chunk and where its rows go.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub chunk: ChunkSpec,
    pub target: Arc<CopyTarget>,
}

/// Lifecycle of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    Extracting,
    Streaming,
    Completed,
    Failed,
}

/// Outcome of one chunk.
#[derive(Debug)]
pub struct ChunkReport {
    pub table: String,
    pub index: usize,
    pub start: i64,
    pub end: i64,
    /// `Completed` or `Failed`.
    pub state: ChunkState,
    /// State the chunk was in when it failed.
    pub failed_in: Option<ChunkState>,
    /// Rows the target reported as loaded.
    pub rows: u64,
    pub duration: Duration,
    pub error: Option<MigrateError>,
}

impl ChunkReport {
    /// Report for a chunk that failed before it left `Pending`.
    pub fn not_started(chunk: &ChunkSpec, error: MigrateError) -> Self {
        Self {
            table: chunk.table.full_name(),
            index: chunk.index,
            start: chunk.start,
            end: chunk.end,
            state: ChunkState::Failed,
            failed_in: Some(ChunkState::Pending),
            rows: 0,
            duration: Duration::ZERO,
            error: Some(error),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == ChunkState::Completed
    }
}

/// Runs chunks against shared source and target pools.
pub struct TransferEngine {
    source: Arc<dyn SourcePool>,
    target: Arc<dyn TargetPool>,
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(
        source: Arc<dyn SourcePool>,
        target: Arc<dyn TargetPool>,
        config: TransferConfig,
    ) -> Self {
        Self {
            source,
            target,
            config,
        }
    }

    /// Copy one chunk. Never returns an error: failures are reported in the
    /// returned [`ChunkReport`] and never affect other chunks.
    pub async fn execute(&self, job: TransferJob, cancel: CancellationToken) -> ChunkReport {
        let started = Instant::now();
        let label = job.chunk.to_string();
        let mut state = ChunkState::Pending;

        let work = async {
            match self.config.chunk_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.run(&job, &label, &mut state)).await {
                    Ok(result) => result,
                    Err(_) => Err(MigrateError::Timeout(limit.as_secs())),
                },
                None => self.run(&job, &label, &mut state).await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MigrateError::Cancelled),
            result = work => result,
        };

        let duration = started.elapsed();
        let mut report = ChunkReport {
            table: job.chunk.table.full_name(),
            index: job.chunk.index,
            start: job.chunk.start,
            end: job.chunk.end,
            state: ChunkState::Completed,
            failed_in: None,
            rows: 0,
            duration,
            error: None,
        };

        match outcome {
            Ok(rows) => {
                report.rows = rows;
                info!(
                    "{}: completed ({} rows in {:.2}s)",
                    label,
                    rows,
                    duration.as_secs_f64()
                );
            }
            Err(e) => {
                error!("{}: failed while {:?}: {}", label, state, e);
                report.state = ChunkState::Failed;
                report.failed_in = Some(state);
                report.error = Some(e);
            }
        }
        report
    }

    async fn run(&self, job: &TransferJob, label: &str, state: &mut ChunkState) -> Result<u64> {
        let mut source = self.source.acquire().await?;
        let mut target = self.target.acquire().await?;

        advance(state, ChunkState::Extracting, label);
        let rows = source.open_chunk(&job.chunk).await?;

        advance(state, ChunkState::Streaming, label);
        let (writer, reader) = bridge::channel(self.config.bridge_capacity);
        let encoder = RowEncoder::new(&job.chunk.table.columns, self.config.max_lob_bytes);

        let (produced, loaded) = tokio::join!(
            produce(rows, writer, &encoder, self.config.frame_bytes, label),
            target.bulk_load(label, &job.target, reader),
        );
        let loaded = settle(produced, loaded)?;

        advance(state, ChunkState::Completed, label);
        Ok(loaded)
    }
}

fn advance(state: &mut ChunkState, next: ChunkState, label: &str) {
    debug!("{}: {:?} -> {:?}", label, state, next);
    *state = next;
}

/// Pump rows through the encoder into the bridge. Closes the bridge after
/// the last row, or aborts it on the first error. Stops pulling rows as soon
/// as the loader has gone away.
async fn produce(
    mut rows: RowStream<'_>,
    writer: BridgeWriter,
    encoder: &RowEncoder,
    frame_bytes: usize,
    label: &str,
) -> Result<u64> {
    let mut buf = BytesMut::with_capacity(frame_bytes);
    let mut count = 0u64;

    let pumped: Result<()> = async {
        loop {
            if writer.is_closed() {
                return Err(MigrateError::StreamClosed);
            }
            let Some(row) = rows.next().await else {
                break;
            };
            let row = row?;
            encoder
                .encode_row(&row, &mut buf)
                .map_err(|source| MigrateError::Encode {
                    chunk: label.to_string(),
                    position: count + 1,
                    source,
                })?;
            count += 1;
            if buf.len() >= frame_bytes {
                writer.write(buf.split().freeze()).await?;
            }
        }
        writer.write(buf.split().freeze()).await
    }
    .await;

    match pumped {
        Ok(()) => {
            writer.close().await?;
            debug!("{}: extracted {} rows", label, count);
            Ok(count)
        }
        Err(e) => {
            writer.fail(e.to_string()).await;
            Err(e)
        }
    }
}

/// Combine both halves of a chunk into one outcome, preferring the error
/// that caused the failure over the one that merely observed it.
fn settle(produced: Result<u64>, loaded: Result<u64>) -> Result<u64> {
    match (produced, loaded) {
        (Ok(extracted), Ok(loaded)) => {
            if extracted != loaded {
                warn!(
                    "extracted {} rows but target reported {} loaded",
                    extracted, loaded
                );
            }
            Ok(loaded)
        }
        (Err(p), Err(c)) => Err(if p.is_derived() && !c.is_derived() { c } else { p }),
        (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
    }
}
