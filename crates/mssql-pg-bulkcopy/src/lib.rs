//! # mssql-pg-bulkcopy
//!
//! Partitioned, concurrent bulk copy of SQL Server tables into PostgreSQL.
//!
//! Each table is split into contiguous row ranges, and every range is copied
//! by its own worker:
//!
//! - **Partitioning** by dense integer key ranges or by `ROW_NUMBER()` positions
//! - **Streaming** through a bounded channel straight into PostgreSQL `COPY`
//! - **Bounded parallelism** shared across all tables
//! - **Isolated failures**: a failed chunk never stops its siblings
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_pg_bulkcopy::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mssql_pg_bulkcopy::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let result = orchestrator.run(CancellationToken::new(), false).await?;
//!     println!("Copied {} rows", result.rows_transferred);
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod encode;
pub mod error;
pub mod identifier;
pub mod orchestrator;
pub mod partition;
pub mod source;
pub mod target;
pub mod transfer;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, PartitionMode, SourceConfig, TargetConfig};
pub use encode::{EncodeError, RowEncoder, SqlValue};
pub use error::{MigrateError, Result};
pub use orchestrator::{HealthCheckResult, MigrationResult, Orchestrator, TableValidation};
pub use partition::{ChunkSpec, PartitionStrategy};
pub use source::{ColumnMeta, MssqlPool, SourceConnection, SourcePool, TableRef, TableSpec};
pub use target::{CopyTarget, PgPool, TargetConnection, TargetPool};
pub use transfer::{ChunkReport, ChunkState, TransferConfig, TransferEngine, TransferJob};
