//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (SQL Server).
    pub source: SourceConfig,

    /// Target database configuration (PostgreSQL).
    pub target: TargetConfig,

    /// Copy behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Source database (SQL Server) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database type (always "mssql").
    #[serde(default = "default_mssql")]
    pub r#type: String,

    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    pub password: String,

    /// Schema used for unqualified table names (default: "dbo").
    #[serde(default = "default_dbo_schema")]
    pub schema: String,

    /// Encrypt connection (default: "true").
    #[serde(default = "default_true_string")]
    pub encrypt: String,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database type (always "postgres").
    #[serde(default = "default_postgres")]
    pub r#type: String,

    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    pub password: String,

    /// Schema the target tables live in (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode: disable, require, verify-ca, verify-full (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// How chunk row ranges are mapped onto source rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionMode {
    /// Key ranges when the primary key is a verified dense integer
    /// sequence, row numbering otherwise.
    #[default]
    Auto,

    /// Key ranges for every table with a primary key.
    KeyRange,

    /// Row numbering for every table.
    RowNumber,
}

/// Copy behavior configuration.
/// Sizing fields use Option<T> to distinguish between "not set" (use the
/// auto-tuned default) and "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationConfig {
    /// Tables to copy, as `schema.table` or bare `table`.
    #[serde(default)]
    pub tables: Vec<String>,

    /// Number of concurrent chunk workers. Auto-tuned from CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Partitioning strategy (default: auto).
    #[serde(default)]
    pub partition_strategy: PartitionMode,

    /// Frames buffered between extraction and load, per chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_capacity: Option<usize>,

    /// Target size of one frame handed to the COPY stream, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_bytes: Option<usize>,

    /// Largest large-object value that will be inlined, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lob_bytes: Option<usize>,

    /// Per-chunk deadline in seconds. No deadline if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_timeout_secs: Option<u64>,

    /// Connection timeout for both pools in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    /// Maximum SQL Server connections. Auto-tuned from workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_mssql_connections: Option<usize>,

    /// Maximum PostgreSQL connections. Auto-tuned from workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pg_connections: Option<usize>,
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;
        let cores = resources.cpu_cores;

        // Workers: cores - 2, clamped to 2..=32
        let workers = *self
            .workers
            .get_or_insert_with(|| cores.saturating_sub(2).clamp(2, 32));

        // Frames in flight: more RAM, deeper pipeline
        if self.bridge_capacity.is_none() {
            self.bridge_capacity = Some(((ram_gb / 4.0) as usize).clamp(8, 64));
        }

        // Each chunk holds one source and one target connection
        if self.max_mssql_connections.is_none() {
            self.max_mssql_connections = Some((workers * 2).clamp(4, 128));
        }
        if self.max_pg_connections.is_none() {
            self.max_pg_connections = Some((workers * 2).clamp(4, 128));
        }

        info!(
            "Auto-tuned config: workers={}, bridge_capacity={}, mssql_conns={}, pg_conns={}",
            workers,
            self.get_bridge_capacity(),
            self.get_max_mssql_connections(),
            self.get_max_pg_connections(),
        );

        self
    }

    // Effective values, with fallbacks for configs that were not auto-tuned

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn get_bridge_capacity(&self) -> usize {
        self.bridge_capacity.unwrap_or(16)
    }

    pub fn get_frame_bytes(&self) -> usize {
        self.frame_bytes.unwrap_or(64 * 1024)
    }

    pub fn get_max_lob_bytes(&self) -> usize {
        self.max_lob_bytes.unwrap_or(256 * 1024 * 1024)
    }

    pub fn get_connect_timeout_secs(&self) -> u64 {
        self.connect_timeout_secs.unwrap_or(30)
    }

    /// Never below one connection per worker plus one for catalog reads.
    pub fn get_max_mssql_connections(&self) -> usize {
        self.max_mssql_connections
            .unwrap_or_else(|| self.get_workers() * 2)
            .max(self.get_workers() + 1)
    }

    /// Never below one connection per worker plus one for row counts.
    pub fn get_max_pg_connections(&self) -> usize {
        self.max_pg_connections
            .unwrap_or_else(|| self.get_workers() * 2)
            .max(self.get_workers() + 1)
    }
}

// Default value functions for serde
fn default_mssql() -> String {
    "mssql".to_string()
}

fn default_postgres() -> String {
    "postgres".to_string()
}

fn default_mssql_port() -> u16 {
    1433
}

fn default_pg_port() -> u16 {
    5432
}

fn default_dbo_schema() -> String {
    "dbo".to_string()
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_true_string() -> String {
    "true".to_string()
}

fn default_require() -> String {
    "require".to_string()
}
