//! PostgreSQL target: CSV COPY ingestion.

pub mod tls;

use crate::bridge::BridgeReader;
use crate::config::TargetConfig;
use crate::error::{MigrateError, Result};
use crate::identifier::{pg_column_list, qualify_pg};
use async_trait::async_trait;
use bytes::Bytes;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::SinkExt;
use std::time::Duration;
use tls::SslMode;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{debug, info};

/// Target database operations.
#[async_trait]
pub trait TargetPool: Send + Sync {
    /// Check out a connection for one chunk.
    async fn acquire(&self) -> Result<Box<dyn TargetConnection>>;

    /// Exact row count of a table.
    async fn row_count(&self, schema: &str, table: &str) -> Result<i64>;

    /// Round-trip a trivial query.
    async fn test_connection(&self) -> Result<()>;

    /// Close all connections.
    async fn close(&self);
}

/// A checked-out target connection. Returned to its pool on drop.
#[async_trait]
pub trait TargetConnection: Send {
    /// Stream every frame from `reader` into one COPY command.
    ///
    /// The COPY is committed only after the reader reports a clean end; any
    /// other outcome aborts it. Returns the number of rows the target
    /// reports as loaded.
    async fn bulk_load(
        &mut self,
        chunk: &str,
        target: &CopyTarget,
        reader: BridgeReader,
    ) -> Result<u64>;
}

/// Where and how a table's rows land on the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTarget {
    pub schema: String,
    pub table: String,
    /// Column names in encoded field order.
    pub columns: Vec<String>,
}

impl CopyTarget {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// `COPY ... FROM STDIN` for the CSV records produced by the row encoder.
    pub fn copy_statement(&self) -> Result<String> {
        Ok(format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT csv, DELIMITER ',', QUOTE '\"', NULL '', ENCODING 'UTF8')",
            qualify_pg(&self.schema, &self.table)?,
            pg_column_list(&self.columns)?
        ))
    }
}

/// PostgreSQL target pool implementation.
pub struct PgPool {
    pool: Pool,
}

impl PgPool {
    /// Create a new pool and verify it with a test query.
    pub async fn new(config: &TargetConfig, max_conns: usize, connect_timeout: Duration) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("mssql-pg-bulkcopy");
        pg_config.connect_timeout(connect_timeout);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let ssl_mode = SslMode::parse(&config.ssl_mode)?;
        let mgr = match tls::make_connector(ssl_mode)? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => Manager::from_config(pg_config, NoTls, mgr_config),
        };

        let pool = Pool::builder(mgr)
            .max_size(max_conns.max(1))
            .build()
            .map_err(|e| MigrateError::pool(e.to_string(), "creating PostgreSQL pool"))?;

        let pg = Self { pool };
        pg.test_connection().await?;

        info!(
            "Connected to PostgreSQL: {}:{}/{} (pool_size={}, ssl_mode={:?})",
            config.host, config.port, config.database, max_conns, ssl_mode
        );

        Ok(pg)
    }

    async fn get_client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "checking out PostgreSQL connection"))
    }
}

#[async_trait]
impl TargetPool for PgPool {
    async fn acquire(&self) -> Result<Box<dyn TargetConnection>> {
        let client = self.get_client().await?;
        Ok(Box::new(PgConnection { client }))
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        let client = self.get_client().await?;
        let sql = format!("SELECT COUNT(*) FROM {}", qualify_pg(schema, table)?);
        let row = client.query_one(sql.as_str(), &[]).await?;
        Ok(row.get(0))
    }

    async fn test_connection(&self) -> Result<()> {
        let client = self.get_client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// A pooled PostgreSQL connection bound to one chunk.
pub struct PgConnection {
    client: Object,
}

#[async_trait]
impl TargetConnection for PgConnection {
    async fn bulk_load(
        &mut self,
        chunk: &str,
        target: &CopyTarget,
        mut reader: BridgeReader,
    ) -> Result<u64> {
        let statement = target.copy_statement()?;
        debug!("{}: {}", chunk, statement);

        let sink = self
            .client
            .copy_in::<_, Bytes>(statement.as_str())
            .await
            .map_err(|e| MigrateError::ingestion(chunk, describe_pg_error(&e)))?;

        // Dropping the sink before `finish` sends CopyFail.
        futures::pin_mut!(sink);

        while let Some(frame) = reader.next_frame().await? {
            sink.send(frame)
                .await
                .map_err(|e| MigrateError::ingestion(chunk, describe_pg_error(&e)))?;
        }

        sink.finish()
            .await
            .map_err(|e| MigrateError::ingestion(chunk, describe_pg_error(&e)))
    }
}

/// Server-side SQLSTATE and message when available, the client error otherwise.
fn describe_pg_error(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => match db.detail() {
            Some(detail) => format!("{} ({}): {}", db.message(), db.code().code(), detail),
            None => format!("{} ({})", db.message(), db.code().code()),
        },
        None => e.to_string(),
    }
}
