//! SQL Server source: catalog reads and chunk extraction.

mod types;

pub use types::*;

use crate::config::SourceConfig;
use crate::encode::SqlValue;
use crate::error::{MigrateError, Result};
use crate::identifier::{qualify_mssql, quote_mssql};
use crate::partition::ChunkSpec;
use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use futures::stream::{BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tiberius::numeric::Numeric;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Query, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};
use uuid::Uuid;

/// Decoded rows of one chunk, in cursor order.
pub type RowStream<'a> = BoxStream<'a, Result<Vec<SqlValue>>>;

/// Source database operations.
#[async_trait]
pub trait SourcePool: Send + Sync {
    /// Resolve a table and read its columns, key, and exact row count.
    async fn describe_table(&self, table: &TableRef) -> Result<TableSpec>;

    /// Check out a connection for one chunk.
    async fn acquire(&self) -> Result<Box<dyn SourceConnection>>;

    /// Exact row count of a table.
    async fn row_count(&self, table: &TableRef) -> Result<i64>;

    /// Round-trip a trivial query.
    async fn test_connection(&self) -> Result<()>;

    /// Close all connections.
    async fn close(&self);
}

/// A checked-out source connection. Returned to its pool on drop.
#[async_trait]
pub trait SourceConnection: Send {
    /// Run the chunk query bound to the chunk's range and stream its rows.
    async fn open_chunk<'a>(&'a mut self, chunk: &'a ChunkSpec) -> Result<RowStream<'a>>;
}

/// Pooled TDS client plus whether a result stream is still unread on it.
struct TdsClient {
    client: Client<Compat<TcpStream>>,
    in_flight: bool,
}

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(&self.config.user, &self.config.password));
        config.application_name("mssql-pg-bulkcopy");

        if self.config.encryption_enabled() {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = TdsClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;

        tcp.set_nodelay(true).ok();

        let client = Client::connect(config, tcp.compat_write()).await?;
        Ok(TdsClient {
            client,
            in_flight: false,
        })
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    /// A connection with unread results cannot take another query.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.in_flight
    }
}

/// SQL Server source pool implementation with connection pooling.
pub struct MssqlPool {
    pool: Pool<TiberiusConnectionManager>,
}

impl MssqlPool {
    /// Create a new pool and verify it with a test query.
    pub async fn new(config: SourceConfig, max_size: u32, connect_timeout: Duration) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(max_size.max(1))
            .min_idle(Some(1))
            .connection_timeout(connect_timeout)
            .build(manager)
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "creating SQL Server pool"))?;

        let mssql = Self { pool };
        mssql.test_connection().await?;

        info!(
            "Connected to SQL Server: {}:{}/{} (pool_size={})",
            config.host, config.port, config.database, max_size
        );

        Ok(mssql)
    }

    async fn get_client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "checking out SQL Server connection"))
    }

    /// Resolve the table's catalog spelling.
    async fn resolve_table(client: &mut TdsClient, table: &TableRef) -> Result<(String, String)> {
        let query = r#"
            SELECT TABLE_SCHEMA, TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_TYPE = 'BASE TABLE'
              AND TABLE_SCHEMA = @P1
              AND TABLE_NAME = @P2
        "#;

        let mut query = Query::new(query);
        query.bind(table.schema.as_str());
        query.bind(table.name.as_str());

        let row = query
            .query(&mut client.client)
            .await
            .map_err(catalog_error(table))?
            .into_row()
            .await
            .map_err(catalog_error(table))?
            .ok_or_else(|| MigrateError::metadata(table.to_string(), "table not found"))?;

        let schema = text_column(&row, 0, table)?;
        let name = text_column(&row, 1, table)?;
        Ok((schema, name))
    }

    async fn load_columns(client: &mut TdsClient, table: &TableRef) -> Result<Vec<ColumnMeta>> {
        let query = r#"
            SELECT
                COLUMN_NAME,
                DATA_TYPE,
                CAST(ISNULL(CHARACTER_MAXIMUM_LENGTH, 0) AS INT)
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2
            ORDER BY ORDINAL_POSITION
        "#;

        let mut query = Query::new(query);
        query.bind(table.schema.as_str());
        query.bind(table.name.as_str());

        let rows = query
            .query(&mut client.client)
            .await
            .map_err(catalog_error(table))?
            .into_first_result()
            .await
            .map_err(catalog_error(table))?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name = text_column(&row, 0, table)?;
            let data_type = text_column(&row, 1, table)?;
            let max_length = row
                .try_get::<i32, _>(2)
                .map_err(catalog_error(table))?
                .unwrap_or(0);
            columns.push(ColumnMeta::new(&name, &data_type, max_length));
        }

        debug!("Loaded {} columns for {}", columns.len(), table);
        Ok(columns)
    }

    async fn load_primary_key(client: &mut TdsClient, table: &TableRef) -> Result<Vec<String>> {
        let query = r#"
            SELECT c.COLUMN_NAME
            FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
            JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE c
                ON c.CONSTRAINT_NAME = tc.CONSTRAINT_NAME
                AND c.TABLE_SCHEMA = tc.TABLE_SCHEMA
                AND c.TABLE_NAME = tc.TABLE_NAME
            WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
              AND tc.TABLE_SCHEMA = @P1
              AND tc.TABLE_NAME = @P2
            ORDER BY c.ORDINAL_POSITION
        "#;

        let mut query = Query::new(query);
        query.bind(table.schema.as_str());
        query.bind(table.name.as_str());

        let rows = query
            .query(&mut client.client)
            .await
            .map_err(catalog_error(table))?
            .into_first_result()
            .await
            .map_err(catalog_error(table))?;

        let key = rows
            .iter()
            .map(|row| text_column(row, 0, table))
            .collect::<Result<Vec<_>>>()?;

        debug!("Primary key for {}: {:?}", table, key);
        Ok(key)
    }

    async fn count_rows(client: &mut TdsClient, table: &TableRef) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT_BIG(*) FROM {}",
            qualify_mssql(&table.schema, &table.name)?
        );

        let row = client
            .client
            .simple_query(sql)
            .await
            .map_err(catalog_error(table))?
            .into_row()
            .await
            .map_err(catalog_error(table))?;

        let count = match row {
            Some(row) => row.try_get::<i64, _>(0).map_err(catalog_error(table))?,
            None => None,
        };
        Ok(count.unwrap_or(0))
    }

    async fn load_key_bounds(
        client: &mut TdsClient,
        table: &TableRef,
        key: &ColumnMeta,
    ) -> Result<Option<(i64, i64)>> {
        let column = quote_mssql(&key.source_name)?;
        let sql = format!(
            "SELECT CAST(MIN({column}) AS BIGINT), CAST(MAX({column}) AS BIGINT) FROM {}",
            qualify_mssql(&table.schema, &table.name)?
        );

        let row = client
            .client
            .simple_query(sql)
            .await
            .map_err(catalog_error(table))?
            .into_row()
            .await
            .map_err(catalog_error(table))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let min = row.try_get::<i64, _>(0).map_err(catalog_error(table))?;
        let max = row.try_get::<i64, _>(1).map_err(catalog_error(table))?;
        Ok(min.zip(max))
    }
}

#[async_trait]
impl SourcePool for MssqlPool {
    async fn describe_table(&self, table: &TableRef) -> Result<TableSpec> {
        let mut client = self.get_client().await?;

        let (schema, name) = Self::resolve_table(&mut client, table).await?;
        let resolved = TableRef { schema, name };

        let columns = Self::load_columns(&mut client, &resolved).await?;
        if columns.is_empty() {
            return Err(MigrateError::metadata(resolved.to_string(), "table has no columns"));
        }
        let primary_key = Self::load_primary_key(&mut client, &resolved).await?;
        let row_count = Self::count_rows(&mut client, &resolved).await?;

        let mut spec = TableSpec {
            schema: resolved.schema.clone(),
            name: resolved.name.clone(),
            columns,
            primary_key,
            row_count,
            key_bounds: None,
        };

        if let Some(key) = spec.single_integer_key().cloned() {
            spec.key_bounds = Self::load_key_bounds(&mut client, &resolved, &key).await?;
        }

        debug!(
            "{}: {} rows, key {:?}, bounds {:?}",
            spec.full_name(),
            spec.row_count,
            spec.primary_key,
            spec.key_bounds
        );
        Ok(spec)
    }

    async fn acquire(&self) -> Result<Box<dyn SourceConnection>> {
        let conn = self
            .pool
            .get_owned()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "checking out SQL Server connection"))?;
        Ok(Box::new(MssqlConnection { conn }))
    }

    async fn row_count(&self, table: &TableRef) -> Result<i64> {
        let mut client = self.get_client().await?;
        Self::count_rows(&mut client, table).await
    }

    async fn test_connection(&self) -> Result<()> {
        let mut client = self.get_client().await?;
        client
            .client
            .simple_query("SELECT 1")
            .await?
            .into_row()
            .await?;
        Ok(())
    }

    async fn close(&self) {
        // Connections close as the pool drops them.
    }
}

/// A pooled SQL Server connection bound to one chunk.
pub struct MssqlConnection {
    conn: PooledConnection<'static, TiberiusConnectionManager>,
}

#[async_trait]
impl SourceConnection for MssqlConnection {
    async fn open_chunk<'a>(&'a mut self, chunk: &'a ChunkSpec) -> Result<RowStream<'a>> {
        let label = chunk.to_string();
        let TdsClient { client, in_flight } = &mut *self.conn;

        let mut query = Query::new(chunk.query.as_str());
        query.bind(chunk.start);
        query.bind(chunk.end);

        *in_flight = true;
        let stream = query
            .query(client)
            .await
            .map_err(|e| MigrateError::extraction(label.clone(), e))?;

        let rows = TrackedRows {
            rows: stream.into_row_stream(),
            in_flight,
        };
        let columns = chunk.table.columns.as_slice();

        Ok(rows
            .map(move |row| {
                let row = row.map_err(|e| MigrateError::extraction(label.clone(), e))?;
                decode_row(&row, columns).map_err(|e| MigrateError::extraction(label.clone(), e))
            })
            .boxed())
    }
}

/// Clears the in-flight flag once the result stream is fully read.
struct TrackedRows<'a> {
    rows: BoxStream<'a, tiberius::Result<Row>>,
    in_flight: &'a mut bool,
}

impl Stream for TrackedRows<'_> {
    type Item = tiberius::Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = futures::ready!(this.rows.poll_next_unpin(cx));
        if item.is_none() {
            *this.in_flight = false;
        }
        Poll::Ready(item)
    }
}

fn catalog_error(table: &TableRef) -> impl Fn(tiberius::error::Error) -> MigrateError + '_ {
    move |e| MigrateError::metadata(table.to_string(), e.to_string())
}

fn text_column(row: &Row, idx: usize, table: &TableRef) -> Result<String> {
    row.try_get::<&str, _>(idx)
        .map_err(catalog_error(table))?
        .map(str::to_string)
        .ok_or_else(|| MigrateError::metadata(table.to_string(), "unexpected NULL in catalog"))
}

/// Decode one row into values in column order.
fn decode_row(row: &Row, columns: &[ColumnMeta]) -> std::result::Result<Vec<SqlValue>, String> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            decode_value(row, idx, col.kind)
                .map_err(|e| format!("decoding column {}: {}", col.source_name, e))
        })
        .collect()
}

fn decode_value(row: &Row, idx: usize, kind: ValueKind) -> tiberius::Result<SqlValue> {
    let value = match kind {
        ValueKind::Bool => row.try_get::<bool, _>(idx)?.map(SqlValue::Bool),
        ValueKind::U8 => row
            .try_get::<u8, _>(idx)?
            .map(|v| SqlValue::I16(i16::from(v))),
        ValueKind::I16 => row.try_get::<i16, _>(idx)?.map(SqlValue::I16),
        ValueKind::I32 => row.try_get::<i32, _>(idx)?.map(SqlValue::I32),
        ValueKind::I64 => row.try_get::<i64, _>(idx)?.map(SqlValue::I64),
        ValueKind::F32 => row.try_get::<f32, _>(idx)?.map(SqlValue::F32),
        ValueKind::F64 => row.try_get::<f64, _>(idx)?.map(SqlValue::F64),
        ValueKind::Numeric => row
            .try_get::<Numeric, _>(idx)?
            .map(|n| SqlValue::Numeric(format_numeric(n.value(), n.scale()))),
        ValueKind::Text => row
            .try_get::<&str, _>(idx)?
            .map(|s| SqlValue::String(s.to_string())),
        ValueKind::Binary => row
            .try_get::<&[u8], _>(idx)?
            .map(|b| SqlValue::Bytes(b.to_vec())),
        ValueKind::Uuid => row.try_get::<Uuid, _>(idx)?.map(SqlValue::Uuid),
        ValueKind::DateTime => row.try_get::<NaiveDateTime, _>(idx)?.map(SqlValue::DateTime),
        ValueKind::Date => row.try_get::<NaiveDate, _>(idx)?.map(SqlValue::Date),
        ValueKind::Time => row.try_get::<NaiveTime, _>(idx)?.map(SqlValue::Time),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

/// Render a scaled integer as exact decimal text.
fn format_numeric(value: i128, scale: u8) -> String {
    if scale == 0 {
        return value.to_string();
    }
    let scale = usize::from(scale);
    let mut digits = value.unsigned_abs().to_string();
    if digits.len() <= scale {
        digits.insert_str(0, &"0".repeat(scale - digits.len() + 1));
    }
    let (int_part, frac_part) = digits.split_at(digits.len() - scale);
    let sign = if value < 0 { "-" } else { "" };
    format!("{sign}{int_part}.{frac_part}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_numeric() {
        assert_eq!(format_numeric(-123400, 4), "-12.3400");
        assert_eq!(format_numeric(5, 3), "0.005");
        assert_eq!(format_numeric(-5, 3), "-0.005");
        assert_eq!(format_numeric(0, 2), "0.00");
        assert_eq!(format_numeric(42, 0), "42");
        assert_eq!(
            format_numeric(99999999999999999999999999999999999999, 2),
            "999999999999999999999999999999999999.99"
        );
    }
}
