//! Row encoding into the PostgreSQL CSV COPY format.
//!
//! One source row becomes one CSV record: fields are separated by `,`,
//! records end with `\n`, every non-null value is wrapped in `"` with
//! embedded quotes doubled, and SQL NULL is an empty unquoted field. The
//! COPY statement on the target side is issued with `NULL ''`, so an empty
//! quoted field (`""`) still loads as an empty string.
//!
//! Binary values travel as `\x` followed by lowercase hex, which is the
//! `bytea` input syntax and contains no CSV metacharacters.

use crate::source::{ColumnMeta, LobKind};
use bytes::{BufMut, BytesMut};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;
use uuid::Uuid;

/// A decoded source value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// Exact numeric in canonical decimal text (`-12.3400`).
    Numeric(String),
    String(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl SqlValue {
    fn shape(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "boolean",
            SqlValue::I16(_) | SqlValue::I32(_) | SqlValue::I64(_) => "integer",
            SqlValue::F32(_) | SqlValue::F64(_) => "float",
            SqlValue::Numeric(_) => "numeric",
            SqlValue::String(_) => "text",
            SqlValue::Bytes(_) => "binary",
            SqlValue::Uuid(_) => "uuid",
            SqlValue::DateTime(_) => "timestamp",
            SqlValue::Date(_) => "date",
            SqlValue::Time(_) => "time",
        }
    }
}

/// A value that cannot be represented in the COPY stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("column {column}: {reason}")]
pub struct EncodeError {
    pub column: String,
    pub reason: String,
}

impl EncodeError {
    pub fn new(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct EncodeColumn {
    name: String,
    lob: Option<LobKind>,
}

/// Encodes rows of one table, in declared column order.
#[derive(Debug, Clone)]
pub struct RowEncoder {
    columns: Vec<EncodeColumn>,
    max_lob_bytes: usize,
}

impl RowEncoder {
    /// Create an encoder for the given columns. Large-object values longer
    /// than `max_lob_bytes` are rejected.
    pub fn new(columns: &[ColumnMeta], max_lob_bytes: usize) -> Self {
        let columns = columns
            .iter()
            .map(|c| EncodeColumn {
                name: c.name.clone(),
                lob: c.lob,
            })
            .collect();
        Self {
            columns,
            max_lob_bytes,
        }
    }

    /// Append one CSV record to `buf`.
    ///
    /// On error nothing of the failed record remains in `buf`.
    pub fn encode_row(&self, row: &[SqlValue], buf: &mut BytesMut) -> Result<(), EncodeError> {
        if row.len() != self.columns.len() {
            return Err(EncodeError::new(
                "<row>",
                format!(
                    "expected {} values, got {}",
                    self.columns.len(),
                    row.len()
                ),
            ));
        }

        let mark = buf.len();
        for (idx, (column, value)) in self.columns.iter().zip(row).enumerate() {
            if idx > 0 {
                buf.put_u8(b',');
            }
            if let Err(e) = self.encode_value(column, value, buf) {
                buf.truncate(mark);
                return Err(e);
            }
        }
        buf.put_u8(b'\n');
        Ok(())
    }

    fn encode_value(
        &self,
        column: &EncodeColumn,
        value: &SqlValue,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        if let SqlValue::Null = value {
            return Ok(());
        }

        match column.lob {
            Some(LobKind::Binary) => {
                let SqlValue::Bytes(bytes) = value else {
                    return Err(EncodeError::new(
                        &column.name,
                        format!("expected binary large object, got {}", value.shape()),
                    ));
                };
                self.check_lob_size(column, bytes.len())?;
                put_binary(buf, bytes);
                return Ok(());
            }
            Some(LobKind::Character) | Some(LobKind::NationalCharacter) => {
                let SqlValue::String(text) = value else {
                    return Err(EncodeError::new(
                        &column.name,
                        format!("expected character large object, got {}", value.shape()),
                    ));
                };
                self.check_lob_size(column, text.len())?;
                return put_text(buf, &column.name, text);
            }
            None => {}
        }

        match value {
            SqlValue::Null => {}
            SqlValue::Bool(b) => put_quoted(buf, if *b { "t" } else { "f" }),
            SqlValue::I16(n) => put_quoted(buf, &n.to_string()),
            SqlValue::I32(n) => put_quoted(buf, &n.to_string()),
            SqlValue::I64(n) => put_quoted(buf, &n.to_string()),
            SqlValue::F32(n) => put_quoted(buf, &format_float(f64::from(*n), n.to_string())),
            SqlValue::F64(n) => put_quoted(buf, &format_float(*n, n.to_string())),
            SqlValue::Numeric(s) => put_quoted(buf, s),
            SqlValue::String(s) => put_text(buf, &column.name, s)?,
            SqlValue::Bytes(b) => put_binary(buf, b),
            SqlValue::Uuid(u) => put_quoted(buf, &u.hyphenated().to_string()),
            SqlValue::DateTime(dt) => {
                put_quoted(buf, &dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
            }
            SqlValue::Date(d) => put_quoted(buf, &d.format("%Y-%m-%d").to_string()),
            SqlValue::Time(t) => put_quoted(buf, &t.format("%H:%M:%S%.6f").to_string()),
        }
        Ok(())
    }

    fn check_lob_size(&self, column: &EncodeColumn, len: usize) -> Result<(), EncodeError> {
        if len > self.max_lob_bytes {
            return Err(EncodeError::new(
                &column.name,
                format!(
                    "large object of {} bytes exceeds limit of {} bytes",
                    len, self.max_lob_bytes
                ),
            ));
        }
        Ok(())
    }
}

/// Inverse of the binary field encoding: `\x0aff` -> `[0x0a, 0xff]`.
pub fn decode_binary(field: &str) -> Result<Vec<u8>, EncodeError> {
    let digits = field
        .strip_prefix("\\x")
        .ok_or_else(|| EncodeError::new("<binary>", "missing \\x prefix"))?;
    hex::decode(digits).map_err(|e| EncodeError::new("<binary>", e.to_string()))
}

fn format_float(value: f64, display: String) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "Infinity".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        display
    }
}

fn put_text(buf: &mut BytesMut, column: &str, text: &str) -> Result<(), EncodeError> {
    if text.contains('\0') {
        return Err(EncodeError::new(column, "text contains a NUL character"));
    }
    put_quoted(buf, text);
    Ok(())
}

fn put_binary(buf: &mut BytesMut, bytes: &[u8]) {
    buf.reserve(bytes.len() * 2 + 4);
    buf.put_slice(b"\"\\x");
    buf.put_slice(hex::encode(bytes).as_bytes());
    buf.put_u8(b'"');
}

fn put_quoted(buf: &mut BytesMut, text: &str) {
    buf.reserve(text.len() + 2);
    buf.put_u8(b'"');
    let mut parts = text.split('"');
    if let Some(first) = parts.next() {
        buf.put_slice(first.as_bytes());
    }
    for part in parts {
        buf.put_slice(b"\"\"");
        buf.put_slice(part.as_bytes());
    }
    buf.put_u8(b'"');
}
