//! Table and column metadata types.

use crate::error::Result;
use crate::identifier::{quote_mssql, split_table_name};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A table named by the user, not yet resolved against the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    /// Parse `schema.table` or a bare `table` in `default_schema`.
    pub fn parse(input: &str, default_schema: &str) -> Result<Self> {
        let (schema, name) = split_table_name(input, default_schema)?;
        Ok(Self { schema, name })
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Storage class of a large-object column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LobKind {
    /// `image`, `varbinary(max)` (including FILESTREAM data).
    Binary,
    /// `text`, `varchar(max)`.
    Character,
    /// `ntext`, `nvarchar(max)`, `xml`.
    NationalCharacter,
}

/// How a column's values are read off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Numeric,
    Text,
    Binary,
    Uuid,
    DateTime,
    Date,
    Time,
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    /// Lower-cased name, used for the target column list.
    pub name: String,

    /// Name exactly as the catalog spells it, used in source SQL.
    pub source_name: String,

    /// Lower-cased declared type (e.g. "nvarchar", "datetime2").
    pub data_type: String,

    /// Declared character/byte length, -1 for MAX.
    pub max_length: i32,

    pub lob: Option<LobKind>,

    pub kind: ValueKind,
}

impl ColumnMeta {
    pub fn new(source_name: &str, data_type: &str, max_length: i32) -> Self {
        let data_type = data_type.to_lowercase();
        let is_max = max_length == -1;

        let lob = match data_type.as_str() {
            "image" => Some(LobKind::Binary),
            "varbinary" if is_max => Some(LobKind::Binary),
            "text" => Some(LobKind::Character),
            "varchar" if is_max => Some(LobKind::Character),
            "ntext" | "xml" => Some(LobKind::NationalCharacter),
            "nvarchar" if is_max => Some(LobKind::NationalCharacter),
            _ => None,
        };

        let kind = match data_type.as_str() {
            "bit" => ValueKind::Bool,
            "tinyint" => ValueKind::U8,
            "smallint" => ValueKind::I16,
            "int" => ValueKind::I32,
            "bigint" => ValueKind::I64,
            "real" => ValueKind::F32,
            "float" => ValueKind::F64,
            "decimal" | "numeric" | "money" | "smallmoney" => ValueKind::Numeric,
            "uniqueidentifier" => ValueKind::Uuid,
            "datetime" | "datetime2" | "smalldatetime" => ValueKind::DateTime,
            "date" => ValueKind::Date,
            "time" => ValueKind::Time,
            "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => ValueKind::Binary,
            // char, varchar, nchar, nvarchar, text, ntext, and everything cast
            // to text in the select list
            _ => ValueKind::Text,
        };

        Self {
            name: source_name.to_lowercase(),
            source_name: source_name.to_string(),
            data_type,
            max_length,
            lob,
            kind,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self.kind,
            ValueKind::U8 | ValueKind::I16 | ValueKind::I32 | ValueKind::I64
        )
    }

    /// Select-list expression for this column.
    ///
    /// Types the TDS decoder cannot hand back losslessly are converted to
    /// text or decimal on the server and aliased back to the column name.
    pub fn select_expression(&self) -> Result<String> {
        let q = quote_mssql(&self.source_name)?;
        Ok(match self.data_type.as_str() {
            "xml" => format!("CAST({q} AS NVARCHAR(MAX)) AS {q}"),
            "sql_variant" => format!("CAST({q} AS NVARCHAR(4000)) AS {q}"),
            "money" => format!("CAST({q} AS DECIMAL(19,4)) AS {q}"),
            "smallmoney" => format!("CAST({q} AS DECIMAL(10,4)) AS {q}"),
            "datetimeoffset" => format!("CONVERT(NVARCHAR(40), {q}, 127) AS {q}"),
            "hierarchyid" => format!("{q}.ToString() AS {q}"),
            "geography" | "geometry" => format!("{q}.STAsText() AS {q}"),
            _ => q,
        })
    }
}

/// Everything the copy engine knows about one source table.
///
/// Built once per table and shared read-only by all of its chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    /// Schema as spelled by the catalog.
    pub schema: String,

    /// Table name as spelled by the catalog.
    pub name: String,

    /// Columns in ordinal order.
    pub columns: Vec<ColumnMeta>,

    /// Primary key column source names in key order, empty without a key.
    pub primary_key: Vec<String>,

    /// Exact row count at planning time.
    pub row_count: i64,

    /// MIN/MAX of a single-column integer primary key.
    pub key_bounds: Option<(i64, i64)>,
}

impl TableSpec {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn has_pk(&self) -> bool {
        !self.primary_key.is_empty()
    }

    /// The key column when the primary key is exactly one integer column.
    pub fn single_integer_key(&self) -> Option<&ColumnMeta> {
        match self.primary_key.as_slice() {
            [only] => self
                .columns
                .iter()
                .find(|c| &c.source_name == only)
                .filter(|c| c.is_integer()),
            _ => None,
        }
    }

    /// True when the key values are exactly `1..=row_count`, so a key range
    /// and a row-position range select the same rows.
    pub fn has_dense_key(&self) -> bool {
        self.single_integer_key().is_some() && self.key_bounds == Some((1, self.row_count))
    }

    /// Normalised column names for the target column list.
    pub fn target_columns(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}
