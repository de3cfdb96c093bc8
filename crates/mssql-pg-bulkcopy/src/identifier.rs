//! Identifier validation and quoting.
//!
//! Identifiers cannot be bound as statement parameters, so every table and
//! column name that ends up in generated SQL passes through this module.
//! Names are only ever taken from catalog results, validated, and quoted
//! with the engine's own delimiter.

use crate::error::{MigrateError, Result};

/// Longest identifier SQL Server accepts (`sysname`).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Reject empty identifiers, identifiers with NUL bytes, and identifiers
/// longer than [`MAX_IDENTIFIER_LENGTH`] bytes.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier, doubling embedded `"`.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a SQL Server identifier, doubling embedded `]`.
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// `"schema"."table"`
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// `[schema].[table]`
pub fn qualify_mssql(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_mssql(schema)?, quote_mssql(table)?))
}

/// Comma-separated list of quoted PostgreSQL column names.
pub fn pg_column_list<S: AsRef<str>>(columns: &[S]) -> Result<String> {
    let quoted = columns
        .iter()
        .map(|c| quote_pg(c.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(", "))
}

/// Split a user-supplied `schema.table` (or bare `table`) into its parts.
///
/// Surrounding brackets are stripped so `[dbo].[Orders]` and `dbo.Orders`
/// name the same table. The result is only used as a lookup key against the
/// catalog, never spliced into SQL.
pub fn split_table_name(input: &str, default_schema: &str) -> Result<(String, String)> {
    let input = input.trim();
    let (schema, table) = match input.split_once('.') {
        Some((schema, table)) => (unbracket(schema), unbracket(table)),
        None => (default_schema.to_string(), unbracket(input)),
    };
    validate_identifier(&schema)?;
    validate_identifier(&table)?;
    Ok((schema, table))
}

fn unbracket(part: &str) -> String {
    let part = part.trim();
    match part.strip_prefix('[').and_then(|p| p.strip_suffix(']')) {
        Some(inner) => inner.replace("]]", "]"),
        None => part.to_string(),
    }
}
