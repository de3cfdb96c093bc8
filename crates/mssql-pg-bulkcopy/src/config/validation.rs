//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};
use crate::identifier::split_table_name;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }
    if config.source.r#type != "mssql" {
        return Err(MigrateError::Config(format!(
            "source.type must be 'mssql', got '{}'",
            config.source.r#type
        )));
    }

    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }
    if config.target.r#type != "postgres" {
        return Err(MigrateError::Config(format!(
            "target.type must be 'postgres', got '{}'",
            config.target.r#type
        )));
    }
    crate::target::tls::SslMode::parse(&config.target.ssl_mode)?;

    // Table list
    if config.migration.tables.is_empty() {
        return Err(MigrateError::Config(
            "migration.tables must list at least one table".into(),
        ));
    }
    for table in &config.migration.tables {
        split_table_name(table, &config.source.schema).map_err(|e| {
            MigrateError::Config(format!("invalid table name '{}': {}", table, e))
        })?;
    }

    // Sizing - only check if explicitly set
    if let Some(0) = config.migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.bridge_capacity {
        return Err(MigrateError::Config(
            "migration.bridge_capacity must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.frame_bytes {
        return Err(MigrateError::Config(
            "migration.frame_bytes must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.chunk_timeout_secs {
        return Err(MigrateError::Config(
            "migration.chunk_timeout_secs must be at least 1".into(),
        ));
    }
    for (name, value) in [
        ("max_mssql_connections", config.migration.max_mssql_connections),
        ("max_pg_connections", config.migration.max_pg_connections),
    ] {
        if let Some(0) = value {
            return Err(MigrateError::Config(format!(
                "migration.{} must be at least 1",
                name
            )));
        }
    }

    Ok(())
}
