//! mssql-pg-bulkcopy CLI - partitioned bulk copy from SQL Server to PostgreSQL.

use clap::{Parser, Subcommand};
use mssql_pg_bulkcopy::{Config, MigrateError, MigrationResult, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mssql-pg-bulkcopy")]
#[command(about = "Partitioned, concurrent bulk copy from SQL Server to PostgreSQL")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for running chunks after a shutdown signal (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy the configured tables
    Run {
        /// Override source schema
        #[arg(long)]
        source_schema: Option<String>,

        /// Override target schema
        #[arg(long)]
        target_schema: Option<String>,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Override the table list (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,

        /// Dry run: show the chunk plan without transferring data
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate row counts between source and target
    Validate,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    // Overrides go in before auto-tuning so pool sizes follow the final
    // worker count.
    if let Commands::Run {
        source_schema,
        target_schema,
        workers,
        tables,
        ..
    } = &cli.command
    {
        if let Some(schema) = source_schema {
            config.source.schema = schema.clone();
        }
        if let Some(schema) = target_schema {
            config.target.schema = schema.clone();
        }
        if let Some(w) = workers {
            config.migration.workers = Some(*w);
        }
        if let Some(tables) = tables {
            config.migration.tables = tables.clone();
        }
        config.validate()?;
    }
    let config = config.with_auto_tuning();

    match cli.command {
        Commands::Run { dry_run, .. } => {
            let cancel_token = setup_signal_handler(cli.shutdown_timeout)?;
            let orchestrator = Orchestrator::new(config).await?;

            let result = run_until_shutdown(
                &orchestrator,
                cancel_token,
                Duration::from_secs(cli.shutdown_timeout),
                dry_run,
            )
            .await;
            orchestrator.close().await;
            let result = result?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_summary(&result, dry_run);
            }

            run_outcome(&result)?;
        }

        Commands::Validate => {
            let orchestrator = Orchestrator::new(config).await?;
            let results = orchestrator.validate().await?;
            orchestrator.close().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                println!("Row count validation:");
                for r in &results {
                    let target = r
                        .target_rows
                        .map_or_else(|| "missing".to_string(), |n| n.to_string());
                    println!(
                        "  {} {}: source={} target={}",
                        if r.matches { "OK      " } else { "MISMATCH" },
                        r.table,
                        r.source_rows,
                        target
                    );
                }
            }

            let matched = results.iter().filter(|r| r.matches).count();
            println!(
                "Validation completed: {}/{} tables match",
                matched,
                results.len()
            );
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config).await?;
            let result = orchestrator.health_check().await;
            orchestrator.close().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source (MSSQL): {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::pool("Health check failed", "health-check"));
            }
        }
    }

    Ok(())
}

/// Run the copy, giving running chunks `grace` to wind down once `cancel`
/// fires before giving up on them.
async fn run_until_shutdown(
    orchestrator: &Orchestrator,
    cancel: CancellationToken,
    grace: Duration,
    dry_run: bool,
) -> Result<MigrationResult, MigrateError> {
    let deadline = {
        let cancel = cancel.clone();
        async move {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        }
    };

    tokio::select! {
        result = orchestrator.run(cancel, dry_run) => result,
        _ = deadline => Err(MigrateError::Cancelled),
    }
}

fn print_summary(result: &MigrationResult, dry_run: bool) {
    if dry_run {
        println!("\nDry run completed!");
        for table in &result.tables {
            match &table.error {
                Some(err) => println!("  {}: FAILED ({})", table.table, err),
                None => println!(
                    "  {}: {} rows, {} chunks ({}) {:?}",
                    table.table,
                    table.row_count,
                    table.chunks.len(),
                    table.strategy.as_deref().unwrap_or("none"),
                    table.chunks
                ),
            }
        }
        println!("  Chunks planned: {}", result.chunks_planned);
        return;
    }

    println!("\nCopy {}!", result.status.replace('_', " "));
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!(
        "  Tables: {}/{} ({} skipped, {} failed)",
        result.tables_processed, result.tables_total, result.tables_skipped, result.tables_failed
    );
    println!(
        "  Chunks: {}/{} ({} failed)",
        result.chunks_completed, result.chunks_planned, result.chunks_failed
    );
    println!("  Rows: {}", result.rows_transferred);
    println!("  Throughput: {} rows/sec", result.rows_per_second);
    if !result.failed_tables.is_empty() {
        println!("  Failed tables: {:?}", result.failed_tables);
    }
    for chunk in &result.failed_chunks {
        println!(
            "  Failed chunk: {}#{} [{}..{}]: {}",
            chunk.table, chunk.index, chunk.start, chunk.end, chunk.error
        );
    }
}

/// Map a finished run onto the process outcome.
fn run_outcome(result: &MigrationResult) -> Result<(), MigrateError> {
    if result.status == "cancelled" {
        return Err(MigrateError::Cancelled);
    }
    if result.chunks_failed > 0 {
        return Err(MigrateError::ChunksFailed {
            failed: result.chunks_failed,
            planned: result.chunks_planned,
        });
    }
    if !result.failed_tables.is_empty() {
        return Err(MigrateError::metadata(
            result.failed_tables.join(", "),
            "table could not be planned",
        ));
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so --output-json stays parseable.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (container shutdown).
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\nReceived Ctrl-C. Shutting down gracefully (timeout: {}s)...",
                shutdown_timeout
            );
            token.cancel();
        }
    });

    Ok(cancel_token)
}
