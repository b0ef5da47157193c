//! Operator entry point for a repocast store.
//!
//! # Responsibility
//! - Run, inspect and roll back schema migrations.
//! - Validate a configuration's group graph and print its processing order.
//!
//! # Invariants
//! - Every command opens the store through `open_db`, so pending migrations
//!   are applied (or the command fails) before anything else runs.

use clap::{Parser, Subcommand};
use log::error;
use repocast_core::{
    core_version, default_log_level, init_logging, open_db, resolve_processing_order,
    validate_group_dependencies, ChecksumDrift, ConfigRepository, MigrationManager,
    MigrationRecord, SqliteConfigRepository,
};
use rusqlite::Connection;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "repocast", version, about = "Inspect and migrate a repocast store")]
struct Cli {
    /// SQLite store path.
    db: PathBuf,

    /// trace|debug|info|warn|error
    #[arg(long)]
    log_level: Option<String>,

    /// Absolute directory for rolling log files; logging is off without it.
    #[arg(long)]
    log_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending migrations.
    Migrate,
    /// Roll back the most recently applied migration.
    Rollback,
    /// List applied and pending migrations.
    Status {
        /// Print one JSON document instead of text lines.
        #[arg(long)]
        json: bool,
    },
    /// Check a configuration's group dependencies.
    Validate { config: String },
    /// Print a configuration's groups in processing order.
    Order { config: String },
}

#[derive(Serialize)]
struct StatusReport {
    applied: Vec<MigrationRecord>,
    pending: Vec<String>,
    drift: Vec<ChecksumDrift>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(log_dir) = cli.log_dir.as_deref() {
        let level = cli.log_level.as_deref().unwrap_or(default_log_level());
        if let Err(err) = init_logging(level, log_dir) {
            eprintln!("repocast: {err}");
            return ExitCode::FAILURE;
        }
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=cli_command module=cli status=error error={err}");
            eprintln!("repocast: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let manager = MigrationManager::with_builtin_migrations();
    let mut conn = open_db(&cli.db, &manager)?;

    match &cli.command {
        Command::Migrate => {
            // open_db already applied everything; report what is recorded.
            let records = manager.applied(&conn)?;
            println!(
                "repocast {} schema up to date ({} migrations applied)",
                core_version(),
                records.len()
            );
        }
        Command::Rollback => {
            let record = manager.rollback(&mut conn)?;
            println!("rolled back {} ({})", record.version, record.description);
        }
        Command::Status { json: false } => print_status(&manager, &conn)?,
        Command::Status { json: true } => {
            let report = StatusReport {
                applied: manager.applied(&conn)?,
                pending: manager.pending(&conn)?,
                drift: manager.checksum_drift(&conn)?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Validate { config } => {
            let config_id = config_id(&conn, config)?;
            validate_group_dependencies(&conn, config_id)?;
            println!("config `{config}` is valid");
        }
        Command::Order { config } => {
            let config_id = config_id(&conn, config)?;
            for (position, group) in resolve_processing_order(&conn, config_id)?
                .iter()
                .enumerate()
            {
                println!("{:>3}. {} ({})", position + 1, group.external_id, group.name);
            }
        }
    }
    Ok(())
}

fn print_status(
    manager: &MigrationManager,
    conn: &Connection,
) -> Result<(), Box<dyn std::error::Error>> {
    for record in manager.applied(conn)? {
        println!(
            "applied  {}  {}  {}",
            record.version,
            record.applied_at.to_rfc3339(),
            record.description
        );
    }
    for version in manager.pending(conn)? {
        println!("pending  {version}");
    }
    for drift in manager.checksum_drift(conn)? {
        println!(
            "drift    {}  recorded={} expected={}",
            drift.version, drift.recorded, drift.expected
        );
    }
    Ok(())
}

fn config_id(conn: &Connection, name: &str) -> Result<i64, Box<dyn std::error::Error>> {
    SqliteConfigRepository::new(conn)
        .find_config(name)?
        .map(|config| config.id)
        .ok_or_else(|| format!("config `{name}` not found").into())
}
