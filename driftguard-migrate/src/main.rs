//! driftguard migration CLI
//!
//! Applies, reverts and checks SQL migrations kept as
//! `{version}_{name}.up.sql` / `{version}_{name}.down.sql` files.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use driftguard::config::MigrateConfig;
use driftguard::migration::{
    load_sql_registry, MigrationStatus, MigrationTool, Registry, SqlMigrator, SqlScript,
};
use driftguard::{connect, PostgresStore};
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(name = "driftguard-migrate")]
#[command(about = "Versioned schema migrations for PostgreSQL")]
#[command(version)]
struct Cli {
    /// Database connection URL
    #[arg(long)]
    database_url: Option<String>,

    /// Migrations directory path (default: `migrations`, or `migrations.dir` from config)
    #[arg(long)]
    migrations_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Create the migrations tracking table
    Initialize,

    /// Apply pending migrations
    Up,

    /// Revert the latest applied migration
    Down,

    /// Fail if the latest migration has not been applied
    Check,

    /// Remove every tracking record (schema objects are left alone)
    Truncate,

    /// Show applied, pending and unknown versions
    Status,
}

impl Commands {
    fn needs_scripts(self) -> bool {
        matches!(
            self,
            Commands::Up | Commands::Down | Commands::Check | Commands::Status
        )
    }
}

fn log_filter(verbose: bool, quiet: bool) -> &'static str {
    if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    }
}

/// `--database-url`, then `DRIFTGUARD_DATABASE_URL`, then `DATABASE_URL`, then config
fn resolve_database_url(
    flag: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
    config: &MigrateConfig,
) -> String {
    flag.map(str::to_owned)
        .or_else(|| env("DRIFTGUARD_DATABASE_URL"))
        .or_else(|| env("DATABASE_URL"))
        .unwrap_or_else(|| config.database.url.clone())
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_filter(cli.verbose, cli.quiet)),
    )
    .init();

    match run(&cli) {
        Ok(()) => {
            if !cli.quiet {
                println!("{}", "Success".green().bold());
            }
        }
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".red().bold());
            process::exit(1);
        }
    }
}

/// Scripts for commands that need them, from `--migrations-dir` or config
fn load_registry(cli: &Cli, config: &MigrateConfig) -> anyhow::Result<Registry<SqlScript>> {
    if !cli.command.needs_scripts() {
        return Ok(Registry::default());
    }

    let dir = cli
        .migrations_dir
        .clone()
        .unwrap_or_else(|| config.migrations.dir.clone());
    log::debug!("loading migrations from {}", dir.display());
    let registry = load_sql_registry(&dir)
        .with_context(|| format!("failed to load migrations from {}", dir.display()))?;
    log::info!("found {} migration(s) in {}", registry.len(), dir.display());
    Ok(registry)
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = MigrateConfig::load().context("failed to load configuration")?;
    let registry = load_registry(cli, &config)?;

    let url = resolve_database_url(
        cli.database_url.as_deref(),
        |key| std::env::var(key).ok(),
        &config,
    );
    let client = connect(&url).context("failed to connect to database")?;
    let store = PostgresStore::new(client);
    let migrator = SqlMigrator::new(&store, registry);

    match cli.command {
        Commands::Initialize => migrator.initialize()?,
        Commands::Up => {
            let applied = migrator.up()?;
            println!("Applied {applied} migration(s)");
        }
        Commands::Down => match migrator.down()? {
            Some(version) => println!("Reverted migration {version}"),
            None => println!("Nothing to revert"),
        },
        Commands::Check => {
            migrator.check()?;
            println!("Latest migration is applied");
        }
        Commands::Truncate => migrator.truncate()?,
        Commands::Status => print_status(&migrator.status()?),
    }

    if let Some(report) = metrics_report(cli.verbose) {
        print!("{report}");
    }

    Ok(())
}

/// Prometheus exposition of this run, shown with `-v`
#[cfg(feature = "metrics")]
fn metrics_report(verbose: bool) -> Option<String> {
    verbose.then(|| driftguard::metrics::METRICS.render())
}

#[cfg(not(feature = "metrics"))]
fn metrics_report(_verbose: bool) -> Option<String> {
    None
}

fn print_status(status: &MigrationStatus) {
    println!("\n{}\n", "Migration Status".bold());

    if status.applied.is_empty() {
        println!("Applied: none");
    } else {
        println!("Applied ({}):", status.applied.len());
        for version in &status.applied {
            println!("  {} {version}", "✓".green());
        }
    }

    if status.pending.is_empty() {
        println!("Pending: none");
    } else {
        println!("Pending ({}):", status.pending.len());
        for version in &status.pending {
            println!("  {} {version}", "…".yellow());
        }
    }

    if !status.unknown.is_empty() {
        println!("Recorded but not on disk ({}):", status.unknown.len());
        for version in &status.unknown {
            println!("  {} {version}", "?".red());
        }
    }

    println!(
        "\nSummary: {} applied, {} pending",
        status.applied.len(),
        status.pending.len()
    );
}
