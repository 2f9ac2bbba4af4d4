//! schemalog CLI
//!
//! Entry point for the command-line tool.
//!
//! Exit codes:
//! - 0: Command succeeded
//! - 1: Engine failure (lock timeout, checksum drift, precondition halt,
//!   failed statement, unsupported rollback, or a run that recorded
//!   failed changesets)
//! - 2: Tool error (config error, parse failure, I/O error, etc.)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use schemalog::changelog::filter::name_set;
use schemalog::changelog::{ChangeLog, ChangeLogParameters, FileSystemSource, FilterExpression};
use schemalog::database::{Database, SqliteDatabase};
use schemalog::output::{OutputFormat, reporter_for};
use schemalog::{Config, Engine, EngineError, RunSettings, load_changelog};

/// Default config file name used when --config is not explicitly provided.
const DEFAULT_CONFIG_FILE: &str = "schemalog.toml";

#[derive(Parser, Debug)]
#[command(name = "schemalog", version)]
#[command(about = "Applies XML changelogs to a database and tracks what ran", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Comma-separated contexts to run (overrides config)
    #[arg(long, global = true)]
    contexts: Option<String>,

    /// Label expression, e.g. "api and !legacy" (overrides config)
    #[arg(long, global = true)]
    labels: Option<String>,

    /// Changelog parameter, NAME=VALUE (repeatable)
    #[arg(short = 'D', value_parser = parse_parameter, global = true)]
    define: Vec<(String, String)>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending changesets
    Update {
        /// Apply at most this many changesets
        #[arg(long)]
        count: Option<usize>,
    },
    /// Show what update would do
    Status,
    /// Parse the changelog and check stored checksums
    Validate,
    /// Tag the most recently applied changeset
    Tag { label: String },
    /// Print whether a tag exists
    TagExists { label: String },
    /// Undo changesets applied after a tag
    Rollback { tag: String },
    /// Undo the most recently applied changesets
    RollbackCount { count: usize },
    /// Record pending changesets as executed without running them
    ChangelogSync,
    /// Null out stored checksums so the next run recomputes them
    ClearChecksums,
    /// Show the state of the lock table
    ListLocks,
    /// Release the lock regardless of holder
    ReleaseLocks,
}

fn parse_parameter(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", raw)),
    }
}

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            std::process::exit(exit_code(&err));
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "schemalog=debug"
    } else {
        "schemalog=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Engine errors other than parse failures are exit code 1; everything
/// else is a tool error.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.chain().find_map(|e| e.downcast_ref::<EngineError>()) {
        Some(EngineError::Parse(_)) => 2,
        Some(_) => 1,
        None => 2,
    }
}

/// Run one command. Returns `Ok(false)` when the command completed but
/// recorded failed changesets.
fn run(args: Args) -> Result<bool> {
    let config = load_config(&args.config)?;
    let settings = run_settings(&config, &args)?;

    let mut db = SqliteDatabase::open(&config.database.path)
        .and_then(|db| db.with_busy_timeout(config.database.busy_timeout()))
        .with_context(|| format!("Failed to open database {}", config.database.path.display()))?;
    debug!(database = db.target(), "connected");
    if let Some(schema) = &config.database.default_schema {
        db = db.with_default_schema(schema.clone());
    }

    let reporter = reporter_for(args.format);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let changelog = if needs_changelog(&args.command) {
        Some(load(&config, &args, &settings, &db)?)
    } else {
        None
    };
    let changelog = changelog.as_ref();

    let mut engine = Engine::new(&mut db, &settings);
    match args.command {
        Command::Update { count } => {
            let changelog = require(changelog)?;
            let report = match count {
                Some(n) => engine.update_count(changelog, n)?,
                None => engine.update(changelog)?,
            };
            reporter.emit_run(&report, &mut out)?;
            Ok(report.succeeded())
        }
        Command::Status => {
            let statuses = engine.status(require(changelog)?)?;
            reporter.emit_status(&statuses, &mut out)?;
            Ok(true)
        }
        Command::Validate => {
            engine.validate(require(changelog)?)?;
            writeln!(out, "changelog is valid")?;
            Ok(true)
        }
        Command::Tag { label } => {
            engine.tag(&label)?;
            info!(tag = %label, "tagged database");
            Ok(true)
        }
        Command::TagExists { label } => {
            let exists = engine.tag_exists(&label)?;
            writeln!(out, "{}", exists)?;
            Ok(true)
        }
        Command::Rollback { tag } => {
            let report = engine.rollback_to_tag(require(changelog)?, &tag)?;
            reporter.emit_run(&report, &mut out)?;
            Ok(report.succeeded())
        }
        Command::RollbackCount { count } => {
            let report = engine.rollback_count(require(changelog)?, count)?;
            reporter.emit_run(&report, &mut out)?;
            Ok(report.succeeded())
        }
        Command::ChangelogSync => {
            let report = engine.changelog_sync(require(changelog)?)?;
            reporter.emit_run(&report, &mut out)?;
            Ok(true)
        }
        Command::ClearChecksums => {
            let cleared = engine.clear_checksums()?;
            writeln!(out, "cleared {} checksum(s)", cleared)?;
            Ok(true)
        }
        Command::ListLocks => {
            let locks = engine.list_locks()?;
            reporter.emit_locks(&locks, &mut out)?;
            Ok(true)
        }
        Command::ReleaseLocks => {
            engine.release_locks()?;
            writeln!(out, "lock released")?;
            Ok(true)
        }
    }
}

fn needs_changelog(command: &Command) -> bool {
    matches!(
        command,
        Command::Update { .. }
            | Command::Status
            | Command::Validate
            | Command::Rollback { .. }
            | Command::RollbackCount { .. }
            | Command::ChangelogSync
    )
}

fn require(changelog: Option<&ChangeLog>) -> Result<&ChangeLog> {
    changelog.context("changelog was not loaded")
}

/// Config values first, then command-line overrides.
fn run_settings(config: &Config, args: &Args) -> Result<RunSettings> {
    let mut settings = config
        .to_run_settings()
        .context("Invalid configuration")?;
    if let Some(contexts) = &args.contexts {
        settings.contexts = name_set(contexts);
    }
    if let Some(labels) = &args.labels {
        settings.labels = FilterExpression::parse(labels).context("Invalid --labels")?;
    }
    Ok(settings)
}

fn load(
    config: &Config,
    args: &Args,
    settings: &RunSettings,
    db: &SqliteDatabase,
) -> Result<ChangeLog> {
    let source = FileSystemSource::new(&config.changelog.search_path);
    let mut params = ChangeLogParameters::from_globals(
        config
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(args.define.iter().cloned()),
    );
    let changelog = load_changelog(
        &source,
        &config.changelog.file,
        settings,
        db.dialect(),
        &mut params,
    )
    .with_context(|| format!("Failed to load changelog {}", config.changelog.file))?;
    Ok(changelog)
}

/// Load configuration from file.
///
/// If `config_path` is `Some`, the user explicitly passed `--config` and the file
/// must exist (error if not found). If `None`, the default config path is used;
/// a missing default config file is not an error (falls back to defaults with a warning).
fn load_config(config_path: &Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            Config::from_file(path).context("Failed to load configuration")
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                Config::from_file(&default_path).context("Failed to load configuration")
            } else {
                warn!(
                    "Config file {} not found, using defaults",
                    default_path.display()
                );
                Ok(Config::default())
            }
        }
    }
}
