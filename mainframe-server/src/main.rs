//! # Mainframe Server
//!
//! Coordinates distributed package scanning: workers lease scan jobs, report
//! verdicts, and abandoned leases are swept back into the queue.
//!
//! `serve` runs the daemon side (migrations, lease reaper, status snapshots);
//! the remaining subcommands are operator tools over the same ledger.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use mainframe_core::{InProcStatusEventBus, Mainframe, QueueOutcome};
use mainframe_server::{
    config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions},
    db,
    runtime::{
        build_mainframe, shutdown_signal, spawn_event_logger,
        spawn_status_snapshots,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "mainframe-server")]
#[command(about = "Job coordinator for distributed package scanning")]
struct Cli {
    /// Path to mainframe.toml (defaults to ./mainframe.toml or ./config/mainframe.toml)
    #[arg(long, short = 'c', global = true, env = "MAINFRAME_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Alternate .env file
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run migrations, then the lease reaper and status snapshots until stopped
    Serve(ServeArgs),
    #[command(subcommand)]
    Db(DbCommand),
    /// Queue a package version for scanning
    Enqueue {
        name: String,
        version: String,
        /// Distribution download URL (repeatable)
        #[arg(long = "dist")]
        distributions: Vec<String>,
    },
    /// Print a package's ledger entry as JSON
    Status { name: String, version: String },
    /// Print package counts per status as JSON
    Stats,
    /// Reclaim expired leases once and exit
    Reap,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Lease reaper cadence (overrides config), e.g. `15s`
    #[arg(long, env = "MAINFRAME_REAPER_INTERVAL", value_parser = humantime::parse_duration)]
    reaper_interval: Option<Duration>,

    /// Status snapshot cadence (overrides config), e.g. `1m`
    #[arg(long, env = "MAINFRAME_SNAPSHOT_INTERVAL", value_parser = humantime::parse_duration)]
    snapshot_interval: Option<Duration>,

    /// Connection pool size (overrides config)
    #[arg(long, env = "MAINFRAME_DB_MAX_CONNECTIONS")]
    max_connections: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Quiet driver noise; override via RUST_LOG.
                "info,sqlx=warn,mainframe::snapshot=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = load_config(&cli)?;

    match cli.command {
        Command::Serve(args) => {
            apply_serve_overrides(&mut config, &args);
            run_serve(config).await
        }
        Command::Db(DbCommand::Migrate) => {
            let pool = db::connect(&config.database).await?;
            db::migrate(&pool).await?;
            info!("Database migrations applied successfully");
            Ok(())
        }
        Command::Enqueue {
            name,
            version,
            distributions,
        } => {
            let mainframe = connect_mainframe(&config).await?;
            match mainframe.queue_package(&name, &version, &distributions).await? {
                QueueOutcome::Queued(id) => println!("queued {name}=={version} ({id})"),
                QueueOutcome::AlreadyKnown(status) => {
                    println!("{name}=={version} already known ({status})")
                }
            }
            Ok(())
        }
        Command::Status { name, version } => {
            let mainframe = connect_mainframe(&config).await?;
            let Some(package) = mainframe.package_status(&name, &version).await? else {
                bail!("{name}=={version} is not in the ledger");
            };
            println!("{}", serde_json::to_string_pretty(&package)?);
            Ok(())
        }
        Command::Stats => {
            let mainframe = connect_mainframe(&config).await?;
            let counts = mainframe.status_counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
        Command::Reap => {
            let mainframe = connect_mainframe(&config).await?;
            let reclaimed = mainframe.reap_expired().await?;
            println!("reclaimed {reclaimed} expired lease(s)");
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let ConfigLoad { config, warnings } =
        ConfigLoader::with_options(ConfigLoaderOptions {
            config_path: cli.config.clone(),
            env_file: cli.env_file.clone(),
        })
        .load()
        .context("failed to load configuration")?;

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }
    Ok(config)
}

fn apply_serve_overrides(config: &mut Config, args: &ServeArgs) {
    if let Some(interval) = args.reaper_interval {
        config.mainframe.reaper.interval_ms = interval.as_millis() as u64;
    }
    if let Some(interval) = args.snapshot_interval {
        config.snapshot_interval = interval;
    }
    if let Some(max) = args.max_connections {
        config.database.max_connections = max.max(1);
    }
}

async fn connect_mainframe(config: &Config) -> anyhow::Result<Mainframe> {
    let pool = db::connect(&config.database).await?;
    build_mainframe(pool, config, Arc::new(InProcStatusEventBus::default())).await
}

async fn run_serve(config: Config) -> anyhow::Result<()> {
    info!(
        database = %db::redact_database_url(&config.database.url),
        max_connections = config.database.max_connections,
        "connecting to PostgreSQL"
    );
    let pool = db::connect(&config.database).await?;
    db::migrate(&pool).await?;

    let events = Arc::new(InProcStatusEventBus::default());
    let mainframe =
        Arc::new(build_mainframe(pool.clone(), &config, Arc::clone(&events)).await?);

    let settings = mainframe.config();
    info!(
        lease.default_secs = settings.lease.bounds.default_secs,
        lease.min_secs = settings.lease.bounds.min_secs,
        lease.max_secs = settings.lease.bounds.max_secs,
        lease.classes = settings.lease.classes.len(),
        reaper.interval_ms = settings.reaper.interval_ms,
        reaper.batch_size = settings.reaper.batch_size,
        rules.commit = config.rules.commit.as_deref().unwrap_or("unset"),
        "coordinator configuration in effect"
    );

    let shutdown = CancellationToken::new();
    let reaper = mainframe.spawn_reaper(shutdown.clone());
    let snapshots = spawn_status_snapshots(
        Arc::clone(&mainframe),
        config.snapshot_interval,
        shutdown.clone(),
    );
    let event_logger = spawn_event_logger(&events, shutdown.clone());
    info!("mainframe running");

    shutdown_signal().await;
    shutdown.cancel();

    for (name, handle) in [
        ("lease reaper", reaper),
        ("status snapshots", snapshots),
        ("event logger", event_logger),
    ] {
        if let Err(err) = handle.await {
            warn!("{name} task ended abnormally: {err}");
        }
    }
    pool.close().await;
    info!("mainframe stopped");
    Ok(())
}
