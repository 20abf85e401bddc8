use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use mainframe_core::{
    InProcStatusEventBus, Mainframe, PostgresLedgerStore,
};
use mainframe_model::PackageStatus;
use sqlx::PgPool;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;

/// Wires the coordinator over Postgres with the configured rules and knobs.
pub async fn build_mainframe(
    pool: PgPool,
    config: &Config,
    events: Arc<InProcStatusEventBus>,
) -> Result<Mainframe> {
    let store = PostgresLedgerStore::new(pool)
        .await
        .context("ledger store is not ready")?;
    Mainframe::builder(Arc::new(store))
        .with_rules(config.rules.catalog())
        .with_event_publisher(events)
        .with_config(config.mainframe.clone())
        .build()
        .context("invalid coordinator configuration")
}

/// Periodically logs the ledger status counts.
pub fn spawn_status_snapshots(
    mainframe: Arc<Mainframe>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => match mainframe.status_counts().await {
                    Ok(counts) => info!(
                        target: "mainframe::snapshot",
                        unscanned = counts.unscanned,
                        leased = counts.leased,
                        clean = counts.clean,
                        malicious = counts.malicious,
                        errored = counts.errored,
                        active_leases = counts.active_leases,
                        "ledger snapshot"
                    ),
                    Err(err) => warn!(target: "mainframe::snapshot", "status snapshot failed: {err}"),
                },
            }
        }
    })
}

/// Logs committed status changes; malicious verdicts stand out at `warn`.
pub fn spawn_event_logger(
    events: &InProcStatusEventBus,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(change) if change.new_status == PackageStatus::Malicious => {
                        let score = change.findings.as_ref().map(|f| f.score);
                        let rules = change
                            .findings
                            .as_ref()
                            .map(|f| f.rules.join(","))
                            .unwrap_or_default();
                        warn!(
                            target: "mainframe::events",
                            package = %change.package,
                            score,
                            rules = %rules,
                            "malicious package reported"
                        );
                    }
                    Ok(change) => info!(
                        target: "mainframe::events",
                        package = %change.package,
                        from = %change.old_status,
                        to = %change.new_status,
                        "status change"
                    ),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "mainframe::events", skipped, "event logger lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
