//! veil: VPN client daemon.
//!
//! Wires the session coordinator to concrete boundaries (HTTP subscription
//! fetcher, tunnel driver, permission backend), drives a connect on
//! startup, and mirrors session snapshots into the log until Ctrl-C.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use veil_session::{ConnectionState, NodeId, SessionCoordinator};
use veil_subscription::HttpFetcher;
use veil_tunnel::{AutoGrantBackend, NullDriver};

mod config;

use config::AppConfig;

// mimalloc keeps long-running sessions from fragmenting the heap
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;

    let fallback = config.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .compact()
        .init();

    info!("veil starting");

    let coordinator = SessionCoordinator::new(
        Arc::new(NullDriver::new()),
        Arc::new(AutoGrantBackend),
        Arc::new(HttpFetcher::with_defaults()),
        config.session_config(),
    );

    let mut observer = coordinator.observe();
    tokio::spawn(async move {
        let mut last_state: Option<ConnectionState> = None;
        while let Some(snap) = observer.next().await {
            if last_state.as_ref() != Some(&snap.state) {
                info!(state = %snap.state, revision = snap.revision, "session state");
                if let Some(error) = &snap.last_error {
                    warn!(%error, "last session error");
                }
                last_state = Some(snap.state.clone());
            } else {
                debug!(
                    traffic = %snap.traffic.format(),
                    revision = snap.revision,
                    "session update"
                );
            }
        }
    });

    if let Some(url) = &config.subscription_url {
        match coordinator.refresh_subscription(url) {
            Ok(_) => {
                wait_for_nodes(&coordinator).await;
                if let Some(id) = &config.node_id {
                    if let Err(e) = coordinator.select_node(&NodeId::from(id.as_str())) {
                        warn!(node_id = %id, error = %e, "could not select configured node");
                    }
                }
            }
            Err(e) => warn!(error = %e, "subscription refresh rejected"),
        }
    }

    coordinator.connect();

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    coordinator.shutdown();
    wait_for_disconnect(&coordinator).await;

    info!("veil stopped");
    Ok(())
}

/// Give the initial refresh a moment to land before node selection.
async fn wait_for_nodes(coordinator: &SessionCoordinator) {
    for _ in 0..100 {
        let snap = coordinator.snapshot();
        if !snap.nodes.is_empty() || snap.last_error.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    warn!("subscription refresh still pending; continuing without node list");
}

async fn wait_for_disconnect(coordinator: &SessionCoordinator) {
    for _ in 0..20 {
        if coordinator.snapshot().state == ConnectionState::Disconnected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
