//! Shutdown reconciler: on SIGTERM/SIGINT, tell every connection to close
//! with 4009 and give them a grace period to drain before forcing exit.
//!
//! Grounded on the teacher's spawn-a-signal-waiter-that-force-exits pattern
//! in `server.rs`, generalized from a fixed 5s browser-pool grace period to
//! the protocol's 60s shutdown grace and a drain-then-exit loop instead of
//! a single sleep.

use std::sync::Arc;
use std::time::Duration;

use mycelium_protocol::SHUTDOWN_GRACE;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::hub::Hub;

/// Wait for SIGTERM or SIGINT, then drive the shutdown sequence. Never
/// returns under normal operation — the process exits from within.
pub async fn run(shutdown_tx: watch::Sender<bool>, hub: Arc<Hub>) {
    wait_for_signal().await;
    info!("shutdown signal received, closing connections");

    if shutdown_tx.send(true).is_err() {
        warn!("no connection tasks were listening for shutdown");
    }

    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    let mut poll = tokio::time::interval(Duration::from_millis(200));
    loop {
        if hub.client_count().await == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("shutdown grace period elapsed with clients still connected, forcing exit");
            break;
        }
        poll.tick().await;
    }

    info!("shutdown complete");
    std::process::exit(0);
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            unreachable!()
        },
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
            unreachable!()
        },
    };

    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
