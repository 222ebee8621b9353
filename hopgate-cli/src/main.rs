//! Runs a single tunnel profile until interrupted: builds the hop chain,
//! starts the health supervisor and local reverse proxy, logs broker
//! events, then tears everything down on Ctrl-C / SIGTERM.
//!
//! Startup phases mirror `servers/src/restream.rs`'s numbered-phase
//! `main`, trimmed to what this binary actually needs: load env, parse
//! CLI args, load the profile, start the session, wait for a shutdown
//! signal.

mod logging;
mod profile_loader;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use hopgate_core::{Event, ProfileSession, RusshConnector};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hopgate", about = "Tunnel HTTP services through a chain of SSH bastion hops.")]
struct Args {
    /// Path to a TOML tunnel profile.
    profile: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    logging::init();

    let args = Args::parse();
    let profile = profile_loader::load_profile(&args.profile).await?;
    info!(profile = %profile.name, "loaded profile");

    let connector = Arc::new(RusshConnector::new());
    let session = Arc::new(ProfileSession::new(profile, connector)?);

    let event_cancel = CancellationToken::new();
    let Some(mut events) = session.broker().subscribe(event_cancel.clone()).await else {
        anyhow::bail!("broker rejected subscription during startup");
    };
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(event);
        }
    });

    session.start().await?;
    info!("session started; serving until interrupted");

    // `Shutdown::default()` installs its own Ctrl-C/SIGTERM listener; the
    // guard's `cancelled()` future resolves once either fires, the same
    // wait-point `servers/src/server_speak.rs`'s `tokio_main` selects on.
    let shutdown = tokio_graceful::Shutdown::default();
    shutdown.guard().cancelled().await;
    info!("shutdown signal received, tearing down");

    session.stop().await;
    event_cancel.cancel();

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => info!("shutdown completed in {:.1}s", elapsed.as_secs_f64()),
        Err(_) => warn!("shutdown did not complete within the grace period"),
    }

    Ok(())
}

fn log_event(event: Event) {
    match event {
        Event::Status(status) => {
            if status.error.is_some() {
                warn!(profile = %status.profile, hop = ?status.hop_index, state = %status.state, error = ?status.error, "status");
            } else {
                info!(profile = %status.profile, hop = ?status.hop_index, state = %status.state, "status");
            }
        }
        Event::ProxyLog(log) => {
            if log.is_update {
                info!(
                    request_id = log.request_id,
                    method = %log.method,
                    url = %log.url,
                    status = log.status_code,
                    bytes = log.response_size,
                    "request completed"
                );
            }
        }
    }
}

