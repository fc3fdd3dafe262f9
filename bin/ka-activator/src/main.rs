//! Key Activator
//!
//! Runs one activation for a storefront session on behalf of a host that owns the
//! embedded browser. Browser commands and state updates go to stdout, page messages
//! and command replies come back on stdin (see [`bridge`]). Logs go to stderr.

mod bridge;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use ka_activation::{HttpBackendClient, Orchestrator};
use ka_config::{AppConfig, ConfigLoader};

use bridge::{HostEvent, StdioBridge};

#[derive(Parser, Debug)]
#[command(name = "ka-activator")]
#[command(about = "Activate the license keys behind a storefront session")]
struct Args {
    /// Opaque session token issued by the storefront
    session_token: String,

    /// Config file (otherwise KEYACTIVATION_CONFIG or the standard locations)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device identity the identity token cache is keyed by
    #[arg(long)]
    device_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    ka_common::logging::init_logging("ka-activator");

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ConfigLoader::with_path(path).load(),
        None => AppConfig::load(),
    }
    .context("failed to load configuration")?;
    if let Some(device_id) = args.device_id {
        config.device_id = device_id;
    }
    info!(
        backend = %config.backend.base_url,
        vendor = %config.vendor.base_url,
        regions = config.regions.len(),
        "Configuration loaded"
    );

    let backend = Arc::new(HttpBackendClient::new(&config.backend)?);
    let bridge = StdioBridge::spawn();
    // The bridge carries no account facts, so the default probe stays in place and
    // subscription keys skip the conflict and region checks.
    let orchestrator = Arc::new(Orchestrator::new(&config, backend, bridge.clone())?);

    tokio::spawn(bridge.clone().read_stdin(orchestrator.message_bus()));

    let mut states = orchestrator.subscribe();
    let forwarder = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            loop {
                match states.recv().await {
                    Ok(state) => {
                        let done = state.is_terminal();
                        bridge.emit(HostEvent::State { state: &state });
                        if done {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "State updates dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, cancelling activation");
                orchestrator.cancel();
            }
        });
    }

    let outcome = orchestrator.start(&args.session_token).await;
    let _ = forwarder.await;
    bridge.flush().await;

    info!(outcome = outcome.label(), "Activation finished");
    if outcome.is_success() {
        Ok(())
    } else {
        std::process::exit(2);
    }
}
