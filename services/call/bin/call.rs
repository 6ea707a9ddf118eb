//! Main Entrypoint for the Voice Call Client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Building the call controller on the system audio devices.
//! 4. Starting the call and reporting its progress.
//! 5. Ending the call on `Ctrl+C` or when the agent hangs up.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use voice_call_core::AgentProfile;
use voice_call_service::{
    config::Config, controller::CallController, device::CpalBackend, transport::WsConnector,
};

/// Talk to a remote voice agent from the terminal.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Identifier of the agent to call.
    #[arg(long, env = "AGENT_ID")]
    agent_id: String,

    /// The agent's opening line, shared with the agent before you speak.
    #[arg(long, env = "AGENT_GREETING", default_value = "")]
    greeting: String,
}

/// Resolves once `Ctrl+C` is received.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Ending call...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;
    let args = Args::parse();

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(
        agent_id = %args.agent_id,
        url = %config.call_url(&args.agent_id),
        playback_rate = config.playback_sample_rate,
        capture_rate = config.capture_sample_rate,
        "Configuration loaded."
    );

    // --- 3. Build the Controller ---
    let profile = AgentProfile {
        agent_id: args.agent_id,
        greeting_message: args.greeting,
    };
    let controller = CallController::new(
        config,
        profile,
        Arc::new(WsConnector),
        Arc::new(CpalBackend),
    );
    let (handle, task) = controller.spawn();
    let mut snapshots = handle.subscribe();

    // --- 4. Start the Call ---
    if let Err(e) = handle.start_call().await {
        error!(error = %e, "{}", e.user_message());
        drop(handle);
        task.await.context("Call controller panicked")?;
        return Err(e).context("Failed to start call");
    }

    // --- 5. Report Progress Until the Call Ends ---
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                handle.end_call().await;
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                info!(
                    status = snapshot.status_text(),
                    duration = %snapshot.duration_text(),
                    heard = %snapshot.transcript.partial_user,
                    agent = %snapshot.transcript.last_agent_utterance,
                    "Call update"
                );
                if let Some(message) = &snapshot.error {
                    warn!(%message, "Call error");
                }
                if !snapshot.is_call_active {
                    info!("Call is over.");
                    break;
                }
            }
        }
    }

    drop(handle);
    task.await.context("Call controller panicked")?;
    info!("Call client has shut down.");
    Ok(())
}
