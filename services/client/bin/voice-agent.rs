//! Main Entrypoint for the Voice Agent Client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Starting one voice session on the default microphone and speaker.
//! 3. Printing transcripts and state changes as they arrive.
//! 4. Stopping the session on `Ctrl+C` or when the agent hangs up.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use voice_agent_client::{
    SessionEvent, VoiceAgent,
    audio::CpalDevices,
    config::ClientConfig,
    config_source::{ConfigRequest, HttpConfigSource},
    socket::WsConnector,
};
use voice_agent_core::{Termination, protocol::Role};

#[derive(Parser, Debug)]
#[command(version, about = "Talk to a voice agent from the terminal")]
struct Args {
    /// Project whose agent configuration is used.
    #[arg(long)]
    project: String,
    #[arg(long)]
    visitor: Option<String>,
    #[arg(long)]
    session: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let config = ClientConfig::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(agent_url = %config.agent_url, "Configuration loaded. Starting voice session...");

    // --- 3. Start Session ---
    let agent = VoiceAgent::new(
        config.agent_url.clone(),
        config.timings.clone(),
        Arc::new(HttpConfigSource::new(config.config_url.clone())),
        Arc::new(WsConnector::default()),
        Arc::new(CpalDevices::default()),
    );
    let request = ConfigRequest {
        project_id: args.project,
        visitor_id: args.visitor,
        session_id: args.session,
    };
    let mut handle = agent
        .start(request)
        .context("Failed to start voice session")?;
    let mut events = handle
        .take_events()
        .context("Session event stream already taken")?;

    // --- 4. Run Until Hang-Up or Ctrl+C ---
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::StateChanged(state)) => info!(%state, "Session state"),
                Some(SessionEvent::Transcript { role, text }) => {
                    let speaker = match role {
                        Role::User => "you",
                        Role::Assistant => "agent",
                    };
                    println!("{speaker}: {text}");
                }
                Some(SessionEvent::Terminated(Termination::Ended)) | None => {
                    info!("Session ended.");
                    break;
                }
                Some(SessionEvent::Terminated(Termination::Error(e))) => {
                    error!(error = %e, class = ?e.class(), "Session failed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal. Stopping session...");
                break;
            }
        }
    }

    handle.stop().await;
    info!("Voice agent has shut down.");
    Ok(())
}
