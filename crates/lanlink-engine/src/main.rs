//! LanLink engine daemon entry point.
//!
//! Wires configuration, persistent identity, and the engine together on
//! the Tokio runtime, then runs until interrupted.
//!
//! ```text
//! main()
//!  └─ config::load_config()   -- TOML from the platform config dir
//!  └─ Engine::new()           -- identity key, trust table, registries
//!  └─ engine.start()          -- discovery + listener + orchestrator
//!  └─ ctrl-c                  -- engine.stop(): links close, tasks join
//! ```

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lanlink_engine::application::events::EngineEvent;
use lanlink_engine::config;
use lanlink_engine::engine::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_config()?;

    // Level from config, overridden by RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.device.log_level.clone())),
        )
        .init();

    info!("LanLink engine starting");

    let mut engine = Engine::new(config)?;
    let mut events = engine.subscribe();
    engine.start().await?;

    info!(
        "device {} ({}) ready on {:?}",
        engine.our_info().device_name,
        engine.our_info().device_id,
        engine.control_addr(),
    );

    // Surface engine events in the log until a UI shell takes this seam.
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::DeviceStateChanged {
                    device_id,
                    state,
                    reason,
                }) => info!("device {device_id} is now {state:?} (reason: {reason:?})"),
                Ok(EngineEvent::PairingRequested { device_id }) => {
                    info!("device {device_id} requests pairing")
                }
                Ok(EngineEvent::TrustViolation { device_id }) => {
                    error!("trust violation from device {device_id}")
                }
                Ok(EngineEvent::PacketReceived { device_id, packet }) => {
                    info!("packet {} from {device_id}", packet.packet_type)
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    info!("event log lagged, missed {missed} events")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    engine.stop().await;
    event_task.abort();

    info!("LanLink engine stopped");
    Ok(())
}
