mod auth;
mod capture;
mod config;
mod coordinator;
mod errors;
mod events;
mod frame;
mod gateway;
mod leader;
mod proxy;
mod registry;
mod session;
mod storage;
mod telemetry;
mod util;
mod ws;

use anyhow::Result;
use auth::DeviceAuthenticator;
use config::AppConfig;
use coordinator::CaptureCoordinator;
use events::EventBus;
use gateway::Gateway;
use leader::SingleProcessLeaderLock;
use registry::{CachedRegistry, DeviceRegistry, StaticRegistry};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_telemetry();

    info!("starting rtsp-tunnel-gateway");

    let config = AppConfig::load();
    info!(?config, "loaded configuration");

    // The registry/certificate backend is an external collaborator (see the
    // crate's design notes); `StaticRegistry` is the in-process reference
    // used until a real lookup-service client is wired in.
    let registry: Arc<dyn DeviceRegistry> = Arc::new(CachedRegistry::new(Arc::new(StaticRegistry::new())));
    let authenticator = Arc::new(DeviceAuthenticator::new(registry.clone()));
    let coordinator = Arc::new(CaptureCoordinator::new());
    let bus = EventBus::new();

    // Likewise the distributed leader lock: `SingleProcessLeaderLock` always
    // wins, which is correct for a single-replica deployment and lets every
    // other component be exercised without a Redlock backend.
    let leader_lock = Arc::new(SingleProcessLeaderLock::new());

    let gateway = Arc::new(Gateway::new(
        config,
        registry,
        authenticator,
        coordinator,
        bus,
        leader_lock,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let run_handle = tokio::spawn(gateway.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());
    let _ = run_handle.await;

    info!("shutdown complete");
    Ok(())
}
