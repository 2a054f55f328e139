//! Tether daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;

use tether::config::{Config, Role};
use tether::master::MasterService;
use tether::runtime::DockerRuntime;
use tether::satellite::SatelliteService;
use tether::store::ConfigStore;

enum Service {
    Master(MasterService),
    Satellite(SatelliteService),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting Tether {:?} node", cfg.role);

    let service = match cfg.role {
        Role::Master => Service::Master(MasterService::start(&cfg).await?),
        Role::Satellite => {
            let runtime = DockerRuntime::new(cfg.container_image.clone(), cfg.network_name.clone());
            let store = ConfigStore::from_config(&cfg);
            Service::Satellite(
                SatelliteService::start(&cfg, Arc::new(runtime), Arc::new(store)).await?,
            )
        }
    };

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    match service {
        Service::Master(master) => master.stop().await,
        Service::Satellite(satellite) => satellite.stop().await,
    }

    info!("Shutdown complete.");
    Ok(())
}
