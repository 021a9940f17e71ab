mod apdu;
mod config;
mod error;
mod geometry;
mod monitor;
mod ndef;
mod nfc_service;
mod pages;
mod reader;
mod server;
mod session;
mod simulation;
mod types;

use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;

use crate::config::Config;
use crate::monitor::PcscMonitor;
use crate::nfc_service::NfcService;
use crate::session::HardwareCapability;

#[tokio::main]
async fn main() {
    env_logger::init();
    let config = Config::parse();
    info!("Starting NFC service ({} tags)...", config.tag_family);

    // PC/SC is checked once; without it the process stays simulated
    let monitor = if config.simulate {
        info!("Simulation forced by configuration");
        None
    } else {
        match PcscMonitor::establish(config.poll_interval()) {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    };
    let capability = HardwareCapability {
        available: monitor.is_some(),
    };

    let service = Arc::new(NfcService::new(&config, capability));

    if let Some(monitor) = monitor {
        match service.spawn_event_loop() {
            // The monitor blocks on PC/SC, keep it on its own OS thread
            Ok(events) => {
                let spawned = std::thread::Builder::new()
                    .name("pcsc-monitor".into())
                    .spawn(move || monitor.run(events));
                if let Err(e) = spawned {
                    error!("Failed to start PC/SC monitor: {}", e);
                }
            }
            Err(e) => error!("{}", e),
        }
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };
    if let Err(e) = server::start_server(service.clone(), config.bind, shutdown).await {
        error!("{}", e);
    }
    service.shutdown();
}
