//! labsync server: shared instrument state, undo history and hardware RPC
//! over WebSocket.
//!
//! ```text
//! labsync-server [config.json]
//! ```
//!
//! Configuration comes from the optional JSON file, then from `LABSYNC_*`
//! environment variables. Log output follows `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::process::ExitCode;

use log::{error, info};

use labsync_collab::{LabConfig, Services, StateServer};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match LabConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match &config.storage.data_dir {
        Some(dir) => info!("Storing state in {}", dir.display()),
        None => info!("No data directory configured, state is kept in memory"),
    }

    let services = Services::from_config(&config).await;
    let scheduler = services.scheduler.clone();
    let server = StateServer::new(config.server.clone(), services);

    info!("Starting labsync server on {}", server.bind_addr());
    let result = server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await;

    // Leave no channel powered
    scheduler.stop().await;

    match result {
        Ok(()) => {
            info!("Stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}
