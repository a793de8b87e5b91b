//! Router daemon binary.
//!
//! Exit codes: 0 on a clean stop, 1 for configuration errors, 2 for fatal
//! I/O at startup.

use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use veil_core::config::RouterOptions;
use veil_daemon::{Router, RouterError};

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,veil=debug"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn load_options() -> Result<RouterOptions, RouterError> {
    // the configuration frontend is external; the daemon accepts its typed
    // record as JSON on the command line or falls back to defaults
    match std::env::args().nth(1) {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| RouterError::Config(format!("{path}: {e}")))?;
            serde_json::from_str(&content).map_err(|e| RouterError::Config(format!("{path}: {e}")))
        }
        None => Ok(RouterOptions::default()),
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    let options = match load_options() {
        Ok(options) => options,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    let router = match Router::new(options) {
        Ok(router) => Arc::new(router),
        Err(RouterError::Config(e)) => {
            tracing::error!("Configuration error: {e}");
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Startup failed: {e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = router.start().await {
        tracing::error!("Startup failed: {e}");
        std::process::exit(match e {
            RouterError::Config(_) => 1,
            _ => 2,
        });
    }

    tokio::signal::ctrl_c().await.expect("signal handler");
    tracing::info!("Received shutdown signal");
    router.stop().await;
}
