mod config;
mod hub;
mod logging;
mod registry;
mod ws;

use hub::Hub;
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = config::load_config();
    logging::init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let hub = Arc::new(Hub::new(config.clone()));
    hub.clone().start_stale_reaper();

    let app = ws::router(hub);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(event = "hub_start", addr = %addr, debug = config.debug);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "hub_error", error = %err);
    }
}
