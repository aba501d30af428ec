use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Extension, Router};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::{
    config::Config,
    facade::Facade,
    serial::driver::{PortOpener, SystemOpener},
    serial::manager::SessionManager,
    serial::scanner::Scanner,
    websocket,
};

/// Wire a manager, scanner and facade together from the configuration.
///
/// Separate from [`run`] so the caller can keep a facade handle for shutdown
/// cleanup.
pub fn build(config: Config, opener: Box<dyn PortOpener>) -> Facade {
    config.validate().expect("Configuration must be valid");

    let manager = Arc::new(SessionManager::new(
        opener,
        config.serial.allow_shared_access,
        config.serial.defaults.clone(),
    ));

    let scanner = Arc::new(
        Scanner::new(&config.serial.exclude_patterns, Arc::clone(&manager))
            .expect("Exclude patterns were validated with the configuration"),
    );

    Facade::new(manager, scanner, config)
}

async fn run(
    facade: Facade,
    config: Config,
    port: Option<u16>,
    allocated_port: Option<oneshot::Sender<u16>>,
) {
    // Hotplug visibility; purely informational.
    let _watch = (config.serial.scan_interval_secs > 0).then(|| {
        facade.scanner().watch(
            Duration::from_secs(config.serial.scan_interval_secs),
            Box::new(|added, removed, current| {
                for port in added {
                    info!(name = %port.name, kind = %port.port_type, "Port appeared");
                }
                for port in removed {
                    info!(name = %port.name, "Port disappeared");
                }
                info!("{} port(s) present", current.len());
            }),
        )
    });

    let app = Router::new()
        .route("/ws", get(websocket::ws_handler))
        // Each websocket needs to be able to reach the facade
        .layer(Extension(facade.clone()));

    let addr = match port {
        Some(port) => SocketAddr::from(([0, 0, 0, 0], port)),
        None => config
            .server
            .address
            .parse()
            .expect("Listen address was validated with the configuration"),
    };

    let server =
        axum::Server::bind(&addr).serve(app.into_make_service_with_connect_info::<SocketAddr>());
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        port_reply
            .send(addr.port())
            .expect("The receiver of which port was allocated should not be dropped");
    }

    info!("listening on {}", addr);

    if let Err(e) = server.await {
        error!(%e, "Server stopped");
    }

    facade.close_all();
}

/// Start the server on an arbitrary available port, backed by real hardware.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(config: Config, allocated_port: oneshot::Sender<u16>) {
    let facade = build(config.clone(), Box::new(SystemOpener));
    run(facade, config, Some(0), Some(allocated_port)).await
}

/// Start the server on an arbitrary available port with a custom port
/// backend. This is how tests run a full agent against loopback ports.
pub async fn run_any_port_with(
    config: Config,
    opener: Box<dyn PortOpener>,
    allocated_port: oneshot::Sender<u16>,
) {
    let facade = build(config.clone(), opener);
    run(facade, config, Some(0), Some(allocated_port)).await
}

/// Start the server on the configured address, with an optional port
/// override, using a prebuilt facade.
pub async fn run_with(facade: Facade, config: Config, port: Option<u16>) {
    run(facade, config, port, None).await
}
