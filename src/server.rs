use std::net::SocketAddr;

use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::enumerator::DeviceEnumerator;
use crate::flex::FlexHandle;
use crate::mockdev::{self, MockDeviceRegistry};
use crate::rfid::{self, RfidHandle};
use crate::senso::SensoHandle;
use crate::websocket::{ws_handler, WsHub};

/// Metadata served at the root route.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DriverInfo {
    message: &'static str,
    version: &'static str,
    machine_id: String,
    os: &'static str,
    arch: &'static str,
}

async fn driver_info() -> Json<DriverInfo> {
    Json(DriverInfo {
        message: "Senso hardware bridge",
        version: env!("CARGO_PKG_VERSION"),
        machine_id: machine_id(),
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
    })
}

fn machine_id() -> String {
    std::fs::read_to_string("/etc/machine-id")
        .map(|id| id.trim().to_string())
        .unwrap_or_default()
}

/// Resident set size in KiB, where the platform exposes it.
fn resident_memory_kib() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4)
}

async fn monitor_loop() {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match resident_memory_kib() {
            Some(kib) => info!(resident_kib = kib, "Monitoring runtime"),
            None => info!("Monitoring runtime"),
        }
    }
}

async fn run(config: Config, port: Option<u16>, allocated_port: Option<oneshot::Sender<u16>>) {
    // Root scope of all sessions. Each session gets a child scope and owns
    // its broker; ending the root scope shuts everything down.
    let root = CancellationToken::new();

    let mocks = MockDeviceRegistry::new();
    let enumerator = DeviceEnumerator::new(config.test_mode, mocks.clone());

    let flex = FlexHandle::new(root.child_token(), enumerator);
    let senso = SensoHandle::new(root.child_token());
    let rfid = RfidHandle::new(root.child_token());

    tokio::spawn(monitor_loop());

    let flex_hub = WsHub::new(flex.clone(), flex.broker());
    let senso_hub = WsHub::new(senso.clone(), senso.broker());

    let mut app = Router::new()
        .route("/", get(driver_info))
        .route("/flex", get(ws_handler::<FlexHandle>))
        .route("/senso", get(ws_handler::<SensoHandle>))
        .route("/rfid", get(rfid::ws_handler))
        .route("/rfid/readers", get(rfid::readers))
        .layer(Extension(flex_hub))
        .layer(Extension(senso_hub))
        .layer(Extension(rfid));

    // Mock devices exist for driving tests and replays; the routes never
    // ship in a release build.
    if cfg!(debug_assertions) && config.test_mode {
        info!("Test mode: mounting mock device routes");
        app = app
            .route("/flex/mock/", post(mockdev::register))
            .route("/flex/mock/:id", delete(mockdev::unregister))
            .layer(Extension(mocks));
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], port.unwrap_or(0)));
    let server = axum::Server::bind(&addr).serve(app.into_make_service());
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        port_reply
            .send(addr.port())
            .expect("The receiver of which port was allocated should not be dropped");
    }

    info!("listening on {}", addr);

    server.await.expect("Server should keep running");
    root.cancel();
}

/// Start the gateway on an arbitrary available port.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(config: Config, allocated_port: oneshot::Sender<u16>) {
    run(config, None, Some(allocated_port)).await
}

/// Start the gateway on the configured port.
pub async fn run_configured(config: Config) {
    let port = config.port;
    run(config, Some(port), None).await
}
