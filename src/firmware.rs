//! Firmware update arbitration and transmission.
//!
//! At most one update runs per session; [`UpdateState`] is the flag the
//! websocket hub consults to suppress device commands while an update is in
//! flight. Transmission itself is deliberately simple: resolve the target,
//! open its control port, stream the image. There is no retry; a failed
//! flash is reported and left to the operator.

use std::path::Path;
use std::sync::{Arc, Mutex};

use base64::Engine;
use itertools::Itertools;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::error::Error;
use crate::protocol::ServiceEntry;
use crate::senso;

/// How long discovery runs when resolving an update target.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

const CHUNK_SIZE: usize = 4096;

const TRY_POWER_CYCLING: &str =
    "Try power-cycling the Senso and waiting for up to two minutes before retrying.";

/// Whether a firmware update is in flight.
///
/// Cloneable; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct UpdateState(Arc<Mutex<bool>>);

/// Clears the update flag when dropped.
pub struct UpdateGuard(Arc<Mutex<bool>>);

impl UpdateState {
    /// Mark an update as started. Returns `None` when one is already
    /// running.
    pub fn try_begin(&self) -> Option<UpdateGuard> {
        let mut updating = self.0.lock().expect("Update flag lock poisoned");
        if *updating {
            return None;
        }
        *updating = true;
        Some(UpdateGuard(Arc::clone(&self.0)))
    }

    /// Whether an update is in flight.
    pub fn is_updating(&self) -> bool {
        *self.0.lock().expect("Update flag lock poisoned")
    }
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        *self.0.lock().expect("Update flag lock poisoned") = false;
    }
}

/// Decode a base64-encoded firmware image.
pub fn decode_image(image: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(image)
}

async fn report(progress: &mpsc::Sender<String>, message: impl Into<String>) {
    let _ = progress.send(message.into()).await;
}

/// Update the Senso with the given serial number.
pub async fn update_by_serial(
    serial: &str,
    image: &[u8],
    progress: &mpsc::Sender<String>,
) -> Result<(), Error> {
    report(progress, format!("Looking for Senso {serial}")).await;

    let target = find_service(|entry| entry.serial() == Some(serial))
        .await
        .ok_or_else(|| {
            Error::Firmware(format!(
                "Failed to find Senso with serial {serial}. {TRY_POWER_CYCLING}"
            ))
        })?;

    transmit(&target, image, progress).await
}

/// Update the Senso reachable at the given address.
pub async fn update_by_address(
    address: &str,
    image: &[u8],
    progress: &mpsc::Sender<String>,
) -> Result<(), Error> {
    report(progress, format!("Using specified address {address}")).await;

    let target = find_service(|entry| {
        entry
            .addresses()
            .iter()
            .any(|candidate| candidate.to_string() == address)
    })
    .await
    .ok_or_else(|| {
        Error::Firmware(format!(
            "Failed to find Senso with address {address}. {TRY_POWER_CYCLING}"
        ))
    })?;

    transmit(&target, image, progress).await
}

/// Discover the single reachable Senso and update it.
///
/// Refuses to guess when several are found.
pub async fn update_by_discovery(
    image: &[u8],
    progress: &mpsc::Sender<String>,
) -> Result<(), Error> {
    report(progress, "Discovering Sensos").await;

    let mut services = senso::browse_services(DISCOVERY_TIMEOUT);
    let mut found: Vec<ServiceEntry> = Vec::new();
    while let Some(entry) = services.recv().await {
        found.push(entry);
    }
    // The same device may resolve several times during the browse window.
    let found: Vec<ServiceEntry> = found
        .into_iter()
        .unique_by(|entry| entry.name.clone())
        .collect();

    match found.as_slice() {
        [target] => {
            report(
                progress,
                format!(
                    "Discovered Senso: {} ({})",
                    target.serial().unwrap_or("unknown serial"),
                    target.hostname
                ),
            )
            .await;
            transmit(target, image, progress).await
        }
        [] => Err(Error::Firmware(format!(
            "Could not find any Sensos. {TRY_POWER_CYCLING}"
        ))),
        many => Err(Error::Firmware(format!(
            "Discovered {} Sensos, please specify a serial or address",
            many.len()
        ))),
    }
}

async fn find_service(matches: impl Fn(&ServiceEntry) -> bool) -> Option<ServiceEntry> {
    let mut services = senso::browse_services(DISCOVERY_TIMEOUT);
    while let Some(entry) = services.recv().await {
        if matches(&entry) {
            return Some(entry);
        }
    }
    None
}

/// Stream the image to the target's control port.
async fn transmit(
    target: &ServiceEntry,
    image: &[u8],
    progress: &mpsc::Sender<String>,
) -> Result<(), Error> {
    let address = target
        .addresses()
        .first()
        .map(|address| address.to_string())
        .unwrap_or_else(|| target.hostname.trim_end_matches('.').to_string());

    info!(%address, bytes = image.len(), "Transmitting firmware image");
    report(progress, format!("Connecting to {address}")).await;

    let mut stream = TcpStream::connect((address.as_str(), senso::CONTROL_PORT))
        .await
        .map_err(|e| Error::Firmware(format!("Could not connect to {address}: {e}")))?;

    let mut sent = 0usize;
    let mut last_reported_decile = 0;
    for chunk in image.chunks(CHUNK_SIZE) {
        stream
            .write_all(chunk)
            .await
            .map_err(|e| Error::Firmware(format!("Transmission failed after {sent} bytes: {e}")))?;
        sent += chunk.len();

        let decile = sent * 10 / image.len().max(1);
        if decile > last_reported_decile {
            last_reported_decile = decile;
            report(progress, format!("Transmitted {}%", decile * 10)).await;
        }
    }

    stream
        .shutdown()
        .await
        .map_err(|e| Error::Firmware(format!("Could not finish transmission: {e}")))?;

    Ok(())
}

/// Run the `firmware update` command-line flow: progress to stdout,
/// `Ok` only when the image was fully transmitted.
pub async fn run_update(
    image_path: &Path,
    address: Option<String>,
    serial: Option<String>,
) -> Result<(), Error> {
    let image = std::fs::read(image_path)?;

    let (progress_tx, mut progress_rx) = mpsc::channel::<String>(8);
    let printer = tokio::spawn(async move {
        while let Some(message) = progress_rx.recv().await {
            println!("{message}");
        }
    });

    let outcome = if let Some(serial) = serial {
        update_by_serial(&serial, &image, &progress_tx).await
    } else if let Some(address) = address {
        update_by_address(&address, &image, &progress_tx).await
    } else {
        update_by_discovery(&image, &progress_tx).await
    };

    drop(progress_tx);
    let _ = printer.await;

    if let Err(e) = &outcome {
        warn!(error = %e, "Firmware update failed");
    }
    outcome
}
