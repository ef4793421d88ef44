//! Registry for synthetic serial devices.
//!
//! End-to-end tests and replays register devices here over HTTP; the
//! enumerator folds them into its scan results. Nothing is persisted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::Path;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Identifies a registered mock device.
pub type MockDeviceId = u32;

/// Raw port details as registered by a client or produced by platform
/// enumeration. Vendor, product and bcd values are 4-character hex strings
/// without prefix; decoding happens in the enumerator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDetails {
    /// Device locator, e.g. `/tmp/vtty_0`.
    pub name: String,

    /// Vendor id as hex.
    pub vid: String,

    /// Product id as hex.
    pub pid: String,

    /// Device release as hex.
    #[serde(default)]
    pub bcd_device: String,

    /// Serial number.
    #[serde(default)]
    pub serial_number: String,

    /// Manufacturer string.
    #[serde(default)]
    pub manufacturer: String,

    /// Product string.
    #[serde(default)]
    pub product: String,
}

/// Shared handle to the registered mock devices.
#[derive(Debug, Clone, Default)]
pub struct MockDeviceRegistry {
    devices: Arc<Mutex<HashMap<MockDeviceId, PortDetails>>>,
}

impl MockDeviceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device, returning its id.
    pub fn register(&self, details: PortDetails) -> MockDeviceId {
        let mut devices = self.devices.lock().expect("Registry lock poisoned");

        let id = devices.keys().max().map_or(0, |max| max + 1);
        info!(id, name = %details.name, "Registering mock device");
        devices.insert(id, details);

        id
    }

    /// Remove a device. Returns whether it existed.
    pub fn unregister(&self, id: MockDeviceId) -> bool {
        let mut devices = self.devices.lock().expect("Registry lock poisoned");
        debug!(id, "Unregistering mock device");
        devices.remove(&id).is_some()
    }

    /// Snapshot of all registered devices.
    pub fn list(&self) -> Vec<PortDetails> {
        self.devices
            .lock()
            .expect("Registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Registered {
    id: MockDeviceId,
}

pub(crate) async fn register(
    Extension(registry): Extension<MockDeviceRegistry>,
    Json(details): Json<PortDetails>,
) -> Json<Registered> {
    Json(Registered {
        id: registry.register(details),
    })
}

pub(crate) async fn unregister(
    Extension(registry): Extension<MockDeviceRegistry>,
    Path(id): Path<MockDeviceId>,
) -> StatusCode {
    if registry.unregister(id) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}
