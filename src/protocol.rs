//! The JSON protocol spoken over the device websockets.
//!
//! Clients send [`Command`]s as text frames; the server answers with
//! [`Message`]s, either directly (in response to a command) or wrapped in a
//! [`Broadcast`] when addressed to every subscriber of a session.
//! Binary frames are not part of this module: they carry raw device frames
//! produced by the framers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// A command sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    /// Ask for the session's current [`Message::Status`].
    GetStatus,

    /// Connect to the device at the given address.
    ///
    /// An IP for Senso, a serial port path for Flex.
    Connect {
        /// Where the device lives.
        address: String,
    },

    /// Drop the current device connection.
    Disconnect,

    /// Browse for devices for the given number of seconds.
    Discover {
        /// How long to browse.
        duration: u64,
    },

    /// Flash a firmware image onto the device with the given serial.
    UpdateFirmware {
        /// Serial number of the target device.
        #[serde(rename = "serialNumber")]
        serial_number: String,

        /// Base64-encoded firmware image.
        image: String,
    },
}

/// A message sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// The session's connection state.
    Status {
        /// Address of the connected device, `None` while disconnected.
        address: Option<String>,

        /// Details of the connected device, `None` while disconnected.
        device: Option<DeviceInfo>,
    },

    /// A device seen while discovering.
    Discovered {
        /// The raw mDNS entry. Senso only, kept for older clients.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<ServiceEntry>,

        /// All addresses of the entry. Senso only, kept for older clients.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<Vec<IpAddr>>,

        /// The discovered device.
        device: DeviceInfo,
    },

    /// A firmware update made progress.
    FirmwareUpdateProgress {
        /// Human-readable progress description.
        message: String,
    },

    /// A firmware update completed.
    FirmwareUpdateSuccess {
        /// Human-readable completion message.
        message: String,
    },

    /// A firmware update failed.
    FirmwareUpdateFailure {
        /// What went wrong.
        message: String,
    },
}

impl Message {
    /// A disconnected status.
    pub fn disconnected() -> Self {
        Self::Status {
            address: None,
            device: None,
        }
    }

    /// A status reporting a connected device.
    pub fn connected(address: String, device: DeviceInfo) -> Self {
        Self::Status {
            address: Some(address),
            device: Some(device),
        }
    }

    /// A discovery result. Senso entries carry the service and its
    /// addresses alongside the device for backwards compatibility.
    pub fn discovered(device: DeviceInfo) -> Self {
        let (service, ip) = match &device {
            DeviceInfo::Senso { tcp_device } => {
                (Some(tcp_device.clone()), Some(tcp_device.addresses()))
            }
            DeviceInfo::Flex { .. } => (None, None),
        };

        Self::Discovered {
            service,
            ip,
            device,
        }
    }
}

/// A [`Message`] addressed to every subscriber of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "Broadcast")]
pub struct Broadcast {
    /// The wrapped message.
    pub message: Message,
}

/// What kind of device a [`Message`] refers to, and how to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "deviceType", rename_all = "lowercase")]
pub enum DeviceInfo {
    /// A Flex mat, attached over USB CDC serial.
    Flex {
        /// The USB device details.
        #[serde(rename = "usbDevice")]
        usb_device: UsbDeviceInfo,
    },

    /// A Senso, reachable over TCP.
    Senso {
        /// The mDNS entry the device was discovered through.
        #[serde(rename = "tcpDevice")]
        tcp_device: ServiceEntry,
    },
}

/// USB-level details of an attached serial device.
///
/// Immutable after construction; classification (see the enumerator) is a
/// pure function of this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceInfo {
    /// Platform device locator, e.g. `/dev/ttyACM0`.
    pub path: String,

    /// USB vendor id.
    pub id_vendor: u16,

    /// USB product id.
    pub id_product: u16,

    /// BCD-encoded device release number.
    pub bcd_device: u16,

    /// Serial number, may be empty.
    pub serial_number: String,

    /// Manufacturer string, may be empty.
    pub manufacturer: String,

    /// Product string, may be empty.
    pub product: String,
}

/// An mDNS service entry for a Senso.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Instance name of the service.
    pub name: String,

    /// Hostname the service resolves to.
    pub hostname: String,

    /// Port of the control service.
    pub port: u16,

    /// Raw `key=value` TXT records.
    pub text: Vec<String>,

    /// Resolved IPv4 addresses.
    #[serde(rename = "addrIPv4")]
    pub addr_ipv4: Vec<Ipv4Addr>,

    /// Resolved IPv6 addresses.
    #[serde(rename = "addrIPv6")]
    pub addr_ipv6: Vec<Ipv6Addr>,
}

impl ServiceEntry {
    /// The device serial announced in the TXT records, if any.
    pub fn serial(&self) -> Option<&str> {
        self.text
            .iter()
            .find_map(|record| record.strip_prefix("ser_no="))
    }

    /// All addresses, IPv4 first.
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.addr_ipv4
            .iter()
            .copied()
            .map(IpAddr::V4)
            .chain(self.addr_ipv6.iter().copied().map(IpAddr::V6))
            .collect()
    }
}
