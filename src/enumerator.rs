//! Lists candidate serial devices and sorts them into device families.
//!
//! Classification is a pure function of [`UsbDeviceInfo`]; the only inputs
//! are the platform's serial port list and the mock registry. In test mode
//! the platform list is ignored entirely so tests behave the same whether or
//! not real hardware is plugged in.

use serialport::SerialPortType;
use tracing::{debug, warn};

use crate::error::Error;
use crate::mockdev::{MockDeviceRegistry, PortDetails};
use crate::protocol::UsbDeviceInfo;

/// Vendor id shared by all supported controllers
/// (Van Ooijen Technische Informatica, used by Teensy boards).
pub const SUPPORTED_VENDOR: u16 = 0x16C0;

/// Product prefix marking a transparent replay device.
pub const PASSTHRU_PREFIX: &str = "PASSTHRU";

/// The family of a matched device, deciding which framer handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    /// Transparent chunk passthrough, used for replays and raw capture.
    Passthru,

    /// SensingTex pressure mat controller.
    SensingTex,

    /// Sensitronics pressure mat controller.
    Sensitronics,
}

/// A device that classified into a family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedDevice {
    /// Which framer to use.
    pub family: DeviceFamily,

    /// The underlying USB device.
    pub info: UsbDeviceInfo,
}

/// Classify a device, or reject it with `None`.
///
/// First match wins: the vendor gate applies to everything, the passthru
/// product prefix beats manufacturer matching so mock devices can
/// impersonate other families in replays.
pub fn classify(info: &UsbDeviceInfo) -> Option<DeviceFamily> {
    if info.id_vendor != SUPPORTED_VENDOR {
        return None;
    }

    if info.product.starts_with(PASSTHRU_PREFIX) {
        return Some(DeviceFamily::Passthru);
    }

    match info.manufacturer.as_str() {
        "Teensyduino" => Some(DeviceFamily::SensingTex),
        "Sensitronics" | "Dividat" => Some(DeviceFamily::Sensitronics),
        _ => None,
    }
}

/// Strip the passthru marker from a product name.
///
/// Reported statuses and discoveries use the concealed name, which lets a
/// replayed recording present itself as the device it was captured from.
pub fn conceal_passthru(info: &UsbDeviceInfo) -> UsbDeviceInfo {
    let mut info = info.clone();
    if let Some(rest) = info.product.strip_prefix("PASSTHRU-") {
        info.product = rest.to_string();
    }
    info
}

fn parse_hex16(field: &str) -> Result<u16, Error> {
    if field.len() != 4 {
        return Err(Error::InvalidHex(field.to_string()));
    }
    u16::from_str_radix(field, 16).map_err(|_| Error::InvalidHex(field.to_string()))
}

/// Decode raw port details into a [`UsbDeviceInfo`].
///
/// Vendor, product and bcd fields must be fixed-length 4-character hex.
pub fn decode_port_details(details: &PortDetails) -> Result<UsbDeviceInfo, Error> {
    Ok(UsbDeviceInfo {
        path: details.name.clone(),
        id_vendor: parse_hex16(&details.vid)?,
        id_product: parse_hex16(&details.pid)?,
        bcd_device: parse_hex16(&details.bcd_device)?,
        serial_number: details.serial_number.clone(),
        manufacturer: details.manufacturer.clone(),
        product: details.product.clone(),
    })
}

/// Produces the ordered list of devices a Flex session may connect to.
#[derive(Debug, Clone)]
pub struct DeviceEnumerator {
    test_mode: bool,
    mocks: MockDeviceRegistry,
}

impl DeviceEnumerator {
    /// A new enumerator. In test mode only mock devices are reported.
    pub fn new(test_mode: bool, mocks: MockDeviceRegistry) -> Self {
        if test_mode {
            debug!("Enumerating in test mode, reporting mock devices only");
        }
        Self { test_mode, mocks }
    }

    /// The registered mock devices.
    pub fn mock_registry(&self) -> &MockDeviceRegistry {
        &self.mocks
    }

    fn port_list(&self) -> Vec<PortDetails> {
        // Run platform enumeration even in test mode as a cheap check that
        // it works at all.
        let platform_ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                warn!(error = %e, "Could not list serial ports");
                Vec::new()
            }
        };

        if self.test_mode {
            return self.mocks.list();
        }

        let mut details: Vec<PortDetails> = platform_ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => Some(PortDetails {
                    name: port.port_name,
                    vid: format!("{:04X}", usb.vid),
                    pid: format!("{:04X}", usb.pid),
                    // The platform enumerator does not report the device
                    // release number.
                    bcd_device: "0000".into(),
                    serial_number: usb.serial_number.unwrap_or_default(),
                    manufacturer: usb.manufacturer.unwrap_or_default(),
                    product: usb.product.unwrap_or_default(),
                }),
                _ => None,
            })
            .collect();

        details.extend(self.mocks.list());
        details
    }

    /// Scan once, returning every device that classifies, in scan order.
    pub fn matching_devices(&self) -> Vec<MatchedDevice> {
        let mut matching = Vec::new();

        for details in self.port_list() {
            debug!(name = %details.name, vid = %details.vid, "Considering serial port");

            let info = match decode_port_details(&details) {
                Ok(info) => info,
                Err(e) => {
                    // A registered device with bad hex is a bug in the
                    // registering side; skip it.
                    warn!(name = %details.name, error = %e, "Skipping device with undecodable details");
                    continue;
                }
            };

            if let Some(family) = classify(&info) {
                debug!(name = %info.path, ?family, "Serial port matches");
                matching.push(MatchedDevice { family, info });
            }
        }

        matching
    }

    /// Find a matched device by its path.
    pub fn device_at(&self, address: &str) -> Option<MatchedDevice> {
        self.matching_devices()
            .into_iter()
            .find(|device| device.info.path == address)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn info(vendor: u16, manufacturer: &str, product: &str) -> UsbDeviceInfo {
        UsbDeviceInfo {
            path: "/dev/ttyACM0".into(),
            id_vendor: vendor,
            id_product: 0x0486,
            bcd_device: 0x0277,
            serial_number: "1".into(),
            manufacturer: manufacturer.into(),
            product: product.into(),
        }
    }

    #[test]
    fn wrong_vendor_is_rejected() {
        assert_eq!(classify(&info(0x14F2, "Teensyduino", "USB Serial")), None);
    }

    #[test]
    fn passthru_prefix_wins_over_manufacturer() {
        assert_eq!(
            classify(&info(0x16C0, "Teensyduino", "PASSTHRU-Dividat16x16")),
            Some(DeviceFamily::Passthru)
        );
    }

    #[test]
    fn teensyduino_is_sensing_tex() {
        assert_eq!(
            classify(&info(0x16C0, "Teensyduino", "USB Serial")),
            Some(DeviceFamily::SensingTex)
        );
    }

    #[test]
    fn sensitronics_and_dividat_are_sensitronics() {
        assert_eq!(
            classify(&info(0x16C0, "Sensitronics", "16x16")),
            Some(DeviceFamily::Sensitronics)
        );
        assert_eq!(
            classify(&info(0x16C0, "Dividat", "Dividat16x16")),
            Some(DeviceFamily::Sensitronics)
        );
    }

    #[test]
    fn unknown_manufacturer_is_rejected() {
        assert_eq!(classify(&info(0x16C0, "Acme", "USB Serial")), None);
    }

    #[test]
    fn conceal_strips_the_passthru_marker() {
        let concealed = conceal_passthru(&info(0x16C0, "x", "PASSTHRU-Dividat16x16"));
        assert_eq!(concealed.product, "Dividat16x16");

        // A bare prefix without the dash is left alone.
        let untouched = conceal_passthru(&info(0x16C0, "x", "PASSTHRU"));
        assert_eq!(untouched.product, "PASSTHRU");
    }

    #[test]
    fn hex_decode_is_strict() {
        let details = PortDetails {
            name: "/tmp/vtty_0".into(),
            vid: "16C0".into(),
            pid: "0486".into(),
            bcd_device: "0277".into(),
            serial_number: String::new(),
            manufacturer: String::new(),
            product: String::new(),
        };
        assert!(decode_port_details(&details).is_ok());

        for bad in ["16C", "16C00", "XYZW", ""] {
            let mut details = details.clone();
            details.vid = bad.into();
            assert!(
                decode_port_details(&details).is_err(),
                "`{bad}` should not decode"
            );
        }
    }

    #[test]
    fn test_mode_reports_only_mock_devices() {
        let mocks = MockDeviceRegistry::new();
        mocks.register(PortDetails {
            name: "/tmp/vtty_0".into(),
            vid: "16C0".into(),
            pid: "0486".into(),
            bcd_device: "0277".into(),
            serial_number: "77".into(),
            manufacturer: "Teensyduino".into(),
            product: "USB Serial".into(),
        });
        mocks.register(PortDetails {
            name: "/tmp/vtty_1".into(),
            vid: "14F2".into(),
            pid: "0001".into(),
            bcd_device: "0000".into(),
            serial_number: String::new(),
            manufacturer: "Acme".into(),
            product: "Other".into(),
        });

        let enumerator = DeviceEnumerator::new(true, mocks);
        let matching = enumerator.matching_devices();

        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].family, DeviceFamily::SensingTex);
        assert_eq!(matching[0].info.serial_number, "77");

        assert!(enumerator.device_at("/tmp/vtty_0").is_some());
        assert!(enumerator.device_at("/tmp/vtty_1").is_none());
    }
}
