#![deny(missing_docs)]

//! A local hardware bridge exposing sensor devices to browser clients.
//!
//! Senso mats (TCP), Flex pressure mats (USB CDC serial) and RFID readers
//! (PC/SC) are each served on a localhost WebSocket endpoint speaking a
//! small JSON command protocol plus binary sample frames. Every device
//! session fans its data out through a bounded publish/subscribe broker, so
//! a slow client can never stall a device reader.

/// The publish/subscribe hub device sessions fan out through.
pub mod broker;

/// The command line interface.
pub mod cli;

/// Runtime configuration assembled from the command line.
pub mod config;

/// Lists serial devices and classifies them into device families.
pub mod enumerator;

/// Possible errors in this library.
pub mod error;

/// Firmware update arbitration and transmission.
pub mod firmware;

/// The Flex session: serial port handling, framers, auto-connect.
pub mod flex;

/// Logging/tracing setup.
pub mod logging;

/// Registry of synthetic serial devices for tests and replays.
pub mod mockdev;

/// The JSON wire protocol spoken over the device websockets.
pub mod protocol;

/// The raw-capture recording format and its replayer.
pub mod recording;

/// The RFID token endpoint.
pub mod rfid;

/// The Senso session: dual TCP channels, liveness, discovery.
pub mod senso;

/// Code relating to setting up the HTTP gateway.
pub mod server;

/// Topic names and payload types shared by device sessions.
pub mod session;

/// Handles incoming websockets.
pub mod websocket;
