use thiserror::Error;

/// Any error this library might surface.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying IO problem.
    #[error("IO problem")]
    Io(#[from] std::io::Error),

    /// A serial port could not be opened.
    #[error("Could not open serial port at {path}: {source}")]
    PortOpen {
        /// The port that was attempted.
        path: String,

        /// What the serial layer reported.
        source: tokio_serial::Error,
    },

    /// A registered device carried a field that is not 16-bit hex.
    #[error("`{0}` is not a fixed-length 16-bit hex value")]
    InvalidHex(String),

    /// No device with the requested address is attached.
    #[error("No matching device at `{0}`")]
    NoSuchDevice(String),

    /// A firmware image was not valid base64.
    #[error("Could not decode firmware image")]
    ImageDecode(#[from] base64::DecodeError),

    /// A firmware update could not be carried out.
    #[error("Firmware update failed: {0}")]
    Firmware(String),

    /// A recording file did not follow the expected format.
    #[error("Malformed recording: {0}")]
    Recording(String),
}
