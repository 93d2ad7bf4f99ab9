//! Error types for the serial link.

use thiserror::Error;

/// Outcome of a failed device operation.
///
/// `Timeout` is the only recoverable case; the state machines treat every
/// other variant as a device fault.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Nothing arrived (or could be written) before the deadline.
    #[error("device timed out")]
    Timeout,

    /// The device is closed.
    #[error("device is not open")]
    NotOpen,

    /// The peer end of the device went away.
    #[error("device disconnected")]
    Disconnected,

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by an embedded-hal serial peripheral.
    #[error("serial peripheral error: {0}")]
    Serial(String),
}

impl DeviceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeviceError::Timeout)
    }
}

/// Errors raised outside the wire handshake.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    /// A configuration value is out of range.
    #[error("invalid link configuration: {0}")]
    InvalidConfig(&'static str),

    /// The frame set handed to the codec cannot be reassembled.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// The payload is too short to carry the command header.
    #[error("payload of {0} bytes has no command header")]
    MissingHeader(usize),

    /// The payload needs more frames than the frame-count field can express.
    #[error("payload of {0} bytes exceeds the divided transfer limit")]
    PayloadTooLarge(usize),
}

/// Result type alias using LinkError.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Result type alias for device operations.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;
