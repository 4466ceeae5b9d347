use thiserror::Error;

use crate::protocol::ProtocolFamily;
use crate::session::SessionPhase;

/// The primary error type for the `catprint` library.
#[derive(Error, Debug)]
pub enum PrinterError {
    #[error("payload too large: {0} bytes (frame length field is 16 bits)")]
    PayloadTooLarge(usize),

    #[error("invalid row length: expected {expected} pixels, got {actual}")]
    InvalidRowLength { expected: usize, actual: usize },

    #[error("pixel buffer too small: expected {expected} bytes, got {actual}")]
    MalformedBitmap { expected: usize, actual: usize },

    #[error("invalid session state: expected {expected:?}, session is {actual:?}")]
    InvalidSessionState {
        expected: SessionPhase,
        actual: SessionPhase,
    },

    #[error("unsupported on {family:?} devices: {what}")]
    Unsupported {
        family: ProtocolFamily,
        what: &'static str,
    },

    #[error("paper move of {0} lines does not fit the 16-bit feed field")]
    FeedOutOfRange(i32),

    #[error("transport write failed: {0}")]
    Transport(String),

    #[error("session aborted")]
    SessionAborted,

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("no Bluetooth adapter found. Is the adapter powered on?")]
    NoAdapter,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("characteristic {0:#06x} not found on device")]
    CharacteristicNotFound(u16),
}
