//! Error types for the belt link, the codec, and session persistence.
//!
//! Calibration has no error type: an unusable calibration window is reported
//! as [`crate::types::CalibrationProfile::is_valid`] `== false`, and a packet
//! that cannot be decoded is simply `None`.

use thiserror::Error;

/// Failures of the BLE link lifecycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// Scanning finished without a device whose name matches the prefix.
    #[error("no respiration belt was selected")]
    NoDeviceSelected,

    /// A connect, discovery, or write step exceeded its deadline.
    #[error("{operation} timed out after {secs} s")]
    Timeout { operation: &'static str, secs: u64 },

    /// The belt is already paired to another host or application.
    #[error("device is already connected elsewhere")]
    AlreadyConnectedElsewhere,

    /// The platform refused Bluetooth access.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// The device dropped the link while it was in use.
    #[error("link to the device was lost")]
    LinkLost,

    /// Any other adapter or GATT failure reported by the platform stack.
    #[error("Bluetooth adapter error: {0}")]
    Adapter(String),
}

impl ConnectionError {
    /// Text suitable for showing to the person wearing the belt.
    pub fn user_message(&self) -> String {
        match self {
            ConnectionError::NoDeviceSelected => {
                "No belt found. Switch the belt on and keep it close to this computer.".into()
            }
            ConnectionError::Timeout { .. } => {
                "The belt did not respond in time. Try connecting again.".into()
            }
            ConnectionError::AlreadyConnectedElsewhere => {
                "The belt is connected to another app or device. Disconnect it there first."
                    .into()
            }
            ConnectionError::PermissionDenied => {
                "Bluetooth access was denied. Allow Bluetooth for this application.".into()
            }
            ConnectionError::LinkLost => {
                "Connection to the belt was lost. Your session has been saved.".into()
            }
            ConnectionError::Adapter(msg) => format!("Bluetooth error: {msg}"),
        }
    }

    /// Map a btleplug error onto the connection taxonomy.
    ///
    /// btleplug does not expose structured codes for "busy" or "not
    /// authorised" on every platform, so the message text is inspected as a
    /// fallback.
    pub fn from_btleplug(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => ConnectionError::PermissionDenied,
            btleplug::Error::NotConnected => ConnectionError::LinkLost,
            btleplug::Error::TimedOut(d) => ConnectionError::Timeout {
                operation: "BLE operation",
                secs: d.as_secs(),
            },
            other => {
                let text = other.to_string();
                let lower = text.to_ascii_lowercase();
                if lower.contains("in progress") || lower.contains("busy") {
                    ConnectionError::AlreadyConnectedElsewhere
                } else if lower.contains("not authorized") || lower.contains("unauthorized") {
                    ConnectionError::PermissionDenied
                } else {
                    ConnectionError::Adapter(text)
                }
            }
        }
    }
}

impl From<btleplug::Error> for ConnectionError {
    fn from(err: btleplug::Error) -> Self {
        ConnectionError::from_btleplug(err)
    }
}

/// Codec-level failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
}

/// A session could not be written to the server or to local storage.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Request never produced a response (DNS, TLS, connection reset, timeout).
    #[error("network error: {0}")]
    Network(String),

    /// Server answered with a non-2xx status.
    #[error("server rejected session with status {status}")]
    Server { status: u16 },

    /// Local durable storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Misuse of the session lifecycle.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} is still active; complete or abandon it first")]
    AlreadyActive(String),

    #[error("no active session")]
    NoActiveSession,

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
