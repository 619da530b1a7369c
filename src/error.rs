//! Error taxonomy for the CTAP-BLE transport.
//!
//! Every fallible operation in this crate resolves to one of these kinds.
//! Nothing here retries: the higher FIDO layer owns retry/reset policy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BleTransportError {
    /// Caller-side contract violation (null buffer, wrong device path prefix).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Remote device isn't paired/connected/resolved, or doesn't advertise FIDO.
    #[error("device {path} is not usable: {reason}")]
    UnusableDevice { path: String, reason: String },

    /// Required GATT characteristics were not found on the remote service.
    #[error("GATT discovery failed for {path}: {reason}")]
    DiscoveryFailed { path: String, reason: String },

    /// Remote doesn't offer the FIDO2 bit in its Service Revision bitmap.
    #[error("authenticator does not support FIDO2 (service revision 0x{0:02x})")]
    RevisionUnsupported(u8),

    /// Malformed frame, wrong command byte, wrong sequence, truncated payload.
    #[error("CTAP-BLE protocol error: {0}")]
    ProtocolError(String),

    /// Transport-level failure: bus error, short write, broken notification channel.
    #[error("I/O error: {0}")]
    IoError(String),

    /// `read` did not observe a frame within the deadline.
    #[error("operation timed out after {0}ms")]
    Timeout(i64),

    /// Unrecognized command, or internal bookkeeping failure.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<dbus::Error> for BleTransportError {
    fn from(e: dbus::Error) -> Self {
        BleTransportError::IoError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BleTransportError>;
