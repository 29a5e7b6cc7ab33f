//! Error taxonomy for the capture pipeline and the transport sessions.
//!
//! Every error here is handled by the component that detects it; only
//! connection status transitions cross component boundaries.

use thiserror::Error;

/// Encoding a single frame failed. The frame is skipped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("encode failed: {reason}")]
pub struct EncodeError {
    pub reason: String,
}

impl EncodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A received payload could not be shown. The viewer skips it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("not a JPEG image: {0}")]
    Malformed(String),
}

/// Handshake or transport failure while opening a session.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid relay address: {0}")]
    InvalidAddress(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("session is already connecting or connected")]
    AlreadyConnected,
}

/// The capture source could not produce a snapshot this cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capture source unavailable: {0}")]
    Unavailable(String),

    #[error("no frame captured yet")]
    NoFrame,
}

/// Why a capture loop ended. Stream end is a normal stop, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    StreamEnded,
    TransportClosed,
    Requested,
    ConnectFailed,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::StreamEnded => "stream ended",
            StopReason::TransportClosed => "transport closed",
            StopReason::Requested => "stop requested",
            StopReason::ConnectFailed => "connect failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = EncodeError::new("buffer too short");
        assert_eq!(e.to_string(), "encode failed: buffer too short");

        let e = ConnectError::Handshake("connection refused".into());
        assert!(e.to_string().contains("connection refused"));

        assert_eq!(StopReason::StreamEnded.to_string(), "stream ended");
        assert_eq!(DecodeError::Empty.to_string(), "empty payload");
    }
}
