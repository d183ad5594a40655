//! Error taxonomy for the ISP pipeline.
//!
//! Errors fall into the categories callers can actually act on:
//!
//! - `InvalidArgument` / `ResourceExhausted` / `BadState` — rejected
//!   synchronously, nothing was sent to firmware.
//! - `Transport` — the command never reached firmware; no command element
//!   was left pending.
//! - `Firmware` — firmware answered with a non-success status.
//! - `Timeout` — a synchronous command's deadline expired; the element is
//!   left pending for a possible late answer.
//! - `Drained` — the element was forcibly removed during teardown.
//!
//! Response mismatches (unknown sequence number, wrong opcode) are *not*
//! errors: they are logged and dropped by the dispatcher, never escalated.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::command::{CommandOpcode, ResponseStatus};
use crate::types::CameraId;

/// Convenience alias for results using the pipeline error type.
pub type IspResult<T> = std::result::Result<T, IspError>;

/// Which transport primitive failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Power,
    Transmit,
    Doorbell,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::Power => "power",
            TransportErrorKind::Transmit => "transmit",
            TransportErrorKind::Doorbell => "doorbell",
        };
        f.write_str(label)
    }
}

/// A structured failure from the hardware transport layer.
#[derive(Error, Debug, Clone)]
#[error("transport {kind} error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Primary error type for the ISP pipeline.
#[derive(Error, Debug)]
pub enum IspError {
    /// Rejected before any command was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Buffer or command-table allocation failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The command never reached firmware.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Firmware answered with a non-success status.
    #[error("firmware reported {status} for {opcode}")]
    Firmware {
        opcode: CommandOpcode,
        status: ResponseStatus,
    },

    /// A synchronous command's completion was not observed in time.
    /// The command element is left pending for a possible late answer.
    #[error("{opcode} (seq {sequence}) timed out after {timeout:?}")]
    Timeout {
        sequence: u32,
        opcode: CommandOpcode,
        timeout: Duration,
    },

    /// The pending command was forcibly removed during teardown.
    #[error("{opcode} (seq {sequence}) dropped during queue drain")]
    Drained { sequence: u32, opcode: CommandOpcode },

    /// The entity is not in a state that permits the operation.
    #[error("{entity} cannot {operation} while {state}")]
    BadState {
        entity: &'static str,
        operation: &'static str,
        state: String,
    },

    /// The camera slot does not exist.
    #[error("unknown camera {0}")]
    UnknownCamera(CameraId),

    /// Configuration parsing or validation failed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The device context is shutting down.
    #[error("device is shutting down")]
    ShuttingDown,
}

impl IspError {
    pub fn bad_state(
        entity: &'static str,
        operation: &'static str,
        state: impl fmt::Display,
    ) -> Self {
        IspError::BadState {
            entity,
            operation,
            state: state.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display() {
        let err = TransportError::new(TransportErrorKind::Transmit, "link down");
        assert_eq!(err.to_string(), "transport transmit error: link down");
    }

    #[test]
    fn firmware_error_display() {
        let err = IspError::Firmware {
            opcode: CommandOpcode::StreamOn,
            status: ResponseStatus::Busy,
        };
        assert_eq!(err.to_string(), "firmware reported busy for StreamOn");
    }

    #[test]
    fn bad_state_display() {
        let err = IspError::bad_state("stream preview", "start", "StartFail");
        assert_eq!(err.to_string(), "stream preview cannot start while StartFail");
    }
}
