//! Error types for ccpflash.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::handler::HandlerState;
use crate::protocol::command::{CommandCode, CommandStatus, ErrorCategory};

/// Result type for ccpflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ccpflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (transport, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Frame identifier is not a 29-bit extended identifier.
    #[error("Identifier type error: {id:#x} is not a valid extended identifier")]
    IdentifierType {
        /// Offending identifier.
        id: u32,
    },

    /// Frame is not exactly eight bytes long.
    #[error("Message length error: expected 8 bytes, got {length}")]
    MessageLength {
        /// Actual frame length.
        length: usize,
    },

    /// Payload does not fit the command's payload window.
    #[error("Payload length error: {command} does not accept {length} bytes (limit {max})")]
    PayloadLength {
        /// Command the payload was meant for.
        command: CommandCode,
        /// Offered payload length.
        length: usize,
        /// Largest accepted payload length.
        max: usize,
    },

    /// Command or status byte not defined by the protocol.
    #[error("Unknown {kind} code {value:#04x}")]
    UnknownCode {
        /// What was being decoded ("command" or "status").
        kind: &'static str,
        /// Raw byte.
        value: u8,
    },

    /// An operation was requested while another one is outstanding.
    #[error("Handler busy: a transaction is already outstanding")]
    HandlerBusy,

    /// The operation is not permitted in the current handler state.
    #[error("{operation} is not allowed while {state}")]
    InvalidState {
        /// Requested operation.
        operation: CommandCode,
        /// State the handler was in.
        state: HandlerState,
    },

    /// A reply did not match the outstanding request.
    #[error("Unexpected message received: {0}")]
    UnexpectedMessage(String),

    /// No reply arrived within the command timeout.
    #[error("Request timeout: no reply to {command} within {timeout:?}")]
    Timeout {
        /// Command that timed out.
        command: CommandCode,
        /// Timeout that was armed.
        timeout: Duration,
    },

    /// The device answered with a non-acknowledge status.
    #[error("{command} failed: {status} ({category})")]
    CommandFailed {
        /// Command that failed.
        command: CommandCode,
        /// Status reported by the device.
        status: CommandStatus,
        /// Category of the status.
        category: ErrorCategory,
    },

    /// Invalid argument for a pipeline or job.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Transport collaborator failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The operation was cancelled by the embedding application.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Error category of this failure, if it is a protocol-level failure.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::Timeout { .. } => Some(ErrorCategory::Timeout),
            Self::CommandFailed { category, .. } => Some(*category),
            _ => None,
        }
    }

    /// Whether this is a request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the caller should reconnect before continuing.
    pub fn requires_reconnect(&self) -> bool {
        self.category()
            .is_some_and(ErrorCategory::transitions_to_fault)
    }
}
