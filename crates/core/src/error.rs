//! Error types for the video core

use std::time::Duration;

use thiserror::Error;

use crate::hfi::ResponseKind;
use crate::state::{CoreState, InstanceState};

/// Result type alias for video core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while driving a video core and its sessions
#[derive(Debug, Error)]
pub enum Error {
    /// Caller supplied an argument that can never succeed; nothing was mutated
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is not allowed in the instance's current state
    #[error("Operation '{operation}' not allowed in state {state:?}")]
    InvalidState {
        /// Operation that was rejected
        operation: &'static str,
        /// State the instance was in
        state: InstanceState,
    },

    /// The core is not in a state that allows the operation
    #[error("Core is {state:?}: {context}")]
    CoreUnavailable {
        /// State the core was in
        state: CoreState,
        /// What was attempted
        context: String,
    },

    /// Hardware refused a command synchronously
    #[error("Hardware rejected {command}: {reason}")]
    CommandRejected {
        /// Command that was sent
        command: &'static str,
        /// Reason reported by the hardware interface
        reason: String,
    },

    /// A done-message arrived carrying a failure status
    #[error("Hardware reported status {status:#x} for {kind:?}")]
    HardwareStatus {
        /// Response that carried the status
        kind: ResponseKind,
        /// Raw status code
        status: u32,
    },

    /// Hardware did not answer within the bounded wait
    #[error("Timed out after {timeout_ms}ms waiting for {kind:?}")]
    Timeout {
        /// Response that was awaited
        kind: ResponseKind,
        /// Timeout in milliseconds
        timeout_ms: u64,
    },

    /// A waiter was woken because the session or core was invalidated
    #[error("Session invalidated while waiting for {kind:?}")]
    SessionInvalidated {
        /// Response that was awaited
        kind: ResponseKind,
    },

    /// Adding this session would exceed the engine's capacity
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// Memory allocation failed
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// Request is recognised but not supported
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Configuration could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O error while reading configuration
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a timeout error for an awaited response
    pub fn timeout(kind: ResponseKind, timeout: Duration) -> Self {
        Error::Timeout {
            kind,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a rejected-command error
    pub fn rejected(command: &'static str, reason: impl Into<String>) -> Self {
        Error::CommandRejected {
            command,
            reason: reason.into(),
        }
    }

    /// Whether this error means the session can no longer be used normally
    ///
    /// Only forced cleanup is guaranteed to succeed after a fatal error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::SessionInvalidated { .. }
                | Error::InvalidState {
                    state: InstanceState::Invalid,
                    ..
                }
                | Error::CoreUnavailable {
                    state: CoreState::Invalid,
                    ..
                }
        )
    }
}
