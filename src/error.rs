//! # Error model
//!
//! Every fallible operation in this crate returns a [`RdmaError`]. Kinds mirror the
//! taxonomy the control-channel protocol and the executor agree on; wrapping is done
//! with `#[source]` so a cause chain survives crossing a component boundary.

use std::time::Duration;

use crate::endpoint::EndpointId;

pub type Result<T> = std::result::Result<T, RdmaError>;

/// Error kinds surfaced by the executor, buffer manager, endpoint registry and
/// control-channel session protocol.
#[derive(Debug, thiserror::Error)]
pub enum RdmaError {
    /// Bad or missing device, permissions, or capability.
    #[error("config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<RdmaError>>,
    },

    /// Inventory exhausted, queue full, or no resources from the provider.
    #[error("resource error: {message}")]
    Resource { message: String },

    /// Operation not legal in current state.
    #[error("state error: {message}")]
    State { message: String },

    /// Connect failed, rejected, disconnected, or timed out during handshake.
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<RdmaError>>,
    },

    /// A task completion callback reported failure.
    #[error("transfer error on task: {message}")]
    Transfer { message: String },

    /// A bounded wait exceeded its budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed message on the control channel, or a response code that violates
    /// the request/response/ack sequence.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The application handler for an endpoint returned a failure.
    #[error("service error on endpoint {endpoint}: {message}")]
    Service { endpoint: EndpointId, message: String },

    /// The executor or a session was stopped while an operation was still pending.
    #[error("shutdown while operation was pending")]
    Shutdown,

    /// The endpoint registry has no entry for an id, or a path is already registered.
    #[error("registry error: {message}")]
    Registry { message: String },

    /// I/O failure on the control-channel socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RdmaError {
    pub fn config(message: impl Into<String>) -> Self {
        RdmaError::Config { message: message.into(), source: None }
    }

    pub fn config_wrap(message: impl Into<String>, source: RdmaError) -> Self {
        RdmaError::Config { message: message.into(), source: Some(Box::new(source)) }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        RdmaError::Resource { message: message.into() }
    }

    pub fn state(message: impl Into<String>) -> Self {
        RdmaError::State { message: message.into() }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        RdmaError::Connection { message: message.into(), source: None }
    }

    pub fn connection_wrap(message: impl Into<String>, source: RdmaError) -> Self {
        RdmaError::Connection { message: message.into(), source: Some(Box::new(source)) }
    }

    pub fn transfer(message: impl Into<String>) -> Self {
        RdmaError::Transfer { message: message.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        RdmaError::Protocol { message: message.into() }
    }

    pub fn registry(message: impl Into<String>) -> Self {
        RdmaError::Registry { message: message.into() }
    }

    /// True for errors that should tear down only the current session/task, not the
    /// whole executor.
    pub fn is_local_to_session(&self) -> bool {
        !matches!(self, RdmaError::Config { .. } | RdmaError::Shutdown)
    }
}
