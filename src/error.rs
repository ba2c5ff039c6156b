//! Error types for the NAS output backend
//!
//! Synchronous operations return [`BackendError`]. Asynchronous server
//! errors never show up here: they are delivered to the error sink on the
//! event pump thread (see [`crate::transport::ServerError`]).

use thiserror::Error;

/// Errors reported by an audio server transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Audio server unreachable: {0}")]
    Unreachable(String),

    #[error("Audio server rejected the request: {0}")]
    Rejected(String),

    #[error("Unsupported stream format: {channels} channel(s) at {sample_rate} Hz")]
    UnsupportedFormat { channels: u16, sample_rate: u32 },

    #[error("Connection to the audio server is closed")]
    Closed,

    #[error("Audio device error: {0}")]
    Device(String),
}

/// Errors returned by the backend operations
#[derive(Error, Debug)]
pub enum BackendError {
    /// Null or uninitialised handle, or a malformed argument. Checked before
    /// anything else; the transport is never touched.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Can't connect to audio server at '{endpoint}': {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    #[error("Event handler thread creation failed: {0}")]
    TaskStartFailed(#[source] std::io::Error),

    #[error("Couldn't start data flow: {0}")]
    StartFlowFailed(#[source] TransportError),

    #[error("A flow is already playing on this connection")]
    Busy,
}

impl BackendError {
    /// Legacy plugin return code (`-2` invalid argument, `-1` failure)
    pub fn code(&self) -> i32 {
        match self {
            BackendError::InvalidArgument(_) => -2,
            _ => -1,
        }
    }

    /// Whether the caller may retry or skip the clip and carry on
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BackendError::StartFlowFailed(_) | BackendError::Busy)
    }
}

/// Tri-state outcome of a plugin operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Error,
    InvalidArgument,
}

impl Status {
    /// Legacy plugin return code
    pub fn code(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::Error => -1,
            Status::InvalidArgument => -2,
        }
    }
}

impl<T> From<&Result<T, BackendError>> for Status {
    fn from(result: &Result<T, BackendError>) -> Self {
        match result {
            Ok(_) => Status::Success,
            Err(BackendError::InvalidArgument(_)) => Status::InvalidArgument,
            Err(_) => Status::Error,
        }
    }
}

impl<T> From<Result<T, BackendError>> for Status {
    fn from(result: Result<T, BackendError>) -> Self {
        Status::from(&result)
    }
}
