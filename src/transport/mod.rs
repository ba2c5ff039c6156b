//! Audio server transport - the client side of the server protocol
//!
//! This module provides:
//! - The `Connector` / `Transport` traits the backend is written against
//! - Flow identifiers and the non-fatal server error descriptor
//! - A local audio server built on cpal

mod local;
mod mixer;
#[cfg(test)]
pub(crate) mod mock;

use std::num::NonZeroU32;
use std::time::Duration;

use crate::error::TransportError;
use crate::track::{Gain, SoundFormat};

pub use local::{DeviceSelector, LocalConnector, LocalTransport};

/// Identifies one active playback stream on the server
///
/// Zero is never a valid flow; "no flow" is `Option::<FlowId>::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(NonZeroU32);

impl FlowId {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-fatal error reported asynchronously by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerError {
    /// Serial number of the failed request
    pub serial: u64,
    pub error_code: u32,
    pub resource_id: u32,
    pub request_code: u32,
    pub minor_code: u32,
}

/// Observer for non-fatal server errors.
///
/// Runs on the event pump thread. It must not call back into the transport
/// (the server protocol forbids it and it would deadlock); it may only log
/// or record the descriptor.
pub type ErrorSink = Box<dyn Fn(&ServerError) + Send + Sync>;

/// Log a server error descriptor field by field
pub fn log_server_error(error: &ServerError) {
    log::error!("Non-fatal server error in NAS");
    log::error!("NAS: Serial number of failed request: {}", error.serial);
    log::error!("NAS: Error code: {}", error.error_code);
    log::error!("NAS: Resource id: {}", error.resource_id);
    log::error!("NAS: Request code: {}", error.request_code);
    log::error!("NAS: Minor code: {}", error.minor_code);
}

/// Establishes sessions with an audio server
pub trait Connector: Send + Sync {
    type Transport: Transport;

    /// Open a session to the server at `endpoint`
    fn connect(&self, endpoint: &str) -> Result<Self::Transport, TransportError>;
}

/// An open session with an audio server
///
/// Shared between the caller's context and the event pump thread.
pub trait Transport: Send + Sync + 'static {
    /// Install the observer for non-fatal server errors
    fn set_error_sink(&self, sink: ErrorSink);

    /// Wait up to `timeout` for the next server event, then handle every
    /// queued event. Returns the number of events handled.
    ///
    /// Each call is one discrete processing iteration; the event pump only
    /// checks for cancellation between calls.
    fn process_events(&self, timeout: Duration) -> Result<usize, TransportError>;

    /// Start a data flow playing `pcm` at `gain`
    fn start_flow(&self, pcm: &[i16], format: &SoundFormat, gain: Gain) -> Result<FlowId, TransportError>;

    /// Stop a running flow
    fn stop_flow(&self, flow: FlowId) -> Result<(), TransportError>;

    /// Release server-side resources. Called exactly once, after the event
    /// pump has stopped.
    fn disconnect(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_id_zero_is_no_flow() {
        assert!(FlowId::new(0).is_none());
        assert_eq!(FlowId::new(7).map(FlowId::get), Some(7));
    }
}
