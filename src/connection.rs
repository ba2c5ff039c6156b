//! Server connection - owns the session with the audio server

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{BackendError, TransportError};
use crate::transport::{log_server_error, Connector, ServerError, Transport};

/// Counts non-fatal server errors seen by the error sink
#[derive(Debug, Clone, Default)]
pub struct ErrorCounter(Arc<AtomicU64>);

impl ErrorCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn record(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// An open session with the audio server
///
/// The transport is shared with the event pump thread. `disconnect()`
/// consumes the connection so it can only run once.
pub struct ServerConnection<T: Transport> {
    transport: Arc<T>,
    endpoint: String,
}

impl<T: Transport> ServerConnection<T> {
    /// Connect to `endpoint` and install the logging error sink
    pub fn connect<C>(connector: &C, endpoint: &str, errors: ErrorCounter) -> Result<Self, BackendError>
    where
        C: Connector<Transport = T>,
    {
        let transport = connector.connect(endpoint).map_err(|source| {
            log::error!("Can't connect to NAS audio server at '{}': {}", endpoint, source);
            BackendError::ConnectFailed {
                endpoint: endpoint.to_string(),
                source,
            }
        })?;

        // Runs on the event pump thread: log and count only, never call
        // back into the transport.
        transport.set_error_sink(Box::new(move |error: &ServerError| {
            errors.record();
            log_server_error(error);
        }));

        Ok(Self {
            transport: Arc::new(transport),
            endpoint: endpoint.to_string(),
        })
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Release the server session. The event pump must already be joined.
    pub fn disconnect(self) -> Result<(), TransportError> {
        self.transport.disconnect()
    }
}
