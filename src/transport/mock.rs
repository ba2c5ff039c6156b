//! Scripted transport for tests
//!
//! Records every call and lets tests inject server events and failures.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use super::{Connector, ErrorSink, FlowId, ServerError, Transport};
use crate::error::TransportError;
use crate::track::{Gain, SoundFormat};

/// Events a test can push into the server queue
pub enum MockEvent {
    Error(ServerError),
    Tick,
}

/// Snapshot of the calls made against the mock server
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    pub connects: usize,
    pub start_flows: usize,
    pub stop_flows: usize,
    pub process_events: usize,
    pub disconnects: usize,
    pub stopped: Vec<FlowId>,
    pub gains: Vec<Gain>,
    pub formats: Vec<SoundFormat>,
    /// `process_events` calls that began after `disconnect`
    pub events_after_disconnect: usize,
    /// `disconnect` ran while an event iteration was in progress
    pub disconnect_during_pump: bool,
}

struct Shared {
    reachable: AtomicBool,
    fail_start: AtomicBool,
    in_process: AtomicBool,
    disconnected: AtomicBool,
    next_flow: AtomicU32,
    log: Mutex<CallLog>,
    events_tx: Sender<MockEvent>,
    events_rx: Receiver<MockEvent>,
}

#[derive(Clone)]
pub struct MockConnector {
    shared: Arc<Shared>,
}

impl MockConnector {
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            shared: Arc::new(Shared {
                reachable: AtomicBool::new(true),
                fail_start: AtomicBool::new(false),
                in_process: AtomicBool::new(false),
                disconnected: AtomicBool::new(false),
                next_flow: AtomicU32::new(1),
                log: Mutex::new(CallLog::default()),
                events_tx,
                events_rx,
            }),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.shared.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn inject(&self, event: MockEvent) {
        let _ = self.shared.events_tx.send(event);
    }

    pub fn log(&self) -> CallLog {
        self.shared.log.lock().unwrap().clone()
    }

    /// Whether an event iteration is running right now
    pub fn is_processing(&self) -> bool {
        self.shared.in_process.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    fn connect(&self, endpoint: &str) -> Result<MockTransport, TransportError> {
        self.shared.log.lock().unwrap().connects += 1;
        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(endpoint.to_string()));
        }
        self.shared.disconnected.store(false, Ordering::SeqCst);
        Ok(MockTransport {
            shared: Arc::clone(&self.shared),
            sink: Mutex::new(None),
        })
    }
}

pub struct MockTransport {
    shared: Arc<Shared>,
    sink: Mutex<Option<ErrorSink>>,
}

impl Transport for MockTransport {
    fn set_error_sink(&self, sink: ErrorSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn process_events(&self, timeout: Duration) -> Result<usize, TransportError> {
        self.shared.in_process.store(true, Ordering::SeqCst);
        {
            let mut log = self.shared.log.lock().unwrap();
            log.process_events += 1;
            if self.shared.disconnected.load(Ordering::SeqCst) {
                log.events_after_disconnect += 1;
            }
        }

        let result = match self.shared.events_rx.recv_timeout(timeout) {
            Ok(first) => {
                let mut handled = 0;
                for event in std::iter::once(first).chain(self.shared.events_rx.try_iter()) {
                    if let MockEvent::Error(error) = event {
                        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                            sink(&error);
                        }
                    }
                    handled += 1;
                }
                Ok(handled)
            }
            Err(RecvTimeoutError::Timeout) => Ok(0),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        };

        self.shared.in_process.store(false, Ordering::SeqCst);
        result
    }

    fn start_flow(&self, _pcm: &[i16], format: &SoundFormat, gain: Gain) -> Result<FlowId, TransportError> {
        let mut log = self.shared.log.lock().unwrap();
        log.start_flows += 1;
        log.gains.push(gain);
        log.formats.push(*format);

        if self.shared.fail_start.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("scripted failure".to_string()));
        }
        let raw = self.shared.next_flow.fetch_add(1, Ordering::SeqCst);
        FlowId::new(raw).ok_or(TransportError::Closed)
    }

    fn stop_flow(&self, flow: FlowId) -> Result<(), TransportError> {
        let mut log = self.shared.log.lock().unwrap();
        log.stop_flows += 1;
        log.stopped.push(flow);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        let mut log = self.shared.log.lock().unwrap();
        log.disconnects += 1;
        if self.shared.in_process.load(Ordering::SeqCst) {
            log.disconnect_during_pump = true;
        }
        self.shared.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}
