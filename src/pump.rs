//! Event pump - drains the server's event queue on a background thread
//!
//! The pump never exits on its own. `cancel()` raises a flag that the loop
//! checks between `process_events()` calls, so an iteration is never cut
//! short and the transport is left consistent. The longest a cancellation
//! waits is one poll interval.

#[cfg(test)]
use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::transport::Transport;

/// Lifecycle of the pump thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    NotStarted,
    Running,
    CancelRequested,
    Joined,
}

#[cfg(test)]
thread_local! {
    static FAIL_NEXT_SPAWN: Cell<bool> = const { Cell::new(false) };
}

/// Make the next `EventPump::spawn` on this thread fail as if the OS
/// refused to create the thread
#[cfg(test)]
pub(crate) fn fail_next_spawn() {
    FAIL_NEXT_SPAWN.with(|fail| fail.set(true));
}

/// Handle to the background event pump
pub struct EventPump {
    cancel: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EventPump {
    /// Start pumping events for `transport`
    ///
    /// # Arguments
    /// * `transport` - Connection to drain; the pump keeps a reference until joined
    /// * `poll_interval` - Longest single `process_events()` call, which is
    ///   also the longest a cancellation has to wait
    ///
    /// # Returns
    /// The pump handle, or the OS error if the thread couldn't be created
    pub fn spawn<T: Transport>(transport: Arc<T>, poll_interval: Duration) -> io::Result<Self> {
        #[cfg(test)]
        if FAIL_NEXT_SPAWN.with(|fail| fail.replace(false)) {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "thread limit reached"));
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let thread_cancel = Arc::clone(&cancel);
        let thread_finished = Arc::clone(&finished);

        let handle = thread::Builder::new()
            .name("nas-events".to_string())
            .spawn(move || {
                run(transport.as_ref(), &thread_cancel, poll_interval);
                thread_finished.store(true, Ordering::Release);
            })?;

        log::debug!("Event pump started (poll interval {:?})", poll_interval);

        Ok(Self {
            cancel,
            finished,
            handle: Some(handle),
        })
    }

    /// Ask the pump to stop after its current iteration
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Wait for the pump thread to exit.
    ///
    /// Call `cancel()` first, or this blocks forever. Joining twice is
    /// harmless.
    ///
    /// # Returns
    /// `false` if the thread panicked
    pub fn join(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(()) => {
                    log::debug!("Event pump joined");
                    true
                }
                Err(_) => {
                    log::error!("Event pump thread panicked");
                    false
                }
            },
            None => true,
        }
    }

    /// Whether the pump loop has returned
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PumpState {
        if self.handle.is_none() {
            PumpState::Joined
        } else if self.cancel.load(Ordering::Acquire) {
            PumpState::CancelRequested
        } else {
            PumpState::Running
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel();
            self.join();
        }
    }
}

fn run<T: Transport>(transport: &T, cancel: &AtomicBool, poll_interval: Duration) {
    // The flag is only read between iterations, never inside one
    while !cancel.load(Ordering::Acquire) {
        match transport.process_events(poll_interval) {
            Ok(0) => {}
            Ok(handled) => log::trace!("Handled {} server event(s)", handled),
            Err(e) => {
                // Keep running: only close() ends the pump
                log::warn!("Event processing failed: {}", e);
                thread::sleep(poll_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockConnector, MockEvent};
    use crate::transport::Connector;

    const POLL: Duration = Duration::from_millis(10);

    #[test]
    fn test_pump_runs_until_cancelled() {
        let connector = MockConnector::new();
        let transport = Arc::new(connector.connect("local").unwrap());

        let mut pump = EventPump::spawn(Arc::clone(&transport), POLL).unwrap();
        assert_eq!(pump.state(), PumpState::Running);

        connector.inject(MockEvent::Tick);
        thread::sleep(Duration::from_millis(50));
        assert!(!pump.is_finished());
        assert!(connector.log().process_events >= 2);

        pump.cancel();
        assert_eq!(pump.state(), PumpState::CancelRequested);
        assert!(pump.join());

        assert_eq!(pump.state(), PumpState::Joined);
        assert!(pump.is_finished());
        assert!(!connector.is_processing());
    }

    #[test]
    fn test_no_iterations_after_join() {
        let connector = MockConnector::new();
        let transport = Arc::new(connector.connect("local").unwrap());

        let mut pump = EventPump::spawn(transport, POLL).unwrap();
        thread::sleep(Duration::from_millis(20));
        pump.cancel();
        pump.join();

        let calls = connector.log().process_events;
        thread::sleep(Duration::from_millis(30));
        assert_eq!(connector.log().process_events, calls);
    }

    #[test]
    fn test_spawn_failure_hook_fires_once() {
        let connector = MockConnector::new();
        let transport = Arc::new(connector.connect("local").unwrap());

        fail_next_spawn();
        assert!(EventPump::spawn(Arc::clone(&transport), POLL).is_err());

        let mut pump = EventPump::spawn(transport, POLL).unwrap();
        pump.cancel();
        assert!(pump.join());
    }

    #[test]
    fn test_drop_cancels_and_joins() {
        let connector = MockConnector::new();
        let transport = Arc::new(connector.connect("local").unwrap());

        let pump = EventPump::spawn(transport, POLL).unwrap();
        let finished = Arc::clone(&pump.finished);
        drop(pump);

        assert!(finished.load(Ordering::Acquire));
    }
}
