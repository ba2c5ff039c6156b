//! Playback session - plays one buffer, blocking the caller until it ends
//!
//! The transport only reports progress asynchronously through the event
//! pump, and no "flow finished" notification is consumed here. `play()`
//! therefore sleeps for the nominal clip duration, and `stop()` can cut that
//! sleep short.
//!
//! ## Synchronisation
//!
//! Two independent locks, never held at the same time:
//! - the flow lock guards the active flow slot (check/start/stop/clear)
//! - the wake lock guards the stop ticket the waiting `play()` watches
//!
//! Every started flow gets a fresh ticket. `stop()` takes the flow out of
//! the slot under the flow lock and then publishes that flow's ticket under
//! the wake lock. A waiting `play()` only wakes early for its own ticket, so
//! a stop that lands after `play()` has returned can't cut the next clip
//! short, and a stop that lands before `play()` starts waiting is still seen.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::error::BackendError;
use crate::track::{AudioTrack, Gain, SoundFormat};
use crate::transport::{FlowId, Transport};

/// Why a `play()` call stopped waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    /// The nominal duration elapsed
    Elapsed,
    /// `stop()` ended the flow early
    Stopped,
}

/// What `stop()` found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A flow was playing and has been stopped
    Stopped(FlowId),
    /// Nothing was playing
    Idle,
}

#[derive(Debug, Clone, Copy)]
struct ActiveFlow {
    ticket: u64,
    id: FlowId,
}

/// Shared flow state for one connection
pub struct Playback {
    /// Flow lock
    flow: Mutex<Option<ActiveFlow>>,
    /// Ticket of the most recently stopped flow (0 = none)
    stopped: Mutex<u64>,
    wake: Condvar,
    tickets: AtomicU64,
}

impl Default for Playback {
    fn default() -> Self {
        Self::new()
    }
}

impl Playback {
    pub fn new() -> Self {
        Self {
            flow: Mutex::new(None),
            stopped: Mutex::new(0),
            wake: Condvar::new(),
            tickets: AtomicU64::new(1),
        }
    }

    fn lock_flow(&self) -> MutexGuard<'_, Option<ActiveFlow>> {
        self.flow.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stopped(&self) -> MutexGuard<'_, u64> {
        self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The flow currently playing, if any
    pub fn active_flow(&self) -> Option<FlowId> {
        self.lock_flow().map(|active| active.id)
    }

    /// Play `track` and block until it ends or `stop()` is called.
    ///
    /// # Arguments
    /// * `transport` - Server session the flow is started on
    /// * `track` - PCM to play, borrowed for the duration of the call
    /// * `volume` - Level on the `[-100, 100]` convention, mapped to server gain
    ///
    /// # Returns
    /// How the wait ended. Only starting the flow can fail; ending early is
    /// not an error.
    pub fn play<T: Transport>(
        &self,
        transport: &T,
        track: &AudioTrack<'_>,
        volume: i32,
    ) -> Result<PlaybackEnd, BackendError> {
        let format = SoundFormat::for_track(track)?;
        let gain = Gain::from_volume(volume);

        let ticket = {
            let mut flow = self.lock_flow();
            if flow.is_some() {
                return Err(BackendError::Busy);
            }

            let id = transport.start_flow(track.pcm(), &format, gain).map_err(|e| {
                log::error!("Couldn't start data flow: {}", e);
                BackendError::StartFlowFailed(e)
            })?;

            let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
            *flow = Some(ActiveFlow { ticket, id });
            log::debug!("Playing flow {} for {:?}", id, track.duration());
            ticket
        };

        // The flow lock is released here so stop() can get in while we wait
        let end = self.wait(ticket, Instant::now() + track.duration());

        // Clear the slot whichever way the wait ended. stop() may already
        // have done it.
        {
            let mut flow = self.lock_flow();
            if flow.is_some_and(|active| active.ticket == ticket) {
                *flow = None;
            }
        }

        Ok(end)
    }

    /// Block until `deadline` or until the flow holding `ticket` is stopped
    fn wait(&self, ticket: u64, deadline: Instant) -> PlaybackEnd {
        let timeout = deadline.saturating_duration_since(Instant::now());
        let stopped = self.lock_stopped();
        let (stopped, _) = self
            .wake
            .wait_timeout_while(stopped, timeout, |stopped| *stopped != ticket)
            .unwrap_or_else(PoisonError::into_inner);

        if *stopped == ticket {
            PlaybackEnd::Stopped
        } else {
            PlaybackEnd::Elapsed
        }
    }

    /// Stop the active flow, if any, and wake a blocked `play()`.
    ///
    /// Stopping with nothing playing is a no-op.
    pub fn stop<T: Transport>(&self, transport: &T) -> StopOutcome {
        let stopped = {
            let mut flow = self.lock_flow();
            flow.take().inspect(|active| {
                if let Err(e) = transport.stop_flow(active.id) {
                    log::warn!("Failed to stop flow {}: {}", active.id, e);
                }
            })
        };

        let Some(active) = stopped else {
            return StopOutcome::Idle;
        };

        *self.lock_stopped() = active.ticket;
        self.wake.notify_all();
        log::debug!("Stopped flow {}", active.id);
        StopOutcome::Stopped(active.id)
    }

    /// Wait until a flow is active or `timeout` passes
    #[cfg(test)]
    pub(crate) fn wait_for_flow(&self, timeout: std::time::Duration) -> Option<FlowId> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(flow) = self.active_flow() {
                return Some(flow);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        None
    }
}
