//! NAS output backend - the five-operation plugin contract
//!
//! `open()` connects and starts the event pump, `play()` blocks for the
//! length of one clip, `stop()` cuts a blocked `play()` short from another
//! thread, and `close()` joins the pump before releasing the connection.
//!
//! `play()`/`stop()` take `&self` so they can run concurrently; `open()` and
//! `close()` take `&mut self`, so safe code can't close the backend while a
//! `play()` or `stop()` is still in flight.

use std::sync::Arc;

use crate::config::BackendConfig;
use crate::connection::{ErrorCounter, ServerConnection};
use crate::error::BackendError;
use crate::playback::{Playback, PlaybackEnd, StopOutcome};
use crate::pump::{EventPump, PumpState};
use crate::track::AudioTrack;
use crate::transport::{Connector, FlowId, LocalConnector};

/// Uniform audio output contract, so callers can swap backends
pub trait AudioOutput: Send + Sync {
    /// Connect to the audio server at `endpoint`
    fn open(&mut self, endpoint: &str) -> Result<(), BackendError>;

    /// Play one track, blocking until it has played or `stop()` is called
    fn play(&self, track: &AudioTrack<'_>, volume: i32) -> Result<(), BackendError>;

    /// Stop the current track, if any
    fn stop(&self) -> Result<(), BackendError>;

    /// Tear down the connection
    fn close(&mut self) -> Result<(), BackendError>;

    /// Accepted for compatibility; has no effect
    fn set_volume(&self, volume: i32) -> Result<(), BackendError>;
}

/// Everything that exists while the backend is open
struct Session<C: Connector> {
    connection: ServerConnection<C::Transport>,
    pump: EventPump,
    playback: Playback,
}

/// Output backend playing through a NAS-style audio server
pub struct NasOutput<C: Connector = LocalConnector> {
    connector: C,
    config: BackendConfig,
    session: Option<Session<C>>,
    server_errors: ErrorCounter,
}

impl NasOutput<LocalConnector> {
    /// Backend for the local cpal audio server
    pub fn local(config: BackendConfig) -> Self {
        let connector = LocalConnector::from_config(&config);
        Self::with_config(connector, config)
    }
}

impl<C: Connector> NasOutput<C> {
    pub fn new(connector: C) -> Self {
        Self::with_config(connector, BackendConfig::default())
    }

    /// Create a closed backend
    ///
    /// # Arguments
    /// * `connector` - How to reach the audio server on `open()`
    /// * `config` - Default endpoint and event pump timing
    pub fn with_config(connector: C, config: BackendConfig) -> Self {
        Self {
            connector,
            config,
            session: None,
            server_errors: ErrorCounter::new(),
        }
    }

    /// Open the endpoint named in the configuration
    pub fn open_default(&mut self) -> Result<(), BackendError> {
        let endpoint = self.config.endpoint.clone();
        self.open(&endpoint)
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Endpoint of the open connection
    pub fn endpoint(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.connection.endpoint())
    }

    /// The flow currently playing, if any
    pub fn active_flow(&self) -> Option<FlowId> {
        self.session.as_ref().and_then(|s| s.playback.active_flow())
    }

    /// Non-fatal server errors seen since the backend was created
    pub fn server_error_count(&self) -> u64 {
        self.server_errors.get()
    }

    pub fn pump_state(&self) -> PumpState {
        self.session
            .as_ref()
            .map_or(PumpState::NotStarted, |s| s.pump.state())
    }

    fn session(&self) -> Result<&Session<C>, BackendError> {
        self.session
            .as_ref()
            .ok_or(BackendError::InvalidArgument("backend is not open"))
    }

    /// Like `play()`, but reports whether the clip ran out or was stopped
    ///
    /// Blocks the calling thread for `num_samples / sample_rate` seconds
    /// unless another thread calls `stop()` first.
    ///
    /// # Arguments
    /// * `track` - PCM to play; only read, never kept past the call
    /// * `volume` - Level on the `[-100, 100]` convention
    ///
    /// # Returns
    /// How the wait ended, or the reason the flow never started
    pub fn play_track(&self, track: &AudioTrack<'_>, volume: i32) -> Result<PlaybackEnd, BackendError> {
        let session = self.session()?;
        session
            .playback
            .play(session.connection.transport().as_ref(), track, volume)
    }

    /// Like `stop()`, but reports which flow was stopped
    pub fn stop_flow(&self) -> Result<StopOutcome, BackendError> {
        let session = self.session()?;
        Ok(session.playback.stop(session.connection.transport().as_ref()))
    }
}

impl<C: Connector> AudioOutput for NasOutput<C> {
    fn open(&mut self, endpoint: &str) -> Result<(), BackendError> {
        if self.session.is_some() {
            return Err(BackendError::InvalidArgument("backend is already open"));
        }

        let connection = ServerConnection::connect(&self.connector, endpoint, self.server_errors.clone())?;

        // Without a pump nobody drains server events, so a failed spawn
        // must not leave the connection behind
        let pump = match EventPump::spawn(
            Arc::clone(connection.transport()),
            self.config.event_poll_interval(),
        ) {
            Ok(pump) => pump,
            Err(e) => {
                log::error!("NAS Audio module: thread creation failed: {}", e);
                if let Err(e) = connection.disconnect() {
                    log::warn!("Disconnect after failed open: {}", e);
                }
                return Err(BackendError::TaskStartFailed(e));
            }
        };

        log::info!("NAS output opened on '{}'", endpoint);

        self.session = Some(Session {
            connection,
            pump,
            playback: Playback::new(),
        });
        Ok(())
    }

    fn play(&self, track: &AudioTrack<'_>, volume: i32) -> Result<(), BackendError> {
        self.play_track(track, volume).map(|_| ())
    }

    fn stop(&self) -> Result<(), BackendError> {
        self.stop_flow().map(|_| ())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        let Session {
            connection,
            mut pump,
            playback: _,
        } = self
            .session
            .take()
            .ok_or(BackendError::InvalidArgument("backend is not open"))?;

        // Best effort: every step runs even if an earlier one failed
        pump.cancel();
        if !pump.join() {
            log::warn!("Event pump ended abnormally, disconnecting anyway");
        }

        let endpoint = connection.endpoint().to_string();
        if let Err(e) = connection.disconnect() {
            log::warn!("Error while disconnecting from '{}': {}", endpoint, e);
        }

        log::info!("NAS output closed");
        Ok(())
    }

    fn set_volume(&self, _volume: i32) -> Result<(), BackendError> {
        Ok(())
    }
}

impl<C: Connector> Drop for NasOutput<C> {
    fn drop(&mut self) {
        if self.session.is_some() {
            if let Err(e) = self.close() {
                log::debug!("Close on drop failed: {}", e);
            }
        }
    }
}
