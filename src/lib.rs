//! spd-nas - NAS style network audio output backend
//!
//! Plays raw 16-bit PCM through an audio server behind the uniform
//! {open, play, stop, close, set_volume} contract used by speech-dispatcher
//! style audio output layers, so callers can swap backends freely.
//!
//! ## Architecture
//! - `transport`: client traits for the audio server, plus a local server
//!   built on cpal
//! - `connection`: the open server session and its error sink
//! - `pump`: background thread draining server events
//! - `playback`: one blocking, cancellable `play()` per clip
//! - `output`: the plugin facade tying them together
//!
//! ```no_run
//! use spd_nas::{AudioOutput, AudioTrack, BackendConfig, NasOutput};
//!
//! let mut output = NasOutput::local(BackendConfig::default());
//! output.open("default")?;
//!
//! let samples = vec![0i16; 22050];
//! output.play(&AudioTrack::new(&samples, 1, 22050, 22050), 0)?;
//!
//! output.close()?;
//! # Ok::<(), spd_nas::BackendError>(())
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod output;
pub mod playback;
pub mod pump;
pub mod track;
pub mod transport;

// Re-export public types
pub use config::{BackendConfig, ConfigError};
pub use error::{BackendError, Status, TransportError};
pub use output::{AudioOutput, NasOutput};
pub use playback::{PlaybackEnd, StopOutcome};
pub use pump::PumpState;
pub use track::{AudioTrack, Encoding, Gain, SoundFormat};
pub use transport::{Connector, FlowId, LocalConnector, ServerError, Transport};
