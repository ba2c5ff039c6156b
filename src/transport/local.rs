//! Local audio server - plays flows on a cpal output device
//!
//! cpal streams may be `!Send`, so a dedicated server thread owns the device
//! and its output stream. Callers talk to it through a request channel; the
//! stream callbacks post server events (finished flows, stream errors) on an
//! event channel that `process_events()` drains.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, FromSample, Sample, SampleFormat, SampleRate, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use super::mixer::Mixer;
use super::{log_server_error, Connector, ErrorSink, FlowId, ServerError, Transport};
use crate::config::BackendConfig;
use crate::error::TransportError;
use crate::track::{Gain, SoundFormat};

/// Error code reported when the output device disappears
const ERROR_DEVICE_NOT_AVAILABLE: u32 = 1;
/// Error code for any other backend-specific stream failure
const ERROR_BACKEND_SPECIFIC: u32 = 2;

/// Which output device an endpoint names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    /// The host's default output device
    Default,
    /// First device whose name contains this text (case-insensitive)
    Named(String),
}

impl DeviceSelector {
    pub fn parse(endpoint: &str) -> Self {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() || endpoint.eq_ignore_ascii_case("default") {
            DeviceSelector::Default
        } else {
            DeviceSelector::Named(endpoint.to_string())
        }
    }

    pub fn matches(&self, device_name: &str) -> bool {
        match self {
            DeviceSelector::Default => true,
            DeviceSelector::Named(needle) => device_name
                .to_lowercase()
                .contains(&needle.to_lowercase()),
        }
    }
}

/// Opens sessions with the local audio server
#[derive(Debug, Clone, Default)]
pub struct LocalConnector {
    /// Fixed output buffer size (None = device default)
    pub buffer_frames: Option<u32>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            buffer_frames: config.stream_buffer_frames,
        }
    }
}

impl Connector for LocalConnector {
    type Transport = LocalTransport;

    fn connect(&self, endpoint: &str) -> Result<LocalTransport, TransportError> {
        let selector = DeviceSelector::parse(endpoint);
        let buffer_frames = self.buffer_frames;

        let (request_tx, request_rx) = unbounded::<Request>();
        let (event_tx, event_rx) = unbounded::<ServerEvent>();
        let (init_tx, init_rx) = bounded::<Result<String, TransportError>>(1);

        let mixer = Arc::new(Mutex::new(Mixer::new()));
        let server_mixer = Arc::clone(&mixer);

        let server = thread::Builder::new()
            .name("nas-server".to_string())
            .spawn(move || {
                let device = match find_device(&selector) {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
                let _ = init_tx.send(Ok(name));

                AudioServer::new(device, buffer_frames, event_tx, server_mixer).run(request_rx);
            })
            .map_err(|e| TransportError::Device(format!("Failed to spawn server thread: {}", e)))?;

        // Wait for the server to find its device
        let device_name = match init_rx.recv() {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                let _ = server.join();
                return Err(e);
            }
            Err(_) => {
                let _ = server.join();
                return Err(TransportError::Device(
                    "Server thread terminated during init".to_string(),
                ));
            }
        };

        log::info!("Local audio server running on {}", device_name);

        Ok(LocalTransport {
            requests: request_tx,
            events: event_rx,
            mixer,
            error_sink: Mutex::new(None),
            next_flow: AtomicU32::new(1),
            server: Mutex::new(Some(server)),
            device_name,
        })
    }
}

/// Resolve an output device on the default host
fn find_device(selector: &DeviceSelector) -> Result<cpal::Device, TransportError> {
    let host = cpal::default_host();

    match selector {
        DeviceSelector::Default => host
            .default_output_device()
            .ok_or_else(|| TransportError::Unreachable("no default output device".to_string())),
        DeviceSelector::Named(name) => host
            .output_devices()
            .map_err(|e| TransportError::Device(e.to_string()))?
            .find(|device| device.name().map(|n| selector.matches(&n)).unwrap_or(false))
            .ok_or_else(|| TransportError::Unreachable(name.clone())),
    }
}

/// Requests handled on the server thread
enum Request {
    StartFlow {
        id: FlowId,
        pcm: Vec<i16>,
        format: SoundFormat,
        gain: Gain,
        reply: Sender<Result<(), TransportError>>,
    },
    Shutdown,
}

/// Events posted by the output stream
enum ServerEvent {
    FlowDone(FlowId),
    Error(ServerError),
}

/// An open session with the local audio server
pub struct LocalTransport {
    requests: Sender<Request>,
    events: Receiver<ServerEvent>,
    mixer: Arc<Mutex<Mixer>>,
    error_sink: Mutex<Option<ErrorSink>>,
    next_flow: AtomicU32,
    server: Mutex<Option<JoinHandle<()>>>,
    device_name: String,
}

impl LocalTransport {
    /// Name of the output device the server plays on
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::FlowDone(flow) => {
                log::debug!("Flow {} finished", flow);
            }
            ServerEvent::Error(error) => {
                let sink = self.error_sink.lock().unwrap_or_else(PoisonError::into_inner);
                match sink.as_ref() {
                    Some(sink) => sink(&error),
                    None => log_server_error(&error),
                }
            }
        }
    }

    fn shutdown_server(&self) -> Result<(), TransportError> {
        let server = self
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::Closed)?;

        let _ = self.requests.send(Request::Shutdown);
        server
            .join()
            .map_err(|_| TransportError::Device("Server thread panicked".to_string()))
    }
}

impl Transport for LocalTransport {
    fn set_error_sink(&self, sink: ErrorSink) {
        *self.error_sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    fn process_events(&self, timeout: Duration) -> Result<usize, TransportError> {
        let first = match self.events.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => return Ok(0),
            Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
        };

        let mut handled = 0;
        for event in std::iter::once(first).chain(self.events.try_iter()) {
            self.handle_event(event);
            handled += 1;
        }
        Ok(handled)
    }

    fn start_flow(&self, pcm: &[i16], format: &SoundFormat, gain: Gain) -> Result<FlowId, TransportError> {
        let id = FlowId::new(self.next_flow.fetch_add(1, Ordering::Relaxed))
            .ok_or_else(|| TransportError::Rejected("flow ids exhausted".to_string()))?;

        let (reply_tx, reply_rx) = bounded(1);
        self.requests
            .send(Request::StartFlow {
                id,
                pcm: pcm.to_vec(),
                format: *format,
                gain,
                reply: reply_tx,
            })
            .map_err(|_| TransportError::Closed)?;

        reply_rx.recv().map_err(|_| TransportError::Closed)??;

        log::debug!(
            "Started flow {} ({} frames, {} ch, {} Hz, gain {:#x})",
            id,
            format.frames,
            format.channels,
            format.sample_rate,
            gain.0
        );
        Ok(id)
    }

    fn stop_flow(&self, flow: FlowId) -> Result<(), TransportError> {
        let removed = self.mixer.lock().unwrap_or_else(PoisonError::into_inner).remove(flow);
        if removed {
            log::debug!("Stopped flow {}", flow);
        } else {
            log::debug!("Flow {} already finished", flow);
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.shutdown_server()?;
        log::info!("Disconnected from local audio server on {}", self.device_name);
        Ok(())
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_server();
    }
}

/// Channel layout and rate of an output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamShape {
    channels: u16,
    sample_rate: u32,
}

impl StreamShape {
    fn of(format: &SoundFormat) -> Self {
        Self {
            channels: format.channels,
            sample_rate: format.sample_rate,
        }
    }
}

/// Output stream currently open on the device
struct OpenStream {
    /// Keeps the stream alive
    _stream: cpal::Stream,
    shape: StreamShape,
    /// Raised by the error callback. A failed stream may never call its
    /// output callback again, so nothing queued on it would drain.
    failed: Arc<AtomicBool>,
}

/// Whether the current stream (its shape and failed flag) can take a flow
fn can_reuse(current: Option<(StreamShape, bool)>, wanted: StreamShape) -> bool {
    matches!(current, Some((shape, false)) if shape == wanted)
}

/// Drop every flow still queued, posting `FlowDone` for each.
///
/// Only one flow plays at a time, so whatever is left when the stream has
/// to be reopened is either a tail already past its nominal end or stuck
/// on a dead stream.
///
/// # Returns
/// The number of flows dropped
fn release_tails(mixer: &Mutex<Mixer>, events: &Sender<ServerEvent>) -> usize {
    let mut dropped = 0;
    mixer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear(|flow| {
            dropped += 1;
            let _ = events.send(ServerEvent::FlowDone(flow));
        });
    dropped
}

/// State owned by the server thread
struct AudioServer {
    device: cpal::Device,
    buffer_frames: Option<u32>,
    events: Sender<ServerEvent>,
    mixer: Arc<Mutex<Mixer>>,
    stream: Option<OpenStream>,
    error_serial: Arc<AtomicU64>,
}

impl AudioServer {
    fn new(
        device: cpal::Device,
        buffer_frames: Option<u32>,
        events: Sender<ServerEvent>,
        mixer: Arc<Mutex<Mixer>>,
    ) -> Self {
        Self {
            device,
            buffer_frames,
            events,
            mixer,
            stream: None,
            error_serial: Arc::new(AtomicU64::new(0)),
        }
    }

    fn run(mut self, requests: Receiver<Request>) {
        for request in requests.iter() {
            match request {
                Request::StartFlow {
                    id,
                    pcm,
                    format,
                    gain,
                    reply,
                } => {
                    let result = self.start_flow(id, pcm, &format, gain);
                    let _ = reply.send(result);
                }
                Request::Shutdown => break,
            }
        }

        self.stream = None;
        log::debug!("Local audio server stopped");
    }

    fn start_flow(
        &mut self,
        id: FlowId,
        pcm: Vec<i16>,
        format: &SoundFormat,
        gain: Gain,
    ) -> Result<(), TransportError> {
        let wanted = StreamShape::of(format);
        let current = self
            .stream
            .as_ref()
            .map(|s| (s.shape, s.failed.load(Ordering::Acquire)));

        if !can_reuse(current, wanted) {
            if let Some((_, true)) = current {
                log::warn!("Output stream failed, reopening it");
            }

            // Release the device before reopening it. With the stream gone
            // the callback can't race the tail cleanup.
            self.stream = None;
            let dropped = release_tails(&self.mixer, &self.events);
            if dropped > 0 {
                log::debug!("Dropped {} flow tail(s) before reopening the stream", dropped);
            }

            self.stream = Some(self.open_stream(wanted)?);
        }

        self.lock_mixer().add(id, pcm, format.channels, gain.factor());
        Ok(())
    }

    fn lock_mixer(&self) -> std::sync::MutexGuard<'_, Mixer> {
        self.mixer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open an output stream able to play `channels` at `sample_rate`.
    ///
    /// Prefers an exact channel match; otherwise takes a wider layout and
    /// lets the mixer fill the extra channels.
    fn open_stream(&self, shape: StreamShape) -> Result<OpenStream, TransportError> {
        let StreamShape {
            channels,
            sample_rate,
        } = shape;
        let unsupported = || TransportError::UnsupportedFormat {
            channels,
            sample_rate,
        };

        let ranges: Vec<_> = self
            .device
            .supported_output_configs()
            .map_err(|e| TransportError::Device(e.to_string()))?
            .filter(|range| {
                range.min_sample_rate().0 <= sample_rate && sample_rate <= range.max_sample_rate().0
            })
            .collect();

        let range = ranges
            .iter()
            .find(|range| range.channels() == channels)
            .or_else(|| ranges.iter().find(|range| range.channels() > channels))
            .cloned()
            .ok_or_else(unsupported)?;

        let supported = range.with_sample_rate(SampleRate(sample_rate));
        let sample_format = supported.sample_format();
        let mut config: StreamConfig = supported.config();
        if let Some(frames) = self.buffer_frames {
            config.buffer_size = BufferSize::Fixed(frames);
        }

        log::info!("Opening output stream: {:?} ({:?})", config, sample_format);

        let failed = Arc::new(AtomicBool::new(false));
        let stream = match sample_format {
            SampleFormat::F32 => self.build_stream::<f32>(&config, &failed)?,
            SampleFormat::I16 => self.build_stream::<i16>(&config, &failed)?,
            SampleFormat::U16 => self.build_stream::<u16>(&config, &failed)?,
            format => {
                log::error!("Unsupported sample format: {:?}", format);
                return Err(unsupported());
            }
        };

        stream
            .play()
            .map_err(|e| TransportError::Device(format!("Failed to start stream: {}", e)))?;

        Ok(OpenStream {
            _stream: stream,
            shape,
            failed,
        })
    }

    fn build_stream<T>(
        &self,
        config: &StreamConfig,
        failed: &Arc<AtomicBool>,
    ) -> Result<cpal::Stream, TransportError>
    where
        T: SizedSample + FromSample<i16>,
    {
        let channels = config.channels as usize;
        let mixer = Arc::clone(&self.mixer);
        let done_events = self.events.clone();
        let error_events = self.events.clone();
        let serial = Arc::clone(&self.error_serial);
        let failed = Arc::clone(failed);

        self.device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    write_flows(data, channels, &mixer, &done_events);
                },
                move |err| {
                    log::warn!("Audio stream error: {}", err);
                    failed.store(true, Ordering::Release);
                    let error = ServerError {
                        serial: serial.fetch_add(1, Ordering::Relaxed) + 1,
                        error_code: match err {
                            cpal::StreamError::DeviceNotAvailable => ERROR_DEVICE_NOT_AVAILABLE,
                            _ => ERROR_BACKEND_SPECIFIC,
                        },
                        ..Default::default()
                    };
                    let _ = error_events.send(ServerEvent::Error(error));
                },
                None,
            )
            .map_err(|e| TransportError::Device(format!("Failed to build stream: {}", e)))
    }
}

/// Fill a device buffer from the flow table
///
/// Never blocks the audio thread: if the table is busy the buffer is
/// filled with silence.
fn write_flows<T: Sample + FromSample<i16>>(
    data: &mut [T],
    channels: usize,
    mixer: &Mutex<Mixer>,
    events: &Sender<ServerEvent>,
) {
    match mixer.try_lock() {
        Ok(mut mixer) => mixer.render(data, channels, |flow| {
            let _ = events.send(ServerEvent::FlowDone(flow));
        }),
        Err(_) => {
            for sample in data.iter_mut() {
                *sample = T::EQUILIBRIUM;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_parse() {
        assert_eq!(DeviceSelector::parse(""), DeviceSelector::Default);
        assert_eq!(DeviceSelector::parse(" Default "), DeviceSelector::Default);
        assert_eq!(
            DeviceSelector::parse("USB Audio"),
            DeviceSelector::Named("USB Audio".to_string())
        );
    }

    #[test]
    fn test_selector_matches_case_insensitive_substring() {
        let selector = DeviceSelector::parse("usb");
        assert!(selector.matches("Generic USB Audio Device"));
        assert!(!selector.matches("HDA Intel PCH"));
        assert!(DeviceSelector::Default.matches("anything"));
    }

    #[test]
    fn test_connector_from_config() {
        let config = BackendConfig {
            stream_buffer_frames: Some(256),
            ..Default::default()
        };
        assert_eq!(LocalConnector::from_config(&config).buffer_frames, Some(256));
    }

    #[test]
    fn test_write_flows_reports_finished_flows() {
        let mixer = Mutex::new(Mixer::new());
        let flow = FlowId::new(4).unwrap();
        mixer.lock().unwrap().add(flow, vec![10, 20], 1, 1.0);
        let (tx, rx) = unbounded();

        let mut out = [0i16; 4];
        write_flows(&mut out, 1, &mixer, &tx);

        assert_eq!(out, [10, 20, 0, 0]);
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::FlowDone(id)) if id == flow));
    }

    #[test]
    fn test_stream_reuse() {
        let mono = StreamShape {
            channels: 1,
            sample_rate: 22050,
        };
        let other_rate = StreamShape {
            channels: 1,
            sample_rate: 16000,
        };

        assert!(can_reuse(Some((mono, false)), mono));
        // Format change needs a new stream
        assert!(!can_reuse(Some((mono, false)), other_rate));
        // So does a stream that reported an error
        assert!(!can_reuse(Some((mono, true)), mono));
        assert!(!can_reuse(None, mono));
    }

    #[test]
    fn test_release_tails_before_format_change() {
        // A clip whose nominal duration has passed but whose last device
        // buffer hasn't been rendered yet
        let mixer = Mutex::new(Mixer::new());
        let tail = FlowId::new(1).unwrap();
        mixer.lock().unwrap().add(tail, vec![100; 64], 1, 1.0);
        let (tx, rx) = unbounded();

        assert_eq!(release_tails(&mixer, &tx), 1);
        assert!(mixer.lock().unwrap().is_idle());
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::FlowDone(id)) if id == tail));

        // Nothing left: no more events
        assert_eq!(release_tails(&mixer, &tx), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_release_tails_empties_stuck_table() {
        // Flows queued on a dead stream never drain by themselves
        let mixer = Mutex::new(Mixer::new());
        for raw in 1..=3 {
            mixer.lock().unwrap().add(FlowId::new(raw).unwrap(), vec![0; 8], 2, 1.0);
        }
        let (tx, rx) = unbounded();

        assert_eq!(release_tails(&mixer, &tx), 3);
        assert!(mixer.lock().unwrap().is_idle());
        assert_eq!(rx.try_iter().count(), 3);
    }

    #[test]
    fn test_write_flows_outputs_silence_while_table_is_locked() {
        let mixer = Mutex::new(Mixer::new());
        mixer.lock().unwrap().add(FlowId::new(1).unwrap(), vec![1000; 8], 1, 1.0);
        let (tx, rx) = unbounded();

        let _guard = mixer.lock().unwrap();
        let mut out = [5i16; 4];
        write_flows(&mut out, 1, &mixer, &tx);

        assert_eq!(out, [0; 4]);
        assert!(rx.try_recv().is_err());
    }
}
