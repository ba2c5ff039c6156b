//! Audio tracks and stream format metadata
//!
//! A track is borrowed from the caller for the duration of one `play()`
//! call. The backend only reads it.

use std::time::Duration;

use crate::error::BackendError;

/// Sample encoding understood by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Signed 16-bit little-endian linear PCM
    LinearSigned16Lsb,
}

/// Raw PCM audio supplied by the caller
///
/// Samples are interleaved: frame `n` occupies
/// `samples[n * num_channels..(n + 1) * num_channels]`.
#[derive(Debug, Clone, Copy)]
pub struct AudioTrack<'a> {
    pub samples: &'a [i16],
    pub num_channels: u16,
    pub sample_rate: u32,
    /// Number of frames (samples per channel)
    pub num_samples: usize,
}

impl<'a> AudioTrack<'a> {
    pub fn new(samples: &'a [i16], num_channels: u16, sample_rate: u32, num_samples: usize) -> Self {
        Self {
            samples,
            num_channels,
            sample_rate,
            num_samples,
        }
    }

    /// Nominal playback duration (`num_samples / sample_rate` seconds)
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.num_samples as f64 / self.sample_rate as f64)
    }

    /// The interleaved samples covered by `num_samples` frames
    pub fn pcm(&self) -> &'a [i16] {
        let samples = self.samples;
        let len = self.num_samples.saturating_mul(self.num_channels as usize);
        &samples[..len.min(samples.len())]
    }
}

/// Format metadata attached to a buffer when a flow is started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoundFormat {
    pub encoding: Encoding,
    pub channels: u16,
    pub sample_rate: u32,
    pub frames: usize,
}

impl SoundFormat {
    /// Describe a track, rejecting ones that can't be played
    pub fn for_track(track: &AudioTrack<'_>) -> Result<Self, BackendError> {
        if track.num_channels == 0 {
            return Err(BackendError::InvalidArgument("track has no channels"));
        }
        if track.sample_rate == 0 {
            return Err(BackendError::InvalidArgument("track sample rate is zero"));
        }
        let needed = track
            .num_samples
            .checked_mul(track.num_channels as usize)
            .ok_or(BackendError::InvalidArgument("track length overflows"))?;
        if track.samples.len() < needed {
            return Err(BackendError::InvalidArgument(
                "sample buffer shorter than num_samples * num_channels",
            ));
        }

        Ok(Self {
            encoding: Encoding::LinearSigned16Lsb,
            channels: track.num_channels,
            sample_rate: track.sample_rate,
            frames: track.num_samples,
        })
    }
}

/// Server gain in 16.16 fixed point (`0x10000` is unity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Gain(pub u32);

impl Gain {
    pub const UNITY: Gain = Gain(0x10000);

    /// Map a volume on the `[-100, 100]` convention onto server gain units.
    ///
    /// The formula `((volume + 100) / 2) * 1500` is kept exactly as the
    /// legacy backend computes it, integer division included.
    pub fn from_volume(volume: i32) -> Self {
        let volume = volume.clamp(-100, 100);
        Gain((((volume + 100) / 2) * 1500) as u32)
    }

    /// Linear amplitude factor
    pub fn factor(self) -> f32 {
        self.0 as f32 / Self::UNITY.0 as f32
    }
}
