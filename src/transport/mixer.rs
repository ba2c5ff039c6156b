//! Flow table for the local audio server
//!
//! The output callback renders every active flow into the device buffer.
//! A flow that runs out of frames is removed and reported as done.

use cpal::{FromSample, Sample};

use super::FlowId;

/// One flow queued on the server
struct MixFlow {
    id: FlowId,
    /// Interleaved samples, owned by the server
    pcm: Vec<i16>,
    channels: usize,
    /// Next frame to render
    frame: usize,
    frames: usize,
    gain: f32,
}

impl MixFlow {
    fn is_drained(&self) -> bool {
        self.frame >= self.frames
    }

    /// Source sample for an output channel at the current frame
    fn sample(&self, out_channel: usize) -> f32 {
        let base = self.frame * self.channels;
        let value = if out_channel < self.channels {
            self.pcm[base + out_channel]
        } else if self.channels == 1 {
            // Mono feeds every output channel
            self.pcm[base]
        } else {
            0
        };
        value as f32 * self.gain
    }
}

/// Active flows mixed into the output stream
#[derive(Default)]
pub(crate) struct Mixer {
    flows: Vec<MixFlow>,
}

impl Mixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a flow. `pcm` must hold whole frames of `channels` samples.
    pub fn add(&mut self, id: FlowId, pcm: Vec<i16>, channels: u16, gain: f32) {
        let channels = channels.max(1) as usize;
        let frames = pcm.len() / channels;
        self.flows.push(MixFlow {
            id,
            pcm,
            channels,
            frame: 0,
            frames,
            gain,
        });
    }

    /// Drop a flow before it finishes. Returns false for unknown ids.
    pub fn remove(&mut self, id: FlowId) -> bool {
        let before = self.flows.len();
        self.flows.retain(|flow| flow.id != id);
        self.flows.len() != before
    }

    /// Drop every flow, passing each id to `done`
    pub fn clear(&mut self, mut done: impl FnMut(FlowId)) {
        for flow in self.flows.drain(..) {
            done(flow.id);
        }
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.flows.is_empty()
    }

    /// Render interleaved frames for `out_channels` outputs.
    ///
    /// Flows that drain during this buffer are removed and passed to `done`.
    pub fn render<T: Sample + FromSample<i16>>(
        &mut self,
        out: &mut [T],
        out_channels: usize,
        mut done: impl FnMut(FlowId),
    ) {
        let out_channels = out_channels.max(1);

        for frame in out.chunks_mut(out_channels) {
            for (channel, sample) in frame.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                for flow in self.flows.iter().filter(|f| !f.is_drained()) {
                    acc += flow.sample(channel);
                }
                let clipped = acc.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                *sample = T::from_sample(clipped);
            }

            for flow in self.flows.iter_mut().filter(|f| !f.is_drained()) {
                flow.frame += 1;
            }
        }

        self.flows.retain(|flow| {
            if flow.is_drained() {
                done(flow.id);
                false
            } else {
                true
            }
        });
    }
}
