//! Audio callback, runs on the cpal audio thread.
//!
//! Pulls interleaved stereo blocks from the transport, maps them onto the
//! device's channel layout, and runs the result through the master stage
//! (gain, mute, ceiling). Control messages arrive through the lock-free
//! ring buffer; nothing here blocks.

use std::sync::Arc;

use ringbuf::traits::Consumer;
use ringbuf::HeapCons;

use super::limiter::Limiter;
use super::AudioCommand;
use crate::engine::transport::Transport;

/// State that lives on the audio thread. Accessed only from the callback.
pub struct AudioCallback {
    transport: Arc<Transport>,
    consumer: HeapCons<AudioCommand>,
    /// Stereo staging buffer the transport renders into.
    stereo: Vec<f32>,
    limiter: Limiter,
    channels: u16,
}

impl AudioCallback {
    pub fn new(transport: Arc<Transport>, consumer: HeapCons<AudioCommand>, channels: u16) -> Self {
        Self {
            transport,
            consumer,
            stereo: Vec::new(),
            limiter: Limiter::default(),
            channels,
        }
    }

    /// Called by cpal for each output buffer.
    pub fn process(&mut self, output: &mut [f32]) {
        while let Some(cmd) = self.consumer.try_pop() {
            match cmd {
                AudioCommand::SetMasterVolume(v) => self.limiter.set_gain(v),
                AudioCommand::Mute(m) => self.limiter.set_muted(m),
            }
        }

        // Render even while muted; the master stage zeroes the output but
        // the transport's clock keeps moving.
        let frames = output.len() / self.channels.max(1) as usize;
        if self.stereo.len() < frames * 2 {
            self.stereo.resize(frames * 2, 0.0);
        }
        let stereo = &mut self.stereo[..frames * 2];
        self.transport.render(stereo);

        match self.channels {
            1 => {
                for (frame, out) in output.iter_mut().enumerate() {
                    *out = (stereo[2 * frame] + stereo[2 * frame + 1]) * 0.5;
                }
            }
            n => {
                let n = n as usize;
                for frame in 0..frames {
                    let chunk = &mut output[frame * n..(frame + 1) * n];
                    chunk[0] = stereo[2 * frame];
                    chunk[1] = stereo[2 * frame + 1];
                    for extra in &mut chunk[2..] {
                        *extra = 0.0;
                    }
                }
            }
        }

        self.limiter.process_block(output);
    }
}
