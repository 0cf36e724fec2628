//! Audio output: cpal stream, lock-free control queue, master limiter.
//!
//! The engine owns the cpal output stream. Its callback pulls blocks
//! straight from the shared [`Transport`]; the ring buffer carries only
//! control messages (master volume, hard mute) so the audio thread never
//! touches a lock the main thread holds for long.

pub mod callback;
pub mod limiter;

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{
    traits::{Producer, Split},
    HeapRb,
};

pub use limiter::Limiter;

use crate::engine::transport::Transport;
use callback::AudioCallback;

/// Ring buffer capacity (number of control messages).
const RING_BUFFER_CAPACITY: usize = 1024;

/// Control messages for the audio thread.
#[derive(Debug, Clone, Copy)]
pub enum AudioCommand {
    /// Master volume, clamped to `0.0..=1.0` on the audio thread.
    SetMasterVolume(f32),
    /// Hard output mute. Playback time keeps advancing.
    Mute(bool),
}

#[derive(Debug)]
pub enum AudioError {
    /// No audio output device found.
    NoOutputDevice,
    /// Failed to query device configuration.
    DeviceConfig(String),
    /// Failed to build the audio stream.
    StreamBuild(String),
    /// Failed to start the audio stream.
    StreamPlay(String),
    /// Control ring buffer is full.
    BufferFull,
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoOutputDevice => write!(f, "no audio output device found"),
            AudioError::DeviceConfig(e) => write!(f, "device config error: {e}"),
            AudioError::StreamBuild(e) => write!(f, "stream build error: {e}"),
            AudioError::StreamPlay(e) => write!(f, "stream play error: {e}"),
            AudioError::BufferFull => write!(f, "audio control ring buffer is full"),
        }
    }
}

impl std::error::Error for AudioError {}

/// Owns the cpal stream and the control-queue producer. Created on the
/// main thread; the stream callback renders from the transport directly.
pub struct AudioEngine {
    stream: cpal::Stream,
    producer: ringbuf::HeapProd<AudioCommand>,
    sample_rate: u32,
    channels: u16,
}

impl AudioEngine {
    /// Open the default output device at the transport's sample rate.
    pub fn new(transport: Arc<Transport>) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        let channels = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceConfig(e.to_string()))?
            .channels();

        Self::build_with_device(transport, &device, channels)
    }

    fn build_with_device(
        transport: Arc<Transport>,
        device: &cpal::Device,
        channels: u16,
    ) -> Result<Self, AudioError> {
        let sample_rate = transport.sample_rate();
        let (producer, consumer) = HeapRb::<AudioCommand>::new(RING_BUFFER_CAPACITY).split();

        let mut audio_callback = AudioCallback::new(transport, consumer, channels);

        let stream_config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_fn = |err: cpal::StreamError| {
            eprintln!("audio stream error: {err}");
        };

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    audio_callback.process(data);
                },
                err_fn,
                None,
            )
            .map_err(|e| AudioError::StreamBuild(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlay(e.to_string()))?;

        Ok(Self {
            stream,
            producer,
            sample_rate,
            channels,
        })
    }

    pub fn set_master_volume(&mut self, volume: f32) -> Result<(), AudioError> {
        self.producer
            .try_push(AudioCommand::SetMasterVolume(volume))
            .map_err(|_| AudioError::BufferFull)
    }

    pub fn set_muted(&mut self, muted: bool) -> Result<(), AudioError> {
        self.producer
            .try_push(AudioCommand::Mute(muted))
            .map_err(|_| AudioError::BufferFull)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Suspend the device stream itself (distinct from transport pause).
    pub fn pause(&self) -> Result<(), AudioError> {
        self.stream
            .pause()
            .map_err(|e| AudioError::StreamPlay(e.to_string()))
    }

    pub fn resume(&self) -> Result<(), AudioError> {
        self.stream
            .play()
            .map_err(|e| AudioError::StreamPlay(e.to_string()))
    }
}
