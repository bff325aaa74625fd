//! Click feedback
//!
//! Key-down events become triggers on a lock-free single-producer /
//! single-consumer ring ([`ring::TriggerRing`]). A dedicated playback thread
//! ([`engine::AudioEngine`]) drains the ring and restarts the click sample on
//! the output device for every trigger. The capture loop never waits on
//! audio: when the ring is full the new trigger is dropped.
//!
//! The output stream is opened with cpal (PipeWire, PulseAudio or ALSA) and
//! fed by a rodio mixer.
//! [`SinkFactory`] is the seam that lets tests substitute a fake device.

pub mod engine;
pub mod feedback;
pub mod ring;
pub mod sample;

use crate::error::AudioError;
use std::sync::Arc;

pub use engine::{AudioEngine, ClickProducer};
pub use feedback::RodioFactory;
pub use ring::TriggerRing;

/// Immutable PCM click, loaded once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSample {
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved signed 16-bit samples
    pub samples: Arc<[i16]>,
}

impl AudioSample {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<i16>) -> Self {
        Self {
            sample_rate,
            channels,
            samples: samples.into(),
        }
    }

    /// Playback length in milliseconds
    pub fn duration_ms(&self) -> u64 {
        let frames = self.samples.len() as u64 / u64::from(self.channels.max(1));
        frames * 1000 / u64::from(self.sample_rate.max(1))
    }
}

/// An open audio output that can play the click
///
/// Created and used only on the playback thread (cpal output streams are
/// not `Send`).
pub trait ClickSink {
    /// Start the click from its beginning, cutting off any click still playing
    fn play(&mut self, sample: &AudioSample) -> Result<(), AudioError>;
}

/// Opens the audio output device
///
/// Moved onto the playback thread; the daemon holds it until startup.
pub trait SinkFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn ClickSink>, AudioError>;
}
