//! Click output
//!
//! The output stream is built with cpal directly so stream errors (device
//! unplugged, sound server gone, fatal underrun) reach the playback thread:
//! the error callback marks the stream failed and the next `play` reports
//! it, which makes the engine reopen the device. rodio mixes and resamples
//! the click into the stream.
//!
//! Each click gets a fresh `Sink`; stopping the previous sink cuts off the
//! click that was still playing, so rapid typing restarts the sound instead
//! of queueing it.

use super::{AudioSample, ClickSink, SinkFactory};
use crate::error::AudioError;
use rodio::buffer::SamplesBuffer;
use rodio::dynamic_mixer::{self, DynamicMixer, DynamicMixerController};
use rodio::{Sink, Source};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set from the stream's error callback, checked before every click
#[derive(Debug, Clone, Default)]
struct StreamHealth(Arc<AtomicBool>);

impl StreamHealth {
    fn error_callback(&self) -> impl FnMut(cpal::StreamError) + Send + 'static {
        let failed = self.0.clone();
        move |err| {
            tracing::warn!("Audio stream error: {}", err);
            failed.store(true, Ordering::Release);
        }
    }

    fn check(&self) -> Result<(), AudioError> {
        if self.0.load(Ordering::Acquire) {
            return Err(AudioError::Playback("audio output stream failed".to_string()));
        }
        Ok(())
    }
}

/// Click player bound to the default output device
pub struct RodioSink {
    _stream: cpal::Stream,
    mixer: Arc<DynamicMixerController<f32>>,
    health: StreamHealth,
    volume: f32,
    current: Option<Sink>,
}

impl RodioSink {
    /// Open the default audio output
    pub fn open(volume: f32) -> Result<Self, AudioError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::Unavailable("no default output device".to_string()))?;

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let supported_config = device
            .default_output_config()
            .map_err(|e| AudioError::Unavailable(format!("Failed to query {}: {}", device_name, e)))?;

        let stream_config = cpal::StreamConfig {
            channels: supported_config.channels(),
            sample_rate: supported_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let (controller, mixer) =
            dynamic_mixer::mixer::<f32>(stream_config.channels, stream_config.sample_rate.0);
        let health = StreamHealth::default();
        let err_fn = health.error_callback();

        let stream = match supported_config.sample_format() {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, mixer, err_fn),
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, mixer, err_fn),
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, mixer, err_fn),
            format => {
                return Err(AudioError::Unavailable(format!(
                    "Unsupported output sample format: {:?}",
                    format
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| AudioError::Unavailable(format!("Failed to start audio output: {}", e)))?;

        tracing::debug!(
            "Audio output: {} ({} Hz, {} ch)",
            device_name,
            stream_config.sample_rate.0,
            stream_config.channels
        );

        Ok(Self {
            _stream: stream,
            mixer: controller,
            health,
            volume: volume.clamp(0.0, 1.0),
            current: None,
        })
    }
}

/// Build an output stream that plays whatever the mixer yields
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut mixer: DynamicMixer<f32>,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    use cpal::traits::DeviceTrait;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for out in data.iter_mut() {
                    // Silence while no click is playing
                    let value = mixer.next().unwrap_or(0.0);
                    *out = <T as cpal::FromSample<f32>>::from_sample_(value);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::Unavailable(format!("Failed to build audio output stream: {}", e)))
}

impl ClickSink for RodioSink {
    fn play(&mut self, sample: &AudioSample) -> Result<(), AudioError> {
        self.health.check()?;

        if let Some(previous) = self.current.take() {
            previous.stop();
        }

        let source = SamplesBuffer::new(sample.channels, sample.sample_rate, sample.samples.to_vec())
            .amplify(self.volume);

        let (sink, queue) = Sink::new_idle();
        sink.append(source);
        self.mixer.add(queue);
        self.current = Some(sink);

        Ok(())
    }
}

/// Opens [`RodioSink`]s on the playback thread
#[derive(Debug, Clone, Copy)]
pub struct RodioFactory {
    volume: f32,
}

impl RodioFactory {
    pub fn new(volume: f32) -> Self {
        Self { volume }
    }
}

impl SinkFactory for RodioFactory {
    fn open(&self) -> Result<Box<dyn ClickSink>, AudioError> {
        Ok(Box::new(RodioSink::open(self.volume)?))
    }
}
