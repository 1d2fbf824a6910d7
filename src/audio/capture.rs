//! Microphone capture via cpal.
//!
//! Opens the default (or named) input device at its native sample rate,
//! downmixes to mono and resamples to 16 kHz in the stream callback, and
//! hands out fixed 1280-sample frames through the `FrameStream` pull
//! interface. Frames are assembled from a lock-free ring buffer written by
//! the cpal callback thread.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use tracing::{error, info};

use super::ring_buffer::{sample_ring_buffer, SampleConsumer};
use super::{
    AudioFrame, CaptureError, FrameReadError, FrameSource, FrameStream, FRAME_SAMPLES,
    TARGET_SAMPLE_RATE,
};

/// Sleep between ring-buffer polls while assembling a frame.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Production microphone source. Each `open` builds a fresh cpal input
/// stream, so the device can be closed by one owner and reopened by the
/// next during a handoff.
pub struct CpalFrameSource {
    device_name: Option<String>,
    frame_samples: usize,
}

impl CpalFrameSource {
    /// `device_name` of `None` uses the system default input.
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            frame_samples: FRAME_SAMPLES,
        }
    }
}

impl FrameSource for CpalFrameSource {
    fn open(&self) -> Result<Box<dyn FrameStream>, CaptureError> {
        let stream = CpalFrameStream::open(self.device_name.as_deref(), self.frame_samples)?;
        Ok(Box::new(stream))
    }
}

/// Resolved info about the audio input we will use.
struct CaptureConfig {
    device: cpal::Device,
    stream_config: StreamConfig,
    native_rate: u32,
}

/// Find and configure the input device.
fn resolve_device(device_name: Option<&str>) -> Result<CaptureConfig, CaptureError> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| CaptureError::DeviceUnavailable(format!("enumerate failed: {e}")))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| CaptureError::DeviceUnavailable(format!("device not found: {name}")))?
    } else {
        host.default_input_device().ok_or(CaptureError::NoDevice)?
    };

    let dev_name = device.name().unwrap_or_else(|_| "unknown".into());
    info!(device = %dev_name, "selected input device");

    let default_config = device
        .default_input_config()
        .map_err(|e| CaptureError::DeviceUnavailable(format!("no input config: {e}")))?;

    let native_rate = default_config.sample_rate().0;
    let channels = default_config.channels();

    // We always request f32 format at the device's native rate and resample
    // ourselves; asking the driver for 16 kHz directly fails on many devices.
    let stream_config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(native_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    info!(
        native_rate,
        channels,
        "input device config (will resample to {}Hz mono if needed)",
        TARGET_SAMPLE_RATE,
    );

    Ok(CaptureConfig {
        device,
        stream_config,
        native_rate,
    })
}

/// Simple linear resampler from `from_rate` to `to_rate`.
/// Operates on mono f32 samples.
fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let frac = (src_idx - idx0 as f64) as f32;
        let s0 = input.get(idx0).copied().unwrap_or(0.0);
        let s1 = input.get(idx0 + 1).copied().unwrap_or(s0);
        output.push(s0 + frac * (s1 - s0));
    }
    output
}

/// Down-mix multi-channel audio to mono by averaging channels.
fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// An open cpal input stream plus the consumer half of its ring buffer.
struct CpalFrameStream {
    // Held only to keep the stream alive; dropping it stops capture.
    _stream: Stream,
    consumer: SampleConsumer,
    frame_samples: usize,
    error: Arc<Mutex<Option<String>>>,
}

impl CpalFrameStream {
    fn open(device_name: Option<&str>, frame_samples: usize) -> Result<Self, CaptureError> {
        let cfg = resolve_device(device_name)?;
        let native_rate = cfg.native_rate;
        let channels = cfg.stream_config.channels;
        let needs_resample = native_rate != TARGET_SAMPLE_RATE;
        let needs_downmix = channels > 1;

        let (mut producer, consumer) = sample_ring_buffer(None);

        let error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let error_sink = Arc::clone(&error);

        let stream = cfg
            .device
            .build_input_stream(
                &cfg.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = if needs_downmix {
                        to_mono(data, channels)
                    } else {
                        data.to_vec()
                    };

                    let resampled = if needs_resample {
                        resample_linear(&mono, native_rate, TARGET_SAMPLE_RATE)
                    } else {
                        mono
                    };

                    let written = producer.push_slice(&resampled);
                    if written < resampled.len() {
                        // Ring buffer full — oldest audio is lost and the
                        // consumer will catch up.
                    }
                },
                move |err| {
                    error!("audio input stream error: {}", err);
                    let mut slot = error_sink.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(err.to_string());
                    }
                },
                None, // no timeout
            )
            .map_err(|e| CaptureError::StreamBuild(e.to_string()))?;

        stream
            .play()
            .map_err(|e| CaptureError::StreamBuild(format!("failed to start stream: {e}")))?;

        info!("audio capture started");

        Ok(Self {
            _stream: stream,
            consumer,
            frame_samples,
            error,
        })
    }
}

impl FrameStream for CpalFrameStream {
    fn read_frame(&mut self, timeout: Duration) -> Result<AudioFrame, FrameReadError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.error.lock().unwrap().take() {
                return Err(FrameReadError::Fatal(message));
            }

            if self.consumer.available() >= self.frame_samples {
                let mut samples = vec![0.0f32; self.frame_samples];
                let read = self.consumer.pop_slice(&mut samples);
                samples.truncate(read);
                return Ok(AudioFrame::new(samples, TARGET_SAMPLE_RATE));
            }

            if Instant::now() >= deadline {
                return Err(FrameReadError::TimedOut);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
