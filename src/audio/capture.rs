//! Microphone capture using CPAL (Cross-Platform Audio Library).

use super::format::WaveFormat;
use super::recorder::{CaptureFanout, CaptureSource};
use crate::defaults;
use crate::error::{Result, VoicepipeError};
use crate::pipeline::subscriber::AudioSubscriber;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// CPAL scans ALSA/JACK/PipeWire backends while enumerating devices, and
/// those libraries print harmless but confusing messages.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2.
/// Safe as long as no other thread is concurrently manipulating fd 2.
fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Device name patterns that are never voice inputs.
const FILTERED_PATTERNS: &[&str] = &["surround", "front:", "rear:", "HDMI", "S/PDIF"];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

/// Names of the usable input devices.
pub fn list_devices() -> Result<Vec<String>> {
    let devices = with_suppressed_stderr(|| cpal::default_host().input_devices());
    let devices = devices.map_err(|e| VoicepipeError::AudioCapture {
        message: format!("Failed to enumerate input devices: {}", e),
    })?;

    Ok(devices
        .filter_map(|device| device.name().ok())
        .filter(|name| !should_filter_device(name))
        .collect())
}

fn find_device(name: Option<&str>) -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        match name {
            None => host
                .default_input_device()
                .ok_or_else(|| VoicepipeError::AudioDeviceNotFound {
                    device: "default".to_string(),
                }),
            Some(name) => host
                .input_devices()
                .map_err(|e| VoicepipeError::AudioCapture {
                    message: format!("Failed to enumerate devices: {}", e),
                })?
                .find(|dev| dev.name().is_ok_and(|n| n == name))
                .ok_or_else(|| VoicepipeError::AudioDeviceNotFound {
                    device: name.to_string(),
                }),
        }
    })
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched from the thread that owns the
/// `CpalCaptureSource` (start/stop), never from the data callback.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Microphone capture at the device's native rate, down-mixed to mono.
///
/// The data callback runs on CPAL's audio thread and pushes directly to
/// subscribers; that thread is the pipeline's producer.
pub struct CpalCaptureSource {
    stream: Option<SendableStream>,
    format: Option<WaveFormat>,
    fanout: Arc<CaptureFanout>,
    /// Set by the error callback; drained by `pump`.
    stream_failed: Arc<AtomicBool>,
}

impl CpalCaptureSource {
    pub fn new() -> Self {
        Self {
            stream: None,
            format: None,
            fanout: Arc::new(CaptureFanout::new()),
            stream_failed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn open(&mut self, device_name: Option<&str>) -> Result<WaveFormat> {
        let device = find_device(device_name)?;
        let config = device
            .default_input_config()
            .map_err(|e| VoicepipeError::AudioCapture {
                message: format!("Failed to query default input config: {}", e),
            })?;

        let channels = config.channels() as usize;
        let format = WaveFormat::mono(config.sample_rate().0);
        let stream_config: cpal::StreamConfig = config.clone().into();

        let failed = Arc::clone(&self.stream_failed);
        let err_callback = move |err: cpal::StreamError| {
            tracing::warn!(error = %err, "Audio stream error");
            failed.store(true, Ordering::SeqCst);
        };

        let fanout = Arc::clone(&self.fanout);
        let mut mono = Vec::new();
        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    downmix(data.iter().copied(), channels, &mut mono);
                    fanout.deliver(&mono, format);
                },
                err_callback,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let scaled = data.iter().map(|&s| s as f32 / 32768.0);
                    downmix(scaled, channels, &mut mono);
                    fanout.deliver(&mono, format);
                },
                err_callback,
                None,
            ),
            other => {
                return Err(VoicepipeError::AudioCapture {
                    message: format!("Unsupported native sample format: {:?}", other),
                });
            }
        }
        .map_err(|e| VoicepipeError::AudioCapture {
            message: format!("Failed to build input stream: {}", e),
        })?;

        stream.play().map_err(|e| VoicepipeError::AudioCapture {
            message: format!("Failed to start audio stream: {}", e),
        })?;

        self.stream = Some(SendableStream(stream));
        Ok(format)
    }
}

impl Default for CpalCaptureSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Averages interleaved channels into `out`, reusing its allocation.
fn downmix(samples: impl Iterator<Item = f32>, channels: usize, out: &mut Vec<f32>) {
    out.clear();
    if channels <= 1 {
        out.extend(samples);
        return;
    }
    let mut sum = 0.0;
    for (i, sample) in samples.enumerate() {
        sum += sample;
        if i % channels == channels - 1 {
            out.push(sum / channels as f32);
            sum = 0.0;
        }
    }
}

impl CaptureSource for CpalCaptureSource {
    fn start(&mut self, device: Option<&str>) -> Option<WaveFormat> {
        self.stop();
        self.stream_failed.store(false, Ordering::SeqCst);
        match self.open(device) {
            Ok(format) => {
                tracing::info!(device = device.unwrap_or("default"), format = %format, "Capture started");
                self.format = Some(format);
                Some(format)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to start capture");
                None
            }
        }
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take()
            && let Err(e) = stream.0.pause()
        {
            tracing::debug!(error = %e, "Failed to pause audio stream");
        }
        self.format = None;
    }

    fn is_recording(&self) -> bool {
        self.stream.is_some()
    }

    fn latency(&self) -> Duration {
        Duration::from_millis(defaults::CAPTURE_FRAME_MS)
    }

    fn pump(&mut self) -> bool {
        self.stream_failed.swap(false, Ordering::SeqCst)
    }

    fn subscribe(&self, subscriber: Arc<dyn AudioSubscriber>) {
        self.fanout.subscribe(subscriber);
    }

    fn unsubscribe(&self, subscriber: &Arc<dyn AudioSubscriber>) -> bool {
        self.fanout.unsubscribe(subscriber)
    }
}
