//! WAV file capture source for demos and offline runs.

use super::format::WaveFormat;
use super::recorder::{CaptureFanout, CaptureSource};
use crate::defaults;
use crate::error::{Result, VoicepipeError};
use crate::pipeline::subscriber::AudioSubscriber;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Plays a decoded WAV file as if it were a microphone.
///
/// Every `pump` pushes one capture frame (20ms) to subscribers, so a caller
/// ticking every 20ms plays the file in real time. Samples keep the file's
/// native rate and channel count.
pub struct WavCaptureSource {
    samples: Vec<f32>,
    format: WaveFormat,
    frame_len: usize,
    position: usize,
    looping: bool,
    recording: bool,
    fanout: CaptureFanout,
}

impl WavCaptureSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| VoicepipeError::AudioCapture {
            message: format!("Failed to open {}: {}", path.display(), e),
        })?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Create from any reader (for testing/flexibility).
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut wav_reader =
            hound::WavReader::new(reader).map_err(|e| VoicepipeError::AudioCapture {
                message: format!("Failed to parse WAV file: {}", e),
            })?;

        let spec = wav_reader.spec();
        if spec.channels == 0 || spec.sample_rate == 0 {
            return Err(VoicepipeError::AudioCapture {
                message: format!(
                    "Unsupported WAV layout: {}ch/{}Hz",
                    spec.channels, spec.sample_rate
                ),
            });
        }

        let samples = match spec.sample_format {
            hound::SampleFormat::Float => wav_reader
                .samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>(),
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                wav_reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<Vec<_>, _>>()
            }
        }
        .map_err(|e| VoicepipeError::AudioCapture {
            message: format!("Failed to read WAV samples: {}", e),
        })?;

        let format = WaveFormat::new(spec.sample_rate, spec.channels);
        let frame_len = format.samples_for(Duration::from_millis(defaults::CAPTURE_FRAME_MS));

        tracing::debug!(
            format = %format,
            samples = samples.len(),
            "Loaded WAV capture source"
        );

        Ok(Self {
            samples,
            format,
            frame_len: frame_len.max(format.channels as usize),
            position: 0,
            looping: false,
            recording: false,
            fanout: CaptureFanout::new(),
        })
    }

    /// Restart from the beginning once the file is exhausted.
    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn format(&self) -> WaveFormat {
        self.format
    }

    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() / self.format.channels as usize;
        Duration::from_secs_f64(frames as f64 / self.format.sample_rate as f64)
    }

    /// True once every sample has been pushed (never for a looping source).
    pub fn is_finished(&self) -> bool {
        !self.looping && self.position >= self.samples.len()
    }

    fn next_frame(&mut self) -> Option<&[f32]> {
        if self.position >= self.samples.len() {
            if !self.looping || self.samples.is_empty() {
                return None;
            }
            self.position = 0;
        }
        let start = self.position;
        let end = (start + self.frame_len).min(self.samples.len());
        self.position = end;
        Some(&self.samples[start..end])
    }
}

impl CaptureSource for WavCaptureSource {
    fn start(&mut self, device: Option<&str>) -> Option<WaveFormat> {
        if let Some(name) = device {
            tracing::debug!(device = name, "WAV capture ignores device selection");
        }
        self.recording = true;
        Some(self.format)
    }

    fn stop(&mut self) {
        self.recording = false;
    }

    fn is_recording(&self) -> bool {
        self.recording
    }

    fn latency(&self) -> Duration {
        Duration::ZERO
    }

    fn pump(&mut self) -> bool {
        if !self.recording {
            return false;
        }
        let format = self.format;
        let frame = match self.next_frame() {
            Some(frame) => frame.to_vec(),
            None => return false,
        };
        self.fanout.deliver(&frame, format);
        false
    }

    fn subscribe(&self, subscriber: Arc<dyn AudioSubscriber>) {
        self.fanout.subscribe(subscriber);
    }

    fn unsubscribe(&self, subscriber: &Arc<dyn AudioSubscriber>) -> bool {
        self.fanout.unsubscribe(subscriber)
    }
}
