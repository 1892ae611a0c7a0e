//! Diagnostics recording of processed audio.

use super::subscriber::AudioSubscriber;
use crate::audio::format::WaveFormat;
use crate::error::{Result, VoicepipeError};
use parking_lot::Mutex;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

type Writer = hound::WavWriter<BufWriter<File>>;

/// Audio subscriber that writes every frame it receives to a WAV file.
///
/// Samples are stored as 32-bit float. Resets are ignored so a single file
/// covers the whole life of one pipeline.
pub struct WavRecorder {
    path: PathBuf,
    format: WaveFormat,
    writer: Mutex<Option<Writer>>,
    samples_written: AtomicU64,
}

impl WavRecorder {
    pub fn create(path: &Path, format: WaveFormat) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(path, spec).map_err(|e| wav_error(path, e))?;
        tracing::info!(path = %path.display(), format = %format, "Recording processed audio");
        Ok(Self {
            path: path.to_path_buf(),
            format,
            writer: Mutex::new(Some(writer)),
            samples_written: AtomicU64::new(0),
        })
    }

    /// Creates a uniquely named recording inside `dir`, creating the
    /// directory if needed.
    pub fn create_in(dir: &Path, format: WaveFormat) -> Result<Self> {
        static SEQUENCE: AtomicU64 = AtomicU64::new(0);

        std::fs::create_dir_all(dir)?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("preprocessed-{millis}-{seq}.wav"));
        Self::create(&path, format)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written.load(Ordering::Relaxed)
    }

    /// Flushes the header and closes the file. Later frames are dropped.
    pub fn finalize(&self) -> Result<()> {
        match self.writer.lock().take() {
            Some(writer) => writer.finalize().map_err(|e| wav_error(&self.path, e)),
            None => Ok(()),
        }
    }
}

fn wav_error(path: &Path, e: hound::Error) -> VoicepipeError {
    VoicepipeError::Other(format!("WAV recording {}: {}", path.display(), e))
}

impl AudioSubscriber for WavRecorder {
    fn receive(&self, frame: &[f32], format: WaveFormat) -> Result<()> {
        if format != self.format {
            return Err(VoicepipeError::format_mismatch(self.format, format));
        }
        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };
        for &sample in frame {
            writer
                .write_sample(sample)
                .map_err(|e| wav_error(&self.path, e))?;
        }
        self.samples_written
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &str {
        "wav-recorder"
    }
}

impl Drop for WavRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            tracing::warn!(error = %e, "Failed to finalize diagnostics recording");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_frames_to_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let recorder = WavRecorder::create(&path, WaveFormat::mono(48000)).unwrap();

        recorder
            .receive(&[0.25; 480], WaveFormat::mono(48000))
            .unwrap();
        recorder
            .receive(&[-0.5; 480], WaveFormat::mono(48000))
            .unwrap();
        assert_eq!(recorder.samples_written(), 960);
        recorder.finalize().unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 48000);
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 960);
        assert_eq!(samples[0], 0.25);
        assert_eq!(samples[959], -0.5);
    }

    #[test]
    fn test_rejects_other_format() {
        let dir = tempfile::tempdir().unwrap();
        let recorder =
            WavRecorder::create(&dir.path().join("out.wav"), WaveFormat::mono(48000)).unwrap();
        assert!(recorder.receive(&[0.0; 4], WaveFormat::mono(16000)).is_err());
    }

    #[test]
    fn test_create_in_makes_unique_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("diag");
        let a = WavRecorder::create_in(&nested, WaveFormat::mono(16000)).unwrap();
        let b = WavRecorder::create_in(&nested, WaveFormat::mono(16000)).unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(&nested));
    }

    #[test]
    fn test_frames_after_finalize_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let recorder =
            WavRecorder::create(&dir.path().join("out.wav"), WaveFormat::mono(48000)).unwrap();
        recorder.finalize().unwrap();
        recorder.receive(&[0.1; 4], WaveFormat::mono(48000)).unwrap();
        assert_eq!(recorder.samples_written(), 0);
    }
}
