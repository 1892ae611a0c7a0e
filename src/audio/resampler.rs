//! Streaming sample-rate conversion over a pull source.
//!
//! Equal rates pass straight through. Otherwise input is gathered in 10ms
//! chunks and run through a windowed-sinc resampler; converted samples are
//! queued until the caller pulls them.

use super::format::WaveFormat;
use super::source::SampleSource;
use crate::error::{Result, VoicepipeError};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::collections::VecDeque;

/// Sinc filter length. Short enough for per-frame realtime use.
const SINC_LEN: usize = 64;
const OVERSAMPLING_FACTOR: usize = 256;

/// Converts an upstream source to `output_rate`, keeping its channel count.
pub struct RateConverter<S> {
    source: S,
    output_format: WaveFormat,
    sinc: Option<SincStage>,
}

struct SincStage {
    resampler: SincFixedIn<f32>,
    channels: usize,
    /// Input frames (per channel) consumed per resampler call.
    chunk_frames: usize,
    /// Interleaved input still short of a full chunk.
    pending: Vec<f32>,
    planar_in: Vec<Vec<f32>>,
    planar_out: Vec<Vec<f32>>,
    /// Interleaved converted samples waiting to be pulled.
    ready: VecDeque<f32>,
}

impl<S: SampleSource> RateConverter<S> {
    pub fn new(source: S, output_rate: u32) -> Result<Self> {
        let input = source.format();
        if input.sample_rate == 0 || output_rate == 0 || input.channels == 0 {
            return Err(VoicepipeError::Resampler {
                message: format!("cannot convert {} to {}Hz", input, output_rate),
            });
        }
        let output_format = WaveFormat::new(output_rate, input.channels);
        let sinc = if input.sample_rate == output_rate {
            None
        } else {
            Some(SincStage::new(input, output_rate)?)
        };
        Ok(Self {
            source,
            output_format,
            sinc,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.sinc.is_none()
    }

    /// Drops filter history and any queued input or output.
    ///
    /// Required whenever the upstream stream is discontinuous.
    pub fn reset(&mut self) {
        if let Some(sinc) = self.sinc.as_mut() {
            sinc.reset();
        }
    }

    /// Drains the source and pushes a partial input chunk through the
    /// filter, padded with silence, so its samples can be pulled.
    ///
    /// Use only at end of stream; the padding becomes part of the output.
    pub fn flush(&mut self) {
        if let Some(sinc) = self.sinc.as_mut() {
            sinc.flush(&mut self.source);
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.source
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

impl<S: SampleSource> SampleSource for RateConverter<S> {
    fn pull(&mut self, out: &mut [f32]) -> usize {
        match self.sinc.as_mut() {
            None => self.source.pull(out),
            Some(sinc) => sinc.pull(&mut self.source, out),
        }
    }

    fn format(&self) -> WaveFormat {
        self.output_format
    }
}

impl SincStage {
    fn new(input: WaveFormat, output_rate: u32) -> Result<Self> {
        let ratio = output_rate as f64 / input.sample_rate as f64;
        let channels = input.channels as usize;
        let chunk_frames = (input.sample_rate as usize / 100).max(1);

        let params = SincInterpolationParameters {
            sinc_len: SINC_LEN,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: OVERSAMPLING_FACTOR,
            window: WindowFunction::BlackmanHarris2,
        };
        let resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, chunk_frames, channels)
            .map_err(|e| VoicepipeError::Resampler {
                message: format!("{}Hz -> {}Hz: {}", input.sample_rate, output_rate, e),
            })?;
        let planar_in = resampler.input_buffer_allocate(true);
        let planar_out = resampler.output_buffer_allocate(true);

        tracing::debug!(
            from = input.sample_rate,
            to = output_rate,
            channels,
            chunk_frames,
            "Created sinc rate converter"
        );

        Ok(Self {
            resampler,
            channels,
            chunk_frames,
            pending: Vec::with_capacity(chunk_frames * channels),
            planar_in,
            planar_out,
            ready: VecDeque::new(),
        })
    }

    fn pull<S: SampleSource>(&mut self, source: &mut S, out: &mut [f32]) -> usize {
        let chunk_samples = self.chunk_frames * self.channels;
        while self.ready.len() < out.len() {
            let have = self.pending.len();
            self.pending.resize(chunk_samples, 0.0);
            let got = source.pull(&mut self.pending[have..]);
            self.pending.truncate(have + got);
            if self.pending.len() < chunk_samples {
                break;
            }
            if !self.convert_pending() {
                break;
            }
        }

        let n = out.len().min(self.ready.len());
        for (slot, sample) in out.iter_mut().zip(self.ready.drain(..n)) {
            *slot = sample;
        }
        n
    }

    fn flush<S: SampleSource>(&mut self, source: &mut S) {
        let chunk_samples = self.chunk_frames * self.channels;
        loop {
            let have = self.pending.len();
            self.pending.resize(chunk_samples, 0.0);
            let got = source.pull(&mut self.pending[have..]);
            self.pending.truncate(have + got);
            if self.pending.len() < chunk_samples {
                break;
            }
            if !self.convert_pending() {
                return;
            }
        }
        if !self.pending.is_empty() {
            self.pending.resize(chunk_samples, 0.0);
            self.convert_pending();
        }
    }

    /// Runs one full chunk through the resampler. False if rubato rejected it.
    fn convert_pending(&mut self) -> bool {
        for (channel, planar) in self.planar_in.iter_mut().enumerate() {
            planar.clear();
            planar.extend(
                self.pending
                    .iter()
                    .skip(channel)
                    .step_by(self.channels)
                    .copied(),
            );
        }
        self.pending.clear();

        match self
            .resampler
            .process_into_buffer(&self.planar_in, &mut self.planar_out, None)
        {
            Ok((_, produced)) => {
                for frame in 0..produced {
                    for planar in &self.planar_out {
                        self.ready.push_back(planar[frame]);
                    }
                }
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rate converter rejected chunk");
                false
            }
        }
    }

    fn reset(&mut self) {
        self.resampler.reset();
        self.pending.clear();
        self.ready.clear();
    }
}
