//! Pull-based sample source, the seam between chained stream stages.

use super::format::WaveFormat;
use std::collections::VecDeque;

/// A stage that yields samples on demand.
///
/// `pull` fills as much of `out` as is currently available and returns the
/// number of samples written. Returning fewer than `out.len()` (including 0)
/// means the source is exhausted for now, not permanently.
pub trait SampleSource: Send {
    fn pull(&mut self, out: &mut [f32]) -> usize;

    fn format(&self) -> WaveFormat;
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn pull(&mut self, out: &mut [f32]) -> usize {
        (**self).pull(out)
    }

    fn format(&self) -> WaveFormat {
        (**self).format()
    }
}

/// Push/pull FIFO of samples.
///
/// Feeds chained stages from data that arrives in bursts, e.g. processed
/// frames entering an output re-conversion stage.
#[derive(Debug, Clone)]
pub struct QueueSource {
    samples: VecDeque<f32>,
    format: WaveFormat,
}

impl QueueSource {
    pub fn new(samples: Vec<f32>, format: WaveFormat) -> Self {
        Self {
            samples: samples.into(),
            format,
        }
    }

    pub fn empty(format: WaveFormat) -> Self {
        Self::new(Vec::new(), format)
    }

    /// Appends more samples after the current end.
    pub fn extend(&mut self, more: &[f32]) {
        self.samples.extend(more.iter().copied());
    }

    pub fn remaining(&self) -> usize {
        self.samples.len()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl SampleSource for QueueSource {
    fn pull(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.samples.len());
        for (slot, sample) in out.iter_mut().zip(self.samples.drain(..n)) {
            *slot = sample;
        }
        n
    }

    fn format(&self) -> WaveFormat {
        self.format
    }
}
