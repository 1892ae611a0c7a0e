//! Bounded single-producer/single-consumer sample buffer.
//!
//! The producer half never blocks: `write` copies whatever fits and reports
//! how much that was, leaving the caller to account for the rest. The
//! consumer half only hands out complete reads.

use super::format::WaveFormat;
use super::source::SampleSource;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Fixed-capacity sample ring, split into a writer and a reader.
pub struct SampleRingBuffer {
    inner: HeapRb<f32>,
    format: WaveFormat,
}

impl SampleRingBuffer {
    /// Creates a ring holding `capacity` samples of `format`.
    pub fn new(capacity: usize, format: WaveFormat) -> Self {
        assert!(capacity > 0, "SampleRingBuffer requires a non-zero capacity");
        Self {
            inner: HeapRb::new(capacity),
            format,
        }
    }

    pub fn split(self) -> (SampleWriter, SampleReader) {
        let (producer, consumer) = self.inner.split();
        (
            SampleWriter { producer },
            SampleReader {
                consumer,
                format: self.format,
            },
        )
    }
}

/// Producer half. Owned by whoever receives samples from capture.
pub struct SampleWriter {
    producer: HeapProd<f32>,
}

impl SampleWriter {
    /// Copies as many leading samples as fit and returns how many did.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        self.producer.push_slice(samples)
    }

    /// Approximate number of buffered samples; racy by nature.
    pub fn unread_count(&self) -> usize {
        self.producer.occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.producer.capacity().get()
    }
}

/// Consumer half. Owned by the processing worker.
pub struct SampleReader {
    consumer: HeapCons<f32>,
    format: WaveFormat,
}

impl SampleReader {
    /// Fills `buffer` completely, or leaves it untouched and returns false.
    pub fn read(&mut self, buffer: &mut [f32]) -> bool {
        // The only consumer: occupancy cannot shrink between check and pop.
        if self.consumer.occupied_len() < buffer.len() {
            return false;
        }
        self.consumer.pop_slice(buffer);
        true
    }

    /// Discards everything currently buffered.
    pub fn reset(&mut self) {
        self.consumer.clear();
    }

    pub fn unread_count(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.consumer.capacity().get()
    }
}

impl SampleSource for SampleReader {
    fn pull(&mut self, out: &mut [f32]) -> usize {
        self.consumer.pop_slice(out)
    }

    fn format(&self) -> WaveFormat {
        self.format
    }
}
