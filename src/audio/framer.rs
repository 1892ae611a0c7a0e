//! Fixed-size frame assembly over a pull source.

use super::format::WaveFormat;
use super::source::SampleSource;

/// Accumulates a variable-length stream into frames of `frame_size` samples.
///
/// Partial accumulation survives across `read` calls, so an upstream that
/// trickles samples in still produces whole frames in order.
pub struct FrameAssembler<S> {
    source: S,
    frame: Vec<f32>,
    filled: usize,
}

impl<S: SampleSource> FrameAssembler<S> {
    pub fn new(source: S, frame_size: usize) -> Self {
        assert!(frame_size > 0, "FrameAssembler requires a non-zero frame size");
        Self {
            source,
            frame: vec![0.0; frame_size],
            filled: 0,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame.len()
    }

    /// Samples accumulated towards the next frame.
    pub fn buffered(&self) -> usize {
        self.filled
    }

    pub fn format(&self) -> WaveFormat {
        self.source.format()
    }

    /// Copies out the next full frame, or returns false once upstream is
    /// exhausted for now.
    ///
    /// # Panics
    /// If `out.len()` differs from the frame size.
    pub fn read(&mut self, out: &mut [f32]) -> bool {
        assert_eq!(
            out.len(),
            self.frame.len(),
            "frame buffer length must equal the assembler frame size"
        );

        while self.filled < self.frame.len() {
            let got = self.source.pull(&mut self.frame[self.filled..]);
            if got == 0 {
                return false;
            }
            self.filled += got;
        }

        out.copy_from_slice(&self.frame);
        self.filled = 0;
        true
    }

    /// Emits whatever is accumulated, zero-padded to a full frame.
    ///
    /// Returns false when nothing at all is buffered and upstream is empty.
    pub fn read_padded(&mut self, out: &mut [f32]) -> bool {
        if self.read(out) {
            return true;
        }
        if self.filled == 0 {
            return false;
        }
        out[..self.filled].copy_from_slice(&self.frame[..self.filled]);
        out[self.filled..].fill(0.0);
        self.filled = 0;
        true
    }

    /// Discards any partially filled frame.
    pub fn reset(&mut self) {
        self.filled = 0;
    }

    pub fn get_ref(&self) -> &S {
        &self.source
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.source
    }
}
