pub mod amplitude;
#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod format;
pub mod framer;
pub mod recorder;
pub mod resampler;
pub mod ring_buffer;
pub mod source;
pub mod vad;
pub mod wav;

#[cfg(feature = "cpal-audio")]
pub use capture::{CpalCaptureSource, list_devices};
pub use format::WaveFormat;
pub use framer::FrameAssembler;
pub use recorder::{CaptureFanout, CaptureSource, MockCaptureHandle, MockCaptureSource};
pub use resampler::RateConverter;
pub use ring_buffer::{SampleReader, SampleRingBuffer, SampleWriter};
pub use source::{QueueSource, SampleSource};
pub use wav::WavCaptureSource;
