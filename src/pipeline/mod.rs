//! Capture-to-transmission audio pipeline.
//!
//! The [`ProcessingPipeline`] owns a worker thread fed through a ring
//! buffer; processed frames fan out to [`AudioSubscriber`]s, one of which is
//! usually the [`TransmitEncoder`].

pub mod diagnostics;
pub mod error;
pub mod processing;
pub mod subscriber;
pub mod transmit;

pub use diagnostics::WavRecorder;
pub use error::{ErrorReporter, Fault, LogReporter};
pub use processing::{PipelineConfig, PipelineState, PipelineStats, ProcessingPipeline};
pub use subscriber::{AudioSubscriber, VoiceActivityListener};
pub use transmit::TransmitEncoder;
