//! voicepipe - Real-time voice capture and transmission
//!
//! Captured audio flows through a ring buffer into a worker thread that
//! resamples, frames and preprocesses it, then fans the result out to
//! subscribers such as the transmit encoder.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
pub mod codec;
pub mod config;
pub mod defaults;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod preprocess;
pub mod transport;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "cli")]
pub mod telemetry;

// Composition root for the binary
#[cfg(feature = "cli")]
pub mod app;

// Capture and signal chain
pub use audio::{CaptureSource, FrameAssembler, RateConverter, SampleRingBuffer, WaveFormat};
pub use codec::Encoder;
pub use preprocess::Preprocessor;
pub use transport::Transport;

// Pipeline
pub use orchestrator::{CaptureOrchestrator, FrameSkipDetector, Session};
pub use pipeline::{
    AudioSubscriber, ErrorReporter, ProcessingPipeline, TransmitEncoder, VoiceActivityListener,
};

// Error handling
pub use error::{Result, VoicepipeError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// `CARGO_PKG_VERSION`, suffixed with `+<hash>` when built from a git checkout.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
