//! Default configuration constants for voicepipe.
//!
//! Shared by the config layer and the pipeline components so that the
//! defaults live in one place.

/// Sample rate the preprocessor runs at, in Hz.
pub const INTERMEDIATE_SAMPLE_RATE: u32 = 48000;

/// Samples per preprocessor frame (10ms at 48kHz).
pub const INTERMEDIATE_FRAME_SIZE: usize = 480;

/// Sample rate delivered to audio subscribers, in Hz.
pub const OUTPUT_SAMPLE_RATE: u32 = 48000;

/// Samples per frame delivered to audio subscribers.
pub const OUTPUT_FRAME_SIZE: usize = 480;

/// Capacity of the ingest ring buffer, in intermediate frames.
///
/// 16 frames is 160ms of headroom before the producer starts dropping.
pub const RING_BUFFER_FRAMES: usize = 16;

/// Upper bound on how long the worker sleeps without a wake signal, in ms.
pub const WORKER_WAKE_TIMEOUT_MS: u64 = 100;

/// Fixed part of the slow-iteration warning threshold, in ms.
pub const SLOW_ITERATION_BASE_MS: u64 = 50;

/// Per-frame allowance added to the slow-iteration threshold, in ms.
pub const SLOW_ITERATION_PER_FRAME_MS: u64 = 5;

/// Longest tick considered normal before it counts as a frame skip, in ms.
pub const MAX_FRAME_TIME_MS: u64 = 150;

/// Shortest breaker window after a frame skip, in ms.
pub const MIN_BREAKER_MS: u64 = 350;

/// Longest breaker window, reached when skips keep recurring, in ms.
pub const MAX_BREAKER_MS: u64 = 10_000;

/// How fast the breaker window shrinks back, in ms per second of ticks.
pub const BREAKER_RESET_PER_SECOND_MS: u64 = 250;

/// Ticks to wait after construction before the first capture attempt.
pub const STARTUP_DELAY_TICKS: u32 = 0;

/// Codec frame size of the reference PCM encoder (20ms at 48kHz).
pub const CODEC_FRAME_SIZE: usize = 960;

/// Codec sample rate of the reference PCM encoder, in Hz.
pub const CODEC_SAMPLE_RATE: u32 = 48000;

/// Bound of the in-process packet queue used by the channel transport.
pub const PACKET_QUEUE: usize = 256;

/// Duration of one capture frame pushed by file-backed sources, in ms.
pub const CAPTURE_FRAME_MS: u64 = 20;

/// RMS level above which a frame counts as speech at medium sensitivity.
pub const VAD_THRESHOLD: f32 = 0.02;

/// Speech hangover before the detector falls back to silence, in ms.
pub const VAD_HANGOVER_MS: u32 = 300;

/// Smoothing factor of the running amplitude estimator.
pub const AMPLITUDE_SMOOTHING: f32 = 0.1;
