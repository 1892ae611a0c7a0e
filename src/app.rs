//! Composition root for the `run` command.
//!
//! Wires a capture source, an in-process session and a channel transport
//! into a [`CaptureOrchestrator`] and ticks it in real time.

use crate::audio::recorder::CaptureSource;
use crate::audio::wav::WavCaptureSource;
use crate::cli::RunArgs;
use crate::config::Config;
use crate::defaults;
use crate::error::{Result, VoicepipeError};
use crate::orchestrator::{CaptureOrchestrator, StaticSession};
use crate::pipeline::processing::PipelineStats;
use crate::pipeline::subscriber::VoiceActivityListener;
use crate::transport::ChannelTransport;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Extra time given to a non-looping file so its tail drains through.
const FILE_TAIL: Duration = Duration::from_millis(250);

/// What a run produced.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub elapsed: Duration,
    pub packets: u64,
    pub bytes: u64,
    pub packets_dropped: u64,
    pub speech_segments: usize,
    pub peak_amplitude: f32,
    pub rebuilds: u64,
    pub pipeline: Option<PipelineStats>,
}

#[derive(Default)]
struct SpeechCounter {
    segments: AtomicUsize,
}

impl VoiceActivityListener for SpeechCounter {
    fn on_start(&self) -> Result<()> {
        let n = self.segments.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(segment = n, "Speech started");
        Ok(())
    }

    fn on_stop(&self) -> Result<()> {
        tracing::info!("Speech stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        "speech-counter"
    }
}

/// Runs the full capture-to-transmission chain for `args.duration`.
pub fn run_capture(mut config: Config, args: &RunArgs) -> Result<RunSummary> {
    if let Some(device) = &args.device {
        config.capture.device = Some(device.clone());
    }
    if let Some(dir) = &args.record {
        config.diagnostics.record_preprocessor_output = Some(dir.clone());
    }
    config.validate()?;

    let (capture, limit) = open_capture(args)?;
    let session = Arc::new(StaticSession::new());
    let (transport, packets) = ChannelTransport::new(config.transmit.packet_queue);
    let transport = Arc::new(transport);
    let speech = Arc::new(SpeechCounter::default());

    let mut orchestrator =
        CaptureOrchestrator::new(&config, capture, session, Arc::clone(&transport) as _);
    orchestrator.subscribe_voice_activity(speech.clone());

    let tick = Duration::from_millis(defaults::CAPTURE_FRAME_MS);
    let mut summary = RunSummary::default();
    let started = Instant::now();
    let mut last = started;

    while started.elapsed() < limit {
        let now = Instant::now();
        orchestrator.update(args.muted, now - last);
        last = now;

        if orchestrator.cannot_start_capture() || orchestrator.has_fatal_error() {
            return Err(VoicepipeError::AudioCapture {
                message: "capture could not be started".to_string(),
            });
        }

        for packet in packets.try_iter() {
            summary.packets += 1;
            summary.bytes += packet.len() as u64;
        }
        summary.peak_amplitude = summary.peak_amplitude.max(orchestrator.amplitude());

        thread::sleep(tick.saturating_sub(now.elapsed()));
    }

    summary.pipeline = orchestrator.pipeline().map(|p| p.stats());
    summary.rebuilds = orchestrator.rebuilds();
    orchestrator.shutdown();

    for packet in packets.try_iter() {
        summary.packets += 1;
        summary.bytes += packet.len() as u64;
    }
    summary.packets_dropped = transport.dropped();
    summary.speech_segments = speech.segments.load(Ordering::Relaxed);
    summary.elapsed = started.elapsed();

    tracing::debug!(?summary, "Run finished");
    Ok(summary)
}

/// Picks the capture source and how long to run it.
fn open_capture(args: &RunArgs) -> Result<(Box<dyn CaptureSource>, Duration)> {
    if let Some(path) = &args.file {
        let source = WavCaptureSource::open(path)?.with_looping(args.looping);
        let limit = if args.looping {
            args.duration
        } else {
            args.duration.min(source.duration() + FILE_TAIL)
        };
        return Ok((Box::new(source), limit));
    }

    #[cfg(feature = "cpal-audio")]
    {
        Ok((
            Box::new(crate::audio::capture::CpalCaptureSource::new()),
            args.duration,
        ))
    }
    #[cfg(not(feature = "cpal-audio"))]
    {
        Err(VoicepipeError::AudioCapture {
            message: "built without microphone support; pass --file".to_string(),
        })
    }
}
