//! Top-level lifecycle of the capture-to-transmission chain.
//!
//! The [`CaptureOrchestrator`] owns the capture source, the processing
//! pipeline and the transmit encoder as one unit. It is driven from the
//! control thread by calling [`CaptureOrchestrator::update`] once per tick.

pub mod session;
pub mod skip_detector;

pub use session::{Session, StaticSession};
pub use skip_detector::FrameSkipDetector;

use crate::audio::format::WaveFormat;
use crate::audio::recorder::CaptureSource;
use crate::codec::{Encoder, PcmEncoder};
use crate::config::{Config, PreprocessorSettings};
use crate::error::Result;
use crate::pipeline::diagnostics::WavRecorder;
use crate::pipeline::error::{ErrorReporter, LogReporter, isolate};
use crate::pipeline::processing::{PipelineConfig, ProcessingPipeline};
use crate::pipeline::subscriber::{AudioSubscriber, VoiceActivityListener, same_subscriber};
use crate::pipeline::transmit::TransmitEncoder;
use crate::preprocess::{EnergyPreprocessor, Preprocessor};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;

/// Builds a preprocessor for a pipeline running at the given intermediate
/// format.
pub type PreprocessorFactory =
    Box<dyn Fn(&PreprocessorSettings, WaveFormat) -> Result<Box<dyn Preprocessor>> + Send>;

/// Builds a fresh encoder for every pipeline rebuild.
pub type EncoderFactory = Box<dyn Fn() -> Result<Box<dyn Encoder>> + Send>;

pub struct CaptureOrchestrator {
    config: Config,
    capture: Box<dyn CaptureSource>,
    session: Arc<dyn Session>,
    transport: Arc<dyn Transport>,
    make_preprocessor: PreprocessorFactory,
    make_encoder: EncoderFactory,
    reporter: Arc<dyn ErrorReporter>,
    skip_detector: FrameSkipDetector,
    settings: PreprocessorSettings,
    device: Option<String>,
    startup_delay: u32,

    pipeline: Option<Arc<ProcessingPipeline>>,
    encoder: Option<Arc<TransmitEncoder>>,
    encoder_subscribed: bool,
    recorder: Option<Arc<WavRecorder>>,

    audio_listeners: Vec<Arc<dyn AudioSubscriber>>,
    vad_listeners: Vec<Arc<dyn VoiceActivityListener>>,

    pending_reset: bool,
    cannot_start_capture: bool,
    fatal_error: bool,
    rebuilds: u64,
}

impl CaptureOrchestrator {
    /// Creates an orchestrator with the energy preprocessor and the PCM
    /// encoder. Nothing starts until the first `update`.
    pub fn new(
        config: &Config,
        capture: Box<dyn CaptureSource>,
        session: Arc<dyn Session>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let frame_size = config.transmit.frame_size;
        let codec_rate = config.transmit.sample_rate;
        Self {
            capture,
            session,
            transport,
            make_preprocessor: Box::new(|settings, format| {
                Ok(Box::new(EnergyPreprocessor::new(settings, format.sample_rate)))
            }),
            make_encoder: Box::new(move || Ok(Box::new(PcmEncoder::new(frame_size, codec_rate)))),
            reporter: Arc::new(LogReporter),
            skip_detector: FrameSkipDetector::from_config(&config.skip_detector),
            settings: config.preprocessor.clone(),
            device: normalize_device(config.capture.device.as_deref()),
            startup_delay: config.capture.startup_delay_ticks,
            pipeline: None,
            encoder: None,
            encoder_subscribed: false,
            recorder: None,
            audio_listeners: Vec::new(),
            vad_listeners: Vec::new(),
            pending_reset: false,
            cannot_start_capture: false,
            fatal_error: false,
            rebuilds: 0,
            config: config.clone(),
        }
    }

    pub fn with_preprocessor_factory(mut self, factory: PreprocessorFactory) -> Self {
        self.make_preprocessor = factory;
        self
    }

    pub fn with_encoder_factory(mut self, factory: EncoderFactory) -> Self {
        self.make_encoder = factory;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Runs one control tick.
    ///
    /// `muted` is the user's transmit mute; `delta` is the time since the
    /// previous tick.
    pub fn update(&mut self, muted: bool, delta: Duration) {
        if self.startup_delay > 0 {
            self.startup_delay -= 1;
            return;
        }

        if !self.session.is_transmit_enabled() || self.fatal_error || self.cannot_start_capture {
            self.stop_pipeline();
            return;
        }

        let skipped = self.skip_detector.is_frame_skip(delta);
        let requested = self.capture.is_recording() && self.capture.pump();
        let missing = self.encoder.is_none();
        let faulted = self.pipeline.as_ref().is_some_and(|p| p.is_faulted());

        if skipped || requested || self.pending_reset || missing || faulted {
            let reason = if skipped {
                tracing::warn!(
                    delta_ms = delta.as_millis() as u64,
                    "Detected a frame skip, forcing capture pipeline reset"
                );
                "frame skip"
            } else if missing {
                "pipeline missing"
            } else if self.pending_reset {
                "external reset request"
            } else if faulted {
                "pipeline worker died"
            } else {
                "capture source requested a reset"
            };

            self.restart_pipeline(reason);
            if self.pipeline.is_none() || self.cannot_start_capture {
                return;
            }
        }

        let (Some(pipeline), Some(encoder)) = (self.pipeline.clone(), self.encoder.clone()) else {
            return;
        };

        // Output muted in the mix means nothing downstream is transmitting it.
        pipeline.set_output_muted(!self.encoder_subscribed);

        let handle: Arc<dyn AudioSubscriber> = encoder.clone();
        if encoder.is_stopped() && self.encoder_subscribed {
            tracing::debug!("Unsubscribing encoder from pipeline");
            pipeline.unsubscribe_audio(&handle);
            encoder.reset();
            self.encoder_subscribed = false;
        }

        let draining = encoder.is_stopping() && !encoder.is_stopped();
        let should_subscribe = !draining && !muted && self.session.open_channel_count() > 0;

        if should_subscribe != self.encoder_subscribed {
            if should_subscribe {
                tracing::debug!("Subscribing encoder to pipeline");
                encoder.reset();
                pipeline.subscribe_audio(handle);
                self.encoder_subscribed = true;
            } else if !encoder.is_stopping() {
                tracing::debug!("Stopping encoder");
                encoder.stop();
            } else {
                tracing::trace!("Waiting for encoder to send last packet");
            }
        }

        // Incoming loss is the best available estimate of outgoing loss.
        encoder.set_packet_loss(self.session.incoming_packet_loss());
    }

    /// Rebuilds on the next tick and retries capture even after a failure.
    pub fn force_reset(&mut self) {
        tracing::warn!("Forcing capture pipeline reset");
        self.pending_reset = true;
        self.cannot_start_capture = false;
        self.fatal_error = false;
    }

    /// Switches the capture device. `None` and `""` both mean the default.
    pub fn set_device_name(&mut self, device: Option<&str>) {
        let device = normalize_device(device);
        if device == self.device {
            return;
        }
        tracing::info!(
            device = device.as_deref().unwrap_or("default"),
            "Capture device changed"
        );
        self.device = device;
        self.force_reset();
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Pushes a new settings snapshot to the live preprocessor and keeps it
    /// for future rebuilds.
    pub fn apply_settings(&mut self, settings: PreprocessorSettings) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.apply_settings(&settings);
        }
        self.settings = settings;
    }

    pub fn settings(&self) -> &PreprocessorSettings {
        &self.settings
    }

    pub fn subscribe_audio(&mut self, listener: Arc<dyn AudioSubscriber>) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.subscribe_audio(Arc::clone(&listener));
        }
        self.audio_listeners.push(listener);
    }

    pub fn unsubscribe_audio(&mut self, listener: &Arc<dyn AudioSubscriber>) -> bool {
        let Some(index) = self
            .audio_listeners
            .iter()
            .position(|l| same_subscriber(l, listener))
        else {
            return false;
        };
        self.audio_listeners.remove(index);
        if let Some(pipeline) = &self.pipeline {
            pipeline.unsubscribe_audio(listener);
        }
        true
    }

    pub fn subscribe_voice_activity(&mut self, listener: Arc<dyn VoiceActivityListener>) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.subscribe_voice_activity(Arc::clone(&listener));
        }
        self.vad_listeners.push(listener);
    }

    pub fn unsubscribe_voice_activity(&mut self, listener: &Arc<dyn VoiceActivityListener>) -> bool {
        let Some(index) = self
            .vad_listeners
            .iter()
            .position(|l| same_subscriber(l, listener))
        else {
            return false;
        };
        self.vad_listeners.remove(index);
        if let Some(pipeline) = &self.pipeline {
            pipeline.unsubscribe_voice_activity(listener);
        }
        true
    }

    /// Stops everything without clearing listener registrations.
    pub fn pause(&mut self) {
        self.stop_pipeline();
    }

    pub fn resume(&mut self) {
        self.restart_pipeline("resumed");
    }

    /// Tears down the pipeline. Also done on drop.
    pub fn shutdown(&mut self) {
        self.stop_pipeline();
    }

    /// Running input amplitude, 0.0 when no pipeline is live.
    pub fn amplitude(&self) -> f32 {
        self.pipeline.as_ref().map_or(0.0, |p| p.amplitude())
    }

    pub fn packet_loss(&self) -> f32 {
        self.encoder.as_ref().map_or(0.0, |e| e.packet_loss())
    }

    pub fn is_encoder_subscribed(&self) -> bool {
        self.encoder_subscribed
    }

    pub fn is_speech_active(&self) -> bool {
        self.pipeline.as_ref().is_some_and(|p| p.is_speech_active())
    }

    pub fn pipeline(&self) -> Option<&Arc<ProcessingPipeline>> {
        self.pipeline.as_ref()
    }

    pub fn encoder(&self) -> Option<&Arc<TransmitEncoder>> {
        self.encoder.as_ref()
    }

    /// True once starting capture failed; cleared by `force_reset`.
    pub fn cannot_start_capture(&self) -> bool {
        self.cannot_start_capture
    }

    /// True once a rebuild failed unexpectedly; cleared by `force_reset`.
    pub fn has_fatal_error(&self) -> bool {
        self.fatal_error
    }

    /// Successful pipeline builds so far.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    fn stop_pipeline(&mut self) {
        if self.capture.is_recording() {
            self.capture.stop();
        }

        if let Some(pipeline) = self.pipeline.take() {
            let handle: Arc<dyn AudioSubscriber> = pipeline.clone();
            self.capture.unsubscribe(&handle);
            if let Some(encoder) = &self.encoder {
                let encoder: Arc<dyn AudioSubscriber> = encoder.clone();
                pipeline.unsubscribe_audio(&encoder);
            }
            pipeline.dispose();
        }

        if let Some(encoder) = self.encoder.take() {
            encoder.dispose();
        }

        if let Some(recorder) = self.recorder.take()
            && let Err(e) = recorder.finalize()
        {
            tracing::warn!(error = %e, "Failed to finalize diagnostics recording");
        }

        self.encoder_subscribed = false;
    }

    fn restart_pipeline(&mut self, reason: &str) {
        tracing::debug!(reason, "Restarting capture pipeline");
        self.stop_pipeline();

        if self.fatal_error {
            return;
        }
        self.pending_reset = false;

        if !self.session.is_transmit_enabled() {
            return;
        }

        match self.build_pipeline() {
            Ok(true) => self.rebuilds += 1,
            Ok(false) => {
                tracing::warn!(
                    "Failed to start capture; local voice transmission will be disabled"
                );
                self.cannot_start_capture = true;
            }
            Err(e) => {
                self.stop_pipeline();
                tracing::error!(
                    error = %e,
                    "Unexpected error starting capture; local voice transmission will be disabled"
                );
                self.fatal_error = true;
            }
        }
    }

    /// Starts capture and wires up a fresh pipeline and encoder. `Ok(false)`
    /// means the capture source could not start.
    fn build_pipeline(&mut self) -> Result<bool> {
        let Some(format) = self.capture.start(self.device.as_deref()) else {
            return Ok(false);
        };

        self.session.refresh_channels();

        let pipeline_config = PipelineConfig::from_settings(format, &self.config.pipeline);
        let preprocessor =
            (self.make_preprocessor)(&self.settings, pipeline_config.intermediate_format())?;
        let pipeline = Arc::new(ProcessingPipeline::with_reporter(
            pipeline_config,
            preprocessor,
            Arc::clone(&self.reporter),
        )?);
        self.pipeline = Some(Arc::clone(&pipeline));

        pipeline.set_upstream_latency(self.capture.latency());
        pipeline.start()?;
        self.capture.subscribe(pipeline.clone());

        for listener in &self.vad_listeners {
            pipeline.subscribe_voice_activity(Arc::clone(listener));
        }
        for listener in &self.audio_listeners {
            if let Err(message) = isolate(|| listener.reset()) {
                tracing::warn!(
                    subscriber = listener.name(),
                    error = %message,
                    "Audio listener failed to reset"
                );
            }
            pipeline.subscribe_audio(Arc::clone(listener));
        }

        let output_format = pipeline.config().output_format();
        if let Some(dir) = &self.config.diagnostics.record_preprocessor_output {
            match WavRecorder::create_in(dir, output_format) {
                Ok(recorder) => {
                    let recorder = Arc::new(recorder);
                    pipeline.subscribe_audio(recorder.clone());
                    self.recorder = Some(recorder);
                }
                Err(e) => tracing::warn!(error = %e, "Diagnostics recording disabled"),
            }
        }

        let encoder = TransmitEncoder::new(
            output_format,
            (self.make_encoder)()?,
            Arc::clone(&self.transport),
        )?;
        self.encoder = Some(Arc::new(encoder));

        tracing::info!(capture = %format, "Capture pipeline started");
        Ok(true)
    }
}

impl Drop for CaptureOrchestrator {
    fn drop(&mut self) {
        self.stop_pipeline();
    }
}

fn normalize_device(device: Option<&str>) -> Option<String> {
    device
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}
