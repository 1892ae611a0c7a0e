//! Background preprocessing pipeline.
//!
//! Raw capture samples are written into a ring buffer by the producer thread.
//! A single worker thread drains them through rate conversion and framing
//! into the preprocessor, then fans processed frames out to subscribers.
//!
//! ```text
//! receive() ─▶ ring ─▶ RateConverter ─▶ FrameAssembler ─▶ Preprocessor ─▶ [output stage] ─▶ subscribers
//! ```

use super::error::{ErrorReporter, Fault, LogReporter, isolate};
use super::subscriber::{AudioSubscriber, VoiceActivityListener, same_subscriber};
use crate::audio::amplitude::AmplitudeMeter;
use crate::audio::format::WaveFormat;
use crate::audio::framer::FrameAssembler;
use crate::audio::resampler::RateConverter;
use crate::audio::ring_buffer::{SampleReader, SampleRingBuffer, SampleWriter};
use crate::audio::source::QueueSource;
use crate::config::{PreprocessorSettings, ProcessingConfig};
use crate::defaults;
use crate::error::{Result, VoicepipeError};
use crate::preprocess::Preprocessor;
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Construction-time configuration; immutable for the pipeline's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub input_format: WaveFormat,
    pub intermediate_frame_size: usize,
    pub intermediate_sample_rate: u32,
    pub output_frame_size: usize,
    pub output_sample_rate: u32,
    /// Ring buffer capacity, in intermediate frames.
    pub buffer_frames: usize,
    pub wake_timeout: Duration,
}

impl PipelineConfig {
    /// Default sizes and rates for the given capture format.
    pub fn new(input_format: WaveFormat) -> Self {
        Self::from_settings(input_format, &ProcessingConfig::default())
    }

    pub fn from_settings(input_format: WaveFormat, settings: &ProcessingConfig) -> Self {
        Self {
            input_format,
            intermediate_frame_size: settings.intermediate_frame_size,
            intermediate_sample_rate: settings.intermediate_sample_rate,
            output_frame_size: settings.output_frame_size,
            output_sample_rate: settings.output_sample_rate,
            buffer_frames: settings.buffer_frames,
            wake_timeout: Duration::from_millis(settings.wake_timeout_ms),
        }
    }

    pub fn intermediate_format(&self) -> WaveFormat {
        WaveFormat::new(self.intermediate_sample_rate, self.input_format.channels)
    }

    pub fn output_format(&self) -> WaveFormat {
        WaveFormat::new(self.output_sample_rate, self.input_format.channels)
    }

    fn ring_capacity(&self) -> usize {
        self.intermediate_frame_size * self.buffer_frames
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Running,
    ResetPending,
    Disposed,
}

/// Counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Real audio frames run through the preprocessor.
    pub frames_processed: u64,
    /// Silent frames injected to cover dropped samples.
    pub silent_frames_injected: u64,
    pub samples_dropped: u64,
    pub resets_applied: u64,
}

#[derive(Default)]
struct Counters {
    frames_processed: AtomicU64,
    silent_frames_injected: AtomicU64,
    samples_dropped: AtomicU64,
    resets_applied: AtomicU64,
}

/// Auto-reset wake event: one `set` releases at most one `wait`.
#[derive(Default)]
struct WakeSignal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    fn set(&self) {
        *self.flag.lock() = true;
        self.cond.notify_one();
    }

    fn wait(&self, timeout: Duration) {
        let mut flag = self.flag.lock();
        if !*flag {
            self.cond.wait_for(&mut flag, timeout);
        }
        *flag = false;
    }
}

type AudioList = Arc<Vec<Arc<dyn AudioSubscriber>>>;

struct VoiceActivity {
    listeners: Arc<Vec<Arc<dyn VoiceActivityListener>>>,
    /// Last speech state announced to listeners.
    speaking: bool,
}

/// State shared between the control, producer and worker threads.
struct Shared {
    config: PipelineConfig,
    writer: Mutex<SampleWriter>,
    wake: WakeSignal,
    running: AtomicBool,
    reset_requested: AtomicBool,
    faulted: AtomicBool,
    disposed: AtomicBool,
    dropped: AtomicUsize,
    /// f32 bits of the running amplitude estimate.
    amplitude: AtomicU32,
    output_muted: AtomicBool,
    upstream_latency: Mutex<Duration>,
    counters: Counters,
    preprocessor: Mutex<Box<dyn Preprocessor>>,
    audio: Mutex<AudioList>,
    voice: Mutex<VoiceActivity>,
    /// Held while voice-activity callbacks run, never together with `voice`
    /// held. Orders membership changes against announcements; reentrant so
    /// a callback may subscribe or unsubscribe.
    announce: ReentrantMutex<()>,
    reporter: Arc<dyn ErrorReporter>,
}

/// Speech preprocessing stage running on its own thread.
pub struct ProcessingPipeline {
    shared: Arc<Shared>,
    /// Worker state parked here until `start` moves it onto the thread.
    pending: Mutex<Option<Worker>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessingPipeline {
    pub fn new(config: PipelineConfig, preprocessor: Box<dyn Preprocessor>) -> Result<Self> {
        Self::with_reporter(config, preprocessor, Arc::new(LogReporter))
    }

    pub fn with_reporter(
        config: PipelineConfig,
        preprocessor: Box<dyn Preprocessor>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        if config.intermediate_frame_size == 0 || config.output_frame_size == 0 {
            return Err(VoicepipeError::ConfigInvalidValue {
                key: "pipeline.frame_size".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if config.buffer_frames == 0 {
            return Err(VoicepipeError::ConfigInvalidValue {
                key: "pipeline.buffer_frames".to_string(),
                message: "must be positive".to_string(),
            });
        }

        let (writer, reader) =
            SampleRingBuffer::new(config.ring_capacity(), config.input_format).split();
        let converter = RateConverter::new(reader, config.intermediate_sample_rate)?;
        let input = FrameAssembler::new(converter, config.intermediate_frame_size);
        let output = OutputStage::new(&config)?;

        let shared = Arc::new(Shared {
            writer: Mutex::new(writer),
            wake: WakeSignal::default(),
            running: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            dropped: AtomicUsize::new(0),
            amplitude: AtomicU32::new(0),
            output_muted: AtomicBool::new(false),
            upstream_latency: Mutex::new(Duration::ZERO),
            counters: Counters::default(),
            preprocessor: Mutex::new(preprocessor),
            audio: Mutex::new(Arc::new(Vec::new())),
            voice: Mutex::new(VoiceActivity {
                listeners: Arc::new(Vec::new()),
                speaking: false,
            }),
            announce: ReentrantMutex::new(()),
            reporter,
            config: config.clone(),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            frame: vec![0.0; config.intermediate_frame_size],
            input,
            output,
            meter: AmplitudeMeter::default(),
            reset_applied: false,
        };

        Ok(Self {
            shared,
            pending: Mutex::new(Some(worker)),
            thread: Mutex::new(None),
        })
    }

    /// Spawns the worker thread. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(VoicepipeError::Other(
                "cannot start a disposed pipeline".to_string(),
            ));
        }
        let Some(mut worker) = self.pending.lock().take() else {
            return Ok(());
        };
        // Applied before the thread exists: audio received after `start`
        // returns must survive it.
        worker.apply_reset();

        self.shared.running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("voicepipe-preprocess".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                VoicepipeError::Io(e)
            })?;
        *self.thread.lock() = Some(handle);

        tracing::debug!(
            input = %self.shared.config.input_format,
            intermediate = %self.shared.config.intermediate_format(),
            output = %self.shared.config.output_format(),
            "Started preprocessing thread"
        );
        Ok(())
    }

    /// Ingests raw capture samples. Called from the producer thread.
    ///
    /// Samples that do not fit in the ring are counted as dropped and later
    /// replaced by silence.
    pub fn receive(&self, samples: &[f32], format: WaveFormat) -> Result<()> {
        if format != self.shared.config.input_format {
            return Err(VoicepipeError::format_mismatch(
                self.shared.config.input_format,
                format,
            ));
        }
        if self.shared.disposed.load(Ordering::Acquire) {
            return Ok(());
        }

        let written = self.shared.writer.lock().write(samples);
        if written < samples.len() {
            let lost = samples.len() - written;
            self.shared.dropped.fetch_add(lost, Ordering::AcqRel);
            self.shared
                .counters
                .samples_dropped
                .fetch_add(lost as u64, Ordering::Relaxed);
            tracing::warn!(
                lost,
                "Preprocessor input buffer full, dropping samples and injecting silence"
            );
        }

        self.shared.wake.set();
        Ok(())
    }

    /// Asks the worker to apply a reset before processing more audio.
    ///
    /// Requests made before the worker gets to them collapse into one reset.
    pub fn request_reset(&self) {
        self.shared.reset_requested.store(true, Ordering::SeqCst);
        self.shared.wake.set();
        tracing::debug!("Preprocessing pipeline reset requested");
    }

    pub fn subscribe_audio(&self, subscriber: Arc<dyn AudioSubscriber>) {
        let mut list = self.shared.audio.lock();
        let mut next = Vec::clone(&list);
        next.push(subscriber);
        *list = Arc::new(next);
    }

    pub fn unsubscribe_audio(&self, subscriber: &Arc<dyn AudioSubscriber>) -> bool {
        let mut list = self.shared.audio.lock();
        let Some(index) = list.iter().position(|s| same_subscriber(s, subscriber)) else {
            return false;
        };
        let mut next = Vec::clone(&list);
        next.remove(index);
        *list = Arc::new(next);
        true
    }

    /// Adds a listener; it is told about speech already in progress.
    pub fn subscribe_voice_activity(&self, listener: Arc<dyn VoiceActivityListener>) {
        let _announce = self.shared.announce.lock();
        let speaking = {
            let mut voice = self.shared.voice.lock();
            let mut next = Vec::clone(&voice.listeners);
            next.push(Arc::clone(&listener));
            voice.listeners = Arc::new(next);
            voice.speaking
        };
        if speaking {
            notify(&*self.shared.reporter, &listener, true);
        }
    }

    /// Removes a listener; it is told speech stopped if it was active.
    pub fn unsubscribe_voice_activity(&self, listener: &Arc<dyn VoiceActivityListener>) -> bool {
        let _announce = self.shared.announce.lock();
        let (removed, speaking) = {
            let mut voice = self.shared.voice.lock();
            let Some(index) = voice
                .listeners
                .iter()
                .position(|l| same_subscriber(l, listener))
            else {
                return false;
            };
            let mut next = Vec::clone(&voice.listeners);
            let removed = next.remove(index);
            voice.listeners = Arc::new(next);
            (removed, voice.speaking)
        };
        if speaking {
            notify(&*self.shared.reporter, &removed, false);
        }
        true
    }

    /// Whether voice-activity listeners currently consider speech active.
    pub fn is_speech_active(&self) -> bool {
        self.shared.voice.lock().speaking
    }

    /// Tells the preprocessor whether this pipeline's output is muted in
    /// the mix. Unrelated to whether capture is running.
    pub fn set_output_muted(&self, muted: bool) {
        if self.shared.output_muted.swap(muted, Ordering::AcqRel) != muted {
            self.shared.preprocessor.lock().set_output_muted(muted);
        }
    }

    pub fn set_upstream_latency(&self, latency: Duration) {
        let mut current = self.shared.upstream_latency.lock();
        if *current != latency {
            *current = latency;
            self.shared.preprocessor.lock().set_stream_delay(latency);
        }
    }

    pub fn upstream_latency(&self) -> Duration {
        *self.shared.upstream_latency.lock()
    }

    pub fn apply_settings(&self, settings: &PreprocessorSettings) {
        self.shared.preprocessor.lock().apply_settings(settings);
    }

    /// Running amplitude of the ingested audio, for metering.
    pub fn amplitude(&self) -> f32 {
        f32::from_bits(self.shared.amplitude.load(Ordering::Relaxed))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn state(&self) -> PipelineState {
        if self.shared.disposed.load(Ordering::SeqCst) {
            PipelineState::Disposed
        } else if self.thread.lock().is_none() {
            PipelineState::Created
        } else if self.shared.reset_requested.load(Ordering::SeqCst) {
            PipelineState::ResetPending
        } else {
            PipelineState::Running
        }
    }

    /// True once the worker thread has died from an unexpected error.
    pub fn is_faulted(&self) -> bool {
        self.shared.faulted.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.shared.counters;
        PipelineStats {
            frames_processed: c.frames_processed.load(Ordering::Relaxed),
            silent_frames_injected: c.silent_frames_injected.load(Ordering::Relaxed),
            samples_dropped: c.samples_dropped.load(Ordering::Relaxed),
            resets_applied: c.resets_applied.load(Ordering::Relaxed),
        }
    }

    /// Stops and joins the worker, then force-unsubscribes everyone.
    ///
    /// Voice-activity listeners get a final stop if speech was active.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake.set();
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == thread::current().id() {
                tracing::warn!("Pipeline disposed from its own worker thread; not joining");
            } else if let Err(payload) = handle.join() {
                let msg = super::error::panic_message(payload.as_ref());
                tracing::error!("Preprocessing thread panicked: {msg}");
            }
        }
        self.pending.lock().take();

        *self.shared.audio.lock() = Arc::new(Vec::new());
        let _announce = self.shared.announce.lock();
        let (listeners, speaking) = {
            let mut voice = self.shared.voice.lock();
            let listeners = std::mem::take(&mut voice.listeners);
            (listeners, std::mem::replace(&mut voice.speaking, false))
        };
        if speaking {
            for listener in listeners.iter() {
                notify(&*self.shared.reporter, listener, false);
            }
        }

        tracing::debug!(stats = ?self.stats(), "Disposed preprocessing pipeline");
    }
}

impl Drop for ProcessingPipeline {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl AudioSubscriber for ProcessingPipeline {
    fn receive(&self, frame: &[f32], format: WaveFormat) -> Result<()> {
        ProcessingPipeline::receive(self, frame, format)
    }

    fn reset(&self) -> Result<()> {
        self.request_reset();
        Ok(())
    }

    fn name(&self) -> &str {
        "processing-pipeline"
    }
}

fn notify(reporter: &dyn ErrorReporter, listener: &Arc<dyn VoiceActivityListener>, start: bool) {
    let result = isolate(|| {
        if start {
            listener.on_start()
        } else {
            listener.on_stop()
        }
    });
    if let Err(msg) = result {
        reporter.report(listener.name(), &Fault::Recoverable(msg));
    }
}

/// Re-framing applied after preprocessing when the output format differs.
enum OutputStage {
    Direct,
    Convert {
        chain: FrameAssembler<RateConverter<QueueSource>>,
        frame: Vec<f32>,
    },
}

impl OutputStage {
    fn new(config: &PipelineConfig) -> Result<Self> {
        if config.output_sample_rate == config.intermediate_sample_rate
            && config.output_frame_size == config.intermediate_frame_size
        {
            return Ok(OutputStage::Direct);
        }
        let queue = QueueSource::empty(config.intermediate_format());
        let converter = RateConverter::new(queue, config.output_sample_rate)?;
        Ok(OutputStage::Convert {
            chain: FrameAssembler::new(converter, config.output_frame_size),
            frame: vec![0.0; config.output_frame_size],
        })
    }

    fn reset(&mut self) {
        if let OutputStage::Convert { chain, .. } = self {
            chain.reset();
            chain.get_mut().reset();
            chain.get_mut().get_mut().clear();
        }
    }
}

/// Worker-thread side of the pipeline. Sole consumer of the ring buffer.
struct Worker {
    shared: Arc<Shared>,
    input: FrameAssembler<RateConverter<SampleReader>>,
    output: OutputStage,
    frame: Vec<f32>,
    meter: AmplitudeMeter,
    reset_applied: bool,
}

impl Worker {
    fn run(mut self) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_loop()));
        let message = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => super::error::panic_message(payload.as_ref()),
        };

        self.shared.faulted.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.reporter.report(
            "preprocessing-pipeline",
            &Fault::Fatal(format!("unhandled error killed the preprocessing thread: {message}")),
        );
    }

    fn run_loop(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let frame_size = self.frame.len();

        while shared.running.load(Ordering::SeqCst) {
            if self.buffered_input() < frame_size {
                shared.wake.wait(shared.config.wake_timeout);
            }
            if !shared.running.load(Ordering::SeqCst) {
                break;
            }

            let started = Instant::now();

            // A reset requested before the first iteration is covered by the
            // startup reset.
            if shared.reset_requested.swap(false, Ordering::SeqCst) && !self.reset_applied {
                self.apply_reset();
            }
            self.reset_applied = false;

            let mut missed = shared.dropped.swap(0, Ordering::AcqRel);

            let mut frame_count = 0u64;
            while self.input.read(&mut self.frame) {
                self.meter.update(&self.frame);
                shared
                    .amplitude
                    .store(self.meter.value().to_bits(), Ordering::Relaxed);
                self.process_and_emit()?;
                frame_count += 1;
            }
            shared
                .counters
                .frames_processed
                .fetch_add(frame_count, Ordering::Relaxed);

            let speaking = shared.preprocessor.lock().is_speech_detected();
            self.announce_speech(speaking);

            if missed > 0 {
                let mut silent = 0u64;
                while missed >= frame_size {
                    self.frame.fill(0.0);
                    self.process_and_emit()?;
                    missed -= frame_size;
                    silent += 1;
                }
                if missed > 0 {
                    shared.dropped.fetch_add(missed, Ordering::AcqRel);
                }
                shared
                    .counters
                    .silent_frames_injected
                    .fetch_add(silent, Ordering::Relaxed);
            }

            let elapsed = started.elapsed();
            let budget = Duration::from_millis(
                defaults::SLOW_ITERATION_BASE_MS + frame_count * defaults::SLOW_ITERATION_PER_FRAME_MS,
            );
            if elapsed > budget {
                tracing::warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    frames = frame_count,
                    "Preprocessor running slow"
                );
            }
        }
        Ok(())
    }

    fn buffered_input(&self) -> usize {
        self.input.buffered() + self.input.get_ref().get_ref().unread_count()
    }

    /// Runs the current frame through the preprocessor and delivers it.
    fn process_and_emit(&mut self) -> Result<()> {
        self.shared
            .preprocessor
            .lock()
            .process_frame(&mut self.frame)?;

        match &mut self.output {
            OutputStage::Direct => {
                deliver(&self.shared, &self.frame, self.shared.config.output_format())
            }
            OutputStage::Convert { chain, frame } => {
                chain.get_mut().get_mut().extend(&self.frame);
                let format = chain.format();
                while chain.read(frame) {
                    deliver(&self.shared, frame, format);
                }
            }
        }
        Ok(())
    }

    /// Sends start/stop to listeners if the speech state changed.
    fn announce_speech(&self, speaking: bool) {
        if self.shared.voice.lock().speaking == speaking {
            return;
        }
        let _announce = self.shared.announce.lock();
        let listeners = {
            let mut voice = self.shared.voice.lock();
            if voice.speaking == speaking {
                return;
            }
            voice.speaking = speaking;
            Arc::clone(&voice.listeners)
        };
        for listener in listeners.iter() {
            notify(&*self.shared.reporter, listener, speaking);
        }
    }

    fn apply_reset(&mut self) {
        self.input.reset();
        self.input.get_mut().reset();
        self.input.get_mut().get_mut().reset();
        self.output.reset();
        self.meter.reset();
        self.shared.amplitude.store(0, Ordering::Relaxed);
        self.shared.dropped.store(0, Ordering::SeqCst);
        self.shared.preprocessor.lock().reset();

        let subscribers = Arc::clone(&self.shared.audio.lock());
        for subscriber in subscribers.iter() {
            if let Err(msg) = isolate(|| subscriber.reset()) {
                self.shared
                    .reporter
                    .report(subscriber.name(), &Fault::Recoverable(msg));
            }
        }

        self.reset_applied = true;
        self.shared
            .counters
            .resets_applied
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Applied preprocessing pipeline reset");
    }
}

/// Fans one processed frame out to every audio subscriber, isolating each.
fn deliver(shared: &Shared, frame: &[f32], format: WaveFormat) {
    let subscribers = Arc::clone(&shared.audio.lock());
    for subscriber in subscribers.iter() {
        if let Err(msg) = isolate(|| subscriber.receive(frame, format)) {
            shared
                .reporter
                .report(subscriber.name(), &Fault::Recoverable(msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::tests::RecordingReporter;
    use crate::pipeline::subscriber::tests::{CollectingSubscriber, EventLog};
    use crate::preprocess::PassthroughPreprocessor;
    use crossbeam_channel::{Receiver, Sender, bounded};
    use std::sync::Weak;

    const FRAME: usize = 480;
    const RATE: u32 = 48000;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    fn config() -> PipelineConfig {
        PipelineConfig::new(WaveFormat::mono(RATE))
    }

    /// Preprocessor driven by the test: speech is whatever the test says,
    /// and frames can be held at a gate.
    struct ScriptedPreprocessor {
        speech: Arc<AtomicBool>,
        gate: Option<(Sender<()>, Receiver<()>)>,
        seen: Arc<AtomicUsize>,
        fail_after: Option<usize>,
        resets: Arc<AtomicUsize>,
        muted: Arc<AtomicBool>,
    }

    impl ScriptedPreprocessor {
        fn new() -> Self {
            Self {
                speech: Arc::new(AtomicBool::new(false)),
                gate: None,
                seen: Arc::new(AtomicUsize::new(0)),
                fail_after: None,
                resets: Arc::new(AtomicUsize::new(0)),
                muted: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl Preprocessor for ScriptedPreprocessor {
        fn process_frame(&mut self, frame: &mut [f32]) -> Result<()> {
            assert_eq!(frame.len(), FRAME);
            let n = self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail_after == Some(n) {
                return Err(VoicepipeError::Preprocessor {
                    message: "native failure".to_string(),
                });
            }
            if n == 0
                && let Some((entered, release)) = &self.gate
            {
                entered.send(()).unwrap();
                release.recv_timeout(Duration::from_secs(5)).unwrap();
            }
            Ok(())
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
            self.speech.store(false, Ordering::SeqCst);
        }

        fn is_speech_detected(&self) -> bool {
            self.speech.load(Ordering::SeqCst)
        }

        fn set_output_muted(&mut self, muted: bool) {
            self.muted.store(muted, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_frames_reach_subscribers_in_order() {
        let pipeline = ProcessingPipeline::new(config(), Box::new(PassthroughPreprocessor)).unwrap();
        let collector = Arc::new(CollectingSubscriber::default());
        pipeline.subscribe_audio(collector.clone());
        pipeline.start().unwrap();

        let input: Vec<f32> = (0..FRAME * 3).map(|i| i as f32 / 10_000.0).collect();
        for chunk in input.chunks(200) {
            pipeline.receive(chunk, WaveFormat::mono(RATE)).unwrap();
        }

        assert!(wait_until(|| collector.frame_count() == 3));
        let frames = collector.frames.lock().concat();
        assert_eq!(frames, input);
        assert_eq!(collector.formats.lock()[0], WaveFormat::mono(RATE));
        pipeline.dispose();
    }

    #[test]
    fn test_format_mismatch_is_rejected() {
        let pipeline = ProcessingPipeline::new(config(), Box::new(PassthroughPreprocessor)).unwrap();
        let result = pipeline.receive(&[0.0; 10], WaveFormat::mono(44100));
        assert!(matches!(
            result,
            Err(VoicepipeError::AudioFormatMismatch { .. })
        ));
    }

    #[test]
    fn test_dropped_samples_are_compensated_with_silence() {
        let mut cfg = config();
        cfg.buffer_frames = 4;
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let mut pre = ScriptedPreprocessor::new();
        pre.gate = Some((entered_tx, release_rx));
        let seen = Arc::clone(&pre.seen);

        let pipeline = ProcessingPipeline::new(cfg, Box::new(pre)).unwrap();
        let collector = Arc::new(CollectingSubscriber::default());
        pipeline.subscribe_audio(collector.clone());
        pipeline.start().unwrap();

        // Hold the worker inside its first frame.
        pipeline.receive(&[0.1; FRAME], WaveFormat::mono(RATE)).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Ring holds 4 frames; the other 6 frames' worth is dropped.
        pipeline.receive(&vec![0.2; FRAME * 10], WaveFormat::mono(RATE)).unwrap();
        release_tx.send(()).unwrap();

        assert!(wait_until(|| seen.load(Ordering::SeqCst) == 11));
        assert!(wait_until(|| collector.frame_count() == 11));
        let stats = pipeline.stats();
        assert_eq!(stats.samples_dropped, (FRAME * 6) as u64);
        assert_eq!(stats.frames_processed, 5);
        assert_eq!(stats.silent_frames_injected, 6);
        assert_eq!(collector.sample_count(), FRAME * 11);
        pipeline.dispose();
    }

    #[test]
    fn test_partial_frame_drop_remainder_carries_over() {
        let mut cfg = config();
        cfg.buffer_frames = 2;
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let mut pre = ScriptedPreprocessor::new();
        pre.gate = Some((entered_tx, release_rx));

        let pipeline = ProcessingPipeline::new(cfg, Box::new(pre)).unwrap();
        pipeline.start().unwrap();
        pipeline.receive(&[0.1; FRAME], WaveFormat::mono(RATE)).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // 2 frames fit; 1.5 frames are dropped.
        pipeline
            .receive(&vec![0.2; FRAME * 2 + FRAME * 3 / 2], WaveFormat::mono(RATE))
            .unwrap();
        release_tx.send(()).unwrap();

        assert!(wait_until(|| pipeline.stats().silent_frames_injected == 1));
        // The half-frame remainder stays pending instead of being rounded up.
        thread::sleep(Duration::from_millis(250));
        let stats = pipeline.stats();
        assert_eq!(stats.silent_frames_injected, 1);
        assert_eq!(stats.samples_dropped, (FRAME * 3 / 2) as u64);
        assert_eq!(stats.frames_processed, 3);
        pipeline.dispose();
    }

    #[test]
    fn test_reset_requests_before_start_collapse() {
        let pipeline = ProcessingPipeline::new(config(), Box::new(PassthroughPreprocessor)).unwrap();
        let collector = Arc::new(CollectingSubscriber::default());
        pipeline.subscribe_audio(collector.clone());

        pipeline.request_reset();
        pipeline.request_reset();
        pipeline.request_reset();
        assert_eq!(pipeline.state(), PipelineState::Created);
        pipeline.start().unwrap();

        pipeline.receive(&[0.0; FRAME], WaveFormat::mono(RATE)).unwrap();
        assert!(wait_until(|| collector.frame_count() == 1));
        assert_eq!(pipeline.stats().resets_applied, 1);
        assert_eq!(collector.resets.load(Ordering::SeqCst), 1);
        pipeline.dispose();
    }

    #[test]
    fn test_reset_is_applied_once_per_request() {
        let pre = ScriptedPreprocessor::new();
        let resets = Arc::clone(&pre.resets);
        let pipeline = ProcessingPipeline::new(config(), Box::new(pre)).unwrap();
        pipeline.start().unwrap();
        assert!(wait_until(|| pipeline.stats().resets_applied == 1));

        // Let the worker pass its first iteration so the startup reset no
        // longer covers new requests.
        pipeline.receive(&[0.0; FRAME], WaveFormat::mono(RATE)).unwrap();
        assert!(wait_until(|| pipeline.stats().frames_processed == 1));

        pipeline.request_reset();
        assert!(wait_until(|| pipeline.stats().resets_applied == 2));
        assert_eq!(resets.load(Ordering::SeqCst), 2);
        assert!(wait_until(|| pipeline.state() == PipelineState::Running));
        pipeline.dispose();
    }

    #[test]
    fn test_reset_discards_buffered_audio() {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let mut pre = ScriptedPreprocessor::new();
        pre.gate = Some((entered_tx, release_rx));
        let pipeline = ProcessingPipeline::new(config(), Box::new(pre)).unwrap();
        let collector = Arc::new(CollectingSubscriber::default());
        pipeline.subscribe_audio(collector.clone());
        pipeline.start().unwrap();

        pipeline.receive(&[0.1; FRAME], WaveFormat::mono(RATE)).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Partial frame before the reset must never be joined with audio after it.
        pipeline.receive(&[0.5; FRAME / 2], WaveFormat::mono(RATE)).unwrap();
        pipeline.request_reset();
        release_tx.send(()).unwrap();
        assert!(wait_until(|| pipeline.stats().resets_applied == 2));

        pipeline.receive(&[0.9; FRAME], WaveFormat::mono(RATE)).unwrap();
        assert!(wait_until(|| collector.frame_count() == 2));
        let frames = collector.frames.lock();
        assert!(frames[1].iter().all(|&s| s == 0.9));
        drop(frames);
        pipeline.dispose();
    }

    #[test]
    fn test_speech_edges_and_late_joiners() {
        let pre = ScriptedPreprocessor::new();
        let speech = Arc::clone(&pre.speech);
        let pipeline = ProcessingPipeline::new(config(), Box::new(pre)).unwrap();
        let early = Arc::new(EventLog::default());
        pipeline.subscribe_voice_activity(early.clone());
        pipeline.start().unwrap();

        speech.store(true, Ordering::SeqCst);
        pipeline.receive(&[0.1; FRAME], WaveFormat::mono(RATE)).unwrap();
        assert!(wait_until(|| pipeline.is_speech_active()));
        assert_eq!(early.snapshot(), vec!["start"]);

        // Joining mid-speech gets an immediate start.
        let late = Arc::new(EventLog::default());
        let late_handle: Arc<dyn VoiceActivityListener> = late.clone();
        pipeline.subscribe_voice_activity(late_handle.clone());
        assert_eq!(late.snapshot(), vec!["start"]);

        // Leaving mid-speech gets a stop addressed only to the leaver.
        assert!(pipeline.unsubscribe_voice_activity(&late_handle));
        assert_eq!(late.snapshot(), vec!["start", "stop"]);
        assert_eq!(early.snapshot(), vec!["start"]);
        assert!(!pipeline.unsubscribe_voice_activity(&late_handle));

        speech.store(false, Ordering::SeqCst);
        pipeline.receive(&[0.1; FRAME], WaveFormat::mono(RATE)).unwrap();
        assert!(wait_until(|| !pipeline.is_speech_active()));
        assert_eq!(early.snapshot(), vec!["start", "stop"]);
        pipeline.dispose();
    }

    #[test]
    fn test_reset_burst_on_running_pipeline_applies_once() {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let mut pre = ScriptedPreprocessor::new();
        pre.gate = Some((entered_tx, release_rx));
        let resets = Arc::clone(&pre.resets);
        let pipeline = ProcessingPipeline::new(config(), Box::new(pre)).unwrap();
        let collector = Arc::new(CollectingSubscriber::default());
        pipeline.subscribe_audio(collector.clone());
        pipeline.start().unwrap();
        assert_eq!(pipeline.stats().resets_applied, 1);

        // Worker is inside process_frame while the requests pile up.
        pipeline.receive(&[0.1; FRAME], WaveFormat::mono(RATE)).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        for _ in 0..5 {
            pipeline.request_reset();
        }
        release_tx.send(()).unwrap();

        assert!(wait_until(|| pipeline.stats().resets_applied == 2));
        thread::sleep(Duration::from_millis(250));
        assert_eq!(pipeline.stats().resets_applied, 2);
        assert_eq!(resets.load(Ordering::SeqCst), 2);
        assert_eq!(collector.resets.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.state(), PipelineState::Running);
        pipeline.dispose();
    }

    /// Listener that queries the pipeline from inside its callbacks.
    #[derive(Default)]
    struct QueryingListener {
        pipeline: Mutex<Weak<ProcessingPipeline>>,
        observed: Mutex<Vec<(&'static str, bool)>>,
    }

    impl QueryingListener {
        fn record(&self, event: &'static str) {
            let pipeline = self.pipeline.lock().upgrade();
            if let Some(pipeline) = pipeline {
                let active = pipeline.is_speech_active();
                self.observed.lock().push((event, active));
            }
        }
    }

    impl VoiceActivityListener for QueryingListener {
        fn on_start(&self) -> Result<()> {
            self.record("start");
            Ok(())
        }

        fn on_stop(&self) -> Result<()> {
            self.record("stop");
            Ok(())
        }
    }

    #[test]
    fn test_listener_may_query_pipeline_from_callbacks() {
        let pre = ScriptedPreprocessor::new();
        let speech = Arc::clone(&pre.speech);
        let pipeline = Arc::new(ProcessingPipeline::new(config(), Box::new(pre)).unwrap());
        pipeline.start().unwrap();
        speech.store(true, Ordering::SeqCst);
        pipeline.receive(&[0.1; FRAME], WaveFormat::mono(RATE)).unwrap();
        assert!(wait_until(|| pipeline.is_speech_active()));

        let listener = Arc::new(QueryingListener::default());
        *listener.pipeline.lock() = Arc::downgrade(&pipeline);

        // Run on a helper so a hang fails the test instead of stalling it.
        let (done_tx, done_rx) = bounded(1);
        {
            let pipeline = Arc::clone(&pipeline);
            let handle: Arc<dyn VoiceActivityListener> = listener.clone();
            thread::spawn(move || {
                pipeline.subscribe_voice_activity(Arc::clone(&handle));
                pipeline.unsubscribe_voice_activity(&handle);
                done_tx.send(()).unwrap();
            });
        }
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("subscribe/unsubscribe blocked on a re-entrant listener");
        assert_eq!(
            *listener.observed.lock(),
            vec![("start", true), ("stop", true)]
        );

        // Worker-side edges and dispose call back in as well.
        pipeline.subscribe_voice_activity(listener.clone());
        let (done_tx, done_rx) = bounded(1);
        {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                pipeline.dispose();
                done_tx.send(()).unwrap();
            });
        }
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("dispose blocked on a re-entrant listener");
        assert_eq!(
            *listener.observed.lock(),
            vec![("start", true), ("stop", true), ("start", true), ("stop", false)]
        );
    }

    /// Listener whose first `on_start` blocks until released.
    struct GatedListener {
        log: EventLog,
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl VoiceActivityListener for GatedListener {
        fn on_start(&self) -> Result<()> {
            self.log.on_start()?;
            self.entered.send(()).unwrap();
            self.release.recv_timeout(Duration::from_secs(5)).unwrap();
            Ok(())
        }

        fn on_stop(&self) -> Result<()> {
            self.log.on_stop()
        }
    }

    #[test]
    fn test_unsubscribe_waits_for_in_flight_announcement() {
        let pre = ScriptedPreprocessor::new();
        let speech = Arc::clone(&pre.speech);
        let pipeline = Arc::new(ProcessingPipeline::new(config(), Box::new(pre)).unwrap());
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let listener = Arc::new(GatedListener {
            log: EventLog::default(),
            entered: entered_tx,
            release: release_rx,
        });
        let handle: Arc<dyn VoiceActivityListener> = listener.clone();
        pipeline.subscribe_voice_activity(Arc::clone(&handle));
        pipeline.start().unwrap();

        speech.store(true, Ordering::SeqCst);
        pipeline.receive(&[0.1; FRAME], WaveFormat::mono(RATE)).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (done_tx, done_rx) = bounded(1);
        {
            let pipeline = Arc::clone(&pipeline);
            let handle = Arc::clone(&handle);
            thread::spawn(move || {
                let removed = pipeline.unsubscribe_voice_activity(&handle);
                done_tx.send(removed).unwrap();
            });
        }
        // The worker is still announcing the start edge.
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

        release_tx.send(()).unwrap();
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(listener.log.snapshot(), vec!["start", "stop"]);

        // No stale edges reach the departed listener.
        speech.store(false, Ordering::SeqCst);
        pipeline.receive(&[0.1; FRAME], WaveFormat::mono(RATE)).unwrap();
        assert!(wait_until(|| !pipeline.is_speech_active()));
        assert_eq!(listener.log.snapshot(), vec!["start", "stop"]);
        pipeline.dispose();
    }

    #[test]
    fn test_dispose_sends_stop_to_remaining_listeners() {
        let pre = ScriptedPreprocessor::new();
        let speech = Arc::clone(&pre.speech);
        let pipeline = ProcessingPipeline::new(config(), Box::new(pre)).unwrap();
        let log = Arc::new(EventLog::default());
        pipeline.subscribe_voice_activity(log.clone());
        pipeline.start().unwrap();
        speech.store(true, Ordering::SeqCst);
        pipeline.receive(&[0.1; FRAME], WaveFormat::mono(RATE)).unwrap();
        assert!(wait_until(|| pipeline.is_speech_active()));

        pipeline.dispose();
        assert_eq!(log.snapshot(), vec!["start", "stop"]);
        assert_eq!(pipeline.state(), PipelineState::Disposed);
        assert!(pipeline.start().is_err());
    }

    #[test]
    fn test_failing_subscribers_do_not_break_fan_out() {
        let reporter = Arc::new(RecordingReporter::default());
        let pipeline = ProcessingPipeline::with_reporter(
            config(),
            Box::new(PassthroughPreprocessor),
            reporter.clone(),
        )
        .unwrap();
        pipeline.subscribe_audio(Arc::new(CollectingSubscriber::failing()));
        pipeline.subscribe_audio(Arc::new(CollectingSubscriber::panicking()));
        let healthy = Arc::new(CollectingSubscriber::default());
        pipeline.subscribe_audio(healthy.clone());
        pipeline.start().unwrap();

        pipeline.receive(&[0.1; FRAME * 2], WaveFormat::mono(RATE)).unwrap();
        assert!(wait_until(|| healthy.frame_count() == 2));
        assert!(!pipeline.is_faulted());
        // Startup reset failure + 2 frames x 2 faulty subscribers.
        assert!(wait_until(|| reporter.faults.lock().len() >= 4));
        assert!(
            reporter
                .faults
                .lock()
                .iter()
                .all(|(_, f)| matches!(f, Fault::Recoverable(_)))
        );
        pipeline.dispose();
    }

    #[test]
    fn test_unsubscribe_audio_stops_delivery() {
        let pipeline = ProcessingPipeline::new(config(), Box::new(PassthroughPreprocessor)).unwrap();
        let collector = Arc::new(CollectingSubscriber::default());
        let handle: Arc<dyn AudioSubscriber> = collector.clone();
        pipeline.subscribe_audio(handle.clone());
        pipeline.start().unwrap();

        pipeline.receive(&[0.1; FRAME], WaveFormat::mono(RATE)).unwrap();
        assert!(wait_until(|| collector.frame_count() == 1));
        assert!(pipeline.unsubscribe_audio(&handle));
        assert!(!pipeline.unsubscribe_audio(&handle));

        pipeline.receive(&[0.1; FRAME], WaveFormat::mono(RATE)).unwrap();
        assert!(wait_until(|| pipeline.stats().frames_processed == 2));
        assert_eq!(collector.frame_count(), 1);
        pipeline.dispose();
    }

    #[test]
    fn test_preprocessor_error_kills_worker() {
        let reporter = Arc::new(RecordingReporter::default());
        let mut pre = ScriptedPreprocessor::new();
        pre.fail_after = Some(0);
        let pipeline =
            ProcessingPipeline::with_reporter(config(), Box::new(pre), reporter.clone()).unwrap();
        pipeline.start().unwrap();
        pipeline.receive(&[0.1; FRAME], WaveFormat::mono(RATE)).unwrap();

        assert!(wait_until(|| pipeline.is_faulted()));
        let faults = reporter.faults.lock();
        assert!(matches!(faults.last(), Some((_, Fault::Fatal(_)))));
        drop(faults);
        pipeline.dispose();
    }

    #[test]
    fn test_output_stage_reframes_to_output_format() {
        let mut cfg = config();
        cfg.output_sample_rate = 16000;
        cfg.output_frame_size = 320;
        let pipeline = ProcessingPipeline::new(cfg, Box::new(PassthroughPreprocessor)).unwrap();
        let collector = Arc::new(CollectingSubscriber::default());
        pipeline.subscribe_audio(collector.clone());
        pipeline.start().unwrap();

        // 100ms at 48kHz becomes ~1600 samples at 16kHz, i.e. ~5 frames.
        pipeline.receive(&vec![0.1; 4800], WaveFormat::mono(RATE)).unwrap();
        assert!(wait_until(|| collector.frame_count() >= 4));
        assert!(collector.frames.lock().iter().all(|f| f.len() == 320));
        assert_eq!(collector.formats.lock()[0], WaveFormat::mono(16000));
        pipeline.dispose();
    }

    #[test]
    fn test_amplitude_tracks_input() {
        let pipeline = ProcessingPipeline::new(config(), Box::new(PassthroughPreprocessor)).unwrap();
        pipeline.start().unwrap();
        for _ in 0..20 {
            pipeline.receive(&[0.5; FRAME], WaveFormat::mono(RATE)).unwrap();
        }
        assert!(wait_until(|| pipeline.amplitude() > 0.3));
        pipeline.dispose();
    }

    #[test]
    fn test_output_muted_reaches_preprocessor() {
        let pre = ScriptedPreprocessor::new();
        let muted = Arc::clone(&pre.muted);
        let pipeline = ProcessingPipeline::new(config(), Box::new(pre)).unwrap();
        pipeline.set_output_muted(true);
        assert!(muted.load(Ordering::SeqCst));
        pipeline.set_output_muted(false);
        assert!(!muted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_upstream_latency_round_trip() {
        let pipeline = ProcessingPipeline::new(config(), Box::new(PassthroughPreprocessor)).unwrap();
        pipeline.set_upstream_latency(Duration::from_millis(30));
        assert_eq!(pipeline.upstream_latency(), Duration::from_millis(30));
    }

    #[test]
    fn test_resampled_input_is_framed() {
        let cfg = PipelineConfig::new(WaveFormat::mono(44100));
        let pipeline = ProcessingPipeline::new(cfg, Box::new(PassthroughPreprocessor)).unwrap();
        let collector = Arc::new(CollectingSubscriber::default());
        pipeline.subscribe_audio(collector.clone());
        pipeline.start().unwrap();

        for _ in 0..10 {
            pipeline.receive(&[0.2; 441], WaveFormat::mono(44100)).unwrap();
        }
        assert!(wait_until(|| collector.frame_count() == 10));
        assert!(collector.frames.lock().iter().all(|f| f.len() == FRAME));
        pipeline.dispose();
    }

    #[test]
    fn test_state_transitions() {
        let pipeline = ProcessingPipeline::new(config(), Box::new(PassthroughPreprocessor)).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Created);
        pipeline.start().unwrap();
        pipeline.start().unwrap();
        assert!(wait_until(|| pipeline.state() == PipelineState::Running));
        pipeline.dispose();
        pipeline.dispose();
        assert_eq!(pipeline.state(), PipelineState::Disposed);
    }
}
