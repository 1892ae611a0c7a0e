//! Capture source capability and its in-process test double.

use super::format::WaveFormat;
use crate::pipeline::error::isolate;
use crate::pipeline::subscriber::{AudioSubscriber, same_subscriber};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// A device (or stand-in) that produces raw samples.
///
/// Samples are pushed to subscribers from whatever thread the source
/// produces on. Failures surface as `None` or `false`, never as errors, so
/// the orchestrator can decide to disable transmission.
pub trait CaptureSource: Send {
    /// Starts capture on `device` (`None` for the system default).
    ///
    /// Returns the format samples will be delivered in, or `None` when the
    /// source could not start.
    fn start(&mut self, device: Option<&str>) -> Option<WaveFormat>;

    fn stop(&mut self);

    fn is_recording(&self) -> bool;

    /// Estimated capture latency, handed to the preprocessor.
    fn latency(&self) -> Duration;

    /// Per-tick housekeeping. Returns true when the source wants the whole
    /// pipeline rebuilt (device lost, format changed).
    fn pump(&mut self) -> bool;

    fn subscribe(&self, subscriber: Arc<dyn AudioSubscriber>);

    fn unsubscribe(&self, subscriber: &Arc<dyn AudioSubscriber>) -> bool;
}

/// Subscriber list shared between a source and its producer thread.
#[derive(Default)]
pub struct CaptureFanout {
    subscribers: Mutex<Arc<Vec<Arc<dyn AudioSubscriber>>>>,
}

impl CaptureFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn AudioSubscriber>) {
        let mut list = self.subscribers.lock();
        let mut next = Vec::clone(&list);
        next.push(subscriber);
        *list = Arc::new(next);
    }

    pub fn unsubscribe(&self, subscriber: &Arc<dyn AudioSubscriber>) -> bool {
        let mut list = self.subscribers.lock();
        let Some(pos) = list.iter().position(|s| same_subscriber(s, subscriber)) else {
            return false;
        };
        let mut next = Vec::clone(&list);
        next.remove(pos);
        *list = Arc::new(next);
        true
    }

    pub fn clear(&self) {
        *self.subscribers.lock() = Arc::new(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes one block to every subscriber. A failing subscriber is logged
    /// and skipped.
    pub fn deliver(&self, samples: &[f32], format: WaveFormat) {
        let snapshot = Arc::clone(&self.subscribers.lock());
        for subscriber in snapshot.iter() {
            if let Err(message) = isolate(|| subscriber.receive(samples, format)) {
                tracing::warn!(
                    subscriber = subscriber.name(),
                    error = %message,
                    "Capture subscriber rejected samples"
                );
            }
        }
    }
}

/// Scriptable capture source for tests and demos.
///
/// Samples are injected through a [`MockCaptureHandle`], which stays usable
/// after the source itself has been boxed and handed to an orchestrator.
pub struct MockCaptureSource {
    shared: Arc<MockShared>,
}

struct MockShared {
    fanout: CaptureFanout,
    format: Mutex<WaveFormat>,
    latency: Mutex<Duration>,
    fail_start: AtomicBool,
    recording: AtomicBool,
    rebuild_requested: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    last_device: Mutex<Option<String>>,
}

/// Test-side handle of a [`MockCaptureSource`].
#[derive(Clone)]
pub struct MockCaptureHandle {
    shared: Arc<MockShared>,
}

impl MockCaptureSource {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MockShared {
                fanout: CaptureFanout::new(),
                format: Mutex::new(WaveFormat::mono(48000)),
                latency: Mutex::new(Duration::ZERO),
                fail_start: AtomicBool::new(false),
                recording: AtomicBool::new(false),
                rebuild_requested: AtomicBool::new(false),
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                last_device: Mutex::new(None),
            }),
        }
    }

    /// Configure the format reported by `start`
    pub fn with_format(self, format: WaveFormat) -> Self {
        *self.shared.format.lock() = format;
        self
    }

    /// Configure the mock to fail on start
    pub fn with_start_failure(self) -> Self {
        self.shared.fail_start.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.shared.latency.lock() = latency;
        self
    }

    pub fn handle(&self) -> MockCaptureHandle {
        MockCaptureHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for MockCaptureSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for MockCaptureSource {
    fn start(&mut self, device: Option<&str>) -> Option<WaveFormat> {
        *self.shared.last_device.lock() = device.map(str::to_string);
        if self.shared.fail_start.load(Ordering::SeqCst) {
            return None;
        }
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        self.shared.recording.store(true, Ordering::SeqCst);
        Some(*self.shared.format.lock())
    }

    fn stop(&mut self) {
        if self.shared.recording.swap(false, Ordering::SeqCst) {
            self.shared.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Duration {
        *self.shared.latency.lock()
    }

    fn pump(&mut self) -> bool {
        self.shared.rebuild_requested.swap(false, Ordering::SeqCst)
    }

    fn subscribe(&self, subscriber: Arc<dyn AudioSubscriber>) {
        self.shared.fanout.subscribe(subscriber);
    }

    fn unsubscribe(&self, subscriber: &Arc<dyn AudioSubscriber>) -> bool {
        self.shared.fanout.unsubscribe(subscriber)
    }
}

impl MockCaptureHandle {
    /// Delivers samples to subscribers in the started format. Ignored while
    /// the source is not recording.
    pub fn push(&self, samples: &[f32]) -> bool {
        if !self.shared.recording.load(Ordering::SeqCst) {
            return false;
        }
        let format = *self.shared.format.lock();
        self.shared.fanout.deliver(samples, format);
        true
    }

    /// Delivers samples claiming an arbitrary format.
    pub fn push_as(&self, samples: &[f32], format: WaveFormat) {
        self.shared.fanout.deliver(samples, format);
    }

    /// Makes the next `pump` ask for a rebuild.
    pub fn request_rebuild(&self) {
        self.shared.rebuild_requested.store(true, Ordering::SeqCst);
    }

    /// Format reported by the next `start`.
    pub fn set_format(&self, format: WaveFormat) {
        *self.shared.format.lock() = format;
    }

    pub fn set_start_failure(&self, fail: bool) {
        self.shared.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.shared.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.shared.stops.load(Ordering::SeqCst)
    }

    pub fn last_device(&self) -> Option<String> {
        self.shared.last_device.lock().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.fanout.len()
    }
}
