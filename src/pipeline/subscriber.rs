//! Subscriber capabilities fed by the processing pipeline.

use crate::audio::format::WaveFormat;
use crate::error::Result;
use std::sync::Arc;

/// Receives processed audio frames.
///
/// Called on the pipeline worker thread; implementations must not block
/// for long.
pub trait AudioSubscriber: Send + Sync {
    fn receive(&self, frame: &[f32], format: WaveFormat) -> Result<()>;

    /// The stream is discontinuous from here on; drop buffered state.
    fn reset(&self) -> Result<()> {
        Ok(())
    }

    /// Name used in fault reports.
    fn name(&self) -> &str {
        "audio-subscriber"
    }
}

/// Receives voice-activity transitions.
pub trait VoiceActivityListener: Send + Sync {
    fn on_start(&self) -> Result<()>;

    fn on_stop(&self) -> Result<()>;

    fn name(&self) -> &str {
        "voice-activity-listener"
    }
}

/// Identity comparison for trait-object handles, ignoring vtables.
pub fn same_subscriber<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::VoicepipeError;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Audio subscriber that records every frame and reset.
    #[derive(Default)]
    pub(crate) struct CollectingSubscriber {
        pub frames: Mutex<Vec<Vec<f32>>>,
        pub formats: Mutex<Vec<WaveFormat>>,
        pub resets: AtomicUsize,
        pub fail: bool,
        pub panic: bool,
    }

    impl CollectingSubscriber {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn panicking() -> Self {
            Self {
                panic: true,
                ..Self::default()
            }
        }

        pub fn frame_count(&self) -> usize {
            self.frames.lock().len()
        }

        pub fn sample_count(&self) -> usize {
            self.frames.lock().iter().map(Vec::len).sum()
        }
    }

    impl AudioSubscriber for CollectingSubscriber {
        fn receive(&self, frame: &[f32], format: WaveFormat) -> Result<()> {
            if self.panic {
                panic!("subscriber panic");
            }
            if self.fail {
                return Err(VoicepipeError::Other("subscriber failure".to_string()));
            }
            self.frames.lock().push(frame.to_vec());
            self.formats.lock().push(format);
            Ok(())
        }

        fn reset(&self) -> Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(VoicepipeError::Other("reset failure".to_string()));
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "collector"
        }
    }

    /// Voice-activity listener that logs events as strings.
    #[derive(Default)]
    pub(crate) struct EventLog {
        pub events: Mutex<Vec<&'static str>>,
        pub fail: bool,
    }

    impl EventLog {
        pub fn snapshot(&self) -> Vec<&'static str> {
            self.events.lock().clone()
        }
    }

    impl VoiceActivityListener for EventLog {
        fn on_start(&self) -> Result<()> {
            self.events.lock().push("start");
            if self.fail {
                return Err(VoicepipeError::Other("listener failure".to_string()));
            }
            Ok(())
        }

        fn on_stop(&self) -> Result<()> {
            self.events.lock().push("stop");
            Ok(())
        }
    }

    #[test]
    fn test_same_subscriber_identity() {
        let a: Arc<dyn AudioSubscriber> = Arc::new(CollectingSubscriber::default());
        let b: Arc<dyn AudioSubscriber> = Arc::new(CollectingSubscriber::default());
        let a2 = Arc::clone(&a);
        assert!(same_subscriber(&a, &a2));
        assert!(!same_subscriber(&a, &b));
    }

    #[test]
    fn test_default_reset_and_name() {
        struct Silent;
        impl AudioSubscriber for Silent {
            fn receive(&self, _: &[f32], _: WaveFormat) -> Result<()> {
                Ok(())
            }
        }
        assert!(Silent.reset().is_ok());
        assert_eq!(Silent.name(), "audio-subscriber");
    }
}
