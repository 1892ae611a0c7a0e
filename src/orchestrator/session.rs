//! Network session capability consulted by the orchestrator every tick.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// What the orchestrator needs to know about the voice session.
pub trait Session: Send + Sync {
    /// Whether this endpoint should be transmitting at all.
    fn is_transmit_enabled(&self) -> bool;

    /// Destinations currently open for outgoing voice.
    fn open_channel_count(&self) -> usize;

    /// Closes and reopens open channels so the remote end drops stale
    /// stream state. Called on every pipeline rebuild.
    fn refresh_channels(&self);

    /// Measured incoming packet loss, 0.0 to 1.0.
    fn incoming_packet_loss(&self) -> f32;
}

/// In-process session whose state is set directly.
#[derive(Debug)]
pub struct StaticSession {
    transmit_enabled: AtomicBool,
    channels: AtomicUsize,
    /// f32 bits.
    packet_loss: AtomicU32,
    refreshes: AtomicU64,
}

impl StaticSession {
    /// Transmitting, with one open channel and no loss.
    pub fn new() -> Self {
        Self {
            transmit_enabled: AtomicBool::new(true),
            channels: AtomicUsize::new(1),
            packet_loss: AtomicU32::new(0),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn set_transmit_enabled(&self, enabled: bool) {
        self.transmit_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_open_channels(&self, count: usize) {
        self.channels.store(count, Ordering::SeqCst);
    }

    pub fn set_packet_loss(&self, loss: f32) {
        self.packet_loss
            .store(loss.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Number of `refresh_channels` calls so far.
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl Default for StaticSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Session for StaticSession {
    fn is_transmit_enabled(&self) -> bool {
        self.transmit_enabled.load(Ordering::SeqCst)
    }

    fn open_channel_count(&self) -> usize {
        self.channels.load(Ordering::SeqCst)
    }

    fn refresh_channels(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            channels = self.open_channel_count(),
            "Refreshing open channels"
        );
    }

    fn incoming_packet_loss(&self) -> f32 {
        f32::from_bits(self.packet_loss.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let session = StaticSession::new();
        assert!(session.is_transmit_enabled());
        assert_eq!(session.open_channel_count(), 1);
        assert_eq!(session.incoming_packet_loss(), 0.0);
    }

    #[test]
    fn test_setters() {
        let session = StaticSession::new();
        session.set_transmit_enabled(false);
        session.set_open_channels(3);
        session.set_packet_loss(1.5);
        assert!(!session.is_transmit_enabled());
        assert_eq!(session.open_channel_count(), 3);
        assert_eq!(session.incoming_packet_loss(), 1.0);
    }

    #[test]
    fn test_refresh_counts() {
        let session = StaticSession::new();
        session.refresh_channels();
        session.refresh_channels();
        assert_eq!(session.refreshes(), 2);
    }
}
