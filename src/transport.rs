//! Outgoing voice transport capability.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::atomic::{AtomicU64, Ordering};

/// Sends encoded voice packets. Fire-and-forget: no acknowledgement.
pub trait Transport: Send + Sync {
    fn send_voice(&self, packet: &[u8]);
}

/// Transport over a bounded in-process channel.
///
/// A full queue drops the packet, mirroring an unreliable network.
pub struct ChannelTransport {
    tx: Sender<Vec<u8>>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Transport for ChannelTransport {
    fn send_voice(&self, packet: &[u8]) {
        match self.tx.try_send(packet.to_vec()) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Voice packet queue full, dropping packet");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
