//! Voice codec capability.

pub mod pcm;

pub use pcm::PcmEncoder;

use crate::error::Result;

/// Encodes fixed-size frames into packets.
///
/// Dropping the value releases the codec instance.
pub trait Encoder: Send {
    /// Encodes exactly `frame_size()` samples, appending the packet to `out`.
    fn encode(&mut self, frame: &[f32], out: &mut Vec<u8>) -> Result<()>;

    fn frame_size(&self) -> usize;

    fn sample_rate(&self) -> u32;

    /// Expected outgoing packet loss, 0.0 to 1.0.
    fn set_packet_loss(&mut self, loss: f32) -> Result<()>;

    /// Forgets stream state between transmissions.
    fn reset(&mut self);
}
