//! 16-bit little-endian PCM "codec".
//!
//! No compression; useful for loopback, recording and tests.

use super::Encoder;
use crate::error::{Result, VoicepipeError};

#[derive(Debug, Clone)]
pub struct PcmEncoder {
    frame_size: usize,
    sample_rate: u32,
    packet_loss: f32,
}

impl PcmEncoder {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            frame_size,
            sample_rate,
            packet_loss: 0.0,
        }
    }

    pub fn packet_loss(&self) -> f32 {
        self.packet_loss
    }
}

impl Encoder for PcmEncoder {
    fn encode(&mut self, frame: &[f32], out: &mut Vec<u8>) -> Result<()> {
        if frame.len() != self.frame_size {
            return Err(VoicepipeError::Encoder {
                message: format!(
                    "expected {} samples per frame, got {}",
                    self.frame_size,
                    frame.len()
                ),
            });
        }
        out.reserve(frame.len() * 2);
        for &sample in frame {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            out.extend_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn set_packet_loss(&mut self, loss: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&loss) {
            return Err(VoicepipeError::Encoder {
                message: format!("packet loss must be between 0 and 1, got {}", loss),
            });
        }
        self.packet_loss = loss;
        Ok(())
    }

    fn reset(&mut self) {}
}

/// Decodes a packet produced by [`PcmEncoder`].
pub fn decode(packet: &[u8]) -> Vec<f32> {
    packet
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_produces_two_bytes_per_sample() {
        let mut encoder = PcmEncoder::new(4, 48000);
        let mut packet = Vec::new();
        encoder.encode(&[0.0, 1.0, -1.0, 0.5], &mut packet).unwrap();
        assert_eq!(packet.len(), 8);
        assert_eq!(&packet[2..4], &i16::MAX.to_le_bytes());
    }

    #[test]
    fn test_decode_restores_levels() {
        let mut encoder = PcmEncoder::new(3, 48000);
        let mut packet = Vec::new();
        encoder.encode(&[0.25, -0.5, 2.0], &mut packet).unwrap();
        let decoded = decode(&packet);
        assert!((decoded[0] - 0.25).abs() < 1e-3);
        assert!((decoded[1] + 0.5).abs() < 1e-3);
        // Out-of-range input is clipped.
        assert!((decoded[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_wrong_frame_size_is_error() {
        let mut encoder = PcmEncoder::new(960, 48000);
        let mut packet = Vec::new();
        assert!(encoder.encode(&[0.0; 480], &mut packet).is_err());
        assert!(packet.is_empty());
    }

    #[test]
    fn test_packet_loss_range() {
        let mut encoder = PcmEncoder::new(960, 48000);
        encoder.set_packet_loss(0.1).unwrap();
        assert_eq!(encoder.packet_loss(), 0.1);
        assert!(encoder.set_packet_loss(1.5).is_err());
        assert!(encoder.set_packet_loss(-0.1).is_err());
        assert_eq!(encoder.packet_loss(), 0.1);
    }
}
