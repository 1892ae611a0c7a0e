//! Encoder stage: processed frames in, voice packets out.
//!
//! Frames are converted to the codec rate, assembled into codec-sized
//! frames, encoded and handed to the transport. A stop request lets one
//! final packet through so the remote end sees the stream end.

use super::subscriber::AudioSubscriber;
use crate::audio::format::WaveFormat;
use crate::audio::framer::FrameAssembler;
use crate::audio::resampler::RateConverter;
use crate::audio::source::QueueSource;
use crate::codec::Encoder;
use crate::error::{Result, VoicepipeError};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

pub struct TransmitEncoder {
    input_format: WaveFormat,
    transport: Arc<dyn Transport>,
    /// f32 bits of the expected outgoing packet loss.
    packet_loss: AtomicU32,
    state: Mutex<EncoderState>,
}

/// Everything mutated by receive, stop, reset and dispose.
struct EncoderState {
    encoder: Box<dyn Encoder>,
    chain: FrameAssembler<RateConverter<QueueSource>>,
    frame: Vec<f32>,
    packet: Vec<u8>,
    stopping: bool,
    stopped: bool,
    disposed: bool,
    frames_since_reset: u64,
    packets_sent: u64,
}

impl TransmitEncoder {
    pub fn new(
        input_format: WaveFormat,
        encoder: Box<dyn Encoder>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        if encoder.frame_size() == 0 {
            return Err(VoicepipeError::Encoder {
                message: "codec frame size must be positive".to_string(),
            });
        }
        let queue = QueueSource::empty(input_format);
        let converter = RateConverter::new(queue, encoder.sample_rate())?;
        let chain = FrameAssembler::new(converter, encoder.frame_size());

        tracing::debug!(
            input = %input_format,
            codec_rate = encoder.sample_rate(),
            codec_frame = encoder.frame_size(),
            "Created transmit encoder"
        );

        Ok(Self {
            input_format,
            transport,
            packet_loss: AtomicU32::new(0),
            state: Mutex::new(EncoderState {
                frame: vec![0.0; encoder.frame_size()],
                packet: Vec::new(),
                encoder,
                chain,
                stopping: false,
                stopped: false,
                disposed: false,
                frames_since_reset: 0,
                packets_sent: 0,
            }),
        })
    }

    /// Buffers `samples` and transmits every complete codec frame.
    pub fn receive(&self, samples: &[f32], format: WaveFormat) -> Result<()> {
        if format != self.input_format {
            return Err(VoicepipeError::format_mismatch(self.input_format, format));
        }

        let mut state = self.state.lock();
        if state.stopped {
            return Ok(());
        }

        let loss = self.packet_loss();
        state.encoder.set_packet_loss(loss)?;
        state.chain.get_mut().get_mut().extend(samples);
        state.pump(&*self.transport)
    }

    /// Requests a graceful end of stream: one more packet, then stopped.
    ///
    /// If nothing was transmitted since the last reset there is no stream
    /// to end, and the encoder stops immediately.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.stopping {
            return;
        }
        state.stopping = true;
        if state.frames_since_reset == 0 {
            state.stopped = true;
        }
    }

    /// Clears buffers and filter state and re-arms a stopped encoder.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.encoder.reset();
        state.chain.reset();
        state.chain.get_mut().reset();
        state.chain.get_mut().get_mut().clear();
        state.frames_since_reset = 0;
        if !state.disposed {
            state.stopping = false;
            state.stopped = false;
        }
    }

    /// Permanently stops the encoder. Later calls to `reset` do not re-arm it.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        state.disposed = true;
        state.stopping = true;
        state.stopped = true;
    }

    pub fn is_stopping(&self) -> bool {
        self.state.lock().stopping
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub fn packets_sent(&self) -> u64 {
        self.state.lock().packets_sent
    }

    /// Expected outgoing loss, clamped to 0.0..=1.0; applied on the next receive.
    pub fn set_packet_loss(&self, loss: f32) {
        let loss = if loss.is_finite() { loss.clamp(0.0, 1.0) } else { 0.0 };
        self.packet_loss.store(loss.to_bits(), Ordering::Relaxed);
    }

    pub fn packet_loss(&self) -> f32 {
        f32::from_bits(self.packet_loss.load(Ordering::Relaxed))
    }

    pub fn input_format(&self) -> WaveFormat {
        self.input_format
    }
}

impl EncoderState {
    fn pump(&mut self, transport: &dyn Transport) -> Result<()> {
        while !self.stopped && self.chain.read(&mut self.frame) {
            self.transmit(transport)?;
        }

        // Stopping with no full frame available: flush what is buffered,
        // including the converter's partial chunk, or silence, as the
        // final packet.
        if self.stopping && !self.stopped {
            self.chain.get_mut().flush();
            if !self.chain.read_padded(&mut self.frame) {
                self.frame.fill(0.0);
            }
            self.transmit(transport)?;
        }
        Ok(())
    }

    fn transmit(&mut self, transport: &dyn Transport) -> Result<()> {
        self.packet.clear();
        self.encoder.encode(&self.frame, &mut self.packet)?;
        transport.send_voice(&self.packet);
        self.frames_since_reset += 1;
        self.packets_sent += 1;
        if self.stopping {
            self.stopped = true;
            tracing::debug!(packets = self.packets_sent, "Encoder sent final packet");
        }
        Ok(())
    }
}

impl AudioSubscriber for TransmitEncoder {
    fn receive(&self, frame: &[f32], format: WaveFormat) -> Result<()> {
        TransmitEncoder::receive(self, frame, format)
    }

    fn reset(&self) -> Result<()> {
        TransmitEncoder::reset(self);
        Ok(())
    }

    fn name(&self) -> &str {
        "transmit-encoder"
    }
}
