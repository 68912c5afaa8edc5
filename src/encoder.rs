//! Implements the encoder.

pub use crate::celt::FrameAnalysis;
use crate::celt::CeltEncoder;
use crate::{Bandwidth, Channels, EncoderError, SignalType};

/// The CELT encoder.
///
/// An encoder instance owns all state of one stream. Input samples are
/// interleaved floats in [-1, 1] at 48 kHz.
pub struct Encoder {
    celt: CeltEncoder,
    channels: Channels,
}

impl Encoder {
    /// Creates a new encoder. Configures the input channels and the coded
    /// bandwidth.
    pub fn new(channels: Channels, bandwidth: Bandwidth) -> Result<Self, EncoderError> {
        Ok(Self {
            celt: CeltEncoder::new(channels, bandwidth)?,
            channels,
        })
    }

    /// Resets the encoder state without changing its configuration.
    pub fn reset(&mut self) {
        self.celt.reset();
    }

    /// Sets the target bitrate in bits per second.
    pub fn set_bitrate(&mut self, bitrate: u32) {
        self.celt.set_bitrate(bitrate);
    }

    /// Switches between constant and (optionally constrained) variable
    /// bitrate coding.
    pub fn set_vbr(&mut self, use_vbr: bool, constrained: bool) {
        self.celt.set_vbr(use_vbr, constrained);
    }

    /// Sets the encoder search complexity, 0 (fastest) to 10 (best).
    pub fn set_complexity(&mut self, complexity: u32) {
        self.celt.set_complexity(complexity);
    }

    /// Biases the allocation for speech or music.
    pub fn set_signal_type(&mut self, signal_type: SignalType) {
        self.celt.set_signal_type(signal_type);
    }

    /// Sets the expected packet loss percentage; the encoder spends bits
    /// on loss robustness in return.
    pub fn set_packet_loss_pct(&mut self, pct: u32) {
        self.celt.set_packet_loss_pct(pct);
    }

    /// Limits the coded audio bandwidth.
    pub fn set_bandwidth(&mut self, bandwidth: Bandwidth) {
        self.celt.set_bandwidth(bandwidth);
    }

    /// The analysis snapshot of the last encoded frame.
    pub fn analysis(&self) -> FrameAnalysis {
        self.celt.analysis()
    }

    /// Encodes one frame of interleaved samples.
    ///
    /// Returns the number of payload bytes written to `output`.
    ///
    /// # Arguments
    /// * `pcm`        - Interleaved input, `frame_size` samples per channel.
    /// * `frame_size` - Samples per channel, one of 120, 240, 480 or 960.
    /// * `output`     - Receives the payload.
    ///
    pub fn encode_frame(
        &mut self,
        pcm: &[f32],
        frame_size: usize,
        output: &mut [u8],
    ) -> Result<usize, EncoderError> {
        if pcm.len() < self.channels as usize * frame_size {
            return Err(EncoderError::InternalError("input too short"));
        }
        self.celt.encode_frame(pcm, frame_size, output)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::Decoder;

    #[test]
    fn test_public_roundtrip() {
        let mut encoder = Encoder::new(Channels::Mono, Bandwidth::Fullband).unwrap();
        let mut decoder = Decoder::new(Channels::Mono, Bandwidth::Fullband).unwrap();
        encoder.set_bitrate(64_000);

        let pcm: Vec<f32> = (0..960)
            .map(|i| (2.0 * std::f32::consts::PI * 330.0 * i as f32 / 48_000.0).sin() * 0.5)
            .collect();
        let mut packet = vec![0_u8; 400];
        let mut out = vec![0.0_f32; 960];

        let bytes = encoder.encode_frame(&pcm, 960, &mut packet).unwrap();
        assert!(bytes > 0);
        let samples = decoder.decode_frame(&packet[..bytes], 960, &mut out).unwrap();
        assert_eq!(samples, 960);
    }

    #[test]
    fn test_input_too_short() {
        let mut encoder = Encoder::new(Channels::Stereo, Bandwidth::Fullband).unwrap();
        let pcm = vec![0.0_f32; 480];
        let mut packet = vec![0_u8; 400];

        assert!(encoder.encode_frame(&pcm, 480, &mut packet).is_err());
    }
}
