//! Implements the decoder.

use crate::celt::CeltDecoder;
use crate::{Bandwidth, Channels, DecoderError, Sample};

/// The maximum number of samples a frame can decode to per channel.
const MAX_FRAME_SIZE: usize = 960;

/// The CELT decoder.
///
/// A decoder instance owns all state of one stream. Frames must be decoded
/// in order; packets must not be reordered across frame boundaries.
pub struct Decoder {
    celt: CeltDecoder,
    channels: Channels,
    pcm: Vec<f32>,
}

impl Decoder {
    /// Creates a new decoder. Configures the output channels and the
    /// decoded bandwidth.
    ///
    /// # Arguments
    /// * `channels`  - Output channels.
    /// * `bandwidth` - Effective band count cap.
    ///
    pub fn new(channels: Channels, bandwidth: Bandwidth) -> Result<Self, DecoderError> {
        Ok(Self {
            celt: CeltDecoder::new(channels, bandwidth)?,
            channels,
            pcm: vec![0.0; 2 * MAX_FRAME_SIZE],
        })
    }

    /// Resets the decoder state without changing its configuration.
    pub fn reset(&mut self) {
        self.celt.reset();
    }

    /// Limits the decoded audio bandwidth.
    pub fn set_bandwidth(&mut self, bandwidth: Bandwidth) {
        self.celt.set_bandwidth(bandwidth);
    }

    /// Decodes one CELT frame.
    ///
    /// The payload is a raw CELT frame without the Opus TOC byte. The
    /// output receives `frame_size` samples per channel, interleaved.
    ///
    /// # Arguments
    /// * `data`       - Input payload.
    /// * `frame_size` - Samples per channel, one of 120, 240, 480 or 960.
    /// * `output`     - Interleaved output samples.
    ///
    pub fn decode_frame<S: Sample>(
        &mut self,
        data: &[u8],
        frame_size: usize,
        output: &mut [S],
    ) -> Result<usize, DecoderError> {
        let channels = self.channels as usize;
        if output.len() < channels * frame_size {
            return Err(DecoderError::InvalidFrameData);
        }

        self.celt
            .decode_frame(data, frame_size, &mut self.pcm[..channels * frame_size])?;
        self.emit(channels * frame_size, output);

        Ok(frame_size)
    }

    /// Decodes a frame whose coded channel count differs from the
    /// decoder's output channel count; the transition from mono to stereo
    /// packets seeds the new channel so it starts without a click.
    pub fn decode_frame_with_packet_stereo<S: Sample>(
        &mut self,
        data: &[u8],
        frame_size: usize,
        packet_is_stereo: bool,
        output: &mut [S],
    ) -> Result<usize, DecoderError> {
        let channels = self.channels as usize;
        if output.len() < channels * frame_size {
            return Err(DecoderError::InvalidFrameData);
        }

        let packet_channels = if packet_is_stereo { 2 } else { 1 };
        let scratch = frame_size * usize::max(channels, packet_channels);
        self.celt.decode_frame_with_packet_stereo(
            data,
            frame_size,
            packet_is_stereo,
            &mut self.pcm[..scratch],
        )?;
        self.emit(channels * frame_size, output);

        Ok(frame_size)
    }

    /// Produces a concealment frame for a lost packet.
    ///
    /// # Arguments
    /// * `frame_size` - Samples per channel.
    /// * `loss_count` - Consecutive losses so far, tracked by the framing
    ///                  layer; drives the fade-out.
    /// * `output`     - Interleaved output samples.
    ///
    pub fn decode_plc<S: Sample>(
        &mut self,
        frame_size: usize,
        loss_count: u32,
        output: &mut [S],
    ) -> Result<usize, DecoderError> {
        let channels = self.channels as usize;
        if output.len() < channels * frame_size {
            return Err(DecoderError::InvalidFrameData);
        }

        self.celt
            .decode_plc(frame_size, loss_count, &mut self.pcm[..channels * frame_size])?;
        self.emit(channels * frame_size, output);

        Ok(frame_size)
    }

    fn emit<S: Sample>(&self, count: usize, output: &mut [S]) {
        output
            .iter_mut()
            .zip(self.pcm[..count].iter())
            .for_each(|(out, &v)| {
                *out = S::from_f32(v);
            });
    }
}
