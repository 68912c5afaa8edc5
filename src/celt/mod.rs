//! The CELT transform codec layer.

#[cfg(feature = "decoder")]
pub(crate) use decoder::CeltDecoder;
#[cfg(feature = "encoder")]
pub use encoder::FrameAnalysis;
#[cfg(feature = "encoder")]
pub(crate) use encoder::CeltEncoder;

pub(crate) mod alloc;
pub(crate) mod bands;
pub(crate) mod comb_filter;
pub(crate) mod cwrs;
#[cfg(feature = "decoder")]
mod decoder;
#[cfg(feature = "encoder")]
mod encoder;
pub(crate) mod energy;
mod kiss_fft;
pub(crate) mod mdct;
pub(crate) mod mode;
pub(crate) mod pvq;
pub(crate) mod tf;

use crate::encoder_error::EncoderError;
use crate::range_coder::{RangeDecoder, RangeEncoder, Tell};

/// A direction neutral view of the range coder.
///
/// The allocator and the band quantizer run the identical control flow on
/// both sides of the codec; every coded decision goes through this enum so
/// the encoder writes exactly where the decoder reads. On encode the caller
/// pre-loads each value; on decode the value is replaced by what the stream
/// holds.
pub(crate) enum Coder<'a, 'c> {
    /// Decoding side.
    Dec(&'a mut RangeDecoder<'c>),
    /// Encoding side.
    Enc(&'a mut RangeEncoder<'c>),
}

impl<'a, 'c> Coder<'a, 'c> {
    pub(crate) fn tell(&self) -> u32 {
        match self {
            Coder::Dec(dec) => dec.tell(),
            Coder::Enc(enc) => enc.tell(),
        }
    }

    pub(crate) fn tell_frac(&self) -> u32 {
        match self {
            Coder::Dec(dec) => dec.tell_frac(),
            Coder::Enc(enc) => enc.tell_frac(),
        }
    }

    pub(crate) fn is_encoder(&self) -> bool {
        matches!(self, Coder::Enc(_))
    }

    /// Codes a bit with probability `1 / (1 << logp)` of being set.
    pub(crate) fn bit_logp(&mut self, value: &mut bool, logp: u32) -> Result<(), EncoderError> {
        match self {
            Coder::Dec(dec) => {
                *value = dec.decode_bit_logp(logp);
                Ok(())
            }
            Coder::Enc(enc) => enc.encode_bit_logp(u32::from(*value), logp),
        }
    }

    /// Codes a uniform integer in `[0, ft)`.
    pub(crate) fn uniform(&mut self, value: &mut u32, ft: u32) -> Result<(), EncoderError> {
        match self {
            Coder::Dec(dec) => {
                *value = dec.decode_uint(ft);
                Ok(())
            }
            Coder::Enc(enc) => enc.encode_uint(*value, ft),
        }
    }

    /// Codes a symbol against an inverse CDF table.
    pub(crate) fn icdf(
        &mut self,
        value: &mut u32,
        table: &[u8],
        ftb: u32,
    ) -> Result<(), EncoderError> {
        match self {
            Coder::Dec(dec) => {
                *value = dec.decode_icdf(table, ftb);
                Ok(())
            }
            Coder::Enc(enc) => enc.encode_icdf(*value as usize, table, ftb),
        }
    }

    /// Codes raw bits from the back of the buffer.
    pub(crate) fn raw_bits(&mut self, value: &mut u32, bits: u32) -> Result<(), EncoderError> {
        match self {
            Coder::Dec(dec) => {
                *value = dec.decode_bits(bits);
                Ok(())
            }
            Coder::Enc(enc) => enc.encode_bits(*value, bits),
        }
    }
}
