#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
//! Implements the CELT transform codec layer of the free and open Opus
//! audio codec in Rust.
//!
//! CELT is the music and full-band part of Opus: a constrained energy
//! lapped transform codec built from a byte-oriented range coder, a
//! log-domain energy envelope with Laplace-coded residuals, a pyramid
//! vector quantizer with combinatorial codeword indices, a signed bit
//! allocator, and a short-overlap MDCT with a pitch postfilter.
//!
//! This crate covers the CELT core only. The speech layer (SILK), the Opus
//! framing and TOC handling, resamplers and containers are external
//! collaborators: packets arriving here are raw CELT frames with the TOC
//! byte already stripped. Its main features are:
//!
//! * Frame sizes of 2.5, 5, 10 and 20 ms at an internal rate of 48 kHz
//! * Mono and stereo, with mid/side and intensity stereo coupling
//! * Transient handling with short blocks and anti-collapse
//! * Hybrid operation over a shared range coder (bands 17 and up)
//! * Packet loss concealment hooks with deterministic fade-out
//!
#[cfg(feature = "decoder")]
pub use decoder::*;
pub use decoder_error::*;
#[cfg(feature = "encoder")]
pub use encoder::*;
pub use encoder_error::*;

pub(crate) mod celt;
#[cfg(feature = "decoder")]
mod decoder;
mod decoder_error;
#[cfg(feature = "encoder")]
mod encoder;
mod encoder_error;
pub(crate) mod math;
pub(crate) mod range_coder;

// Affects the following targets: avr and msp430
#[cfg(any(target_pointer_width = "8", target_pointer_width = "16"))]
compile_error!("usize needs to be at least 32 bit wide");

/// Allows applications to use their own sample format.
pub trait Sample {
    /// Converts the given float into the custom sample.
    fn from_f32(float: f32) -> Self;
}

impl Sample for f32 {
    #[inline(always)]
    fn from_f32(float: f32) -> Self {
        float
    }
}

impl Sample for f64 {
    #[inline(always)]
    fn from_f32(float: f32) -> Self {
        float as f64
    }
}

impl Sample for i16 {
    #[inline(always)]
    fn from_f32(float: f32) -> Self {
        let float = float * 32768.0;
        if float > 32767.0 {
            32767
        } else if float < -32768.0 {
            -32768
        } else {
            float as i16
        }
    }
}

impl Sample for i32 {
    #[inline(always)]
    fn from_f32(float: f32) -> Self {
        let float = float * 2_147_483_648.0;
        if float > 2_147_483_647.0 {
            2_147_483_647
        } else if float < -2_147_483_648.0 {
            -2_147_483_648
        } else {
            float as i32
        }
    }
}

/// Audio channels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Channels {
    /// Mono - 1 channel
    Mono = 1,
    /// Stereo - 2 channels
    Stereo = 2,
}

/// Audio bandwidth.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Bandwidth {
    /// Automatic selection.
    Auto,
    /// 4 kHz passband.
    Narrowband,
    /// 6 kHz passband.
    Mediumband,
    /// 8 kHz passband.
    Wideband,
    /// 12 kHz passband.
    Superwideband,
    /// 20 kHz passband.
    Fullband,
}

/// The kind of signal being encoded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalType {
    /// Detect the signal type from the input.
    Auto,
    /// Bias the encoder for speech.
    Voice,
    /// Bias the encoder for music.
    Music,
}

/// Legal CELT frame sizes in samples at 48 kHz.
pub const FRAME_SIZES: [usize; 4] = [120, 240, 480, 960];
