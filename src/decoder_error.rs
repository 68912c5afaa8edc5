//! Decoder errors.

/// Errors thrown by the decoder.
#[derive(Debug)]
pub enum DecoderError {
    /// The frame size is not one of 120, 240, 480 or 960 samples.
    InvalidFrameSize,
    /// The frame data is structurally corrupt.
    InvalidFrameData,
    /// A hybrid entry point was called without a pre-initialized range decoder.
    NilDecoder,
    /// An internal decoder error.
    InternalError(&'static str),
}

impl std::fmt::Display for DecoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecoderError::InvalidFrameSize => {
                write!(f, "frame size is not 120, 240, 480 or 960 samples")
            }
            DecoderError::InvalidFrameData => {
                write!(f, "frame data is corrupt")
            }
            DecoderError::NilDecoder => {
                write!(f, "hybrid decoding needs a pre-initialized range decoder")
            }
            DecoderError::InternalError(message) => {
                write!(f, "{}", message)
            }
        }
    }
}

impl std::error::Error for DecoderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
