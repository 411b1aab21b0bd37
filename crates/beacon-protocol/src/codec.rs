//! Codec for encoding and decoding Beacon frames.
//!
//! Frames travel as JSON text, one frame per channel message.

use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to JSON text.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    if matches!(frame, Frame::Unknown) {
        return Err(ProtocolError::Invalid("unknown frames cannot be sent".into()));
    }

    let text = serde_json::to_string(frame)?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(text)
}

/// Decode a frame from JSON text.
///
/// Unrecognized `type` values decode to [`Frame::Unknown`].
///
/// # Errors
///
/// Returns an error if the data is empty, too large, or not a valid frame.
pub fn decode(data: &str) -> Result<Frame, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    if data.trim().is_empty() {
        return Err(ProtocolError::Invalid("empty frame".into()));
    }

    let frame = serde_json::from_str(data)?;
    Ok(frame)
}
