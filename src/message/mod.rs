//! Decoding of complete frames into telemetry.
//!
//! Only status frames (function code `0x11`) are understood. Everything else
//! the BMS sends is reported as [`DecodeError::UnsupportedFunctionCode`].

pub(crate) mod status_message;

pub use status_message::StatusMessage;

use crate::bms_data::BmsData;
use crate::error::{DecodeError, Result};

/// Decode one complete frame, start marker through end marker.
pub fn decode_status_frame(frame: &[u8]) -> Result<BmsData> {
    StatusMessage::new(frame)?.decode()
}

/// Decode one complete frame, or `None` if it does not hold a status record.
pub fn try_decode_status_frame(frame: &[u8]) -> Option<BmsData> {
    match decode_status_frame(frame) {
        Ok(data) => Some(data),
        Err(err) => {
            log_decode_error(&err, frame);
            None
        }
    }
}

fn log_decode_error(err: &DecodeError, frame: &[u8]) {
    tracing::debug!(error = %err, frame = %hex::encode(frame), "frame dropped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::StatusFrameBuilder;

    #[test]
    fn test_try_decode_returns_none_on_failure() {
        assert_eq!(try_decode_status_frame(&[0x7E, 0xA1, 0x11, 0x55]), None);
        let frame = StatusFrameBuilder::default().function_code(0x12).build();
        assert_eq!(try_decode_status_frame(&frame), None);
    }

    #[test]
    fn test_try_decode_matches_decode() {
        let frame = StatusFrameBuilder::default().build();
        assert_eq!(
            try_decode_status_frame(&frame),
            decode_status_frame(&frame).ok()
        );
    }
}
