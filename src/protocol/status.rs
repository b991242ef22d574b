//! Classification of the server's status vocabulary.
//!
//! Short responses carry a big-endian status code instead of a payload. The
//! configured session-timeout and logged-out codes map to dedicated errors;
//! everything else travels as an opaque `RemoteStatus`.

use crate::config::ReturnCodeTable;
use crate::error::{constants, ProtocolError, Result};

/// Responses shorter than this are error frames
pub const ERROR_FRAME_LIMIT: usize = 32;

/// Byte range holding the status code in an error frame
const STATUS_OFFSET: usize = 2;

/// True if a response is short enough to be an error frame
pub fn is_error_frame(frame: &[u8]) -> bool {
    frame.len() < ERROR_FRAME_LIMIT
}

/// Extract the embedded status code from an error frame
pub fn error_frame_status(frame: &[u8]) -> Result<i32> {
    let bytes = frame
        .get(STATUS_OFFSET..STATUS_OFFSET + 4)
        .ok_or_else(|| ProtocolError::FrameCorrupt(constants::ERR_EMPTY_ERROR_FRAME.into()))?;
    let mut code = [0u8; 4];
    code.copy_from_slice(bytes);
    Ok(i32::from_be_bytes(code))
}

/// Human-readable name for a code
pub fn status_message(table: &ReturnCodeTable, code: i32) -> String {
    table
        .messages
        .iter()
        .find(|entry| entry.code == code)
        .map(|entry| entry.message.clone())
        .unwrap_or_else(|| format!("unknown status {code}"))
}

/// Map a non-zero status code to its error
pub fn classify_status(table: &ReturnCodeTable, code: i32) -> ProtocolError {
    if code == table.session_timeout {
        ProtocolError::SessionExpired { code }
    } else if code == table.logged_out {
        ProtocolError::AccountLoggedOut { code }
    } else {
        ProtocolError::RemoteStatus {
            code,
            message: status_message(table, code),
        }
    }
}

/// Classify a whole error frame. A zero status in a short frame is corrupt.
pub fn classify_error_frame(table: &ReturnCodeTable, frame: &[u8]) -> ProtocolError {
    match error_frame_status(frame) {
        Ok(0) => ProtocolError::FrameCorrupt(constants::ERR_EMPTY_ERROR_FRAME.into()),
        Ok(code) => classify_status(table, code),
        Err(e) => e,
    }
}

/// Build an error frame carrying `code`
pub fn encode_error_frame(code: i32) -> Vec<u8> {
    let mut frame = vec![0u8; 16];
    frame[0] = crate::core::packet::SIGNATURE;
    frame[STATUS_OFFSET..STATUS_OFFSET + 4].copy_from_slice(&code.to_be_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_timeout_is_first_class() {
        let table = ReturnCodeTable::default();
        let frame = encode_error_frame(table.session_timeout);
        assert!(is_error_frame(&frame));
        assert!(matches!(
            classify_error_frame(&table, &frame),
            ProtocolError::SessionExpired { code: -13 }
        ));
    }

    #[test]
    fn logged_out_is_first_class() {
        let table = ReturnCodeTable::default();
        assert!(matches!(
            classify_status(&table, table.logged_out),
            ProtocolError::AccountLoggedOut { .. }
        ));
    }

    #[test]
    fn other_codes_carry_message() {
        let table = ReturnCodeTable::default();
        match classify_status(&table, -3) {
            ProtocolError::RemoteStatus { code, message } => {
                assert_eq!(code, -3);
                assert_eq!(message, "MM_ERR_PASSWORD");
            }
            other => panic!("unexpected {other:?}"),
        }
        match classify_status(&table, -9999) {
            ProtocolError::RemoteStatus { message, .. } => assert!(message.contains("-9999")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_or_zero_frames_are_corrupt() {
        let table = ReturnCodeTable::default();
        assert!(matches!(
            classify_error_frame(&table, &[0xBF, 0, 0]),
            ProtocolError::FrameCorrupt(_)
        ));
        assert!(matches!(
            classify_error_frame(&table, &encode_error_frame(0)),
            ProtocolError::FrameCorrupt(_)
        ));
    }
}
