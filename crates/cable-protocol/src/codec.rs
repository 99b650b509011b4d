//! Codec for encoding and decoding cable frames.
//!
//! Every frame is a single JSON document carried in one WebSocket text
//! message, so no length prefix is needed.

use thiserror::Error;

use crate::frames::{Command, CommandEnvelope, ServerFrame};

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

    /// Command name not understood.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Required field absent.
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

fn check_size(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(())
}

/// Encode a server frame to JSON text.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &ServerFrame) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame)?;
    check_size(text.len())?;
    Ok(text)
}

/// Decode a server frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large or not a valid frame.
pub fn decode(text: &str) -> Result<ServerFrame, ProtocolError> {
    check_size(text.len())?;
    Ok(serde_json::from_str(text)?)
}

/// Encode a client command to JSON text.
///
/// # Errors
///
/// Returns an error if the command is too large or encoding fails.
pub fn encode_command(command: &Command) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(command)?;
    check_size(text.len())?;
    Ok(text)
}

/// Decode a client command from JSON text.
///
/// The envelope is parsed first so that an unknown command name surfaces as
/// [`ProtocolError::UnknownCommand`] rather than a generic JSON error.
///
/// # Errors
///
/// Returns an error if the text is too large, malformed, or names an unknown command.
pub fn decode_command(text: &str) -> Result<Command, ProtocolError> {
    check_size(text.len())?;
    let envelope: CommandEnvelope = serde_json::from_str(text)?;
    Command::try_from(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::DisconnectReason;
    use serde_json::json;

    #[test]
    fn test_decode_subscribe() {
        let text = r#"{"command":"subscribe","identifier":"{\"channel\":\"ChatChannel\"}"}"#;
        let command = decode_command(text).unwrap();
        assert_eq!(
            command,
            Command::subscribe(r#"{"channel":"ChatChannel"}"#)
        );
    }

    #[test]
    fn test_decode_message() {
        let text = r#"{"command":"message","identifier":"x","data":"{\"action\":\"speak\"}"}"#;
        match decode_command(text).unwrap() {
            Command::Message { identifier, data } => {
                assert_eq!(identifier, "x");
                assert_eq!(data, r#"{"action":"speak"}"#);
            }
            other => panic!("Expected Message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_command() {
        match decode_command(r#"{"command":"dance","identifier":"x"}"#) {
            Err(ProtocolError::UnknownCommand(name)) => assert_eq!(name, "dance"),
            other => panic!("Expected UnknownCommand, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            decode_command("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            decode_command(r#"{"command":"subscribe"}"#),
            Err(ProtocolError::MissingField("identifier"))
        ));
    }

    #[test]
    fn test_encode_frames() {
        assert_eq!(encode(&ServerFrame::Welcome).unwrap(), r#"{"type":"welcome"}"#);
        assert_eq!(
            encode(&ServerFrame::reject("x")).unwrap(),
            r#"{"type":"reject_subscription","identifier":"x"}"#
        );
    }

    #[test]
    fn test_decode_frames() {
        let frame = decode(r#"{"type":"disconnect","reason":"remote","reconnect":true}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::disconnect(DisconnectReason::Remote, true)
        );

        let frame = decode(r#"{"identifier":"x","message":{"body":"hi"}}"#).unwrap();
        assert_eq!(frame, ServerFrame::message("x", json!({"body": "hi"})));

        assert!(decode(r#"{"type":"bogus"}"#).is_err());
        assert!(decode(r#"{"type":"ping"}"#).is_err());
    }

    #[test]
    fn test_frame_too_large() {
        let frame = ServerFrame::message("x", json!("a".repeat(MAX_FRAME_SIZE)));

        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }

        let text = " ".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            decode_command(&text),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }
}
