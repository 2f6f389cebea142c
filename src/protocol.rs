use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Messages sent from the client to the recognition backend.
///
/// Field names are part of the backend contract and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens a new attendance session for a class (optionally scoped to a
    /// group and topic). The backend answers with `session_started`.
    StartSession {
        class_id: i64,
        user_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        group_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_topic: Option<String>,
    },
    /// One encoded camera frame for recognition.
    Frame { session_id: String, image: String },
    /// Ends the session. Not sent when the backend already ended it.
    EndSession { session_id: String },
}

/// Messages pushed by the backend to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledgment of `start_session`, carrying the assigned session id.
    SessionStarted {
        session_id: String,
        student_count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// A student was recognized and marked present.
    Marked {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        student_id: Option<i64>,
    },
    /// The recognized student was already marked in this session.
    AlreadyMarked {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        student_id: Option<i64>,
    },
    /// The frame contained no enrolled face.
    NoMatch { message: String },
    /// Backend-side processing error. Non-fatal; capture continues.
    Error { message: String },
    /// The backend closed the session.
    SessionEnded {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_students: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        marked_attendance: Option<u32>,
    },
}

/// Parse one inbound text payload into a [`ServerMessage`].
///
/// Unknown event kinds and malformed payloads are both reported as
/// [`ProtocolError::Malformed`]; callers log and drop them.
pub fn parse_server_message(text: &str) -> Result<ServerMessage, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed {
        details: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_session_wire_format() {
        let msg = ClientMessage::StartSession {
            class_id: 7,
            user_id: 3,
            group_id: None,
            session_topic: None,
        };

        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"start_session","class_id":7,"user_id":3}"#
        );
    }

    #[test]
    fn test_start_session_group_variant() {
        let msg = ClientMessage::StartSession {
            class_id: 7,
            user_id: 3,
            group_id: Some(12),
            session_topic: Some("Lab 4".to_string()),
        };

        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"start_session","class_id":7,"user_id":3,"group_id":12,"session_topic":"Lab 4"}"#
        );
    }

    #[test]
    fn test_frame_wire_format() {
        let msg = ClientMessage::Frame {
            session_id: "abc".to_string(),
            image: "data:image/jpeg;base64,AAAA".to_string(),
        };

        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"frame","session_id":"abc","image":"data:image/jpeg;base64,AAAA"}"#
        );
    }

    #[test]
    fn test_end_session_wire_format() {
        let msg = ClientMessage::EndSession {
            session_id: "abc".to_string(),
        };

        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"end_session","session_id":"abc"}"#
        );
    }

    #[test]
    fn test_parse_session_started() {
        let msg =
            parse_server_message(r#"{"type":"session_started","session_id":"abc","student_count":42}"#)
                .unwrap();

        assert_eq!(
            msg,
            ServerMessage::SessionStarted {
                session_id: "abc".to_string(),
                student_count: 42,
                message: None,
            }
        );
    }

    #[test]
    fn test_parse_outcome_events() {
        let marked = parse_server_message(r#"{"type":"marked","message":"X present"}"#).unwrap();
        assert_eq!(
            marked,
            ServerMessage::Marked {
                message: "X present".to_string(),
                student_id: None,
            }
        );

        let already =
            parse_server_message(r#"{"type":"already_marked","message":"dup","student_id":9}"#)
                .unwrap();
        assert_eq!(
            already,
            ServerMessage::AlreadyMarked {
                message: "dup".to_string(),
                student_id: Some(9),
            }
        );

        let no_match =
            parse_server_message(r#"{"type":"no_match","message":"No matching student found"}"#)
                .unwrap();
        assert!(matches!(no_match, ServerMessage::NoMatch { .. }));

        let error = parse_server_message(r#"{"type":"error","message":"boom"}"#).unwrap();
        assert!(matches!(error, ServerMessage::Error { .. }));
    }

    #[test]
    fn test_parse_session_ended_with_tallies() {
        let msg = parse_server_message(
            r#"{"type":"session_ended","message":"Session ended","total_students":42,"marked_attendance":12}"#,
        )
        .unwrap();

        assert_eq!(
            msg,
            ServerMessage::SessionEnded {
                message: "Session ended".to_string(),
                total_students: Some(42),
                marked_attendance: Some(12),
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_event() {
        let err = parse_server_message(r#"{"type":"celebrate","message":"confetti"}"#);
        assert!(matches!(err, Err(ProtocolError::Malformed { .. })));

        let err = parse_server_message("not json at all");
        assert!(matches!(err, Err(ProtocolError::Malformed { .. })));
    }
}
