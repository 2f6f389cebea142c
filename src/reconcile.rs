use crate::protocol::ServerMessage;
use chrono::{DateTime, Utc};

/// Outcome kinds reported by the recognition backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Marked,
    AlreadyMarked,
    NoMatch,
    Error,
    Ended,
}

/// A backend-reported recognition result, as surfaced to status observers.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub message: String,
    /// Identifies the matched person, when the backend includes it
    pub subject_ref: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Transient visual cue accompanying an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Success,
    Warning,
    Neutral,
}

/// What the session does with one inbound outcome.
#[derive(Debug, Clone)]
pub struct Disposition {
    pub outcome: Outcome,
    /// Whether the session keeps capturing after this outcome
    pub continues: bool,
    /// Transient indicator to flash, auto-cleared after a fixed hold
    pub indicator: Option<Indicator>,
}

/// Map an inbound backend event to its session disposition.
///
/// This table is the authoritative continue/terminate contract: only
/// `session_ended` terminates the session; every other outcome, including
/// backend errors, leaves it capturing. Returns `None` for the
/// `session_started` acknowledgment, which is not an outcome.
pub fn reconcile(message: &ServerMessage) -> Option<Disposition> {
    let received_at = Utc::now();

    match message {
        ServerMessage::SessionStarted { .. } => None,
        ServerMessage::Marked {
            message,
            student_id,
        } => Some(Disposition {
            outcome: Outcome {
                kind: OutcomeKind::Marked,
                message: message.clone(),
                subject_ref: student_id.map(|id| id.to_string()),
                received_at,
            },
            continues: true,
            indicator: Some(Indicator::Success),
        }),
        ServerMessage::AlreadyMarked {
            message,
            student_id,
        } => Some(Disposition {
            outcome: Outcome {
                kind: OutcomeKind::AlreadyMarked,
                message: message.clone(),
                subject_ref: student_id.map(|id| id.to_string()),
                received_at,
            },
            continues: true,
            indicator: Some(Indicator::Warning),
        }),
        ServerMessage::NoMatch { message } => Some(Disposition {
            outcome: Outcome {
                kind: OutcomeKind::NoMatch,
                message: message.clone(),
                subject_ref: None,
                received_at,
            },
            continues: true,
            indicator: Some(Indicator::Neutral),
        }),
        ServerMessage::Error { message } => Some(Disposition {
            outcome: Outcome {
                kind: OutcomeKind::Error,
                message: message.clone(),
                subject_ref: None,
                received_at,
            },
            continues: true,
            indicator: None,
        }),
        ServerMessage::SessionEnded {
            message,
            total_students,
            marked_attendance,
        } => {
            let text = match (marked_attendance, total_students) {
                (Some(marked), Some(total)) => {
                    format!("{} - {} of {} students marked present", message, marked, total)
                }
                _ => message.clone(),
            };

            Some(Disposition {
                outcome: Outcome {
                    kind: OutcomeKind::Ended,
                    message: text,
                    subject_ref: None,
                    received_at,
                },
                continues: false,
                indicator: None,
            })
        }
    }
}
