// Message types for the notifier WebSocket, the app event loop and the
// operator console.
//
// Notifiers speak JSON envelopes of the form `{"type": ..., "payload": ...}`.
// `CHANGE` payloads carry the raw record, which is decoded into a typed
// `ChangeEvent` only once the stream and operation are known.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use sweepdraw_core::connection::ConnectionStatus;
use sweepdraw_core::countdown::CountdownTick;
use sweepdraw_core::live_view::BoardEntry;
use sweepdraw_core::model::{Allocation, Change, ChangeEvent, ChangeOp, Participant, StreamKind};
use sweepdraw_core::presentation::{PresentationEvent, PresentationSnapshot};

// ---------------------------------------------------------------------------
// Notifier -> display
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushMessage {
    NotifierConnected(NotifierInfo),
    Change(ChangePayload),
    Heartbeat(HeartbeatPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Notifier wall clock, milliseconds since the epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    pub event_id: String,
    pub stream: StreamKind,
    pub op: ChangeOp,
    /// Full record for inserts and updates; at least `{"id": ...}` for
    /// deletes.
    pub record: Value,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed {stream} record: {source}")]
    InvalidRecord {
        stream: StreamKind,
        source: serde_json::Error,
    },

    #[error("{stream} delete without a record id")]
    MissingId { stream: StreamKind },
}

impl ChangePayload {
    pub fn into_change_event(self) -> Result<ChangeEvent, ProtocolError> {
        let stream = self.stream;
        match stream {
            StreamKind::Participants => {
                decode::<Participant>(stream, self.op, self.record).map(ChangeEvent::Participant)
            }
            StreamKind::Allocations => {
                decode::<Allocation>(stream, self.op, self.record).map(ChangeEvent::Allocation)
            }
        }
    }
}

fn decode<T>(stream: StreamKind, op: ChangeOp, record: Value) -> Result<Change<T>, ProtocolError>
where
    T: serde::de::DeserializeOwned,
{
    let parse = |record: Value| {
        serde_json::from_value::<T>(record)
            .map_err(|source| ProtocolError::InvalidRecord { stream, source })
    };
    match op {
        ChangeOp::Insert => parse(record).map(Change::Insert),
        ChangeOp::Update => parse(record).map(Change::Update),
        ChangeOp::Delete => record
            .get("id")
            .and_then(Value::as_str)
            .map(|id| Change::Delete { id: id.to_string() })
            .ok_or(ProtocolError::MissingId { stream }),
    }
}

// ---------------------------------------------------------------------------
// App -> console
// ---------------------------------------------------------------------------

/// Everything the console renders.
#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    Presentation(PresentationEvent),
    Connection(ConnectionStatus),
    Countdown(CountdownTick),
    Board {
        entries: Vec<BoardEntry>,
        waiting: Vec<WaitingEntry>,
    },
    Status {
        connection: ConnectionStatus,
        presentation: PresentationSnapshot,
        participants: usize,
        allocations: usize,
    },
    /// Outcome of an operator command.
    Notice(String),
    Error(String),
}

/// A participant still waiting for a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingEntry {
    pub participant_id: String,
    pub display_name: String,
    pub paid: bool,
    /// Time left to pay, formatted, for pending participants.
    pub pay_within: Option<String>,
}

// ---------------------------------------------------------------------------
// Console -> app
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    DrawNext,
    DrawAll,
    Join { name: String },
    MarkPaid { participant_id: String },
    Board,
    Status,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?} (try: next, all, join <name>, paid <id>, board, status, quit)")]
    Unknown(String),
    #[error("usage: {0}")]
    MissingArgument(&'static str),
}

impl UserCommand {
    /// Commands that change the store.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            UserCommand::DrawNext
                | UserCommand::DrawAll
                | UserCommand::Join { .. }
                | UserCommand::MarkPaid { .. }
        )
    }
}

impl FromStr for UserCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        match word.to_ascii_lowercase().as_str() {
            "" => Err(CommandError::Empty),
            "next" | "n" => Ok(UserCommand::DrawNext),
            "all" => Ok(UserCommand::DrawAll),
            "join" if rest.is_empty() => Err(CommandError::MissingArgument("join <name>")),
            "join" => Ok(UserCommand::Join {
                name: rest.to_string(),
            }),
            "paid" if rest.is_empty() => Err(CommandError::MissingArgument("paid <participant-id>")),
            "paid" => Ok(UserCommand::MarkPaid {
                participant_id: rest.to_string(),
            }),
            "board" | "b" => Ok(UserCommand::Board),
            "status" | "s" => Ok(UserCommand::Status),
            "quit" | "q" | "exit" => Ok(UserCommand::Quit),
            _ => Err(CommandError::Unknown(word.to_string())),
        }
    }
}

impl fmt::Display for UserCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserCommand::DrawNext => f.write_str("next"),
            UserCommand::DrawAll => f.write_str("all"),
            UserCommand::Join { name } => write!(f, "join {name}"),
            UserCommand::MarkPaid { participant_id } => write!(f, "paid {participant_id}"),
            UserCommand::Board => f.write_str("board"),
            UserCommand::Status => f.write_str("status"),
            UserCommand::Quit => f.write_str("quit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweepdraw_core::model::PaymentStatus;

    #[test]
    fn parses_change_insert_for_allocations() {
        let json = r#"{
            "type": "CHANGE",
            "payload": {
                "event_id": "cup",
                "stream": "allocations",
                "op": "insert",
                "record": {
                    "id": "a1",
                    "event_id": "cup",
                    "participant_id": "p1",
                    "slot_id": "s7",
                    "created_at": "2026-11-03T04:00:00Z"
                }
            }
        }"#;
        let PushMessage::Change(payload) = serde_json::from_str(json).unwrap() else {
            panic!("expected CHANGE");
        };
        assert_eq!(payload.event_id, "cup");
        match payload.into_change_event().unwrap() {
            ChangeEvent::Allocation(Change::Insert(a)) => {
                assert_eq!(a.id, "a1");
                assert_eq!(a.slot_id, "s7");
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn parses_participant_update() {
        let json = r#"{"type":"CHANGE","payload":{"event_id":"cup","stream":"participants","op":"update",
            "record":{"id":"p1","event_id":"cup","display_name":"Ada","payment_status":"paid",
                      "joined_at":"2026-11-01T09:30:00Z"}}}"#;
        let PushMessage::Change(payload) = serde_json::from_str(json).unwrap() else {
            panic!("expected CHANGE");
        };
        match payload.into_change_event().unwrap() {
            ChangeEvent::Participant(Change::Update(p)) => {
                assert_eq!(p.display_name, "Ada");
                assert_eq!(p.payment_status, PaymentStatus::Paid);
                assert!(!p.removed);
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn delete_needs_only_the_id() {
        let payload = ChangePayload {
            event_id: "cup".into(),
            stream: StreamKind::Participants,
            op: ChangeOp::Delete,
            record: serde_json::json!({ "id": "p9" }),
        };
        assert_eq!(
            payload.into_change_event().unwrap(),
            ChangeEvent::Participant(Change::Delete { id: "p9".into() })
        );

        let missing = ChangePayload {
            event_id: "cup".into(),
            stream: StreamKind::Allocations,
            op: ChangeOp::Delete,
            record: serde_json::json!({}),
        };
        assert!(matches!(
            missing.into_change_event(),
            Err(ProtocolError::MissingId { .. })
        ));
    }

    #[test]
    fn malformed_record_is_an_error() {
        let payload = ChangePayload {
            event_id: "cup".into(),
            stream: StreamKind::Allocations,
            op: ChangeOp::Insert,
            record: serde_json::json!({ "id": "a1" }),
        };
        assert!(matches!(
            payload.into_change_event(),
            Err(ProtocolError::InvalidRecord { .. })
        ));
    }

    #[test]
    fn parses_heartbeat_and_hello() {
        let hb: PushMessage =
            serde_json::from_str(r#"{"type":"HEARTBEAT","payload":{"timestamp":1730000000000}}"#)
                .unwrap();
        assert_eq!(
            hb,
            PushMessage::Heartbeat(HeartbeatPayload {
                timestamp: 1_730_000_000_000
            })
        );

        let hello: PushMessage =
            serde_json::from_str(r#"{"type":"NOTIFIER_CONNECTED","payload":{"name":"store-hook"}}"#)
                .unwrap();
        assert!(matches!(hello, PushMessage::NotifierConnected(NotifierInfo { ref name, version: None }) if name == "store-hook"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<PushMessage>(r#"{"type":"PING","payload":{}}"#).is_err());
    }

    #[test]
    fn parses_commands() {
        assert_eq!("next".parse(), Ok(UserCommand::DrawNext));
        assert_eq!("  ALL ".parse(), Ok(UserCommand::DrawAll));
        assert_eq!(
            "join Mary Jane".parse(),
            Ok(UserCommand::Join {
                name: "Mary Jane".into()
            })
        );
        assert_eq!(
            "paid 3f2a".parse(),
            Ok(UserCommand::MarkPaid {
                participant_id: "3f2a".into()
            })
        );
        assert_eq!("board".parse(), Ok(UserCommand::Board));
        assert_eq!("status".parse(), Ok(UserCommand::Status));
        assert_eq!("q".parse(), Ok(UserCommand::Quit));
    }

    #[test]
    fn rejects_bad_commands() {
        assert_eq!("".parse::<UserCommand>(), Err(CommandError::Empty));
        assert_eq!("   ".parse::<UserCommand>(), Err(CommandError::Empty));
        assert_eq!(
            "join".parse::<UserCommand>(),
            Err(CommandError::MissingArgument("join <name>"))
        );
        assert_eq!(
            "paid  ".parse::<UserCommand>(),
            Err(CommandError::MissingArgument("paid <participant-id>"))
        );
        assert_eq!(
            "shuffle".parse::<UserCommand>(),
            Err(CommandError::Unknown("shuffle".into()))
        );
    }

    #[test]
    fn command_display_parses_back() {
        for cmd in [
            UserCommand::DrawNext,
            UserCommand::Join { name: "Ada".into() },
            UserCommand::MarkPaid {
                participant_id: "p1".into(),
            },
            UserCommand::Quit,
        ] {
            assert_eq!(cmd.to_string().parse(), Ok(cmd));
        }
    }
}
