//! Tagged message union
//!
//! Payload = UTF-8 JSON object:
//! `{"kind": "...", "session_id": u64, "timestamp_ms": u64, ...kind fields}`
//!
//! Unknown fields are ignored; an unknown `kind` is rejected.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use stroop_core::{CodecError, DeviceId, SessionId, TaskId, Timestamp};

use crate::{TaskOutcome, TaskPhase, TaskResults};

/// Protocol version exchanged during the handshake
pub const PROTOCOL_VERSION: u32 = 1;

const KIND_FIELD: &str = "kind";
const SESSION_FIELD: &str = "session_id";
const TIMESTAMP_FIELD: &str = "timestamp_ms";

/// Message kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Handshake,
    HandshakeResponse,
    Heartbeat,
    StartTask,
    EndTask,
    PauseTask,
    ResumeTask,
    ResetTask,
    StroopStarted,
    StroopEnded,
    TaskStatus,
    TaskCompleted,
    ResultsReceived,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 14] = [
        MessageKind::Handshake,
        MessageKind::HandshakeResponse,
        MessageKind::Heartbeat,
        MessageKind::StartTask,
        MessageKind::EndTask,
        MessageKind::PauseTask,
        MessageKind::ResumeTask,
        MessageKind::ResetTask,
        MessageKind::StroopStarted,
        MessageKind::StroopEnded,
        MessageKind::TaskStatus,
        MessageKind::TaskCompleted,
        MessageKind::ResultsReceived,
        MessageKind::Error,
    ];

    /// Wire name of the kind
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Handshake => "handshake",
            MessageKind::HandshakeResponse => "handshake_response",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::StartTask => "start_task",
            MessageKind::EndTask => "end_task",
            MessageKind::PauseTask => "pause_task",
            MessageKind::ResumeTask => "resume_task",
            MessageKind::ResetTask => "reset_task",
            MessageKind::StroopStarted => "stroop_started",
            MessageKind::StroopEnded => "stroop_ended",
            MessageKind::TaskStatus => "task_status",
            MessageKind::TaskCompleted => "task_completed",
            MessageKind::ResultsReceived => "results_received",
            MessageKind::Error => "error",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried by `error` messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownKind,
    Malformed,
    UnknownTask,
    TaskAlreadyRunning,
    NotReady,
    /// Any code this build does not know about
    #[serde(other)]
    Other,
}

/// Kind-specific message fields
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Handshake {
        device_id: DeviceId,
        version: u32,
    },
    HandshakeResponse {
        device_id: DeviceId,
        version: u32,
        ready: bool,
    },
    Heartbeat,
    StartTask {
        task_id: TaskId,
        label: String,
        timeout_ms: u64,
    },
    EndTask {
        task_id: TaskId,
    },
    PauseTask {
        task_id: TaskId,
    },
    ResumeTask {
        task_id: TaskId,
    },
    ResetTask {
        task_id: TaskId,
    },
    StroopStarted {
        task_id: TaskId,
    },
    StroopEnded {
        task_id: TaskId,
        outcome: TaskOutcome,
    },
    TaskStatus {
        task_id: TaskId,
        phase: TaskPhase,
        stimuli_shown: u32,
        remaining_ms: u64,
    },
    TaskCompleted {
        results: TaskResults,
    },
    /// Initiator acknowledgement of `task_completed`
    ResultsReceived {
        task_id: TaskId,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Handshake { .. } => MessageKind::Handshake,
            MessageBody::HandshakeResponse { .. } => MessageKind::HandshakeResponse,
            MessageBody::Heartbeat => MessageKind::Heartbeat,
            MessageBody::StartTask { .. } => MessageKind::StartTask,
            MessageBody::EndTask { .. } => MessageKind::EndTask,
            MessageBody::PauseTask { .. } => MessageKind::PauseTask,
            MessageBody::ResumeTask { .. } => MessageKind::ResumeTask,
            MessageBody::ResetTask { .. } => MessageKind::ResetTask,
            MessageBody::StroopStarted { .. } => MessageKind::StroopStarted,
            MessageBody::StroopEnded { .. } => MessageKind::StroopEnded,
            MessageBody::TaskStatus { .. } => MessageKind::TaskStatus,
            MessageBody::TaskCompleted { .. } => MessageKind::TaskCompleted,
            MessageBody::ResultsReceived { .. } => MessageKind::ResultsReceived,
            MessageBody::Error { .. } => MessageKind::Error,
        }
    }

    /// Task the message refers to, if any
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            MessageBody::StartTask { task_id, .. }
            | MessageBody::EndTask { task_id }
            | MessageBody::PauseTask { task_id }
            | MessageBody::ResumeTask { task_id }
            | MessageBody::ResetTask { task_id }
            | MessageBody::StroopStarted { task_id }
            | MessageBody::StroopEnded { task_id, .. }
            | MessageBody::TaskStatus { task_id, .. }
            | MessageBody::ResultsReceived { task_id } => Some(task_id),
            MessageBody::TaskCompleted { results } => Some(&results.task_id),
            MessageBody::Handshake { .. }
            | MessageBody::HandshakeResponse { .. }
            | MessageBody::Heartbeat
            | MessageBody::Error { .. } => None,
        }
    }
}

/// Complete protocol message
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub session_id: SessionId,
    pub timestamp: Timestamp,
    pub body: MessageBody,
}

impl Message {
    pub fn new(session_id: SessionId, timestamp: Timestamp, body: MessageBody) -> Self {
        Message {
            session_id,
            timestamp,
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Serialize to a frame payload
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let value = serde_json::to_value(&self.body).map_err(|e| CodecError::Encode(e.to_string()))?;
        let Value::Object(mut object) = value else {
            return Err(CodecError::Encode("message body is not an object".into()));
        };
        object.insert(SESSION_FIELD.into(), Value::from(self.session_id.0));
        object.insert(TIMESTAMP_FIELD.into(), Value::from(self.timestamp.as_millis()));

        serde_json::to_vec(&object).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Parse a frame payload
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let value: Value =
            serde_json::from_slice(payload).map_err(|e| CodecError::Malformed(e.to_string()))?;
        let Value::Object(object) = value else {
            return Err(CodecError::Malformed("payload is not a JSON object".into()));
        };

        let kind = match object.get(KIND_FIELD) {
            Some(Value::String(kind)) => kind.as_str(),
            Some(_) => return Err(CodecError::Malformed("kind is not a string".into())),
            None => return Err(CodecError::Malformed("missing kind".into())),
        };
        if MessageKind::from_wire(kind).is_none() {
            return Err(CodecError::UnknownKind(kind.to_string()));
        }

        let session_id = SessionId(required_u64(&object, SESSION_FIELD)?);
        let timestamp = Timestamp(required_u64(&object, TIMESTAMP_FIELD)?);

        // Envelope and unknown fields are ignored by the body deserializer
        let body = serde_json::from_value(Value::Object(object))
            .map_err(|e| CodecError::Malformed(e.to_string()))?;

        Ok(Message {
            session_id,
            timestamp,
            body,
        })
    }
}

fn required_u64(object: &Map<String, Value>, field: &str) -> Result<u64, CodecError> {
    object
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| CodecError::Malformed(format!("missing or invalid {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use proptest::prelude::*;
    use stroop_core::{Color, Stimulus};

    use crate::{DisplayedStimulus, StimulusResponse};

    fn envelope(body: MessageBody) -> Message {
        Message::new(SessionId::new(0xABCD), Timestamp::from_millis(1_700_000_000_000), body)
    }

    #[test]
    fn test_wire_shape() {
        let message = envelope(MessageBody::StartTask {
            task_id: TaskId::from("color-words"),
            label: "Color words".into(),
            timeout_ms: 180_000,
        });
        let value: Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();

        assert_eq!(value["kind"], "start_task");
        assert_eq!(value["session_id"], 0xABCD);
        assert_eq!(value["timestamp_ms"], 1_700_000_000_000u64);
        assert_eq!(value["task_id"], "color-words");
        assert_eq!(value["timeout_ms"], 180_000);
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let message = envelope(MessageBody::Heartbeat);
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.kind(), MessageKind::Heartbeat);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let payload = br#"{"kind":"end_task","session_id":7,"timestamp_ms":9,
            "task_id":"t1","added_in_v2":{"nested":true}}"#;
        let message = Message::decode(payload).unwrap();
        assert_eq!(
            message.body,
            MessageBody::EndTask {
                task_id: TaskId::from("t1")
            }
        );

        let payload = br#"{"kind":"heartbeat","session_id":7,"timestamp_ms":9,"seq":3}"#;
        assert_eq!(Message::decode(payload).unwrap().body, MessageBody::Heartbeat);
    }

    #[test]
    fn test_unknown_kind_fails_closed() {
        let payload = br#"{"kind":"self_destruct","session_id":7,"timestamp_ms":9}"#;
        assert_eq!(
            Message::decode(payload),
            Err(CodecError::UnknownKind("self_destruct".into()))
        );
    }

    #[test]
    fn test_malformed_payloads() {
        let payloads: [&[u8]; 6] = [
            b"not json",
            br#"[1,2,3]"#,
            br#"{"session_id":7,"timestamp_ms":9}"#,
            br#"{"kind":"end_task","timestamp_ms":9,"task_id":"t"}"#,
            br#"{"kind":"end_task","session_id":7,"timestamp_ms":9}"#,
            br#"{"kind":5,"session_id":7,"timestamp_ms":9}"#,
        ];
        for payload in payloads {
            assert!(matches!(Message::decode(payload), Err(CodecError::Malformed(_))));
        }
    }

    #[test]
    fn test_unknown_error_code_maps_to_other() {
        let payload = br#"{"kind":"error","session_id":1,"timestamp_ms":2,
            "code":"quota_exceeded","message":"later"}"#;
        let message = Message::decode(payload).unwrap();
        assert!(matches!(
            message.body,
            MessageBody::Error {
                code: ErrorCode::Other,
                ..
            }
        ));
    }

    #[test]
    fn test_every_kind_has_unique_wire_name() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_wire(kind.as_str()), Some(kind));
        }
    }

    fn arb_task_id() -> impl Strategy<Value = TaskId> {
        "[a-z][a-z0-9-]{0,12}".prop_map(TaskId)
    }

    fn arb_results() -> impl Strategy<Value = TaskResults> {
        (
            arb_task_id(),
            prop::collection::vec((0u64..10_000, prop::option::of((any::<bool>(), 0u64..3_000))), 0..8),
        )
            .prop_map(|(task_id, shown)| {
                let stimuli = shown
                    .into_iter()
                    .enumerate()
                    .map(|(i, (offset, response))| {
                        let stimulus =
                            Stimulus::new("GREEN", Color::from("red"), Color::from("green")).unwrap();
                        let shown_at = Timestamp::from_millis(i as u64 * 10_000 + offset);
                        let mut displayed = DisplayedStimulus::new(
                            stimulus,
                            shown_at,
                            Duration::from_millis(2_000),
                            Duration::from_millis(1_000 + offset % 2_000),
                        );
                        displayed.response = response.map(|(correct, rt)| StimulusResponse {
                            correct,
                            responded_at: shown_at + Duration::from_millis(rt),
                        });
                        displayed
                    })
                    .collect();
                TaskResults::aggregate(
                    task_id,
                    TaskOutcome::TimedOut,
                    Timestamp::from_millis(0),
                    Timestamp::from_millis(200_000),
                    stimuli,
                )
            })
    }

    fn arb_body() -> impl Strategy<Value = MessageBody> {
        prop_oneof![
            (any::<u64>(), any::<u32>()).prop_map(|(d, version)| MessageBody::Handshake {
                device_id: DeviceId(d),
                version
            }),
            (any::<u64>(), any::<u32>(), any::<bool>()).prop_map(|(d, version, ready)| {
                MessageBody::HandshakeResponse {
                    device_id: DeviceId(d),
                    version,
                    ready,
                }
            }),
            Just(MessageBody::Heartbeat),
            (arb_task_id(), ".{0,20}", any::<u64>()).prop_map(|(task_id, label, timeout_ms)| {
                MessageBody::StartTask {
                    task_id,
                    label,
                    timeout_ms,
                }
            }),
            arb_task_id().prop_map(|task_id| MessageBody::EndTask { task_id }),
            arb_task_id().prop_map(|task_id| MessageBody::PauseTask { task_id }),
            arb_task_id().prop_map(|task_id| MessageBody::ResumeTask { task_id }),
            arb_task_id().prop_map(|task_id| MessageBody::ResetTask { task_id }),
            arb_task_id().prop_map(|task_id| MessageBody::StroopStarted { task_id }),
            arb_task_id().prop_map(|task_id| MessageBody::StroopEnded {
                task_id,
                outcome: TaskOutcome::Ended
            }),
            (arb_task_id(), any::<u32>(), any::<u64>()).prop_map(
                |(task_id, stimuli_shown, remaining_ms)| MessageBody::TaskStatus {
                    task_id,
                    phase: TaskPhase::Interval,
                    stimuli_shown,
                    remaining_ms,
                }
            ),
            arb_results().prop_map(|results| MessageBody::TaskCompleted { results }),
            arb_task_id().prop_map(|task_id| MessageBody::ResultsReceived { task_id }),
            ".{0,40}".prop_map(|message| MessageBody::Error {
                code: ErrorCode::Malformed,
                message
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(session in any::<u64>(), ts in any::<u64>(), body in arb_body()) {
            let message = Message::new(SessionId(session), Timestamp(ts), body);
            let decoded = Message::decode(&message.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, message);
        }
    }
}
