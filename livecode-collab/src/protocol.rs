//! Wire protocol between peers and the relay.
//!
//! Every frame is one [`Envelope`]. Binary WebSocket frames carry the
//! bincode encoding; text frames carry JSON shaped as
//! `{"type": "sync-update", "payload": {...}}` for browser clients.
//!
//! ```text
//! peer ── join ──────────────► relay
//! peer ◄──────────── joined ── relay ── peer-joined ──► others
//! peer ── sync-update ───────► relay ── sync-update ──► others (from overwritten)
//! ```
//!
//! Document and awareness payloads are opaque bytes here; only peers decode
//! them.

use livecode_core::SiteId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

pub type SessionId = Uuid;

/// Peer identity as announced to the rest of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub site_id: SiteId,
    pub display_name: String,
}

impl PeerInfo {
    pub fn new(site_id: SiteId, display_name: impl Into<String>) -> Self {
        Self {
            site_id,
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub session_id: SessionId,
    pub site_id: SiteId,
    pub display_name: String,
    /// Create the session if it does not exist
    #[serde(default)]
    pub create: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAck {
    pub session_id: SessionId,
    pub site_id: SiteId,
    /// Peers already in the session
    pub peers: Vec<PeerInfo>,
    /// No one else is here; start from an empty document
    pub first: bool,
}

/// An opaque payload stamped with its sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relayed {
    pub from: SiteId,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub from: SiteId,
    pub to: SiteId,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Executing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    SessionUnavailable,
    SessionFull,
    ExecutionBusy,
    NotJoined,
    AlreadyJoined,
    Malformed,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Envelope {
    Join(JoinRequest),
    Joined(JoinAck),
    SyncUpdate(Relayed),
    SnapshotRequest {
        requester: SiteId,
    },
    Snapshot(SnapshotPayload),
    AwarenessUpdate(Relayed),
    PeerJoined(PeerInfo),
    PeerLeft {
        site_id: SiteId,
    },
    ExecutionSubmit {
        code: String,
        #[serde(default)]
        language: Option<String>,
    },
    ExecutionStatus {
        state: ExecutionState,
        requester: SiteId,
    },
    ExecutionResult {
        requester: SiteId,
        output: String,
        success: bool,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Ping,
    Pong,
}

/// How a connection frames envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Binary,
    Json,
}

#[derive(Serialize, Deserialize)]
struct JsonFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl Envelope {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Joined(_) => "joined",
            Self::SyncUpdate(_) => "sync-update",
            Self::SnapshotRequest { .. } => "snapshot-request",
            Self::Snapshot(_) => "snapshot",
            Self::AwarenessUpdate(_) => "awareness-update",
            Self::PeerJoined(_) => "peer-joined",
            Self::PeerLeft { .. } => "peer-left",
            Self::ExecutionSubmit { .. } => "execution-submit",
            Self::ExecutionStatus { .. } => "execution-status",
            Self::ExecutionResult { .. } => "execution-result",
            Self::Error { .. } => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(envelope)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let tagged =
            serde_json::to_value(self).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        // Externally tagged: unit variants are a bare string, the rest a
        // single-key object
        let frame = match tagged {
            Value::String(kind) => JsonFrame {
                kind,
                payload: Value::Null,
            },
            Value::Object(map) => match map.into_iter().next() {
                Some((kind, payload)) => JsonFrame { kind, payload },
                None => return Err(ProtocolError::Serialization("empty envelope".into())),
            },
            other => {
                return Err(ProtocolError::Serialization(format!(
                    "unexpected envelope shape: {other}"
                )))
            }
        };
        serde_json::to_string(&frame).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let frame: JsonFrame =
            serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        let tagged = if frame.payload.is_null() {
            Value::String(frame.kind)
        } else {
            let mut map = serde_json::Map::new();
            map.insert(frame.kind, frame.payload);
            Value::Object(map)
        };
        serde_json::from_value(tagged).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Wrap into a WebSocket message in the given format.
    pub fn to_message(&self, format: WireFormat) -> Result<Message, ProtocolError> {
        Ok(match format {
            WireFormat::Binary => Message::Binary(self.encode()?.into()),
            WireFormat::Json => Message::Text(self.to_json()?.into()),
        })
    }

    /// Unwrap a WebSocket message. Control frames yield `Ok(None)`.
    pub fn from_message(message: Message) -> Result<Option<(Self, WireFormat)>, ProtocolError> {
        match message {
            Message::Binary(data) => Ok(Some((Self::decode(&data)?, WireFormat::Binary))),
            Message::Text(text) => Ok(Some((Self::from_json(text.as_str())?, WireFormat::Json))),
            Message::Close(_) => Err(ProtocolError::ConnectionClosed),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(None),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unsupported frame: {0}")]
    UnsupportedFrame(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Envelope> {
        let site = Uuid::new_v4();
        vec![
            Envelope::Join(JoinRequest {
                session_id: Uuid::new_v4(),
                site_id: site,
                display_name: "Ada".into(),
                create: true,
            }),
            Envelope::SyncUpdate(Relayed {
                from: site,
                data: vec![1, 2, 3],
            }),
            Envelope::SnapshotRequest { requester: site },
            Envelope::ExecutionSubmit {
                code: "print(1)".into(),
                language: Some("python".into()),
            },
            Envelope::ExecutionStatus {
                state: ExecutionState::Executing,
                requester: site,
            },
            Envelope::error(ErrorCode::ExecutionBusy, "busy"),
            Envelope::Ping,
        ]
    }

    #[test]
    fn test_binary_roundtrip() {
        for envelope in sample() {
            let bytes = envelope.encode().unwrap();
            assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
        }
    }

    #[test]
    fn test_json_roundtrip() {
        for envelope in sample() {
            let text = envelope.to_json().unwrap();
            assert_eq!(Envelope::from_json(&text).unwrap(), envelope, "{text}");
        }
    }

    #[test]
    fn test_json_frame_shape() {
        let site = Uuid::nil();
        let text = Envelope::ExecutionStatus {
            state: ExecutionState::Executing,
            requester: site,
        }
        .to_json()
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["type"], "execution-status");
        assert_eq!(value["payload"]["state"], "executing");

        let ping: Value = serde_json::from_str(&Envelope::Ping.to_json().unwrap()).unwrap();
        assert_eq!(ping["type"], "ping");
        assert!(ping["payload"].is_null());
    }

    #[test]
    fn test_json_from_browser_client() {
        let text = r#"{"type":"execution-submit","payload":{"code":"1+1"}}"#;
        assert_eq!(
            Envelope::from_json(text).unwrap(),
            Envelope::ExecutionSubmit {
                code: "1+1".into(),
                language: None
            }
        );

        let pong = r#"{"type":"pong"}"#;
        assert_eq!(Envelope::from_json(pong).unwrap(), Envelope::Pong);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let text = r#"{"type":"launch-missiles","payload":{}}"#;
        assert!(matches!(
            Envelope::from_json(text),
            Err(ProtocolError::Deserialization(_))
        ));
        assert!(Envelope::decode(&[0xEE, 0x01]).is_err());
    }

    #[test]
    fn test_message_wrapping() {
        let envelope = Envelope::PeerLeft {
            site_id: Uuid::new_v4(),
        };
        for format in [WireFormat::Binary, WireFormat::Json] {
            let message = envelope.to_message(format).unwrap();
            let (decoded, seen) = Envelope::from_message(message).unwrap().unwrap();
            assert_eq!(decoded, envelope);
            assert_eq!(seen, format);
        }
        assert!(Envelope::from_message(Message::Ping(Vec::new().into()))
            .unwrap()
            .is_none());
        assert_eq!(
            Envelope::from_message(Message::Close(None)),
            Err(ProtocolError::ConnectionClosed)
        );
    }
}
