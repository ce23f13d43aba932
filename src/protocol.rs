//! Wire codec for operations and protocol messages.
//!
//! A text operation travels as a compact JSON array: a positive integer is a
//! retain, a negative integer a delete, a string an insert. `[1, "X", 5]`
//! inserts `"X"` after the first character of a seven character document.
//! Decoding rebuilds the operation through the builder, so canonical form is
//! re-imposed and anything else in the array is rejected.
//!
//! Message envelopes are JSON objects tagged with a `type` field:
//!
//! ```text
//! client -> server   {"type":"push","revision":3,"op":[1,"X",5]}
//!                    {"type":"pull","revision":3}
//! server -> client   {"type":"initialState","doc":"...","revision":3}
//!                    {"type":"ack","revision":4}
//!                    {"type":"update","revision":4,"op":[1,"X",5]}
//!                    {"type":"history","startRevision":4,"ops":[...],
//!                     "currentRevision":6,"currentDocState":"..."}
//!                    {"type":"error","message":"..."}
//! ```

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::operation::{OpComponent, TextOperation};

/// Errors from the wire codec.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("malformed wire message: {0}")]
    Decode(String),
}

impl Serialize for TextOperation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.components().len()))?;
        for component in self.components() {
            match component {
                OpComponent::Retain(n) => seq.serialize_element(&(*n as i64))?,
                OpComponent::Delete(n) => seq.serialize_element(&-(*n as i64))?,
                OpComponent::Insert(text) => seq.serialize_element(text)?,
            }
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for TextOperation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct WireOpVisitor;

        /// One untyped element of the wire array.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum WireComponent {
            Count(i64),
            Text(String),
        }

        impl<'de> Visitor<'de> for WireOpVisitor {
            type Value = TextOperation;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an array of non-zero integers and strings")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<TextOperation, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut op = TextOperation::new();
                while let Some(component) = seq.next_element::<WireComponent>()? {
                    match component {
                        WireComponent::Count(n) if n > 0 => {
                            op.retain(n as usize);
                        }
                        WireComponent::Count(n) if n < 0 => {
                            op.delete(n.unsigned_abs() as usize);
                        }
                        WireComponent::Count(_) => {
                            return Err(de::Error::custom("zero-length wire component"));
                        }
                        WireComponent::Text(text) => {
                            // Empty inserts are dropped by the builder.
                            op.insert(text);
                        }
                    }
                }
                Ok(op)
            }
        }

        deserializer.deserialize_seq(WireOpVisitor)
    }
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Submit an operation based on the given server revision.
    Push { revision: u32, op: TextOperation },
    /// Request the history since the given revision.
    Pull { revision: u32 },
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent once at session establishment.
    InitialState { doc: String, revision: u32 },
    /// Confirms the originator's push; carries the new revision.
    Ack { revision: u32 },
    /// An operation pushed by another client, never echoed to its originator.
    Update { revision: u32, op: TextOperation },
    /// Reply to a pull: the operations from `start_revision` onwards plus the
    /// authoritative document state for clients that need a hard reset.
    History {
        start_revision: u32,
        ops: Vec<TextOperation>,
        current_revision: u32,
        current_doc_state: String,
    },
    /// Non-fatal protocol error; the client decides whether to pull.
    Error { message: String },
}

impl ClientMessage {
    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, DecodeError> {
        serde_json::to_string(self).map_err(|e| DecodeError::Encode(e.to_string()))
    }

    /// Deserialize from the JSON wire form.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(raw).map_err(|e| DecodeError::Decode(e.to_string()))
    }
}

impl ServerMessage {
    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, DecodeError> {
        serde_json::to_string(self).map_err(|e| DecodeError::Encode(e.to_string()))
    }

    /// Deserialize from the JSON wire form.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(raw).map_err(|e| DecodeError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_op_form() {
        let mut op = TextOperation::new();
        op.retain(1).delete(1).insert("abc");
        assert_eq!(serde_json::to_string(&op).unwrap(), r#"[1,"abc",-1]"#);
    }

    #[test]
    fn test_op_decode_through_builder() {
        let op: TextOperation = serde_json::from_str(r#"[1,-1,"abc"]"#).unwrap();
        let mut expected = TextOperation::new();
        expected.retain(1).delete(1).insert("abc");
        assert_eq!(op, expected);
    }

    #[test]
    fn test_op_decode_renormalises_adjacent_runs() {
        let op: TextOperation = serde_json::from_str(r#"[1,2,"a","b",-1,-2]"#).unwrap();
        assert_eq!(serde_json::to_string(&op).unwrap(), r#"[3,"ab",-3]"#);
    }

    #[test]
    fn test_op_round_trip() {
        let mut op = TextOperation::new();
        op.retain(2).insert("héllo").delete(4).retain(1);
        let encoded = serde_json::to_string(&op).unwrap();
        let decoded: TextOperation = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_op_rejects_zero_and_other_types() {
        assert!(serde_json::from_str::<TextOperation>("[0]").is_err());
        assert!(serde_json::from_str::<TextOperation>("[true]").is_err());
        assert!(serde_json::from_str::<TextOperation>("[1.5]").is_err());
        assert!(serde_json::from_str::<TextOperation>(r#"[{"retain":1}]"#).is_err());
        assert!(serde_json::from_str::<TextOperation>(r#""not an array""#).is_err());
    }

    #[test]
    fn test_push_round_trip() {
        let mut op = TextOperation::new();
        op.retain(1).insert("X").retain(5);
        let msg = ClientMessage::Push { revision: 0, op };
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded, r#"{"type":"push","revision":0,"op":[1,"X",5]}"#);
        assert_eq!(ClientMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_pull_round_trip() {
        let msg = ClientMessage::Pull { revision: 3 };
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded, r#"{"type":"pull","revision":3}"#);
        assert_eq!(ClientMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_server_messages_round_trip() {
        let mut op = TextOperation::new();
        op.retain(4).insert("Y").retain(2);
        let messages = vec![
            ServerMessage::InitialState {
                doc: "abcdef".into(),
                revision: 0,
            },
            ServerMessage::Ack { revision: 1 },
            ServerMessage::Update {
                revision: 1,
                op: op.clone(),
            },
            ServerMessage::History {
                start_revision: 4,
                ops: vec![op.clone(), op],
                current_revision: 5,
                current_doc_state: "abcdefY".into(),
            },
            ServerMessage::Error {
                message: "revision 9 outside [0, 5]".into(),
            },
        ];
        for msg in messages {
            let encoded = msg.encode().unwrap();
            assert_eq!(ServerMessage::decode(&encoded).unwrap(), msg);
        }
    }

    #[test]
    fn test_history_field_names() {
        let msg = ServerMessage::History {
            start_revision: 1,
            ops: vec![],
            current_revision: 0,
            current_doc_state: String::new(),
        };
        let encoded = msg.encode().unwrap();
        assert!(encoded.contains("startRevision"));
        assert!(encoded.contains("currentRevision"));
        assert!(encoded.contains("currentDocState"));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(ClientMessage::decode("not json").is_err());
        assert!(ServerMessage::decode(r#"{"type":"launch"}"#).is_err());
        assert!(ClientMessage::decode(r#"{"type":"push","revision":0,"op":[false]}"#).is_err());
    }
}
