//! Wire types and codec for the `json.webpubsub.azure.v1` sub-protocol.
//!
//! Outbound control and data operations are modelled as [`ClientMessage`] and
//! serialised with an internal `type` tag. Inbound frames decode into the flat
//! [`WireMessage`] envelope, whose fields are all optional strings on the wire
//! and default to `""` when absent.

use serde::{Deserialize, Serialize};

use crate::error::{PubSubError, Result};

/// Sub-protocol identifier negotiated during the WebSocket handshake.
pub const SUB_PROTOCOL: &str = "json.webpubsub.azure.v1";

// ── Outbound ────────────────────────────────────────────────────────

/// Messages sent from the client to the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Add this connection to a group.
    JoinGroup { group: String },
    /// Remove this connection from a group.
    LeaveGroup { group: String },
    /// Broadcast `data` to every connection in `group`.
    SendToGroup { group: String, data: String },
}

// ── Inbound ─────────────────────────────────────────────────────────

/// The envelope delivered by the service.
///
/// Which fields are populated depends on the server event; anything absent
/// decodes to an empty string and unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    pub user_id: String,
    pub connection_id: String,
    pub from: String,
    pub from_user_id: String,
    pub group: String,
    pub data_type: String,
    pub data: String,
}

/// Classification of [`WireMessage::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Message,
    Event,
    JoinGroup,
    LeaveGroup,
    SendToGroup,
    /// Any tag this crate does not model, including the empty string.
    Other,
}

/// Classification of [`WireMessage::data_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Text,
    Json,
    Binary,
    Other,
}

impl WireMessage {
    /// The message type tag as a [`MessageKind`].
    pub fn message_kind(&self) -> MessageKind {
        match self.kind.as_str() {
            "message" => MessageKind::Message,
            "event" => MessageKind::Event,
            "joinGroup" => MessageKind::JoinGroup,
            "leaveGroup" => MessageKind::LeaveGroup,
            "sendToGroup" => MessageKind::SendToGroup,
            _ => MessageKind::Other,
        }
    }

    /// The payload encoding as a [`DataType`].
    pub fn payload_type(&self) -> DataType {
        match self.data_type.as_str() {
            "text" => DataType::Text,
            "json" => DataType::Json,
            "binary" => DataType::Binary,
            _ => DataType::Other,
        }
    }

    /// Returns `true` if this is a group broadcast addressed to `group`.
    pub fn is_group_message(&self, group: &str) -> bool {
        self.message_kind() == MessageKind::Message && self.from == "group" && self.group == group
    }
}

// ── Codec ───────────────────────────────────────────────────────────

fn require(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(PubSubError::invalid(field));
    }
    Ok(())
}

/// Encode a `joinGroup` control message.
///
/// # Errors
///
/// Returns [`PubSubError::Validation`] if `group` is empty or whitespace.
pub fn encode_join(group: &str) -> Result<String> {
    require("group", group)?;
    encode(&ClientMessage::JoinGroup {
        group: group.to_owned(),
    })
}

/// Encode a `leaveGroup` control message.
///
/// # Errors
///
/// Returns [`PubSubError::Validation`] if `group` is empty or whitespace.
pub fn encode_leave(group: &str) -> Result<String> {
    require("group", group)?;
    encode(&ClientMessage::LeaveGroup {
        group: group.to_owned(),
    })
}

/// Encode a `sendToGroup` data message.
///
/// # Errors
///
/// Returns [`PubSubError::Validation`] if `group` or `data` is empty or
/// whitespace.
pub fn encode_send_to_group(group: &str, data: &str) -> Result<String> {
    require("group", group)?;
    require("data", data)?;
    encode(&ClientMessage::SendToGroup {
        group: group.to_owned(),
        data: data.to_owned(),
    })
}

/// Serialise any [`ClientMessage`] to its JSON text frame.
pub fn encode(message: &ClientMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode an inbound text frame into a [`WireMessage`].
///
/// # Errors
///
/// Returns [`PubSubError::Decode`] if `bytes` is not a JSON object.
pub fn decode(bytes: &[u8]) -> Result<WireMessage> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn join_wire_shape() {
        assert_eq!(
            encode_join("g1").unwrap(),
            r#"{"type":"joinGroup","group":"g1"}"#
        );
    }

    #[test]
    fn leave_wire_shape() {
        assert_eq!(
            encode_leave("g1").unwrap(),
            r#"{"type":"leaveGroup","group":"g1"}"#
        );
    }

    #[test]
    fn send_to_group_wire_shape() {
        assert_eq!(
            encode_send_to_group("g1", "hi").unwrap(),
            r#"{"type":"sendToGroup","group":"g1","data":"hi"}"#
        );
    }

    #[test]
    fn whitespace_group_is_rejected() {
        for group in ["", " ", "\t\n"] {
            let err = encode_join(group).unwrap_err();
            assert!(matches!(err, PubSubError::Validation { field: "group" }));
            let err = encode_leave(group).unwrap_err();
            assert!(matches!(err, PubSubError::Validation { field: "group" }));
        }
    }

    #[test]
    fn whitespace_data_is_rejected() {
        let err = encode_send_to_group("g1", "  ").unwrap_err();
        assert!(matches!(err, PubSubError::Validation { field: "data" }));
    }

    #[test]
    fn group_is_checked_before_data() {
        let err = encode_send_to_group("", "").unwrap_err();
        assert!(matches!(err, PubSubError::Validation { field: "group" }));
    }

    #[test]
    fn decode_fills_missing_fields_with_empty() {
        let msg = decode(br#"{"type":"event","event":"connected"}"#).unwrap();
        assert_eq!(msg.message_kind(), MessageKind::Event);
        assert_eq!(msg.event, "connected");
        assert_eq!(msg.group, "");
        assert_eq!(msg.data, "");
        assert_eq!(msg.payload_type(), DataType::Other);
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let msg = decode(br#"{"type":"message","sequenceId":7,"data":"x"}"#).unwrap();
        assert_eq!(msg.kind, "message");
        assert_eq!(msg.data, "x");
    }

    #[test]
    fn decode_rejects_malformed_json() {
        assert!(matches!(decode(b"{not json"), Err(PubSubError::Decode(_))));
        assert!(matches!(decode(b""), Err(PubSubError::Decode(_))));
    }

    #[test]
    fn group_message_classification() {
        let msg = decode(
            br#"{"type":"message","from":"group","group":"g1","dataType":"text","data":"hi"}"#,
        )
        .unwrap();
        assert!(msg.is_group_message("g1"));
        assert!(!msg.is_group_message("g2"));
        assert_eq!(msg.payload_type(), DataType::Text);
    }
}
