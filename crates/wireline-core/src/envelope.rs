//! Inbound envelope shapes and classification
//!
//! Every frame on the event channel is a `receive` notification wrapping one
//! envelope. The envelope carries exactly one payload kind, discovered by
//! checking fields in a fixed priority order: a reaction inside a data
//! message beats the data message itself, a group-update flag beats a plain
//! data message, and so on down to call messages. Anything that matches
//! nothing is unrecognized and gets logged and dropped by the dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ProtocolError, Result};

// ----------------------------------------------------------------------------
// Raw Payload Shapes
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAttachment {
    pub content_type: Option<String>,
    pub filename: Option<String>,
    pub id: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMention {
    pub name: Option<String>,
    pub number: Option<String>,
    pub uuid: Option<String>,
    pub start: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawQuote {
    pub id: u64,
    pub author: Option<String>,
    pub author_number: Option<String>,
    pub author_uuid: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPreview {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSticker {
    pub pack_id: String,
    pub sticker_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawGroupInfo {
    pub group_id: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl RawGroupInfo {
    /// The daemon flags group metadata changes with type UPDATE; everything
    /// else is an ordinary delivery into the group.
    pub fn is_update(&self) -> bool {
        self.kind.as_deref() == Some("UPDATE")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReaction {
    pub emoji: String,
    pub target_author: Option<String>,
    pub target_author_number: Option<String>,
    pub target_author_uuid: Option<String>,
    pub target_sent_timestamp: u64,
    #[serde(default)]
    pub is_remove: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDataMessage {
    pub message: Option<String>,
    pub timestamp: Option<u64>,
    pub expires_in_seconds: Option<u64>,
    pub reaction: Option<RawReaction>,
    #[serde(default)]
    pub attachments: Vec<RawAttachment>,
    #[serde(default)]
    pub mentions: Vec<RawMention>,
    pub quote: Option<RawQuote>,
    #[serde(default)]
    pub previews: Vec<RawPreview>,
    pub sticker: Option<RawSticker>,
    pub group_info: Option<RawGroupInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReceiptMessage {
    pub when: u64,
    #[serde(default)]
    pub is_delivery: bool,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub is_viewed: bool,
    #[serde(default)]
    pub timestamps: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTypingMessage {
    pub action: String,
    pub timestamp: u64,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReadMark {
    pub sender: Option<String>,
    pub sender_number: Option<String>,
    pub sender_uuid: Option<String>,
    pub timestamp: u64,
}

/// A sent-message echo inside a sync message: the data-message shape plus
/// the destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSentEcho {
    pub destination: Option<String>,
    pub destination_number: Option<String>,
    pub destination_uuid: Option<String>,
    pub timestamp: u64,
    pub expiration_in_seconds: Option<u64>,
    pub message: Option<String>,
    #[serde(default)]
    pub attachments: Vec<RawAttachment>,
    #[serde(default)]
    pub mentions: Vec<RawMention>,
    pub quote: Option<RawQuote>,
    #[serde(default)]
    pub previews: Vec<RawPreview>,
    pub sticker: Option<RawSticker>,
    pub group_info: Option<RawGroupInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSyncMessage {
    pub read_messages: Option<Vec<RawReadMark>>,
    pub sent_message: Option<RawSentEcho>,
    pub blocked_numbers: Option<Vec<String>>,
    #[serde(default)]
    pub blocked_group_ids: Vec<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStoryMessage {
    #[serde(default)]
    pub allows_replies: bool,
    pub message: Option<String>,
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// One inbound envelope from the daemon's `receive` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub source: Option<String>,
    pub source_number: Option<String>,
    pub source_uuid: Option<String>,
    pub source_name: Option<String>,
    #[serde(default = "default_device")]
    pub source_device: u64,
    pub timestamp: u64,
    pub data_message: Option<RawDataMessage>,
    pub receipt_message: Option<RawReceiptMessage>,
    pub typing_message: Option<RawTypingMessage>,
    pub sync_message: Option<RawSyncMessage>,
    pub story_message: Option<RawStoryMessage>,
    pub call_message: Option<Value>,
}

fn default_device() -> u64 {
    1
}

/// What one envelope turned out to carry, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Reaction,
    GroupUpdate,
    Data,
    Receipt,
    SyncReadMessages,
    SyncSentMessage,
    SyncBlocked,
    SyncContacts,
    SyncGroups,
    Typing,
    Story,
    Call,
    Unrecognized,
}

impl Envelope {
    /// The sender's identity parts as reported by the daemon: number, UUID,
    /// and display name. `source` fills whichever shaped field is missing.
    pub fn sender_parts(&self) -> (Option<&str>, Option<&str>, Option<&str>) {
        let mut number = self.source_number.as_deref();
        let mut uuid = self.source_uuid.as_deref();
        if let Some(source) = self.source.as_deref() {
            if source.starts_with('+') {
                number = number.or(Some(source));
            } else {
                uuid = uuid.or(Some(source));
            }
        }
        (number, uuid, self.source_name.as_deref())
    }

    /// Classify this envelope by checking payload fields in priority order.
    pub fn classify(&self) -> EnvelopeKind {
        if let Some(data) = &self.data_message {
            if data.reaction.is_some() {
                return EnvelopeKind::Reaction;
            }
            if data.group_info.as_ref().is_some_and(RawGroupInfo::is_update) {
                return EnvelopeKind::GroupUpdate;
            }
            return EnvelopeKind::Data;
        }
        if self.receipt_message.is_some() {
            return EnvelopeKind::Receipt;
        }
        if let Some(sync) = &self.sync_message {
            if sync.read_messages.is_some() {
                return EnvelopeKind::SyncReadMessages;
            }
            if sync.sent_message.is_some() {
                return EnvelopeKind::SyncSentMessage;
            }
            if sync.blocked_numbers.is_some() {
                return EnvelopeKind::SyncBlocked;
            }
            return match sync.kind.as_deref() {
                Some("CONTACTS_SYNC") => EnvelopeKind::SyncContacts,
                Some("GROUPS_SYNC") => EnvelopeKind::SyncGroups,
                _ => EnvelopeKind::Unrecognized,
            };
        }
        if self.typing_message.is_some() {
            return EnvelopeKind::Typing;
        }
        if self.story_message.is_some() {
            return EnvelopeKind::Story;
        }
        if self.call_message.is_some() {
            return EnvelopeKind::Call;
        }
        EnvelopeKind::Unrecognized
    }
}

// ----------------------------------------------------------------------------
// Frame Parsing
// ----------------------------------------------------------------------------

/// What one line on the event channel turned out to be.
#[derive(Debug)]
pub enum InboundFrame {
    /// A `receive` notification carrying an envelope.
    Receive(Envelope),
    /// A response to a request issued on this connection (e.g. the
    /// subscribe acknowledgement).
    Response(Value),
    /// Some other notification the engine does not consume.
    Other(Value),
}

/// Parse one newline-delimited frame from the event channel.
pub fn parse_frame(line: &str) -> Result<InboundFrame> {
    let value: Value = serde_json::from_str(line).map_err(|e| ProtocolError::MalformedEnvelope {
        reason: e.to_string(),
    })?;
    match value.get("method").and_then(Value::as_str) {
        Some("receive") => {
            let envelope = value
                .get("params")
                .and_then(|params| params.get("envelope"))
                .cloned()
                .ok_or_else(|| ProtocolError::MalformedEnvelope {
                    reason: "receive notification without an envelope".to_string(),
                })?;
            let envelope: Envelope =
                serde_json::from_value(envelope).map_err(|e| ProtocolError::MalformedEnvelope {
                    reason: e.to_string(),
                })?;
            Ok(InboundFrame::Receive(envelope))
        }
        Some(_) => Ok(InboundFrame::Other(value)),
        None => Ok(InboundFrame::Response(value)),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(payload: Value) -> Envelope {
        let mut base = json!({
            "source": "+15551230001",
            "sourceNumber": "+15551230001",
            "sourceUuid": "11111111-2222-3333-4444-555555555555",
            "sourceName": "Alice",
            "sourceDevice": 1,
            "timestamp": 1_700_000_000_000u64,
        });
        base.as_object_mut()
            .unwrap()
            .extend(payload.as_object().unwrap().clone());
        serde_json::from_value(base).unwrap()
    }

    #[test]
    fn reaction_beats_data_message() {
        let envelope = envelope(json!({
            "dataMessage": {
                "message": null,
                "reaction": {
                    "emoji": "\u{1F44D}",
                    "targetAuthorNumber": "+15550000001",
                    "targetSentTimestamp": 1_000,
                    "isRemove": false,
                },
            },
        }));
        assert_eq!(envelope.classify(), EnvelopeKind::Reaction);
    }

    #[test]
    fn group_update_flag_beats_plain_data() {
        let envelope = envelope(json!({
            "dataMessage": {
                "message": null,
                "groupInfo": {"groupId": "grp-1", "type": "UPDATE"},
            },
        }));
        assert_eq!(envelope.classify(), EnvelopeKind::GroupUpdate);
    }

    #[test]
    fn group_delivery_is_plain_data() {
        let envelope = envelope(json!({
            "dataMessage": {
                "message": "hello",
                "groupInfo": {"groupId": "grp-1", "type": "DELIVER"},
            },
        }));
        assert_eq!(envelope.classify(), EnvelopeKind::Data);
    }

    #[test]
    fn sync_subkinds() {
        let read = envelope(json!({
            "syncMessage": {"readMessages": [{"sender": "+15550000001", "timestamp": 1_000}]},
        }));
        assert_eq!(read.classify(), EnvelopeKind::SyncReadMessages);

        let sent = envelope(json!({
            "syncMessage": {"sentMessage": {"destinationNumber": "+15550000001", "timestamp": 1_000}},
        }));
        assert_eq!(sent.classify(), EnvelopeKind::SyncSentMessage);

        let blocked = envelope(json!({
            "syncMessage": {"blockedNumbers": [], "blockedGroupIds": []},
        }));
        assert_eq!(blocked.classify(), EnvelopeKind::SyncBlocked);

        let contacts = envelope(json!({"syncMessage": {"type": "CONTACTS_SYNC"}}));
        assert_eq!(contacts.classify(), EnvelopeKind::SyncContacts);

        let groups = envelope(json!({"syncMessage": {"type": "GROUPS_SYNC"}}));
        assert_eq!(groups.classify(), EnvelopeKind::SyncGroups);

        let unknown = envelope(json!({"syncMessage": {"type": "SOMETHING_ELSE"}}));
        assert_eq!(unknown.classify(), EnvelopeKind::Unrecognized);
    }

    #[test]
    fn remaining_kinds_in_priority_order() {
        let receipt = envelope(json!({
            "receiptMessage": {"when": 1_000, "isDelivery": true, "timestamps": [1_000]},
        }));
        assert_eq!(receipt.classify(), EnvelopeKind::Receipt);

        let typing = envelope(json!({
            "typingMessage": {"action": "STARTED", "timestamp": 1_000},
        }));
        assert_eq!(typing.classify(), EnvelopeKind::Typing);

        let story = envelope(json!({"storyMessage": {"allowsReplies": true}}));
        assert_eq!(story.classify(), EnvelopeKind::Story);

        let call = envelope(json!({"callMessage": {"offerMessage": {}}}));
        assert_eq!(call.classify(), EnvelopeKind::Call);

        let empty = envelope(json!({}));
        assert_eq!(empty.classify(), EnvelopeKind::Unrecognized);
    }

    #[test]
    fn parse_frame_distinguishes_notifications_and_responses() {
        let receive = r#"{"jsonrpc":"2.0","method":"receive","params":{"envelope":{"sourceNumber":"+15551230001","timestamp":1000,"receiptMessage":{"when":1000,"isRead":true,"timestamps":[500]}},"account":"+15550000001"}}"#;
        assert!(matches!(
            parse_frame(receive).unwrap(),
            InboundFrame::Receive(_)
        ));

        let response = r#"{"jsonrpc":"2.0","id":1,"result":0}"#;
        assert!(matches!(
            parse_frame(response).unwrap(),
            InboundFrame::Response(_)
        ));

        assert!(parse_frame("{not json").is_err());
    }

    #[test]
    fn sender_parts_fall_back_to_source() {
        let envelope: Envelope = serde_json::from_value(json!({
            "source": "+15551230001",
            "timestamp": 1_000,
        }))
        .unwrap();
        let (number, uuid, name) = envelope.sender_parts();
        assert_eq!(number, Some("+15551230001"));
        assert_eq!(uuid, None);
        assert_eq!(name, None);
    }
}
