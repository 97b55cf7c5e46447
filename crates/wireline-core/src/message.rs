//! Message model
//!
//! Every observed conversation event is one variant of [`Message`], tagged on
//! the wire and on disk by `messageType`. The variants share a common
//! [`MessageMeta`] header carrying sender, recipient, device, timestamp, and
//! the delivery flags. A message's conversational identity is the pair
//! (sender identity, timestamp); receipts and reactions target messages by
//! that pair.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StoreError, ValidationError, WirelineError};
use crate::registry::ContactRegistry;
use crate::types::{DeviceId, GroupId, Identity, Timestamp};

// ----------------------------------------------------------------------------
// Recipient
// ----------------------------------------------------------------------------

/// Where a message was addressed: a 1:1 conversation or a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum Recipient {
    Contact(Identity),
    Group(GroupId),
}

impl Recipient {
    pub fn is_group(&self) -> bool {
        matches!(self, Recipient::Group(_))
    }
}

// ----------------------------------------------------------------------------
// Delivery State
// ----------------------------------------------------------------------------

/// Delivery progress of a message. Transitions are monotonic: a receipt for
/// an earlier state after a later one has been recorded is a no-op.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    NotSent,
    Sent,
    Delivered,
    Read,
    Viewed,
}

// ----------------------------------------------------------------------------
// Message Meta
// ----------------------------------------------------------------------------

/// Fields common to every message variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    pub sender: Identity,
    pub recipient: Recipient,
    pub device: DeviceId,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub is_delivered: bool,
    pub time_delivered: Option<Timestamp>,
    #[serde(default)]
    pub is_read: bool,
    pub time_read: Option<Timestamp>,
    #[serde(default)]
    pub is_viewed: bool,
    pub time_viewed: Option<Timestamp>,
}

impl MessageMeta {
    pub fn new(
        sender: Identity,
        recipient: Recipient,
        device: DeviceId,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            sender,
            recipient,
            device,
            timestamp,
            is_delivered: false,
            time_delivered: None,
            is_read: false,
            time_read: None,
            is_viewed: false,
            time_viewed: None,
        }
    }

    /// The highest delivery state reached. `is_sent` comes from the variant,
    /// since only sent messages distinguish NOT_SENT from SENT.
    pub fn delivery_state(&self, is_sent: bool) -> DeliveryState {
        if self.is_viewed {
            DeliveryState::Viewed
        } else if self.is_read {
            DeliveryState::Read
        } else if self.is_delivered {
            DeliveryState::Delivered
        } else if is_sent {
            DeliveryState::Sent
        } else {
            DeliveryState::NotSent
        }
    }

    /// Mark delivered. Returns false when a later or equal state already
    /// holds.
    pub fn mark_delivered(&mut self, when: Timestamp) -> bool {
        if self.is_delivered || self.is_read || self.is_viewed {
            return false;
        }
        self.is_delivered = true;
        self.time_delivered = Some(when);
        true
    }

    /// Mark read. Returns false when a later or equal state already holds.
    pub fn mark_read(&mut self, when: Timestamp) -> bool {
        if self.is_read || self.is_viewed {
            return false;
        }
        self.is_read = true;
        self.time_read = Some(when);
        true
    }

    /// Mark viewed. Returns false when already viewed.
    pub fn mark_viewed(&mut self, when: Timestamp) -> bool {
        if self.is_viewed {
            return false;
        }
        self.is_viewed = true;
        self.time_viewed = Some(when);
        true
    }
}

// ----------------------------------------------------------------------------
// Payload Pieces
// ----------------------------------------------------------------------------

/// Reference to an attachment held by the daemon. No file content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub content_type: Option<String>,
    pub filename: Option<String>,
    pub id: Option<String>,
    pub size: Option<u64>,
}

/// A mention of a contact inside a message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mention {
    pub start: u64,
    pub length: u64,
    pub contact: Identity,
}

/// Reference to a quoted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRef {
    pub timestamp: Timestamp,
    pub author: Identity,
    pub text: Option<String>,
}

/// A link preview the sender attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkPreview {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Reference to a sticker in a pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickerRef {
    pub pack_id: String,
    pub sticker_id: u64,
}

/// Message body plus its rich payload, shared by sent and received messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    pub body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default)]
    pub mentions: Vec<Mention>,
    pub quote: Option<QuoteRef>,
    #[serde(default)]
    pub previews: Vec<LinkPreview>,
    pub sticker: Option<StickerRef>,
    /// Disappearing-message window in seconds. None means no expiration.
    pub expires_in: Option<u64>,
}

// ----------------------------------------------------------------------------
// Reactions
// ----------------------------------------------------------------------------

/// One emoji reaction as observed on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRecord {
    pub sender: Identity,
    pub device: DeviceId,
    /// The conversation the reaction applies to.
    pub conversation: Recipient,
    pub timestamp: Timestamp,
    pub emoji: String,
    pub target_author: Identity,
    pub target_timestamp: Timestamp,
    #[serde(default)]
    pub is_remove: bool,
    /// True when this reaction replaced an earlier one from the same sender.
    #[serde(default)]
    pub is_change: bool,
    pub previous_emoji: Option<String>,
}

/// The reactions on a single message, at most one per sender.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReactionSet {
    reactions: Vec<ReactionRecord>,
}

impl ReactionSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn position_of(&self, sender: &Identity, contacts: &ContactRegistry) -> Option<usize> {
        self.reactions
            .iter()
            .position(|r| contacts.same_contact(&r.sender, sender))
    }

    /// Apply an inbound reaction. Adds are appended, a repeat from the same
    /// sender replaces the earlier one with the changed flag set, and a
    /// remove with no prior reaction from that sender is an error.
    ///
    /// Returns the record as stored (or, for removes, the removed record).
    pub fn apply(
        &mut self,
        mut incoming: ReactionRecord,
        contacts: &ContactRegistry,
    ) -> Result<ReactionRecord> {
        let existing = self.position_of(&incoming.sender, contacts);
        if incoming.is_remove {
            match existing {
                Some(pos) => {
                    let removed = self.reactions.remove(pos);
                    Ok(removed)
                }
                None => Err(StoreError::ReactionNotFound {
                    sender: incoming.sender.to_string(),
                }
                .into()),
            }
        } else {
            if let Some(pos) = existing {
                let previous = self.reactions.remove(pos);
                incoming.is_change = true;
                incoming.previous_emoji = Some(previous.emoji);
            }
            self.reactions.push(incoming.clone());
            Ok(incoming)
        }
    }

    pub fn get_by_sender(
        &self,
        sender: &Identity,
        contacts: &ContactRegistry,
    ) -> Option<&ReactionRecord> {
        self.position_of(sender, contacts).map(|pos| &self.reactions[pos])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReactionRecord> {
        self.reactions.iter()
    }

    pub fn len(&self) -> usize {
        self.reactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactions.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Receipts
// ----------------------------------------------------------------------------

/// What a receipt message asserts about its target timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptKind {
    Delivery,
    Read,
    Viewed,
}

/// One receipt as observed on the wire. A single receipt may cover several
/// sent-message timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRecord {
    pub sender: Identity,
    pub device: DeviceId,
    pub kind: ReceiptKind,
    pub when: Timestamp,
    pub timestamps: Vec<Timestamp>,
}

// ----------------------------------------------------------------------------
// Typing
// ----------------------------------------------------------------------------

/// Typing indicator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TypingAction {
    Started,
    Stopped,
}

impl TypingAction {
    /// Parse the daemon's action string. Anything other than STARTED or
    /// STOPPED is a validation error.
    pub fn parse(action: &str) -> Result<Self> {
        match action.to_ascii_uppercase().as_str() {
            "STARTED" => Ok(TypingAction::Started),
            "STOPPED" => Ok(TypingAction::Stopped),
            _ => Err(WirelineError::Validation(
                ValidationError::InvalidTypingAction {
                    action: action.to_string(),
                },
            )),
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, TypingAction::Started)
    }
}

// ----------------------------------------------------------------------------
// Message Variants
// ----------------------------------------------------------------------------

/// A message this account sent, from the send result or a sent-message sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    #[serde(flatten)]
    pub meta: MessageMeta,
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(default)]
    pub is_sent: bool,
    /// Recipients the daemon reported successful delivery handoff for.
    #[serde(default)]
    pub sent_to: Vec<Identity>,
    #[serde(default)]
    pub reactions: ReactionSet,
    #[serde(default)]
    pub delivery_receipts: Vec<ReceiptRecord>,
    #[serde(default)]
    pub read_receipts: Vec<ReceiptRecord>,
    #[serde(default)]
    pub viewed_receipts: Vec<ReceiptRecord>,
}

impl SentMessage {
    pub fn delivery_state(&self) -> DeliveryState {
        self.meta.delivery_state(self.is_sent)
    }

    /// Record a receipt against this message: transition the delivery state
    /// monotonically and append the record to the type-specific list.
    /// Returns true when the state actually moved.
    pub fn apply_receipt(&mut self, receipt: &ReceiptRecord) -> bool {
        let changed = match receipt.kind {
            ReceiptKind::Delivery => self.meta.mark_delivered(receipt.when),
            ReceiptKind::Read => self.meta.mark_read(receipt.when),
            ReceiptKind::Viewed => self.meta.mark_viewed(receipt.when),
        };
        match receipt.kind {
            ReceiptKind::Delivery => self.delivery_receipts.push(receipt.clone()),
            ReceiptKind::Read => self.read_receipts.push(receipt.clone()),
            ReceiptKind::Viewed => self.viewed_receipts.push(receipt.clone()),
        }
        changed
    }
}

/// A message another account sent us.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    #[serde(flatten)]
    pub meta: MessageMeta,
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(default)]
    pub reactions: ReactionSet,
}

/// A group metadata change observed in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupUpdateEvent {
    #[serde(flatten)]
    pub meta: MessageMeta,
    pub group: GroupId,
}

/// A read mark inside a read-messages sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadMark {
    pub sender: Identity,
    pub timestamp: Timestamp,
}

/// What a sync message from another of our devices carried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "syncType", rename_all = "camelCase")]
pub enum SyncKind {
    ReadMessages {
        reads: Vec<ReadMark>,
    },
    /// A message sent from another device, echoed to us. The raw envelope is
    /// preserved so the sent message can be reconstructed.
    SentMessage {
        raw: serde_json::Value,
    },
    Blocked {
        contacts: Vec<Identity>,
        groups: Vec<GroupId>,
    },
    Contacts,
    Groups,
}

/// A sync event from another of this account's devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    #[serde(flatten)]
    pub meta: MessageMeta,
    #[serde(flatten)]
    pub kind: SyncKind,
}

/// A typing indicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    #[serde(flatten)]
    pub meta: MessageMeta,
    pub action: TypingAction,
    pub time_changed: Timestamp,
}

/// A story post from a contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryEvent {
    #[serde(flatten)]
    pub meta: MessageMeta,
    #[serde(default)]
    pub allows_replies: bool,
    pub text: Option<String>,
}

/// Every conversation event the engine stores, tagged by variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "camelCase")]
pub enum Message {
    Sent(SentMessage),
    Received(ReceivedMessage),
    GroupUpdate(GroupUpdateEvent),
    Sync(SyncEvent),
    Typing(TypingEvent),
    Story(StoryEvent),
}

impl Message {
    pub fn meta(&self) -> &MessageMeta {
        match self {
            Message::Sent(m) => &m.meta,
            Message::Received(m) => &m.meta,
            Message::GroupUpdate(m) => &m.meta,
            Message::Sync(m) => &m.meta,
            Message::Typing(m) => &m.meta,
            Message::Story(m) => &m.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut MessageMeta {
        match self {
            Message::Sent(m) => &mut m.meta,
            Message::Received(m) => &mut m.meta,
            Message::GroupUpdate(m) => &mut m.meta,
            Message::Sync(m) => &mut m.meta,
            Message::Typing(m) => &mut m.meta,
            Message::Story(m) => &mut m.meta,
        }
    }

    pub fn sender(&self) -> &Identity {
        &self.meta().sender
    }

    pub fn recipient(&self) -> &Recipient {
        &self.meta().recipient
    }

    pub fn timestamp(&self) -> Timestamp {
        self.meta().timestamp
    }

    /// The reaction set, for the variants that carry one.
    pub fn reactions_mut(&mut self) -> Option<&mut ReactionSet> {
        match self {
            Message::Sent(m) => Some(&mut m.reactions),
            Message::Received(m) => Some(&mut m.reactions),
            _ => None,
        }
    }

    pub fn reactions(&self) -> Option<&ReactionSet> {
        match self {
            Message::Sent(m) => Some(&m.reactions),
            Message::Received(m) => Some(&m.reactions),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNT: &str = "+15550000001";

    fn meta(sender: &str, timestamp: u64) -> MessageMeta {
        MessageMeta::new(
            Identity::parse(sender).unwrap(),
            Recipient::Contact(Identity::parse(ACCOUNT).unwrap()),
            DeviceId::PRIMARY,
            Timestamp::new(timestamp),
        )
    }

    fn reaction(sender: &str, emoji: &str, remove: bool) -> ReactionRecord {
        ReactionRecord {
            sender: Identity::parse(sender).unwrap(),
            device: DeviceId::PRIMARY,
            conversation: Recipient::Contact(Identity::parse(sender).unwrap()),
            timestamp: Timestamp::now(),
            emoji: emoji.to_string(),
            target_author: Identity::parse(ACCOUNT).unwrap(),
            target_timestamp: Timestamp::new(1_000),
            is_remove: remove,
            is_change: false,
            previous_emoji: None,
        }
    }

    fn sent_message(timestamp: u64) -> SentMessage {
        SentMessage {
            meta: meta(ACCOUNT, timestamp),
            body: MessageBody {
                body: Some("hello".to_string()),
                ..MessageBody::default()
            },
            is_sent: true,
            sent_to: Vec::new(),
            reactions: ReactionSet::new(),
            delivery_receipts: Vec::new(),
            read_receipts: Vec::new(),
            viewed_receipts: Vec::new(),
        }
    }

    fn receipt(kind: ReceiptKind, when: u64, timestamps: &[u64]) -> ReceiptRecord {
        ReceiptRecord {
            sender: Identity::parse("+15551230001").unwrap(),
            device: DeviceId::PRIMARY,
            kind,
            when: Timestamp::new(when),
            timestamps: timestamps.iter().map(|t| Timestamp::new(*t)).collect(),
        }
    }

    #[test]
    fn delivery_state_is_monotonic() {
        let mut message = sent_message(1_000);
        assert_eq!(message.delivery_state(), DeliveryState::Sent);

        assert!(message.apply_receipt(&receipt(ReceiptKind::Read, 2_000, &[1_000])));
        assert_eq!(message.delivery_state(), DeliveryState::Read);

        // A late delivery receipt cannot regress the state, but the record
        // is still kept.
        assert!(!message.apply_receipt(&receipt(ReceiptKind::Delivery, 3_000, &[1_000])));
        assert_eq!(message.delivery_state(), DeliveryState::Read);
        assert_eq!(message.delivery_receipts.len(), 1);
        assert_eq!(message.read_receipts.len(), 1);
    }

    #[test]
    fn duplicate_receipt_transitions_once() {
        let mut message = sent_message(1_000);
        assert!(message.apply_receipt(&receipt(ReceiptKind::Delivery, 2_000, &[1_000])));
        assert!(!message.apply_receipt(&receipt(ReceiptKind::Delivery, 3_000, &[1_000])));
        assert_eq!(message.meta.time_delivered, Some(Timestamp::new(2_000)));
    }

    #[test]
    fn reaction_replace_sets_changed_flag() {
        let contacts = ContactRegistry::new(ACCOUNT);
        let mut set = ReactionSet::new();

        set.apply(reaction("+15551230001", "\u{1F44D}", false), &contacts)
            .unwrap();
        let stored = set
            .apply(reaction("+15551230001", "\u{1F44E}", false), &contacts)
            .unwrap();

        assert_eq!(set.len(), 1);
        assert!(stored.is_change);
        assert_eq!(stored.previous_emoji.as_deref(), Some("\u{1F44D}"));
        assert_eq!(set.iter().next().unwrap().emoji, "\u{1F44E}");
    }

    #[test]
    fn reaction_remove_without_prior_is_error() {
        let contacts = ContactRegistry::new(ACCOUNT);
        let mut set = ReactionSet::new();
        let err = set
            .apply(reaction("+15551230001", "\u{1F44D}", true), &contacts)
            .unwrap_err();
        assert!(matches!(
            err,
            WirelineError::Store(StoreError::ReactionNotFound { .. })
        ));
    }

    #[test]
    fn reaction_remove_clears_entry() {
        let contacts = ContactRegistry::new(ACCOUNT);
        let mut set = ReactionSet::new();
        set.apply(reaction("+15551230001", "\u{1F44D}", false), &contacts)
            .unwrap();
        set.apply(reaction("+15551230001", "\u{1F44D}", true), &contacts)
            .unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn reactions_from_different_senders_coexist() {
        let contacts = ContactRegistry::new(ACCOUNT);
        let mut set = ReactionSet::new();
        set.apply(reaction("+15551230001", "\u{1F44D}", false), &contacts)
            .unwrap();
        set.apply(reaction("+15551230002", "\u{2764}", false), &contacts)
            .unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn typing_action_validation() {
        assert_eq!(TypingAction::parse("started").unwrap(), TypingAction::Started);
        assert_eq!(TypingAction::parse("STOPPED").unwrap(), TypingAction::Stopped);
        assert!(TypingAction::parse("PAUSED").is_err());
    }

    #[test]
    fn message_round_trips_through_json() {
        let mut message = sent_message(1_000);
        message.sent_to = vec![Identity::parse("+15551230001").unwrap()];
        message.body.attachments.push(AttachmentRef {
            content_type: Some("image/png".to_string()),
            filename: Some("cat.png".to_string()),
            id: Some("att-1".to_string()),
            size: Some(2_048),
        });
        message.apply_receipt(&receipt(ReceiptKind::Delivery, 2_000, &[1_000]));

        let json = serde_json::to_string(&Message::Sent(message.clone())).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        let Message::Sent(back) = back else {
            panic!("expected a sent message back, got {back:?}");
        };

        assert_eq!(back.meta.sender, message.meta.sender);
        assert_eq!(back.meta.recipient, message.meta.recipient);
        assert_eq!(back.meta.device, message.meta.device);
        assert_eq!(back.meta.timestamp, Timestamp::new(1_000));
        assert!(back.is_sent);
        assert_eq!(back.sent_to, message.sent_to);
        assert_eq!(back.body.body.as_deref(), Some("hello"));
        assert_eq!(back.body.attachments.len(), 1);
        assert_eq!(back.body.attachments[0].filename.as_deref(), Some("cat.png"));
        assert_eq!(back.body.attachments[0].size, Some(2_048));
        assert_eq!(back.delivery_receipts.len(), 1);
        assert_eq!(back.delivery_receipts[0].kind, ReceiptKind::Delivery);
        assert_eq!(back.delivery_receipts[0].when, Timestamp::new(2_000));
        assert!(back.read_receipts.is_empty());
        assert!(back.viewed_receipts.is_empty());
        assert!(back.meta.is_delivered);
        assert_eq!(back.meta.time_delivered, Some(Timestamp::new(2_000)));
        assert_eq!(back.delivery_state(), DeliveryState::Delivered);
    }
}
