//! Commands into the dispatcher and events out of it
//!
//! The dispatcher task owns all mutable account state. Foreground callers
//! reach it only through [`Command`] messages carrying a oneshot reply
//! channel, and observe inbound activity through the [`AccountEvent`]
//! stream. This serializes every command against every inbound envelope.

use tokio::sync::oneshot;

use wireline_core::errors::Result;
use wireline_core::message::{
    Message, QuoteRef, ReactionRecord, ReceiptKind, ReceiptRecord, Recipient,
};
use wireline_core::registry::{Contact, Group};
use wireline_core::store::StoreStats;
use wireline_core::types::{Identity, Timestamp};

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// A foreground request into the dispatcher.
#[derive(Debug)]
pub enum Command {
    /// Send a message, replying with the daemon-assigned timestamp.
    SendMessage {
        target: Recipient,
        body: Option<String>,
        attachments: Vec<String>,
        quote: Option<QuoteRef>,
        reply: oneshot::Sender<Result<Timestamp>>,
    },
    /// Send or remove a reaction to a previously observed message.
    SendReaction {
        conversation: Recipient,
        emoji: String,
        target_author: Identity,
        target_timestamp: Timestamp,
        remove: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Send a read or viewed receipt for received messages.
    SendReceipt {
        recipient: Identity,
        kind: ReceiptKind,
        timestamps: Vec<Timestamp>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Add (or update) a contact through the daemon. Replies with whether a
    /// new entry was created; a daemon failure degrades to a local-only
    /// entry and `false`.
    AddContact {
        name: String,
        id: Identity,
        expiration: Option<u64>,
        reply: oneshot::Sender<Result<bool>>,
    },
    /// Update this account's published profile.
    UpdateProfile {
        name: Option<String>,
        about: Option<String>,
        emoji: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Pull the daemon's contact list, replying with how many were new.
    SyncContacts { reply: oneshot::Sender<Result<usize>> },
    /// Pull the daemon's group list, replying with how many were new.
    SyncGroups { reply: oneshot::Sender<Result<usize>> },
    /// Pull this account's linked devices, replying with how many were new.
    SyncDevices { reply: oneshot::Sender<Result<usize>> },
    /// Snapshot of all known contacts.
    GetContacts { reply: oneshot::Sender<Vec<Contact>> },
    /// Snapshot of all known groups.
    GetGroups { reply: oneshot::Sender<Vec<Group>> },
    /// Snapshot of one conversation, in insertion order.
    GetConversation {
        target: Recipient,
        reply: oneshot::Sender<Vec<Message>>,
    },
    /// Message store counters.
    GetStats { reply: oneshot::Sender<StoreStats> },
    /// Flush state and stop the dispatcher.
    Shutdown { reply: oneshot::Sender<()> },
}

// ----------------------------------------------------------------------------
// Account Events
// ----------------------------------------------------------------------------

/// Inbound activity surfaced to the foreground, after the dispatcher has
/// already folded it into account state.
#[derive(Debug, Clone)]
pub enum AccountEvent {
    /// A data message was appended to the store.
    Message { message: Message },
    /// A reaction arrived. `applied` is false when its target message is
    /// unknown.
    Reaction {
        reaction: ReactionRecord,
        applied: bool,
    },
    /// A receipt arrived and was reconciled against `matched` sent messages.
    Receipt {
        receipt: ReceiptRecord,
        matched: usize,
    },
    /// A sync event or group update was appended to the store.
    Sync { message: Message },
    /// A contact started or stopped typing.
    Typing { sender: Identity, started: bool },
    /// A story was appended to the store.
    Story { message: Message },
    /// A call event. Surfaced only, never persisted.
    Call { payload: serde_json::Value },
}
