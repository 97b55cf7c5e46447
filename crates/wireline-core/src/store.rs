//! Categorized message store
//!
//! Messages are routed into four append-only logs: conversation messages
//! (sent and received), sync events (including group updates), typing
//! events, and story events. The conversation log carries a timestamp index
//! so receipts and reactions can find their targets without a full scan.
//!
//! The store is pure state. Identity equality is delegated to the contact
//! registry passed into each lookup, and persistence is the caller's job.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::errors::Result;
use crate::message::{Message, ReactionRecord, ReadMark, ReceiptRecord, Recipient};
use crate::registry::ContactRegistry;
use crate::types::{Identity, Timestamp};

// ----------------------------------------------------------------------------
// Store Statistics
// ----------------------------------------------------------------------------

/// Counts of stored messages by log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub messages: usize,
    pub sync: usize,
    pub typing: usize,
    pub story: usize,
}

// ----------------------------------------------------------------------------
// ConversationStore
// ----------------------------------------------------------------------------

/// All messages observed for one account.
#[derive(Debug, Default)]
pub struct ConversationStore {
    messages: Vec<Message>,
    sync: Vec<Message>,
    typing: Vec<Message>,
    story: Vec<Message>,
    /// Timestamp index into `messages`. Several messages may share a
    /// timestamp, so lookups filter by sender afterwards.
    by_timestamp: HashMap<u64, Vec<usize>>,
    dirty: bool,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from persisted logs, restoring the timestamp index.
    pub fn from_logs(
        messages: Vec<Message>,
        sync: Vec<Message>,
        typing: Vec<Message>,
        story: Vec<Message>,
    ) -> Self {
        let mut store = Self {
            messages: Vec::new(),
            sync,
            typing,
            story,
            by_timestamp: HashMap::new(),
            dirty: false,
        };
        for message in messages {
            store.push_message(message);
        }
        store.dirty = false;
        store
    }

    fn push_message(&mut self, message: Message) {
        let key = message.timestamp().as_millis();
        self.messages.push(message);
        self.by_timestamp
            .entry(key)
            .or_default()
            .push(self.messages.len() - 1);
        self.dirty = true;
    }

    /// Append a message, routing it by variant into the matching log.
    pub fn append(&mut self, message: Message) {
        match &message {
            Message::Sent(_) | Message::Received(_) => self.push_message(message),
            Message::Sync(_) | Message::GroupUpdate(_) => {
                self.sync.push(message);
                self.dirty = true;
            }
            Message::Typing(_) => {
                self.typing.push(message);
                self.dirty = true;
            }
            Message::Story(_) => {
                self.story.push(message);
                self.dirty = true;
            }
        }
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// True when `message` belongs to the conversation with `target`.
    ///
    /// For a group target the recipient must be that group. For a contact
    /// target, (sender, recipient) must be exactly (self, target) or
    /// (target, self); anything looser would fold every 1:1 exchange into
    /// the Note-to-Self conversation.
    fn in_conversation(
        &self,
        message: &Message,
        target: &Recipient,
        contacts: &ContactRegistry,
    ) -> bool {
        match target {
            Recipient::Group(group) => {
                matches!(message.recipient(), Recipient::Group(g) if g == group)
            }
            Recipient::Contact(contact) => {
                let self_id = contacts.self_identity();
                let from_us = contacts.same_contact(message.sender(), &self_id)
                    && matches!(
                        message.recipient(),
                        Recipient::Contact(r) if contacts.same_contact(r, contact)
                    );
                let from_them = contacts.same_contact(message.sender(), contact)
                    && matches!(
                        message.recipient(),
                        Recipient::Contact(r) if contacts.same_contact(r, &self_id)
                    );
                from_us || from_them
            }
        }
    }

    /// All conversation messages with `target`, in insertion order.
    pub fn conversation(
        &self,
        target: &Recipient,
        contacts: &ContactRegistry,
    ) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|m| self.in_conversation(m, target, contacts))
            .collect()
    }

    /// First message matching (author, timestamp) within a conversation.
    pub fn find(
        &self,
        author: &Identity,
        timestamp: Timestamp,
        conversation: &Recipient,
        contacts: &ContactRegistry,
    ) -> Option<&Message> {
        let indices = self.by_timestamp.get(&timestamp.as_millis())?;
        indices
            .iter()
            .map(|&idx| &self.messages[idx])
            .find(|m| {
                contacts.same_contact(m.sender(), author)
                    && self.in_conversation(m, conversation, contacts)
            })
    }

    /// All conversation messages from one sender.
    pub fn get_by_sender(
        &self,
        sender: &Identity,
        contacts: &ContactRegistry,
    ) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|m| contacts.same_contact(m.sender(), sender))
            .collect()
    }

    /// All conversation messages stamped with `timestamp`.
    pub fn get_by_timestamp(&self, timestamp: Timestamp) -> Vec<&Message> {
        match self.by_timestamp.get(&timestamp.as_millis()) {
            Some(indices) => indices.iter().map(|&idx| &self.messages[idx]).collect(),
            None => Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn sync_events(&self) -> &[Message] {
        &self.sync
    }

    pub fn typing_events(&self) -> &[Message] {
        &self.typing
    }

    pub fn story_events(&self) -> &[Message] {
        &self.story
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            messages: self.messages.len(),
            sync: self.sync.len(),
            typing: self.typing.len(),
            story: self.story.len(),
        }
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Apply a receipt to every sent message it targets. Returns how many
    /// messages matched.
    pub fn reconcile_receipt(&mut self, receipt: &ReceiptRecord) -> usize {
        let mut matched = 0;
        for target in &receipt.timestamps {
            let indices: Vec<usize> = match self.by_timestamp.get(&target.as_millis()) {
                Some(indices) => indices.clone(),
                None => {
                    debug!(timestamp = %target, "receipt targets unknown timestamp");
                    continue;
                }
            };
            for idx in indices {
                if let Message::Sent(message) = &mut self.messages[idx] {
                    message.apply_receipt(receipt);
                    matched += 1;
                    self.dirty = true;
                }
            }
        }
        matched
    }

    /// Resolve a reaction's target by (target author, target timestamp)
    /// within its conversation and apply it to that message's reaction set.
    ///
    /// Returns false when no target message exists; a remove with no prior
    /// reaction from the sender is an error.
    pub fn reconcile_reaction(
        &mut self,
        reaction: &ReactionRecord,
        contacts: &ContactRegistry,
    ) -> Result<bool> {
        let target_idx = self
            .by_timestamp
            .get(&reaction.target_timestamp.as_millis())
            .and_then(|indices| {
                indices.iter().copied().find(|&idx| {
                    let message = &self.messages[idx];
                    contacts.same_contact(message.sender(), &reaction.target_author)
                        && self.in_conversation(message, &reaction.conversation, contacts)
                })
            });
        let Some(idx) = target_idx else {
            warn!(
                author = %reaction.target_author,
                timestamp = %reaction.target_timestamp,
                "reaction targets unknown message"
            );
            return Ok(false);
        };
        if let Some(reactions) = self.messages[idx].reactions_mut() {
            reactions.apply(reaction.clone(), contacts)?;
            self.dirty = true;
        }
        Ok(true)
    }

    /// Apply read marks from a read-messages sync. Returns how many
    /// messages were newly marked read.
    pub fn apply_read_marks(
        &mut self,
        reads: &[ReadMark],
        when: Timestamp,
        contacts: &ContactRegistry,
    ) -> usize {
        let mut marked = 0;
        for read in reads {
            let indices: Vec<usize> = match self.by_timestamp.get(&read.timestamp.as_millis()) {
                Some(indices) => indices.clone(),
                None => continue,
            };
            for idx in indices {
                let message = &mut self.messages[idx];
                if contacts.same_contact(&message.meta().sender, &read.sender)
                    && message.meta_mut().mark_read(when)
                {
                    marked += 1;
                    self.dirty = true;
                }
            }
        }
        marked
    }

    /// Mark messages from `sender` at the given timestamps with a local
    /// receipt state, after this side sent the corresponding receipt.
    /// Returns how many messages were newly marked.
    pub fn mark_local(
        &mut self,
        kind: crate::message::ReceiptKind,
        sender: &Identity,
        timestamps: &[Timestamp],
        when: Timestamp,
        contacts: &ContactRegistry,
    ) -> usize {
        let mut marked = 0;
        for target in timestamps {
            let indices: Vec<usize> = match self.by_timestamp.get(&target.as_millis()) {
                Some(indices) => indices.clone(),
                None => continue,
            };
            for idx in indices {
                let message = &mut self.messages[idx];
                if !contacts.same_contact(&message.meta().sender, sender) {
                    continue;
                }
                let meta = message.meta_mut();
                let changed = match kind {
                    crate::message::ReceiptKind::Delivery => meta.mark_delivered(when),
                    crate::message::ReceiptKind::Read => meta.mark_read(when),
                    crate::message::ReceiptKind::Viewed => meta.mark_viewed(when),
                };
                if changed {
                    marked += 1;
                    self.dirty = true;
                }
            }
        }
        marked
    }

    /// True when the store changed since the last snapshot, clearing the
    /// flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
