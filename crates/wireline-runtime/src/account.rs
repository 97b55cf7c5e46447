//! Foreground handle to a running account
//!
//! Cheap to clone; every method is one command round trip through the
//! dispatcher's channel.

use tokio::sync::{mpsc, oneshot};

use wireline_core::errors::{Result, WirelineError};
use wireline_core::message::{Message, QuoteRef, ReceiptKind, Recipient};
use wireline_core::registry::{Contact, Group};
use wireline_core::store::StoreStats;
use wireline_core::types::{Identity, Timestamp};

use crate::commands::Command;

/// Handle for issuing commands against one account's dispatcher.
#[derive(Clone)]
pub struct AccountHandle {
    tx: mpsc::Sender<Command>,
}

impl AccountHandle {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        command: Command,
        reply: oneshot::Receiver<T>,
    ) -> Result<T> {
        self.tx
            .send(command)
            .await
            .map_err(|_| WirelineError::channel_error("dispatcher is not running"))?;
        reply
            .await
            .map_err(|_| WirelineError::channel_error("dispatcher dropped the reply"))
    }

    /// Send a text message, returning the daemon-assigned timestamp.
    pub async fn send_message(
        &self,
        target: Recipient,
        body: impl Into<String>,
    ) -> Result<Timestamp> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::SendMessage {
            target,
            body: Some(body.into()),
            attachments: Vec::new(),
            quote: None,
            reply: reply_tx,
        };
        self.request(command, reply_rx).await?
    }

    /// Send a message with attachments and an optional quote.
    pub async fn send_message_with(
        &self,
        target: Recipient,
        body: Option<String>,
        attachments: Vec<String>,
        quote: Option<QuoteRef>,
    ) -> Result<Timestamp> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::SendMessage {
            target,
            body,
            attachments,
            quote,
            reply: reply_tx,
        };
        self.request(command, reply_rx).await?
    }

    /// React to a message, or remove an earlier reaction.
    pub async fn send_reaction(
        &self,
        conversation: Recipient,
        emoji: impl Into<String>,
        target_author: Identity,
        target_timestamp: Timestamp,
        remove: bool,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::SendReaction {
            conversation,
            emoji: emoji.into(),
            target_author,
            target_timestamp,
            remove,
            reply: reply_tx,
        };
        self.request(command, reply_rx).await?
    }

    /// Send a read or viewed receipt for messages from `recipient`.
    pub async fn send_receipt(
        &self,
        recipient: Identity,
        kind: ReceiptKind,
        timestamps: Vec<Timestamp>,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::SendReceipt {
            recipient,
            kind,
            timestamps,
            reply: reply_tx,
        };
        self.request(command, reply_rx).await?
    }

    /// Add or rename a contact. Returns true when a new entry was created.
    pub async fn add_contact(
        &self,
        name: impl Into<String>,
        id: Identity,
        expiration: Option<u64>,
    ) -> Result<bool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::AddContact {
            name: name.into(),
            id,
            expiration,
            reply: reply_tx,
        };
        self.request(command, reply_rx).await?
    }

    /// Update this account's published profile.
    pub async fn update_profile(
        &self,
        name: Option<String>,
        about: Option<String>,
        emoji: Option<String>,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::UpdateProfile {
            name,
            about,
            emoji,
            reply: reply_tx,
        };
        self.request(command, reply_rx).await?
    }

    /// Re-pull the daemon's contact list. Returns how many entries were new.
    pub async fn sync_contacts(&self) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(Command::SyncContacts { reply: reply_tx }, reply_rx)
            .await?
    }

    /// Re-pull the daemon's group list. Returns how many entries were new.
    pub async fn sync_groups(&self) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(Command::SyncGroups { reply: reply_tx }, reply_rx)
            .await?
    }

    /// Re-pull this account's linked devices.
    pub async fn sync_devices(&self) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(Command::SyncDevices { reply: reply_tx }, reply_rx)
            .await?
    }

    /// Snapshot of all known contacts.
    pub async fn contacts(&self) -> Result<Vec<Contact>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(Command::GetContacts { reply: reply_tx }, reply_rx)
            .await
    }

    /// Snapshot of all known groups.
    pub async fn groups(&self) -> Result<Vec<Group>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(Command::GetGroups { reply: reply_tx }, reply_rx)
            .await
    }

    /// Snapshot of one conversation, in insertion order.
    pub async fn conversation(&self, target: Recipient) -> Result<Vec<Message>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(
            Command::GetConversation {
                target,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await
    }

    /// Message store counters.
    pub async fn stats(&self) -> Result<StoreStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(Command::GetStats { reply: reply_tx }, reply_rx)
            .await
    }

    /// Flush state and stop the dispatcher.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(Command::Shutdown { reply: reply_tx }, reply_rx)
            .await
    }
}
