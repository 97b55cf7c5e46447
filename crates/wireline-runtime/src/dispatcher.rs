//! Event dispatcher task
//!
//! One task per account owns the contact and group registries, the message
//! store, the snapshot writer, and the command connection. Foreground
//! commands arrive over an mpsc channel; inbound envelopes arrive as frames
//! on the event connection. A single `select!` loop serializes both, so no
//! command can ever interleave with envelope processing.
//!
//! Error triage mirrors the error taxonomy: transport and storage failures
//! shut the task down, daemon errors are recovered per command, and
//! malformed or unrecognized inbound frames are logged and dropped.

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use wireline_core::envelope::{
    parse_frame, Envelope, EnvelopeKind, InboundFrame, RawDataMessage, RawGroupInfo,
    RawReadMark, RawSentEcho,
};
use wireline_core::errors::{Result, WirelineError};
use wireline_core::message::{
    AttachmentRef, GroupUpdateEvent, LinkPreview, Mention, Message, MessageBody, MessageMeta,
    QuoteRef, ReactionRecord, ReactionSet, ReadMark, ReceiptKind, ReceiptRecord,
    ReceivedMessage, Recipient, SentMessage, StickerRef, StoryEvent, SyncEvent, SyncKind,
    TypingAction, TypingEvent,
};
use wireline_core::persist::Persistence;
use wireline_core::registry::{Contact, ContactRegistry, Group, GroupRegistry, Profile};
use wireline_core::store::ConversationStore;
use wireline_core::types::{DeviceId, GroupId, Identity, Timestamp};

use crate::commands::{AccountEvent, Command};
use crate::transport::DaemonConnection;

// ----------------------------------------------------------------------------
// Daemon List Shapes
// ----------------------------------------------------------------------------

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProfile {
    given_name: Option<String>,
    family_name: Option<String>,
    about: Option<String>,
    about_emoji: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawContact {
    number: Option<String>,
    uuid: Option<String>,
    name: Option<String>,
    profile: Option<RawProfile>,
    #[serde(default)]
    is_blocked: bool,
    message_expiration_time: Option<u64>,
}

impl RawContact {
    fn into_contact(self) -> Contact {
        let mut contact = Contact::new(
            self.name.filter(|n| !n.is_empty()),
            self.number,
            self.uuid.map(|u| u.to_ascii_lowercase()),
        );
        contact.is_blocked = self.is_blocked;
        contact.expiration = self.message_expiration_time.filter(|&e| e != 0);
        contact.profile = self.profile.map(|p| {
            let name = match (p.given_name, p.family_name) {
                (Some(given), Some(family)) => Some(format!("{given} {family}")),
                (Some(given), None) => Some(given),
                (None, family) => family,
            };
            Profile {
                name: name.filter(|n| !n.is_empty()),
                about: p.about.filter(|a| !a.is_empty()),
                emoji: p.about_emoji.filter(|e| !e.is_empty()),
            }
        });
        contact
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMember {
    number: Option<String>,
    uuid: Option<String>,
}

impl RawMember {
    fn identity(&self) -> Option<Identity> {
        self.number
            .as_deref()
            .or(self.uuid.as_deref())
            .and_then(|id| Identity::parse(id).ok())
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGroup {
    id: String,
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    is_member: bool,
    #[serde(default)]
    is_blocked: bool,
    message_expiration_time: Option<u64>,
    group_invite_link: Option<String>,
    #[serde(default)]
    members: Vec<RawMember>,
    #[serde(default)]
    pending_members: Vec<RawMember>,
    #[serde(default)]
    requesting_members: Vec<RawMember>,
    #[serde(default)]
    admins: Vec<RawMember>,
    #[serde(default)]
    banned: Vec<RawMember>,
    permission_add_member: Option<String>,
    permission_edit_details: Option<String>,
    permission_send_message: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDevice {
    id: u64,
    name: Option<String>,
    created_timestamp: Option<u64>,
    last_seen_timestamp: Option<u64>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSendResult {
    timestamp: Option<u64>,
    #[serde(default)]
    results: Vec<RawSendEntry>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSendEntry {
    recipient_address: Option<RawMember>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

// ----------------------------------------------------------------------------
// Dispatcher Task
// ----------------------------------------------------------------------------

/// The single state-owning task for one account.
pub struct DispatcherTask {
    contacts: ContactRegistry,
    groups: GroupRegistry,
    store: ConversationStore,
    persistence: Persistence,
    /// Request/response channel to the daemon.
    commands: DaemonConnection,
    /// Subscribed event channel from the daemon.
    events: DaemonConnection,
    command_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<AccountEvent>,
    device_id: DeviceId,
    running: bool,
}

impl DispatcherTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        contacts: ContactRegistry,
        groups: GroupRegistry,
        store: ConversationStore,
        persistence: Persistence,
        commands: DaemonConnection,
        events: DaemonConnection,
        command_rx: mpsc::Receiver<Command>,
        event_tx: mpsc::Sender<AccountEvent>,
        device_id: DeviceId,
    ) -> Self {
        Self {
            contacts,
            groups,
            store,
            persistence,
            commands,
            events,
            command_rx,
            event_tx,
            device_id,
            running: true,
        }
    }

    fn account(&self) -> String {
        self.contacts.account().to_string()
    }

    /// Run the dispatcher loop until shutdown or a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        info!(account = %self.contacts.account(), "dispatcher starting");
        self.startup().await?;

        while self.running {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if let Err(e) = self.process_command(command).await {
                                match e {
                                    WirelineError::Transport(_)
                                    | WirelineError::Storage(_)
                                    | WirelineError::Channel { .. } => {
                                        error!("fatal error processing command, shutting down: {e}");
                                        self.running = false;
                                        return Err(e);
                                    }
                                    _ => warn!("error processing command: {e}"),
                                }
                            }
                        }
                        None => {
                            info!("command channel closed, shutting down");
                            break;
                        }
                    }
                }

                frame = self.events.read_frame() => {
                    match frame {
                        Ok(Some(line)) => {
                            if let Err(e) = self.process_frame(&line).await {
                                match e {
                                    WirelineError::Transport(_) | WirelineError::Storage(_) => {
                                        error!("fatal error processing envelope, shutting down: {e}");
                                        self.running = false;
                                        return Err(e);
                                    }
                                    _ => warn!("dropping envelope: {e}"),
                                }
                            }
                        }
                        Ok(None) => {
                            info!("event channel closed, shutting down");
                            break;
                        }
                        Err(e) => {
                            error!("event channel failed: {e}");
                            return Err(e);
                        }
                    }
                }
            }
        }

        self.persistence.flush(&self.store)?;
        info!("dispatcher stopped");
        Ok(())
    }

    /// Initial sync and subscription. Registry syncs are best effort; the
    /// subscription itself must succeed.
    async fn startup(&mut self) -> Result<()> {
        if let Err(e) = self.sync_contacts().await {
            warn!("initial contact sync failed: {e}");
        }
        if let Err(e) = self.sync_groups(None).await {
            warn!("initial group sync failed: {e}");
        }
        if let Err(e) = self.sync_devices().await {
            warn!("initial device sync failed: {e}");
        }
        self.persist_registries()?;
        self.persistence.save_messages(&self.store)?;
        self.store.take_dirty();

        let account = self.account();
        // Linked devices ask the primary to replay account state before
        // subscribing.
        if !self.device_id.is_primary() {
            if let Err(e) = self
                .events
                .call("sendSyncRequest", json!({ "account": account }))
                .await
            {
                warn!("sync request failed: {e}");
            }
        }
        self.events
            .call("subscribeReceive", json!({ "account": account }))
            .await?;
        info!("subscribed to inbound events");
        Ok(())
    }

    /// Persist whichever registries changed since the last snapshot.
    fn persist_registries(&mut self) -> Result<()> {
        if self.contacts.take_dirty() {
            self.persistence.save_contacts(&self.contacts)?;
        }
        if self.groups.take_dirty() {
            self.persistence.save_groups(&self.groups)?;
        }
        Ok(())
    }

    /// Persist everything that changed, honoring the message flush policy.
    fn persist_changes(&mut self) -> Result<()> {
        self.persist_registries()?;
        if self.store.take_dirty() {
            self.persistence.commit_messages(&self.store)?;
        }
        Ok(())
    }

    async fn emit(&self, event: AccountEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }

    // ------------------------------------------------------------------
    // Inbound envelopes
    // ------------------------------------------------------------------

    async fn process_frame(&mut self, line: &str) -> Result<()> {
        match parse_frame(line)? {
            InboundFrame::Receive(envelope) => self.process_envelope(envelope).await,
            InboundFrame::Response(value) => {
                debug!(?value, "response frame on event channel");
                Ok(())
            }
            InboundFrame::Other(value) => {
                debug!(?value, "ignoring unconsumed notification");
                Ok(())
            }
        }
    }

    async fn process_envelope(&mut self, envelope: Envelope) -> Result<()> {
        let kind = envelope.classify();
        if kind == EnvelopeKind::Unrecognized {
            warn!(timestamp = envelope.timestamp, "unrecognized envelope, dropping");
            return Ok(());
        }

        let (sender, device) = self.observe_sender(&envelope)?;
        let timestamp = Timestamp::new(envelope.timestamp);

        match kind {
            EnvelopeKind::Reaction => {
                self.handle_reaction(&envelope, sender, device, timestamp).await?
            }
            EnvelopeKind::GroupUpdate => {
                self.handle_group_update(&envelope, sender, device, timestamp).await?
            }
            EnvelopeKind::Data => {
                self.handle_data(&envelope, sender, device, timestamp).await?
            }
            EnvelopeKind::Receipt => {
                self.handle_receipt(&envelope, sender, device, timestamp).await?
            }
            EnvelopeKind::SyncReadMessages => {
                self.handle_sync_reads(&envelope, sender, device, timestamp).await?
            }
            EnvelopeKind::SyncSentMessage => {
                self.handle_sync_sent(&envelope, sender, device, timestamp).await?
            }
            EnvelopeKind::SyncBlocked => {
                self.handle_sync_blocked(&envelope, sender, device, timestamp).await?
            }
            EnvelopeKind::SyncContacts | EnvelopeKind::SyncGroups => {
                self.handle_sync_resync(kind, sender, device, timestamp).await?
            }
            EnvelopeKind::Typing => {
                self.handle_typing(&envelope, sender, device, timestamp).await?
            }
            EnvelopeKind::Story => {
                self.handle_story(&envelope, sender, device, timestamp).await?
            }
            EnvelopeKind::Call => {
                let payload = envelope.call_message.clone().unwrap_or(Value::Null);
                self.emit(AccountEvent::Call { payload }).await;
            }
            EnvelopeKind::Unrecognized => unreachable!("filtered above"),
        }
        self.persist_changes()
    }

    /// Resolve the envelope sender into the registry, update last-seen on
    /// the contact and device, and return the sender identity and device.
    fn observe_sender(&mut self, envelope: &Envelope) -> Result<(Identity, DeviceId)> {
        let (number, uuid, name) = envelope.sender_parts();
        let sender = number
            .or(uuid)
            .ok_or_else(|| WirelineError::malformed_envelope("envelope without a sender"))
            .and_then(Identity::parse)?;
        let (_, idx) = self.contacts.get_or_add(name, number, uuid)?;
        let device_id = DeviceId::new(envelope.source_device);
        let when = Timestamp::new(envelope.timestamp);
        let contact = self.contacts.get_at_mut(idx);
        contact.seen(when);
        let (_, device) = contact.devices.get_or_add(device_id);
        device.seen(when);
        Ok((sender, device_id))
    }

    /// The conversation an envelope belongs to: the flagged group, or the
    /// 1:1 conversation with its sender.
    fn resolve_conversation(
        &mut self,
        group_info: Option<&RawGroupInfo>,
        group_id: Option<&str>,
        sender: &Identity,
    ) -> Recipient {
        let group = group_info
            .map(|info| info.group_id.as_str())
            .or(group_id)
            .map(GroupId::new);
        match group {
            Some(id) => {
                let (_, idx) = self.groups.get_or_add(None, &id);
                Recipient::Group(self.groups.get_at(idx).id.clone())
            }
            None => Recipient::Contact(sender.clone()),
        }
    }

    /// Convert a raw data-message payload, resolving mentioned and quoted
    /// contacts into the registry.
    fn convert_body(&mut self, data: &RawDataMessage) -> MessageBody {
        let mut mentions = Vec::new();
        for mention in &data.mentions {
            let resolved = self
                .contacts
                .get_or_add(
                    mention.name.as_deref(),
                    mention.number.as_deref(),
                    mention.uuid.as_deref(),
                )
                .ok()
                .and_then(|(_, idx)| self.contacts.get_at(idx).id());
            if let Some(contact) = resolved {
                mentions.push(Mention {
                    start: mention.start,
                    length: mention.length,
                    contact,
                });
            }
        }
        let quote = data.quote.as_ref().and_then(|quote| {
            let author = quote
                .author_number
                .as_deref()
                .or(quote.author_uuid.as_deref())
                .or(quote.author.as_deref())?;
            let author = Identity::parse(author).ok()?;
            Some(QuoteRef {
                timestamp: Timestamp::new(quote.id),
                author,
                text: quote.text.clone(),
            })
        });
        MessageBody {
            body: data.message.clone().filter(|m| !m.is_empty()),
            attachments: data
                .attachments
                .iter()
                .map(|a| AttachmentRef {
                    content_type: a.content_type.clone(),
                    filename: a.filename.clone(),
                    id: a.id.clone(),
                    size: a.size,
                })
                .collect(),
            mentions,
            quote,
            previews: data
                .previews
                .iter()
                .map(|p| LinkPreview {
                    url: p.url.clone(),
                    title: p.title.clone(),
                    description: p.description.clone(),
                })
                .collect(),
            sticker: data.sticker.as_ref().map(|s| StickerRef {
                pack_id: s.pack_id.clone(),
                sticker_id: s.sticker_id,
            }),
            expires_in: data.expires_in_seconds.filter(|&e| e != 0),
        }
    }

    async fn handle_data(
        &mut self,
        envelope: &Envelope,
        sender: Identity,
        device: DeviceId,
        timestamp: Timestamp,
    ) -> Result<()> {
        let data = envelope.data_message.as_ref().ok_or_else(|| {
            WirelineError::malformed_envelope("data envelope without a data message")
        })?;
        let body = self.convert_body(data);
        // A 1:1 message is addressed to us; the conversation itself stays
        // keyed by the sender.
        let recipient = match self.resolve_conversation(data.group_info.as_ref(), None, &sender) {
            Recipient::Group(group) => {
                if let Some(entry) = self.groups.get_mut(&group) {
                    entry.seen(timestamp);
                }
                Recipient::Group(group)
            }
            Recipient::Contact(_) => {
                self.contacts.get_self_mut().seen(timestamp);
                Recipient::Contact(self.contacts.self_identity())
            }
        };
        let mut meta = MessageMeta::new(sender, recipient, device, timestamp);
        // Arrival is delivery.
        meta.mark_delivered(timestamp);
        let message = Message::Received(ReceivedMessage {
            meta,
            body,
            reactions: ReactionSet::new(),
        });
        self.store.append(message.clone());
        self.emit(AccountEvent::Message { message }).await;
        Ok(())
    }

    async fn handle_reaction(
        &mut self,
        envelope: &Envelope,
        sender: Identity,
        device: DeviceId,
        timestamp: Timestamp,
    ) -> Result<()> {
        let data = envelope.data_message.as_ref().ok_or_else(|| {
            WirelineError::malformed_envelope("reaction envelope without a data message")
        })?;
        let raw = data.reaction.as_ref().ok_or_else(|| {
            WirelineError::malformed_envelope("reaction envelope without a reaction")
        })?;
        let number = raw.target_author_number.as_deref().or_else(|| {
            raw.target_author.as_deref().filter(|a| a.starts_with('+'))
        });
        let uuid = raw.target_author_uuid.as_deref().or_else(|| {
            raw.target_author.as_deref().filter(|a| !a.starts_with('+'))
        });
        let author = number
            .or(uuid)
            .ok_or_else(|| WirelineError::malformed_envelope("reaction without target author"))?;
        self.contacts.get_or_add(None, number, uuid)?;
        let target_author = Identity::parse(author)?;
        let conversation =
            self.resolve_conversation(data.group_info.as_ref(), None, &sender);

        let reaction = ReactionRecord {
            sender,
            device,
            conversation,
            timestamp,
            emoji: raw.emoji.clone(),
            target_author,
            target_timestamp: Timestamp::new(raw.target_sent_timestamp),
            is_remove: raw.is_remove,
            is_change: false,
            previous_emoji: None,
        };
        let applied = match self.store.reconcile_reaction(&reaction, &self.contacts) {
            Ok(applied) => applied,
            Err(e) => {
                warn!("reaction not applied: {e}");
                false
            }
        };
        self.emit(AccountEvent::Reaction { reaction, applied }).await;
        Ok(())
    }

    async fn handle_group_update(
        &mut self,
        envelope: &Envelope,
        sender: Identity,
        device: DeviceId,
        timestamp: Timestamp,
    ) -> Result<()> {
        let info = envelope
            .data_message
            .as_ref()
            .and_then(|data| data.group_info.as_ref())
            .ok_or_else(|| {
                WirelineError::malformed_envelope("group update without group info")
            })?;
        let group = GroupId::new(info.group_id.as_str());
        self.groups.get_or_add(None, &group);

        // The update envelope carries no metadata, so pull the new state.
        if let Err(e) = self.sync_groups(Some(&group)).await {
            warn!(group = %group, "group re-sync failed: {e}");
        }
        if let Some(entry) = self.groups.get_mut(&group) {
            entry.seen(timestamp);
        }

        let message = Message::GroupUpdate(GroupUpdateEvent {
            meta: MessageMeta::new(sender, Recipient::Group(group.clone()), device, timestamp),
            group,
        });
        self.store.append(message.clone());
        self.emit(AccountEvent::Sync { message }).await;
        Ok(())
    }

    async fn handle_receipt(
        &mut self,
        envelope: &Envelope,
        sender: Identity,
        device: DeviceId,
        _timestamp: Timestamp,
    ) -> Result<()> {
        let raw = envelope.receipt_message.as_ref().ok_or_else(|| {
            WirelineError::malformed_envelope("receipt envelope without a receipt message")
        })?;
        let kind = if raw.is_delivery {
            ReceiptKind::Delivery
        } else if raw.is_read {
            ReceiptKind::Read
        } else if raw.is_viewed {
            ReceiptKind::Viewed
        } else {
            return Err(WirelineError::malformed_envelope(
                "receipt asserts no delivery state",
            ));
        };
        let receipt = ReceiptRecord {
            sender,
            device,
            kind,
            when: Timestamp::new(raw.when),
            timestamps: raw.timestamps.iter().map(|&t| Timestamp::new(t)).collect(),
        };
        let matched = self.store.reconcile_receipt(&receipt);
        debug!(?kind, matched, "reconciled receipt");
        self.emit(AccountEvent::Receipt { receipt, matched }).await;
        Ok(())
    }

    fn read_mark_from_raw(&mut self, raw: &RawReadMark) -> Option<ReadMark> {
        let number = raw
            .sender_number
            .as_deref()
            .or_else(|| raw.sender.as_deref().filter(|s| s.starts_with('+')));
        let uuid = raw
            .sender_uuid
            .as_deref()
            .or_else(|| raw.sender.as_deref().filter(|s| !s.starts_with('+')));
        self.contacts.get_or_add(None, number, uuid).ok()?;
        let sender = Identity::parse(number.or(uuid)?).ok()?;
        Some(ReadMark {
            sender,
            timestamp: Timestamp::new(raw.timestamp),
        })
    }

    async fn handle_sync_reads(
        &mut self,
        envelope: &Envelope,
        sender: Identity,
        device: DeviceId,
        timestamp: Timestamp,
    ) -> Result<()> {
        let marks = envelope
            .sync_message
            .as_ref()
            .and_then(|sync| sync.read_messages.as_deref())
            .unwrap_or_default();
        let reads: Vec<ReadMark> = marks
            .iter()
            .filter_map(|m| self.read_mark_from_raw(m))
            .collect();
        let marked = self.store.apply_read_marks(&reads, timestamp, &self.contacts);
        debug!(marked, "applied read-messages sync");

        let message = Message::Sync(SyncEvent {
            meta: MessageMeta::new(
                sender,
                Recipient::Contact(self.contacts.self_identity()),
                device,
                timestamp,
            ),
            kind: SyncKind::ReadMessages { reads },
        });
        self.store.append(message.clone());
        self.emit(AccountEvent::Sync { message }).await;
        Ok(())
    }

    async fn handle_sync_sent(
        &mut self,
        envelope: &Envelope,
        sender: Identity,
        device: DeviceId,
        timestamp: Timestamp,
    ) -> Result<()> {
        let echo = envelope
            .sync_message
            .as_ref()
            .and_then(|sync| sync.sent_message.as_ref())
            .ok_or_else(|| {
                WirelineError::malformed_envelope("sent sync without a sent message")
            })?;
        let sent = self.sent_from_echo(echo, device)?;
        self.store.append(Message::Sent(sent));

        let message = Message::Sync(SyncEvent {
            meta: MessageMeta::new(
                sender,
                Recipient::Contact(self.contacts.self_identity()),
                device,
                timestamp,
            ),
            kind: SyncKind::SentMessage {
                raw: serde_json::to_value(envelope.clone()).unwrap_or(Value::Null),
            },
        });
        self.store.append(message.clone());
        self.emit(AccountEvent::Sync { message }).await;
        Ok(())
    }

    /// Reconstruct the sent message another of our devices echoed to us.
    fn sent_from_echo(&mut self, echo: &RawSentEcho, device: DeviceId) -> Result<SentMessage> {
        let recipient = match &echo.group_info {
            Some(info) => {
                let group = GroupId::new(info.group_id.as_str());
                self.groups.get_or_add(None, &group);
                Recipient::Group(group)
            }
            None => {
                let number = echo.destination_number.as_deref().or_else(|| {
                    echo.destination.as_deref().filter(|d| d.starts_with('+'))
                });
                let uuid = echo.destination_uuid.as_deref().or_else(|| {
                    echo.destination.as_deref().filter(|d| !d.starts_with('+'))
                });
                let destination = number.or(uuid).ok_or_else(|| {
                    WirelineError::malformed_envelope("sent sync without a destination")
                })?;
                self.contacts.get_or_add(None, number, uuid)?;
                Recipient::Contact(Identity::parse(destination)?)
            }
        };
        let sent_to = match &recipient {
            Recipient::Contact(id) => vec![id.clone()],
            Recipient::Group(_) => Vec::new(),
        };
        let data = RawDataMessage {
            message: echo.message.clone(),
            timestamp: Some(echo.timestamp),
            expires_in_seconds: echo.expiration_in_seconds,
            reaction: None,
            attachments: echo.attachments.clone(),
            mentions: echo.mentions.clone(),
            quote: echo.quote.clone(),
            previews: echo.previews.clone(),
            sticker: echo.sticker.clone(),
            group_info: echo.group_info.clone(),
        };
        let body = self.convert_body(&data);
        Ok(SentMessage {
            meta: MessageMeta::new(
                self.contacts.self_identity(),
                recipient,
                device,
                Timestamp::new(echo.timestamp),
            ),
            body,
            is_sent: true,
            sent_to,
            reactions: ReactionSet::new(),
            delivery_receipts: Vec::new(),
            read_receipts: Vec::new(),
            viewed_receipts: Vec::new(),
        })
    }

    async fn handle_sync_blocked(
        &mut self,
        envelope: &Envelope,
        sender: Identity,
        device: DeviceId,
        timestamp: Timestamp,
    ) -> Result<()> {
        let raw = envelope.sync_message.as_ref().ok_or_else(|| {
            WirelineError::malformed_envelope("blocked sync without a sync message")
        })?;
        let contacts: Vec<Identity> = raw
            .blocked_numbers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|n| {
                self.contacts.get_or_add(None, Some(n), None).ok()?;
                Identity::parse(n).ok()
            })
            .collect();
        let groups: Vec<GroupId> = raw
            .blocked_group_ids
            .iter()
            .map(|id| {
                let group = GroupId::new(id.as_str());
                self.groups.get_or_add(None, &group);
                group
            })
            .collect();
        self.contacts.set_blocked(&contacts);
        self.groups.set_blocked(&groups);

        let message = Message::Sync(SyncEvent {
            meta: MessageMeta::new(
                sender,
                Recipient::Contact(self.contacts.self_identity()),
                device,
                timestamp,
            ),
            kind: SyncKind::Blocked { contacts, groups },
        });
        self.store.append(message.clone());
        self.emit(AccountEvent::Sync { message }).await;
        Ok(())
    }

    async fn handle_sync_resync(
        &mut self,
        kind: EnvelopeKind,
        sender: Identity,
        device: DeviceId,
        timestamp: Timestamp,
    ) -> Result<()> {
        let sync_kind = match kind {
            EnvelopeKind::SyncContacts => {
                if let Err(e) = self.sync_contacts().await {
                    warn!("contact re-sync failed: {e}");
                }
                SyncKind::Contacts
            }
            _ => {
                if let Err(e) = self.sync_groups(None).await {
                    warn!("group re-sync failed: {e}");
                }
                SyncKind::Groups
            }
        };
        let message = Message::Sync(SyncEvent {
            meta: MessageMeta::new(
                sender,
                Recipient::Contact(self.contacts.self_identity()),
                device,
                timestamp,
            ),
            kind: sync_kind,
        });
        self.store.append(message.clone());
        self.emit(AccountEvent::Sync { message }).await;
        Ok(())
    }

    async fn handle_typing(
        &mut self,
        envelope: &Envelope,
        sender: Identity,
        device: DeviceId,
        timestamp: Timestamp,
    ) -> Result<()> {
        let raw = envelope.typing_message.as_ref().ok_or_else(|| {
            WirelineError::malformed_envelope("typing envelope without a typing message")
        })?;
        let action = TypingAction::parse(&raw.action)?;
        let recipient = self.resolve_conversation(None, raw.group_id.as_deref(), &sender);

        if let Some(contact) = self.contacts.get_mut(&sender) {
            contact.is_typing = action.is_started();
        }

        let message = Message::Typing(TypingEvent {
            meta: MessageMeta::new(sender.clone(), recipient, device, timestamp),
            action,
            time_changed: Timestamp::new(raw.timestamp),
        });
        self.store.append(message);
        self.emit(AccountEvent::Typing {
            sender,
            started: action.is_started(),
        })
        .await;
        Ok(())
    }

    async fn handle_story(
        &mut self,
        envelope: &Envelope,
        sender: Identity,
        device: DeviceId,
        timestamp: Timestamp,
    ) -> Result<()> {
        let raw = envelope.story_message.as_ref().ok_or_else(|| {
            WirelineError::malformed_envelope("story envelope without a story message")
        })?;
        let message = Message::Story(StoryEvent {
            meta: MessageMeta::new(
                sender,
                Recipient::Contact(self.contacts.self_identity()),
                device,
                timestamp,
            ),
            allows_replies: raw.allows_replies,
            text: raw.message.clone(),
        });
        self.store.append(message.clone());
        self.emit(AccountEvent::Story { message }).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Daemon syncs
    // ------------------------------------------------------------------

    /// Pull the daemon's contact list and merge it. Returns new entries.
    async fn sync_contacts(&mut self) -> Result<usize> {
        let account = self.account();
        let result = self
            .commands
            .call("listContacts", json!({ "account": account }))
            .await?;
        let raw: Vec<RawContact> = serde_json::from_value(result)?;
        let added = self
            .contacts
            .sync_merge(raw.into_iter().map(RawContact::into_contact).collect());
        info!(added, total = self.contacts.len(), "synced contacts");
        Ok(added)
    }

    /// Pull one group or the full group list and merge it. Members are
    /// resolved into the contact registry as they are seen.
    async fn sync_groups(&mut self, only: Option<&GroupId>) -> Result<usize> {
        let account = self.account();
        let mut params = json!({ "account": account });
        if let Some(group) = only {
            params["groupId"] = json!(group.as_str());
        }
        let result = self.commands.call("listGroups", params).await?;
        let raw: Vec<RawGroup> = serde_json::from_value(result)?;
        let mut groups = Vec::with_capacity(raw.len());
        for group in raw {
            groups.push(self.group_from_raw(group)?);
        }
        let added = self.groups.sync_merge(groups);
        info!(added, total = self.groups.len(), "synced groups");
        Ok(added)
    }

    fn group_from_raw(&mut self, raw: RawGroup) -> Result<Group> {
        let mut resolve = |members: &[RawMember]| -> Vec<Identity> {
            members
                .iter()
                .filter_map(|m| {
                    self.contacts
                        .get_or_add(None, m.number.as_deref(), m.uuid.as_deref())
                        .ok();
                    m.identity()
                })
                .collect()
        };
        let members = resolve(&raw.members);
        let pending = resolve(&raw.pending_members);
        let requesting = resolve(&raw.requesting_members);
        let admins = resolve(&raw.admins);
        let banned = resolve(&raw.banned);

        let mut group = Group::new(
            GroupId::new(raw.id),
            raw.name.filter(|n| !n.is_empty()),
        );
        group.description = raw.description.filter(|d| !d.is_empty());
        group.is_member = raw.is_member;
        group.is_blocked = raw.is_blocked;
        group.expiration = raw.message_expiration_time.filter(|&e| e != 0);
        group.link = raw.group_invite_link;
        group.members = members;
        group.pending = pending;
        group.requesting = requesting;
        group.admins = admins;
        group.banned = banned;
        group.permission_add_member = raw.permission_add_member;
        group.permission_edit_details = raw.permission_edit_details;
        group.permission_send_message = raw.permission_send_message;
        Ok(group)
    }

    /// Pull this account's linked devices into the self contact.
    async fn sync_devices(&mut self) -> Result<usize> {
        let account = self.account();
        let result = self
            .commands
            .call("listDevices", json!({ "account": account }))
            .await?;
        let raw: Vec<RawDevice> = serde_json::from_value(result)?;
        let own = self.contacts.get_self_mut();
        let mut added = 0;
        for device in raw {
            let id = DeviceId::new(device.id);
            let mut entry = wireline_core::registry::Device::new(
                id,
                device.created_timestamp.map(Timestamp::new),
            );
            entry.name = device.name.filter(|n| !n.is_empty());
            entry.last_seen = device.last_seen_timestamp.map(Timestamp::new);
            entry.is_account_device = true;
            if own.devices.merge(&entry) {
                added += 1;
            }
        }
        info!(added, total = own.devices.len(), "synced devices");
        Ok(added)
    }

    // ------------------------------------------------------------------
    // Foreground commands
    // ------------------------------------------------------------------

    async fn process_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::SendMessage {
                target,
                body,
                attachments,
                quote,
                reply,
            } => {
                let result = self.send_message(target, body, attachments, quote).await;
                Self::triage_reply(reply, result)
            }
            Command::SendReaction {
                conversation,
                emoji,
                target_author,
                target_timestamp,
                remove,
                reply,
            } => {
                let result = self
                    .send_reaction(conversation, emoji, target_author, target_timestamp, remove)
                    .await;
                Self::triage_reply(reply, result)
            }
            Command::SendReceipt {
                recipient,
                kind,
                timestamps,
                reply,
            } => {
                let result = self.send_receipt(recipient, kind, timestamps).await;
                Self::triage_reply(reply, result)
            }
            Command::AddContact {
                name,
                id,
                expiration,
                reply,
            } => {
                let result = self.add_contact(name, id, expiration).await;
                Self::triage_reply(reply, result)
            }
            Command::UpdateProfile {
                name,
                about,
                emoji,
                reply,
            } => {
                let result = self.update_profile(name, about, emoji).await;
                Self::triage_reply(reply, result)
            }
            Command::SyncContacts { reply } => {
                let result = self.sync_contacts().await;
                let result = result.and_then(|added| {
                    self.persist_registries()?;
                    Ok(added)
                });
                Self::triage_reply(reply, result)
            }
            Command::SyncGroups { reply } => {
                let result = self.sync_groups(None).await;
                let result = result.and_then(|added| {
                    self.persist_registries()?;
                    Ok(added)
                });
                Self::triage_reply(reply, result)
            }
            Command::SyncDevices { reply } => {
                let result = self.sync_devices().await;
                let result = result.and_then(|added| {
                    self.persist_registries()?;
                    Ok(added)
                });
                Self::triage_reply(reply, result)
            }
            Command::GetContacts { reply } => {
                let _ = reply.send(self.contacts.contacts().to_vec());
                Ok(())
            }
            Command::GetGroups { reply } => {
                let _ = reply.send(self.groups.groups().to_vec());
                Ok(())
            }
            Command::GetConversation { target, reply } => {
                let messages = self
                    .store
                    .conversation(&target, &self.contacts)
                    .into_iter()
                    .cloned()
                    .collect();
                let _ = reply.send(messages);
                Ok(())
            }
            Command::GetStats { reply } => {
                let _ = reply.send(self.store.stats());
                Ok(())
            }
            Command::Shutdown { reply } => {
                info!("shutdown requested");
                self.persistence.save_contacts(&self.contacts)?;
                self.persistence.save_groups(&self.groups)?;
                self.persistence.save_messages(&self.store)?;
                self.running = false;
                let _ = reply.send(());
                Ok(())
            }
        }
    }

    /// Send the command result to the caller. Fatal errors are propagated
    /// to the loop after the caller has been notified.
    fn triage_reply<T: Send + std::fmt::Debug>(
        reply: oneshot::Sender<Result<T>>,
        result: Result<T>,
    ) -> Result<()> {
        match result {
            Ok(value) => {
                let _ = reply.send(Ok(value));
                Ok(())
            }
            Err(e) => {
                let fatal = matches!(
                    e,
                    WirelineError::Transport(_) | WirelineError::Storage(_)
                );
                let _ = reply.send(Err(e));
                if fatal {
                    Err(WirelineError::channel_error(
                        "connection or storage failure during command",
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn send_message(
        &mut self,
        target: Recipient,
        body: Option<String>,
        attachments: Vec<String>,
        quote: Option<QuoteRef>,
    ) -> Result<Timestamp> {
        let account = self.account();
        let mut params = json!({
            "account": account,
            "message": body.clone().unwrap_or_default(),
        });
        match &target {
            Recipient::Contact(id) => params["recipient"] = json!([id.as_str()]),
            Recipient::Group(id) => params["groupId"] = json!(id.as_str()),
        }
        if !attachments.is_empty() {
            params["attachments"] = json!(attachments);
        }
        if let Some(quote) = &quote {
            params["quoteTimestamp"] = json!(quote.timestamp.as_millis());
            params["quoteAuthor"] = json!(quote.author.as_str());
        }
        let result = self.commands.call("send", params).await?;
        let result: RawSendResult = serde_json::from_value(result)?;
        let timestamp = result.timestamp.map(Timestamp::new).unwrap_or_else(Timestamp::now);

        let sent_to: Vec<Identity> = result
            .results
            .iter()
            .filter(|entry| {
                entry
                    .kind
                    .as_deref()
                    .is_some_and(|k| k.eq_ignore_ascii_case("SUCCESS"))
            })
            .filter_map(|entry| entry.recipient_address.as_ref().and_then(RawMember::identity))
            .collect();

        let message = Message::Sent(SentMessage {
            meta: MessageMeta::new(
                self.contacts.self_identity(),
                target,
                self.device_id,
                timestamp,
            ),
            body: MessageBody {
                body,
                attachments: attachments
                    .into_iter()
                    .map(|path| AttachmentRef {
                        content_type: None,
                        filename: Some(path),
                        id: None,
                        size: None,
                    })
                    .collect(),
                mentions: Vec::new(),
                quote,
                previews: Vec::new(),
                sticker: None,
                expires_in: None,
            },
            is_sent: true,
            sent_to,
            reactions: ReactionSet::new(),
            delivery_receipts: Vec::new(),
            read_receipts: Vec::new(),
            viewed_receipts: Vec::new(),
        });
        self.store.append(message);
        self.persist_changes()?;
        Ok(timestamp)
    }

    async fn send_reaction(
        &mut self,
        conversation: Recipient,
        emoji: String,
        target_author: Identity,
        target_timestamp: Timestamp,
        remove: bool,
    ) -> Result<()> {
        let account = self.account();
        let mut params = json!({
            "account": account,
            "emoji": emoji,
            "targetAuthor": target_author.as_str(),
            "targetTimestamp": target_timestamp.as_millis(),
            "remove": remove,
        });
        match &conversation {
            Recipient::Contact(id) => params["recipient"] = json!([id.as_str()]),
            Recipient::Group(id) => params["groupId"] = json!(id.as_str()),
        }
        self.commands.call("sendReaction", params).await?;

        let reaction = ReactionRecord {
            sender: self.contacts.self_identity(),
            device: self.device_id,
            conversation,
            timestamp: Timestamp::now(),
            emoji,
            target_author,
            target_timestamp,
            is_remove: remove,
            is_change: false,
            previous_emoji: None,
        };
        self.store.reconcile_reaction(&reaction, &self.contacts)?;
        self.persist_changes()?;
        Ok(())
    }

    async fn send_receipt(
        &mut self,
        recipient: Identity,
        kind: ReceiptKind,
        timestamps: Vec<Timestamp>,
    ) -> Result<()> {
        let receipt_type = match kind {
            ReceiptKind::Read => "read",
            ReceiptKind::Viewed => "viewed",
            ReceiptKind::Delivery => {
                return Err(WirelineError::invalid_argument(
                    "delivery receipts are sent by the daemon, not the client",
                ))
            }
        };
        let account = self.account();
        let params = json!({
            "account": account,
            "recipient": recipient.as_str(),
            "receiptType": receipt_type,
            "targetTimestamps": timestamps.iter().map(Timestamp::as_millis).collect::<Vec<_>>(),
        });
        self.commands.call("sendReceipt", params).await?;
        self.store.mark_local(
            kind,
            &recipient,
            &timestamps,
            Timestamp::now(),
            &self.contacts,
        );
        self.persist_changes()?;
        Ok(())
    }

    /// Add or rename a contact through the daemon, then refresh the local
    /// list. A daemon error degrades to a local-only entry and `false`.
    async fn add_contact(
        &mut self,
        name: String,
        id: Identity,
        expiration: Option<u64>,
    ) -> Result<bool> {
        let known = self.contacts.index_of(&id).is_some();
        let account = self.account();
        let mut params = json!({
            "account": account,
            "recipient": id.as_str(),
            "name": name,
        });
        if let Some(expiration) = expiration {
            params["expiration"] = json!(expiration);
        }
        match self.commands.call("updateContact", params).await {
            Ok(_) => {
                let (added, idx) = self.contacts.get_or_add_id(Some(name.as_str()), &id)?;
                {
                    let contact = self.contacts.get_at_mut(idx);
                    contact.name = Some(name);
                    contact.expiration = expiration;
                }
                if let Err(e) = self.sync_contacts().await {
                    warn!("contact refresh after add failed: {e}");
                }
                self.persist_registries()?;
                Ok(added && !known)
            }
            Err(e) if e.is_daemon_error() => {
                warn!("daemon rejected contact update, keeping local entry: {e}");
                let (_, idx) = self.contacts.get_or_add_id(Some(name.as_str()), &id)?;
                self.contacts.get_at_mut(idx).expiration = expiration;
                self.persist_registries()?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn update_profile(
        &mut self,
        name: Option<String>,
        about: Option<String>,
        emoji: Option<String>,
    ) -> Result<()> {
        let account = self.account();
        let mut params = json!({ "account": account });
        if let Some(name) = &name {
            params["givenName"] = json!(name);
        }
        if let Some(about) = &about {
            params["about"] = json!(about);
        }
        if let Some(emoji) = &emoji {
            params["aboutEmoji"] = json!(emoji);
        }
        self.commands.call("updateProfile", params).await?;

        let own = self.contacts.get_self_mut();
        let profile = own.profile.get_or_insert_with(Profile::default);
        if name.is_some() {
            profile.name = name;
        }
        if about.is_some() {
            profile.about = about;
        }
        if emoji.is_some() {
            profile.emoji = emoji;
        }
        self.persist_registries()?;
        Ok(())
    }
}
