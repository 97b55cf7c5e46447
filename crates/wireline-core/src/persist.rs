//! Versioned JSON snapshot persistence
//!
//! Each entity category is persisted as one JSON document gated by a
//! `version` field: contacts (with their device sub-registries), groups, and
//! the four message logs. A load that fails for any reason means "no prior
//! state"; a save that fails is fatal.
//!
//! The [`SnapshotStore`] trait is the seam between the engine and the disk,
//! so tests can run against the in-memory implementation.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{Result, StorageError};
use crate::message::Message;
use crate::registry::{Contact, ContactRegistry, Group, GroupRegistry};
use crate::store::ConversationStore;

/// Current snapshot document version. Documents with any other version are
/// treated as no prior state.
pub const SNAPSHOT_VERSION: u32 = 1;

// ----------------------------------------------------------------------------
// Flush Policy
// ----------------------------------------------------------------------------

/// When message-log mutations reach the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Write a snapshot after every mutation.
    Immediate,
    /// Write a snapshot after every `every` mutations, and on shutdown.
    Batched { every: usize },
}

impl Default for FlushPolicy {
    fn default() -> Self {
        FlushPolicy::Immediate
    }
}

// ----------------------------------------------------------------------------
// Snapshot Documents
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ContactsDocument {
    pub version: u32,
    pub contacts: Vec<Contact>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupsDocument {
    pub version: u32,
    pub groups: Vec<Group>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesDocument {
    pub version: u32,
    pub messages: Vec<Message>,
    pub sync: Vec<Message>,
    pub typing: Vec<Message>,
    pub story: Vec<Message>,
}

// ----------------------------------------------------------------------------
// SnapshotStore Seam
// ----------------------------------------------------------------------------

/// Storage backend for snapshot documents, keyed by document name. The
/// dispatcher task owning a boxed store must stay spawnable, so backends
/// are `Send + Sync`.
pub trait SnapshotStore: Send + Sync {
    /// Persist a document. Errors are fatal to the caller.
    fn save(&mut self, name: &str, json: &str) -> Result<()>;

    /// Load a document, `None` when absent.
    fn load(&self, name: &str) -> Result<Option<String>>;
}

/// File-backed snapshot store, one JSON file per document under a root
/// directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StorageError::SaveFailed {
            name: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }
}

impl SnapshotStore for FileStore {
    fn save(&mut self, name: &str, json: &str) -> Result<()> {
        fs::write(self.path_for(name), json).map_err(|source| {
            StorageError::SaveFailed {
                name: name.to_string(),
                source,
            }
            .into()
        })
    }

    fn load(&self, name: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(name)) {
            Ok(json) => Ok(Some(json)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => {
                // Unreadable snapshots are treated like missing ones.
                warn!(name, error = %e, "failed to read snapshot");
                Ok(None)
            }
        }
    }
}

/// In-memory snapshot store for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, name: &str) -> Option<&String> {
        self.documents.get(name)
    }
}

impl SnapshotStore for MemoryStore {
    fn save(&mut self, name: &str, json: &str) -> Result<()> {
        self.documents.insert(name.to_string(), json.to_string());
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<String>> {
        Ok(self.documents.get(name).cloned())
    }
}

// ----------------------------------------------------------------------------
// Persistence
// ----------------------------------------------------------------------------

/// Snapshot writer for one account. Registry snapshots are written whenever
/// asked; the message log honors the flush policy, since it takes a write
/// per inbound event.
pub struct Persistence {
    store: Box<dyn SnapshotStore>,
    account: String,
    policy: FlushPolicy,
    pending: usize,
}

impl Persistence {
    pub fn new(store: Box<dyn SnapshotStore>, account: &str, policy: FlushPolicy) -> Self {
        Self {
            store,
            account: account.to_string(),
            policy,
            pending: 0,
        }
    }

    fn document_name(&self, category: &str) -> String {
        format!("{}-{}", category, self.account)
    }

    fn encode<T: Serialize>(&self, name: &str, document: &T) -> Result<String> {
        serde_json::to_string_pretty(document).map_err(|source| {
            StorageError::EncodeFailed {
                name: name.to_string(),
                source,
            }
            .into()
        })
    }

    fn decode<T: for<'de> Deserialize<'de>>(name: &str, json: &str) -> Option<T> {
        match serde_json::from_str(json) {
            Ok(document) => Some(document),
            Err(e) => {
                warn!(name, error = %e, "corrupt snapshot, starting empty");
                None
            }
        }
    }

    pub fn save_contacts(&mut self, contacts: &ContactRegistry) -> Result<()> {
        let name = self.document_name("contacts");
        let document = ContactsDocument {
            version: SNAPSHOT_VERSION,
            contacts: contacts.contacts().to_vec(),
        };
        let json = self.encode(&name, &document)?;
        self.store.save(&name, &json)
    }

    pub fn load_contacts(&self) -> Result<Option<Vec<Contact>>> {
        let name = self.document_name("contacts");
        let Some(json) = self.store.load(&name)? else {
            return Ok(None);
        };
        let Some(document) = Self::decode::<ContactsDocument>(&name, &json) else {
            return Ok(None);
        };
        if document.version != SNAPSHOT_VERSION {
            warn!(
                name,
                version = document.version,
                "unsupported snapshot version, starting empty"
            );
            return Ok(None);
        }
        Ok(Some(document.contacts))
    }

    pub fn save_groups(&mut self, groups: &GroupRegistry) -> Result<()> {
        let name = self.document_name("groups");
        let document = GroupsDocument {
            version: SNAPSHOT_VERSION,
            groups: groups.groups().to_vec(),
        };
        let json = self.encode(&name, &document)?;
        self.store.save(&name, &json)
    }

    pub fn load_groups(&self) -> Result<Option<Vec<Group>>> {
        let name = self.document_name("groups");
        let Some(json) = self.store.load(&name)? else {
            return Ok(None);
        };
        let Some(document) = Self::decode::<GroupsDocument>(&name, &json) else {
            return Ok(None);
        };
        if document.version != SNAPSHOT_VERSION {
            warn!(
                name,
                version = document.version,
                "unsupported snapshot version, starting empty"
            );
            return Ok(None);
        }
        Ok(Some(document.groups))
    }

    /// Write the message snapshot unconditionally.
    pub fn save_messages(&mut self, store: &ConversationStore) -> Result<()> {
        let name = self.document_name("messages");
        let document = MessagesDocument {
            version: SNAPSHOT_VERSION,
            messages: store.messages().to_vec(),
            sync: store.sync_events().to_vec(),
            typing: store.typing_events().to_vec(),
            story: store.story_events().to_vec(),
        };
        let json = self.encode(&name, &document)?;
        self.pending = 0;
        self.store.save(&name, &json)
    }

    /// Record one message-log mutation and write a snapshot when the flush
    /// policy calls for it.
    pub fn commit_messages(&mut self, store: &ConversationStore) -> Result<()> {
        match self.policy {
            FlushPolicy::Immediate => self.save_messages(store),
            FlushPolicy::Batched { every } => {
                self.pending += 1;
                if self.pending >= every {
                    self.save_messages(store)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Flush anything the batched policy is still holding.
    pub fn flush(&mut self, store: &ConversationStore) -> Result<()> {
        if self.pending > 0 {
            self.save_messages(store)
        } else {
            Ok(())
        }
    }

    pub fn load_messages(&self) -> Result<Option<ConversationStore>> {
        let name = self.document_name("messages");
        let Some(json) = self.store.load(&name)? else {
            return Ok(None);
        };
        let Some(document) = Self::decode::<MessagesDocument>(&name, &json) else {
            return Ok(None);
        };
        if document.version != SNAPSHOT_VERSION {
            warn!(
                name,
                version = document.version,
                "unsupported snapshot version, starting empty"
            );
            return Ok(None);
        }
        info!(
            name,
            messages = document.messages.len(),
            "loaded message snapshot"
        );
        Ok(Some(ConversationStore::from_logs(
            document.messages,
            document.sync,
            document.typing,
            document.story,
        )))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBody, MessageMeta, ReactionSet, ReceivedMessage, Recipient};
    use crate::types::{DeviceId, Identity, Timestamp};

    const ACCOUNT: &str = "+15550000001";

    fn received(from: &str, timestamp: u64) -> Message {
        Message::Received(ReceivedMessage {
            meta: MessageMeta::new(
                Identity::parse(from).unwrap(),
                Recipient::Contact(Identity::parse(ACCOUNT).unwrap()),
                DeviceId::PRIMARY,
                Timestamp::new(timestamp),
            ),
            body: MessageBody {
                body: Some("hello".to_string()),
                ..MessageBody::default()
            },
            reactions: ReactionSet::new(),
        })
    }

    #[test]
    fn contacts_round_trip() {
        let mut persistence =
            Persistence::new(Box::new(MemoryStore::new()), ACCOUNT, FlushPolicy::Immediate);

        let mut contacts = ContactRegistry::new(ACCOUNT);
        contacts
            .get_or_add(Some("Alice"), Some("+15551230001"), None)
            .unwrap();
        contacts
            .get_mut(&Identity::parse("+15551230001").unwrap())
            .unwrap()
            .is_typing = true;

        persistence.save_contacts(&contacts).unwrap();
        let restored = persistence.load_contacts().unwrap().unwrap();
        let restored = ContactRegistry::from_contacts(ACCOUNT, restored);

        let alice = restored
            .get(&Identity::parse("+15551230001").unwrap())
            .unwrap();
        assert_eq!(alice.name.as_deref(), Some("Alice"));
        // Transient state resets on round trip.
        assert!(!alice.is_typing);
        assert!(restored.get_self().is_self);
    }

    #[test]
    fn persistence_moves_between_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Persistence>();
    }

    #[test]
    fn missing_snapshot_means_no_prior_state() {
        let persistence =
            Persistence::new(Box::new(MemoryStore::new()), ACCOUNT, FlushPolicy::Immediate);
        assert!(persistence.load_contacts().unwrap().is_none());
        assert!(persistence.load_groups().unwrap().is_none());
        assert!(persistence.load_messages().unwrap().is_none());
    }

    #[test]
    fn corrupt_snapshot_means_no_prior_state() {
        let mut store = MemoryStore::new();
        store
            .save(&format!("messages-{ACCOUNT}"), "{not json")
            .unwrap();
        let persistence = Persistence::new(Box::new(store), ACCOUNT, FlushPolicy::Immediate);
        assert!(persistence.load_messages().unwrap().is_none());
    }

    #[test]
    fn version_gate_rejects_future_documents() {
        let mut store = MemoryStore::new();
        let document = serde_json::json!({
            "version": SNAPSHOT_VERSION + 1,
            "contacts": [],
        });
        store
            .save(&format!("contacts-{ACCOUNT}"), &document.to_string())
            .unwrap();
        let persistence = Persistence::new(Box::new(store), ACCOUNT, FlushPolicy::Immediate);
        assert!(persistence.load_contacts().unwrap().is_none());
    }

    #[test]
    fn messages_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut persistence = Persistence::new(
            Box::new(FileStore::open(dir.path()).unwrap()),
            ACCOUNT,
            FlushPolicy::Immediate,
        );

        let mut store = ConversationStore::new();
        store.append(received("+15551230001", 1_000));
        persistence.save_messages(&store).unwrap();

        let restored = persistence.load_messages().unwrap().unwrap();
        assert_eq!(restored.messages().len(), 1);
        assert_eq!(
            restored.get_by_timestamp(Timestamp::new(1_000)).len(),
            1
        );
    }

    #[test]
    fn batched_policy_defers_writes() {
        let mut persistence = Persistence::new(
            Box::new(MemoryStore::new()),
            ACCOUNT,
            FlushPolicy::Batched { every: 3 },
        );

        let mut store = ConversationStore::new();
        store.append(received("+15551230001", 1_000));
        persistence.commit_messages(&store).unwrap();
        persistence.commit_messages(&store).unwrap();
        assert!(persistence.load_messages().unwrap().is_none());

        persistence.commit_messages(&store).unwrap();
        assert!(persistence.load_messages().unwrap().is_some());
    }

    #[test]
    fn flush_writes_pending_batch() {
        let mut persistence = Persistence::new(
            Box::new(MemoryStore::new()),
            ACCOUNT,
            FlushPolicy::Batched { every: 10 },
        );

        let mut store = ConversationStore::new();
        store.append(received("+15551230001", 1_000));
        persistence.commit_messages(&store).unwrap();
        persistence.flush(&store).unwrap();
        assert!(persistence.load_messages().unwrap().is_some());
    }
}
