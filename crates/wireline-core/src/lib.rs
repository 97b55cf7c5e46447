//! Wireline core
//!
//! Pure conversation state for a local messaging-daemon client: identity
//! registries for contacts, groups, and devices; a categorized message store
//! that reconciles receipts and reactions; inbound envelope classification;
//! the JSON-RPC wire envelope; and versioned JSON snapshot persistence.
//!
//! Everything here is synchronous and side-effect free apart from the
//! snapshot store. The async dispatcher that owns this state lives in
//! `wireline-runtime`.

pub mod envelope;
pub mod errors;
pub mod message;
pub mod persist;
pub mod registry;
pub mod rpc;
pub mod store;
pub mod types;

pub use errors::{
    ProtocolError, Result, StorageError, StoreError, TransportError, ValidationError,
    WirelineError,
};
pub use message::{
    AttachmentRef, DeliveryState, GroupUpdateEvent, LinkPreview, Mention, Message, MessageBody,
    MessageMeta, QuoteRef, ReactionRecord, ReactionSet, ReadMark, ReceiptKind, ReceiptRecord,
    ReceivedMessage, Recipient, SentMessage, StickerRef, StoryEvent, SyncEvent, SyncKind,
    TypingAction, TypingEvent,
};
pub use persist::{FileStore, FlushPolicy, MemoryStore, Persistence, SnapshotStore};
pub use registry::{
    Contact, ContactRegistry, Device, DeviceRegistry, Group, GroupRegistry, Profile,
};
pub use store::{ConversationStore, StoreStats};
pub use types::{DeviceId, GroupId, Identity, Timestamp};
