//! Account runtime assembly
//!
//! Loads persisted state, opens the two daemon connections, and spawns the
//! dispatcher task. The returned [`AccountRuntime`] holds the command handle,
//! the event stream, and the task join handle.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use wireline_core::errors::Result;
use wireline_core::persist::{FileStore, FlushPolicy, Persistence};
use wireline_core::registry::{ContactRegistry, GroupRegistry};
use wireline_core::store::ConversationStore;
use wireline_core::types::DeviceId;

use crate::account::AccountHandle;
use crate::commands::AccountEvent;
use crate::dispatcher::DispatcherTask;
use crate::transport::{DaemonConnection, ServerAddress};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for one account's runtime.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// The account's phone number, `+` followed by digits.
    pub account: String,
    /// Where the daemon is listening.
    pub address: ServerAddress,
    /// Directory for snapshot files.
    pub data_dir: PathBuf,
    /// This client's device id. Non-primary devices request a state replay
    /// from the primary before subscribing.
    pub device_id: DeviceId,
    /// When message-log mutations reach the disk.
    pub flush_policy: FlushPolicy,
    /// Command channel capacity.
    pub command_buffer: usize,
    /// Event channel capacity.
    pub event_buffer: usize,
}

impl AccountConfig {
    pub fn new(account: impl Into<String>, address: ServerAddress, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            account: account.into(),
            address,
            data_dir: data_dir.into(),
            device_id: DeviceId::PRIMARY,
            flush_policy: FlushPolicy::Immediate,
            command_buffer: 64,
            event_buffer: 256,
        }
    }
}

// ----------------------------------------------------------------------------
// Runtime
// ----------------------------------------------------------------------------

/// One running account: command handle, event stream, and the dispatcher's
/// join handle.
pub struct AccountRuntime {
    pub handle: AccountHandle,
    pub events: mpsc::Receiver<AccountEvent>,
    pub task: JoinHandle<Result<()>>,
}

/// Connect to the daemon and start the dispatcher for `config`.
pub async fn start(config: AccountConfig) -> Result<AccountRuntime> {
    let commands = DaemonConnection::connect(&config.address).await?;
    let events = DaemonConnection::connect(&config.address).await?;
    info!(account = %config.account, address = %config.address, "connected to daemon");
    start_with_connections(config, commands, events)
}

/// Start the dispatcher over already-established connections. Tests use this
/// with in-memory pipes.
pub fn start_with_connections(
    config: AccountConfig,
    commands: DaemonConnection,
    events: DaemonConnection,
) -> Result<AccountRuntime> {
    let store = FileStore::open(&config.data_dir)?;
    let persistence = Persistence::new(Box::new(store), &config.account, config.flush_policy);

    let contacts = match persistence.load_contacts()? {
        Some(contacts) => ContactRegistry::from_contacts(&config.account, contacts),
        None => ContactRegistry::new(&config.account),
    };
    let groups = match persistence.load_groups()? {
        Some(groups) => GroupRegistry::from_groups(groups),
        None => GroupRegistry::new(),
    };
    let messages = persistence
        .load_messages()?
        .unwrap_or_else(ConversationStore::new);
    info!(
        contacts = contacts.len(),
        groups = groups.len(),
        messages = messages.messages().len(),
        "loaded account state"
    );

    let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
    let (event_tx, event_rx) = mpsc::channel(config.event_buffer);

    let mut task = DispatcherTask::new(
        contacts,
        groups,
        messages,
        persistence,
        commands,
        events,
        command_rx,
        event_tx,
        config.device_id,
    );
    let task = tokio::spawn(async move { task.run().await });

    Ok(AccountRuntime {
        handle: AccountHandle::new(command_tx),
        events: event_rx,
        task,
    })
}
