//! Wireline runtime
//!
//! The async half of the client: line-framed JSON-RPC transport to the
//! daemon, the single-owner dispatcher task that folds commands and inbound
//! envelopes into account state, the foreground [`AccountHandle`], and the
//! registration flows.
//!
//! One dispatcher task per account owns all mutable state. Everything else
//! talks to it over channels.

pub mod account;
pub mod commands;
pub mod dispatcher;
pub mod registration;
pub mod runtime;
pub mod transport;

pub use account::AccountHandle;
pub use commands::{AccountEvent, Command};
pub use registration::{register, verify};
pub use runtime::{start, start_with_connections, AccountConfig, AccountRuntime};
pub use transport::{DaemonConnection, ServerAddress};
