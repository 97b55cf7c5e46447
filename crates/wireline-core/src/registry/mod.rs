//! Identity registries for contacts, groups, and devices
//!
//! The registries deduplicate every identity the daemon hands us, whether it
//! arrives as a phone number, a UUID, a group id, or a device number. All
//! message state references identities, not registry entries, so the
//! registries stay the single place where equality is decided.

mod contact;
mod device;
mod group;

pub use contact::{Contact, ContactRegistry, Profile, SELF_CONTACT_NAME, UNKNOWN_CONTACT};
pub use device::{Device, DeviceRegistry};
pub use group::{Group, GroupRegistry};
