//! Contact identity resolution
//!
//! Contacts arrive from three directions: daemon syncs, inbound envelopes,
//! and local snapshots. The same person may be addressed by phone number in
//! one place and by UUID in another, so the registry deduplicates by either
//! key and backfills the missing one when both finally show up together.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::Result;
use crate::registry::device::DeviceRegistry;
use crate::types::{Identity, Timestamp};

/// Display name used when neither a contact name nor a profile name is known.
pub const UNKNOWN_CONTACT: &str = "<UNKNOWN-CONTACT>";

/// Name assigned to the account's own contact entry.
pub const SELF_CONTACT_NAME: &str = "Note-To-Self";

// ----------------------------------------------------------------------------
// Profile
// ----------------------------------------------------------------------------

/// The profile a contact publishes about themselves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub name: Option<String>,
    pub about: Option<String>,
    pub emoji: Option<String>,
}

impl Profile {
    pub fn merge(&mut self, incoming: &Profile) {
        if incoming.name.is_some() {
            self.name = incoming.name.clone();
        }
        if incoming.about.is_some() {
            self.about = incoming.about.clone();
        }
        if incoming.emoji.is_some() {
            self.emoji = incoming.emoji.clone();
        }
    }
}

// ----------------------------------------------------------------------------
// Contact
// ----------------------------------------------------------------------------

/// One account the daemon knows about, ours included.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub name: Option<String>,
    pub number: Option<String>,
    pub uuid: Option<String>,
    pub profile: Option<Profile>,
    #[serde(default)]
    pub devices: DeviceRegistry,
    #[serde(default)]
    pub is_blocked: bool,
    pub expiration: Option<u64>,
    /// Transient typing indicator, never persisted.
    #[serde(skip)]
    pub is_typing: bool,
    pub last_seen: Option<Timestamp>,
    #[serde(default)]
    pub is_self: bool,
}

impl Contact {
    pub fn new(name: Option<String>, number: Option<String>, uuid: Option<String>) -> Self {
        Self {
            name,
            number,
            uuid,
            profile: None,
            devices: DeviceRegistry::new(),
            is_blocked: false,
            expiration: None,
            is_typing: false,
            last_seen: None,
            is_self: false,
        }
    }

    /// The identity this contact is addressed by, preferring the number.
    /// Every registry-held contact has at least one of the two set.
    pub fn id(&self) -> Option<Identity> {
        if let Some(number) = &self.number {
            return Some(Identity::Number(number.clone()));
        }
        self.uuid.clone().map(Identity::Uuid)
    }

    pub fn matches(&self, id: &Identity) -> bool {
        match id {
            Identity::Number(number) => self.number.as_deref() == Some(number.as_str()),
            Identity::Uuid(uuid) => self
                .uuid
                .as_deref()
                .is_some_and(|u| u.eq_ignore_ascii_case(uuid)),
        }
    }

    pub fn display_name(&self) -> &str {
        let profile_name = self
            .profile
            .as_ref()
            .and_then(|p| p.name.as_deref())
            .filter(|n| !n.is_empty());
        if self.is_self {
            return profile_name
                .or(self.name.as_deref())
                .unwrap_or(SELF_CONTACT_NAME);
        }
        self.name
            .as_deref()
            .filter(|n| !n.is_empty() && *n != UNKNOWN_CONTACT)
            .or(profile_name)
            .unwrap_or(UNKNOWN_CONTACT)
    }

    /// Record activity from this contact. Last-seen only moves forward.
    pub fn seen(&mut self, when: Timestamp) {
        match self.last_seen {
            Some(last) if last >= when => {}
            _ => self.last_seen = Some(when),
        }
    }

    /// Merge a freshly synced view of the same contact. Name, blocked flag
    /// and expiration are last-write-wins; the self name is pinned.
    pub fn merge(&mut self, incoming: &Contact) {
        if !self.is_self {
            self.name = incoming.name.clone();
        }
        self.is_blocked = incoming.is_blocked;
        self.expiration = incoming.expiration;
        match (&mut self.profile, &incoming.profile) {
            (Some(existing), Some(new)) => existing.merge(new),
            (None, Some(new)) => self.profile = Some(new.clone()),
            _ => {}
        }
        for device in incoming.devices.iter() {
            self.devices.merge(device);
        }
        if let Some(when) = incoming.last_seen {
            self.seen(when);
        }
    }
}

// ----------------------------------------------------------------------------
// ContactRegistry
// ----------------------------------------------------------------------------

/// All contacts for one account, with number and UUID lookup indices.
///
/// Invariant: at most one contact per non-null number and per non-null UUID,
/// and the self contact always exists.
#[derive(Debug)]
pub struct ContactRegistry {
    account: String,
    contacts: Vec<Contact>,
    by_number: HashMap<String, usize>,
    by_uuid: HashMap<String, usize>,
    self_idx: usize,
    dirty: bool,
}

impl ContactRegistry {
    /// Create a registry holding only the self contact.
    pub fn new(account_number: &str) -> Self {
        let mut registry = Self {
            account: account_number.to_string(),
            contacts: Vec::new(),
            by_number: HashMap::new(),
            by_uuid: HashMap::new(),
            self_idx: 0,
            dirty: false,
        };
        let mut own = Contact::new(
            Some(SELF_CONTACT_NAME.to_string()),
            Some(account_number.to_string()),
            None,
        );
        own.is_self = true;
        registry.push(own);
        registry.dirty = false;
        registry
    }

    /// Rebuild a registry from persisted contacts, restoring the lookup
    /// indices and ensuring the self contact exists.
    pub fn from_contacts(account_number: &str, contacts: Vec<Contact>) -> Self {
        let mut registry = Self::new(account_number);
        for mut contact in contacts {
            if contact.number.as_deref() == Some(account_number) {
                contact.is_self = true;
                contact.name = Some(SELF_CONTACT_NAME.to_string());
                // Preserve the persisted UUID and profile on the self entry.
                registry.contacts[registry.self_idx] = contact;
                let idx = registry.self_idx;
                registry.reindex(idx);
            } else {
                registry.push(contact);
            }
        }
        registry.dirty = false;
        registry
    }

    fn push(&mut self, contact: Contact) -> usize {
        self.contacts.push(contact);
        let idx = self.contacts.len() - 1;
        self.reindex(idx);
        self.dirty = true;
        idx
    }

    fn reindex(&mut self, idx: usize) {
        if let Some(number) = &self.contacts[idx].number {
            self.by_number.insert(number.clone(), idx);
        }
        if let Some(uuid) = &self.contacts[idx].uuid {
            self.by_uuid.insert(uuid.to_ascii_lowercase(), idx);
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn index_of(&self, id: &Identity) -> Option<usize> {
        match id {
            Identity::Number(number) => self.by_number.get(number).copied(),
            Identity::Uuid(uuid) => self.by_uuid.get(&uuid.to_ascii_lowercase()).copied(),
        }
    }

    pub fn get(&self, id: &Identity) -> Option<&Contact> {
        self.index_of(id).map(|idx| &self.contacts[idx])
    }

    pub fn get_mut(&mut self, id: &Identity) -> Option<&mut Contact> {
        self.index_of(id).map(|idx| &mut self.contacts[idx])
    }

    pub fn get_at(&self, idx: usize) -> &Contact {
        &self.contacts[idx]
    }

    pub fn get_at_mut(&mut self, idx: usize) -> &mut Contact {
        self.dirty = true;
        &mut self.contacts[idx]
    }

    pub fn get_self(&self) -> &Contact {
        &self.contacts[self.self_idx]
    }

    pub fn get_self_mut(&mut self) -> &mut Contact {
        self.dirty = true;
        &mut self.contacts[self.self_idx]
    }

    /// The identity the engine uses when it is the sender.
    pub fn self_identity(&self) -> Identity {
        Identity::Number(self.account.clone())
    }

    /// Look a contact up by number first, then UUID, backfilling whichever
    /// of the two the stored entry is missing. Unknown identities become a
    /// new local entry with an empty device registry.
    ///
    /// Returns `(added, index)` where `added` is true only for new entries.
    pub fn get_or_add(
        &mut self,
        name: Option<&str>,
        number: Option<&str>,
        uuid: Option<&str>,
    ) -> Result<(bool, usize)> {
        let number = match number {
            Some(n) => match Identity::parse(n)? {
                Identity::Number(n) => Some(n),
                Identity::Uuid(_) => {
                    return Err(crate::errors::WirelineError::invalid_identity(n))
                }
            },
            None => None,
        };
        let uuid = match uuid {
            Some(u) => match Identity::parse(u)? {
                Identity::Uuid(u) => Some(u),
                Identity::Number(_) => {
                    return Err(crate::errors::WirelineError::invalid_identity(u))
                }
            },
            None => None,
        };
        if number.is_none() && uuid.is_none() {
            return Err(crate::errors::WirelineError::invalid_argument(
                "get_or_add requires a number or a UUID",
            ));
        }

        let found = number
            .as_ref()
            .and_then(|n| self.by_number.get(n).copied())
            .or_else(|| uuid.as_ref().and_then(|u| self.by_uuid.get(u).copied()));

        if let Some(idx) = found {
            let mut backfilled = false;
            if self.contacts[idx].number.is_none() && number.is_some() {
                self.contacts[idx].number = number;
                backfilled = true;
            }
            if self.contacts[idx].uuid.is_none() && uuid.is_some() {
                self.contacts[idx].uuid = uuid;
                backfilled = true;
            }
            if backfilled {
                self.reindex(idx);
                self.dirty = true;
                debug!(contact = %self.contacts[idx].display_name(), "backfilled contact identity");
            }
            if self.contacts[idx].name.is_none() {
                if let Some(name) = name.filter(|n| !n.is_empty()) {
                    self.contacts[idx].name = Some(name.to_string());
                    self.dirty = true;
                }
            }
            return Ok((false, idx));
        }

        let mut contact = Contact::new(
            name.filter(|n| !n.is_empty()).map(str::to_string),
            number.clone(),
            uuid,
        );
        if number.as_deref() == Some(self.account.as_str()) {
            contact.is_self = true;
            contact.name = Some(SELF_CONTACT_NAME.to_string());
        }
        debug!(contact = %contact.display_name(), "adding new contact");
        Ok((true, self.push(contact)))
    }

    /// [`Self::get_or_add`] for a single pre-parsed identity.
    pub fn get_or_add_id(&mut self, name: Option<&str>, id: &Identity) -> Result<(bool, usize)> {
        match id {
            Identity::Number(n) => self.get_or_add(name, Some(n), None),
            Identity::Uuid(u) => self.get_or_add(name, None, Some(u)),
        }
    }

    /// True when the two identities resolve to the same contact. Falls back
    /// to plain equality when neither identity is known yet.
    pub fn same_contact(&self, a: &Identity, b: &Identity) -> bool {
        match (self.index_of(a), self.index_of(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        }
    }

    /// Merge a full contact list from the daemon. Returns how many entries
    /// were new.
    pub fn sync_merge(&mut self, incoming: Vec<Contact>) -> usize {
        let mut added = 0;
        for contact in incoming {
            let found = contact
                .number
                .as_ref()
                .and_then(|n| self.by_number.get(n).copied())
                .or_else(|| {
                    contact
                        .uuid
                        .as_ref()
                        .and_then(|u| self.by_uuid.get(&u.to_ascii_lowercase()).copied())
                });
            match found {
                Some(idx) => {
                    if self.contacts[idx].number.is_none() {
                        self.contacts[idx].number = contact.number.clone();
                    }
                    if self.contacts[idx].uuid.is_none() {
                        self.contacts[idx].uuid = contact.uuid.clone();
                    }
                    self.contacts[idx].merge(&contact);
                    self.reindex(idx);
                }
                None => {
                    let mut contact = contact;
                    if contact.number.as_deref() == Some(self.account.as_str()) {
                        contact.is_self = true;
                        contact.name = Some(SELF_CONTACT_NAME.to_string());
                    }
                    self.push(contact);
                    added += 1;
                }
            }
        }
        if added > 0 {
            self.dirty = true;
        }
        added
    }

    /// Apply an authoritative blocked-contacts list: listed entries become
    /// blocked, everything else unblocked.
    pub fn set_blocked(&mut self, blocked: &[Identity]) {
        let indices: Vec<usize> = blocked.iter().filter_map(|id| self.index_of(id)).collect();
        for (idx, contact) in self.contacts.iter_mut().enumerate() {
            contact.is_blocked = indices.contains(&idx);
        }
        self.dirty = true;
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// True when the registry changed since the last snapshot, clearing the
    /// flag. The dispatcher persists when this returns true.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
