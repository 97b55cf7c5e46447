//! Group identity resolution
//!
//! Groups are simpler than contacts: the daemon's group id is the only key.
//! Membership lists are replaced wholesale on sync, never unioned, because
//! the daemon's view is authoritative.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{GroupId, Identity, Timestamp};

// ----------------------------------------------------------------------------
// Group
// ----------------------------------------------------------------------------

/// One group the account belongs to or has observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub is_member: bool,
    pub expiration: Option<u64>,
    pub link: Option<String>,
    #[serde(default)]
    pub members: Vec<Identity>,
    #[serde(default)]
    pub pending: Vec<Identity>,
    #[serde(default)]
    pub requesting: Vec<Identity>,
    #[serde(default)]
    pub admins: Vec<Identity>,
    #[serde(default)]
    pub banned: Vec<Identity>,
    pub permission_add_member: Option<String>,
    pub permission_edit_details: Option<String>,
    pub permission_send_message: Option<String>,
    pub last_seen: Option<Timestamp>,
}

impl Group {
    pub fn new(id: GroupId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            description: None,
            is_blocked: false,
            is_member: false,
            expiration: None,
            link: None,
            members: Vec::new(),
            pending: Vec::new(),
            requesting: Vec::new(),
            admins: Vec::new(),
            banned: Vec::new(),
            permission_add_member: None,
            permission_edit_details: None,
            permission_send_message: None,
            last_seen: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or("<UNKNOWN-GROUP>")
    }

    /// Record activity in this group. Last-seen only moves forward.
    pub fn seen(&mut self, when: Timestamp) {
        match self.last_seen {
            Some(last) if last >= when => {}
            _ => self.last_seen = Some(when),
        }
    }

    /// Merge a freshly synced view of the same group. Scalar fields are
    /// last-write-wins; member lists are replaced, never unioned.
    pub fn merge(&mut self, incoming: &Group) {
        self.name = incoming.name.clone();
        self.description = incoming.description.clone();
        self.is_blocked = incoming.is_blocked;
        self.is_member = incoming.is_member;
        self.expiration = incoming.expiration;
        self.link = incoming.link.clone();
        self.members = incoming.members.clone();
        self.pending = incoming.pending.clone();
        self.requesting = incoming.requesting.clone();
        self.admins = incoming.admins.clone();
        self.banned = incoming.banned.clone();
        self.permission_add_member = incoming.permission_add_member.clone();
        self.permission_edit_details = incoming.permission_edit_details.clone();
        self.permission_send_message = incoming.permission_send_message.clone();
        if let Some(when) = incoming.last_seen {
            self.seen(when);
        }
    }
}

// ----------------------------------------------------------------------------
// GroupRegistry
// ----------------------------------------------------------------------------

/// All groups for one account, with an id lookup index.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: Vec<Group>,
    by_id: HashMap<String, usize>,
    dirty: bool,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from persisted groups.
    pub fn from_groups(groups: Vec<Group>) -> Self {
        let mut registry = Self::new();
        for group in groups {
            registry.push(group);
        }
        registry.dirty = false;
        registry
    }

    fn push(&mut self, group: Group) -> usize {
        self.groups.push(group);
        let idx = self.groups.len() - 1;
        self.by_id.insert(self.groups[idx].id.as_str().to_string(), idx);
        self.dirty = true;
        idx
    }

    pub fn index_of(&self, id: &GroupId) -> Option<usize> {
        self.by_id.get(id.as_str()).copied()
    }

    pub fn get(&self, id: &GroupId) -> Option<&Group> {
        self.index_of(id).map(|idx| &self.groups[idx])
    }

    pub fn get_mut(&mut self, id: &GroupId) -> Option<&mut Group> {
        let idx = self.index_of(id)?;
        self.dirty = true;
        Some(&mut self.groups[idx])
    }

    pub fn get_at(&self, idx: usize) -> &Group {
        &self.groups[idx]
    }

    /// Look a group up by id, creating an empty local entry if unseen.
    /// Returns `(added, index)`.
    pub fn get_or_add(&mut self, name: Option<&str>, id: &GroupId) -> (bool, usize) {
        if let Some(idx) = self.index_of(id) {
            if self.groups[idx].name.is_none() {
                if let Some(name) = name.filter(|n| !n.is_empty()) {
                    self.groups[idx].name = Some(name.to_string());
                    self.dirty = true;
                }
            }
            return (false, idx);
        }
        debug!(group = %id, "adding new group");
        let group = Group::new(
            id.clone(),
            name.filter(|n| !n.is_empty()).map(str::to_string),
        );
        (true, self.push(group))
    }

    /// Merge a full group list from the daemon. Returns how many entries
    /// were new.
    pub fn sync_merge(&mut self, incoming: Vec<Group>) -> usize {
        let mut added = 0;
        for group in incoming {
            match self.index_of(&group.id) {
                Some(idx) => {
                    self.groups[idx].merge(&group);
                    self.dirty = true;
                }
                None => {
                    self.push(group);
                    added += 1;
                }
            }
        }
        added
    }

    /// Apply an authoritative blocked-groups list.
    pub fn set_blocked(&mut self, blocked: &[GroupId]) {
        let indices: Vec<usize> = blocked.iter().filter_map(|id| self.index_of(id)).collect();
        for (idx, group) in self.groups.iter_mut().enumerate() {
            group.is_blocked = indices.contains(&idx);
        }
        self.dirty = true;
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// True when the registry changed since the last snapshot, clearing the
    /// flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
