//! Per-contact device tracking
//!
//! Every contact carries a small registry of the devices linked to their
//! account, keyed by the daemon's integer device id.

use serde::{Deserialize, Serialize};

use crate::types::{DeviceId, Timestamp};

// ----------------------------------------------------------------------------
// Device
// ----------------------------------------------------------------------------

/// A single linked device belonging to a contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub name: Option<String>,
    pub created: Option<Timestamp>,
    pub last_seen: Option<Timestamp>,
    #[serde(default)]
    pub is_account_device: bool,
    #[serde(default)]
    pub is_primary: bool,
}

impl Device {
    pub fn new(id: DeviceId, created: Option<Timestamp>) -> Self {
        Self {
            id,
            name: None,
            created,
            last_seen: None,
            is_account_device: false,
            is_primary: id.is_primary(),
        }
    }

    /// Record activity from this device. Last-seen only moves forward.
    pub fn seen(&mut self, when: Timestamp) {
        match self.last_seen {
            Some(last) if last >= when => {}
            _ => self.last_seen = Some(when),
        }
    }

    /// Merge a freshly synced view of the same device.
    pub fn merge(&mut self, incoming: &Device) {
        if self.name.is_none() {
            self.name = incoming.name.clone();
        }
        if incoming.created.is_some() && self.created != incoming.created {
            self.created = incoming.created;
        }
        if let Some(when) = incoming.last_seen {
            self.seen(when);
        }
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => format!("{}<{}>", self.id, name),
            None => format!("{}<unnamed>", self.id),
        }
    }
}

// ----------------------------------------------------------------------------
// DeviceRegistry
// ----------------------------------------------------------------------------

/// The devices known for one contact, keyed by device id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.id == id)
    }

    /// Look up a device by id, creating it if unseen. New devices get
    /// `created = now`.
    pub fn get_or_add(&mut self, id: DeviceId) -> (bool, &mut Device) {
        if let Some(pos) = self.devices.iter().position(|d| d.id == id) {
            return (false, &mut self.devices[pos]);
        }
        self.devices.push(Device::new(id, Some(Timestamp::now())));
        let last = self.devices.len() - 1;
        (true, &mut self.devices[last])
    }

    /// Merge a synced device, adding it if absent. Returns true when the
    /// device was new.
    pub fn merge(&mut self, incoming: &Device) -> bool {
        match self.get_mut(incoming.id) {
            Some(existing) => {
                existing.merge(incoming);
                false
            }
            None => {
                self.devices.push(incoming.clone());
                true
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_add_creates_once() {
        let mut devices = DeviceRegistry::new();
        let (added, device) = devices.get_or_add(DeviceId::new(2));
        assert!(added);
        assert!(device.created.is_some());

        let (added, _) = devices.get_or_add(DeviceId::new(2));
        assert!(!added);
        assert_eq!(devices.len(), 1);
    }

    #[test]
    fn seen_only_moves_forward() {
        let mut device = Device::new(DeviceId::PRIMARY, None);
        device.seen(Timestamp::new(2_000));
        device.seen(Timestamp::new(1_000));
        assert_eq!(device.last_seen, Some(Timestamp::new(2_000)));
    }

    #[test]
    fn merge_fills_missing_name() {
        let mut devices = DeviceRegistry::new();
        devices.get_or_add(DeviceId::new(3));

        let mut incoming = Device::new(DeviceId::new(3), None);
        incoming.name = Some("laptop".to_string());
        assert!(!devices.merge(&incoming));
        assert_eq!(
            devices.get(DeviceId::new(3)).unwrap().name.as_deref(),
            Some("laptop")
        );
    }
}
