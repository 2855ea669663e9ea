//! Device handle table
//!
//! Maps host-facing addresses to the handles the BLE server assigned on
//! connect. Entries are only created from a confirmed connect.

use crate::infrastructure::bluetooth::protocol::RemoteId;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct DeviceTable {
    handles: HashMap<String, RemoteId>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the handle of a freshly connected device, returning the one it replaces
    pub fn put(&mut self, address: &str, handle: RemoteId) -> Option<RemoteId> {
        self.handles.insert(address.to_string(), handle)
    }

    pub fn get(&self, address: &str) -> Option<&RemoteId> {
        self.handles.get(address)
    }

    pub fn remove(&mut self, address: &str) -> Option<RemoteId> {
        self.handles.remove(address)
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.handles.contains_key(address)
    }

    /// Every address currently mapped to `handle`.
    ///
    /// Handles should be unique, but nothing here enforces it, so this scans
    /// all entries.
    pub fn addresses_for(&self, handle: &RemoteId) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .handles
            .iter()
            .filter(|(_, h)| *h == handle)
            .map(|(address, _)| address.clone())
            .collect();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let mut table = DeviceTable::new();
        assert!(table.get("AA:BB:CC:DD:EE:FF").is_none());

        table.put("AA:BB:CC:DD:EE:FF", "handle-1".into());
        assert_eq!(table.get("AA:BB:CC:DD:EE:FF"), Some(&RemoteId::from("handle-1")));
        assert!(table.is_connected("AA:BB:CC:DD:EE:FF"));

        assert_eq!(table.remove("AA:BB:CC:DD:EE:FF"), Some("handle-1".into()));
        assert!(!table.is_connected("AA:BB:CC:DD:EE:FF"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_reconnect_replaces_handle() {
        let mut table = DeviceTable::new();
        table.put("11:22:33:44:55:66", RemoteId::Unsigned(1));
        let old = table.put("11:22:33:44:55:66", RemoteId::Unsigned(2));
        assert_eq!(old, Some(RemoteId::Unsigned(1)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_addresses_for_scans_by_value() {
        let mut table = DeviceTable::new();
        table.put("B", RemoteId::Unsigned(7));
        table.put("A", RemoteId::Unsigned(7));
        table.put("C", RemoteId::Unsigned(8));

        assert_eq!(table.addresses_for(&RemoteId::Unsigned(7)), vec!["A", "B"]);
        assert!(table.addresses_for(&RemoteId::Unsigned(9)).is_empty());
    }
}
