//! Subscription registry
//!
//! Routes value-changed notifications back to the characteristic whose
//! subscribe request produced the subscription id.

use crate::domain::models::CharacteristicRef;
use crate::infrastructure::bluetooth::protocol::RemoteId;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<RemoteId, CharacteristicRef>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: RemoteId, target: CharacteristicRef) -> Option<CharacteristicRef> {
        self.entries.insert(id, target)
    }

    pub fn lookup(&self, id: &RemoteId) -> Option<&CharacteristicRef> {
        self.entries.get(id)
    }

    pub fn unregister(&mut self, id: &RemoteId) -> Option<CharacteristicRef> {
        self.entries.remove(id)
    }

    /// Drop every subscription on `target`. The unsubscribe response
    /// doesn't echo the subscription id, so entries are found by value.
    pub fn unregister_target(&mut self, target: &CharacteristicRef) -> Vec<RemoteId> {
        self.remove_where(|entry| entry == target)
    }

    /// Drop every subscription of a device that went away
    pub fn remove_device(&mut self, address: &str) -> Vec<RemoteId> {
        self.remove_where(|entry| entry.address == address)
    }

    fn remove_where(&mut self, matches: impl Fn(&CharacteristicRef) -> bool) -> Vec<RemoteId> {
        let ids: Vec<RemoteId> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches(*entry))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.unregister(id);
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
