//! Username registry for routing
//!
//! Maps each active username to the slots logged in under it, so direct and
//! group messages resolve a recipient without scanning the whole table.
//!
//! Several slots may share a name (the allow-list does not enforce
//! uniqueness). Lookups then pick the lowest slot index, which is the first
//! match in table order.

use std::collections::{BTreeSet, HashMap};

use crate::slots::SlotId;

/// Routing index from username to active slots
#[derive(Debug, Default)]
pub struct Registry {
    by_name: HashMap<String, BTreeSet<SlotId>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            by_name: HashMap::new(),
        }
    }

    /// Record that `slot` is now active as `username`
    pub fn register(&mut self, username: &str, slot: SlotId) {
        log::debug!("Registering '{}' at slot {}", username, slot);
        self.by_name
            .entry(username.to_string())
            .or_default()
            .insert(slot);
    }

    /// Forget `slot` when its connection closes
    pub fn unregister(&mut self, username: &str, slot: SlotId) {
        if let Some(slots) = self.by_name.get_mut(username) {
            slots.remove(&slot);
            if slots.is_empty() {
                self.by_name.remove(username);
            }
            log::debug!("Unregistered '{}' from slot {}", username, slot);
        }
    }

    /// The first slot (in table order) active under `username`
    pub fn find(&self, username: &str) -> Option<SlotId> {
        self.by_name
            .get(username)
            .and_then(|slots| slots.iter().next().copied())
    }

    pub fn contains(&self, username: &str) -> bool {
        self.by_name.contains_key(username)
    }
}
