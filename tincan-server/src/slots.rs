//! Connection table for the TinCan server
//!
//! A fixed number of slots, each either free or holding exactly one live
//! connection. A slot's index is the connection's identity for as long as it
//! stays connected.

use std::net::SocketAddr;

use crate::protocol::LineBuffer;
use crate::registry::Registry;

/// Index of a slot in the connection table
pub type SlotId = usize;

// ============================================================================
// Slot
// ============================================================================

/// Handshake state of an occupied slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Accepted, waiting for a username
    Pending,
    /// Logged in and allowed to chat
    Active,
}

/// One occupied entry of the connection table
#[derive(Debug)]
pub struct Slot<S> {
    /// The connection handle, owned by the slot
    pub conn: S,
    /// Remote address at accept time
    pub peer_addr: SocketAddr,
    /// Handshake state
    pub state: SlotState,
    /// Empty until the handshake completes
    pub username: String,
    /// Partial inbound line data
    pub inbound: LineBuffer,
    /// Bytes waiting for the socket to become writable
    pub outbound: Vec<u8>,
    /// Writable interest is currently registered
    pub write_interest: bool,
    /// A send failed; the slot will be freed after the current event
    pub closing: bool,
}

impl<S> Slot<S> {
    fn new(conn: S, peer_addr: SocketAddr, max_line_len: usize) -> Self {
        Slot {
            conn,
            peer_addr,
            state: SlotState::Pending,
            username: String::new(),
            inbound: LineBuffer::new(max_line_len),
            outbound: Vec::new(),
            write_interest: false,
            closing: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SlotState::Active
    }

    /// Username for log output
    pub fn display_name(&self) -> &str {
        if self.username.is_empty() {
            "[unauthenticated]"
        } else {
            &self.username
        }
    }
}

// ============================================================================
// Connection Table
// ============================================================================

/// Fixed-capacity table of connection slots
#[derive(Debug)]
pub struct ConnectionTable<S> {
    slots: Vec<Option<Slot<S>>>,
    registry: Registry,
    max_line_len: usize,
}

impl<S> ConnectionTable<S> {
    pub fn new(capacity: usize, max_line_len: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        ConnectionTable {
            slots,
            registry: Registry::new(),
            max_line_len,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Place a new connection in the lowest free slot.
    ///
    /// Hands the connection back when every slot is taken.
    pub fn occupy(&mut self, conn: S, peer_addr: SocketAddr) -> Result<SlotId, S> {
        match self.slots.iter().position(|s| s.is_none()) {
            Some(id) => {
                self.slots[id] = Some(Slot::new(conn, peer_addr, self.max_line_len));
                Ok(id)
            }
            None => Err(conn),
        }
    }

    pub fn get(&self, id: SlotId) -> Option<&Slot<S>> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut Slot<S>> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    /// Complete the handshake for a pending slot.
    ///
    /// Returns false if the slot is free, already active, or the name is empty.
    pub fn activate(&mut self, id: SlotId, username: &str) -> bool {
        if username.is_empty() {
            return false;
        }
        let Some(slot) = self.get_mut(id) else {
            return false;
        };
        if slot.is_active() {
            return false;
        }
        slot.state = SlotState::Active;
        slot.username = username.to_string();
        self.registry.register(username, id);
        true
    }

    /// Empty a slot, returning what it held
    pub fn free(&mut self, id: SlotId) -> Option<Slot<S>> {
        let slot = self.slots.get_mut(id)?.take()?;
        if slot.is_active() {
            self.registry.unregister(&slot.username, id);
        }
        Some(slot)
    }

    /// First active slot (in table order) logged in as `username`
    pub fn find_active(&self, username: &str) -> Option<SlotId> {
        self.registry.find(username)
    }

    pub fn is_name_active(&self, username: &str) -> bool {
        self.registry.contains(username)
    }

    pub fn username(&self, id: SlotId) -> Option<&str> {
        self.get(id)
            .filter(|s| s.is_active())
            .map(|s| s.username.as_str())
    }

    /// Active slots in table order
    pub fn active_ids(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref().is_some_and(Slot::is_active))
            .map(|(id, _)| id)
            .collect()
    }

    /// Occupied slots in table order
    pub fn occupied_ids(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_occupy_lowest_free_slot() {
        let mut table: ConnectionTable<()> = ConnectionTable::new(3, 64);
        assert_eq!(table.occupy((), addr()), Ok(0));
        assert_eq!(table.occupy((), addr()), Ok(1));
        table.free(0);
        assert_eq!(table.occupy((), addr()), Ok(0));
        assert_eq!(table.occupied(), 2);
    }

    #[test]
    fn test_full_table_returns_connection() {
        let mut table: ConnectionTable<u32> = ConnectionTable::new(2, 64);
        table.occupy(1, addr()).unwrap();
        table.occupy(2, addr()).unwrap();
        assert_eq!(table.occupy(3, addr()), Err(3));
        assert_eq!(table.occupied(), table.capacity());
    }

    #[test]
    fn test_new_slot_is_pending_and_nameless() {
        let mut table: ConnectionTable<()> = ConnectionTable::new(1, 64);
        let id = table.occupy((), addr()).unwrap();
        let slot = table.get(id).unwrap();
        assert_eq!(slot.state, SlotState::Pending);
        assert!(slot.username.is_empty());
        assert_eq!(slot.display_name(), "[unauthenticated]");
        assert!(table.active_ids().is_empty());
        assert_eq!(table.username(id), None);
    }

    #[test]
    fn test_activate_and_find() {
        let mut table: ConnectionTable<()> = ConnectionTable::new(3, 64);
        let a = table.occupy((), addr()).unwrap();
        let b = table.occupy((), addr()).unwrap();
        assert!(table.activate(b, "bob"));
        assert!(table.activate(a, "alice"));

        assert_eq!(table.find_active("bob"), Some(b));
        assert_eq!(table.username(a), Some("alice"));
        assert_eq!(table.active_ids(), vec![a, b]);
        assert!(!table.activate(a, "again"));
    }

    #[test]
    fn test_activate_rejects_empty_name() {
        let mut table: ConnectionTable<()> = ConnectionTable::new(1, 64);
        let id = table.occupy((), addr()).unwrap();
        assert!(!table.activate(id, ""));
        assert_eq!(table.get(id).unwrap().state, SlotState::Pending);
    }

    #[test]
    fn test_free_clears_registry() {
        let mut table: ConnectionTable<()> = ConnectionTable::new(2, 64);
        let id = table.occupy((), addr()).unwrap();
        table.activate(id, "alice");
        let slot = table.free(id).unwrap();
        assert_eq!(slot.username, "alice");
        assert!(table.get(id).is_none());
        assert!(!table.is_name_active("alice"));
        assert!(table.free(id).is_none());
    }

    #[test]
    fn test_duplicate_names_first_in_table_order() {
        let mut table: ConnectionTable<()> = ConnectionTable::new(3, 64);
        let a = table.occupy((), addr()).unwrap();
        let b = table.occupy((), addr()).unwrap();
        table.activate(b, "alice");
        table.activate(a, "alice");
        assert_eq!(table.find_active("alice"), Some(a));
        table.free(a);
        assert_eq!(table.find_active("alice"), Some(b));
    }
}
