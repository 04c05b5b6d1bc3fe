//! Routing table: participant id → next-hop address.
//!
//! Entries carry a visibility flag, a sticky flag that protects them from
//! cleanup, and a refcount so multiple multicast subscriptions can share one
//! entry without tearing it down early.

use std::collections::HashMap;

use crate::address::Address;

/// One next-hop entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    pub address: Address,
    pub is_globally_visible: bool,
    /// Sticky entries survive [`RoutingTable::purge`].
    pub is_sticky: bool,
    /// Number of registrations sharing this entry.
    pub refcount: u32,
    /// Broker groups this entry is valid for (MQTT addresses only).
    pub gbids: Vec<String>,
}

/// Participant id → [`RoutingEntry`] map.
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: HashMap<String, RoutingEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update the entry for `participant_id`.
    ///
    /// Re-adding the same address bumps the refcount; a different address
    /// replaces the entry and resets the refcount.
    pub fn add(
        &mut self,
        participant_id: &str,
        address: Address,
        is_globally_visible: bool,
    ) {
        self.add_with_gbids(participant_id, address, is_globally_visible, Vec::new());
    }

    pub fn add_with_gbids(
        &mut self,
        participant_id: &str,
        address: Address,
        is_globally_visible: bool,
        gbids: Vec<String>,
    ) {
        match self.entries.get_mut(participant_id) {
            Some(entry) if entry.address == address => {
                entry.refcount += 1;
                entry.is_globally_visible = is_globally_visible;
            }
            _ => {
                self.entries.insert(
                    participant_id.to_owned(),
                    RoutingEntry {
                        address,
                        is_globally_visible,
                        is_sticky: false,
                        refcount: 1,
                        gbids,
                    },
                );
            }
        }
    }

    /// Mark an entry as surviving [`RoutingTable::purge`].
    pub fn set_sticky(&mut self, participant_id: &str, sticky: bool) {
        if let Some(entry) = self.entries.get_mut(participant_id) {
            entry.is_sticky = sticky;
        }
    }

    pub fn lookup(&self, participant_id: &str) -> Option<&RoutingEntry> {
        self.entries.get(participant_id)
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.entries.contains_key(participant_id)
    }

    /// Drop one reference; the entry goes away when the refcount reaches
    /// zero. Returns `true` if the entry was removed entirely.
    pub fn remove(&mut self, participant_id: &str) -> bool {
        let Some(entry) = self.entries.get_mut(participant_id) else {
            return false;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            self.entries.remove(participant_id);
            true
        } else {
            false
        }
    }

    /// Remove every non-sticky entry.
    pub fn purge(&mut self) {
        self.entries.retain(|_, entry| entry.is_sticky);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
