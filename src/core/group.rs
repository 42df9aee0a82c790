//! Group membership index
//!
//! Each group maps to its member set; each connection carries the set of
//! groups it joined. Every edge change happens while the connection's own lock
//! is held, and the group side is then updated under the group's shard lock,
//! so c ∈ members(g) ⇔ g ∈ joined(c) holds whenever no edit is in flight.
//! Lock order is always connection, then group shard.

use std::collections::HashSet;

use dashmap::DashMap;

use crate::core::connection::{Connection, ConnectionId, ConnectionPhase};
use crate::error::{HubError, Result};

/// Manages all active groups in the hub
#[derive(Debug, Default)]
pub struct GroupIndex {
    /// Group name to member connection ids; an entry exists only while non-empty
    groups: DashMap<String, HashSet<ConnectionId>>,
}

impl GroupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection to a group, creating the group on first join.
    ///
    /// Returns `Ok(true)` when a new edge was created and `Ok(false)` when the
    /// connection was already a member.
    pub fn join(&self, connection: &Connection, group: &str) -> Result<bool> {
        let mut state = connection.lock_state();
        if state.phase == ConnectionPhase::Disconnected {
            return Err(HubError::UnknownConnection(connection.id().clone()));
        }
        if !state.groups.insert(group.to_string()) {
            return Ok(false);
        }

        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(connection.id().clone());

        Ok(true)
    }

    /// Removes a connection from a group, deleting the group once empty.
    ///
    /// Returns false if the edge did not exist.
    pub fn leave(&self, connection: &Connection, group: &str) -> bool {
        let mut state = connection.lock_state();
        if !state.groups.remove(group) {
            return false;
        }
        self.remove_edge(connection.id(), group);
        true
    }

    /// Drop every edge of a connection that is being torn down.
    /// Caller holds the connection lock and has already taken its group set.
    pub(crate) fn detach(&self, id: &ConnectionId, groups: HashSet<String>) {
        for group in groups {
            self.remove_edge(id, &group);
        }
    }

    fn remove_edge(&self, id: &ConnectionId, group: &str) {
        if let Some(mut members) = self.groups.get_mut(group) {
            members.remove(id);
        }
        // Re-checked under the shard lock; a concurrent join may have refilled it.
        self.groups.remove_if(group, |_, members| members.is_empty());
    }

    /// Snapshot of a group's members; unknown groups are empty
    pub fn members_of(&self, group: &str) -> HashSet<ConnectionId> {
        self.groups
            .get(group)
            .map(|members| members.value().clone())
            .unwrap_or_default()
    }

    pub fn contains_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Owned copy of the whole index, taken without holding any connection lock
    pub(crate) fn snapshot(&self) -> Vec<(String, HashSet<ConnectionId>)> {
        self.groups
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
