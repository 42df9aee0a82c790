use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;

use crate::core::connection::{Connection, ConnectionId, ConnectionPhase, OutboundReceiver};
use crate::core::group::GroupIndex;
use crate::error::{HubError, Result};

/// Owns every live connection, the user-identity index and the group index
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    /// User id to the connections bound to it (several devices per user)
    users: DashMap<String, HashSet<ConnectionId>>,
    groups: GroupIndex,
    outbound_queue_size: usize,
}

impl ConnectionRegistry {
    pub fn new(outbound_queue_size: usize) -> Self {
        Self {
            connections: DashMap::new(),
            users: DashMap::new(),
            groups: GroupIndex::new(),
            outbound_queue_size: outbound_queue_size.max(1),
        }
    }

    // Register a new connection; the receiver feeds its delivery worker
    pub(crate) fn register(&self, id: ConnectionId) -> Result<(Arc<Connection>, OutboundReceiver)> {
        match self.connections.entry(id.clone()) {
            Entry::Occupied(_) => Err(HubError::DuplicateConnection(id)),
            Entry::Vacant(slot) => {
                let (connection, rx) = Connection::new(id, self.outbound_queue_size);
                let connection = Arc::new(connection);
                slot.insert(Arc::clone(&connection));
                debug!("Registered connection {}", connection.id());
                Ok((connection, rx))
            }
        }
    }

    /// Bind (or rebind) a connection to a user identity
    pub fn bind_user(&self, id: &ConnectionId, user_id: &str) -> Result<()> {
        let connection = self
            .get(id)
            .ok_or_else(|| HubError::UnknownConnection(id.clone()))?;

        let mut state = connection.lock_state();
        if state.phase == ConnectionPhase::Disconnected {
            return Err(HubError::UnknownConnection(id.clone()));
        }
        if state.user_id.as_deref() == Some(user_id) {
            return Ok(());
        }
        if let Some(previous) = state.user_id.replace(user_id.to_string()) {
            self.unbind_user(id, &previous);
        }
        self.users
            .entry(user_id.to_string())
            .or_default()
            .insert(id.clone());

        debug!("Connection {} bound to user {}", id, user_id);
        Ok(())
    }

    fn unbind_user(&self, id: &ConnectionId, user_id: &str) {
        if let Some(mut ids) = self.users.get_mut(user_id) {
            ids.remove(id);
        }
        self.users.remove_if(user_id, |_, ids| ids.is_empty());
    }

    /// Remove a connection with all of its membership edges.
    ///
    /// Unknown ids are a no-op and return `None`.
    pub fn deregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let (_, connection) = self.connections.remove(id)?;

        {
            let mut state = connection.lock_state();
            state.phase = ConnectionPhase::Disconnected;
            if let Some(user_id) = state.user_id.take() {
                self.unbind_user(id, &user_id);
            }
            let groups = std::mem::take(&mut state.groups);
            self.groups.detach(id, groups);
        }
        connection.close();

        debug!("Deregistered connection {}", id);
        Some(connection)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn is_live(&self, id: &ConnectionId) -> bool {
        self.connections
            .get(id)
            .map(|entry| entry.value().is_live())
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Every connection still eligible for delivery
    pub fn live_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().is_live())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Live connections bound to a user
    pub fn live_connections_of_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<ConnectionId> = self
            .users
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        self.resolve_live(ids)
    }

    /// Live members of a group; unknown groups resolve to nothing
    pub fn live_members_of(&self, group: &str) -> Vec<Arc<Connection>> {
        self.resolve_live(self.groups.members_of(group))
    }

    fn resolve_live<I>(&self, ids: I) -> Vec<Arc<Connection>>
    where
        I: IntoIterator<Item = ConnectionId>,
    {
        ids.into_iter()
            .filter_map(|id| self.get(&id))
            .filter(|connection| connection.is_live())
            .collect()
    }

    pub fn groups(&self) -> &GroupIndex {
        &self.groups
    }

    /// Check c ∈ members(g) ⇔ g ∈ joined(c) across the whole hub.
    /// Only meaningful when no membership edit is in flight.
    pub fn is_consistent(&self) -> bool {
        let snapshot = self.groups.snapshot();

        for (group, members) in &snapshot {
            if members.is_empty() {
                return false;
            }
            for id in members {
                match self.get(id) {
                    Some(connection) if connection.joined_groups().contains(group) => {}
                    _ => return false,
                }
            }
        }

        for connection in self.connections.iter().map(|e| Arc::clone(e.value())).collect::<Vec<_>>() {
            for group in connection.joined_groups() {
                let listed = snapshot
                    .iter()
                    .any(|(name, members)| *name == group && members.contains(connection.id()));
                if !listed {
                    return false;
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> ConnectionId {
        ConnectionId::from(value)
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = ConnectionRegistry::new(8);
        let (conn, _rx) = registry.register(id("A")).unwrap();
        assert!(conn.is_live());
        assert_eq!(conn.failure_count(), 0);

        let result = registry.register(id("A"));
        assert!(matches!(result, Err(HubError::DuplicateConnection(_))));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_bind_unknown_connection() {
        let registry = ConnectionRegistry::new(8);
        let result = registry.bind_user(&id("ghost"), "bob");
        assert!(matches!(result, Err(HubError::UnknownConnection(_))));
    }

    #[test]
    fn test_user_with_multiple_devices() {
        let registry = ConnectionRegistry::new(8);
        let _a = registry.register(id("phone")).unwrap();
        let _b = registry.register(id("laptop")).unwrap();
        registry.bind_user(&id("phone"), "bob").unwrap();
        registry.bind_user(&id("laptop"), "bob").unwrap();

        assert_eq!(registry.live_connections_of_user("bob").len(), 2);
        assert!(registry.live_connections_of_user("alice").is_empty());
    }

    #[test]
    fn test_rebind_moves_user_index() {
        let registry = ConnectionRegistry::new(8);
        let _a = registry.register(id("A")).unwrap();
        registry.bind_user(&id("A"), "bob").unwrap();
        registry.bind_user(&id("A"), "carol").unwrap();

        assert!(registry.live_connections_of_user("bob").is_empty());
        assert_eq!(registry.live_connections_of_user("carol").len(), 1);
    }

    #[test]
    fn test_deregister_removes_edges_and_empty_groups() {
        let registry = ConnectionRegistry::new(8);
        let (a, _rx_a) = registry.register(id("A")).unwrap();
        let (b, _rx_b) = registry.register(id("B")).unwrap();
        registry.groups().join(&a, "team").unwrap();
        registry.groups().join(&b, "team").unwrap();
        registry.groups().join(&a, "solo").unwrap();

        let removed = registry.deregister(&id("A")).unwrap();
        assert!(!removed.is_live());
        assert!(!registry.contains(&id("A")));
        assert!(!registry.groups().contains_group("solo"));
        assert_eq!(registry.groups().members_of("team").len(), 1);
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let registry = ConnectionRegistry::new(8);
        let _a = registry.register(id("A")).unwrap();
        registry.bind_user(&id("A"), "bob").unwrap();

        assert!(registry.deregister(&id("A")).is_some());
        assert!(registry.deregister(&id("A")).is_none());
        assert!(!registry.is_live(&id("A")));
        assert!(registry.live_connections_of_user("bob").is_empty());
    }

    #[test]
    fn test_dead_connections_excluded_from_resolution() {
        let registry = ConnectionRegistry::new(8);
        let (a, _rx_a) = registry.register(id("A")).unwrap();
        let _b = registry.register(id("B")).unwrap();
        registry.groups().join(&a, "team").unwrap();

        a.mark_dead();
        assert_eq!(registry.live_connections().len(), 1);
        assert!(registry.live_members_of("team").is_empty());
        assert!(registry.contains(&id("A")));
    }
}
