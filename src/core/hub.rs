//! Lifecycle coordinator that ties the registry, group index and dispatch engine together
//!
//! Every connection moves `Connecting -> Connected -> Disconnected`; all
//! registry and membership mutation goes through this type so teardown
//! (client close, transport error or eviction) follows a single path.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::core::connection::{Connection, ConnectionId};
use crate::core::dispatch::{DispatchReport, Dispatcher};
use crate::core::envelope::{Envelope, Target};
use crate::core::message_types::{ClientCommand, ServerMessage};
use crate::core::registry::ConnectionRegistry;
use crate::core::transport::Transport;
use crate::error::{HubError, Result};

/// Why a connection entered `Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    TransportError,
    Evicted,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => write!(f, "client closed"),
            Self::TransportError => write!(f, "transport error"),
            Self::Evicted => write!(f, "evicted"),
        }
    }
}

/// Notification hub: connection lifecycle, group membership and fan-out
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    dispatcher: Dispatcher,
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
}

impl Hub {
    /// Create a hub delivering through `transport` and start its eviction worker.
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &HubConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(config.outbound_queue_size));
        let (evictions_tx, evictions_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            config,
            evictions_tx,
        );

        let hub = Arc::new(Self {
            registry,
            dispatcher,
            transport,
            shutdown: CancellationToken::new(),
        });
        Self::start_eviction_worker(Arc::downgrade(&hub), evictions_rx, hub.shutdown.clone());

        info!(
            "Hub started (eviction threshold {}, delivery timeout {:?})",
            config.eviction_threshold, config.delivery_timeout
        );
        hub
    }

    fn start_eviction_worker(
        hub: Weak<Hub>,
        mut evictions: mpsc::UnboundedReceiver<ConnectionId>,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                let id = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    id = evictions.recv() => match id {
                        Some(id) => id,
                        None => break,
                    },
                };
                let Some(strong) = hub.upgrade() else { break };
                strong.disconnect(&id, DisconnectReason::Evicted).await;
            }
            debug!("Eviction worker stopped");
        });
    }

    /// `Connecting -> Connected`: register, optionally bind a user and announce to everyone
    pub async fn connect(&self, id: ConnectionId, user_id: Option<&str>) -> Result<Arc<Connection>> {
        let connection = self.admit(id, user_id)?;
        self.activate(connection).await
    }

    /// Register the connection and bind its user; it stays `Connecting`
    fn admit(&self, id: ConnectionId, user_id: Option<&str>) -> Result<Arc<Connection>> {
        let (connection, queue) = self.registry.register(id.clone())?;
        self.dispatcher.spawn_worker(Arc::clone(&connection), queue);

        if let Some(user_id) = user_id {
            if let Err(e) = self.registry.bind_user(&id, user_id) {
                error!("Failed to bind connection {} to user {}: {}", id, user_id, e);
                self.registry.deregister(&id);
                return Err(e);
            }
        }

        Ok(connection)
    }

    async fn activate(&self, connection: Arc<Connection>) -> Result<Arc<Connection>> {
        let id = connection.id().clone();
        if !connection.mark_connected() {
            // Disconnected while we were still setting up.
            return Err(HubError::UnknownConnection(id));
        }

        info!("Client connected: {}", id);
        info!("Current connections: {}", self.registry.connection_count());

        let report = self
            .dispatcher
            .send(Envelope::new(Target::All, format!("{} connected", id)))
            .await;
        debug!("Connect announcement for {} reached {} clients", id, report.delivered);

        Ok(connection)
    }

    /// `-> Disconnected`: stop delivery, announce to everyone else, deregister.
    ///
    /// Returns false if the connection was already gone.
    pub async fn disconnect(&self, id: &ConnectionId, reason: DisconnectReason) -> bool {
        let Some(connection) = self.registry.get(id) else {
            return false;
        };
        if !connection.begin_disconnect() {
            return false;
        }

        match reason {
            DisconnectReason::Evicted => warn!("Evicting connection {}", id),
            _ => info!(
                "Client disconnected: {} ({}, connected since {})",
                id,
                reason,
                connection.connected_at()
            ),
        }

        let report = self
            .dispatcher
            .send_excluding(Envelope::new(Target::All, format!("{} disconnected", id)), Some(id))
            .await;
        debug!("Disconnect announcement for {} reached {} clients", id, report.delivered);

        self.registry.deregister(id);
        self.transport.close(id).await;

        info!("Current connections: {}", self.registry.connection_count());
        true
    }

    /// Join a group, announcing the newcomer to the existing members
    pub async fn join(&self, id: &ConnectionId, group: &str) -> Result<bool> {
        Ok(self.join_announced(id, group).await?.is_some())
    }

    async fn join_announced(&self, id: &ConnectionId, group: &str) -> Result<Option<DispatchReport>> {
        let connection = self.require(id)?;
        if !self.registry.groups().join(&connection, group)? {
            return Ok(None);
        }
        debug!("{} joined group {}", id, group);

        let announcement = Envelope::new(
            Target::Group(group.to_string()),
            format!("{} has joined the group {}.", id, group),
        );
        Ok(Some(self.dispatcher.send_excluding(announcement, Some(id)).await))
    }

    /// Leave a group, announcing the departure to the remaining members.
    /// A missing edge or unknown connection is a no-op.
    pub async fn leave(&self, id: &ConnectionId, group: &str) -> bool {
        self.leave_announced(id, group).await.is_some()
    }

    async fn leave_announced(&self, id: &ConnectionId, group: &str) -> Option<DispatchReport> {
        let connection = self.registry.get(id)?;
        if !self.registry.groups().leave(&connection, group) {
            return None;
        }
        debug!("{} left group {}", id, group);

        let announcement = Envelope::new(
            Target::Group(group.to_string()),
            format!("{} has left the group {}.", id, group),
        );
        Some(self.dispatcher.send(announcement).await)
    }

    /// Fan an envelope out to its target
    pub async fn send(&self, envelope: Envelope) -> DispatchReport {
        self.dispatcher.send(envelope).await
    }

    /// Apply one inbound client command and build the reply frame
    pub async fn handle_command(&self, id: &ConnectionId, command: ClientCommand) -> Result<ServerMessage> {
        let connection = self.require(id)?;
        let name = command.name();
        let sender = connection.user_id().unwrap_or_else(|| id.to_string());

        let delivered = match command {
            ClientCommand::Join { group } => self
                .join_announced(id, &group)
                .await?
                .map_or(0, |report| report.delivered),
            ClientCommand::Leave { group } => self
                .leave_announced(id, &group)
                .await
                .map_or(0, |report| report.delivered),
            ClientCommand::SendAll { message, user } => {
                let from = user.unwrap_or(sender);
                self.send(Envelope::new(Target::All, message).with_sender(from))
                    .await
                    .delivered
            }
            ClientCommand::SendUser { user, message } => {
                self.send(Envelope::new(Target::User(user), message).with_sender(sender))
                    .await
                    .delivered
            }
            ClientCommand::SendGroup { group, message } => {
                self.send(Envelope::new(Target::Group(group), message).with_sender(sender))
                    .await
                    .delivered
            }
        };

        Ok(ServerMessage::Ack {
            command: name.to_string(),
            delivered,
        })
    }

    /// Disconnect every connection and stop background work
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids = self.registry.connection_ids();
        info!("Shutting down hub with {} connections", ids.len());
        for id in ids {
            self.disconnect(&id, DisconnectReason::ClientClosed).await;
        }
    }

    fn require(&self, id: &ConnectionId) -> Result<Arc<Connection>> {
        self.registry
            .get(id)
            .ok_or_else(|| HubError::UnknownConnection(id.clone()))
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn is_live(&self, id: &ConnectionId) -> bool {
        self.registry.is_live(id)
    }

    pub fn members_of(&self, group: &str) -> HashSet<ConnectionId> {
        self.registry.groups().members_of(group)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    pub fn group_count(&self) -> usize {
        self.registry.groups().group_count()
    }
}

// Shared reference to the hub
pub type SharedHub = Arc<Hub>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::ConnectionPhase;
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn deliver(&self, _: &ConnectionId, _: &Envelope) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_aborts_connect() {
        let hub = Hub::new(&HubConfig::default(), Arc::new(NullTransport));
        let id = ConnectionId::from("racer");

        let connection = hub.admit(id.clone(), Some("alice")).unwrap();
        assert!(hub.disconnect(&id, DisconnectReason::ClientClosed).await);

        match hub.activate(connection).await {
            Err(HubError::UnknownConnection(missing)) => assert_eq!(missing, id),
            other => panic!("expected UnknownConnection, got {:?}", other),
        }
        assert_eq!(hub.connection_count(), 0);
        assert!(!hub.is_live(&id));
        assert!(hub.registry().is_consistent());
    }

    #[tokio::test]
    async fn test_connect_after_aborted_connect_reuses_id() {
        let hub = Hub::new(&HubConfig::default(), Arc::new(NullTransport));
        let id = ConnectionId::from("racer");

        let connection = hub.admit(id.clone(), None).unwrap();
        hub.disconnect(&id, DisconnectReason::TransportError).await;
        assert!(hub.activate(connection).await.is_err());

        let connection = hub.connect(id.clone(), None).await.unwrap();
        assert_eq!(connection.phase(), ConnectionPhase::Connected);
        assert!(hub.is_live(&id));
    }
}
