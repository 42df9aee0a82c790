//! Hub-side connection state
//! Tracks the lifecycle, identity binding, group memberships and delivery health of one client session

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::envelope::Envelope;
use crate::error::{HubError, Result};

/// Opaque identifier of one client session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Mint a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle phase of a connection. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Connected,
    Disconnected,
}

/// Mutable state guarded by the per-connection lock
#[derive(Debug)]
pub(crate) struct ConnectionState {
    pub(crate) phase: ConnectionPhase,
    pub(crate) user_id: Option<String>,
    pub(crate) groups: HashSet<String>,
}

/// Result of a single delivery attempt, reported back to the dispatching `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryOutcome {
    Delivered,
    Failed,
}

/// One queued delivery for a connection's worker
pub(crate) struct Outbound {
    pub(crate) envelope: Arc<Envelope>,
    pub(crate) ack: oneshot::Sender<DeliveryOutcome>,
}

pub(crate) type OutboundReceiver = mpsc::Receiver<Outbound>;

/// Represents the hub's view of a single client session
pub struct Connection {
    id: ConnectionId,
    connected_at: DateTime<Utc>,
    live: AtomicBool,
    failures: AtomicU32,
    state: Mutex<ConnectionState>,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl Connection {
    /// Create a live connection together with the receiving end of its outbound queue
    pub(crate) fn new(id: ConnectionId, queue_size: usize) -> (Self, OutboundReceiver) {
        let (outbound, rx) = mpsc::channel(queue_size);
        let connection = Self {
            id,
            connected_at: Utc::now(),
            live: AtomicBool::new(true),
            failures: AtomicU32::new(0),
            state: Mutex::new(ConnectionState {
                phase: ConnectionPhase::Connecting,
                user_id: None,
                groups: HashSet::new(),
            }),
            outbound,
            cancel: CancellationToken::new(),
        };
        (connection, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Whether the connection is still eligible as a delivery target
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Current number of consecutive failed deliveries
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.lock_state().phase
    }

    pub fn user_id(&self) -> Option<String> {
        self.lock_state().user_id.clone()
    }

    /// Snapshot of the groups this connection has joined
    pub fn joined_groups(&self) -> HashSet<String> {
        self.lock_state().groups.clone()
    }

    // Critical sections only insert/remove set entries, so poisoned state is still consistent.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move from `Connecting` to `Connected`. Returns false for any other phase.
    pub(crate) fn mark_connected(&self) -> bool {
        let mut state = self.lock_state();
        if state.phase == ConnectionPhase::Connecting {
            state.phase = ConnectionPhase::Connected;
            true
        } else {
            false
        }
    }

    /// Claim the transition into `Disconnected`.
    ///
    /// Only the first caller gets `true`; the connection stops being a delivery
    /// target and its worker is cancelled.
    pub(crate) fn begin_disconnect(&self) -> bool {
        {
            let mut state = self.lock_state();
            if state.phase == ConnectionPhase::Disconnected {
                return false;
            }
            state.phase = ConnectionPhase::Disconnected;
        }
        self.close();
        true
    }

    /// Stop delivering to this connection and abort any in-flight attempt
    pub(crate) fn close(&self) {
        self.live.store(false, Ordering::Release);
        self.cancel.cancel();
    }

    /// Mark the connection dead after repeated failures.
    /// Returns true only for the call that flipped it.
    pub(crate) fn mark_dead(&self) -> bool {
        self.live.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
    }

    /// Count a failed delivery and return the new consecutive total
    pub(crate) fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queue an envelope without waiting for room in the outbound buffer
    pub(crate) fn try_enqueue(&self, item: Outbound) -> Result<()> {
        self.outbound.try_send(item).map_err(|e| {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "outbound queue full",
                mpsc::error::TrySendError::Closed(_) => "outbound queue closed",
            };
            HubError::DeliveryFailure {
                connection_id: self.id.clone(),
                reason: reason.to_string(),
            }
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .field("failures", &self.failure_count())
            .finish()
    }
}
