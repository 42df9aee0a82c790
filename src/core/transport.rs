//! Outbound seam between the hub core and whatever carries bytes to clients

use async_trait::async_trait;

use crate::core::connection::ConnectionId;
use crate::core::envelope::Envelope;
use crate::error::Result;

/// Delivers one envelope to one connection.
///
/// The hub only observes success or failure; framing and the wire protocol
/// belong to the implementor. Implementations must be cancel-safe, the hub
/// drops the future on timeout or disconnect.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn deliver(&self, connection_id: &ConnectionId, envelope: &Envelope) -> Result<()>;

    /// Called once after the hub has torn a connection down
    async fn close(&self, _connection_id: &ConnectionId) {}
}
