//! Core functionality of the notification hub

pub mod connection;
pub mod dispatch;
pub mod envelope;
pub mod group;
pub mod hub;
pub mod message_types;
pub mod registry;
pub mod transport;

// Re-export main components for convenience
pub use connection::{Connection, ConnectionId, ConnectionPhase};
pub use dispatch::{DispatchReport, Dispatcher};
pub use envelope::{Envelope, Target};
pub use group::GroupIndex;
pub use hub::{DisconnectReason, Hub, SharedHub};
pub use message_types::{ClientCommand, ServerMessage};
pub use registry::ConnectionRegistry;
pub use transport::Transport;
