//! Notify Hub - A real-time notification hub implemented in Rust
//!
//! This library provides the hub core (connection registry, group
//! membership, dispatch and lifecycle) and a WebSocket transport for it.

pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;

// Re-export main components
pub use config::*;
pub use constants::*;
