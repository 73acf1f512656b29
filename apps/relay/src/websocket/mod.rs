//! WebSocket relay between primaries and observers
//!
//! This module handles:
//! - Admission of connections as primary or observer
//! - Session bookkeeping under short pairing keys
//! - Relaying primary state to observers and observer commands to the primary
//! - Expiry of old sessions

pub mod admission;
pub mod connection;
pub mod handler;
pub mod lifecycle;
pub mod messages;
pub mod registry;
pub mod router;

pub use connection::{ConnectionHandle, Role};
pub use handler::{drive_connection, ws_handler, RelayContext};
pub use lifecycle::spawn_sweeper;
pub use registry::{PairingKey, SessionRegistry};
