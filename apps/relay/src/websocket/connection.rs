//! WebSocket connection handles
//!
//! Every socket gets exactly one writer task that drains an unbounded
//! channel into the sink. Anything that wants to talk to a connection
//! (its own reply path, another connection's broadcast, the admission
//! step) goes through [`ConnectionHandle::send`], so frames from
//! concurrent writers are serialized and never interleave.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::messages::{encode, RemoteMessage};

/// Close codes used by the relay (RFC 6455 section 7.4.1)
pub mod close_code {
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const CANNOT_ACCEPT: u16 = 1003;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Role a connection acquires during admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Observer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Observer => write!(f, "observer"),
        }
    }
}

/// Frames queued for the writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(Arc<str>),
    Close { code: u16, reason: &'static str },
}

/// Outcome of a best-effort send
///
/// The relay never retries; callers may inspect this to log, or drop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "delivery is best-effort; log or explicitly ignore the outcome"]
pub enum Delivery {
    Queued,
    Dropped,
}

impl Delivery {
    pub fn is_queued(self) -> bool {
        matches!(self, Delivery::Queued)
    }
}

/// Opaque identifier for a transport connection
pub type ConnectionId = Uuid;

/// Handle for sending frames to a specific WebSocket connection
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,

    /// Channel feeding this connection's writer task
    sender: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    /// Create a handle together with the receiving end of its writer channel
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(tx)), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Check if the writer side is still draining
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Queue a raw text frame as-is
    pub fn send_text(&self, text: Arc<str>) -> Delivery {
        self.push(Outbound::Text(text))
    }

    /// Encode and queue a message
    pub fn send(&self, message: &RemoteMessage) -> Delivery {
        match encode(message) {
            Ok(json) => self.send_text(json.into()),
            Err(e) => {
                tracing::error!(
                    connection_id = %self.id,
                    kind = %message.kind(),
                    error = %e,
                    "Failed to serialize message"
                );
                Delivery::Dropped
            }
        }
    }

    /// Ask the writer task to send a close frame and stop
    pub fn close(&self, code: u16, reason: &'static str) -> Delivery {
        self.push(Outbound::Close { code, reason })
    }

    fn push(&self, frame: Outbound) -> Delivery {
        match self.sender.send(frame) {
            Ok(()) => Delivery::Queued,
            Err(_) => Delivery::Dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::messages::{ErrorMessage, RemoteMessage};

    #[test]
    fn test_send_queues_encoded_text() {
        let (handle, mut rx) = ConnectionHandle::channel();
        let delivery = handle.send(&RemoteMessage::RequestCurrentState);
        assert_eq!(delivery, Delivery::Queued);

        match rx.try_recv().unwrap() {
            Outbound::Text(text) => assert_eq!(&*text, r#"{"type":"request-current-state"}"#),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_send_after_writer_gone_is_dropped() {
        let (handle, rx) = ConnectionHandle::channel();
        drop(rx);

        assert!(!handle.is_alive());
        let delivery = handle.send(&RemoteMessage::error(ErrorMessage::invalid_message("x")));
        assert_eq!(delivery, Delivery::Dropped);
    }

    #[test]
    fn test_close_frame_is_queued_in_order() {
        let (handle, mut rx) = ConnectionHandle::channel();
        let _ = handle.send_text(Arc::from("first"));
        let _ = handle.close(close_code::CANNOT_ACCEPT, "cannot accept");

        assert_eq!(rx.try_recv().unwrap(), Outbound::Text(Arc::from("first")));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close {
                code: close_code::CANNOT_ACCEPT,
                reason: "cannot accept"
            }
        );
    }

    #[test]
    fn test_handles_have_distinct_ids() {
        let (a, _rx_a) = ConnectionHandle::channel();
        let (b, _rx_b) = ConnectionHandle::channel();
        assert_ne!(a.id(), b.id());
    }
}
