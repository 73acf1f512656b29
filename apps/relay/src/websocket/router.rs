//! Message routing for admitted connections
//!
//! Once a connection has a role and a session, every further text frame
//! goes through [`MessageRouter::handle_text`]. Primaries publish state,
//! which is merged into the session and relayed verbatim to observers.
//! Observers send commands, which are relayed verbatim to the primary.

use std::sync::Arc;

use crate::error::{RelayError, RelayResult};

use super::admission::Admitted;
use super::connection::{ConnectionHandle, Role};
use super::messages::{decode, MessageKind, PlayerState, RemoteMessage};
use super::registry::{PairingKey, SessionRegistry};

/// Whether a connection holding `role` may send messages of `kind`
pub fn allows(role: Role, kind: MessageKind) -> bool {
    match kind {
        // Repeated connect messages are tolerated and ignored
        MessageKind::PrimaryConnect => role == Role::Primary,
        MessageKind::ObserverConnect => role == Role::Observer,

        MessageKind::PlaybackStateUpdate
        | MessageKind::PlaylistUpdate
        | MessageKind::PlaybackModeUpdate
        | MessageKind::PositionUpdate
        | MessageKind::VolumeUpdate => role == Role::Primary,

        MessageKind::PlaybackCommand
        | MessageKind::SeekCommand
        | MessageKind::PlaylistMoveCommand
        | MessageKind::PlaylistRemoveCommand
        | MessageKind::ShuffleCommand
        | MessageKind::RepeatCommand
        | MessageKind::VolumeCommand
        | MessageKind::RequestCurrentState => role == Role::Observer,

        // Relay-originated only
        MessageKind::PrimaryConnectResponse | MessageKind::ErrorMessage => false,
    }
}

/// Routes messages for a single admitted connection
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    connection: Arc<ConnectionHandle>,
    role: Role,
    key: PairingKey,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        connection: Arc<ConnectionHandle>,
        admitted: Admitted,
    ) -> Self {
        Self {
            registry,
            connection,
            role: admitted.role,
            key: admitted.key,
        }
    }

    pub fn key(&self) -> &PairingKey {
        &self.key
    }

    /// Decode and route one text frame
    ///
    /// Non-fatal errors (see [`RelayError::is_fatal`]) should be reported
    /// with [`MessageRouter::reply_error`] and the loop continued.
    pub fn handle_text(&self, text: &str) -> RelayResult<()> {
        let message = decode(text)?;
        self.handle_message(message, text)
    }

    /// Route an already decoded message; `raw` is the frame it came from
    pub fn handle_message(&self, message: RemoteMessage, raw: &str) -> RelayResult<()> {
        let kind = message.kind();
        if !allows(self.role, kind) {
            return Err(RelayError::RoleViolation {
                role: self.role,
                kind,
            });
        }

        match message {
            RemoteMessage::PrimaryConnect(_) | RemoteMessage::ObserverConnect(_) => {
                tracing::debug!(key = %self.key, role = %self.role, "Ignoring repeated connect");
                Ok(())
            }

            RemoteMessage::PlaybackStateUpdate(update) => {
                self.publish(raw, kind, |s| s.with_playback(&update))
            }
            RemoteMessage::PlaylistUpdate(update) => {
                self.publish(raw, kind, |s| s.with_playlist(&update))
            }
            RemoteMessage::PlaybackModeUpdate(update) => {
                self.publish(raw, kind, |s| s.with_mode(&update))
            }
            RemoteMessage::PositionUpdate(update) => {
                self.publish(raw, kind, |s| s.with_position(update.position))
            }
            RemoteMessage::VolumeUpdate(update) => {
                self.publish(raw, kind, |s| s.with_volume(update.volume))
            }

            RemoteMessage::PlaybackCommand(_)
            | RemoteMessage::SeekCommand(_)
            | RemoteMessage::PlaylistMoveCommand(_)
            | RemoteMessage::PlaylistRemoveCommand(_)
            | RemoteMessage::ShuffleCommand(_)
            | RemoteMessage::RepeatCommand(_)
            | RemoteMessage::VolumeCommand(_) => {
                self.forward_to_primary(raw, kind);
                Ok(())
            }

            RemoteMessage::RequestCurrentState => {
                if self
                    .registry
                    .send_current_state(&self.key, &self.connection)
                    .is_err()
                {
                    tracing::debug!(key = %self.key, "Session gone, state request dropped");
                }
                Ok(())
            }

            RemoteMessage::PrimaryConnectResponse(_) | RemoteMessage::ErrorMessage(_) => {
                Err(RelayError::RoleViolation {
                    role: self.role,
                    kind,
                })
            }
        }
    }

    /// Report a non-fatal error back to this connection
    pub fn reply_error(&self, error: &RelayError) {
        let message = RemoteMessage::error(error.to_error_message());
        if !self.connection.send(&message).is_queued() {
            tracing::debug!(
                key = %self.key,
                connection_id = %self.connection.id(),
                "Failed to deliver error reply"
            );
        }
    }

    /// Merge a primary update into the session, then relay the frame as received
    fn publish(
        &self,
        raw: &str,
        kind: MessageKind,
        merge: impl FnOnce(&PlayerState) -> PlayerState,
    ) -> RelayResult<()> {
        let observers = self
            .registry
            .apply_primary_update(&self.key, self.connection.id(), merge)?;

        let frame: Arc<str> = Arc::from(raw);
        let mut dropped = 0usize;
        for observer in &observers {
            if !observer.send_text(Arc::clone(&frame)).is_queued() {
                dropped += 1;
            }
        }

        if dropped > 0 {
            tracing::debug!(
                key = %self.key,
                kind = %kind,
                observers = observers.len(),
                dropped,
                "Some observers missed a broadcast"
            );
        } else {
            tracing::trace!(
                key = %self.key,
                kind = %kind,
                observers = observers.len(),
                "Broadcast"
            );
        }
        Ok(())
    }

    fn forward_to_primary(&self, raw: &str, kind: MessageKind) {
        let Some(primary) = self.registry.primary_of(&self.key) else {
            tracing::debug!(key = %self.key, kind = %kind, "No live primary, command dropped");
            return;
        };

        if !primary.send_text(Arc::from(raw)).is_queued() {
            tracing::debug!(key = %self.key, kind = %kind, "Primary went away, command dropped");
        }
    }
}
