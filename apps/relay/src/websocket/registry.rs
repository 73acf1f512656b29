//! Session registry
//!
//! Maps pairing keys to sessions. A session owns a strong handle to its
//! primary connection and only weak references to its observers; the
//! observers' own connection tasks keep them alive.
//!
//! All mutations go through the `DashMap` entry API, so create, attach,
//! detach and sweep are atomic per key, and a session's [`PlayerState`] is
//! swapped whole while the shard lock is held.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;

use crate::clock::Clock;

use super::connection::{ConnectionHandle, ConnectionId};
use super::messages::PlayerState;

/// Sessions live this long after creation, regardless of activity
pub const DEFAULT_SESSION_TTL_DAYS: i64 = 365;

/// Short human-typeable pairing code
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairingKey(String);

impl PairingKey {
    pub const LENGTH: usize = 6;

    /// Uppercase letters and digits without `0/O` and `1/I`
    pub const ALPHABET: &'static [u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

    /// Normalize (trim, uppercase) and validate a client-supplied key
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        let valid = normalized.len() == Self::LENGTH
            && normalized.bytes().all(|b| Self::ALPHABET.contains(&b));
        valid.then_some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PairingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of candidate keys; the registry rejects and redraws on collision
pub trait KeySource: Send + Sync {
    fn next_key(&self) -> PairingKey;
}

/// Uniformly random keys from [`PairingKey::ALPHABET`]
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomKeys;

impl KeySource for RandomKeys {
    fn next_key(&self) -> PairingKey {
        let mut rng = rand::thread_rng();
        let key = (0..PairingKey::LENGTH)
            .map(|_| PairingKey::ALPHABET[rng.gen_range(0..PairingKey::ALPHABET.len())] as char)
            .collect();
        PairingKey(key)
    }
}

/// A primary and its observers, paired under one key
#[derive(Debug)]
pub struct Session {
    key: PairingKey,
    primary: Option<Arc<ConnectionHandle>>,
    observers: HashMap<ConnectionId, Weak<ConnectionHandle>>,
    pub last_active: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    state: PlayerState,
}

impl Session {
    fn new(
        key: PairingKey,
        primary: &Arc<ConnectionHandle>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            key,
            primary: Some(Arc::clone(primary)),
            observers: HashMap::new(),
            last_active: now,
            expires_at: now + ttl,
            state: PlayerState::default(),
        }
    }

    pub fn has_live_primary(&self) -> bool {
        self.primary.as_ref().is_some_and(|p| p.is_alive())
    }

    /// Observers whose connections are still around
    pub fn live_observers(&self) -> Vec<Arc<ConnectionHandle>> {
        self.observers.values().filter_map(Weak::upgrade).collect()
    }
}

/// Result of a primary connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryAttach {
    pub key: PairingKey,
    /// Always true; a primary is never turned away, at worst it gets a fresh key
    pub accepted: bool,
    pub outcome: AttachOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// A new session was created under the requested or a generated key
    Created,
    /// The requested session had no live primary and was taken over
    Reattached,
    /// The requested session already had a live primary; a fresh key was minted
    Diverted,
}

/// Why an observer could not join
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ObserverRejection {
    #[error("no session for key")]
    UnknownKey,
    #[error("session has no live primary")]
    NoLivePrimary,
}

/// Why a primary-originated update could not be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UpdateRejection {
    #[error("session no longer exists")]
    SessionGone,
    #[error("connection is not the session's primary")]
    NotPrimary,
}

/// Queue the three catch-up messages; failures are logged and skipped
fn send_catch_up(connection: &ConnectionHandle, state: &PlayerState, key: &PairingKey) {
    for message in state.catch_up_messages() {
        if !connection.send(&message).is_queued() {
            tracing::warn!(
                key = %key,
                connection_id = %connection.id(),
                kind = %message.kind(),
                "Failed to deliver catch-up message"
            );
        }
    }
}

/// Thread-safe map of pairing key to session
pub struct SessionRegistry {
    sessions: DashMap<PairingKey, Session>,
    clock: Arc<dyn Clock>,
    keys: Box<dyn KeySource>,
    ttl: Duration,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            clock,
            keys: Box::new(RandomKeys),
            ttl,
        }
    }

    pub fn with_key_source(mut self, keys: impl KeySource + 'static) -> Self {
        self.keys = Box::new(keys);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Admit a primary connection, creating or reattaching a session
    ///
    /// A second primary never displaces a live one: on collision a new
    /// session is created under a freshly generated key instead.
    pub fn create_or_attach_primary(
        &self,
        requested: Option<&PairingKey>,
        connection: &Arc<ConnectionHandle>,
    ) -> PrimaryAttach {
        let now = self.clock.now();

        let Some(requested) = requested else {
            let key = self.insert_generated(connection, now);
            return PrimaryAttach {
                key,
                accepted: true,
                outcome: AttachOutcome::Created,
            };
        };

        match self.sessions.entry(requested.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(Session::new(requested.clone(), connection, now, self.ttl));
                return PrimaryAttach {
                    key: requested.clone(),
                    accepted: true,
                    outcome: AttachOutcome::Created,
                };
            }
            Entry::Occupied(mut entry) => {
                let session = entry.get_mut();
                if !session.has_live_primary() {
                    session.primary = Some(Arc::clone(connection));
                    session.last_active = now;
                    return PrimaryAttach {
                        key: requested.clone(),
                        accepted: true,
                        outcome: AttachOutcome::Reattached,
                    };
                }
            }
        }

        let key = self.insert_generated(connection, now);
        tracing::debug!(
            requested = %requested,
            assigned = %key,
            "Requested key already has a live primary, diverted to new session"
        );
        PrimaryAttach {
            key,
            accepted: true,
            outcome: AttachOutcome::Diverted,
        }
    }

    /// Draw keys until one is free among all tracked sessions, then claim it
    fn insert_generated(
        &self,
        connection: &Arc<ConnectionHandle>,
        now: DateTime<Utc>,
    ) -> PairingKey {
        loop {
            let key = self.keys.next_key();
            if let Entry::Vacant(entry) = self.sessions.entry(key.clone()) {
                entry.insert(Session::new(key.clone(), connection, now, self.ttl));
                return key;
            }
            tracing::trace!(key = %key, "Generated key already in use, drawing again");
        }
    }

    /// Add an observer to a session that has a live primary
    ///
    /// The catch-up sequence is queued before the shard lock is released, so
    /// no broadcast for a later update can reach the observer ahead of it.
    pub fn attach_observer(
        &self,
        key: &PairingKey,
        connection: &Arc<ConnectionHandle>,
    ) -> Result<(), ObserverRejection> {
        let mut session = self
            .sessions
            .get_mut(key)
            .ok_or(ObserverRejection::UnknownKey)?;

        if !session.has_live_primary() {
            return Err(ObserverRejection::NoLivePrimary);
        }

        session
            .observers
            .insert(connection.id(), Arc::downgrade(connection));
        send_catch_up(connection, &session.state, key);
        Ok(())
    }

    /// Resend the catch-up sequence for a session to one connection
    pub fn send_current_state(
        &self,
        key: &PairingKey,
        connection: &ConnectionHandle,
    ) -> Result<(), UpdateRejection> {
        let session = self.sessions.get(key).ok_or(UpdateRejection::SessionGone)?;
        send_catch_up(connection, &session.state, key);
        Ok(())
    }

    /// Drop every reference the registry holds to a connection
    ///
    /// Sessions themselves survive; only the sweep removes them. Returns
    /// whether any session referenced the connection.
    pub fn detach_connection(&self, connection_id: ConnectionId) -> bool {
        let mut touched = false;

        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();

            if session
                .primary
                .as_ref()
                .is_some_and(|p| p.id() == connection_id)
            {
                session.primary = None;
                touched = true;
                tracing::debug!(key = %session.key, %connection_id, "Primary detached");
            }

            if session.observers.remove(&connection_id).is_some() {
                touched = true;
                tracing::debug!(key = %session.key, %connection_id, "Observer detached");
            }

            session.observers.retain(|_, weak| weak.strong_count() > 0);
        }

        touched
    }

    /// Remove every session whose expiry is at or before `now`
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.sessions.retain(|key, session| {
            let keep = session.expires_at > now;
            if !keep {
                removed += 1;
                tracing::debug!(key = %key, expires_at = %session.expires_at, "Session expired");
            }
            keep
        });
        removed
    }

    /// Replace a session's state with `merge(current)` on behalf of its primary
    ///
    /// Returns the observers to broadcast to, collected under the same lock
    /// as the state swap.
    pub fn apply_primary_update(
        &self,
        key: &PairingKey,
        connection_id: ConnectionId,
        merge: impl FnOnce(&PlayerState) -> PlayerState,
    ) -> Result<Vec<Arc<ConnectionHandle>>, UpdateRejection> {
        let mut session = self
            .sessions
            .get_mut(key)
            .ok_or(UpdateRejection::SessionGone)?;

        if !session
            .primary
            .as_ref()
            .is_some_and(|p| p.id() == connection_id)
        {
            return Err(UpdateRejection::NotPrimary);
        }

        let next = merge(&session.state);
        session.state = next;
        session.last_active = self.clock.now();
        Ok(session.live_observers())
    }

    /// The session's primary, if one is attached and alive
    pub fn primary_of(&self, key: &PairingKey) -> Option<Arc<ConnectionHandle>> {
        self.sessions
            .get(key)
            .and_then(|s| s.primary.clone())
            .filter(|p| p.is_alive())
    }

    pub fn state_of(&self, key: &PairingKey) -> Option<PlayerState> {
        self.sessions.get(key).map(|s| s.state.clone())
    }

    pub fn contains_key(&self, key: &PairingKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn has_live_primary(&self, key: &PairingKey) -> bool {
        self.sessions
            .get(key)
            .map(|s| s.has_live_primary())
            .unwrap_or(false)
    }

    pub fn observer_count(&self, key: &PairingKey) -> usize {
        self.sessions
            .get(key)
            .map(|s| s.live_observers().len())
            .unwrap_or(0)
    }

    /// Refresh a session's `last_active`; returns whether the session exists
    pub fn touch(&self, key: &PairingKey) -> bool {
        match self.sessions.get_mut(key) {
            Some(mut session) => {
                session.last_active = self.clock.now();
                true
            }
            None => false,
        }
    }

    pub fn last_active(&self, key: &PairingKey) -> Option<DateTime<Utc>> {
        self.sessions.get(key).map(|s| s.last_active)
    }

    pub fn expires_at(&self, key: &PairingKey) -> Option<DateTime<Utc>> {
        self.sessions.get(key).map(|s| s.expires_at)
    }

    /// Number of tracked sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions with a live primary
    pub fn connected_primaries(&self) -> usize {
        self.sessions.iter().filter(|s| s.has_live_primary()).count()
    }
}
