//! Admission: turning a connection's first message into a role
//!
//! A connection is nobody until its first text frame says otherwise. That
//! frame must be `primary-connect` or `observer-connect`; anything else
//! ends the connection.

use std::sync::Arc;

use crate::error::{RelayError, RelayResult};

use super::connection::{ConnectionHandle, Role};
use super::messages::{decode, PrimaryConnectResponse, RemoteMessage};
use super::registry::{PairingKey, SessionRegistry};

/// Role and session granted to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub role: Role,
    pub key: PairingKey,
}

/// Admit a connection based on its first text frame
///
/// Primaries are answered with a `primary-connect-response`; observers
/// receive the catch-up sequence. On error nothing has been registered and
/// the caller should close with [`RelayError::close_code`].
pub fn admit(
    registry: &SessionRegistry,
    connection: &Arc<ConnectionHandle>,
    text: &str,
) -> RelayResult<Admitted> {
    let message = decode(text).map_err(|e| RelayError::ProtocolViolation(e.to_string()))?;

    match message {
        RemoteMessage::PrimaryConnect(connect) => {
            let requested = connect.existing_key.as_deref().and_then(|raw| {
                let parsed = PairingKey::parse(raw);
                if parsed.is_none() {
                    tracing::debug!(
                        connection_id = %connection.id(),
                        existing_key = raw,
                        "Ignoring malformed existing key"
                    );
                }
                parsed
            });

            let attach = registry.create_or_attach_primary(requested.as_ref(), connection);
            let response = RemoteMessage::PrimaryConnectResponse(PrimaryConnectResponse {
                key: attach.key.to_string(),
                success: attach.accepted,
            });
            if !connection.send(&response).is_queued() {
                tracing::debug!(key = %attach.key, "Primary went away before its connect response");
            }

            tracing::info!(
                key = %attach.key,
                connection_id = %connection.id(),
                outcome = ?attach.outcome,
                "Primary admitted"
            );
            Ok(Admitted {
                role: Role::Primary,
                key: attach.key,
            })
        }

        RemoteMessage::ObserverConnect(connect) => {
            let key = PairingKey::parse(&connect.key).ok_or_else(|| RelayError::Rejected {
                role: Role::Observer,
                reason: "malformed key".to_string(),
            })?;

            registry.attach_observer(&key, connection)?;

            tracing::info!(key = %key, connection_id = %connection.id(), "Observer admitted");
            Ok(Admitted {
                role: Role::Observer,
                key,
            })
        }

        other => Err(RelayError::ProtocolViolation(format!(
            "expected a connect message, got {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::websocket::connection::Outbound;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use rstest::rstest;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(ManualClock::default()), Duration::days(365))
    }

    fn first_text(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Outbound>) -> RemoteMessage {
        match rx.try_recv().unwrap() {
            Outbound::Text(text) => decode(&text).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_primary_gets_connect_response() {
        let registry = registry();
        let (conn, mut rx) = ConnectionHandle::channel();

        let admitted = admit(&registry, &conn, r#"{"type":"primary-connect"}"#).unwrap();
        assert_eq!(admitted.role, Role::Primary);

        assert_matches!(
            first_text(&mut rx),
            RemoteMessage::PrimaryConnectResponse(r) if r.success && r.key == admitted.key.as_str()
        );
        assert!(registry.has_live_primary(&admitted.key));
    }

    #[test]
    fn test_primary_existing_key_is_normalized() {
        let registry = registry();
        let (conn, _rx) = ConnectionHandle::channel();

        let admitted = admit(
            &registry,
            &conn,
            r#"{"type":"primary-connect","existingKey":" mykey2 "}"#,
        )
        .unwrap();
        assert_eq!(admitted.key.as_str(), "MYKEY2");
    }

    #[test]
    fn test_primary_malformed_existing_key_gets_fresh_key() {
        let registry = registry();
        let (conn, _rx) = ConnectionHandle::channel();

        let admitted = admit(
            &registry,
            &conn,
            r#"{"type":"primary-connect","existingKey":"nope"}"#,
        )
        .unwrap();
        assert_ne!(admitted.key.as_str(), "NOPE");
        assert_eq!(admitted.key.as_str().len(), PairingKey::LENGTH);
    }

    #[test]
    fn test_second_primary_on_same_key_is_diverted() {
        let registry = registry();
        let (first, _rx1) = ConnectionHandle::channel();
        let (second, mut rx2) = ConnectionHandle::channel();

        let a = admit(&registry, &first, r#"{"type":"primary-connect"}"#).unwrap();
        let msg = format!(r#"{{"type":"primary-connect","existingKey":"{}"}}"#, a.key);
        let b = admit(&registry, &second, &msg).unwrap();

        assert_ne!(a.key, b.key);
        assert_matches!(
            first_text(&mut rx2),
            RemoteMessage::PrimaryConnectResponse(r) if r.success && r.key == b.key.as_str()
        );
    }

    #[test]
    fn test_observer_gets_catch_up() {
        let registry = registry();
        let (primary, _rx1) = ConnectionHandle::channel();
        let (observer, mut rx2) = ConnectionHandle::channel();
        let a = admit(&registry, &primary, r#"{"type":"primary-connect"}"#).unwrap();

        let msg = format!(
            r#"{{"type":"observer-connect","key":"{}"}}"#,
            a.key.as_str().to_lowercase()
        );
        let admitted = admit(&registry, &observer, &msg).unwrap();
        assert_eq!(admitted.role, Role::Observer);
        assert_eq!(admitted.key, a.key);

        assert_matches!(first_text(&mut rx2), RemoteMessage::PlaybackStateUpdate(_));
        assert_matches!(first_text(&mut rx2), RemoteMessage::PlaylistUpdate(_));
        assert_matches!(first_text(&mut rx2), RemoteMessage::PlaybackModeUpdate(_));
    }

    #[rstest]
    #[case(r#"{"type":"observer-connect","key":"ZZZZZZ"}"#)]
    #[case(r#"{"type":"observer-connect","key":"bad"}"#)]
    fn test_observer_rejected_with_cannot_accept(#[case] raw: &str) {
        let registry = registry();
        let (observer, mut rx) = ConnectionHandle::channel();

        let err = admit(&registry, &observer, raw).unwrap_err();
        assert_matches!(err, RelayError::Rejected { role: Role::Observer, .. });
        assert_eq!(err.close_code(), 1003);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_observer_rejected_when_primary_gone() {
        let registry = registry();
        let (primary, _rx1) = ConnectionHandle::channel();
        let a = admit(&registry, &primary, r#"{"type":"primary-connect"}"#).unwrap();
        registry.detach_connection(primary.id());

        let (observer, _rx2) = ConnectionHandle::channel();
        let msg = format!(r#"{{"type":"observer-connect","key":"{}"}}"#, a.key);
        let err = admit(&registry, &observer, &msg).unwrap_err();
        assert_eq!(err.close_code(), 1003);
    }

    #[rstest]
    #[case("not json")]
    #[case(r#"{"type":"seek-command","position":10}"#)]
    #[case(r#"{"type":"request-current-state"}"#)]
    #[case(r#"{"type":"observer-connect"}"#)]
    fn test_non_connect_first_message_is_protocol_error(#[case] raw: &str) {
        let registry = registry();
        let (conn, _rx) = ConnectionHandle::channel();

        let err = admit(&registry, &conn, raw).unwrap_err();
        assert_matches!(err, RelayError::ProtocolViolation(_));
        assert_eq!(err.close_code(), 1002);
        assert_eq!(registry.session_count(), 0);
    }
}
