//! Error handling for the Tandem relay
//!
//! This module provides a single error type for everything that can go
//! wrong on a relay connection, with a mapping onto WebSocket close codes
//! for the errors that end a connection and onto wire error codes for
//! those that are only reported back to the client.

use thiserror::Error;

use crate::websocket::connection::{close_code, Role};
use crate::websocket::messages::{DecodeError, ErrorMessage, MessageKind};
use crate::websocket::registry::{ObserverRejection, UpdateRejection};

/// Relay error type
#[derive(Error, Debug)]
pub enum RelayError {
    // ========== Admission ==========
    /// No admission message arrived in time
    #[error("admission timed out after {0} seconds")]
    AdmissionTimeout(u64),

    /// The first message was missing, undecodable or not a connect message
    #[error("protocol violation during admission: {0}")]
    ProtocolViolation(String),

    /// The registry refused the requested role
    #[error("{role} rejected: {reason}")]
    Rejected { role: Role, reason: String },

    // ========== Per-message (recoverable) ==========
    /// A later frame was not a recognised message
    #[error("invalid message: {0}")]
    Decode(#[from] DecodeError),

    /// Recognised message sent by a role that may not send it
    #[error("{kind} is not allowed for a {role} connection")]
    RoleViolation { role: Role, kind: MessageKind },

    // ========== Faults ==========
    /// The session backing an established connection changed underneath it
    #[error("session update rejected: {0}")]
    Update(#[from] UpdateRejection),

    /// Internal error (catch-all for unexpected errors)
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ObserverRejection> for RelayError {
    fn from(rejection: ObserverRejection) -> Self {
        Self::Rejected {
            role: Role::Observer,
            reason: rejection.to_string(),
        }
    }
}

impl RelayError {
    /// Whether the error ends the connection
    ///
    /// Decode failures and role violations are answered with an error
    /// message and the loop carries on.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Decode(_) | Self::RoleViolation { .. })
    }

    /// Close code sent when the error ends the connection
    pub fn close_code(&self) -> u16 {
        match self {
            Self::AdmissionTimeout(_) | Self::Rejected { .. } => close_code::CANNOT_ACCEPT,
            Self::ProtocolViolation(_) => close_code::PROTOCOL_ERROR,
            Self::Decode(_)
            | Self::RoleViolation { .. }
            | Self::Update(_)
            | Self::Internal(_) => close_code::INTERNAL_ERROR,
        }
    }

    /// Close reason sent with [`RelayError::close_code`]
    pub fn close_reason(&self) -> &'static str {
        match self.close_code() {
            close_code::CANNOT_ACCEPT => "cannot accept",
            close_code::PROTOCOL_ERROR => "protocol error",
            _ => "internal error",
        }
    }

    /// Get the error code string for client-side handling
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AdmissionTimeout(_) => "ADMISSION_TIMEOUT",
            Self::ProtocolViolation(_) => "PROTOCOL_ERROR",
            Self::Rejected { .. } => "REJECTED",
            Self::Decode(_) => "INVALID_MESSAGE",
            Self::RoleViolation { .. } => "INVALID_COMMAND",
            Self::Update(_) => "SESSION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Wire payload for recoverable errors
    pub fn to_error_message(&self) -> ErrorMessage {
        match self {
            Self::RoleViolation { kind, .. } => ErrorMessage::invalid_command(*kind),
            Self::Decode(e) => ErrorMessage::invalid_message(e.to_string()),
            other => ErrorMessage::new(other.error_code(), other.to_string()),
        }
    }

    /// Log the error with appropriate severity
    pub fn log(&self) {
        match self {
            Self::Decode(_) | Self::RoleViolation { .. } => {
                tracing::debug!(error = %self, code = self.error_code(), "Client error");
            }
            Self::AdmissionTimeout(_) | Self::ProtocolViolation(_) | Self::Rejected { .. } => {
                tracing::info!(
                    error = %self,
                    code = self.error_code(),
                    close_code = self.close_code(),
                    "Admission failed"
                );
            }
            Self::Update(_) | Self::Internal(_) => {
                tracing::error!(
                    error = %self,
                    code = self.error_code(),
                    close_code = self.close_code(),
                    "Connection fault"
                );
            }
        }
    }
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::messages::decode;
    use rstest::rstest;

    #[rstest]
    #[case(RelayError::AdmissionTimeout(30), 1003, "cannot accept")]
    #[case(RelayError::ProtocolViolation("x".into()), 1002, "protocol error")]
    #[case(RelayError::from(ObserverRejection::UnknownKey), 1003, "cannot accept")]
    #[case(RelayError::Update(UpdateRejection::SessionGone), 1011, "internal error")]
    #[case(RelayError::Internal("boom".into()), 1011, "internal error")]
    fn test_close_codes(#[case] err: RelayError, #[case] code: u16, #[case] reason: &str) {
        assert!(err.is_fatal());
        assert_eq!(err.close_code(), code);
        assert_eq!(err.close_reason(), reason);
    }

    #[test]
    fn test_message_level_errors_are_not_fatal() {
        let decode_err = RelayError::from(decode("{").unwrap_err());
        assert!(!decode_err.is_fatal());
        assert_eq!(decode_err.to_error_message().code, "INVALID_MESSAGE");

        let role_err = RelayError::RoleViolation {
            role: Role::Observer,
            kind: MessageKind::VolumeUpdate,
        };
        assert!(!role_err.is_fatal());
        assert_eq!(role_err.to_error_message().code, "INVALID_COMMAND");
    }

    #[test]
    fn test_error_display() {
        let err = RelayError::RoleViolation {
            role: Role::Primary,
            kind: MessageKind::SeekCommand,
        };
        assert_eq!(
            err.to_string(),
            "seek-command is not allowed for a primary connection"
        );
    }
}
