//! Error types for the owlchat engine
//!
//! This module contains every error type used by the IM-protocol engine:
//! transport failures, protocol violations, authentication failures,
//! timeouts, rate limiting and setup-time registry conflicts, unified by
//! the top-level [`OwlchatError`].

use core::fmt;

use serde::Serialize;

use crate::types::ConnectionKind;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Socket-level failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed by peer")]
    ClosedByPeer,
    #[error("Connection closed locally")]
    ClosedLocally,
    #[error("Proxy negotiation failed: {reason}")]
    Proxy { reason: String },
    #[error("Rate limit breached disconnect level on class {class}")]
    RateDisconnect { class: u16 },
}

/// Malformed or unexpected protocol data
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("Bad frame marker 0x{0:02x}")]
    BadMarker(u8),
    #[error("Truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("Malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
    #[error("Unexpected record 0x{family:04x}/0x{subtype:04x} in state {state}")]
    UnexpectedRecord {
        family: u16,
        subtype: u16,
        state: String,
    },
    #[error("Handler panicked while processing 0x{family:04x}/0x{subtype:04x}")]
    HandlerPanic { family: u16, subtype: u16 },
    #[error("{message}")]
    Generic { message: String },
}

/// Setup-time conflicts in handler and request tables
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler already registered for 0x{family:04x}/0x{subtype:04x}")]
    DuplicateHandler { family: u16, subtype: u16 },
    #[error("Connection event handler already registered for {event}")]
    DuplicateEventHandler { event: String },
    #[error("Catch-all handler already registered")]
    DuplicateCatchAll,
    #[error("Pending request {request_id} already exists")]
    DuplicateRequest { request_id: u32 },
}

/// Illegal login state transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid login transition from {from} to {to}")]
pub struct StateTransitionError {
    pub from: String,
    pub to: String,
}

// ----------------------------------------------------------------------------
// Login Failure Categories
// ----------------------------------------------------------------------------

/// Categorized reason for a failed login, reported upward in `LoginFailed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoginFailure {
    IncorrectCredentials,
    AccountSuspended,
    ServiceUnavailable,
    ReconnectingTooFast,
    ClientTooOld,
    UnknownAuthError(u16),
    ConnectionFailed,
    ProtocolError,
    Timeout,
}

impl LoginFailure {
    /// Map an authorizer error code (TLV 0x0008) onto a category
    pub fn from_auth_code(code: u16) -> Self {
        match code {
            0x0001 | 0x0004 | 0x0005 => LoginFailure::IncorrectCredentials,
            0x0011 => LoginFailure::AccountSuspended,
            0x0002 | 0x0014 => LoginFailure::ServiceUnavailable,
            0x0018 => LoginFailure::ReconnectingTooFast,
            0x001c => LoginFailure::ClientTooOld,
            other => LoginFailure::UnknownAuthError(other),
        }
    }

    /// Stable machine-readable identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginFailure::IncorrectCredentials => "incorrect-credentials",
            LoginFailure::AccountSuspended => "account-suspended",
            LoginFailure::ServiceUnavailable => "service-unavailable",
            LoginFailure::ReconnectingTooFast => "reconnecting-too-fast",
            LoginFailure::ClientTooOld => "client-too-old",
            LoginFailure::UnknownAuthError(_) => "unknown-auth-error",
            LoginFailure::ConnectionFailed => "connection-failed",
            LoginFailure::ProtocolError => "protocol-error",
            LoginFailure::Timeout => "timeout",
        }
    }

    /// Human-readable message for the user
    pub fn user_message(&self) -> String {
        match self {
            LoginFailure::IncorrectCredentials => "Incorrect nickname or password.".into(),
            LoginFailure::AccountSuspended => "Your account is currently suspended.".into(),
            LoginFailure::ServiceUnavailable => {
                "The instant messenger server is temporarily unavailable.".into()
            }
            LoginFailure::ReconnectingTooFast => {
                "You have been connecting and disconnecting too frequently. Wait ten minutes and try again."
                    .into()
            }
            LoginFailure::ClientTooOld => "The client version you are using is too old.".into(),
            LoginFailure::UnknownAuthError(code) => {
                format!("Login failed with unknown error code 0x{:04x}.", code)
            }
            LoginFailure::ConnectionFailed => "Could not connect to the login server.".into(),
            LoginFailure::ProtocolError => "The server sent data the client did not understand.".into(),
            LoginFailure::Timeout => "The login did not complete in time.".into(),
        }
    }
}

impl fmt::Display for LoginFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticator rejected the login
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Authentication failed (code 0x{code:04x}): {failure}")]
pub struct AuthenticationError {
    pub code: u16,
    pub failure: LoginFailure,
    pub url: Option<String>,
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Core error type for the owlchat engine
#[derive(Debug, thiserror::Error)]
pub enum OwlchatError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("{0}")]
    Authentication(#[from] AuthenticationError),

    #[error("Timed out waiting for {what}")]
    Timeout { what: String },

    #[error("Rate limited on class {class}")]
    RateLimited { class: u16 },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    #[error("No ready {kind} connection")]
    NotConnected { kind: ConnectionKind },

    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl OwlchatError {
    /// Create a generic protocol violation with a message
    pub fn protocol<T: Into<String>>(message: T) -> Self {
        OwlchatError::Protocol(ProtocolViolation::Generic {
            message: message.into(),
        })
    }

    /// Create a malformed-data protocol violation
    pub fn malformed<T: Into<String>>(what: &'static str, reason: T) -> Self {
        OwlchatError::Protocol(ProtocolViolation::Malformed {
            what,
            reason: reason.into(),
        })
    }

    /// Create a connect failure
    pub fn connect_failed<A: Into<String>, R: Into<String>>(address: A, reason: R) -> Self {
        OwlchatError::Transport(TransportError::ConnectFailed {
            address: address.into(),
            reason: reason.into(),
        })
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>>(what: T) -> Self {
        OwlchatError::Timeout { what: what.into() }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        OwlchatError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument<T: Into<String>>(reason: T) -> Self {
        OwlchatError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// True for errors that end the connection they occurred on
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            OwlchatError::Transport(_) | OwlchatError::Protocol(_)
        )
    }

    /// Login failure category used when this error ends a login attempt
    pub fn login_failure(&self) -> LoginFailure {
        match self {
            OwlchatError::Authentication(auth) => auth.failure,
            OwlchatError::Transport(_) | OwlchatError::NotConnected { .. } => {
                LoginFailure::ConnectionFailed
            }
            OwlchatError::Timeout { .. } => LoginFailure::Timeout,
            _ => LoginFailure::ProtocolError,
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, OwlchatError>;
pub type OwlchatResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_code_mapping() {
        assert_eq!(
            LoginFailure::from_auth_code(0x0005),
            LoginFailure::IncorrectCredentials
        );
        assert_eq!(
            LoginFailure::from_auth_code(0x0011),
            LoginFailure::AccountSuspended
        );
        assert_eq!(
            LoginFailure::from_auth_code(0x0018),
            LoginFailure::ReconnectingTooFast
        );
        assert_eq!(LoginFailure::from_auth_code(0x001c), LoginFailure::ClientTooOld);
        assert_eq!(
            LoginFailure::from_auth_code(0x0042),
            LoginFailure::UnknownAuthError(0x0042)
        );
    }

    #[test]
    fn test_failure_strings() {
        assert_eq!(
            LoginFailure::IncorrectCredentials.to_string(),
            "incorrect-credentials"
        );
        assert!(LoginFailure::UnknownAuthError(0x42)
            .user_message()
            .contains("0x0042"));
    }

    #[test]
    fn test_error_classification() {
        let err = OwlchatError::malformed("record", "short header");
        assert!(err.is_connection_fatal());
        assert_eq!(err.login_failure(), LoginFailure::ProtocolError);

        let err = OwlchatError::timeout("login");
        assert!(!err.is_connection_fatal());
        assert_eq!(err.login_failure(), LoginFailure::Timeout);
    }
}
