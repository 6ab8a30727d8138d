//! Login state machine
//!
//! The login advances through explicit states driven by events from the
//! authorizer and main connections. Every transition is validated against
//! the table in [`LoginState::transition`] and recorded in an audit trail;
//! an event that does not apply to the current state is an error rather
//! than a silent state change.

use std::fmt;

use owlchat_core::{LoginFailure, StateTransitionError, Timestamp};
use serde::Serialize;

/// Audit entries retained per session
const AUDIT_CAPACITY: usize = 256;

// ----------------------------------------------------------------------------
// States and Events
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LoginState {
    Disconnected,
    AuthConnecting,
    AwaitingChallenge,
    SendingCredentials,
    AwaitingAuthResult,
    MainConnecting,
    AwaitingCookieAccepted,
    Ready,
    Failed,
}

impl LoginState {
    pub fn state_name(&self) -> &'static str {
        match self {
            LoginState::Disconnected => "Disconnected",
            LoginState::AuthConnecting => "AuthConnecting",
            LoginState::AwaitingChallenge => "AwaitingChallenge",
            LoginState::SendingCredentials => "SendingCredentials",
            LoginState::AwaitingAuthResult => "AwaitingAuthResult",
            LoginState::MainConnecting => "MainConnecting",
            LoginState::AwaitingCookieAccepted => "AwaitingCookieAccepted",
            LoginState::Ready => "Ready",
            LoginState::Failed => "Failed",
        }
    }

    /// Talking to the authorizer
    pub fn is_authorizing(&self) -> bool {
        matches!(
            self,
            LoginState::AuthConnecting
                | LoginState::AwaitingChallenge
                | LoginState::SendingCredentials
                | LoginState::AwaitingAuthResult
        )
    }

    /// A login attempt is underway but not finished
    pub fn is_in_progress(&self) -> bool {
        self.is_authorizing()
            || matches!(
                self,
                LoginState::MainConnecting | LoginState::AwaitingCookieAccepted
            )
    }

    /// Process an event and return the validated transition
    pub fn transition(
        self,
        event: &LoginEvent,
        now: Timestamp,
    ) -> Result<LoginTransition, StateTransitionError> {
        use LoginState::*;

        let new_state = match (self, event) {
            (Disconnected | Failed, LoginEvent::LoginRequested) => AuthConnecting,
            (state, LoginEvent::AuthRetry) if state.is_authorizing() => AuthConnecting,
            (AuthConnecting, LoginEvent::AuthConnected) => AwaitingChallenge,
            (AwaitingChallenge, LoginEvent::ChallengeReceived) => SendingCredentials,
            (SendingCredentials, LoginEvent::CredentialsFlushed) => AwaitingAuthResult,
            (AwaitingAuthResult, LoginEvent::AuthSucceeded) => MainConnecting,
            (MainConnecting, LoginEvent::MainConnected) => AwaitingCookieAccepted,
            (AwaitingCookieAccepted, LoginEvent::ServicesReady) => Ready,
            (state, LoginEvent::Failed(_)) if state.is_in_progress() => Failed,
            (Ready, LoginEvent::ConnectionLost) => Disconnected,
            (state, LoginEvent::LoggedOut) if state != Disconnected => Disconnected,
            (state, event) => {
                return Err(StateTransitionError {
                    from: state.state_name().to_string(),
                    to: event.to_string(),
                })
            }
        };

        Ok(LoginTransition {
            new_state,
            audit_entry: LoginAuditEntry {
                timestamp: now,
                from_state: self.state_name().to_string(),
                to_state: new_state.state_name().to_string(),
                event: event.to_string(),
            },
        })
    }
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

/// Things that move the login forward (or end it)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginEvent {
    LoginRequested,
    /// Authorizer transport failed; reconnect after the cooldown
    AuthRetry,
    AuthConnected,
    ChallengeReceived,
    CredentialsFlushed,
    AuthSucceeded,
    MainConnected,
    /// Main connection finished its post-connect setup
    ServicesReady,
    Failed(LoginFailure),
    ConnectionLost,
    LoggedOut,
}

impl fmt::Display for LoginEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginEvent::Failed(failure) => write!(f, "Failed({})", failure),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Audit trail record of one transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginAuditEntry {
    pub timestamp: Timestamp,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
}

/// Result of a validated transition
#[derive(Debug, Clone)]
pub struct LoginTransition {
    pub new_state: LoginState,
    pub audit_entry: LoginAuditEntry,
}

// ----------------------------------------------------------------------------
// Login Machine
// ----------------------------------------------------------------------------

/// Screen name and password for the current login
#[derive(Clone)]
pub struct Credentials {
    pub screen_name: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("screen_name", &self.screen_name)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Login state plus the bookkeeping that outlives a single attempt
#[derive(Debug)]
pub struct LoginMachine {
    state: LoginState,
    credentials: Option<Credentials>,
    /// Consecutive authorizer transport failures in this login
    pub(crate) auth_failures: u32,
    /// Some login on this session has reached Ready
    pub(crate) has_succeeded: bool,
    pub(crate) deadline: Option<Timestamp>,
    pub(crate) retry_at: Option<Timestamp>,
    pub(crate) cooldown_until: Option<Timestamp>,
    audit_trail: Vec<LoginAuditEntry>,
}

impl Default for LoginMachine {
    fn default() -> Self {
        Self {
            state: LoginState::Disconnected,
            credentials: None,
            auth_failures: 0,
            has_succeeded: false,
            deadline: None,
            retry_at: None,
            cooldown_until: None,
            audit_trail: Vec::new(),
        }
    }
}

impl LoginMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Screen name of the current login, if any
    pub fn screen_name(&self) -> Option<&str> {
        self.credentials
            .as_ref()
            .map(|credentials| credentials.screen_name.as_str())
    }

    pub fn audit_trail(&self) -> &[LoginAuditEntry] {
        &self.audit_trail
    }

    /// Start a fresh attempt with `credentials`
    pub(crate) fn begin(&mut self, credentials: Credentials, deadline: Timestamp) {
        self.credentials = Some(credentials);
        self.auth_failures = 0;
        self.deadline = Some(deadline);
        self.retry_at = None;
    }

    /// Apply `event`, recording the transition
    pub fn apply(&mut self, event: LoginEvent, now: Timestamp) -> Result<LoginState, StateTransitionError> {
        let transition = self.state.transition(&event, now)?;
        self.state = transition.new_state;
        self.audit_trail.push(transition.audit_entry);
        if self.audit_trail.len() > AUDIT_CAPACITY {
            self.audit_trail.remove(0);
        }
        Ok(self.state)
    }
}
