//! Engine
//!
//! The collaborator-facing API. An [`Engine`] owns one [`Session`] and the
//! [`Scheduler`] that drives it. Operations queue work and return at once;
//! outcomes arrive as [`Notification`]s after later [`Engine::run_once`]
//! calls.
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use owlchat_core::EngineConfig;
//! use owlchat_runtime::Engine;
//!
//! # fn main() -> owlchat_core::Result<()> {
//! let mut engine = Engine::new(EngineConfig::default())?;
//! engine.login("alice", "secret")?;
//! loop {
//!     engine.run_once(Some(Duration::from_millis(250)))?;
//!     for notification in engine.drain_notifications() {
//!         println!("{:?}", notification);
//!     }
//! }
//! # }
//! ```

use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use owlchat_core::{
    EngineConfig, MessageFlags, Notification, Result, SystemTimeSource, TimeSource,
};
use tracing::{debug, warn};

use crate::handshake;
use crate::login::LoginState;
use crate::scheduler::Scheduler;
use crate::services;
use crate::session::Session;
use crate::transport::{Connector, TcpConnector};

/// File name of the legacy client binary inside the cache directory
pub const CLIENT_BINARY_NAME: &str = "aim.exe";

/// Buddy list group used when the caller does not name one
pub const DEFAULT_GROUP: &str = "Buddies";

/// Read the client binary used to answer verification challenges
fn load_client_binary(dir: Option<&Path>) -> Option<Vec<u8>> {
    let path = dir?.join(CLIENT_BINARY_NAME);
    match std::fs::read(&path) {
        Ok(bytes) => {
            debug!("Loaded {} bytes of client binary from {}", bytes.len(), path.display());
            Some(bytes)
        }
        Err(err) => {
            warn!("Client binary {} unavailable: {}", path.display(), err);
            None
        }
    }
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

pub struct Engine {
    session: Session,
    scheduler: Scheduler,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("session", &self.session)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl Engine {
    /// Engine on real TCP (through the configured proxy, if any)
    pub fn new(config: EngineConfig) -> Result<Self> {
        let connector = TcpConnector::new(config.proxy.clone());
        Self::with_parts(config, Box::new(connector), Rc::new(SystemTimeSource::new()))
    }

    /// Engine over a caller-supplied connector and clock
    pub fn with_parts(
        config: EngineConfig,
        connector: Box<dyn Connector>,
        clock: Rc<dyn TimeSource>,
    ) -> Result<Self> {
        config.validate()?;
        let client_binary = load_client_binary(config.binary_cache_dir.as_deref());
        let sweep = config.timeouts.sweep_interval();
        let keepalive = config.timeouts.keepalive();
        let session = Session::new(config, connector, clock, client_binary);

        let mut scheduler = Scheduler::new()?;
        let now = session.now();
        let timers = scheduler.timers_mut();
        timers.add_interval(now + sweep, sweep, |session, _| handshake::sweep(session));
        timers.add_interval(now + keepalive, keepalive, |session, _| {
            handshake::keepalive(session)
        });
        Ok(Self { session, scheduler })
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Start signing on; `LoginSucceeded` or `LoginFailed` follows
    pub fn login(&mut self, screen_name: &str, password: &str) -> Result<()> {
        handshake::login(&mut self.session, screen_name, password)
    }

    pub fn logout(&mut self) -> Result<()> {
        handshake::logout(&mut self.session)
    }

    pub fn send_message(&mut self, target: &str, text: &str, flags: MessageFlags) -> Result<()> {
        services::send_message(&mut self.session, target, text, flags)
    }

    /// Add `name` to `group` on the server-stored list, creating the group
    pub fn add_buddy(&mut self, name: &str, group: &str) -> Result<()> {
        services::add_buddy(&mut self.session, name, group)
    }

    pub fn remove_buddy(&mut self, name: &str, group: &str) -> Result<()> {
        services::remove_buddy(&mut self.session, name, group)
    }

    /// Reported as `SearchResult`
    pub fn search_by_email(&mut self, address: &str) -> Result<()> {
        services::search_by_email(&mut self.session, address)
    }

    /// Reported as `UserInfo`
    pub fn get_user_info(&mut self, screen_name: &str) -> Result<()> {
        services::get_user_info(&mut self.session, screen_name)
    }

    /// Join or create a chat room; `ChatJoined` follows once connected
    pub fn join_room(&mut self, name: &str, exchange: u16) -> Result<()> {
        services::join_room(&mut self.session, name, exchange)
    }

    pub fn send_chat_message(&mut self, room: &str, text: &str) -> Result<()> {
        services::send_chat_message(&mut self.session, room, text)
    }

    pub fn leave_room(&mut self, room: &str) -> Result<()> {
        services::leave_room(&mut self.session, room)
    }

    // ------------------------------------------------------------------------
    // Driving and Inspection
    // ------------------------------------------------------------------------

    /// One scheduler iteration, waiting at most `max_wait`
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<()> {
        self.scheduler.run_once(&mut self.session, max_wait)
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        self.session.drain_notifications()
    }

    pub fn login_state(&self) -> LoginState {
        self.session.login_state()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ManualTimeSource, MemoryNetwork};
    use owlchat_core::{ConnectionKind, OwlchatError};

    fn engine() -> (Engine, MemoryNetwork) {
        let network = MemoryNetwork::new();
        let engine = Engine::with_parts(
            EngineConfig::testing(),
            Box::new(network.connector()),
            Rc::new(ManualTimeSource::new()),
        )
        .unwrap();
        (engine, network)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = EngineConfig::testing();
        config.login_server = String::new();
        let network = MemoryNetwork::new();
        let result = Engine::with_parts(
            config,
            Box::new(network.connector()),
            Rc::new(ManualTimeSource::new()),
        );
        assert!(matches!(result, Err(OwlchatError::Configuration { .. })));
    }

    #[test]
    fn test_operations_require_login() {
        let (mut engine, network) = engine();
        assert!(matches!(
            engine.send_message("bob", "hi", MessageFlags::NONE),
            Err(OwlchatError::NotConnected {
                kind: ConnectionKind::Main
            })
        ));
        assert!(engine.add_buddy("bob", DEFAULT_GROUP).is_err());
        assert!(engine.search_by_email("bob@example.com").is_err());
        assert!(engine.join_room("lobby", 4).is_err());
        assert_eq!(network.connect_count(), 0);
    }

    #[test]
    fn test_login_opens_authorizer() {
        let (mut engine, network) = engine();
        engine.login("alice", "secret").unwrap();
        assert_eq!(engine.login_state(), LoginState::AuthConnecting);
        assert_eq!(network.connect_count(), 1);
        assert!(matches!(
            engine.login("alice", "secret"),
            Err(OwlchatError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_empty_screen_name_rejected() {
        let (mut engine, network) = engine();
        assert!(engine.login("  ", "secret").is_err());
        assert_eq!(engine.login_state(), LoginState::Disconnected);
        assert_eq!(network.connect_count(), 0);
    }

    #[test]
    fn test_missing_client_binary_is_not_fatal() {
        let mut config = EngineConfig::testing();
        config.binary_cache_dir = Some(std::env::temp_dir().join("owlchat-no-such-dir"));
        let network = MemoryNetwork::new();
        let engine = Engine::with_parts(
            config,
            Box::new(network.connector()),
            Rc::new(ManualTimeSource::new()),
        )
        .unwrap();
        assert!(engine.session().client_binary().is_none());
    }
}
