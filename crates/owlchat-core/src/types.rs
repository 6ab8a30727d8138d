//! Core types for the owlchat engine
//!
//! Newtypes for screen names, cookies, timestamps and message flags, the
//! connection-kind enumeration, and the time-source abstraction used by
//! every time-dependent component.

use core::fmt;
use core::ops::{Add, Sub};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::protocol::families;

// ----------------------------------------------------------------------------
// Connection Kind
// ----------------------------------------------------------------------------

/// The typed role of one connection within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnectionKind {
    Auth,
    Main,
    ChatDirectory,
    ChatRoom,
    IconStore,
    MailNotify,
    Rendezvous,
}

impl ConnectionKind {
    /// Service family a redirect names for this kind
    pub fn service_family(&self) -> Option<u16> {
        match self {
            ConnectionKind::ChatDirectory => Some(families::CHAT_NAV),
            ConnectionKind::ChatRoom => Some(families::CHAT),
            ConnectionKind::IconStore => Some(families::ICON),
            ConnectionKind::MailNotify => Some(families::MAIL),
            ConnectionKind::Auth | ConnectionKind::Main | ConnectionKind::Rendezvous => None,
        }
    }

    /// Connection kind a redirect for `family` opens
    pub fn from_service_family(family: u16) -> Option<Self> {
        match family {
            families::CHAT_NAV => Some(ConnectionKind::ChatDirectory),
            families::CHAT => Some(ConnectionKind::ChatRoom),
            families::ICON => Some(ConnectionKind::IconStore),
            families::MAIL => Some(ConnectionKind::MailNotify),
            _ => None,
        }
    }

    /// Whether this kind speaks the framed protocol with a cookie login
    pub fn uses_cookie_login(&self) -> bool {
        !matches!(self, ConnectionKind::Auth | ConnectionKind::Rendezvous)
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionKind::Auth => "auth",
            ConnectionKind::Main => "main",
            ConnectionKind::ChatDirectory => "chat-directory",
            ConnectionKind::ChatRoom => "chat-room",
            ConnectionKind::IconStore => "icon-store",
            ConnectionKind::MailNotify => "mail-notify",
            ConnectionKind::Rendezvous => "rendezvous",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Screen Name
// ----------------------------------------------------------------------------

/// A user's screen name as typed; comparisons use the normalized form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenName(String);

impl ScreenName {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase with spaces removed, the server's notion of identity
    pub fn normalized(&self) -> String {
        normalize_screen_name(&self.0)
    }
}

impl PartialEq for ScreenName {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for ScreenName {}

impl fmt::Display for ScreenName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a screen name for comparison
pub fn normalize_screen_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != ' ')
        .flat_map(char::to_lowercase)
        .collect()
}

// ----------------------------------------------------------------------------
// Cookie
// ----------------------------------------------------------------------------

/// Opaque server-issued authorization bytes, valid for exactly one connection
#[derive(Clone, PartialEq, Eq)]
pub struct Cookie(Vec<u8>);

impl Cookie {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Cookie {
    // Cookies are credentials; only the length is printed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie({} bytes)", self.0.len())
    }
}

// ----------------------------------------------------------------------------
// Message Flags
// ----------------------------------------------------------------------------

/// Per-message flags carried on instant messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageFlags(u16);

impl MessageFlags {
    pub const NONE: Self = Self(0);
    /// Sent automatically by an away message
    pub const AUTO_RESPONSE: Self = Self(0x0001);
    /// Sender asked the server for a delivery acknowledgement
    pub const ACK_REQUESTED: Self = Self(0x0002);
    /// Sender is offline; the message was stored
    pub const OFFLINE: Self = Self(0x0004);
    /// Message text arrived as UCS-2
    pub const UNICODE: Self = Self(0x0008);

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp on the engine's monotonic clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    pub fn since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// Time remaining until `later`, zero if already passed
    pub fn until(&self, later: Timestamp) -> Duration {
        later.since(*self)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(other.as_millis() as u64))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Trait for abstracting time so schedulers can be driven deterministically
pub trait TimeSource {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Monotonic wall-clock time source anchored at construction
#[derive(Debug, Clone, Copy)]
pub struct SystemTimeSource {
    origin: Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp(self.origin.elapsed().as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screen_name_normalization() {
        assert_eq!(normalize_screen_name("Some User"), "someuser");
        assert_eq!(ScreenName::new("Some User"), ScreenName::new("someuser"));
        assert_ne!(ScreenName::new("someone"), ScreenName::new("someuser"));
    }

    #[test]
    fn test_kind_family_mapping() {
        for kind in [
            ConnectionKind::ChatDirectory,
            ConnectionKind::ChatRoom,
            ConnectionKind::IconStore,
            ConnectionKind::MailNotify,
        ] {
            let family = kind.service_family().unwrap();
            assert_eq!(ConnectionKind::from_service_family(family), Some(kind));
        }
        assert_eq!(ConnectionKind::Main.service_family(), None);
        assert!(!ConnectionKind::Auth.uses_cookie_login());
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::new(1_000);
        let later = t + Duration::from_secs(5);
        assert_eq!(later.as_millis(), 6_000);
        assert_eq!(later - t, 5_000);
        assert_eq!(t.until(later), Duration::from_secs(5));
        assert_eq!(later.until(t), Duration::ZERO);
    }

    #[test]
    fn test_message_flags() {
        let flags = MessageFlags::AUTO_RESPONSE.union(MessageFlags::ACK_REQUESTED);
        assert!(flags.contains(MessageFlags::AUTO_RESPONSE));
        assert!(!flags.contains(MessageFlags::OFFLINE));
        assert_eq!(MessageFlags::from_bits(flags.bits()), flags);
    }

    #[test]
    fn test_cookie_debug_hides_bytes() {
        let cookie = Cookie::new(vec![0xde, 0xad]);
        assert_eq!(format!("{:?}", cookie), "Cookie(2 bytes)");
    }
}
