//! Engine configuration
//!
//! Every tunable the engine reads lives here, grouped by concern. All
//! structures are serde-friendly so front ends can layer them from files and
//! the environment; `Default` gives production values and
//! [`EngineConfig::testing`] tightens timeouts for deterministic tests.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{OwlchatError, Result};
use crate::protocol::auth::ClientIdentity;
use crate::rate::RatePolicy;

/// Default authorizer address
pub const DEFAULT_LOGIN_SERVER: &str = "login.oscar.aol.com:5190";

// ----------------------------------------------------------------------------
// Proxy Configuration
// ----------------------------------------------------------------------------

/// SOCKS5 proxy used for every outbound connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy `host:port`
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

// ----------------------------------------------------------------------------
// Timeout Configuration
// ----------------------------------------------------------------------------

/// Deadlines and periodic intervals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Whole-login deadline, from `login()` to ready
    pub login_secs: u64,
    /// Default expiry for keyed requests
    pub request_secs: u64,
    /// Keep-alive interval on the main connection
    pub keepalive_secs: u64,
    /// How often pending requests and deadlines are checked
    pub sweep_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            login_secs: 60,
            request_secs: 30,
            keepalive_secs: 60,
            sweep_interval_ms: 250,
        }
    }
}

impl TimeoutConfig {
    pub fn login(&self) -> Duration {
        Duration::from_secs(self.login_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// ----------------------------------------------------------------------------
// Reconnect Configuration
// ----------------------------------------------------------------------------

/// Retry policy for authorizer transport failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Automatic retries before the login is reported failed
    pub max_auth_retries: u32,
    /// Cooldown after the first failure
    pub base_backoff_ms: u64,
    /// Upper bound on the cooldown
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_auth_retries: 3,
            base_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl ReconnectConfig {
    /// Cooldown after the `attempt`-th consecutive failure (zero-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

// ----------------------------------------------------------------------------
// Engine Configuration
// ----------------------------------------------------------------------------

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Authorizer `host:port`
    pub login_server: String,
    pub proxy: Option<ProxyConfig>,
    /// Directory holding the legacy client binary for verification challenges
    pub binary_cache_dir: Option<PathBuf>,
    pub client: ClientIdentity,
    pub rate_policy: RatePolicy,
    pub timeouts: TimeoutConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            login_server: DEFAULT_LOGIN_SERVER.to_string(),
            proxy: None,
            binary_cache_dir: None,
            client: ClientIdentity::default(),
            rate_policy: RatePolicy::default(),
            timeouts: TimeoutConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            login_server: "auth.test:5190".to_string(),
            timeouts: TimeoutConfig {
                login_secs: 10,
                request_secs: 5,
                keepalive_secs: 30,
                sweep_interval_ms: 50,
            },
            reconnect: ReconnectConfig {
                max_auth_retries: 2,
                base_backoff_ms: 100,
                max_backoff_ms: 1_000,
            },
            ..Self::default()
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.login_server.trim().is_empty() {
            return Err(OwlchatError::config_error("login_server cannot be empty"));
        }
        if !self.login_server.contains(':') {
            return Err(OwlchatError::config_error(format!(
                "login_server '{}' must be host:port",
                self.login_server
            )));
        }
        if let Some(proxy) = &self.proxy {
            if !proxy.address.contains(':') {
                return Err(OwlchatError::config_error(format!(
                    "proxy address '{}' must be host:port",
                    proxy.address
                )));
            }
            if proxy.username.as_deref().is_some_and(|name| name.len() > 255)
                || proxy.password.as_deref().is_some_and(|pw| pw.len() > 255)
            {
                return Err(OwlchatError::config_error(
                    "proxy credentials are limited to 255 bytes",
                ));
            }
        }
        if self.rate_policy.warning_divisor == 0 || self.rate_policy.limit_divisor == 0 {
            return Err(OwlchatError::config_error("rate policy divisors cannot be zero"));
        }
        if self.timeouts.login_secs == 0 || self.timeouts.request_secs == 0 {
            return Err(OwlchatError::config_error("timeouts cannot be zero"));
        }
        if self.timeouts.keepalive_secs == 0 {
            return Err(OwlchatError::config_error("keepalive interval cannot be zero"));
        }
        if self.timeouts.sweep_interval_ms == 0 {
            return Err(OwlchatError::config_error("sweep interval cannot be zero"));
        }
        if self.reconnect.base_backoff_ms > self.reconnect.max_backoff_ms {
            return Err(OwlchatError::config_error(
                "base backoff cannot be greater than max backoff",
            ));
        }
        Ok(())
    }
}
