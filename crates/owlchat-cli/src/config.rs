//! owlchat CLI Configuration Management
//!
//! Configuration is layered with figment, later layers winning:
//! - Built-in defaults
//! - `owlchat.toml` in the working directory, then the per-user config file
//! - An explicit `--config` file
//! - Environment variables (`OWLCHAT_*`, nested keys separated by `__`)
//! - Command line flags

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use owlchat_core::{EngineConfig, ProxyConfig};

use crate::error::{CliError, Result};

/// Local configuration file name
pub const CONFIG_FILE_NAME: &str = "owlchat.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "OWLCHAT_";

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the owlchat CLI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Engine settings handed to `Engine::new`
    pub engine: EngineConfig,

    /// Account to sign on with
    pub account: AccountConfig,

    /// Front-end behavior
    pub cli: CliConfig,
}

/// Account credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub screen_name: Option<String>,
    /// Better supplied through `OWLCHAT_ACCOUNT__PASSWORD` than a file
    pub password: Option<String>,
}

/// CLI-specific configuration options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Enable verbose logging output
    pub verbose: bool,

    /// Print notifications as JSON lines
    pub json: bool,

    /// Longest wait inside one engine iteration (in milliseconds)
    pub poll_interval_ms: u64,

    /// How long one-shot commands wait for the server (in seconds)
    pub wait_secs: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            json: false,
            poll_interval_ms: 100,
            wait_secs: 90,
        }
    }
}

/// Values taken from command line flags
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_file: Option<PathBuf>,
    pub server: Option<String>,
    pub proxy: Option<String>,
    pub screen_name: Option<String>,
    pub json: bool,
    pub verbose: bool,
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration with the standard priority order
    pub fn load(overrides: &Overrides) -> Result<Self> {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE_NAME));
        if let Some(path) = Self::default_config_path() {
            figment = figment.merge(Toml::file(path));
        }
        if let Some(path) = &overrides.config_file {
            if !path.exists() {
                return Err(CliError::Config(format!(
                    "configuration file {} does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: AppConfig = figment.extract()?;
        config.apply_overrides(overrides);
        if config.engine.binary_cache_dir.is_none() {
            config.engine.binary_cache_dir = Self::default_cache_dir();
        }
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(server) = &overrides.server {
            self.engine.login_server = server.clone();
        }
        if let Some(address) = &overrides.proxy {
            self.engine.proxy = Some(ProxyConfig {
                address: address.clone(),
                username: None,
                password: None,
            });
        }
        if let Some(name) = &overrides.screen_name {
            self.account.screen_name = Some(name.clone());
        }
        self.cli.json |= overrides.json;
        self.cli.verbose |= overrides.verbose;
    }

    /// Per-user configuration file (`<config dir>/owlchat/config.toml`)
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("owlchat").join("config.toml"))
    }

    /// Where the legacy client binary is looked for by default
    pub fn default_cache_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("owlchat"))
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        if self.cli.poll_interval_ms == 0 {
            return Err(CliError::Config(
                "poll interval must be greater than 0".to_string(),
            ));
        }
        if self.cli.wait_secs == 0 {
            return Err(CliError::Config("wait time must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Screen name and password, both required to sign on
    pub fn credentials(&self) -> Result<(String, String)> {
        let name = self
            .account
            .screen_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| {
                CliError::Config("no screen name: pass --screen-name or set account.screen_name".into())
            })?;
        let password = self.account.password.clone().ok_or_else(|| {
            CliError::Config(format!("no password: set {}ACCOUNT__PASSWORD", ENV_PREFIX))
        })?;
        Ok((name, password))
    }

    /// Render as TOML with the password masked
    pub fn to_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.account.password.is_some() {
            shown.account.password = Some("********".to_string());
        }
        Ok(toml::to_string_pretty(&shown)?)
    }

    /// Save configuration to a specific file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_layers_file_env_and_flags() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE_NAME,
                r#"
                [engine]
                login_server = "login.example.net:5190"

                [account]
                screen_name = "alice"

                [cli]
                poll_interval_ms = 250
                "#,
            )?;
            jail.set_env("OWLCHAT_ACCOUNT__PASSWORD", "secret");
            jail.set_env("OWLCHAT_CLI__WAIT_SECS", "5");

            let overrides = Overrides {
                screen_name: Some("bob".into()),
                json: true,
                ..Overrides::default()
            };
            let config = AppConfig::load(&overrides).expect("config");
            assert_eq!(config.engine.login_server, "login.example.net:5190");
            assert_eq!(config.cli.poll_interval_ms, 250);
            assert_eq!(config.cli.wait_secs, 5);
            assert!(config.cli.json);
            assert_eq!(
                config.credentials().unwrap(),
                ("bob".to_string(), "secret".to_string())
            );
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file_rejected() {
        Jail::expect_with(|_jail| {
            let overrides = Overrides {
                config_file: Some(PathBuf::from("nope.toml")),
                ..Overrides::default()
            };
            assert!(matches!(AppConfig::load(&overrides), Err(CliError::Config(_))));
            Ok(())
        });
    }

    #[test]
    fn test_invalid_engine_config_rejected() {
        let mut config = AppConfig::default();
        config.engine.login_server = "no-port".into();
        assert!(matches!(config.validate(), Err(CliError::Engine(_))));
    }

    #[test]
    fn test_credentials_required() {
        let config = AppConfig::default();
        assert!(config.credentials().is_err());
    }

    #[test]
    fn test_toml_masks_password() {
        let mut config = AppConfig::default();
        config.account.password = Some("hunter2".into());
        let rendered = config.to_toml().unwrap();
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("login_server"));
    }
}
