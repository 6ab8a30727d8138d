//! Error handling for the owlchat CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("owlchat engine error: {0}")]
    Engine(#[from] owlchat_core::OwlchatError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration loading failed: {0}")]
    Figment(#[from] figment::Error),

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Session ended: {0}")]
    Disconnected(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Invalid command: {0}")]
    Command(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
