//! owlchat CLI library
//!
//! Configuration layering, command parsing and the driver loop behind the
//! `owlchat` binary.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod input;

pub use app::OwlchatApp;
pub use cli::{Cli, Commands};
pub use config::AppConfig;
pub use error::{CliError, Result};
pub use input::InputCommand;
