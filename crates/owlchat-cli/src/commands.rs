//! Command handlers for the owlchat CLI

use tracing::info;

use crate::app::OwlchatApp;
use crate::cli::Commands;
use crate::config::AppConfig;
use crate::error::Result;

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub fn execute(command: Commands, config: AppConfig) -> Result<()> {
        match command {
            Commands::Config => Self::handle_config_command(&config),
            Commands::Interactive => OwlchatApp::new(config)?.run_interactive(),
            Commands::Send { to, message } => Self::handle_send_command(config, &to, &message),
            Commands::Search { email } => Self::handle_search_command(config, &email),
        }
    }

    /// Print the effective configuration
    fn handle_config_command(config: &AppConfig) -> Result<()> {
        print!("{}", config.to_toml()?);
        Ok(())
    }

    fn handle_send_command(config: AppConfig, to: &str, message: &str) -> Result<()> {
        let mut app = OwlchatApp::new(config)?;
        app.send_once(to, message)
    }

    fn handle_search_command(config: AppConfig, email: &str) -> Result<()> {
        let mut app = OwlchatApp::new(config)?;
        let names = app.search(email)?;
        info!("Search for {} returned {} names", email, names.len());
        Ok(())
    }
}
