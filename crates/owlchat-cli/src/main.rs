//! owlchat CLI entry point

use clap::Parser;
use tracing::{error, info};

use owlchat_cli::{
    cli::Cli,
    commands::CommandDispatcher,
    config::{AppConfig, Overrides},
    error::Result,
};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("Command execution failed: {}", e);
        eprintln!("owlchat: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let overrides = Overrides {
        config_file: cli.config.clone(),
        server: cli.server.clone(),
        proxy: cli.proxy.clone(),
        screen_name: cli.screen_name.clone(),
        json: cli.json,
        verbose: cli.verbose,
    };
    let config = AppConfig::load(&overrides)?;

    // Initialize logging
    setup_logging(config.cli.verbose);

    CommandDispatcher::execute(cli.command, config)?;
    info!("owlchat exited successfully");
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
