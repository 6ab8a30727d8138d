//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print notifications as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Login server as host:port
    #[arg(long)]
    pub server: Option<String>,

    /// SOCKS5 proxy as host:port
    #[arg(long)]
    pub proxy: Option<String>,

    /// Screen name to sign on with
    #[arg(short, long)]
    pub screen_name: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sign on and read commands from standard input
    Interactive,
    /// Sign on, send one message and sign off
    Send {
        /// Recipient screen name
        #[arg(short, long)]
        to: String,
        /// Message text
        message: String,
    },
    /// Sign on and look up screen names registered to an email address
    Search {
        /// Email address to search for
        email: String,
    },
    /// Print the effective configuration as TOML
    Config,
}
