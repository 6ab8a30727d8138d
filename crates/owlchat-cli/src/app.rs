//! Main application logic for the owlchat CLI
//!
//! [`OwlchatApp`] drives one engine from the main thread. The interactive
//! mode reads standard input on a helper thread and hands lines over a
//! channel, so the engine itself never leaves the thread that built it.

use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use owlchat_core::{MessageFlags, Notification};
use owlchat_runtime::{Engine, LoginState, DEFAULT_GROUP};

use crate::config::AppConfig;
use crate::error::{CliError, Result};
use crate::input::{self, InputCommand};

/// Iterations run after a one-shot command so queued frames reach the wire
const FLUSH_ITERATIONS: usize = 5;

// ----------------------------------------------------------------------------
// Notification Rendering
// ----------------------------------------------------------------------------

/// One-line human-readable rendering
pub fn describe(notification: &Notification) -> String {
    match notification {
        Notification::LoginSucceeded { name } => format!("Signed on as {}", name),
        Notification::LoginFailed { reason } => format!("Login failed: {}", reason.user_message()),
        Notification::MessageReceived { from, text, flags } => {
            if flags.contains(MessageFlags::AUTO_RESPONSE) {
                format!("{} (auto-response): {}", from, text)
            } else {
                format!("{}: {}", from, text)
            }
        }
        Notification::BuddyOnline { name, idle_seconds } if *idle_seconds > 0 => {
            format!("{} is online (idle {}m)", name, idle_seconds / 60)
        }
        Notification::BuddyOnline { name, .. } => format!("{} is online", name),
        Notification::BuddyOffline { name } => format!("{} went offline", name),
        Notification::Warned { by, new_level } => match by {
            Some(by) => format!("Warned by {}; warning level now {}%", by, new_level / 10),
            None => format!("Warned anonymously; warning level now {}%", new_level / 10),
        },
        Notification::SearchResult { address, names } if names.is_empty() => {
            format!("No screen names registered to {}", address)
        }
        Notification::SearchResult { address, names } => {
            format!("{} is registered to: {}", address, names.join(", "))
        }
        Notification::ProtocolError { detail } => format!("Protocol error: {}", detail),
        Notification::Disconnected { reason } => format!("Disconnected: {}", reason),
        Notification::UserInfo {
            name,
            warning_level,
            idle_seconds,
            profile,
            away_message,
        } => {
            let mut text = format!(
                "{}: warning {}%, idle {}m",
                name,
                warning_level / 10,
                idle_seconds / 60
            );
            if let Some(away) = away_message {
                text.push_str(&format!(", away: {}", away));
            }
            if let Some(profile) = profile {
                text.push_str(&format!("\n  {}", profile));
            }
            text
        }
        Notification::ChatJoined { room } => format!("Joined {}", room),
        Notification::ChatUsersJoined { room, names } => {
            format!("[{}] {} joined", room, names.join(", "))
        }
        Notification::ChatUsersLeft { room, names } => {
            format!("[{}] {} left", room, names.join(", "))
        }
        Notification::ChatMessage { room, from, text } => format!("[{}] {}: {}", room, from, text),
    }
}

/// Write one notification as a JSON line or as text
pub fn emit<W: Write>(out: &mut W, notification: &Notification, json: bool) -> Result<()> {
    if json {
        writeln!(out, "{}", serde_json::to_string(notification)?)?;
    } else {
        writeln!(out, "{}", describe(notification))?;
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Application
// ----------------------------------------------------------------------------

pub struct OwlchatApp {
    engine: Engine,
    config: AppConfig,
}

impl OwlchatApp {
    /// Application on real TCP
    pub fn new(config: AppConfig) -> Result<Self> {
        let engine = Engine::new(config.engine.clone())?;
        Ok(Self::with_engine(engine, config))
    }

    pub fn with_engine(engine: Engine, config: AppConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.cli.poll_interval_ms)
    }

    fn wait_limit(&self) -> Duration {
        Duration::from_secs(self.config.cli.wait_secs)
    }

    /// One engine iteration; notifications are printed and returned
    fn step(&mut self) -> Result<Vec<Notification>> {
        self.engine.run_once(Some(self.poll_interval()))?;
        let notifications = self.engine.drain_notifications();
        let mut stdout = io::stdout().lock();
        for notification in &notifications {
            emit(&mut stdout, notification, self.config.cli.json)?;
        }
        stdout.flush()?;
        Ok(notifications)
    }

    /// Step until `done` picks a notification out, or the wait limit passes
    fn wait_for<T>(
        &mut self,
        what: &str,
        mut done: impl FnMut(&Notification) -> Option<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + self.wait_limit();
        while Instant::now() < deadline {
            for notification in self.step()? {
                if let Some(found) = done(&notification) {
                    return Ok(found);
                }
                if let Notification::Disconnected { reason } = notification {
                    return Err(CliError::Disconnected(reason));
                }
            }
        }
        Err(CliError::Timeout(what.to_string()))
    }

    /// Sign on with the configured account and wait for the outcome
    pub fn sign_on(&mut self) -> Result<String> {
        let (screen_name, password) = self.config.credentials()?;
        info!("Signing on as {} via {}", screen_name, self.config.engine.login_server);
        self.engine.login(&screen_name, &password)?;

        let outcome = self.wait_for("login", |notification| match notification {
            Notification::LoginSucceeded { name } => Some(Ok(name.clone())),
            Notification::LoginFailed { reason } => Some(Err(reason.user_message())),
            _ => None,
        })?;
        outcome.map_err(CliError::LoginFailed)
    }

    /// Sign off and give the close frame a chance to go out
    pub fn sign_off(&mut self) -> Result<()> {
        if self.engine.login_state() == LoginState::Disconnected {
            return Ok(());
        }
        self.engine.logout()?;
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        for _ in 0..FLUSH_ITERATIONS {
            self.step()?;
        }
        Ok(())
    }

    /// Sign on, deliver one message and sign off
    pub fn send_once(&mut self, to: &str, text: &str) -> Result<()> {
        self.sign_on()?;
        self.engine.send_message(to, text, MessageFlags::NONE)?;
        self.flush()?;
        info!("Message sent to {}", to);
        self.sign_off()
    }

    /// Sign on, look an email address up and sign off
    pub fn search(&mut self, email: &str) -> Result<Vec<String>> {
        self.sign_on()?;
        self.engine.search_by_email(email)?;
        let names = self.wait_for("search result", |notification| match notification {
            Notification::SearchResult { names, .. } => Some(names.clone()),
            _ => None,
        })?;
        self.sign_off()?;
        Ok(names)
    }

    // ------------------------------------------------------------------------
    // Interactive Mode
    // ------------------------------------------------------------------------

    /// Sign on, then run commands from standard input until `/quit` or EOF
    pub fn run_interactive(&mut self) -> Result<()> {
        let name = self.sign_on()?;
        if !self.config.cli.json {
            println!("Type /help for commands.");
        }
        debug!("Interactive session for {} started", name);

        let lines = spawn_stdin_reader();
        loop {
            for notification in self.step()? {
                if let Notification::Disconnected { reason } = notification {
                    return Err(CliError::Disconnected(reason));
                }
            }

            match lines.try_recv() {
                Ok(line) => match input::parse_line(&line) {
                    Ok(Some(InputCommand::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(err) = self.execute(command) {
                            eprintln!("{}", err);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => eprintln!("{}", err),
                },
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    debug!("Standard input closed");
                    break;
                }
            }
        }
        self.sign_off()
    }

    /// Run one interactive command
    pub fn execute(&mut self, command: InputCommand) -> Result<()> {
        match command {
            InputCommand::Message { to, text } => {
                self.engine.send_message(&to, &text, MessageFlags::NONE)?
            }
            InputCommand::AddBuddy { name, group } => self
                .engine
                .add_buddy(&name, group.as_deref().unwrap_or(DEFAULT_GROUP))?,
            InputCommand::RemoveBuddy { name, group } => self
                .engine
                .remove_buddy(&name, group.as_deref().unwrap_or(DEFAULT_GROUP))?,
            InputCommand::Search { email } => self.engine.search_by_email(&email)?,
            InputCommand::Info { name } => self.engine.get_user_info(&name)?,
            InputCommand::Join { room, exchange } => self.engine.join_room(&room, exchange)?,
            InputCommand::Say { room, text } => self.engine.send_chat_message(&room, &text)?,
            InputCommand::Leave { room } => self.engine.leave_room(&room)?,
            InputCommand::Stats => {
                let stats = self.engine.session().stats();
                if self.config.cli.json {
                    println!("{}", serde_json::to_string(stats)?);
                } else {
                    println!("{:#?}", stats);
                }
            }
            InputCommand::Help => println!("{}", input::HELP),
            InputCommand::Quit => self.sign_off()?,
        }
        Ok(())
    }
}

/// Forward standard input lines; the channel closes at EOF
fn spawn_stdin_reader() -> Receiver<String> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if sender.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("Failed to read standard input: {}", err);
                    break;
                }
            }
        }
    });
    receiver
}
