//! Interactive command line parsing
//!
//! Lines starting with `/` are commands; anything else is rejected so a
//! stray line never reaches the wire.

use crate::error::{CliError, Result};

/// Public chat exchange used when `/join` names none
pub const DEFAULT_EXCHANGE: u16 = 4;

pub const HELP: &str = "\
/msg <name> <text>        send an instant message
/add <name> [group]       add a buddy
/remove <name> [group]    remove a buddy
/search <email>           find screen names registered to an address
/info <name>              show a user's profile
/join <room> [exchange]   join or create a chat room
/say <room> <text>        speak in a joined room
/leave <room>             leave a room
/stats                    show session counters
/help                     show this list
/quit                     sign off and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    Message { to: String, text: String },
    AddBuddy { name: String, group: Option<String> },
    RemoveBuddy { name: String, group: Option<String> },
    Search { email: String },
    Info { name: String },
    Join { room: String, exchange: u16 },
    Say { room: String, text: String },
    Leave { room: String },
    Stats,
    Help,
    Quit,
}

/// Split off the first whitespace-delimited word
fn split_word(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    match input.find(char::is_whitespace) {
        Some(at) => Some((&input[..at], input[at..].trim_start())),
        None => Some((input, "")),
    }
}

fn usage(text: &str) -> CliError {
    CliError::Command(format!("usage: {}", text))
}

/// Name plus the rest of the line as free text
fn name_and_text(args: &str, form: &str) -> Result<(String, String)> {
    let (name, text) = split_word(args).ok_or_else(|| usage(form))?;
    if text.trim().is_empty() {
        return Err(usage(form));
    }
    Ok((name.to_string(), text.trim_end().to_string()))
}

/// Name plus an optional trailing group (which may contain spaces)
fn name_and_group(args: &str, form: &str) -> Result<(String, Option<String>)> {
    let (name, rest) = split_word(args).ok_or_else(|| usage(form))?;
    let group = rest.trim();
    Ok((
        name.to_string(),
        (!group.is_empty()).then(|| group.to_string()),
    ))
}

fn single(args: &str, form: &str) -> Result<String> {
    match split_word(args) {
        Some((word, "")) => Ok(word.to_string()),
        _ => Err(usage(form)),
    }
}

/// Parse one line; `Ok(None)` for a blank line
pub fn parse_line(line: &str) -> Result<Option<InputCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(body) = line.strip_prefix('/') else {
        return Err(CliError::Command(
            "commands start with '/'; try /help".to_string(),
        ));
    };
    let (verb, args) = split_word(body).ok_or_else(|| usage("/help"))?;

    let command = match verb.to_ascii_lowercase().as_str() {
        "msg" | "m" => {
            let (to, text) = name_and_text(args, "/msg <name> <text>")?;
            InputCommand::Message { to, text }
        }
        "add" => {
            let (name, group) = name_and_group(args, "/add <name> [group]")?;
            InputCommand::AddBuddy { name, group }
        }
        "remove" | "rm" => {
            let (name, group) = name_and_group(args, "/remove <name> [group]")?;
            InputCommand::RemoveBuddy { name, group }
        }
        "search" => InputCommand::Search {
            email: single(args, "/search <email>")?,
        },
        "info" => InputCommand::Info {
            name: single(args, "/info <name>")?,
        },
        "join" => {
            let (room, rest) = split_word(args).ok_or_else(|| usage("/join <room> [exchange]"))?;
            let exchange = match rest.trim() {
                "" => DEFAULT_EXCHANGE,
                value => value
                    .parse()
                    .map_err(|_| CliError::Command(format!("invalid exchange '{}'", value)))?,
            };
            InputCommand::Join {
                room: room.to_string(),
                exchange,
            }
        }
        "say" => {
            let (room, text) = name_and_text(args, "/say <room> <text>")?;
            InputCommand::Say { room, text }
        }
        "leave" => InputCommand::Leave {
            room: single(args, "/leave <room>")?,
        },
        "stats" => InputCommand::Stats,
        "help" | "?" => InputCommand::Help,
        "quit" | "exit" => InputCommand::Quit,
        other => {
            return Err(CliError::Command(format!(
                "unknown command '/{}'; try /help",
                other
            )))
        }
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> InputCommand {
        parse_line(line).unwrap().unwrap()
    }

    #[test]
    fn test_message_keeps_spacing_in_text() {
        assert_eq!(
            parse("/msg bob  hello   there "),
            InputCommand::Message {
                to: "bob".into(),
                text: "hello   there".into()
            }
        );
    }

    #[test]
    fn test_buddy_group_is_optional() {
        assert_eq!(
            parse("/add bob"),
            InputCommand::AddBuddy {
                name: "bob".into(),
                group: None
            }
        );
        assert_eq!(
            parse("/remove bob Old Friends"),
            InputCommand::RemoveBuddy {
                name: "bob".into(),
                group: Some("Old Friends".into())
            }
        );
    }

    #[test]
    fn test_join_exchange() {
        assert_eq!(
            parse("/join lobby"),
            InputCommand::Join {
                room: "lobby".into(),
                exchange: DEFAULT_EXCHANGE
            }
        );
        assert_eq!(
            parse("/JOIN lobby 5"),
            InputCommand::Join {
                room: "lobby".into(),
                exchange: 5
            }
        );
        assert!(parse_line("/join lobby five").is_err());
    }

    #[test]
    fn test_blank_and_plain_lines() {
        assert_eq!(parse_line("   ").unwrap(), None);
        assert!(matches!(parse_line("hello"), Err(CliError::Command(_))));
    }

    #[test]
    fn test_missing_arguments_rejected() {
        assert!(parse_line("/msg bob").is_err());
        assert!(parse_line("/search").is_err());
        assert!(parse_line("/info a b").is_err());
        assert!(parse_line("/frobnicate").is_err());
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse("/quit"), InputCommand::Quit);
        assert_eq!(parse("/help"), InputCommand::Help);
        assert_eq!(parse("/stats"), InputCommand::Stats);
        assert_eq!(
            parse("/say lobby hi all"),
            InputCommand::Say {
                room: "lobby".into(),
                text: "hi all".into()
            }
        );
    }
}
