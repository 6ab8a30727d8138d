//! Notifications emitted to the front end
//!
//! The engine never calls into its user; it queues [`Notification`]s which
//! the front end drains after each scheduler step.

use serde::Serialize;

use crate::errors::LoginFailure;
use crate::types::MessageFlags;

/// Something the user should hear about
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    LoginSucceeded {
        name: String,
    },
    LoginFailed {
        reason: LoginFailure,
    },
    MessageReceived {
        from: String,
        text: String,
        flags: MessageFlags,
    },
    BuddyOnline {
        name: String,
        idle_seconds: u32,
    },
    BuddyOffline {
        name: String,
    },
    Warned {
        /// Anonymous warnings carry no sender
        by: Option<String>,
        new_level: u16,
    },
    SearchResult {
        address: String,
        names: Vec<String>,
    },
    ProtocolError {
        detail: String,
    },
    /// An established session ended
    Disconnected {
        reason: String,
    },
    UserInfo {
        name: String,
        warning_level: u16,
        idle_seconds: u32,
        profile: Option<String>,
        away_message: Option<String>,
    },
    ChatJoined {
        room: String,
    },
    ChatUsersJoined {
        room: String,
        names: Vec<String>,
    },
    ChatUsersLeft {
        room: String,
        names: Vec<String>,
    },
    ChatMessage {
        room: String,
        from: String,
        text: String,
    },
}

impl Notification {
    /// Short stable name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::LoginSucceeded { .. } => "login_succeeded",
            Notification::LoginFailed { .. } => "login_failed",
            Notification::MessageReceived { .. } => "message_received",
            Notification::BuddyOnline { .. } => "buddy_online",
            Notification::BuddyOffline { .. } => "buddy_offline",
            Notification::Warned { .. } => "warned",
            Notification::SearchResult { .. } => "search_result",
            Notification::ProtocolError { .. } => "protocol_error",
            Notification::Disconnected { .. } => "disconnected",
            Notification::UserInfo { .. } => "user_info",
            Notification::ChatJoined { .. } => "chat_joined",
            Notification::ChatUsersJoined { .. } => "chat_users_joined",
            Notification::ChatUsersLeft { .. } => "chat_users_left",
            Notification::ChatMessage { .. } => "chat_message",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let note = Notification::LoginFailed {
            reason: LoginFailure::IncorrectCredentials,
        };
        let json = serde_json::to_string(&note).unwrap();
        assert_eq!(
            json,
            r#"{"event":"login_failed","reason":"incorrect-credentials"}"#
        );
        assert_eq!(note.kind(), "login_failed");
    }

    #[test]
    fn test_message_flags_serialize_as_bits() {
        let note = Notification::MessageReceived {
            from: "bob".into(),
            text: "hi".into(),
            flags: MessageFlags::AUTO_RESPONSE,
        };
        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["flags"], 1);
    }
}
