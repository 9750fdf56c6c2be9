use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier used for a conversation that has not been persisted yet.
pub const NEW_CONVERSATION_ID: &str = "new";

/// Title used when no message content is available to derive one from.
pub const DEFAULT_TITLE: &str = "New Chat";

/// Titles are cut to this many characters of the first message.
pub const TITLE_MAX_CHARS: usize = 50;

// Who authored a message. `System` only ever appears on the outbound wire
// (configured system prompt); stored conversations hold user/assistant only.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Represents a single message in a conversation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    #[serde(default = "new_message_id")]
    pub id: String,
    pub role: Role,
    pub content: String,
    // Milliseconds since the Unix epoch
    #[serde(default = "now_millis")]
    pub timestamp: i64,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role,
            content: content.into(),
            timestamp: now_millis(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Returns a copy of this message with `delta` appended to its content.
    /// Identity and timestamp are preserved.
    pub fn with_appended(&self, delta: &str) -> Self {
        let mut content = String::with_capacity(self.content.len() + delta.len());
        content.push_str(&self.content);
        content.push_str(delta);
        Self {
            id: self.id.clone(),
            role: self.role,
            content,
            timestamp: self.timestamp,
        }
    }
}

/// The role+content pair sent to (and accepted from) chat endpoints.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
        }
    }
}

/// A stored conversation belonging to one user.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistory {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Derives a conversation title from the first message, truncated to
/// [`TITLE_MAX_CHARS`] characters.
pub fn derive_title(messages: &[Message]) -> String {
    match messages.first() {
        Some(first) if !first.content.trim().is_empty() => {
            first.content.chars().take(TITLE_MAX_CHARS).collect()
        }
        _ => DEFAULT_TITLE.to_string(),
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_truncated_on_char_boundary() {
        let long = "é".repeat(80);
        let title = derive_title(&[Message::user(long)]);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS);
    }

    #[test]
    fn title_falls_back_when_empty() {
        assert_eq!(derive_title(&[]), DEFAULT_TITLE);
        assert_eq!(derive_title(&[Message::user("   ")]), DEFAULT_TITLE);
    }

    #[test]
    fn appended_message_keeps_identity() {
        let msg = Message::assistant("Hi");
        let next = msg.with_appended(" there");
        assert_eq!(next.id, msg.id);
        assert_eq!(next.timestamp, msg.timestamp);
        assert_eq!(next.content, "Hi there");
        assert_eq!(msg.content, "Hi");
    }

    #[test]
    fn history_serializes_camel_case() {
        let history = ChatHistory {
            id: "c1".to_string(),
            user_id: "user-1".to_string(),
            title: DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
            created_at: 1,
            updated_at: 2,
        };
        let json = serde_json::to_value(&history).unwrap();
        assert_eq!(json["userId"], "user-1");
        assert_eq!(json["createdAt"], 1);
        assert_eq!(json["updatedAt"], 2);
    }

    #[test]
    fn role_rejects_unknown_values() {
        let parsed: Result<WireMessage, _> =
            serde_json::from_str(r#"{"role":"tool","content":"x"}"#);
        assert!(parsed.is_err());
    }
}
