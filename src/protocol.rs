//! WebSocket chat envelope
//!
//! Every frame is a JSON object tagged by `type`. Streaming replies arrive as
//! `use-chat-response` frames with `done: false`, closed by exactly one frame
//! with `done: true` and an empty body.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Unknown roles are treated as user input
    pub fn parse(value: &str) -> Self {
        match value {
            "system" => Self::System,
            "assistant" => Self::Assistant,
            _ => Self::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    #[serde(default, rename = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Frames sent by the browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Full conversation; the last user message is answered
    UseChatRequest {
        id: String,
        messages: Vec<ChatMessage>,
    },
    ChatClear,
    /// Replace the stored history
    ChatMessages { messages: Vec<ChatMessage> },
    ChatRequestCancel { id: String },
}

/// Frames sent to the browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    ChatMessages {
        messages: Vec<ChatMessage>,
    },
    UseChatResponse {
        id: String,
        body: String,
        done: bool,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        error: bool,
    },
    ChatClear,
}

impl ServerMessage {
    pub fn chunk(id: &str, body: impl Into<String>) -> Self {
        Self::UseChatResponse {
            id: id.to_owned(),
            body: body.into(),
            done: false,
            error: false,
        }
    }

    pub fn done(id: &str) -> Self {
        Self::UseChatResponse {
            id: id.to_owned(),
            body: String::new(),
            done: true,
            error: false,
        }
    }

    pub fn failed(id: &str, message: impl Into<String>) -> Self {
        Self::UseChatResponse {
            id: id.to_owned(),
            body: message.into(),
            done: false,
            error: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ChatRole, ClientMessage, ServerMessage};

    #[test]
    fn parses_client_frames() {
        let frame: ClientMessage = serde_json::from_value(json!({
            "type": "use-chat-request",
            "id": "req-1",
            "messages": [{ "id": "m1", "role": "user", "content": "hi" }]
        }))
        .expect("parse");
        match frame {
            ClientMessage::UseChatRequest { id, messages } => {
                assert_eq!(id, "req-1");
                assert_eq!(messages[0].role, ChatRole::User);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let cancel: ClientMessage =
            serde_json::from_str(r#"{"type":"chat-request-cancel","id":"req-1"}"#).expect("parse");
        assert_eq!(
            cancel,
            ClientMessage::ChatRequestCancel {
                id: "req-1".to_owned()
            }
        );
        let clear: ClientMessage = serde_json::from_str(r#"{"type":"chat-clear"}"#).expect("parse");
        assert_eq!(clear, ClientMessage::ChatClear);
    }

    #[test]
    fn terminator_has_empty_body_and_no_error_field() {
        let value = serde_json::to_value(ServerMessage::done("req-1")).expect("serialize");
        assert_eq!(
            value,
            json!({ "type": "use-chat-response", "id": "req-1", "body": "", "done": true })
        );
        let failed = serde_json::to_value(ServerMessage::failed("req-1", "boom")).expect("serialize");
        assert_eq!(failed["error"], json!(true));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"bogus"}"#).is_err());
    }
}
