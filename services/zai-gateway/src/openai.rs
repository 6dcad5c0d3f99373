//! OpenAI chat-completions wire types

use serde::{Deserialize, Serialize};
use zai_protocol::{Role, Turn};

use crate::error::GatewayError;

/// Stream terminator frame.
pub const SSE_DONE: &str = "data: [DONE]\n\n";

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

/// Message content: a plain string or a list of typed parts.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageContent {
    /// Text content; non-text parts are dropped, text parts joined by newlines.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl ChatCompletionRequest {
    /// Validate and convert the message list into upstream turns.
    pub fn turns(&self) -> Result<Vec<Turn>, GatewayError> {
        if self.model.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("model is required".into()));
        }
        if self.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "messages must not be empty".into(),
            ));
        }
        Ok(self
            .messages
            .iter()
            .map(|m| {
                let content = m.content.as_ref().map(MessageContent::text).unwrap_or_default();
                Turn::new(m.role, content)
            })
            .collect())
    }
}

/// Fresh completion id.
pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

fn unix_secs() -> u64 {
    crate::audit::now_millis() / 1000
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: &'static str,
}

/// Non-streaming response body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
}

impl ChatCompletion {
    pub fn new(id: String, model: String, content: String) -> Self {
        Self {
            id,
            object: "chat.completion",
            created: unix_secs(),
            model,
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content,
                },
                finish_reason: "stop",
            }],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<&'static str>,
}

/// One streaming frame.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    fn new(id: &str, model: &str, delta: Delta, finish_reason: Option<&'static str>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created: unix_secs(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Content frame; the first one of a stream also carries the role.
    pub fn content(id: &str, model: &str, text: String, first: bool) -> Self {
        let delta = Delta {
            role: first.then_some("assistant"),
            content: Some(text),
        };
        Self::new(id, model, delta, None)
    }

    /// Closing frame with an empty delta.
    pub fn stop(id: &str, model: &str) -> Self {
        Self::new(id, model, Delta::default(), Some("stop"))
    }

    /// Encode as an SSE `data:` frame.
    pub fn to_sse(&self) -> String {
        // Serializing a struct of strings and integers cannot fail
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("data: {json}\n\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: &'static str,
}

/// `/v1/models` response body.
#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

impl ModelList {
    pub fn new(models: &[String]) -> Self {
        let created = unix_secs();
        Self {
            object: "list",
            data: models
                .iter()
                .map(|id| ModelEntry {
                    id: id.clone(),
                    object: "model",
                    created,
                    owned_by: "zai",
                })
                .collect(),
        }
    }
}
