//! Role-tagged conversation turns

use serde::{Deserialize, Serialize};

/// Inbound speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "developer")]
    System,
    User,
    Assistant,
    /// Tool result fed back by the client
    #[serde(alias = "function")]
    Tool,
}

/// One turn of the conversation sent with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Roles the upstream understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamRole {
    User,
    Assistant,
}

/// The upstream has no system or tool role; those turns are sent as user turns.
impl From<Role> for UpstreamRole {
    fn from(role: Role) -> Self {
        match role {
            Role::System | Role::User | Role::Tool => UpstreamRole::User,
            Role::Assistant => UpstreamRole::Assistant,
        }
    }
}
