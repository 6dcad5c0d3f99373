//! Upstream request payload
//!
//! The upstream stores a conversation as a tree of message nodes linked by
//! parent and children ids. Each request sends the whole tree: one node per
//! inbound turn, chained in order, plus an empty assistant node marking the
//! generation target. Every call gets a fresh conversation id; nothing is
//! carried across requests.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use uuid::Uuid;

use crate::message::{Turn, UpstreamRole};

/// One message node of the conversation tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub parent_id: Option<String>,
    pub children_ids: Vec<String>,
    pub role: UpstreamRole,
    pub content: String,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_idx: Option<u32>,
}

impl Node {
    fn new(
        role: UpstreamRole,
        content: String,
        parent_id: Option<String>,
        model: &str,
        timestamp: u64,
    ) -> Self {
        let (models, model, model_name, model_idx) = match role {
            UpstreamRole::User => (Some(vec![model.to_string()]), None, None, None),
            UpstreamRole::Assistant => (
                None,
                Some(model.to_string()),
                Some(model.to_string()),
                Some(0),
            ),
        };
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id,
            children_ids: Vec::new(),
            role,
            content,
            timestamp,
            models,
            model,
            model_name,
            model_idx,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct History {
    pub messages: BTreeMap<String, Node>,
    pub current_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Chat {
    pub models: Vec<String>,
    pub history: History,
    pub messages: Vec<Node>,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub files: Vec<serde_json::Value>,
}

/// JSON body of an upstream chat call.
#[derive(Debug, Clone, Serialize)]
pub struct ChatPayload {
    pub chat: Chat,
}

/// A translated request, ready to send.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub conversation_id: String,
    pub payload: ChatPayload,
}

/// Translate inbound turns into the upstream's conversation tree.
///
/// System turns become user nodes. The trailing assistant placeholder has
/// empty content and is the tree's current node.
pub fn build_request(turns: &[Turn], model: &str) -> UpstreamRequest {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let mut nodes: Vec<Node> = Vec::with_capacity(turns.len() + 1);
    for turn in turns {
        let parent_id = nodes.last().map(|n| n.id.clone());
        let node = Node::new(
            turn.role.into(),
            turn.content.clone(),
            parent_id,
            model,
            timestamp,
        );
        link(&mut nodes, node);
    }

    let placeholder = Node::new(
        UpstreamRole::Assistant,
        String::new(),
        nodes.last().map(|n| n.id.clone()),
        model,
        timestamp,
    );
    let current_id = placeholder.id.clone();
    link(&mut nodes, placeholder);

    let history = nodes
        .iter()
        .map(|node| (node.id.clone(), node.clone()))
        .collect();

    UpstreamRequest {
        conversation_id: Uuid::new_v4().to_string(),
        payload: ChatPayload {
            chat: Chat {
                models: vec![model.to_string()],
                history: History {
                    messages: history,
                    current_id,
                },
                messages: nodes,
                params: serde_json::Map::new(),
                files: Vec::new(),
            },
        },
    }
}

/// Append `node`, registering it as a child of the current tail.
fn link(nodes: &mut Vec<Node>, node: Node) {
    if let Some(parent) = nodes.last_mut() {
        parent.children_ids.push(node.id.clone());
    }
    nodes.push(node);
}
