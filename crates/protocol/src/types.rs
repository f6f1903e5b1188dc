//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// A chat session known to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub directory: String,
    pub title: String,
    /// Whether this client created the session (as opposed to discovering it)
    #[serde(default)]
    pub created_by_client: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Token accounting reported by the backend for one assistant message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    #[serde(default)]
    pub reasoning: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
}

impl TokenUsage {
    /// Tokens occupying the context window after this message
    pub fn total(&self) -> u64 {
        self.input + self.output + self.reasoning + self.cache_read + self.cache_write
    }
}

/// Message metadata, without its parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    /// Set on compaction summaries
    #[serde(default)]
    pub summary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

impl MessageInfo {
    /// Placeholder info for a message first seen through one of its parts
    pub fn placeholder(id: &str, session_id: &str, role: MessageRole, created_at: u64) -> Self {
        Self {
            id: id.to_string(),
            session_id: session_id.to_string(),
            role,
            created_at,
            completed_at: None,
            tokens: None,
            summary: false,
            finish: None,
            provider_id: None,
            model_id: None,
        }
    }

    /// True once the backend reported the message as finished
    pub fn is_finished(&self) -> bool {
        self.finish.is_some() || self.completed_at.is_some()
    }
}

/// Execution state of a tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

/// Part payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartKind {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    Tool {
        call_id: String,
        tool: String,
        status: ToolStatus,
        #[serde(default)]
        input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    File {
        mime: String,
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    StepFinish {
        #[serde(skip_serializing_if = "Option::is_none")]
        tokens: Option<TokenUsage>,
    },
}

/// One ordered piece of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    #[serde(flatten)]
    pub kind: PartKind,
}

impl Part {
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            PartKind::Text { text } | PartKind::Reasoning { text } => Some(text),
            _ => None,
        }
    }

    /// Append streamed text to a text or reasoning part. Returns false for
    /// part kinds that carry no text.
    pub fn append_delta(&mut self, delta: &str) -> bool {
        match &mut self.kind {
            PartKind::Text { text } | PartKind::Reasoning { text } => {
                text.push_str(delta);
                true
            }
            _ => false,
        }
    }
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub info: MessageInfo,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Insert or replace a part by id, keeping arrival order for new parts
    pub fn upsert_part(&mut self, part: Part) {
        match self.parts.iter_mut().find(|p| p.id == part.id) {
            Some(existing) => *existing = part,
            None => self.parts.push(part),
        }
    }
}

/// Pagination direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadDirection {
    /// Older messages
    Up,
    /// Newer messages
    Down,
}

/// A page of messages returned by the backend, oldest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more_above: bool,
    pub has_more_below: bool,
}

/// Per-session bookkeeping for the in-memory window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMemoryState {
    pub materialized: bool,
    pub loaded_count: usize,
    pub has_more_above: bool,
    pub has_more_below: bool,
    pub last_access_at: u64,
    pub streaming: bool,
}

/// Where the viewport is centered for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportAnchor {
    pub index: usize,
    pub message_id: String,
    /// Set when the session is re-activated and the UI still has to scroll
    /// back to the anchor
    pub pending: bool,
}

/// Streaming phase of one in-flight message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    Streaming,
    Cooldown,
    Completed,
}

/// Lifecycle record of a streamed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamLifecycle {
    pub message_id: String,
    pub session_id: String,
    pub phase: StreamPhase,
    pub started_at: u64,
    pub last_update_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

/// Coarse activity of a session, projected from its message lifecycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityPhase {
    #[default]
    Idle,
    Busy,
    Cooldown,
}

/// Context window usage for the latest assistant message of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextUsage {
    pub total_tokens: u64,
    pub percentage: f64,
    pub context_limit: u64,
    pub output_limit: Option<u64>,
    pub normalized_output: u64,
    pub threshold_limit: u64,
    pub last_message_id: Option<String>,
}

/// Tool permission request raised by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub permission_type: String,
    pub session_id: String,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: u64,
}

/// Answer to a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionResponse {
    Once,
    Always,
    Reject,
}

/// Edit permission level of an agent within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditPermissionMode {
    Ask,
    Allow,
    Full,
    /// Terminal: only ever an agent default, never reached by toggling
    Deny,
}

impl EditPermissionMode {
    /// Next mode in the escalation cycle. `Deny` has no successor.
    pub fn escalated(self) -> Option<Self> {
        match self {
            Self::Ask => Some(Self::Allow),
            Self::Allow => Some(Self::Full),
            Self::Full => Some(Self::Ask),
            Self::Deny => None,
        }
    }
}

/// Declared permissions of an agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPermission {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit: Option<EditPermissionMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webfetch: Option<String>,
}

/// Agent definition as served by the backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub permission: AgentPermission,
    /// Tool name -> enabled
    #[serde(default)]
    pub tools: std::collections::BTreeMap<String, bool>,
}

/// Provider/model pair chosen for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub provider_id: String,
    pub model_id: String,
}

/// File attached to an outgoing prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Outgoing prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub session_id: String,
    pub content: String,
    pub provider_id: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_part(id: &str, text: &str) -> Part {
        Part {
            id: id.to_string(),
            session_id: "s".to_string(),
            message_id: "m".to_string(),
            kind: PartKind::Text {
                text: text.to_string(),
            },
        }
    }

    #[test]
    fn escalation_cycle_skips_deny() {
        assert_eq!(EditPermissionMode::Ask.escalated(), Some(EditPermissionMode::Allow));
        assert_eq!(EditPermissionMode::Allow.escalated(), Some(EditPermissionMode::Full));
        assert_eq!(EditPermissionMode::Full.escalated(), Some(EditPermissionMode::Ask));
        assert_eq!(EditPermissionMode::Deny.escalated(), None);
    }

    #[test]
    fn upsert_part_replaces_in_place() {
        let mut message = Message {
            info: MessageInfo::placeholder("m", "s", MessageRole::Assistant, 0),
            parts: vec![text_part("a", "one"), text_part("b", "two")],
        };

        message.upsert_part(text_part("a", "uno"));
        message.upsert_part(text_part("c", "three"));

        let ids: Vec<_> = message.parts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(message.parts[0].kind, PartKind::Text { text: "uno".into() });
    }

    #[test]
    fn delta_only_applies_to_text_like_parts() {
        let mut part = text_part("a", "hel");
        assert!(part.append_delta("lo"));
        assert_eq!(part.kind, PartKind::Text { text: "hello".into() });

        let mut file = Part {
            kind: PartKind::File {
                mime: "image/png".into(),
                url: "file:///x.png".into(),
                filename: None,
            },
            ..text_part("f", "")
        };
        assert!(!file.append_delta("x"));
    }

    #[test]
    fn permission_request_uses_type_on_the_wire() {
        let json = serde_json::json!({
            "id": "perm-1",
            "type": "edit",
            "session_id": "s",
            "message_id": "m",
            "title": "Edit src/main.rs",
            "created_at": 1
        });
        let request: PermissionRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.permission_type, "edit");
        assert!(request.call_id.is_none());
    }
}
