//! Rendered message views and session-scoped events surfaced to the caller.
//!
//! These are the types the UI layer consumes. [`MessageDto`] is a complete
//! snapshot rendered from in-flight streaming state; [`SessionEvent`] carries
//! everything session-scoped that is not message content.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    /// Parse a wire role string. Anything unrecognized is treated as
    /// assistant, matching how missed-start recovery defaults.
    pub fn parse(s: &str) -> Self {
        match s {
            "user" => Self::User,
            _ => Self::Assistant,
        }
    }
}

/// Tool invocation state attached to a tool part.
///
/// Also used as the partial update shape: every field is optional, and
/// [`ToolState::merge`] folds a partial update into the record without
/// disturbing fields the update does not carry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl ToolState {
    /// Merge a partial update into this record, field by field. Fields absent
    /// from the update keep their prior value.
    pub fn merge(&mut self, update: &ToolState) {
        if update.name.is_some() {
            self.name = update.name.clone();
        }
        if update.status.is_some() {
            self.status = update.status.clone();
        }
        if update.input.is_some() {
            self.input = update.input.clone();
        }
        if update.output.is_some() {
            self.output = update.output.clone();
        }
    }
}

/// One rendered part of a message, in final display order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    /// Accumulated textual content (text, thinking, reasoning, ...).
    Content { part_type: String, text: String },
    /// A tool invocation with its merged state. Carries no textual content.
    Tool { tool_name: String, state: ToolState },
}

/// A complete message snapshot rendered from streaming state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDto {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub parts: Vec<MessagePart>,
}

/// Session-scoped events forwarded to the caller without reconstruction.
///
/// No ordering or dedup guarantee is made for these beyond the session-id
/// filter already applied by the processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Session status changed (busy, idle, ...).
    Status {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// Session title changed.
    TitleUpdated { title: String },

    /// Todo list replaced.
    TodoUpdated { todos: Value },

    /// Workspace diff changed.
    DiffUpdated { diff: Value },

    /// Agent requests a permission decision.
    PermissionRequest {
        permission_id: String,
        permission_type: String,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },

    /// Agent asked the user a question.
    QuestionRequest {
        request_id: String,
        questions: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<Value>,
    },

    /// A question was answered or withdrawn.
    QuestionResolved { request_id: String, rejected: bool },

    /// Session-level error reported by the server.
    Error { error_type: String, message: String },

    /// The caller-armed first-response timer elapsed with no assistant
    /// activity.
    ResponseTimeout,
}
