//! The canonical event envelope.
//!
//! Every raw wire event is normalized into an [`EventEnvelope`] at the
//! transport boundary. Downstream components (queue, deduplicator, processor)
//! never see wire shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{MessageRole, ToolState};

// ============================================================================
// Envelope
// ============================================================================

/// A canonical event with routing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Server-assigned event identifier, used as the resume token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    /// Which session this event belongs to.
    pub session_id: String,

    /// Unix ms timestamp.
    pub ts: i64,

    /// The event payload.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl EventEnvelope {
    /// The normalized kind of this event.
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// All normalized event types, tagged by `event` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    /// A new message started streaming.
    #[serde(rename = "message.start")]
    MessageStart {
        message_id: String,
        role: MessageRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },

    /// Incremental update to one part of an in-flight message.
    #[serde(rename = "message.delta")]
    MessageDelta {
        message_id: String,
        part_id: String,
        part_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<MessageRole>,
        /// Partial tool state for `tool` parts, already flattened from the
        /// nested wire shape.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<ToolState>,
    },

    /// Message finished streaming.
    #[serde(rename = "message.complete")]
    MessageComplete { message_id: String },

    /// Session status changed.
    #[serde(rename = "session.status")]
    SessionStatus {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// Session title changed.
    #[serde(rename = "session.title")]
    SessionTitle { title: String },

    /// Todo list replaced.
    #[serde(rename = "todo.updated")]
    TodoUpdated { todos: Value },

    /// Workspace diff changed.
    #[serde(rename = "session.diff.updated")]
    DiffUpdated { diff: Value },

    /// Permission decision requested or resolved.
    #[serde(rename = "permission.updated")]
    PermissionUpdated {
        permission_id: String,
        permission_type: String,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },

    /// Agent asked the user a question.
    #[serde(rename = "question.asked")]
    QuestionAsked {
        request_id: String,
        questions: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<Value>,
    },

    /// A question was answered.
    #[serde(rename = "question.replied")]
    QuestionReplied { request_id: String },

    /// A question was withdrawn.
    #[serde(rename = "question.rejected")]
    QuestionRejected { request_id: String },

    /// Server-reported error.
    Error { error_type: String, message: String },
}

impl EventPayload {
    /// The normalized kind of this payload.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageStart { .. } => EventKind::Start,
            Self::MessageDelta { .. } => EventKind::Delta,
            Self::MessageComplete { .. } => EventKind::Complete,
            Self::SessionStatus { .. } => EventKind::Status,
            Self::SessionTitle { .. } => EventKind::Title,
            Self::TodoUpdated { .. } => EventKind::Todo,
            Self::DiffUpdated { .. } => EventKind::Diff,
            Self::PermissionUpdated { .. } => EventKind::Permission,
            Self::QuestionAsked { .. } => EventKind::QuestionAsked,
            Self::QuestionReplied { .. } => EventKind::QuestionReplied,
            Self::QuestionRejected { .. } => EventKind::QuestionRejected,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

// ============================================================================
// Kinds
// ============================================================================

/// Normalized event kind, used for queue priority classification and as the
/// deduplication key alongside the message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Delta,
    Complete,
    Status,
    Title,
    Todo,
    Diff,
    Permission,
    QuestionAsked,
    QuestionReplied,
    QuestionRejected,
    Error,
}

impl EventKind {
    /// Latency-sensitive kinds jump the queue ahead of buffered deltas.
    pub fn is_high_priority(self) -> bool {
        matches!(
            self,
            Self::Start | Self::Complete | Self::Status | Self::Permission
        )
    }
}
