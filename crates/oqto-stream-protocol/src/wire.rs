//! Wire-format decoding.
//!
//! The stream endpoint emits two historical payload shapes: a **flat** shape
//! with `sessionId` and the event fields at top level, and a **nested** shape
//! wrapping fields in `properties.info` / `properties.part` /
//! `properties.delta` with `sessionID`-cased keys. Shape is discriminated by
//! serde (a flat event must carry a top-level `sessionId`, a nested event a
//! `properties` object) and both decode into one [`EventEnvelope`].
//!
//! Unknown event kinds and server keepalives decode to `None` and are ignored
//! upstream.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::envelope::{EventEnvelope, EventPayload};
use crate::message::{MessageRole, ToolState};

/// Wire decoding failures. One failed event never affects the stream.
#[derive(Debug, Error)]
pub enum WireError {
    /// Payload is not valid JSON or matches neither wire shape.
    #[error("malformed event payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A shape matched but a field the kind cannot do without is absent.
    #[error("event '{event_type}' is missing required field '{field}'")]
    MissingField {
        event_type: String,
        field: &'static str,
    },
}

/// Decode one raw stream event into the canonical envelope.
///
/// `event_name` is the SSE `event:` field, used as the kind when the payload
/// carries no `type` of its own. Returns `Ok(None)` for keepalives and kinds
/// this client does not consume.
pub fn decode_event(event_name: &str, data: &str) -> Result<Option<EventEnvelope>, WireError> {
    let wire: WireEvent = serde_json::from_str(data)?;

    match wire {
        WireEvent::Flat(ev) => {
            let event_type = ev
                .event_type
                .clone()
                .unwrap_or_else(|| event_name.to_string());
            decode_flat(&event_type, ev)
        }
        WireEvent::Nested(ev) => {
            let event_type = ev
                .event_type
                .clone()
                .unwrap_or_else(|| event_name.to_string());
            decode_nested(&event_type, ev)
        }
    }
}

// ============================================================================
// Wire shapes
// ============================================================================

/// The two wire shapes, discriminated by their required fields.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireEvent {
    Flat(FlatWireEvent),
    Nested(NestedWireEvent),
}

/// Flat shape: `sessionId` at top level, fields named directly.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlatWireEvent {
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    session_id: String,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,

    // message.* fields
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    part_id: Option<String>,
    #[serde(default)]
    part_index: Option<u64>,
    #[serde(default)]
    part_type: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    status: Option<String>,

    // session-scoped fields
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    permission_id: Option<String>,
    #[serde(default)]
    permission_type: Option<String>,
    #[serde(default)]
    pattern: Option<Value>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    questions: Option<Value>,
    #[serde(default)]
    tool: Option<Value>,
    #[serde(default)]
    todos: Option<Value>,
    #[serde(default)]
    diff: Option<Value>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Nested shape: fields wrapped in a `properties` object.
#[derive(Debug, Deserialize)]
struct NestedWireEvent {
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    properties: NestedProperties,
}

#[derive(Debug, Default, Deserialize)]
struct NestedProperties {
    #[serde(default)]
    info: Option<NestedInfo>,
    #[serde(default)]
    part: Option<NestedPart>,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default, rename = "sessionID")]
    session_id: Option<String>,
    #[serde(default, rename = "messageID")]
    message_id: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Message (or session) info object inside a nested payload.
#[derive(Debug, Default, Deserialize)]
struct NestedInfo {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "sessionID")]
    session_id: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    time: Option<NestedTime>,
}

#[derive(Debug, Default, Deserialize)]
struct NestedTime {
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    completed: Option<i64>,
}

/// Part object inside a nested payload.
#[derive(Debug, Default, Deserialize)]
struct NestedPart {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "messageID")]
    message_id: Option<String>,
    #[serde(default, rename = "sessionID")]
    session_id: Option<String>,
    #[serde(default, rename = "type")]
    part_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    content: Option<String>,
    /// Tool name for `tool` parts.
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    state: Option<NestedToolState>,
}

/// Nested tool state, flattened into [`ToolState`] during decode.
#[derive(Debug, Default, Deserialize)]
struct NestedToolState {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    output: Option<Value>,
}

// ============================================================================
// Flat decoding
// ============================================================================

fn decode_flat(
    event_type: &str,
    ev: FlatWireEvent,
) -> Result<Option<EventEnvelope>, WireError> {
    let event_id = ev.event_id.clone().or_else(|| ev.id.clone());
    let ts = ev.timestamp.unwrap_or_else(now_ms);
    let session_id = ev.session_id.clone();

    let payload = match event_type {
        "message.start" | "message.started" => {
            let message_id = require(ev.message_id, event_type, "messageId")?;
            Some(EventPayload::MessageStart {
                message_id,
                role: ev
                    .role
                    .as_deref()
                    .map(MessageRole::parse)
                    .unwrap_or(MessageRole::Assistant),
                agent: ev.agent,
            })
        }

        "message.delta" | "message.part.updated" => {
            let message_id = require(ev.message_id, event_type, "messageId")?;
            let part_type = ev.part_type.unwrap_or_else(|| "text".to_string());
            let part_id = ev
                .part_id
                .or_else(|| ev.part_index.map(|i| i.to_string()))
                .unwrap_or_else(|| "0".to_string());
            let tool = (part_type == "tool").then(|| ToolState {
                name: ev.tool_name,
                status: ev.status,
                input: ev.input,
                output: ev.output,
            });
            Some(EventPayload::MessageDelta {
                message_id,
                part_id,
                part_type,
                content: ev.content,
                role: ev.role.as_deref().map(MessageRole::parse),
                tool,
            })
        }

        "message.complete" | "message.completed" => {
            let message_id = require(ev.message_id, event_type, "messageId")?;
            Some(EventPayload::MessageComplete { message_id })
        }

        "session.status" => Some(EventPayload::SessionStatus {
            status: ev.status.unwrap_or_default(),
            detail: ev.detail,
        }),

        // A session update without a title is not a title change.
        "session.updated" | "session.updated.global" => ev
            .title
            .map(|title| EventPayload::SessionTitle { title }),

        "todo.updated" => Some(EventPayload::TodoUpdated {
            todos: ev.todos.unwrap_or(Value::Null),
        }),

        "session.diff.updated" => Some(EventPayload::DiffUpdated {
            diff: ev.diff.unwrap_or(Value::Null),
        }),

        "permission.updated" => {
            let permission_id = require(
                ev.permission_id.or_else(|| ev.id.clone()),
                event_type,
                "permissionId",
            )?;
            Some(EventPayload::PermissionUpdated {
                permission_id,
                permission_type: ev.permission_type.unwrap_or_default(),
                title: ev.title.unwrap_or_default(),
                pattern: ev.pattern,
                metadata: ev.metadata,
            })
        }

        "question.asked" => {
            let request_id = require(
                ev.request_id.or_else(|| ev.id.clone()),
                event_type,
                "requestId",
            )?;
            Some(EventPayload::QuestionAsked {
                request_id,
                questions: ev.questions.unwrap_or_else(|| Value::Array(Vec::new())),
                tool: ev.tool,
            })
        }

        "question.replied" => {
            let request_id = require(
                ev.request_id.or_else(|| ev.id.clone()),
                event_type,
                "requestId",
            )?;
            Some(EventPayload::QuestionReplied { request_id })
        }

        "question.rejected" => {
            let request_id = require(
                ev.request_id.or_else(|| ev.id.clone()),
                event_type,
                "requestId",
            )?;
            Some(EventPayload::QuestionRejected { request_id })
        }

        "error" | "session.error" => Some(EventPayload::Error {
            error_type: ev
                .error_type
                .unwrap_or_else(|| "UnknownError".to_string()),
            message: ev
                .message
                .unwrap_or_else(|| "An unknown error occurred".to_string()),
        }),

        _ => None,
    };

    Ok(payload.map(|payload| EventEnvelope {
        event_id,
        session_id,
        ts,
        payload,
    }))
}

// ============================================================================
// Nested decoding
// ============================================================================

fn decode_nested(
    event_type: &str,
    ev: NestedWireEvent,
) -> Result<Option<EventEnvelope>, WireError> {
    let props = ev.properties;
    let info = props.info.unwrap_or_default();
    let ts = info
        .time
        .as_ref()
        .and_then(|t| t.created)
        .unwrap_or_else(now_ms);

    let payload = match event_type {
        "message.started" | "message.start" => {
            let message_id = require(
                info.id.clone().or_else(|| props.message_id.clone()),
                event_type,
                "info.id",
            )?;
            let session_id = require(
                info.session_id.clone().or_else(|| props.session_id.clone()),
                event_type,
                "sessionID",
            )?;
            return Ok(Some(EventEnvelope {
                event_id: None,
                session_id,
                ts,
                payload: EventPayload::MessageStart {
                    message_id,
                    role: info
                        .role
                        .as_deref()
                        .map(MessageRole::parse)
                        .unwrap_or(MessageRole::Assistant),
                    agent: info.agent,
                },
            }));
        }

        "message.part.updated" | "message.delta" => {
            // A part update without a part carries nothing to apply.
            let Some(part) = props.part else {
                return Ok(None);
            };
            let message_id = require(
                part.message_id
                    .clone()
                    .or_else(|| props.message_id.clone())
                    .or_else(|| info.id.clone()),
                event_type,
                "part.messageID",
            )?;
            let session_id = require(
                part.session_id
                    .clone()
                    .or_else(|| props.session_id.clone())
                    .or_else(|| info.session_id.clone()),
                event_type,
                "part.sessionID",
            )?;
            let part_type = part.part_type.clone().unwrap_or_else(|| "text".to_string());
            let part_id = part.id.clone().unwrap_or_else(|| "0".to_string());
            let content = props
                .delta
                .or(part.text)
                .or(part.content);
            let tool = (part_type == "tool").then(|| {
                let state = part.state.unwrap_or_default();
                ToolState {
                    name: part.tool,
                    status: state.status,
                    input: state.input,
                    output: state.output,
                }
            });
            return Ok(Some(EventEnvelope {
                event_id: None,
                session_id,
                ts,
                payload: EventPayload::MessageDelta {
                    message_id,
                    part_id,
                    part_type,
                    content,
                    role: info.role.as_deref().map(MessageRole::parse),
                    tool,
                },
            }));
        }

        "message.completed" | "message.complete" => {
            let message_id = require(
                info.id.clone().or_else(|| props.message_id.clone()),
                event_type,
                "info.id",
            )?;
            let session_id = require(
                info.session_id.clone().or_else(|| props.session_id.clone()),
                event_type,
                "sessionID",
            )?;
            return Ok(Some(EventEnvelope {
                event_id: None,
                session_id,
                ts,
                payload: EventPayload::MessageComplete { message_id },
            }));
        }

        // For session updates the info object IS the session, so its id is
        // the session id.
        "session.updated" | "session.updated.global" => {
            let Some(title) = info.title.clone() else {
                return Ok(None);
            };
            let session_id = require(
                info.id.clone().or_else(|| props.session_id.clone()),
                event_type,
                "info.id",
            )?;
            return Ok(Some(EventEnvelope {
                event_id: None,
                session_id,
                ts,
                payload: EventPayload::SessionTitle { title },
            }));
        }

        "session.status" => Some(EventPayload::SessionStatus {
            status: extra_str(&props.extra, &["status"]).unwrap_or_default(),
            detail: extra_str(&props.extra, &["detail"]),
        }),

        "todo.updated" => Some(EventPayload::TodoUpdated {
            todos: extra_value(&props.extra, &["todos", "todo"]).unwrap_or(Value::Null),
        }),

        "session.diff.updated" => Some(EventPayload::DiffUpdated {
            diff: extra_value(&props.extra, &["diff", "files"]).unwrap_or(Value::Null),
        }),

        "permission.updated" => {
            let permission_id = require(
                extra_str(&props.extra, &["id", "permissionID", "permissionId"]),
                event_type,
                "id",
            )?;
            Some(EventPayload::PermissionUpdated {
                permission_id,
                permission_type: extra_str(
                    &props.extra,
                    &["permissionType", "tool", "type"],
                )
                .unwrap_or_default(),
                title: extra_str(&props.extra, &["title"]).unwrap_or_default(),
                pattern: extra_value(&props.extra, &["pattern"]),
                metadata: extra_value(&props.extra, &["metadata"]),
            })
        }

        "question.asked" => {
            let request_id = require(
                extra_str(&props.extra, &["id", "requestID"]),
                event_type,
                "id",
            )?;
            Some(EventPayload::QuestionAsked {
                request_id,
                questions: extra_value(&props.extra, &["questions"])
                    .unwrap_or_else(|| Value::Array(Vec::new())),
                tool: extra_value(&props.extra, &["tool"]),
            })
        }

        "question.replied" => {
            let request_id = require(
                extra_str(&props.extra, &["requestID", "id"]),
                event_type,
                "requestID",
            )?;
            Some(EventPayload::QuestionReplied { request_id })
        }

        "question.rejected" => {
            let request_id = require(
                extra_str(&props.extra, &["requestID", "id"]),
                event_type,
                "requestID",
            )?;
            Some(EventPayload::QuestionRejected { request_id })
        }

        "error" | "session.error" => {
            let error = props.extra.get("error");
            let error_type = extra_str(&props.extra, &["error_type", "errorType"])
                .or_else(|| {
                    error
                        .and_then(|e| e.get("name"))
                        .and_then(Value::as_str)
                        .map(String::from)
                })
                .unwrap_or_else(|| "UnknownError".to_string());
            let message = extra_str(&props.extra, &["message"])
                .or_else(|| {
                    error
                        .and_then(|e| e.get("data"))
                        .and_then(|d| d.get("message"))
                        .and_then(Value::as_str)
                        .map(String::from)
                })
                .unwrap_or_else(|| "An unknown error occurred".to_string());
            Some(EventPayload::Error {
                error_type,
                message,
            })
        }

        _ => None,
    };

    let Some(payload) = payload else {
        return Ok(None);
    };

    let session_id = require(
        props
            .session_id
            .or_else(|| extra_str(&props.extra, &["sessionId"]))
            .or(info.session_id),
        event_type,
        "sessionID",
    )?;

    Ok(Some(EventEnvelope {
        event_id: None,
        session_id,
        ts,
        payload,
    }))
}

// ============================================================================
// Helpers
// ============================================================================

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn require(
    value: Option<String>,
    event_type: &str,
    field: &'static str,
) -> Result<String, WireError> {
    value.ok_or_else(|| WireError::MissingField {
        event_type: event_type.to_string(),
        field,
    })
}

fn extra_str(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| map.get(*k))
        .and_then(Value::as_str)
        .map(String::from)
}

fn extra_value(map: &Map<String, Value>, keys: &[&str]) -> Option<Value> {
    keys.iter().find_map(|k| map.get(*k)).cloned()
}
