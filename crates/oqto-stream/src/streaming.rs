//! Per-message streaming reconstruction state.
//!
//! One [`StreamingMessage`] exists per in-flight message. Parts are recorded
//! in the order they are first seen; later deltas to an existing part append
//! to its accumulator (or merge into its tool state) without disturbing that
//! order.

use std::collections::HashMap;

use oqto_stream_protocol::{MessageDto, MessagePart, MessageRole, ToolState};

use crate::accumulator::ChunkAccumulator;

/// Builder for one in-flight message.
#[derive(Debug)]
pub struct StreamingMessage {
    message_id: String,
    session_id: String,
    role: MessageRole,
    agent: Option<String>,
    started_at: i64,
    parts: Vec<PartSlot>,
    index: HashMap<String, usize>,
    next_sequence: u32,
}

/// One part of an in-flight message.
#[derive(Debug)]
struct PartSlot {
    part_id: String,
    part_type: String,
    sequence: u32,
    content: ChunkAccumulator,
    tool: Option<ToolState>,
}

impl StreamingMessage {
    /// Create streaming state for a new message.
    pub fn new(
        message_id: impl Into<String>,
        session_id: impl Into<String>,
        role: MessageRole,
        agent: Option<String>,
        started_at: i64,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            session_id: session_id.into(),
            role,
            agent,
            started_at,
            parts: Vec::new(),
            index: HashMap::new(),
            next_sequence: 0,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn role(&self) -> MessageRole {
        self.role
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    /// Apply one delta. An unseen `part_id` creates a slot with the next
    /// sequence number; subsequent deltas to the same part append (or merge
    /// tool state) regardless of how late they arrive.
    pub fn add_delta(
        &mut self,
        part_id: &str,
        part_type: &str,
        content: Option<&str>,
        tool: Option<&ToolState>,
    ) {
        if part_id.is_empty() {
            return;
        }

        let pos = match self.index.get(part_id) {
            Some(&pos) => pos,
            None => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                self.parts.push(PartSlot {
                    part_id: part_id.to_string(),
                    part_type: part_type.to_string(),
                    sequence,
                    content: ChunkAccumulator::new(),
                    tool: (part_type == "tool").then(ToolState::default),
                });
                self.index.insert(part_id.to_string(), self.parts.len() - 1);
                self.parts.len() - 1
            }
        };

        let slot = &mut self.parts[pos];
        if slot.part_type == "tool" {
            if let Some(update) = tool {
                slot.tool.get_or_insert_with(ToolState::default).merge(update);
            }
        } else if let Some(chunk) = content {
            slot.content.append(chunk);
        }
    }

    /// Render the current state as a complete message snapshot, parts in
    /// first-seen order.
    pub fn to_message(&mut self) -> MessageDto {
        debug_assert!(
            self.parts
                .windows(2)
                .all(|w| w[0].sequence < w[1].sequence)
        );

        let parts = self
            .parts
            .iter_mut()
            .map(|slot| {
                if slot.part_type == "tool" {
                    let state = slot.tool.clone().unwrap_or_default();
                    MessagePart::Tool {
                        tool_name: state.name.clone().unwrap_or_default(),
                        state,
                    }
                } else {
                    MessagePart::Content {
                        part_type: slot.part_type.clone(),
                        text: slot.content.text().to_string(),
                    }
                }
            })
            .collect();

        MessageDto {
            id: self.message_id.clone(),
            session_id: self.session_id.clone(),
            role: self.role,
            agent: self.agent.clone(),
            parts,
        }
    }

    /// Drop all parts and reset the sequence counter.
    pub fn clear(&mut self) {
        self.parts.clear();
        self.index.clear();
        self.next_sequence = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message() -> StreamingMessage {
        StreamingMessage::new("msg-1", "ses-1", MessageRole::Assistant, None, 0)
    }

    #[test]
    fn test_interleaved_deltas_preserve_first_seen_order() {
        let mut msg = message();
        msg.add_delta("p1", "text", Some("A"), None);
        msg.add_delta("p2", "thinking", Some("T"), None);
        msg.add_delta("p1", "text", Some("B"), None);

        let dto = msg.to_message();
        assert_eq!(dto.parts.len(), 2);
        assert_eq!(
            dto.parts[0],
            MessagePart::Content {
                part_type: "text".to_string(),
                text: "AB".to_string()
            }
        );
        assert_eq!(
            dto.parts[1],
            MessagePart::Content {
                part_type: "thinking".to_string(),
                text: "T".to_string()
            }
        );
    }

    #[test]
    fn test_tool_state_refines_progressively() {
        let mut msg = message();
        msg.add_delta(
            "t1",
            "tool",
            None,
            Some(&ToolState {
                name: Some("bash".to_string()),
                status: Some("running".to_string()),
                input: Some(json!("x")),
                output: None,
            }),
        );
        msg.add_delta(
            "t1",
            "tool",
            None,
            Some(&ToolState {
                status: Some("completed".to_string()),
                output: Some(json!("y")),
                ..Default::default()
            }),
        );

        let dto = msg.to_message();
        match &dto.parts[0] {
            MessagePart::Tool { tool_name, state } => {
                assert_eq!(tool_name, "bash");
                assert_eq!(state.status.as_deref(), Some("completed"));
                assert_eq!(state.input, Some(json!("x")));
                assert_eq!(state.output, Some(json!("y")));
            }
            other => panic!("Expected tool part, got {:?}", other),
        }
    }

    #[test]
    fn test_tool_parts_carry_no_text() {
        let mut msg = message();
        msg.add_delta("t1", "tool", Some("ignored"), None);
        let dto = msg.to_message();
        assert!(matches!(dto.parts[0], MessagePart::Tool { .. }));
    }

    #[test]
    fn test_clear_resets_sequence() {
        let mut msg = message();
        msg.add_delta("p1", "text", Some("A"), None);
        msg.clear();
        assert!(msg.to_message().parts.is_empty());

        msg.add_delta("p9", "text", Some("Z"), None);
        let dto = msg.to_message();
        assert_eq!(dto.parts.len(), 1);
    }
}
