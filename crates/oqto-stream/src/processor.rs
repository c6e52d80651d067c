//! Top-level event router.
//!
//! Composes the deduplicator and per-message streaming state, filters by
//! active session, reconciles optimistic local user messages against their
//! server echoes, recovers from missed start events, and fans results out to
//! the caller's callbacks.
//!
//! All state belongs to exactly one session at a time; [`EventProcessor::
//! reset`] must run before the pipeline is reused for another session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use oqto_stream_protocol::{
    EventEnvelope, EventKind, EventPayload, MessageDto, MessageRole, SessionEvent, ToolState,
};
use parking_lot::Mutex;

use crate::config::StreamConfig;
use crate::dedup::EventDeduplicator;
use crate::streaming::StreamingMessage;

/// Callbacks surfaced to the caller (the UI/state layer).
pub trait StreamCallbacks: Send + Sync {
    /// An in-flight message changed. `is_streaming` is true while more
    /// updates may follow.
    fn on_message_update(&self, message: MessageDto, is_streaming: bool);

    /// A message finished streaming; `message` is its final rendering.
    fn on_message_complete(&self, message: MessageDto);

    /// A session-scoped event that is not message content.
    fn on_session_event(&self, event: SessionEvent);
}

/// The router. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EventProcessor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    state: Mutex<ProcessorState>,
    callbacks: Arc<dyn StreamCallbacks>,
    completed_ttl: Duration,
}

struct ProcessorState {
    session_id: Option<String>,
    active: HashMap<String, StreamingMessage>,
    dedup: EventDeduplicator,
    /// Locally created user-message ids awaiting their server echo.
    optimistic: VecDeque<String>,
    /// Recently completed ids still rejecting stray duplicates.
    completed: HashSet<String>,
    response_timer: Option<tokio::task::JoinHandle<()>>,
    timer_gen: u64,
    /// Bumped on every reset so scheduled evictions from a previous session
    /// cannot touch the new one.
    epoch: u64,
}

/// What a handler decided to emit, produced under the state lock and fired
/// after it is released.
enum Emit {
    Update(MessageDto),
    Complete(MessageDto),
    Session(SessionEvent),
}

impl EventProcessor {
    pub fn new(config: &StreamConfig, callbacks: Arc<dyn StreamCallbacks>) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                state: Mutex::new(ProcessorState {
                    session_id: None,
                    active: HashMap::new(),
                    dedup: EventDeduplicator::new(config.dedup_ttl, config.dedup_max_entries),
                    optimistic: VecDeque::new(),
                    completed: HashSet::new(),
                    response_timer: None,
                    timer_gen: 0,
                    epoch: 0,
                }),
                callbacks,
                completed_ttl: config.completed_ttl,
            }),
        }
    }

    /// Set the session this processor routes for. Events for any other
    /// session are discarded silently.
    pub fn set_session(&self, session_id: impl Into<String>) {
        self.inner.state.lock().session_id = Some(session_id.into());
    }

    pub fn active_session(&self) -> Option<String> {
        self.inner.state.lock().session_id.clone()
    }

    /// Register a locally created user message awaiting its server echo.
    pub fn add_optimistic_message(&self, local_id: impl Into<String>) {
        self.inner.state.lock().optimistic.push_back(local_id.into());
    }

    /// Optimistic ids still awaiting their echo.
    pub fn pending_optimistic(&self) -> usize {
        self.inner.state.lock().optimistic.len()
    }

    /// Arm the caller-visible "awaiting first response" timer. It fires
    /// [`SessionEvent::ResponseTimeout`] unless assistant activity arrives
    /// first.
    pub fn arm_response_timer(&self, timeout: Duration) {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.response_timer.take() {
            timer.abort();
        }
        state.timer_gen += 1;
        let r#gen = state.timer_gen;
        let epoch = state.epoch;
        let inner = self.inner.clone();
        state.response_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let fire = {
                let mut state = inner.state.lock();
                if state.epoch == epoch && state.timer_gen == r#gen {
                    state.response_timer = None;
                    true
                } else {
                    false
                }
            };
            if fire {
                inner.callbacks.on_session_event(SessionEvent::ResponseTimeout);
            }
        }));
    }

    /// Cancel the first-response timer without firing it.
    pub fn clear_response_timer(&self) {
        let mut state = self.inner.state.lock();
        state.timer_gen += 1;
        if let Some(timer) = state.response_timer.take() {
            timer.abort();
        }
    }

    /// Route one canonical envelope.
    pub fn process_event(&self, envelope: EventEnvelope) {
        let emit = {
            let mut state = self.inner.state.lock();

            let Some(active_session) = state.session_id.clone() else {
                return;
            };
            if envelope.session_id != active_session {
                // Routine under multi-connection fan-out, not an error.
                debug!(
                    "Discarding event for session {} (active: {})",
                    envelope.session_id, active_session
                );
                return;
            }

            match envelope.payload {
                EventPayload::MessageStart {
                    message_id,
                    role,
                    agent,
                } => self.handle_start(&mut state, message_id, role, agent, envelope.ts),

                EventPayload::MessageDelta {
                    message_id,
                    part_id,
                    part_type,
                    content,
                    role,
                    tool,
                } => self.handle_delta(
                    &mut state,
                    message_id,
                    &part_id,
                    &part_type,
                    content.as_deref(),
                    role,
                    tool.as_ref(),
                    envelope.ts,
                ),

                EventPayload::MessageComplete { message_id } => {
                    self.handle_complete(&mut state, message_id)
                }

                other => translate_session_event(other).map(Emit::Session),
            }
        };

        match emit {
            Some(Emit::Update(dto)) => self.inner.callbacks.on_message_update(dto, true),
            Some(Emit::Complete(dto)) => self.inner.callbacks.on_message_complete(dto),
            Some(Emit::Session(event)) => self.inner.callbacks.on_session_event(event),
            None => {}
        }
    }

    /// Discard every per-session structure: active contexts, optimistic and
    /// completed ids, the dedup store, and any armed timer. Required before
    /// reusing the pipeline for another session.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.session_id = None;
        state.active.clear();
        state.optimistic.clear();
        state.completed.clear();
        state.dedup.clear();
        state.timer_gen += 1;
        state.epoch += 1;
        if let Some(timer) = state.response_timer.take() {
            timer.abort();
        }
    }

    fn handle_start(
        &self,
        state: &mut ProcessorState,
        message_id: String,
        role: MessageRole,
        agent: Option<String>,
        ts: i64,
    ) -> Option<Emit> {
        if state.dedup.is_duplicate(&message_id, EventKind::Start) {
            debug!("Duplicate start for {}", message_id);
            return None;
        }
        if state.completed.contains(&message_id) {
            debug!("Start for already-completed {}", message_id);
            return None;
        }
        state.dedup.mark(&message_id, EventKind::Start);

        // The server echo of the user's own message must not duplicate the
        // locally created optimistic entry.
        if role == MessageRole::User && !state.optimistic.is_empty() {
            let consumed = state.optimistic.pop_front();
            debug!(
                "Matched optimistic message {:?} against echo {}",
                consumed, message_id
            );
            return None;
        }

        if role == MessageRole::Assistant {
            clear_timer(state);
        }

        let session_id = state.session_id.clone().unwrap_or_default();
        let mut context = StreamingMessage::new(message_id.as_str(), session_id, role, agent, ts);
        let dto = context.to_message();
        state.active.insert(message_id, context);
        Some(Emit::Update(dto))
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_delta(
        &self,
        state: &mut ProcessorState,
        message_id: String,
        part_id: &str,
        part_type: &str,
        content: Option<&str>,
        role: Option<MessageRole>,
        tool: Option<&ToolState>,
        ts: i64,
    ) -> Option<Emit> {
        if state.completed.contains(&message_id) {
            debug!("Delta for already-completed {}", message_id);
            return None;
        }

        let session_id = state.session_id.clone().unwrap_or_default();
        if !state.active.contains_key(&message_id) {
            // The start event was missed (reconnect gap, out-of-order
            // delivery). Recover with an assistant context.
            debug!("Auto-creating context for {} on delta", message_id);
        }
        let context = state.active.entry(message_id.clone()).or_insert_with(|| {
            StreamingMessage::new(
                message_id.as_str(),
                session_id,
                role.unwrap_or(MessageRole::Assistant),
                None,
                ts,
            )
        });

        context.add_delta(part_id, part_type, content, tool);
        let context_role = context.role();
        let dto = context.to_message();
        if context_role == MessageRole::Assistant {
            clear_timer(state);
        }
        Some(Emit::Update(dto))
    }

    fn handle_complete(&self, state: &mut ProcessorState, message_id: String) -> Option<Emit> {
        state.completed.insert(message_id.clone());
        self.schedule_completed_eviction(message_id.clone(), state.epoch);

        match state.active.remove(&message_id) {
            // Handled entirely as an optimistic match; nothing to finalize.
            None => None,
            Some(mut context) => Some(Emit::Complete(context.to_message())),
        }
    }

    /// The completed set rejects stray late duplicates for a bounded window,
    /// then forgets the id so it cannot grow without bound.
    fn schedule_completed_eviction(&self, message_id: String, epoch: u64) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.completed_ttl).await;
            let mut state = inner.state.lock();
            if state.epoch == epoch {
                state.completed.remove(&message_id);
            }
        });
    }
}

fn clear_timer(state: &mut ProcessorState) {
    state.timer_gen += 1;
    if let Some(timer) = state.response_timer.take() {
        timer.abort();
    }
}

/// Translate a non-message payload into the caller-facing session event.
fn translate_session_event(payload: EventPayload) -> Option<SessionEvent> {
    match payload {
        EventPayload::SessionStatus { status, detail } => {
            Some(SessionEvent::Status { status, detail })
        }
        EventPayload::SessionTitle { title } => Some(SessionEvent::TitleUpdated { title }),
        EventPayload::TodoUpdated { todos } => Some(SessionEvent::TodoUpdated { todos }),
        EventPayload::DiffUpdated { diff } => Some(SessionEvent::DiffUpdated { diff }),
        EventPayload::PermissionUpdated {
            permission_id,
            permission_type,
            title,
            pattern,
            metadata,
        } => Some(SessionEvent::PermissionRequest {
            permission_id,
            permission_type,
            title,
            pattern,
            metadata,
        }),
        EventPayload::QuestionAsked {
            request_id,
            questions,
            tool,
        } => Some(SessionEvent::QuestionRequest {
            request_id,
            questions,
            tool,
        }),
        EventPayload::QuestionReplied { request_id } => Some(SessionEvent::QuestionResolved {
            request_id,
            rejected: false,
        }),
        EventPayload::QuestionRejected { request_id } => Some(SessionEvent::QuestionResolved {
            request_id,
            rejected: true,
        }),
        EventPayload::Error {
            error_type,
            message,
        } => {
            warn!("Session error from stream: {}: {}", error_type, message);
            Some(SessionEvent::Error {
                error_type,
                message,
            })
        }
        EventPayload::MessageStart { .. }
        | EventPayload::MessageDelta { .. }
        | EventPayload::MessageComplete { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oqto_stream_protocol::MessagePart;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<(MessageDto, bool)>>,
        completes: Mutex<Vec<MessageDto>>,
        sessions: Mutex<Vec<SessionEvent>>,
    }

    impl StreamCallbacks for Recorder {
        fn on_message_update(&self, message: MessageDto, is_streaming: bool) {
            self.updates.lock().push((message, is_streaming));
        }

        fn on_message_complete(&self, message: MessageDto) {
            self.completes.lock().push(message);
        }

        fn on_session_event(&self, event: SessionEvent) {
            self.sessions.lock().push(event);
        }
    }

    fn processor() -> (Arc<Recorder>, EventProcessor) {
        let recorder = Arc::new(Recorder::default());
        let processor = EventProcessor::new(&StreamConfig::default(), recorder.clone());
        processor.set_session("ses-1");
        (recorder, processor)
    }

    fn envelope(session_id: &str, payload: EventPayload) -> EventEnvelope {
        EventEnvelope {
            event_id: None,
            session_id: session_id.to_string(),
            ts: 1738764000000,
            payload,
        }
    }

    fn start(message_id: &str, role: MessageRole) -> EventEnvelope {
        envelope(
            "ses-1",
            EventPayload::MessageStart {
                message_id: message_id.to_string(),
                role,
                agent: None,
            },
        )
    }

    fn delta(message_id: &str, part_id: &str, content: &str) -> EventEnvelope {
        envelope(
            "ses-1",
            EventPayload::MessageDelta {
                message_id: message_id.to_string(),
                part_id: part_id.to_string(),
                part_type: "text".to_string(),
                content: Some(content.to_string()),
                role: None,
                tool: None,
            },
        )
    }

    fn complete(message_id: &str) -> EventEnvelope {
        envelope(
            "ses-1",
            EventPayload::MessageComplete {
                message_id: message_id.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_foreign_session_events_are_discarded() {
        let (recorder, processor) = processor();
        processor.process_event(envelope(
            "ses-other",
            EventPayload::MessageStart {
                message_id: "msg-1".to_string(),
                role: MessageRole::Assistant,
                agent: None,
            },
        ));
        assert!(recorder.updates.lock().is_empty());
    }

    #[tokio::test]
    async fn test_start_emits_empty_streaming_update() {
        let (recorder, processor) = processor();
        processor.process_event(start("msg-1", MessageRole::Assistant));

        let updates = recorder.updates.lock();
        assert_eq!(updates.len(), 1);
        let (dto, is_streaming) = &updates[0];
        assert!(is_streaming);
        assert_eq!(dto.id, "msg-1");
        assert!(dto.parts.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_start_is_ignored() {
        let (recorder, processor) = processor();
        processor.process_event(start("msg-1", MessageRole::Assistant));
        processor.process_event(start("msg-1", MessageRole::Assistant));
        assert_eq!(recorder.updates.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_end_to_end_optimistic_recovery_and_completion() {
        let (recorder, processor) = processor();
        processor.add_optimistic_message("local-1");
        assert_eq!(processor.pending_optimistic(), 1);

        // The server echo of the user's message consumes the optimistic id
        // without creating a context.
        processor.process_event(start("msg-1", MessageRole::User));
        assert_eq!(processor.pending_optimistic(), 0);
        assert!(recorder.updates.lock().is_empty());

        // A delta with no prior start auto-creates an assistant context.
        processor.process_event(delta("msg-1", "p1", "Hel"));
        processor.process_event(delta("msg-1", "p1", "lo"));
        {
            let updates = recorder.updates.lock();
            assert_eq!(updates.len(), 2);
            let (dto, _) = &updates[1];
            assert_eq!(dto.role, MessageRole::Assistant);
            assert_eq!(
                dto.parts[0],
                MessagePart::Content {
                    part_type: "text".to_string(),
                    text: "Hello".to_string()
                }
            );
        }

        processor.process_event(complete("msg-1"));
        {
            let completes = recorder.completes.lock();
            assert_eq!(completes.len(), 1);
            assert_eq!(completes[0].id, "msg-1");
        }

        // A stray delta moments later is rejected by the completed set.
        processor.process_event(delta("msg-1", "p1", "!"));
        assert_eq!(recorder.updates.lock().len(), 2);

        // So is a stray start.
        processor.process_event(start("msg-1", MessageRole::Assistant));
        assert_eq!(recorder.updates.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_complete_without_context_is_silent() {
        let (recorder, processor) = processor();
        processor.process_event(complete("msg-1"));
        assert!(recorder.completes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_session_events_are_forwarded() {
        let (recorder, processor) = processor();
        processor.process_event(envelope(
            "ses-1",
            EventPayload::SessionStatus {
                status: "busy".to_string(),
                detail: None,
            },
        ));
        processor.process_event(envelope(
            "ses-1",
            EventPayload::TodoUpdated {
                todos: json!([{"text": "write tests"}]),
            },
        ));

        let sessions = recorder.sessions.lock();
        assert_eq!(sessions.len(), 2);
        assert!(matches!(&sessions[0], SessionEvent::Status { status, .. } if status == "busy"));
        assert!(matches!(&sessions[1], SessionEvent::TodoUpdated { .. }));
    }

    #[tokio::test]
    async fn test_response_timer_fires_without_assistant_activity() {
        let (recorder, processor) = processor();
        processor.arm_response_timer(Duration::from_millis(40));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            recorder
                .sessions
                .lock()
                .iter()
                .any(|e| matches!(e, SessionEvent::ResponseTimeout))
        );
    }

    #[tokio::test]
    async fn test_assistant_delta_clears_response_timer() {
        let (recorder, processor) = processor();
        processor.arm_response_timer(Duration::from_millis(60));
        processor.process_event(delta("msg-1", "p1", "Hi"));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(
            !recorder
                .sessions
                .lock()
                .iter()
                .any(|e| matches!(e, SessionEvent::ResponseTimeout))
        );
    }

    #[tokio::test]
    async fn test_user_start_does_not_clear_response_timer() {
        let (recorder, processor) = processor();
        processor.arm_response_timer(Duration::from_millis(40));
        processor.process_event(start("msg-1", MessageRole::User));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            recorder
                .sessions
                .lock()
                .iter()
                .any(|e| matches!(e, SessionEvent::ResponseTimeout))
        );
    }

    #[tokio::test]
    async fn test_reset_discards_per_session_state() {
        let (recorder, processor) = processor();
        processor.add_optimistic_message("local-1");
        processor.process_event(start("msg-1", MessageRole::Assistant));
        processor.process_event(complete("msg-1"));

        processor.reset();
        assert_eq!(processor.pending_optimistic(), 0);
        assert!(processor.active_session().is_none());

        // The same id streams fresh in a new session.
        processor.set_session("ses-1");
        processor.process_event(start("msg-1", MessageRole::Assistant));
        assert_eq!(recorder.updates.lock().len(), 2);
    }
}
