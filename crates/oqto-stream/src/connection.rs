//! Connection lifecycle state machine.
//!
//! An explicit finite-state machine governing connect/disconnect/error/
//! background/foreground transitions. Invalid (state, event) pairs leave the
//! state untouched, return `false`, and notify nobody.
//!
//! Every successful `Connect` issues a fresh connection id; that id is the
//! sole authority for "is this async result still relevant" checks across
//! the pipeline. Continuations that outlive their connection must call
//! [`ConnectionStateMachine::is_current_connection`] and discard themselves
//! silently when it says no.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Connection lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Backgrounded,
}

/// Events driving the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Begin a fresh logical connection.
    Connect { url: String, session_id: String },
    /// The physical stream opened.
    Connected,
    /// Tear down. With `preserve_state` the url, session and resume token
    /// survive for a later reconnect.
    Disconnect { preserve_state: bool },
    /// The stream failed.
    Error { message: String },
    /// Caller-initiated retry out of terminal error.
    Retry,
    /// Backoff budget exhausted.
    MaxRetriesReached,
    AppBackgrounded,
    AppForegrounded,
    /// The owning session changed; connection identity is void.
    SessionChanged,
}

impl ConnectionEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Connected => "connected",
            Self::Disconnect { .. } => "disconnect",
            Self::Error { .. } => "error",
            Self::Retry => "retry",
            Self::MaxRetriesReached => "max_retries_reached",
            Self::AppBackgrounded => "app_backgrounded",
            Self::AppForegrounded => "app_foregrounded",
            Self::SessionChanged => "session_changed",
        }
    }
}

/// Immutable state snapshot handed to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub reconnect_attempt: u32,
}

/// Handle for removing a registered listener.
pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&ConnectionSnapshot) + Send + Sync>;

/// The state machine. One instance per logical stream owner.
pub struct ConnectionStateMachine {
    state: Mutex<MachineState>,
    listeners: DashMap<ListenerId, Listener>,
    next_listener_id: AtomicU64,
}

#[derive(Debug)]
struct MachineState {
    status: ConnectionStatus,
    url: Option<String>,
    session_id: Option<String>,
    connection_id: Option<String>,
    last_event_id: Option<String>,
    error: Option<String>,
    reconnect_attempt: u32,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            url: None,
            session_id: None,
            connection_id: None,
            last_event_id: None,
            error: None,
            reconnect_attempt: 0,
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MachineState::default()),
            listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Apply an event. Returns whether the transition was valid; invalid
    /// events change nothing and notify nobody.
    pub fn transition(&self, event: ConnectionEvent) -> bool {
        let snapshot = {
            let mut state = self.state.lock();
            let prior = state.status;

            let Some(next) = next_status(prior, &event) else {
                debug!(
                    "Ignoring connection event '{}' while {:?}",
                    event.name(),
                    prior
                );
                return false;
            };

            match &event {
                ConnectionEvent::Connect { url, session_id } => {
                    state.url = Some(url.clone());
                    state.session_id = Some(session_id.clone());
                    state.connection_id = Some(uuid::Uuid::new_v4().to_string());
                    state.reconnect_attempt = 0;
                    state.error = None;
                }
                ConnectionEvent::Connected => {
                    state.reconnect_attempt = 0;
                    state.error = None;
                }
                ConnectionEvent::Disconnect { preserve_state } => {
                    state.connection_id = None;
                    if !preserve_state {
                        state.url = None;
                        state.session_id = None;
                        state.last_event_id = None;
                    }
                }
                ConnectionEvent::Error { message } => {
                    state.error = Some(message.clone());
                    // A failure straight out of `connecting` does not count
                    // as a retry; only dropped connections do.
                    if matches!(
                        prior,
                        ConnectionStatus::Connected | ConnectionStatus::Reconnecting
                    ) {
                        state.reconnect_attempt += 1;
                    }
                }
                ConnectionEvent::SessionChanged => {
                    state.connection_id = None;
                    state.url = None;
                    state.session_id = None;
                    state.error = None;
                }
                ConnectionEvent::Retry
                | ConnectionEvent::MaxRetriesReached
                | ConnectionEvent::AppBackgrounded
                | ConnectionEvent::AppForegrounded => {}
            }

            state.status = next;
            debug!(
                "Connection transition: {:?} --{}--> {:?}",
                prior,
                event.name(),
                next
            );
            snapshot_of(&state)
        };

        self.notify(&snapshot);
        true
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        snapshot_of(&self.state.lock())
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    /// True iff `id` is present and names the live connection.
    pub fn is_current_connection(&self, id: Option<&str>) -> bool {
        match id {
            None => false,
            Some(id) => self.state.lock().connection_id.as_deref() == Some(id),
        }
    }

    /// The live connection id, if any.
    pub fn connection_id(&self) -> Option<String> {
        self.state.lock().connection_id.clone()
    }

    /// Update the resume token. Not a transition: listeners are not
    /// notified.
    pub fn set_last_event_id(&self, id: impl Into<String>) {
        self.state.lock().last_event_id = Some(id.into());
    }

    /// Register a listener. Every valid transition invokes it synchronously
    /// with the new snapshot.
    pub fn subscribe(
        &self,
        listener: impl Fn(&ConnectionSnapshot) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, Arc::new(listener));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    fn notify(&self, snapshot: &ConnectionSnapshot) {
        // Collect first so a listener may (un)subscribe without deadlocking
        // against the registry.
        let listeners: Vec<Listener> =
            self.listeners.iter().map(|e| e.value().clone()).collect();
        for listener in listeners {
            listener(snapshot);
        }
    }
}

/// The transition table. `None` marks an invalid pair.
fn next_status(prior: ConnectionStatus, event: &ConnectionEvent) -> Option<ConnectionStatus> {
    use ConnectionEvent as E;
    use ConnectionStatus as S;

    match (prior, event) {
        (S::Disconnected | S::Connected | S::Error, E::Connect { .. }) => Some(S::Connecting),
        (S::Connecting | S::Reconnecting, E::Connected) => Some(S::Connected),
        (_, E::Disconnect { .. }) => Some(S::Disconnected),
        (S::Connecting, E::Error { .. }) => Some(S::Error),
        (S::Connected | S::Reconnecting, E::Error { .. }) => Some(S::Reconnecting),
        (S::Error, E::Retry) => Some(S::Reconnecting),
        (S::Reconnecting, E::MaxRetriesReached) => Some(S::Error),
        (S::Connected, E::AppBackgrounded) => Some(S::Backgrounded),
        (S::Backgrounded, E::AppForegrounded) => Some(S::Reconnecting),
        (
            S::Connecting | S::Connected | S::Reconnecting | S::Error | S::Backgrounded,
            E::SessionChanged,
        ) => Some(S::Disconnected),
        _ => None,
    }
}

fn snapshot_of(state: &MachineState) -> ConnectionSnapshot {
    ConnectionSnapshot {
        status: state.status,
        url: state.url.clone(),
        session_id: state.session_id.clone(),
        connection_id: state.connection_id.clone(),
        last_event_id: state.last_event_id.clone(),
        error: state.error.clone(),
        reconnect_attempt: state.reconnect_attempt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn connect() -> ConnectionEvent {
        ConnectionEvent::Connect {
            url: "http://localhost:4096".to_string(),
            session_id: "ses-1".to_string(),
        }
    }

    fn error() -> ConnectionEvent {
        ConnectionEvent::Error {
            message: "boom".to_string(),
        }
    }

    fn machine_in(status: ConnectionStatus) -> ConnectionStateMachine {
        let machine = ConnectionStateMachine::new();
        match status {
            ConnectionStatus::Disconnected => {}
            ConnectionStatus::Connecting => {
                assert!(machine.transition(connect()));
            }
            ConnectionStatus::Connected => {
                assert!(machine.transition(connect()));
                assert!(machine.transition(ConnectionEvent::Connected));
            }
            ConnectionStatus::Reconnecting => {
                assert!(machine.transition(connect()));
                assert!(machine.transition(ConnectionEvent::Connected));
                assert!(machine.transition(error()));
            }
            ConnectionStatus::Error => {
                assert!(machine.transition(connect()));
                assert!(machine.transition(error()));
            }
            ConnectionStatus::Backgrounded => {
                assert!(machine.transition(connect()));
                assert!(machine.transition(ConnectionEvent::Connected));
                assert!(machine.transition(ConnectionEvent::AppBackgrounded));
            }
        }
        assert_eq!(machine.status(), status);
        machine
    }

    #[test]
    fn test_happy_path() {
        let machine = ConnectionStateMachine::new();
        assert_eq!(machine.status(), ConnectionStatus::Disconnected);

        assert!(machine.transition(connect()));
        assert_eq!(machine.status(), ConnectionStatus::Connecting);
        let snap = machine.snapshot();
        assert!(snap.connection_id.is_some());
        assert_eq!(snap.url.as_deref(), Some("http://localhost:4096"));
        assert_eq!(snap.session_id.as_deref(), Some("ses-1"));

        assert!(machine.transition(ConnectionEvent::Connected));
        assert_eq!(machine.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_invalid_pairs_change_nothing_and_notify_nobody() {
        use ConnectionEvent as E;
        use ConnectionStatus as S;

        let invalid: Vec<(S, E)> = vec![
            (S::Disconnected, E::Connected),
            (S::Disconnected, error()),
            (S::Disconnected, E::Retry),
            (S::Disconnected, E::MaxRetriesReached),
            (S::Disconnected, E::AppBackgrounded),
            (S::Disconnected, E::AppForegrounded),
            (S::Disconnected, E::SessionChanged),
            (S::Connecting, connect()),
            (S::Connecting, E::Retry),
            (S::Connecting, E::MaxRetriesReached),
            (S::Connecting, E::AppBackgrounded),
            (S::Connecting, E::AppForegrounded),
            (S::Connected, E::Connected),
            (S::Connected, E::Retry),
            (S::Connected, E::MaxRetriesReached),
            (S::Connected, E::AppForegrounded),
            (S::Reconnecting, connect()),
            (S::Reconnecting, E::Retry),
            (S::Reconnecting, E::AppBackgrounded),
            (S::Reconnecting, E::AppForegrounded),
            (S::Error, E::Connected),
            (S::Error, error()),
            (S::Error, E::MaxRetriesReached),
            (S::Error, E::AppBackgrounded),
            (S::Error, E::AppForegrounded),
            (S::Backgrounded, connect()),
            (S::Backgrounded, E::Connected),
            (S::Backgrounded, error()),
            (S::Backgrounded, E::Retry),
            (S::Backgrounded, E::MaxRetriesReached),
            (S::Backgrounded, E::AppBackgrounded),
        ];

        for (status, event) in invalid {
            let machine = machine_in(status);
            let before = machine.snapshot();
            let fired = Arc::new(AtomicUsize::new(0));
            let fired_in = fired.clone();
            machine.subscribe(move |_| {
                fired_in.fetch_add(1, Ordering::SeqCst);
            });

            assert!(
                !machine.transition(event.clone()),
                "expected ({:?}, {}) to be invalid",
                status,
                event.name()
            );
            assert_eq!(machine.snapshot(), before);
            assert_eq!(fired.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn test_connection_ids_are_unique_per_connect() {
        let machine = ConnectionStateMachine::new();
        assert!(machine.transition(connect()));
        let first = machine.connection_id().unwrap();

        assert!(machine.transition(ConnectionEvent::Connected));
        assert!(machine.transition(connect()));
        let second = machine.connection_id().unwrap();

        assert_ne!(first, second);
        assert!(machine.is_current_connection(Some(&second)));
        assert!(!machine.is_current_connection(Some(&first)));
        assert!(!machine.is_current_connection(None));
        assert!(!machine.is_current_connection(Some("random")));
    }

    #[test]
    fn test_reconnect_attempt_counting() {
        // Failing straight out of connecting does not increment.
        let machine = machine_in(ConnectionStatus::Connecting);
        assert!(machine.transition(error()));
        assert_eq!(machine.snapshot().reconnect_attempt, 0);
        assert_eq!(machine.status(), ConnectionStatus::Error);

        // Dropped connections do, once per error.
        let machine = machine_in(ConnectionStatus::Connected);
        assert!(machine.transition(error()));
        assert_eq!(machine.snapshot().reconnect_attempt, 1);
        assert!(machine.transition(error()));
        assert!(machine.transition(error()));
        assert_eq!(machine.snapshot().reconnect_attempt, 3);
        assert_eq!(machine.status(), ConnectionStatus::Reconnecting);

        // CONNECTED resets the counter.
        assert!(machine.transition(ConnectionEvent::Connected));
        assert_eq!(machine.snapshot().reconnect_attempt, 0);

        // So does CONNECT.
        assert!(machine.transition(error()));
        assert!(machine.transition(ConnectionEvent::Connected));
        assert!(machine.transition(connect()));
        assert_eq!(machine.snapshot().reconnect_attempt, 0);
    }

    #[test]
    fn test_disconnect_state_preservation() {
        let machine = machine_in(ConnectionStatus::Connected);
        machine.set_last_event_id("evt-9");

        assert!(machine.transition(ConnectionEvent::Disconnect {
            preserve_state: true
        }));
        let snap = machine.snapshot();
        assert_eq!(snap.status, ConnectionStatus::Disconnected);
        assert!(snap.connection_id.is_none());
        assert_eq!(snap.url.as_deref(), Some("http://localhost:4096"));
        assert_eq!(snap.last_event_id.as_deref(), Some("evt-9"));

        let machine = machine_in(ConnectionStatus::Connected);
        machine.set_last_event_id("evt-9");
        assert!(machine.transition(ConnectionEvent::Disconnect {
            preserve_state: false
        }));
        let snap = machine.snapshot();
        assert!(snap.url.is_none());
        assert!(snap.session_id.is_none());
        assert!(snap.last_event_id.is_none());
    }

    #[test]
    fn test_session_change_keeps_resume_token() {
        let machine = machine_in(ConnectionStatus::Connected);
        machine.set_last_event_id("evt-9");

        assert!(machine.transition(ConnectionEvent::SessionChanged));
        let snap = machine.snapshot();
        assert_eq!(snap.status, ConnectionStatus::Disconnected);
        assert!(snap.connection_id.is_none());
        assert!(snap.url.is_none());
        assert!(snap.session_id.is_none());
        assert_eq!(snap.last_event_id.as_deref(), Some("evt-9"));
    }

    #[test]
    fn test_background_foreground_cycle() {
        let machine = machine_in(ConnectionStatus::Connected);
        assert!(machine.transition(ConnectionEvent::AppBackgrounded));
        assert_eq!(machine.status(), ConnectionStatus::Backgrounded);

        assert!(machine.transition(ConnectionEvent::AppForegrounded));
        assert_eq!(machine.status(), ConnectionStatus::Reconnecting);

        assert!(machine.transition(ConnectionEvent::Connected));
        assert_eq!(machine.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_max_retries_settles_in_error() {
        let machine = machine_in(ConnectionStatus::Reconnecting);
        assert!(machine.transition(ConnectionEvent::MaxRetriesReached));
        assert_eq!(machine.status(), ConnectionStatus::Error);

        // Only an explicit retry or connect leaves terminal error.
        assert!(machine.transition(ConnectionEvent::Retry));
        assert_eq!(machine.status(), ConnectionStatus::Reconnecting);
    }

    #[test]
    fn test_listeners_fire_on_valid_transitions_until_unsubscribed() {
        let machine = ConnectionStateMachine::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in = fired.clone();
        let id = machine.subscribe(move |snap| {
            assert_eq!(snap.status, ConnectionStatus::Connecting);
            fired_in.fetch_add(1, Ordering::SeqCst);
        });

        assert!(machine.transition(connect()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert!(machine.unsubscribe(id));
        assert!(!machine.unsubscribe(id));
        assert!(machine.transition(ConnectionEvent::Disconnect {
            preserve_state: false
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
