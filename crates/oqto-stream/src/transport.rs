//! Low-level stream transport with automatic reconnection.
//!
//! Owns one physical SSE connection to the server's `/event` endpoint,
//! normalizes both wire shapes into canonical envelopes, tracks the resume
//! token, and feeds the event queue. Reconnection runs with capped, jittered
//! exponential backoff while the state machine sits in `reconnecting`;
//! exhausting the attempt budget settles it in terminal `error`.
//!
//! Every spawned continuation is bound to the connection id it was issued
//! under and checks `is_current_connection` before touching anything, so a
//! stale stream can never race a newer one.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, warn};
use oqto_stream_protocol::{EventEnvelope, decode_event};
use parking_lot::Mutex;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::config::StreamConfig;
use crate::connection::{ConnectionEvent, ConnectionStateMachine, ConnectionStatus};
use crate::error::{StreamError, StreamResult};
use crate::queue::EventQueue;

/// Size of the broadcast channel for raw envelope subscribers.
const EVENT_BUFFER_SIZE: usize = 256;

/// How long to wait for the TCP/TLS handshake. The stream itself has no
/// overall timeout; it is meant to stay open.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Owns the physical stream connection.
pub struct StreamTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    machine: Arc<ConnectionStateMachine>,
    queue: Arc<EventQueue>,
    client: reqwest::Client,
    config: StreamConfig,
    reader: Mutex<Option<JoinHandle<()>>>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl StreamTransport {
    /// Create a transport driving `machine` and feeding `queue`.
    pub fn new(
        machine: Arc<ConnectionStateMachine>,
        queue: Arc<EventQueue>,
        config: StreamConfig,
    ) -> StreamResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);

        Ok(Self {
            inner: Arc::new(TransportInner {
                machine,
                queue,
                client,
                config,
                reader: Mutex::new(None),
                event_tx,
            }),
        })
    }

    /// Open a fresh logical connection to `{base_url}/event`, resuming from
    /// the last observed event id when one is held. Resolves once the stream
    /// opens, rejects on the first failure.
    pub async fn connect(&self, base_url: &str, session_id: &str) -> StreamResult<()> {
        self.close_reader();

        if !self.inner.machine.transition(ConnectionEvent::Connect {
            url: base_url.to_string(),
            session_id: session_id.to_string(),
        }) {
            return Err(StreamError::InvalidTransition {
                state: format!("{:?}", self.inner.machine.status()),
                event: "connect".to_string(),
            });
        }

        let Some(connection_id) = self.inner.machine.connection_id() else {
            return Err(StreamError::ConnectFailed {
                message: "no connection id issued".to_string(),
            });
        };

        let (opened_tx, opened_rx) = oneshot::channel();
        start_reader(&self.inner, connection_id, Some(opened_tx));

        match opened_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(StreamError::ConnectFailed { message }),
            // The reader was superseded before the stream settled.
            Err(_) => Err(StreamError::ConnectFailed {
                message: "connection superseded".to_string(),
            }),
        }
    }

    /// Re-issue `connect` against the stored url. A no-op without one.
    pub async fn reconnect(&self) -> StreamResult<()> {
        let snapshot = self.inner.machine.snapshot();
        let (Some(url), Some(session_id)) = (snapshot.url, snapshot.session_id) else {
            debug!("Reconnect requested with no stored url; ignoring");
            return Ok(());
        };
        self.connect(&url, &session_id).await
    }

    /// Close the physical connection. With `preserve_state` the url, session
    /// and resume token survive for a later reconnect.
    pub fn disconnect(&self, preserve_state: bool) {
        self.close_reader();
        self.inner
            .machine
            .transition(ConnectionEvent::Disconnect { preserve_state });
    }

    /// Close the physical stream without a state transition (backgrounding).
    pub fn suspend(&self) {
        self.close_reader();
    }

    /// Re-open the physical stream for the live connection while the machine
    /// is `reconnecting` (foregrounding, caller retry).
    pub fn resume(&self) {
        if self.inner.machine.status() != ConnectionStatus::Reconnecting {
            return;
        }
        let Some(connection_id) = self.inner.machine.connection_id() else {
            return;
        };
        start_reader(&self.inner, connection_id, None);
    }

    /// Subscribe to every canonical envelope as it arrives, bypassing the
    /// queue and processor.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.event_tx.subscribe()
    }

    fn close_reader(&self) {
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
    }
}

/// Replace the reader task with a fresh stream for `connection_id`.
fn start_reader(
    inner: &Arc<TransportInner>,
    connection_id: String,
    opened: Option<oneshot::Sender<Result<(), String>>>,
) {
    let mut guard = inner.reader.lock();
    if let Some(old) = guard.take() {
        old.abort();
    }
    *guard = Some(tokio::spawn(run_stream(
        inner.clone(),
        connection_id,
        opened,
    )));
}

/// Drive one physical stream until it fails, ends, or goes stale.
async fn run_stream(
    inner: Arc<TransportInner>,
    connection_id: String,
    mut opened: Option<oneshot::Sender<Result<(), String>>>,
) {
    let snapshot = inner.machine.snapshot();
    let Some(url) = snapshot.url else {
        return;
    };
    let endpoint = format!("{}/event", url.trim_end_matches('/'));

    debug!("Connecting to event stream at {}", endpoint);

    let mut request = inner
        .client
        .get(&endpoint)
        .header("Accept", "text/event-stream");
    if let Some(last_event_id) = snapshot.last_event_id {
        request = request.header("Last-Event-ID", last_event_id);
    }

    let mut es = match EventSource::new(request) {
        Ok(es) => es,
        Err(e) => {
            let message = format!("failed to build event source: {}", e);
            if let Some(opened) = opened.take() {
                let _ = opened.send(Err(message.clone()));
            }
            stream_failed(&inner, &connection_id, message);
            return;
        }
    };

    while let Some(item) = es.next().await {
        if !inner.machine.is_current_connection(Some(&connection_id)) {
            debug!("Stream for stale connection {}; closing", connection_id);
            es.close();
            return;
        }

        match item {
            Ok(Event::Open) => {
                info!("Event stream opened ({})", endpoint);
                inner.machine.transition(ConnectionEvent::Connected);
                if let Some(opened) = opened.take() {
                    let _ = opened.send(Ok(()));
                }
            }
            Ok(Event::Message(msg)) => {
                handle_message(&inner, &msg.id, &msg.event, &msg.data);
            }
            Err(e) => {
                es.close();
                let message = e.to_string();
                if let Some(opened) = opened.take() {
                    let _ = opened.send(Err(message.clone()));
                }
                stream_failed(&inner, &connection_id, message);
                return;
            }
        }
    }

    // The server closed a healthy stream; recover like any other failure.
    es.close();
    stream_failed(&inner, &connection_id, "stream ended".to_string());
}

/// Normalize and forward one raw stream event. A parse failure drops only
/// that event.
fn handle_message(inner: &Arc<TransportInner>, sse_id: &str, event_name: &str, data: &str) {
    match decode_event(event_name, data) {
        Ok(Some(mut envelope)) => {
            if envelope.event_id.is_none() && !sse_id.is_empty() {
                envelope.event_id = Some(sse_id.to_string());
            }
            if let Some(event_id) = &envelope.event_id {
                inner.machine.set_last_event_id(event_id.as_str());
            }
            let _ = inner.event_tx.send(envelope.clone());
            inner.queue.enqueue(envelope);
        }
        Ok(None) => {
            // Keepalive or a kind this client does not consume.
        }
        Err(e) => {
            warn!("Dropping malformed stream event '{}': {}", event_name, e);
        }
    }
}

/// Drive the machine through a stream failure and line up recovery.
fn stream_failed(inner: &Arc<TransportInner>, connection_id: &str, message: String) {
    if !inner.machine.is_current_connection(Some(connection_id)) {
        return;
    }
    warn!("Event stream failed: {}", message);
    if !inner
        .machine
        .transition(ConnectionEvent::Error { message })
    {
        return;
    }
    schedule_reconnect(inner.clone(), connection_id.to_string());
}

/// Schedule the next reconnect attempt with capped, jittered exponential
/// backoff. Gives up through `MAX_RETRIES_REACHED` once the budget is spent.
fn schedule_reconnect(inner: Arc<TransportInner>, connection_id: String) {
    let snapshot = inner.machine.snapshot();
    let attempt = snapshot.reconnect_attempt;

    match snapshot.status {
        ConnectionStatus::Reconnecting => {
            if attempt >= inner.config.max_reconnect_attempts {
                error!(
                    "Event stream exceeded {} reconnect attempts; giving up",
                    inner.config.max_reconnect_attempts
                );
                inner
                    .machine
                    .transition(ConnectionEvent::MaxRetriesReached);
                return;
            }

            let delay = calculate_backoff(attempt, &inner.config);
            debug!(
                "Reconnecting in {} ms (attempt {})",
                delay,
                attempt + 1
            );
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if !inner.machine.is_current_connection(Some(&connection_id)) {
                    return;
                }
                if inner.machine.status() != ConnectionStatus::Reconnecting {
                    return;
                }
                start_reader(&inner, connection_id, None);
            });
        }

        // A failure straight out of `connecting` lands in `error`; retry it
        // on the same backoff curve rather than waiting for the caller.
        ConnectionStatus::Error => {
            let delay = calculate_backoff(attempt, &inner.config);
            debug!("Retrying failed connect in {} ms", delay);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if !inner.machine.is_current_connection(Some(&connection_id)) {
                    return;
                }
                if inner.machine.status() != ConnectionStatus::Error {
                    return;
                }
                if inner.machine.transition(ConnectionEvent::Retry) {
                    start_reader(&inner, connection_id, None);
                }
            });
        }

        _ => {}
    }
}

/// Exponential backoff with up to 20% jitter, capped.
fn calculate_backoff(attempt: u32, config: &StreamConfig) -> u64 {
    let base = config.base_backoff.as_millis() as f64;
    let exp = 2.0_f64.powi(attempt.min(10) as i32);
    let delay = (base * exp) as u64;

    let jitter = (delay as f64 * 0.2 * rand::random::<f64>()) as u64;

    (delay + jitter).min(config.max_backoff.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StreamConfig {
        StreamConfig::default()
    }

    fn noop_consumer() -> Arc<dyn crate::queue::EventConsumer> {
        Arc::new(|_envelope: EventEnvelope| -> anyhow::Result<()> { Ok(()) })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = config();
        for attempt in 0..20 {
            let floor = (500u64 * 2u64.saturating_pow(attempt.min(10))).min(30_000);
            let delay = calculate_backoff(attempt, &config);
            assert!(delay >= floor);
            assert!(delay <= 30_000);
        }
        // Early attempts stay under the cap even with full jitter.
        assert!(calculate_backoff(0, &config) < 1000);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_and_enters_error() {
        let machine = Arc::new(ConnectionStateMachine::new());
        let queue = Arc::new(EventQueue::new(&config(), noop_consumer()));
        let transport =
            StreamTransport::new(machine.clone(), queue, config()).expect("transport");

        // Nothing listens on port 9; the handshake fails fast.
        let result = transport.connect("http://127.0.0.1:9", "ses-1").await;
        assert!(matches!(result, Err(StreamError::ConnectFailed { .. })));
        assert_eq!(machine.status(), ConnectionStatus::Error);
        // The first failure out of `connecting` does not count as a retry.
        assert_eq!(machine.snapshot().reconnect_attempt, 0);
    }

    #[tokio::test]
    async fn test_reconnect_without_stored_url_is_a_no_op() {
        let machine = Arc::new(ConnectionStateMachine::new());
        let queue = Arc::new(EventQueue::new(&config(), noop_consumer()));
        let transport =
            StreamTransport::new(machine.clone(), queue, config()).expect("transport");

        assert!(transport.reconnect().await.is_ok());
        assert_eq!(machine.status(), ConnectionStatus::Disconnected);
    }
}
