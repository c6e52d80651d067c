//! The caller-owned pipeline object.
//!
//! Composes the state machine, transport, queue and processor behind one
//! handle with an explicit `new` / `reset` / `dispose` lifecycle. The caller
//! constructs and owns it; nothing here lives in module-level state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::info;
use oqto_stream_protocol::EventEnvelope;
use tokio::sync::broadcast;

use crate::config::StreamConfig;
use crate::connection::{
    ConnectionEvent, ConnectionSnapshot, ConnectionStateMachine, ConnectionStatus, ListenerId,
};
use crate::error::{StreamError, StreamResult};
use crate::processor::{EventProcessor, StreamCallbacks};
use crate::queue::EventQueue;
use crate::transport::StreamTransport;

/// One streaming pipeline for one logical stream owner.
pub struct StreamPipeline {
    machine: Arc<ConnectionStateMachine>,
    queue: Arc<EventQueue>,
    processor: EventProcessor,
    transport: StreamTransport,
    disposed: AtomicBool,
}

impl StreamPipeline {
    /// Build a pipeline delivering into `callbacks`.
    pub fn new(config: StreamConfig, callbacks: Arc<dyn StreamCallbacks>) -> StreamResult<Self> {
        let machine = Arc::new(ConnectionStateMachine::new());
        let processor = EventProcessor::new(&config, callbacks);
        let consumer = {
            let processor = processor.clone();
            Arc::new(move |envelope: EventEnvelope| -> anyhow::Result<()> {
                processor.process_event(envelope);
                Ok(())
            })
        };
        let queue = Arc::new(EventQueue::new(&config, consumer));
        let transport = StreamTransport::new(machine.clone(), queue.clone(), config)?;

        Ok(Self {
            machine,
            queue,
            processor,
            transport,
            disposed: AtomicBool::new(false),
        })
    }

    /// Connect to `{base_url}/event` for `session_id`. Switching to a
    /// different session than the current one resets every per-session
    /// structure first.
    pub async fn connect(&self, base_url: &str, session_id: &str) -> StreamResult<()> {
        self.ensure_live()?;

        if let Some(current) = self.processor.active_session()
            && current != session_id
        {
            info!("Switching stream session {} -> {}", current, session_id);
            self.machine.transition(ConnectionEvent::SessionChanged);
            self.processor.reset();
            self.queue.clear();
        }
        self.processor.set_session(session_id);

        self.transport.connect(base_url, session_id).await
    }

    /// Re-issue connect against the stored url. A no-op without one.
    pub async fn reconnect(&self) -> StreamResult<()> {
        self.ensure_live()?;
        self.transport.reconnect().await
    }

    /// Close the physical connection. With `preserve_state` a later
    /// [`StreamPipeline::reconnect`] can resume where it left off.
    pub fn disconnect(&self, preserve_state: bool) {
        self.transport.disconnect(preserve_state);
    }

    /// Caller-initiated retry out of terminal `error`.
    pub fn retry(&self) {
        if self.machine.transition(ConnectionEvent::Retry) {
            self.transport.resume();
        }
    }

    /// Discard every per-session structure without tearing the pipeline
    /// down. Required between sessions.
    pub fn reset(&self) {
        self.machine.transition(ConnectionEvent::SessionChanged);
        self.processor.reset();
        self.queue.clear();
    }

    /// Tear everything down. The pipeline cannot be used afterwards.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transport.disconnect(false);
        self.queue.close();
        self.processor.reset();
    }

    /// Register a locally created user message awaiting its server echo.
    pub fn add_optimistic_message(&self, local_id: impl Into<String>) {
        self.processor.add_optimistic_message(local_id);
    }

    /// Optimistic ids still awaiting their echo.
    pub fn pending_optimistic(&self) -> usize {
        self.processor.pending_optimistic()
    }

    /// Arm the caller-visible "awaiting first response" timer.
    pub fn arm_response_timer(&self, timeout: Duration) {
        self.processor.arm_response_timer(timeout);
    }

    /// Cancel the first-response timer without firing it.
    pub fn clear_response_timer(&self) {
        self.processor.clear_response_timer();
    }

    /// Current connection state snapshot.
    pub fn connection_state(&self) -> ConnectionSnapshot {
        self.machine.snapshot()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_connection(
        &self,
        listener: impl Fn(&ConnectionSnapshot) + Send + Sync + 'static,
    ) -> ListenerId {
        self.machine.subscribe(listener)
    }

    /// Remove a connection state listener.
    pub fn unsubscribe_connection(&self, id: ListenerId) -> bool {
        self.machine.unsubscribe(id)
    }

    /// Subscribe to raw canonical envelopes, bypassing the processor.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.transport.subscribe_events()
    }

    /// The app moved to the background: park the stream, keep state for a
    /// cheap resume.
    pub fn on_app_backgrounded(&self) {
        if self.machine.transition(ConnectionEvent::AppBackgrounded) {
            self.transport.suspend();
        }
    }

    /// The app returned to the foreground: re-open the parked stream.
    pub fn on_app_foregrounded(&self) {
        if self.machine.transition(ConnectionEvent::AppForegrounded) {
            self.transport.resume();
        }
    }

    /// Events shed under queue backpressure since creation.
    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped_events()
    }

    fn ensure_live(&self) -> StreamResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(StreamError::Disposed);
        }
        Ok(())
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        self.dispose();
    }
}
