//! Client-side streaming pipeline for Oqto agent sessions.
//!
//! Consumes the server's long-lived `/event` SSE stream and reconstructs its
//! incremental updates into coherent, ordered, de-duplicated message state
//! for a caller, surviving the connectivity a mobile client actually has:
//! backgrounding, drops, reordering and duplicate delivery.
//!
//! ```text
//! SSE --> Transport --> EventQueue --> Processor --> caller callbacks
//!              |                           |
//!        ConnectionStateMachine      Deduplicator / StreamingMessage
//! ```
//!
//! The caller constructs one [`StreamPipeline`] per logical stream and owns
//! its lifecycle; there are no module-level singletons.

pub mod accumulator;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod error;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod streaming;
pub mod transport;

pub use accumulator::ChunkAccumulator;
pub use config::StreamConfig;
pub use connection::{
    ConnectionEvent, ConnectionSnapshot, ConnectionStateMachine, ConnectionStatus, ListenerId,
};
pub use dedup::EventDeduplicator;
pub use error::{StreamError, StreamResult};
pub use pipeline::StreamPipeline;
pub use processor::{EventProcessor, StreamCallbacks};
pub use queue::{EventConsumer, EventQueue};
pub use streaming::StreamingMessage;
pub use transport::StreamTransport;

pub use oqto_stream_protocol as protocol;
