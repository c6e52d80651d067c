//! Canonical stream event types for the Oqto mobile client pipeline.
//!
//! The agent server pushes incremental updates over a one-directional SSE
//! stream in two historical wire shapes. This crate defines the single
//! canonical representation the client pipeline operates on:
//!
//! ```text
//! Server --[SSE: flat or nested wire events]--> Transport --[EventEnvelope]--> Processor
//! ```
//!
//! ## Design Principles
//!
//! 1. **One envelope, two wire shapes.** Both wire formats decode into the
//!    same [`EventEnvelope`]; nothing past the transport boundary knows which
//!    shape an event arrived in.
//! 2. **Typed at the edges.** Wire discrimination is a serde-decoded tagged
//!    union, not ad hoc property probing.
//! 3. **Opaque where the caller owns the meaning.** Todo lists, diffs,
//!    permission patterns and question bodies stay `serde_json::Value`.

pub mod envelope;
pub mod message;
pub mod wire;

pub use envelope::{EventEnvelope, EventKind, EventPayload};
pub use message::{MessageDto, MessagePart, MessageRole, SessionEvent, ToolState};
pub use wire::{WireError, decode_event};
