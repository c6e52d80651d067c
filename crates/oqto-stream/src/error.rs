//! Pipeline error types.

use thiserror::Error;

/// Result type for pipeline operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur while driving the stream pipeline.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Building the stream request failed.
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// The stream request could not be turned into an event source.
    #[error("Failed to open event source: {0}")]
    EventSource(#[from] reqwest_eventsource::CannotCloneRequestError),

    /// A wire event failed to decode.
    #[error(transparent)]
    Wire(#[from] oqto_stream_protocol::WireError),

    /// The physical stream failed before it opened.
    #[error("Stream connection failed: {message}")]
    ConnectFailed { message: String },

    /// The requested state transition is not valid from the current state.
    #[error("Invalid connection transition: {event} while {state}")]
    InvalidTransition { state: String, event: String },

    /// No connection url is known (connect was never called, or state was
    /// not preserved on disconnect).
    #[error("No stream url to reconnect to")]
    NoUrl,

    /// The pipeline has been disposed.
    #[error("Pipeline is disposed")]
    Disposed,
}
