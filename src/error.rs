use std::time::Duration;

/// Raised by the extractor while framing objects.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Brace-balanced but not valid JSON. Only this object is lost.
    #[error("malformed object ({} bytes): {source}", .raw.len())]
    Malformed {
        raw: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("pending object grew to {len} bytes, limit is {limit}")]
    Overflow { len: usize, limit: usize },
}

impl FrameError {
    /// Overflow means framing is lost for the rest of the stream.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::Overflow { .. })
    }
}

/// Stream-level failures. Any of these ends the turn.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid UTF-8 in stream at byte {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("stream ended inside an object ({pending} bytes unresolved)")]
    Unterminated { pending: usize },
    #[error("pending object grew to {len} bytes, limit is {limit}")]
    Overflow { len: usize, limit: usize },
    #[error("stream exceeded {0:?}")]
    Timeout(Duration),
    #[error("stream cancelled")]
    Cancelled,
    #[error("history error: {0}")]
    History(String),
}
