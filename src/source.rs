use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::error::StreamError;

/// A single response body, chunk by chunk, in arrival order.
/// `Ok(None)` means the body ended cleanly.
#[async_trait]
pub trait ChunkSource: Send {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError>;
}

/// Blanket impl so `Box<dyn ChunkSource>` can be passed to `TurnReader::new()`.
#[async_trait]
impl ChunkSource for Box<dyn ChunkSource> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        (**self).next_chunk().await
    }
}

// --- MemorySource ---

/// Pre-captured chunks, replayed as-is. Useful for replaying stored bodies.
#[derive(Debug, Default)]
pub struct MemorySource {
    chunks: VecDeque<Bytes>,
}

impl MemorySource {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        Ok(self.chunks.pop_front())
    }
}

// --- ReaderSource ---

/// Any async reader (stdin, a file, a socket half).
pub struct ReaderSource<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self::with_capacity(reader, 8 * 1024)
    }

    pub fn with_capacity(reader: R, capacity: usize) -> Self {
        Self {
            reader,
            buf: vec![0; capacity.max(1)],
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ChunkSource for ReaderSource<R> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        let n = self
            .reader
            .read(&mut self.buf)
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
    }
}

// --- HttpSource ---

type BodyStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Body of a streaming HTTP response.
pub struct HttpSource {
    body: BodyStream,
}

impl HttpSource {
    pub fn from_response(response: reqwest::Response) -> Self {
        Self {
            body: Box::pin(response.bytes_stream()),
        }
    }
}

#[async_trait]
impl ChunkSource for HttpSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        match self.body.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(StreamError::Transport(e.to_string())),
            None => Ok(None),
        }
    }
}

// --- PredictionClient ---

/// Opens streaming prediction requests against an agent-flow backend.
pub struct PredictionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl PredictionClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn request_body(question: &str, session_id: Option<&str>) -> Value {
        let mut body = json!({
            "question": question,
            "streaming": true,
        });
        if let Some(sid) = session_id {
            body["overrideConfig"] = json!({ "sessionId": sid });
        }
        body
    }

    /// Start a prediction and hand back its body as a chunk source.
    /// Nothing is read from the body yet.
    pub async fn open(
        &self,
        flow_id: &str,
        question: &str,
        session_id: Option<&str>,
    ) -> Result<HttpSource, StreamError> {
        let url = format!(
            "{}/api/v1/prediction/{}",
            self.base_url.trim_end_matches('/'),
            flow_id
        );
        debug!(%url, ?session_id, "opening prediction stream");

        let mut req = self
            .client
            .post(url)
            .header("content-type", "application/json");
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .json(&Self::request_body(question, session_id))
            .send()
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .map_err(|e| StreamError::Transport(e.to_string()))?;
            return Err(StreamError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(HttpSource::from_response(resp))
    }
}
