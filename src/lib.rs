pub mod compactor;
pub mod decoder;
pub mod error;
pub mod events;
pub mod extractor;
pub mod history;
pub mod source;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use compactor::compact;
pub use decoder::Utf8Decoder;
pub use error::{FrameError, StreamError};
pub use events::Event;
pub use extractor::{FrameExtractor, DEFAULT_MAX_PENDING};
pub use history::{final_text, FileHistory, HistorySink, NoHistory, TurnRecord, TurnStatus};
pub use source::{ChunkSource, HttpSource, MemorySource, PredictionClient, ReaderSource};

/// Per-stream configuration.
pub struct StreamConfig {
    /// Session the turn belongs to. A `session_id` event in the stream replaces it.
    pub session_id: Option<String>,
    /// Cap on a single partially received object.
    pub max_pending_bytes: usize,
    /// Give up on the whole stream after this long.
    pub max_duration: Option<Duration>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            session_id: None,
            max_pending_bytes: DEFAULT_MAX_PENDING,
            max_duration: None,
        }
    }
}

impl StreamConfig {
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_max_duration(mut self, limit: Duration) -> Self {
        self.max_duration = Some(limit);
        self
    }

    pub fn with_max_pending_bytes(mut self, limit: usize) -> Self {
        self.max_pending_bytes = limit;
        self
    }
}

/// Result of reading one turn to completion.
#[derive(Debug)]
pub struct TurnOutcome {
    /// Compacted events, without the `start` marker.
    pub events: Vec<Event>,
    /// Session the turn ended up in.
    pub session_id: Option<String>,
    pub malformed_frames: usize,
}

impl TurnOutcome {
    pub fn text(&self) -> String {
        final_text(&self.events)
    }
}

/// What has been seen so far on one stream.
#[derive(Default)]
struct Capture {
    events: Vec<Event>,
    session_id: Option<String>,
    malformed: usize,
}

impl Capture {
    async fn accept(&mut self, event: Event, tx: Option<&mpsc::Sender<Event>>) {
        if let Event::SessionId(ref id) = event {
            if self.session_id.as_deref() != Some(id.as_str()) {
                info!(session_id = %id, "session assigned mid-stream");
                self.session_id = Some(id.clone());
            }
        }
        if let Some(tx) = tx {
            let _ = tx.send(event.clone()).await;
        }
        // Lifecycle marker only, nothing to replay.
        if !matches!(event, Event::Start(_)) {
            self.events.push(event);
        }
    }
}

/// Reads one response body into events. Wire up a source, optionally a
/// history sink, and go.
pub struct TurnReader {
    source: Box<dyn ChunkSource>,
    history: Box<dyn HistorySink>,
    config: StreamConfig,
}

impl TurnReader {
    pub fn new(source: impl ChunkSource + 'static, config: StreamConfig) -> Self {
        Self {
            source: Box::new(source),
            history: Box::new(NoHistory),
            config,
        }
    }

    pub fn with_history(mut self, history: impl HistorySink + 'static) -> Self {
        self.history = Box::new(history);
        self
    }

    /// Read until the body ends.
    pub async fn read(self) -> Result<TurnOutcome, StreamError> {
        self.run(None, None).await
    }

    /// Read with cancellation support.
    pub async fn read_with_cancel(
        self,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, StreamError> {
        self.run(Some(cancel), None).await
    }

    /// Read, forwarding every event on `tx` as soon as it is complete.
    pub async fn read_streaming(
        self,
        tx: mpsc::Sender<Event>,
    ) -> Result<TurnOutcome, StreamError> {
        self.run(None, Some(tx)).await
    }

    async fn run(
        mut self,
        cancel: Option<CancellationToken>,
        tx: Option<mpsc::Sender<Event>>,
    ) -> Result<TurnOutcome, StreamError> {
        let mut capture = Capture {
            session_id: self.config.session_id.clone(),
            ..Capture::default()
        };

        let max_duration = self.config.max_duration;
        let result = match max_duration {
            Some(limit) => {
                let pump = self.pump(&mut capture, cancel.as_ref(), tx.as_ref());
                match tokio::time::timeout(limit, pump).await {
                    Ok(result) => result,
                    Err(_) => Err(StreamError::Timeout(limit)),
                }
            }
            None => self.pump(&mut capture, cancel.as_ref(), tx.as_ref()).await,
        };

        let events = compact(&capture.events);
        let status = match &result {
            Ok(()) => TurnStatus::Completed,
            Err(StreamError::Cancelled) => {
                info!("stream cancelled, turn not recorded");
                return Err(StreamError::Cancelled);
            }
            Err(e) => {
                warn!(error = %e, captured = capture.events.len(), "turn failed");
                TurnStatus::Failed
            }
        };

        let record = TurnRecord {
            status,
            events,
            malformed_frames: capture.malformed,
            error: result.as_ref().err().map(|e| e.to_string()),
            created_at: chrono::Utc::now(),
        };

        let saved = match capture.session_id {
            Some(ref sid) => self.history.record(sid, &record).await,
            None => {
                debug!("no session id, turn not recorded");
                Ok(())
            }
        };

        match result {
            Ok(()) => {
                saved?;
                info!(
                    events = record.events.len(),
                    malformed = record.malformed_frames,
                    "turn complete"
                );
                Ok(TurnOutcome {
                    events: record.events,
                    session_id: capture.session_id,
                    malformed_frames: record.malformed_frames,
                })
            }
            Err(e) => {
                if let Err(history_err) = saved {
                    warn!(error = %history_err, "failed to record failed turn");
                }
                Err(e)
            }
        }
    }

    async fn pump(
        &mut self,
        capture: &mut Capture,
        cancel: Option<&CancellationToken>,
        tx: Option<&mpsc::Sender<Event>>,
    ) -> Result<(), StreamError> {
        let mut decoder = Utf8Decoder::new();
        let mut extractor = FrameExtractor::new().with_max_pending(self.config.max_pending_bytes);

        loop {
            let next = match cancel {
                Some(cancel) => {
                    if cancel.is_cancelled() {
                        return Err(StreamError::Cancelled);
                    }
                    tokio::select! {
                        chunk = self.source.next_chunk() => chunk?,
                        _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                    }
                }
                None => self.source.next_chunk().await?,
            };
            let Some(bytes) = next else { break };

            let text = decoder.decode(&bytes)?;
            for frame in extractor.process(&text) {
                match frame {
                    Ok(event) => capture.accept(event, tx).await,
                    Err(FrameError::Overflow { len, limit }) => {
                        return Err(StreamError::Overflow { len, limit })
                    }
                    Err(e) => {
                        capture.malformed += 1;
                        warn!(error = %e, "dropping malformed object");
                    }
                }
            }
        }

        decoder.finish()?;
        extractor.finish()
    }
}
