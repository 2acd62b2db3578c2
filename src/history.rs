use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::events::Event;

/// Stores finished turns so a conversation can be replayed later.
#[async_trait]
pub trait HistorySink: Send + Sync {
    /// Append one turn to a session's history.
    async fn record(&self, session_id: &str, turn: &TurnRecord) -> Result<(), StreamError>;

    /// All recorded turns for a session, oldest first.
    async fn load(&self, session_id: &str) -> Result<Vec<TurnRecord>, StreamError>;
}

/// How a turn's stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    /// The stream broke off. `events` holds whatever arrived before that.
    Failed,
}

/// One assistant turn in storable form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub status: TurnStatus,
    /// Compacted event sequence.
    pub events: Vec<Event>,
    #[serde(default)]
    pub malformed_frames: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl TurnRecord {
    pub fn text(&self) -> String {
        final_text(&self.events)
    }
}

/// Answer text of a turn: the `end` payload's `final_answer` if present,
/// otherwise the concatenated token text.
pub fn final_text(events: &[Event]) -> String {
    let final_answer = events.iter().rev().find_map(|e| match e {
        Event::End(Some(data)) => data.get("final_answer").and_then(|v| v.as_str()),
        _ => None,
    });
    match final_answer {
        Some(answer) => answer.to_string(),
        None => events.iter().filter_map(Event::token_text).collect(),
    }
}

// --- NoHistory ---

/// Nothing is kept.
pub struct NoHistory;

#[async_trait]
impl HistorySink for NoHistory {
    async fn record(&self, _: &str, _: &TurnRecord) -> Result<(), StreamError> {
        Ok(())
    }

    async fn load(&self, _: &str) -> Result<Vec<TurnRecord>, StreamError> {
        Ok(Vec::new())
    }
}

// --- FileHistory ---

/// One JSON file per session, holding an array of turns.
pub struct FileHistory {
    dir: PathBuf,
}

impl FileHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Session ids can arrive from the backend, so only plain file names are
    /// accepted: ASCII letters, digits, `-`, `_` and `.`, not starting with `.`.
    fn path(&self, session_id: &str) -> Result<PathBuf, StreamError> {
        let plain = !session_id.is_empty()
            && !session_id.starts_with('.')
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !plain {
            return Err(StreamError::History(format!(
                "invalid session id: {session_id:?}"
            )));
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }
}

#[async_trait]
impl HistorySink for FileHistory {
    async fn record(&self, session_id: &str, turn: &TurnRecord) -> Result<(), StreamError> {
        let path = self.path(session_id)?;
        let mut turns = self.load(session_id).await?;
        turns.push(turn.clone());

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StreamError::History(e.to_string()))?;
        let json = serde_json::to_string_pretty(&turns)
            .map_err(|e| StreamError::History(e.to_string()))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| StreamError::History(e.to_string()))?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Vec<TurnRecord>, StreamError> {
        match tokio::fs::read_to_string(self.path(session_id)?).await {
            Ok(json) => {
                serde_json::from_str(&json).map_err(|e| StreamError::History(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StreamError::History(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn turn(events: Vec<Event>) -> TurnRecord {
        TurnRecord {
            status: TurnStatus::Completed,
            events,
            malformed_frames: 0,
            error: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn text_prefers_final_answer() {
        let record = turn(vec![
            Event::Token("draft".into()),
            Event::End(Some(json!({"final_answer": "final"}))),
        ]);
        assert_eq!(record.text(), "final");
    }

    #[test]
    fn text_falls_back_to_tokens() {
        let record = turn(vec![
            Event::Token("Hi".into()),
            Event::CalledTools(json!([])),
            Event::Token(" there".into()),
            Event::End(None),
        ]);
        assert_eq!(record.text(), "Hi there");
    }

    #[tokio::test]
    async fn file_history_appends_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let history = FileHistory::new(dir.path().join("turns"));

        assert!(history.load("s1").await.unwrap().is_empty());

        history
            .record("s1", &turn(vec![Event::Token("one".into())]))
            .await
            .unwrap();
        let mut failed = turn(vec![Event::Token("tw".into())]);
        failed.status = TurnStatus::Failed;
        failed.error = Some("stream ended inside an object".into());
        history.record("s1", &failed).await.unwrap();

        let turns = history.load("s1").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].events, vec![Event::Token("one".into())]);
        assert_eq!(turns[1].status, TurnStatus::Failed);
        assert!(history.load("s2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_ids_cannot_leave_the_history_dir() {
        let root = tempfile::tempdir().unwrap();
        let history = FileHistory::new(root.path().join("turns"));
        let record = turn(vec![Event::Token("x".into())]);

        for sid in ["../escaped", "..", "", "a/b", "a\\b", ".hidden", "/abs"] {
            assert!(
                matches!(
                    history.record(sid, &record).await,
                    Err(StreamError::History(_))
                ),
                "{sid:?} was accepted"
            );
            assert!(matches!(
                history.load(sid).await,
                Err(StreamError::History(_))
            ));
        }
        assert!(!root.path().join("escaped.json").exists());
        assert!(!root.path().join("turns").exists());

        history
            .record("3f2a9c1e-7b4d-4e8a-9c0f-1d2e3f4a5b6c", &record)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "not json").unwrap();
        let history = FileHistory::new(dir.path());
        assert!(matches!(
            history.load("bad").await,
            Err(StreamError::History(_))
        ));
    }
}
