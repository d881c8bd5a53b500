use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::constants::INVALID_KEY_MESSAGE;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskId(pub Uuid);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SongId(pub String);

/// Stable content hash of a lyric set; the cache key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ContentHash(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        crate::str_utils::prefix_chars(&self.0.simple().to_string(), 8).to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SongId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SongId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SongId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ContentHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ContentHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl ContentHash {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 10)
    }
}

/// --- LYRICS ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LyricLine {
    #[serde(rename = "originalLyric")]
    pub original_text: String,
    #[serde(rename = "translatedLyric", skip_serializing_if = "Option::is_none")]
    pub translated_text: Option<String>,
}

impl LyricLine {
    pub fn new(original: impl Into<String>) -> Self {
        Self {
            original_text: original.into(),
            translated_text: None,
        }
    }

    pub fn has_translation(&self) -> bool {
        match &self.translated_text {
            Some(t) => !t.is_empty(),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranslationContributor {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contributors {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation: Option<TranslationContributor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LyricSet {
    pub lyrics: Vec<LyricLine>,
    pub hash: ContentHash,
    #[serde(default)]
    pub amend: bool,
    #[serde(default)]
    pub contributors: Contributors,
}

impl LyricSet {
    pub fn new(hash: impl Into<ContentHash>, lyrics: Vec<LyricLine>) -> Self {
        Self {
            lyrics,
            hash: hash.into(),
            amend: false,
            contributors: Contributors::default(),
        }
    }

    pub fn from_lines<I, S>(hash: impl Into<ContentHash>, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(hash, lines.into_iter().map(LyricLine::new).collect())
    }

    pub fn has_any_translation(&self) -> bool {
        self.lyrics.iter().any(LyricLine::has_translation)
    }

    /// Drops every translated line and the amend marker.
    pub fn clear_translations(&mut self) {
        for line in &mut self.lyrics {
            line.translated_text = None;
        }
        self.amend = false;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SongInfo {
    pub id: SongId,
    pub name: String,
}

/// Inbound `lyrics-updated` notification from the host.
#[derive(Debug, Clone)]
pub struct LyricsUpdate {
    pub lyrics: LyricSet,
    pub song: SongInfo,
}

/// --- TASKS ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Streaming,
    Done,
    Error,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranslationTask {
    pub task_id: TaskId,
    pub song_id: SongId,
    pub song_name: String,
    pub state: TaskState,
    pub progress: f64,
}

impl TranslationTask {
    pub fn new(task_id: TaskId, song: &SongInfo) -> Self {
        Self {
            task_id,
            song_id: song.id.clone(),
            song_name: song.name.clone(),
            state: TaskState::Pending,
            progress: 0.0,
        }
    }
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum LyricistError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Quota exceeded: {0}")]
    Quota(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(StatusCode, String),

    #[error("Cache parse error: {0}")]
    CacheParse(String),

    #[error("Cache upgrade failed: {0}")]
    CacheUpgrade(String),

    #[error("Stream decode error: {0}")]
    Decode(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: Option<ApiErrorDetails>,
}

#[derive(Deserialize)]
struct ApiErrorDetails {
    code: Option<serde_json::Value>,
    message: Option<String>,
}

impl LyricistError {
    /// Raw text carried by the error, as the host would see it thrown.
    pub fn raw_text(&self) -> String {
        match self {
            LyricistError::Transport(m)
            | LyricistError::Quota(m)
            | LyricistError::Upstream(_, m)
            | LyricistError::CacheParse(m)
            | LyricistError::CacheUpgrade(m)
            | LyricistError::Decode(m)
            | LyricistError::Internal(m, _) => m.clone(),
            other => other.to_string(),
        }
    }

    /// Short message surfaced to the user on a failed task.
    pub fn user_message(&self) -> String {
        let raw = self.raw_text();
        if raw.starts_with('{') {
            if let Ok(body) = serde_json::from_str::<ApiErrorBody>(&raw) {
                if let Some(details) = body.error {
                    let is_invalid_key = match &details.code {
                        Some(serde_json::Value::String(code)) => code == "invalid_api_key",
                        _ => false,
                    };
                    if is_invalid_key {
                        return INVALID_KEY_MESSAGE.to_string();
                    }
                    if let Some(message) = details.message {
                        return message;
                    }
                }
            }
        }
        raw
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: LyricistError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<LyricistError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_key_body_maps_to_fixed_message() {
        let err = LyricistError::Upstream(
            StatusCode::UNAUTHORIZED,
            r#"{"error":{"code":"invalid_api_key"}}"#.to_string(),
        );
        assert_eq!(err.user_message(), INVALID_KEY_MESSAGE);
    }

    #[test]
    fn test_error_message_field_is_surfaced() {
        let err = LyricistError::Upstream(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"code":"model_not_found","message":"The model does not exist"}}"#
                .to_string(),
        );
        assert_eq!(err.user_message(), "The model does not exist");
    }

    #[test]
    fn test_non_json_error_passes_through_raw() {
        let err = LyricistError::Transport("Invalid API endpoint".to_string());
        assert_eq!(err.user_message(), "Invalid API endpoint");

        let broken = LyricistError::Upstream(StatusCode::BAD_GATEWAY, "{not json".to_string());
        assert_eq!(broken.user_message(), "{not json");
    }

    #[test]
    fn test_lyric_line_serializes_with_host_field_names() {
        let line = LyricLine {
            original_text: "hello".into(),
            translated_text: Some("你好".into()),
        };
        let json = match serde_json::to_value(&line) {
            Ok(v) => v,
            Err(e) => panic!("serialize failed: {:?}", e),
        };
        assert_eq!(json["originalLyric"], "hello");
        assert_eq!(json["translatedLyric"], "你好");
    }

    #[test]
    fn test_clear_translations_resets_amend() {
        let mut set = LyricSet::from_lines("h", ["a", "b"]);
        set.lyrics[0].translated_text = Some("x".into());
        set.amend = true;
        set.clear_translations();
        assert!(!set.has_any_translation());
        assert!(!set.amend);
    }
}
