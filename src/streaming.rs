use crate::constants::{MAX_SSE_LINE_BYTES, SSE_DONE_SENTINEL};
use crate::logging::StreamMetric;
use crate::settings::TranslationSettings;
use crate::specs::openai::{ChatChunk, ChatCompletion};
use crate::types::{LyricistError, Result};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::io::StreamReader;

/// One decoded `data:` payload of an event stream.
#[derive(Debug, Clone)]
pub enum SseFrame {
    /// The `[DONE]` sentinel.
    Done,
    Chunk(ChatChunk),
    /// An `{"error": ...}` body sent in place of a chunk.
    Error(String),
    /// Payload that is not valid JSON; carried as an error marker and skipped.
    Malformed(String),
}

fn is_error_body(value: &serde_json::Value) -> bool {
    match value.as_object() {
        Some(map) => map.contains_key("error") && !map.contains_key("choices"),
        None => false,
    }
}

/// Decodes one event-stream line. Lines that carry no `data:` payload yield `None`.
pub fn parse_sse_line(line: &str) -> Option<SseFrame> {
    let data = line.trim_end_matches('\r').strip_prefix("data:")?.trim_start();
    if data.is_empty() {
        return None;
    }
    if data == SSE_DONE_SENTINEL {
        return Some(SseFrame::Done);
    }

    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(
                "{}",
                LyricistError::Decode(format!(
                    "{} in frame {}",
                    e,
                    crate::str_utils::snippet(data, 120)
                ))
            );
            return Some(SseFrame::Malformed(data.to_string()));
        }
    };

    if is_error_body(&value) {
        return Some(SseFrame::Error(data.to_string()));
    }

    match serde_json::from_value::<ChatChunk>(value) {
        Ok(chunk) => Some(SseFrame::Chunk(chunk)),
        Err(e) => {
            tracing::debug!("{}", LyricistError::Decode(format!("unexpected chunk shape: {}", e)));
            Some(SseFrame::Malformed(data.to_string()))
        }
    }
}

/// Decodes a block of event-stream text, e.g. one network read.
pub fn parse_event_source(text: &str) -> Vec<SseFrame> {
    text.split('\n').filter_map(parse_sse_line).collect()
}

/// Concatenates the incremental content of chunk frames, ignoring everything else.
pub fn reduce_content(frames: &[SseFrame]) -> String {
    frames
        .iter()
        .filter_map(|f| match f {
            SseFrame::Chunk(chunk) => chunk.first_content(),
            _ => None,
        })
        .collect()
}

type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Incremental completion text read from an event stream until the sentinel.
pub struct CompletionStream {
    lines: FramedRead<StreamReader<ByteStream, Bytes>, AnyDelimiterCodec>,
    finished: bool,
    metric: StreamMetric,
}

impl CompletionStream {
    pub fn from_bytes<S>(bytes: S) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        let codec = AnyDelimiterCodec::new_with_max_length(
            b"\n".to_vec(),
            Vec::new(),
            MAX_SSE_LINE_BYTES,
        );
        Self {
            lines: FramedRead::new(StreamReader::new(bytes.boxed()), codec),
            finished: false,
            metric: StreamMetric::new(),
        }
    }

    pub fn from_response(response: reqwest::Response) -> Self {
        Self::from_bytes(
            response
                .bytes_stream()
                .map(|r| r.map_err(std::io::Error::other)),
        )
    }

    pub fn metric(&self) -> &StreamMetric {
        &self.metric
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.metric.log_summary();
        }
    }

    /// Next non-empty piece of content; `None` once the sentinel or end of input is reached.
    pub async fn next_content(&mut self) -> Option<Result<String>> {
        while !self.finished {
            let line = match self.lines.next().await {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    self.finish();
                    let err = match e {
                        AnyDelimiterCodecError::Io(io) => LyricistError::Io(io),
                        AnyDelimiterCodecError::MaxChunkLengthExceeded => LyricistError::Decode(
                            format!("event stream line exceeds {} bytes", MAX_SSE_LINE_BYTES),
                        ),
                    };
                    return Some(Err(err.into()));
                }
                None => {
                    tracing::debug!("Event stream closed without sentinel");
                    self.finish();
                    return None;
                }
            };

            let text = String::from_utf8_lossy(&line);
            match parse_sse_line(&text) {
                Some(SseFrame::Done) => {
                    tracing::debug!("Stream end marker {} received", SSE_DONE_SENTINEL);
                    self.finish();
                    return None;
                }
                Some(SseFrame::Chunk(chunk)) => {
                    self.metric.record_chunk(&chunk);
                    if let Some(content) = chunk.first_content() {
                        if !content.is_empty() {
                            return Some(Ok(content.to_string()));
                        }
                    }
                }
                Some(SseFrame::Error(body)) => {
                    tracing::error!("Stream error frame: {}", crate::str_utils::snippet(&body, 200));
                    self.finish();
                    return Some(Err(LyricistError::Upstream(StatusCode::OK, body).into()));
                }
                Some(SseFrame::Malformed(_)) => self.metric.record_malformed(),
                None => {}
            }
        }
        None
    }

    pub fn into_content_stream(self) -> BoxStream<'static, Result<String>> {
        futures_util::stream::unfold(self, |mut stream| async move {
            stream.next_content().await.map(|item| (item, stream))
        })
        .boxed()
    }
}

/// What a completion request produced: either a full body or an event stream.
pub enum StreamResult {
    NonStream(ChatCompletion),
    Stream(CompletionStream),
}

impl StreamResult {
    /// Both shapes as one stream of content fragments.
    pub fn into_content_stream(self) -> BoxStream<'static, Result<String>> {
        match self {
            StreamResult::NonStream(completion) => {
                let content = completion.first_content().unwrap_or_default().to_string();
                futures_util::stream::once(async move { Ok(content) }).boxed()
            }
            StreamResult::Stream(stream) => stream.into_content_stream(),
        }
    }
}

/// Anything that can answer a translation prompt with a chat completion.
pub trait CompletionSource: Send + Sync {
    fn stream_completion<'a>(
        &'a self,
        prompt: &'a str,
        settings: &'a TranslationSettings,
    ) -> BoxFuture<'a, Result<StreamResult>>;
}
