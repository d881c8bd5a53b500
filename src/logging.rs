use crate::redaction_layer::RedactingWriter;
use crate::specs::openai::ChatChunk;
use std::panic;
use std::path::Path;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

pub const LOG_FILE_NAME: &str = "lyricist.log";
pub const DEFAULT_LOG_FILTER: &str = "lyricist=info";

/// Installs the global subscriber: stderr output plus a daily NDJSON log file with secrets masked.
///
/// The returned guard flushes the file writer on drop and must outlive the program's work.
pub fn init_tracing(log_dir: &Path) -> Option<WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_LOG_FILTER.into(),
    };

    let (file_layer, guard) = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(move || RedactingWriter::new(non_blocking.clone()))
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!("Could not create log directory {:?}: {}", log_dir, e);
            (None, None)
        }
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(|| RedactingWriter::new(std::io::stderr()))
        .with_target(false);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .with(tracing_error::ErrorLayer::default())
        .try_init();
    if let Err(e) = installed {
        eprintln!("Tracing already initialized: {}", e);
    }

    guard
}

/// Sets up a global panic hook that logs panics through tracing before the default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = match panic_info.location() {
            Some(l) => format!("{}:{}:{}", l.file(), l.line(), l.column()),
            None => "unknown location".to_string(),
        };

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Counters for one completion stream, logged once when it ends.
#[derive(Debug, Default)]
pub struct StreamMetric {
    pub chunks: usize,
    pub content_chars: usize,
    pub malformed: usize,
    pub finish_reason: Option<String>,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&mut self, chunk: &ChatChunk) {
        self.chunks += 1;
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                self.content_chars += content.chars().count();
            }
            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
        }
    }

    pub fn record_malformed(&mut self) {
        self.malformed += 1;
    }

    pub fn log_summary(&self) {
        let finish = match &self.finish_reason {
            Some(r) => r.as_str(),
            None => "NONE",
        };
        info!(
            target: "lyricist::stream",
            "[STREAM END] Chunks: {} | Text: {} chars | Malformed: {} | Finish: {}",
            self.chunks, self.content_chars, self.malformed, finish
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_counts_chars_and_finish_reason() {
        let chunk: ChatChunk = match serde_json::from_str(
            r#"{"choices":[{"index":0,"delta":{"content":"你好"},"finish_reason":"stop"}]}"#,
        ) {
            Ok(c) => c,
            Err(e) => panic!("parse failed: {:?}", e),
        };
        let mut metric = StreamMetric::new();
        metric.record_chunk(&chunk);
        metric.record_malformed();
        assert_eq!(metric.chunks, 1);
        assert_eq!(metric.content_chars, 2);
        assert_eq!(metric.malformed, 1);
        assert_eq!(metric.finish_reason.as_deref(), Some("stop"));
    }
}
