use crate::constants::EVENT_BUS_CAPACITY;
use crate::types::{LyricSet, SongId, TaskId};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Everything the controller announces to the host.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TranslationEvent {
    #[serde(rename = "translation-task-new")]
    TaskNew {
        task_id: TaskId,
        song_id: SongId,
        song_name: String,
    },
    #[serde(rename = "translation-task-progress")]
    TaskProgress { task_id: TaskId, progress: f64 },
    #[serde(rename = "translation-task-done")]
    TaskDone { task_id: TaskId },
    #[serde(rename = "translation-task-error")]
    TaskError { task_id: TaskId, error: String },
    /// The overlay changed and should be re-rendered.
    LyricsUpdated { lyrics: LyricSet },
    /// Whether a manual (re)generation can currently be started.
    GenerateAvailable { available: bool },
}

impl TranslationEvent {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            TranslationEvent::TaskNew { task_id, .. }
            | TranslationEvent::TaskProgress { task_id, .. }
            | TranslationEvent::TaskDone { task_id }
            | TranslationEvent::TaskError { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

/// Fire-and-forget broadcast of translation events. Sending never blocks and
/// succeeds with no subscribers; slow subscribers miss old events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TranslationEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: TranslationEvent) {
        tracing::trace!("emit {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranslationEvent> {
        self.tx.subscribe()
    }

    /// Events for a single task, in order. Lagged gaps are skipped.
    pub fn subscribe_task(&self, task_id: TaskId) -> impl Stream<Item = TranslationEvent> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| async move {
            match item {
                Ok(event) if event.task_id() == Some(task_id) => Some(event),
                Ok(_) => None,
                Err(e) => {
                    tracing::debug!("Task subscriber for {} lagged: {}", task_id.short(), e);
                    None
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_subscription_filters_other_tasks() {
        let bus = EventBus::default();
        let mine = TaskId::new();
        let other = TaskId::new();
        let stream = bus.subscribe_task(mine);
        tokio::pin!(stream);

        bus.emit(TranslationEvent::TaskProgress { task_id: other, progress: 10.0 });
        bus.emit(TranslationEvent::GenerateAvailable { available: true });
        bus.emit(TranslationEvent::TaskProgress { task_id: mine, progress: 50.0 });
        bus.emit(TranslationEvent::TaskDone { task_id: mine });

        match stream.next().await {
            Some(TranslationEvent::TaskProgress { task_id, progress }) => {
                assert_eq!(task_id, mine);
                assert_eq!(progress, 50.0);
            }
            other => panic!("Expected progress, got {:?}", other),
        }
        assert!(matches!(stream.next().await, Some(TranslationEvent::TaskDone { .. })));
    }

    #[test]
    fn test_emit_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        bus.emit(TranslationEvent::TaskDone { task_id: TaskId::new() });
    }

    #[test]
    fn test_events_serialize_with_host_names() {
        let event = TranslationEvent::TaskDone { task_id: TaskId::new() };
        let json = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(e) => panic!("serialize failed: {:?}", e),
        };
        assert_eq!(json["type"], "translation-task-done");
    }
}
