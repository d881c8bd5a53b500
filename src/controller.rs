//! Task lifecycle: turns lyric updates into cache replays and, on request,
//! live generations, and reports both through the event bus.

use crate::cache::{CacheReconciler, CacheStatus, CurrentRecord};
use crate::eligibility::should_translate;
use crate::events::{EventBus, TranslationEvent};
use crate::line_mapper::{build_prompt, map_lines, MappedLyrics};
use crate::reconcile::{ActiveReconciliation, CompletedPass};
use crate::settings::{SettingsStore, TranslationSettings};
use crate::streaming::CompletionSource;
use crate::types::*;
use chrono::Utc;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// What a manual trigger needs to start generating for the current lyric set.
#[derive(Debug, Clone)]
struct PendingGeneration {
    lyrics: LyricSet,
    mapped: MappedLyrics,
    song: SongInfo,
    had_cache: bool,
}

#[derive(Default)]
struct ControllerState {
    overlay: Option<LyricSet>,
    trigger: Option<PendingGeneration>,
    tasks: HashMap<TaskId, TranslationTask>,
    upgrades: Vec<JoinHandle<()>>,
}

pub struct TranslationController {
    source: Arc<dyn CompletionSource>,
    cache: CacheReconciler,
    settings: Arc<dyn SettingsStore>,
    events: EventBus,
    state: Mutex<ControllerState>,
}

impl TranslationController {
    pub fn new(
        source: Arc<dyn CompletionSource>,
        cache: CacheReconciler,
        settings: Arc<dyn SettingsStore>,
        events: EventBus,
    ) -> Self {
        Self {
            source,
            cache,
            settings,
            events,
            state: Mutex::new(ControllerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn current_settings(&self) -> TranslationSettings {
        TranslationSettings::load(self.settings.as_ref())
    }

    pub fn overlay(&self) -> Option<LyricSet> {
        self.state().overlay.clone()
    }

    pub fn can_generate(&self) -> bool {
        self.state().trigger.is_some()
    }

    pub fn task(&self, task_id: TaskId) -> Option<TranslationTask> {
        self.state().tasks.get(&task_id).cloned()
    }

    /// Legacy cache rewrites scheduled and not yet collected.
    pub fn pending_upgrades(&self) -> usize {
        self.state().upgrades.len()
    }

    /// Waits for deferred legacy cache rewrites to finish.
    pub async fn wait_for_upgrades(&self) {
        let handles = std::mem::take(&mut self.state().upgrades);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Cache upgrade task ended abnormally: {}", e);
            }
        }
    }

    fn set_trigger(&self, trigger: Option<PendingGeneration>) {
        let available = trigger.is_some();
        self.state().trigger = trigger;
        self.events.emit(TranslationEvent::GenerateAvailable { available });
    }

    fn is_current(&self, hash: &ContentHash) -> bool {
        match &self.state().overlay {
            Some(o) => &o.hash == hash,
            None => false,
        }
    }

    fn begin_task(&self, song: &SongInfo) -> TaskId {
        let task_id = TaskId::new();
        self.state()
            .tasks
            .insert(task_id, TranslationTask::new(task_id, song));
        self.events.emit(TranslationEvent::TaskNew {
            task_id,
            song_id: song.id.clone(),
            song_name: song.name.clone(),
        });
        task_id
    }

    fn update_task(&self, task_id: TaskId, state: TaskState, progress: Option<f64>) {
        let mut guard = self.state();
        if let Some(task) = guard.tasks.get_mut(&task_id) {
            task.state = state;
            if let Some(p) = progress {
                task.progress = task.progress.max(p);
            }
        }
    }

    /// Feeds one fragment into the pass and publishes whatever it changed.
    fn apply_fragment(&self, active: &mut ActiveReconciliation, fragment: &str) {
        let outcome = {
            let mut guard = self.state();
            active.apply(fragment, &mut guard.overlay)
        };
        let task_id = active.task_id();
        for progress in outcome.progress {
            self.update_task(task_id, TaskState::Streaming, Some(progress));
            self.events.emit(TranslationEvent::TaskProgress { task_id, progress });
        }
        if let Some(lyrics) = outcome.overlay {
            self.events.emit(TranslationEvent::LyricsUpdated { lyrics });
        }
    }

    /// Ends a pass: progress reaches 100 here and only here, then done fires once.
    fn complete_pass(&self, active: ActiveReconciliation) -> CompletedPass {
        let task_id = active.task_id();
        self.update_task(task_id, TaskState::Done, Some(100.0));
        self.events.emit(TranslationEvent::TaskProgress { task_id, progress: 100.0 });

        let pass = active.finish();
        tracing::info!(
            "Task {} done with {} ({} chars)",
            task_id.short(),
            pass.model,
            pass.full_response.chars().count()
        );
        self.events.emit(TranslationEvent::TaskDone { task_id });
        pass
    }

    fn fail_task(&self, task_id: TaskId, hash: &ContentHash, err: ObservedError) {
        tracing::error!("Task {} failed: {}", task_id.short(), err);
        let reverted = {
            let mut guard = self.state();
            match guard.overlay.as_mut() {
                Some(live) if &live.hash == hash => {
                    live.clear_translations();
                    Some(live.clone())
                }
                _ => None,
            }
        };
        if let Some(lyrics) = reverted {
            self.events.emit(TranslationEvent::LyricsUpdated { lyrics });
        }
        self.update_task(task_id, TaskState::Error, None);
        self.events.emit(TranslationEvent::TaskError {
            task_id,
            error: err.inner.user_message(),
        });
    }

    /// Handles an inbound lyric update: replays a cached translation if there is one
    /// and exposes the manual trigger when the cache is absent or stale.
    pub async fn on_lyrics_updated(&self, update: LyricsUpdate) {
        let LyricsUpdate { lyrics, song } = update;
        if lyrics.amend {
            tracing::trace!("Ignoring amended lyric set {}", lyrics.hash.short());
            return;
        }
        if lyrics.has_any_translation() {
            tracing::debug!("Lyrics for {} already carry a translation", song.name);
            return;
        }

        let hash = lyrics.hash.clone();
        self.state().overlay = Some(lyrics.clone());
        self.set_trigger(None);

        let mapped = map_lines(&lyrics);
        if mapped.is_empty() || !should_translate(&mapped.original_lyrics) {
            tracing::debug!("Lyrics for {} are not eligible for translation", song.name);
            return;
        }

        let settings = self.current_settings();
        let lookup = self.cache.lookup(&hash, &settings).await;
        if !self.is_current(&hash) {
            tracing::debug!("Lyric set {} superseded during cache lookup", hash.short());
            return;
        }

        if let Some(record) = &lookup.record {
            let task_id = self.begin_task(&song);
            let mut active = ActiveReconciliation::new(
                task_id,
                lyrics.clone(),
                mapped.mapping.clone(),
                record.model.clone(),
            );
            self.apply_fragment(&mut active, &record.replay_text());
            self.complete_pass(active);

            if lookup.needs_upgrade {
                let handle = self.cache.schedule_upgrade(hash.clone(), record.clone());
                let mut guard = self.state();
                guard.upgrades.retain(|h| !h.is_finished());
                guard.upgrades.push(handle);
            }
        }

        if lookup.status != CacheStatus::Current {
            self.set_trigger(Some(PendingGeneration {
                lyrics,
                mapped,
                song,
                had_cache: lookup.record.is_some(),
            }));
        }
    }

    /// Starts a live generation for the current lyric set, if the trigger is armed.
    /// Resolves once the task has reached done or error.
    pub async fn generate(&self) -> Option<TaskId> {
        let pending = self.state().trigger.take()?;
        self.events.emit(TranslationEvent::GenerateAvailable { available: false });

        let settings = self.current_settings();
        let hash = pending.lyrics.hash.clone();
        let task_id = self.begin_task(&pending.song);

        let cleared = {
            let mut guard = self.state();
            match guard.overlay.as_mut() {
                Some(live) if live.hash == hash => {
                    live.clear_translations();
                    Some(live.clone())
                }
                _ => None,
            }
        };
        if let Some(lyrics) = cleared {
            self.events.emit(TranslationEvent::LyricsUpdated { lyrics });
        }

        let mut working = pending.lyrics;
        working.clear_translations();
        let mut active = ActiveReconciliation::new(
            task_id,
            working,
            pending.mapped.mapping.clone(),
            settings.model.clone(),
        );
        let prompt = build_prompt(&settings.prompt, &pending.mapped.original_lyrics);

        let result = match self.source.stream_completion(&prompt, &settings).await {
            Ok(r) => r,
            Err(e) => {
                self.fail_task(task_id, &hash, e);
                return Some(task_id);
            }
        };

        self.update_task(task_id, TaskState::Streaming, None);
        let mut fragments = result.into_content_stream();
        while let Some(item) = fragments.next().await {
            match item {
                Ok(fragment) => self.apply_fragment(&mut active, &fragment),
                Err(e) => {
                    self.fail_task(task_id, &hash, e);
                    return Some(task_id);
                }
            }
        }

        let pass = self.complete_pass(active);
        if !pending.had_cache {
            self.save_pass(&pass, &settings).await;
        }
        Some(task_id)
    }

    async fn save_pass(&self, pass: &CompletedPass, settings: &TranslationSettings) {
        let record = CurrentRecord::from_response(&pass.full_response, &pass.model, settings, Utc::now());
        if let Err(e) = self.cache.store().ensure_cache_dir().await {
            tracing::warn!("Could not prepare cache storage: {}", e.inner);
            return;
        }
        match self.cache.persist(&pass.hash, &record).await {
            Ok(()) => tracing::info!(
                "Cached {} translated lines for {}",
                record.lines.len(),
                pass.hash.short()
            ),
            Err(e) => tracing::warn!("Could not cache translation for {}: {}", pass.hash.short(), e.inner),
        }
    }
}
