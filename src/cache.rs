use crate::constants::*;
use crate::settings::TranslationSettings;
use crate::types::{ContentHash, LyricistError, Result};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

lazy_static! {
    static ref NUMBERED_LINE: Regex =
        Regex::new(r"^(\d+)[\.、]\s*").expect("Invalid numbered line regex");
}

/// Line number (1-based) to translated text.
pub type NumberedLines = BTreeMap<u32, String>;

/// On-disk translation record, schema version 2.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrentRecord {
    pub model: String,
    pub temperature: Option<f64>,
    #[serde(rename = "topP")]
    pub top_p: Option<f64>,
    #[serde(rename = "Lyrics")]
    pub lines: NumberedLines,
    pub prompt: String,
    pub version: u32,
    #[serde(rename = "savedAt", default = "Utc::now")]
    pub saved_at: DateTime<Utc>,
}

/// A cache entry as found in storage.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheRecord {
    /// Raw model output written before configs were recorded.
    Legacy { text: String },
    Current(CurrentRecord),
    /// Valid JSON that is neither of the above.
    Unparseable { raw: String },
}

fn sampling_key(v: Option<f64>) -> f64 {
    match v {
        Some(x) if x.is_finite() && x >= 0.0 => x,
        _ => SAMPLING_DISABLED_SENTINEL,
    }
}

fn sampling_matches(a: Option<f64>, b: Option<f64>) -> bool {
    (sampling_key(a) - sampling_key(b)).abs() < CONFIG_MATCH_TOLERANCE
}

impl CurrentRecord {
    pub fn from_response(
        full_response: &str,
        model: &str,
        settings: &TranslationSettings,
        saved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            model: model.to_string(),
            temperature: settings.temperature,
            top_p: settings.top_p,
            lines: parse_numbered_lines(full_response),
            prompt: settings.prompt.clone(),
            version: CACHE_SCHEMA_VERSION,
            saved_at,
        }
    }

    /// True when the record was produced with the same model, prompt and sampling parameters.
    pub fn config_matches(&self, settings: &TranslationSettings) -> bool {
        self.model == settings.model
            && self.prompt == settings.prompt
            && sampling_matches(self.temperature, settings.temperature)
            && sampling_matches(self.top_p, settings.top_p)
    }

    /// Rebuilds the numbered text the record was parsed from.
    pub fn replay_text(&self) -> String {
        self.lines
            .iter()
            .map(|(n, text)| format!("{}. {}", n, text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl CacheRecord {
    pub fn decode(raw: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(
                    "{}",
                    LyricistError::CacheParse(format!("not JSON, reading as legacy text: {}", e))
                );
                return CacheRecord::Legacy {
                    text: raw.to_string(),
                };
            }
        };

        match &value {
            serde_json::Value::String(text) => CacheRecord::Legacy { text: text.clone() },
            serde_json::Value::Object(map) => {
                let version = map.get("version").and_then(|v| v.as_u64());
                match version {
                    Some(v) if v == u64::from(CACHE_SCHEMA_VERSION) => {
                        match serde_json::from_value::<CurrentRecord>(value.clone()) {
                            Ok(record) => CacheRecord::Current(record),
                            Err(e) => {
                                tracing::warn!(
                                    "{}",
                                    LyricistError::CacheParse(format!(
                                        "version {} record is malformed: {}",
                                        CACHE_SCHEMA_VERSION, e
                                    ))
                                );
                                CacheRecord::Unparseable {
                                    raw: raw.to_string(),
                                }
                            }
                        }
                    }
                    Some(v) if v == u64::from(LEGACY_CACHE_SCHEMA_VERSION) => {
                        let text = ["text", "Lyrics", "lyrics"]
                            .iter()
                            .find_map(|k| map.get(*k).and_then(|t| t.as_str()));
                        match text {
                            Some(t) => CacheRecord::Legacy {
                                text: t.to_string(),
                            },
                            None => CacheRecord::Unparseable {
                                raw: raw.to_string(),
                            },
                        }
                    }
                    _ => CacheRecord::Unparseable {
                        raw: raw.to_string(),
                    },
                }
            }
            _ => CacheRecord::Unparseable {
                raw: raw.to_string(),
            },
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, CacheRecord::Legacy { .. })
    }

    /// Lifts a legacy entry to the current schema using the settings legacy
    /// translations were always made with.
    pub fn into_current(self, now: DateTime<Utc>) -> Option<CurrentRecord> {
        match self {
            CacheRecord::Current(record) => Some(record),
            CacheRecord::Legacy { text } => Some(CurrentRecord {
                model: LEGACY_MODEL.to_string(),
                temperature: Some(LEGACY_TEMPERATURE),
                top_p: None,
                lines: parse_numbered_lines(&text),
                prompt: DEFAULT_PROMPT.to_string(),
                version: CACHE_SCHEMA_VERSION,
                saved_at: now,
            }),
            CacheRecord::Unparseable { .. } => None,
        }
    }
}

/// Recovers `line number -> text` from model output. Lines prefixed with `N.`
/// or `N、` take that number; other non-empty lines continue from the last one.
pub fn parse_numbered_lines(text: &str) -> NumberedLines {
    let mut lines = NumberedLines::new();
    let mut next_number: u32 = 1;

    for line in text.trim().split('\n') {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let numbered = NUMBERED_LINE.captures(trimmed).and_then(|caps| {
            let whole = caps.get(0)?;
            let number = caps.get(1)?.as_str().parse::<u32>().ok()?;
            Some((number, whole.end()))
        });

        match numbered {
            Some((number, end)) => {
                lines.insert(number, trimmed[end..].to_string());
                next_number = number.saturating_add(1);
            }
            None => {
                lines.insert(next_number, trimmed.to_string());
                next_number = next_number.saturating_add(1);
            }
        }
    }

    lines
}

/// --- STORES ---

pub trait CacheStore: Send + Sync {
    fn read_cache<'a>(&'a self, hash: &'a ContentHash) -> BoxFuture<'a, Result<Option<String>>>;
    fn write_cache<'a>(
        &'a self,
        hash: &'a ContentHash,
        record: &'a CurrentRecord,
    ) -> BoxFuture<'a, Result<()>>;
    fn remove_cache<'a>(&'a self, hash: &'a ContentHash) -> BoxFuture<'a, Result<()>>;
    fn ensure_cache_dir(&self) -> BoxFuture<'_, Result<()>>;
}

/// One `<hash>.txt` file per song.
pub struct FsCacheStore {
    dir: PathBuf,
}

impl FsCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, hash: &ContentHash) -> PathBuf {
        self.dir.join(format!("{}.{}", hash.0, CACHE_FILE_EXTENSION))
    }
}

impl Default for FsCacheStore {
    fn default() -> Self {
        Self::new(CACHE_DIR)
    }
}

impl CacheStore for FsCacheStore {
    fn read_cache<'a>(&'a self, hash: &'a ContentHash) -> BoxFuture<'a, Result<Option<String>>> {
        async move {
            match tokio::fs::read_to_string(self.path_for(hash)).await {
                Ok(text) => Ok(Some(text)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(LyricistError::Io(e).into()),
            }
        }
        .boxed()
    }

    fn write_cache<'a>(
        &'a self,
        hash: &'a ContentHash,
        record: &'a CurrentRecord,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            self.ensure_cache_dir().await?;
            tokio::fs::write(self.path_for(hash), record.encode()?).await?;
            Ok(())
        }
        .boxed()
    }

    fn remove_cache<'a>(&'a self, hash: &'a ContentHash) -> BoxFuture<'a, Result<()>> {
        async move {
            match tokio::fs::remove_file(self.path_for(hash)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(LyricistError::Io(e).into()),
            }
        }
        .boxed()
    }

    fn ensure_cache_dir(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            tokio::fs::create_dir_all(&self.dir).await?;
            Ok(())
        }
        .boxed()
    }
}

#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<ContentHash, String>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a raw entry, bypassing the record encoder.
    pub fn insert_raw(&self, hash: impl Into<ContentHash>, raw: impl Into<String>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(hash.into(), raw.into());
        }
    }

    pub fn get_raw(&self, hash: &ContentHash) -> Option<String> {
        match self.entries.lock() {
            Ok(entries) => entries.get(hash).cloned(),
            Err(_) => None,
        }
    }

    fn poisoned() -> crate::types::ObservedError {
        LyricistError::Internal(
            "Cache lock poisoned".to_string(),
            tracing_error::SpanTrace::capture(),
        )
        .into()
    }
}

impl CacheStore for MemoryCacheStore {
    fn read_cache<'a>(&'a self, hash: &'a ContentHash) -> BoxFuture<'a, Result<Option<String>>> {
        async move {
            match self.entries.lock() {
                Ok(entries) => Ok(entries.get(hash).cloned()),
                Err(_) => Err(Self::poisoned()),
            }
        }
        .boxed()
    }

    fn write_cache<'a>(
        &'a self,
        hash: &'a ContentHash,
        record: &'a CurrentRecord,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let body = record.encode()?;
            match self.entries.lock() {
                Ok(mut entries) => {
                    entries.insert(hash.clone(), body);
                    Ok(())
                }
                Err(_) => Err(Self::poisoned()),
            }
        }
        .boxed()
    }

    fn remove_cache<'a>(&'a self, hash: &'a ContentHash) -> BoxFuture<'a, Result<()>> {
        async move {
            match self.entries.lock() {
                Ok(mut entries) => {
                    entries.remove(hash);
                    Ok(())
                }
                Err(_) => Err(Self::poisoned()),
            }
        }
        .boxed()
    }

    fn ensure_cache_dir(&self) -> BoxFuture<'_, Result<()>> {
        async { Ok(()) }.boxed()
    }
}

/// --- RECONCILER ---

#[derive(Debug, Clone, PartialEq)]
pub enum CacheStatus {
    Absent,
    /// Produced with the current settings; replay only.
    Current,
    /// Produced with other settings; replay, then offer regeneration.
    Stale,
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub record: Option<CurrentRecord>,
    pub status: CacheStatus,
    /// The stored entry is in the legacy format and should be rewritten.
    pub needs_upgrade: bool,
}

impl CacheLookup {
    pub fn absent() -> Self {
        Self {
            record: None,
            status: CacheStatus::Absent,
            needs_upgrade: false,
        }
    }

    pub fn config_matches(&self) -> bool {
        self.status == CacheStatus::Current
    }
}

#[derive(Clone)]
pub struct CacheReconciler {
    store: Arc<dyn CacheStore>,
    upgrade_delay: Duration,
}

impl CacheReconciler {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            upgrade_delay: Duration::from_millis(LEGACY_UPGRADE_DELAY_MS),
        }
    }

    pub fn with_upgrade_delay(mut self, delay: Duration) -> Self {
        self.upgrade_delay = delay;
        self
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Loads and classifies the cache entry for `hash`. Storage failures count as absent.
    pub async fn lookup(&self, hash: &ContentHash, settings: &TranslationSettings) -> CacheLookup {
        let raw = match self.store.read_cache(hash).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return CacheLookup::absent(),
            Err(e) => {
                tracing::warn!(
                    "Cache read for {} failed, treating as absent: {}",
                    hash.short(),
                    e.inner
                );
                return CacheLookup::absent();
            }
        };

        let decoded = CacheRecord::decode(&raw);
        let needs_upgrade = decoded.is_legacy();
        let record = match decoded.into_current(Utc::now()) {
            Some(r) => r,
            None => {
                tracing::warn!("Discarding unusable cache entry for {}", hash.short());
                if let Err(e) = self.store.remove_cache(hash).await {
                    tracing::warn!("Could not remove cache entry {}: {}", hash.short(), e.inner);
                }
                return CacheLookup::absent();
            }
        };

        let status = if record.config_matches(settings) {
            CacheStatus::Current
        } else {
            CacheStatus::Stale
        };
        tracing::debug!(
            "Cache {} for {}: {:?} (model {}, legacy {})",
            if needs_upgrade { "upgraded" } else { "hit" },
            hash.short(),
            status,
            record.model,
            needs_upgrade
        );

        CacheLookup {
            record: Some(record),
            status,
            needs_upgrade,
        }
    }

    pub async fn persist(&self, hash: &ContentHash, record: &CurrentRecord) -> Result<()> {
        self.store.write_cache(hash, record).await
    }

    /// Rewrites a legacy entry in the current schema after a short delay.
    /// Failures are logged and otherwise ignored.
    pub fn schedule_upgrade(
        &self,
        hash: ContentHash,
        record: CurrentRecord,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let delay = self.upgrade_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = store.write_cache(&hash, &record).await {
                let err = LyricistError::CacheUpgrade(format!("{}: {}", hash.short(), e.inner));
                tracing::warn!("{}", err);
            } else {
                tracing::info!("Upgraded legacy cache entry {}", hash.short());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(model: &str, temperature: Option<f64>, top_p: Option<f64>) -> TranslationSettings {
        TranslationSettings {
            model: model.to_string(),
            temperature,
            top_p,
            ..TranslationSettings::default()
        }
    }

    fn record(model: &str, temperature: Option<f64>, top_p: Option<f64>) -> CurrentRecord {
        CurrentRecord::from_response(
            "1. a\n2. b",
            model,
            &settings(model, temperature, top_p),
            Utc::now(),
        )
    }

    #[test]
    fn test_parse_numbered_lines_with_numbers_and_gaps() {
        let parsed = parse_numbered_lines("1. one\n\n3、three\nfour\n  10.ten  ");
        let expected: NumberedLines = [
            (1, "one".to_string()),
            (3, "three".to_string()),
            (4, "four".to_string()),
            (10, "ten".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_parse_unnumbered_lines_auto_increment() {
        let parsed = parse_numbered_lines("alpha\nbeta\n");
        assert_eq!(parsed.get(&1).map(String::as_str), Some("alpha"));
        assert_eq!(parsed.get(&2).map(String::as_str), Some("beta"));
        assert!(parse_numbered_lines("  \n ").is_empty());
    }

    #[test]
    fn test_config_match_tolerates_float_jitter() {
        let r = record("gpt-4", Some(0.8), None);
        assert!(r.config_matches(&settings("gpt-4", Some(0.800_000_01), None)));
        assert!(!r.config_matches(&settings("gpt-4", Some(0.95), None)));
    }

    #[test]
    fn test_config_match_requires_same_model_and_prompt() {
        let r = record("gpt-4", Some(0.8), None);
        assert!(!r.config_matches(&settings("gpt-4o", Some(0.8), None)));

        let mut other_prompt = settings("gpt-4", Some(0.8), None);
        other_prompt.prompt = "different {lyrics}".to_string();
        assert!(!r.config_matches(&other_prompt));
    }

    #[test]
    fn test_absent_sampling_values_compare_as_sentinel() {
        let mut r = record("m", None, None);
        assert!(r.config_matches(&settings("m", None, None)));
        assert!(!r.config_matches(&settings("m", None, Some(0.9))));

        r.top_p = Some(SAMPLING_DISABLED_SENTINEL);
        assert!(r.config_matches(&settings("m", None, None)));
    }

    #[test]
    fn test_decode_current_record() {
        let raw = r#"{
            "model": "gpt-4",
            "temperature": 0.8,
            "topP": null,
            "Lyrics": { "2": "b", "1": "a" },
            "prompt": "p {lyrics}",
            "version": 2,
            "savedAt": "2024-05-01T12:00:00.000Z"
        }"#;
        match CacheRecord::decode(raw) {
            CacheRecord::Current(r) => {
                assert_eq!(r.model, "gpt-4");
                assert_eq!(r.top_p, None);
                assert_eq!(r.replay_text(), "1. a\n2. b");
            }
            other => panic!("Expected current record, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_legacy_shapes() {
        assert_eq!(
            CacheRecord::decode("1. a\n2. b"),
            CacheRecord::Legacy {
                text: "1. a\n2. b".to_string()
            }
        );
        assert_eq!(
            CacheRecord::decode(r#""1. a""#),
            CacheRecord::Legacy {
                text: "1. a".to_string()
            }
        );
        assert_eq!(
            CacheRecord::decode(r#"{"version":1,"text":"1. a"}"#),
            CacheRecord::Legacy {
                text: "1. a".to_string()
            }
        );
    }

    #[test]
    fn test_decode_unparseable_shapes() {
        assert!(matches!(
            CacheRecord::decode(r#"{"version":2,"model":"m"}"#),
            CacheRecord::Unparseable { .. }
        ));
        assert!(matches!(
            CacheRecord::decode("[1,2,3]"),
            CacheRecord::Unparseable { .. }
        ));
        assert_eq!(CacheRecord::decode("{}").into_current(Utc::now()), None);
    }

    #[test]
    fn test_legacy_upgrade_uses_legacy_defaults() {
        let upgraded = match CacheRecord::decode("1. a\n2. b").into_current(Utc::now()) {
            Some(r) => r,
            None => panic!("legacy record should upgrade"),
        };
        assert_eq!(upgraded.model, LEGACY_MODEL);
        assert_eq!(upgraded.temperature, Some(LEGACY_TEMPERATURE));
        assert_eq!(upgraded.version, CACHE_SCHEMA_VERSION);
        assert_eq!(upgraded.prompt, DEFAULT_PROMPT);
        assert_eq!(upgraded.lines.len(), 2);
        assert!(upgraded.config_matches(&TranslationSettings::default()));
    }

    #[test]
    fn test_encoded_record_uses_host_field_names() {
        let r = record("gpt-4", Some(0.8), None);
        let encoded = match r.encode() {
            Ok(s) => s,
            Err(e) => panic!("encode failed: {:?}", e),
        };
        let json: serde_json::Value = match serde_json::from_str(&encoded) {
            Ok(v) => v,
            Err(e) => panic!("encoded record is not JSON: {:?}", e),
        };
        assert_eq!(json["Lyrics"]["1"], "a");
        assert_eq!(json["version"], 2);
        assert!(json["topP"].is_null());
        assert!(json["savedAt"].is_string());
    }

    #[tokio::test]
    async fn test_lookup_classifies_entries() {
        let store = Arc::new(MemoryCacheStore::new());
        let reconciler = CacheReconciler::new(store.clone());
        let hash = ContentHash::from("abc");
        let current = settings("gpt-4o", Some(0.8), None);

        assert_eq!(reconciler.lookup(&hash, &current).await.status, CacheStatus::Absent);

        let stale = record("gpt-4", Some(0.8), None);
        if let Err(e) = reconciler.persist(&hash, &stale).await {
            panic!("persist failed: {:?}", e);
        }
        let lookup = reconciler.lookup(&hash, &current).await;
        assert_eq!(lookup.status, CacheStatus::Stale);
        assert!(!lookup.config_matches());
        assert!(!lookup.needs_upgrade);

        let fresh = record("gpt-4o", Some(0.8), None);
        if let Err(e) = reconciler.persist(&hash, &fresh).await {
            panic!("persist failed: {:?}", e);
        }
        assert!(reconciler.lookup(&hash, &current).await.config_matches());
    }

    #[tokio::test]
    async fn test_lookup_discards_unparseable_entry() {
        let store = Arc::new(MemoryCacheStore::new());
        store.insert_raw("bad", r#"{"version":2}"#);
        let reconciler = CacheReconciler::new(store.clone());
        let hash = ContentHash::from("bad");

        let lookup = reconciler.lookup(&hash, &TranslationSettings::default()).await;
        assert_eq!(lookup.status, CacheStatus::Absent);
        assert_eq!(store.get_raw(&hash), None);
    }

    #[tokio::test]
    async fn test_legacy_entry_is_rewritten_after_delay() {
        let store = Arc::new(MemoryCacheStore::new());
        store.insert_raw("old", "1. a\n2. b");
        let reconciler =
            CacheReconciler::new(store.clone()).with_upgrade_delay(Duration::from_millis(1));
        let hash = ContentHash::from("old");

        let lookup = reconciler.lookup(&hash, &TranslationSettings::default()).await;
        assert!(lookup.needs_upgrade);
        let record = match lookup.record {
            Some(r) => r,
            None => panic!("legacy entry should be usable"),
        };

        if let Err(e) = reconciler.schedule_upgrade(hash.clone(), record).await {
            panic!("upgrade task panicked: {:?}", e);
        }
        let raw = store.get_raw(&hash).unwrap_or_default();
        assert!(matches!(CacheRecord::decode(&raw), CacheRecord::Current(_)));
    }
}
