use crate::constants::*;
use crate::types::{LyricistError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Key/value settings as the host exposes them. Values are always strings.
pub trait SettingsStore: Send + Sync {
    fn get_setting(&self, key: &str, default: &str) -> String;
    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: RwLock::new(
                values
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl SettingsStore for MemorySettings {
    fn get_setting(&self, key: &str, default: &str) -> String {
        match self.values.read() {
            Ok(values) => match values.get(key) {
                Some(v) => v.clone(),
                None => default.to_string(),
            },
            Err(_) => {
                tracing::warn!("Settings lock poisoned, using default for {}", key);
                default.to_string()
            }
        }
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        match self.values.write() {
            Ok(mut values) => {
                values.insert(key.to_string(), value.to_string());
                Ok(())
            }
            Err(_) => Err(LyricistError::Internal(
                "Settings lock poisoned".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into()),
        }
    }
}

/// Settings persisted as a flat JSON object of strings.
pub struct FileSettings {
    path: PathBuf,
    inner: MemorySettings,
}

impl FileSettings {
    /// Missing or unreadable files start out empty; every key then falls back to its default.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let values: HashMap<String, String> = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("Ignoring malformed settings file {:?}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!("Could not read settings file {:?}: {}", path, e);
                HashMap::new()
            }
        };
        Self {
            path,
            inner: MemorySettings::with_values(values),
        }
    }

    fn persist(&self) -> Result<()> {
        let snapshot = match self.inner.values.read() {
            Ok(values) => values.clone(),
            Err(_) => {
                return Err(LyricistError::Internal(
                    "Settings lock poisoned".to_string(),
                    tracing_error::SpanTrace::capture(),
                )
                .into())
            }
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

impl SettingsStore for FileSettings {
    fn get_setting(&self, key: &str, default: &str) -> String {
        self.inner.get_setting(key, default)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set_setting(key, value)?;
        self.persist()
    }
}

/// Parses a sampling parameter; blank, non-numeric and out-of-range values are absent.
pub fn parse_sampling(raw: &str, range: (f64, f64)) -> Option<f64> {
    let value: f64 = raw.trim().parse().ok()?;
    if value.is_finite() && value >= range.0 && value <= range.1 {
        Some(value)
    } else {
        None
    }
}

/// Snapshot of everything a translation depends on.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationSettings {
    pub api_endpoint: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub prompt: String,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            temperature: parse_sampling(DEFAULT_TEMPERATURE, TEMPERATURE_RANGE),
            top_p: None,
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }
}

impl TranslationSettings {
    pub fn load(store: &dyn SettingsStore) -> Self {
        let model = store.get_setting(SETTING_MODEL, DEFAULT_MODEL);
        let model = if model.trim().is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            model
        };
        Self {
            api_endpoint: store.get_setting(SETTING_API_ENDPOINT, DEFAULT_API_ENDPOINT),
            api_key: store.get_setting(SETTING_API_KEY, ""),
            model,
            temperature: parse_sampling(
                &store.get_setting(SETTING_TEMPERATURE, DEFAULT_TEMPERATURE),
                TEMPERATURE_RANGE,
            ),
            top_p: parse_sampling(&store.get_setting(SETTING_TOP_P, DEFAULT_TOP_P), TOP_P_RANGE),
            prompt: store.get_setting(SETTING_PROMPT, DEFAULT_PROMPT),
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}
