use crate::cache::{CacheStore, FsCacheStore};
use crate::constants::{CACHE_DIR, SETTING_API_KEY};
use crate::db::SqliteCacheStore;
use crate::settings::{FileSettings, MemorySettings, SettingsStore};
use crate::types::*;
use clap::{Parser, ValueEnum};
use colored::*;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const API_KEY_ENV: &str = "LYRICIST_API_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheBackend {
    /// One `<hash>.txt` file per lyric set.
    Fs,
    Sqlite,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Streams machine translations onto song lyrics", long_about = None)]
pub struct Args {
    /// Lyrics file, one line per lyric line.
    pub lyrics: Option<PathBuf>,
    #[arg(long, default_value = "lyricist-settings.json")]
    pub settings: PathBuf,
    /// Override a setting for this run and persist it, as `key=value`.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,
    #[arg(long, value_enum, default_value_t = CacheBackend::Fs)]
    pub cache: CacheBackend,
    #[arg(long, default_value = CACHE_DIR)]
    pub cache_dir: PathBuf,
    #[arg(long, default_value = "lyricist.db")]
    pub database: PathBuf,
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
    #[arg(long)]
    pub song_id: Option<String>,
    #[arg(long)]
    pub song_name: Option<String>,
    /// Start a live translation when the cache is absent or stale.
    #[arg(long, default_value_t = false)]
    pub generate: bool,
    #[arg(long, default_value_t = false)]
    pub list_models: bool,
    #[arg(long, default_value_t = false)]
    pub test_connection: bool,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
}

/// File-backed settings with per-run values layered on top. Writes go to the file.
pub struct LayeredSettings {
    overrides: MemorySettings,
    base: FileSettings,
}

impl LayeredSettings {
    pub fn new(base: FileSettings) -> Self {
        Self {
            overrides: MemorySettings::new(),
            base,
        }
    }

    /// Shadows `key` for this process only.
    pub fn override_value(&self, key: &str, value: &str) -> Result<()> {
        self.overrides.set_setting(key, value)
    }
}

impl SettingsStore for LayeredSettings {
    fn get_setting(&self, key: &str, default: &str) -> String {
        let from_file = self.base.get_setting(key, default);
        self.overrides.get_setting(key, &from_file)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.base.set_setting(key, value)
    }
}

pub fn parse_assignment(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(LyricistError::Internal(
            format!("expected KEY=VALUE, got {:?}", raw),
            tracing_error::SpanTrace::capture(),
        )
        .into()),
    }
}

/// Loads settings, applies `--set` values and takes the API key from the environment
/// when none is configured.
pub fn load_settings(args: &Args) -> Result<Arc<LayeredSettings>> {
    let settings = LayeredSettings::new(FileSettings::load(&args.settings));
    for raw in &args.set {
        let (key, value) = parse_assignment(raw)?;
        settings.set_setting(&key, &value)?;
    }
    if settings.get_setting(SETTING_API_KEY, "").trim().is_empty() {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                settings.override_value(SETTING_API_KEY, &key)?;
            }
        }
    }
    Ok(Arc::new(settings))
}

pub fn read_lyrics(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text.lines().map(|l| l.to_string()).collect())
}

/// Hex sha256 over the lines joined by newlines.
pub fn content_hash<S: AsRef<str>>(lines: &[S]) -> ContentHash {
    let mut hasher = Sha256::new();
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\n");
        }
        hasher.update(line.as_ref().as_bytes());
    }
    let digest = hasher.finalize();
    ContentHash(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

pub async fn open_cache_store(args: &Args) -> Result<Arc<dyn CacheStore>> {
    match args.cache {
        CacheBackend::Fs => Ok(Arc::new(FsCacheStore::new(&args.cache_dir))),
        CacheBackend::Sqlite => Ok(Arc::new(SqliteCacheStore::open(&args.database).await?)),
    }
}

pub fn render_lyrics(set: &LyricSet) -> String {
    let mut out = String::new();
    for line in &set.lyrics {
        out.push_str(&line.original_text);
        out.push('\n');
        if let Some(t) = &line.translated_text {
            if !t.is_empty() {
                out.push_str(&format!("{}\n", t.as_str().cyan()));
            }
        }
    }
    if let Some(contributor) = &set.contributors.translation {
        out.push_str(&format!("{}\n", format!("translated by {}", contributor.name).dimmed()));
    }
    out
}
