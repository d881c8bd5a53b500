/// Settings keys
pub const SETTING_API_ENDPOINT: &str = "api-endpoint";
pub const SETTING_API_KEY: &str = "api-key";
pub const SETTING_MODEL: &str = "model";
pub const SETTING_TEMPERATURE: &str = "temperature";
pub const SETTING_TOP_P: &str = "top-p";
pub const SETTING_PROMPT: &str = "prompt";

/// Settings defaults
pub const DEFAULT_API_ENDPOINT: &str = "https://api.openai.com/v1/";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_TEMPERATURE: &str = "0.8";
pub const DEFAULT_TOP_P: &str = "";

/// Placeholder replaced by the numbered lyric lines.
pub const LYRICS_PLACEHOLDER: &str = "{lyrics}";

pub const DEFAULT_PROMPT: &str = "Translate the following song lyrics into Simplified Chinese. \
Keep the line numbering exactly as given, output one translated line per numbered line, \
in the form \"<number>. <translation>\", and output nothing else.\n\n{lyrics}";

/// Sampling parameter ranges accepted by the completion API.
pub const TEMPERATURE_RANGE: (f64, f64) = (0.0, 2.0);
pub const TOP_P_RANGE: (f64, f64) = (0.0, 1.0);

/// Cache defaults
pub const CACHE_DIR: &str = "gpt-translated-lyrics";
pub const CACHE_FILE_EXTENSION: &str = "txt";
pub const CACHE_SCHEMA_VERSION: u32 = 2;
pub const LEGACY_CACHE_SCHEMA_VERSION: u32 = 1;
pub const CONFIG_MATCH_TOLERANCE: f64 = 0.01;
/// Stands in for an absent or disabled sampling parameter when comparing configs.
pub const SAMPLING_DISABLED_SENTINEL: f64 = -1.0;

/// Values assumed for legacy cache entries written before configs were recorded.
pub const LEGACY_MODEL: &str = "gpt-3.5-turbo";
pub const LEGACY_TEMPERATURE: f64 = 0.8;

/// Timers
pub const LEGACY_UPGRADE_DELAY_MS: u64 = 250;
pub const MODEL_REFRESH_DEBOUNCE_MS: u64 = 500;

/// Completion API paths, relative to the configured endpoint.
pub const CHAT_COMPLETIONS_PATH: &str = "chat/completions";
pub const MODELS_PATH: &str = "models";
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";
pub const SSE_DONE_SENTINEL: &str = "[DONE]";
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

/// User-facing messages
pub const INVALID_KEY_MESSAGE: &str = "Invalid API key";
pub const INVALID_ENDPOINT_URL_MESSAGE: &str =
    "API endpoint is not a valid URL, please check it in the settings";
pub const ENDPOINT_UNAVAILABLE_MESSAGE: &str =
    "Invalid API endpoint, please check that it is set correctly and still in service";
pub const QUOTA_EXCEEDED_MESSAGE: &str =
    "API quota reached, please check your quota or switch to another API key";

/// Event bus capacity
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Database defaults
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];
