use crate::client::OpenAiClient;
use crate::constants::MODEL_REFRESH_DEBOUNCE_MS;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub trait ModelSource: Send + Sync {
    fn list_models<'a>(&'a self, endpoint: &'a str, api_key: &'a str) -> BoxFuture<'a, Vec<String>>;
}

impl ModelSource for OpenAiClient {
    fn list_models<'a>(&'a self, endpoint: &'a str, api_key: &'a str) -> BoxFuture<'a, Vec<String>> {
        OpenAiClient::list_models(self, endpoint, api_key).boxed()
    }
}

/// Identifies an endpoint/key pair without keeping the key itself around.
pub fn endpoint_key(endpoint: &str, api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(endpoint.trim().as_bytes());
    hasher.update([0u8]);
    hasher.update(api_key.trim().as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(12).map(|b| format!("{:02x}", b)).collect()
}

#[derive(Default)]
struct CatalogState {
    key: Option<String>,
    models: Vec<String>,
}

/// Model names offered by the configured endpoint, refreshed while settings are edited.
pub struct ModelCatalog {
    source: Arc<dyn ModelSource>,
    debounce: Duration,
    generation: AtomicU64,
    state: Mutex<CatalogState>,
}

impl ModelCatalog {
    pub fn new(source: Arc<dyn ModelSource>) -> Self {
        Self {
            source,
            debounce: Duration::from_millis(MODEL_REFRESH_DEBOUNCE_MS),
            generation: AtomicU64::new(0),
            state: Mutex::new(CatalogState::default()),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn models(&self) -> Vec<String> {
        match self.state.lock() {
            Ok(s) => s.models.clone(),
            Err(poisoned) => poisoned.into_inner().models.clone(),
        }
    }

    fn cached_for(&self, key: &str) -> Option<Vec<String>> {
        let state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &state.key {
            Some(k) if k == key => Some(state.models.clone()),
            _ => None,
        }
    }

    fn store(&self, key: String, models: Vec<String>) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.key = Some(key);
        state.models = models;
    }

    /// Waits out the debounce window and refreshes the list. Returns `None` when a
    /// later call superseded this one or the endpoint or key is blank.
    pub async fn refresh_debounced(&self, endpoint: &str, api_key: &str) -> Option<Vec<String>> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.debounce).await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return None;
        }

        if endpoint.trim().is_empty() || api_key.trim().is_empty() {
            return None;
        }
        let key = endpoint_key(endpoint, api_key);
        if let Some(models) = self.cached_for(&key) {
            return Some(models);
        }

        let models = self.source.list_models(endpoint, api_key).await;
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("Discarding model list for superseded settings");
            return None;
        }
        tracing::info!("Endpoint offers {} models", models.len());
        // An empty answer is not remembered so the next edit retries.
        if !models.is_empty() {
            self.store(key, models.clone());
        }
        Some(models)
    }
}
