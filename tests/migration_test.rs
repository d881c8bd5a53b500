use lyricist::cache::{CacheReconciler, CacheStatus, CacheStore, CurrentRecord, FsCacheStore};
use lyricist::db::{init_db, run_migrations, SqliteCacheStore};
use lyricist::settings::TranslationSettings;
use lyricist::types::ContentHash;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tempfile::tempdir;

fn record(text: &str, model: &str) -> CurrentRecord {
    CurrentRecord::from_response(text, model, &TranslationSettings::default(), chrono::Utc::now())
}

#[tokio::test]
async fn test_migrations_and_schema() {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let db_path = dir.path().join("test_lyricist.db");

    let pool = match init_db(&db_path).await {
        Ok(p) => p,
        Err(e) => panic!("Failed to init DB: {:?}", e),
    };

    let journal_mode: (String,) = match sqlx::query_as("PRAGMA journal_mode").fetch_one(&pool).await {
        Ok(jm) => jm,
        Err(e) => panic!("Failed to query journal_mode: {:?}", e),
    };
    assert_eq!(journal_mode.0.to_uppercase(), "WAL");

    let tables: Vec<(String,)> =
        match sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table'")
            .fetch_all(&pool)
            .await
        {
            Ok(t) => t,
            Err(e) => panic!("Failed to query tables: {:?}", e),
        };
    let table_names: Vec<String> = tables.into_iter().map(|t| t.0).collect();
    assert!(table_names.contains(&"translation_cache".to_string()));
    assert!(table_names.contains(&"schema_metadata".to_string()));

    // Running the migrations twice is harmless.
    if let Err(e) = run_migrations(&pool).await {
        panic!("Re-running migrations failed: {:?}", e);
    }

    pool.close().await;
}

#[tokio::test]
async fn test_sqlite_store_upserts_and_removes() {
    let pool = match SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
    {
        Ok(p) => p,
        Err(e) => panic!("Failed to open in-memory DB: {:?}", e),
    };
    if let Err(e) = run_migrations(&pool).await {
        panic!("Migrations failed: {:?}", e);
    }
    let store = SqliteCacheStore::new(pool);
    let hash = ContentHash::from("abc");

    match store.read_cache(&hash).await {
        Ok(None) => {}
        other => panic!("Expected no entry, got {:?}", other.map(|o| o.is_some())),
    }

    for model in ["gpt-4", "gpt-4o"] {
        if let Err(e) = store.write_cache(&hash, &record("1. Hi", model)).await {
            panic!("write failed: {:?}", e);
        }
    }
    match store.count().await {
        Ok(n) => assert_eq!(n, 1),
        Err(e) => panic!("count failed: {:?}", e),
    }

    let reconciler = CacheReconciler::new(Arc::new(store.clone()));
    let settings = TranslationSettings {
        model: "gpt-4o".to_string(),
        ..TranslationSettings::default()
    };
    let lookup = reconciler.lookup(&hash, &settings).await;
    assert_eq!(lookup.status, CacheStatus::Current);
    assert!(!lookup.needs_upgrade);

    if let Err(e) = store.remove_cache(&hash).await {
        panic!("remove failed: {:?}", e);
    }
    match store.count().await {
        Ok(n) => assert_eq!(n, 0),
        Err(e) => panic!("count failed: {:?}", e),
    }
}

#[tokio::test]
async fn test_fs_store_layout_and_missing_entries() {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let cache_dir = dir.path().join("gpt-translated-lyrics");
    let store = FsCacheStore::new(&cache_dir);
    let hash = ContentHash::from("deadbeef");

    match store.read_cache(&hash).await {
        Ok(None) => {}
        other => panic!("Expected no entry, got {:?}", other.map(|o| o.is_some())),
    }
    if let Err(e) = store.remove_cache(&hash).await {
        panic!("removing a missing entry should succeed: {:?}", e);
    }

    if let Err(e) = store.write_cache(&hash, &record("1. Hi\n2. Bye", "gpt-4")).await {
        panic!("write failed: {:?}", e);
    }
    let path = cache_dir.join("deadbeef.txt");
    assert_eq!(store.path_for(&hash), path);

    let raw = match std::fs::read_to_string(&path) {
        Ok(r) => r,
        Err(e) => panic!("cache file missing: {:?}", e),
    };
    let json: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => panic!("cache file is not JSON: {:?}", e),
    };
    assert_eq!(json["version"], 2);
    assert_eq!(json["Lyrics"]["2"], "Bye");
    assert_eq!(json["topP"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_corrupt_fs_entry_is_discarded() {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let store = Arc::new(FsCacheStore::new(dir.path()));
    let hash = ContentHash::from("broken");
    if let Err(e) = std::fs::write(store.path_for(&hash), r#"{"version": 7}"#) {
        panic!("seed failed: {:?}", e);
    }

    let reconciler = CacheReconciler::new(store.clone());
    let lookup = reconciler.lookup(&hash, &TranslationSettings::default()).await;
    assert_eq!(lookup.status, CacheStatus::Absent);
    assert!(!store.path_for(&hash).exists());
}
