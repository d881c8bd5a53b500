use crate::cache::{CacheStore, CurrentRecord};
use crate::constants::DB_PRAGMAS;
use crate::types::{ContentHash, LyricistError, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(LyricistError::Internal(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = match SqlitePool::connect(&url).await {
        Ok(p) => p,
        Err(e) => return Err(LyricistError::Database(e).into()),
    };

    configure_db(&pool).await?;
    run_migrations(&pool).await?;
    verify_schema_version(&pool).await;

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(LyricistError::Database(e).into());
        }
    }
    Ok(())
}

pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    if let Err(e) = sqlx::migrate!("./migrations").run(pool).await {
        return Err(LyricistError::Internal(
            format!("Migration failed: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Cache database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

/// Translation cache kept in a sqlite table, one row per content hash.
#[derive(Clone)]
pub struct SqliteCacheStore {
    pool: DbPool,
}

impl SqliteCacheStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(init_db(path).await?))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM translation_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get(0))
    }
}

impl CacheStore for SqliteCacheStore {
    fn read_cache<'a>(&'a self, hash: &'a ContentHash) -> BoxFuture<'a, Result<Option<String>>> {
        async move {
            let row = sqlx::query("SELECT body FROM translation_cache WHERE hash = ?")
                .bind(&hash.0)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(|r| r.get::<String, _>(0)))
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
            sqlx::query(
                "INSERT INTO translation_cache (hash, body, saved_at) VALUES (?, ?, ?) \
                 ON CONFLICT(hash) DO UPDATE SET body = excluded.body, saved_at = excluded.saved_at",
            )
            .bind(&hash.0)
            .bind(body)
            .bind(record.saved_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        }
        .boxed()
    }

    fn remove_cache<'a>(&'a self, hash: &'a ContentHash) -> BoxFuture<'a, Result<()>> {
        async move {
            sqlx::query("DELETE FROM translation_cache WHERE hash = ?")
                .bind(&hash.0)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
        .boxed()
    }

    fn ensure_cache_dir(&self) -> BoxFuture<'_, Result<()>> {
        async move { run_migrations(&self.pool).await }.boxed()
    }
}
