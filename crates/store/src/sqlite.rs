//! SQLite-backed tenant/api-key store.
//!
//! Schema and `init()`-for-tests pattern follow the teacher's channel store;
//! the domain here is api keys rather than channel configs.

use anyhow::Result;
use async_trait::async_trait;
use mycelium_auth::{ApiKeyRecord, ApiKeyStore};
use sqlx::SqlitePool;

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: String,
    secret: String,
    capabilities: String,
    app_id: String,
}

impl From<ApiKeyRow> for ApiKeyRecord {
    fn from(r: ApiKeyRow) -> Self {
        Self {
            id: r.id,
            secret: r.secret,
            capabilities: r.capabilities,
            app_id: r.app_id,
        }
    }
}

/// SQLite-backed implementation of [`ApiKeyStore`].
pub struct SqliteApiKeyStore {
    pool: SqlitePool,
}

impl SqliteApiKeyStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the api_keys table schema.
    ///
    /// **Deprecated**: schema is now managed by sqlx migrations. Retained for
    /// tests that use in-memory databases.
    #[doc(hidden)]
    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS api_keys (
                id           TEXT PRIMARY KEY,
                secret       TEXT NOT NULL,
                capabilities TEXT NOT NULL,
                app_id       TEXT NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Insert or replace an api key. Used by the seed CLI subcommand.
    pub async fn upsert(&self, record: &ApiKeyRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO api_keys (id, secret, capabilities, app_id)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 secret = excluded.secret,
                 capabilities = excluded.capabilities,
                 app_id = excluded.app_id"#,
        )
        .bind(&record.id)
        .bind(&record.secret)
        .bind(&record.capabilities)
        .bind(&record.app_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ApiKeyStore for SqliteApiKeyStore {
    async fn get(&self, id: &str) -> Result<Option<ApiKeyRecord>> {
        let row = sqlx::query_as::<_, ApiKeyRow>("SELECT * FROM api_keys WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }
}
