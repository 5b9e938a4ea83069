//! PostgreSQL repository over the `records` table.

use super::RecordRepository;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

/// Records stored as JSONB rows keyed by `(resource, key)`.
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and bring the schema up to date.
    pub async fn connect(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl RecordRepository for PgRepository {
    async fn list(&self, resource: &str) -> Result<Vec<Value>> {
        let rows = sqlx::query(
            r#"
            SELECT payload
            FROM records
            WHERE resource = $1
            ORDER BY created_at ASC, key ASC
            "#,
        )
        .bind(resource)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<Value, _>("payload").map_err(Into::into))
            .collect()
    }

    async fn upsert(&self, resource: &str, key: &str, record: &Map<String, Value>) -> Result<Value> {
        let now = now_millis();
        let row = sqlx::query(
            r#"
            INSERT INTO records (resource, key, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (resource, key) DO UPDATE SET
                payload = EXCLUDED.payload,
                updated_at = EXCLUDED.updated_at
            RETURNING payload
            "#,
        )
        .bind(resource)
        .bind(key)
        .bind(Value::Object(record.clone()))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("payload")?)
    }

    async fn merge(
        &self,
        resource: &str,
        key: &str,
        patch: &Map<String, Value>,
    ) -> Result<Option<Value>> {
        // `||` on JSONB objects is a shallow merge, right side wins.
        let row = sqlx::query(
            r#"
            UPDATE records
            SET payload = payload || $3, updated_at = $4
            WHERE resource = $1 AND key = $2
            RETURNING payload
            "#,
        )
        .bind(resource)
        .bind(key)
        .bind(Value::Object(patch.clone()))
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_get("payload"))
            .transpose()
            .map_err(Into::into)
    }

    async fn delete(&self, resource: &str, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE resource = $1 AND key = $2")
            .bind(resource)
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
