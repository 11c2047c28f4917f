//! Registry hash on Postgres: one `registry_fields` row per (namespace, field).

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;
use crate::registry::HashStore;

#[async_trait]
impl HashStore for super::Db {
    async fn hgetall(&self, namespace: &str) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT field, value FROM registry_fields WHERE namespace = $1")
                .bind(namespace)
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn hget(&self, namespace: &str, field: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM registry_fields WHERE namespace = $1 AND field = $2",
        )
        .bind(namespace)
        .bind(field)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn hset(&self, namespace: &str, field: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO registry_fields (namespace, field, value)
             VALUES ($1, $2, $3)
             ON CONFLICT (namespace, field)
             DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(namespace)
        .bind(field)
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn hdel(&self, namespace: &str, fields: &[String]) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "DELETE FROM registry_fields
             WHERE namespace = $1 AND field = ANY($2)
             RETURNING field",
        )
        .bind(namespace)
        .bind(fields)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(field,)| field).collect())
    }

    async fn hincrby(&self, namespace: &str, field: &str, by: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO registry_fields (namespace, field, value)
             VALUES ($1, $2, $3::bigint::text)
             ON CONFLICT (namespace, field)
             DO UPDATE SET value = (registry_fields.value::bigint + $3::bigint)::text,
                           updated_at = now()
             RETURNING value::bigint",
        )
        .bind(namespace)
        .bind(field)
        .bind(by)
        .fetch_one(self.pool())
        .await?;
        Ok(row.0)
    }

    async fn hmget(&self, namespace: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        // One statement, one snapshot.
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT field, value FROM registry_fields
             WHERE namespace = $1 AND field = ANY($2)",
        )
        .bind(namespace)
        .bind(fields)
        .fetch_all(self.pool())
        .await?;
        let mut found: HashMap<String, String> = rows.into_iter().collect();
        Ok(fields.iter().map(|field| found.remove(field)).collect())
    }
}
