//! pgmq-backed queue engine via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.set_vt, pgmq.archive, pgmq.delete, pgmq.purge_queue. Job counts
//! come straight from the queue table (`pgmq.q_<channel>`).

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::model::{Delivery, Envelope, JobCounts, JobId, validate_channel_name};
use crate::queue::JobBackend;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// pgmq visibility offsets are whole seconds.
fn whole_seconds(d: Duration) -> i32 {
    let secs = d.as_millis().div_ceil(1000);
    secs.min(i32::MAX as u128) as i32
}

fn record(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        record(queue_name, "create");
        Ok(())
    }

    /// Send a message to a pgmq queue. Returns the message ID.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay_seconds: i32,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue_name)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(self.pool())
            .await?;
        record(queue_name, "send");
        Ok(row.0)
    }

    /// Read the next visible message, hiding it for `vt_seconds`.
    pub async fn read_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
    ) -> Result<Option<(i64, i32, serde_json::Value)>> {
        let row: Option<(i64, i32, serde_json::Value)> =
            sqlx::query_as("SELECT msg_id, read_ct, message FROM pgmq.read($1, $2, 1)")
                .bind(queue_name)
                .bind(vt_seconds)
                .fetch_optional(self.pool())
                .await?;
        record(
            queue_name,
            if row.is_some() { "read" } else { "read_empty" },
        );
        Ok(row)
    }

    /// Push a message's visibility `vt_seconds` into the future.
    pub async fn set_message_vt(&self, queue_name: &str, msg_id: i64, vt_seconds: i32) -> Result<()> {
        sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
            .bind(queue_name)
            .bind(msg_id)
            .bind(vt_seconds)
            .fetch_optional(self.pool())
            .await?;
        record(queue_name, "set_vt");
        Ok(())
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        record(queue_name, "archive");
        Ok(())
    }

    /// Delete a message permanently.
    pub async fn delete_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        record(queue_name, "delete");
        Ok(())
    }

    /// Delete every message in a queue. Returns how many were removed.
    pub async fn purge_queue(&self, queue_name: &str) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.purge_queue($1)")
            .bind(queue_name)
            .fetch_one(self.pool())
            .await?;
        record(queue_name, "purge");
        Ok(row.0.max(0) as u64)
    }

    /// Waiting / delayed / in-flight message counts for a queue.
    ///
    /// A message is waiting once visible, delayed while hidden but never
    /// read, and active while hidden after a read (leased or backing off).
    pub async fn queue_counts(&self, queue_name: &str) -> Result<JobCounts> {
        // The table name cannot be bound; only validated names reach here.
        validate_channel_name(queue_name)?;
        let sql = format!(
            "SELECT
                count(*) FILTER (WHERE vt <= now()),
                count(*) FILTER (WHERE vt > now() AND read_ct = 0),
                count(*) FILTER (WHERE vt > now() AND read_ct > 0)
             FROM pgmq.q_{queue_name}"
        );
        let (waiting, delayed, active): (i64, i64, i64) =
            sqlx::query_as(&sql).fetch_one(self.pool()).await?;
        record(queue_name, "counts");
        Ok(JobCounts {
            waiting: waiting.max(0) as u64,
            delayed: delayed.max(0) as u64,
            active: active.max(0) as u64,
        })
    }
}

#[async_trait]
impl JobBackend for super::Db {
    async fn ping(&self) -> Result<()> {
        self.health_check().await
    }

    async fn ensure(&self, channel: &str) -> Result<()> {
        validate_channel_name(channel)?;
        self.create_queue(channel).await
    }

    async fn push(&self, channel: &str, envelope: &Envelope) -> Result<JobId> {
        let payload = serde_json::to_value(envelope)?;
        let id = self.send_to_queue(channel, &payload, 0).await?;
        Ok(JobId(id))
    }

    async fn pop(&self, channel: &str, lease: Duration) -> Result<Option<Delivery>> {
        let Some((msg_id, read_ct, message)) =
            self.read_from_queue(channel, whole_seconds(lease)).await?
        else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_value(message)?;
        Ok(Some(Delivery {
            id: JobId(msg_id),
            attempt: read_ct.max(1) as u32,
            envelope,
        }))
    }

    async fn ack(&self, channel: &str, id: JobId, remove: bool) -> Result<()> {
        if remove {
            self.delete_message(channel, id.0).await
        } else {
            self.archive_message(channel, id.0).await
        }
    }

    async fn set_visibility(&self, channel: &str, id: JobId, delay: Duration) -> Result<()> {
        self.set_message_vt(channel, id.0, whole_seconds(delay)).await
    }

    async fn counts(&self, channel: &str) -> Result<JobCounts> {
        self.queue_counts(channel).await
    }

    async fn purge(&self, channel: &str) -> Result<u64> {
        self.purge_queue(channel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_round_up_to_whole_seconds() {
        assert_eq!(whole_seconds(Duration::ZERO), 0);
        assert_eq!(whole_seconds(Duration::from_millis(1)), 1);
        assert_eq!(whole_seconds(Duration::from_millis(10_000)), 10);
        assert_eq!(whole_seconds(Duration::from_millis(10_001)), 11);
    }
}
