//! Message handler request queue
//!
//! Generic lease-and-delete queue partitioned by handler name. Producers
//! write requests for a named handler; the handler's dispatch loop leases
//! them and the handler deletes what it consumed.

use crate::{
    error::{Error, Result},
    store::{from_micros, lease_deadline, opt_from_micros, to_micros, Store},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};
use std::time::Duration;
use uuid::Uuid;

/// Tracing target for handler queue and dispatch.
pub const TRACING_TARGET_HANDLER: &str = "flowkeeper::handler";

const HANDLER_COLUMNS: &str = "handler_name, request_id, payload, timestamp, leased_until, leased_by";

/// Work item for one named handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHandlerRequest {
    pub handler_name: String,
    pub request_id: Uuid,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub leased_until: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
}

impl MessageHandlerRequest {
    /// A request for `handler_name`, ready to be written
    pub fn new(handler_name: impl Into<String>, payload: Value) -> Self {
        Self {
            handler_name: handler_name.into(),
            request_id: Uuid::new_v4(),
            payload,
            timestamp: Utc::now(),
            leased_until: None,
            leased_by: None,
        }
    }
}

impl Store {
    /// Queue requests; an existing `(handler_name, request_id)` is left as is
    pub async fn write_message_handler_requests(&self, requests: &[MessageHandlerRequest]) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }

        let mut tx = self.begin_immediate().await?;
        for request in requests {
            sqlx::query(
                "INSERT OR IGNORE INTO message_handler_requests (handler_name, request_id, payload, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(&request.handler_name)
            .bind(request.request_id.to_string())
            .bind(serde_json::to_string(&request.payload)?)
            .bind(to_micros(request.timestamp))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        // Several handler loops share one signal; wake them all
        self.signals().handler_requests.notify_waiters();

        tracing::debug!(
            target: TRACING_TARGET_HANDLER,
            count = requests.len(),
            "Wrote message handler requests"
        );
        Ok(())
    }

    /// Claim up to `limit` unleased or expired requests for one handler
    pub async fn lease_message_handler_requests(
        &self,
        handler_name: &str,
        lease_time: Duration,
        limit: usize,
    ) -> Result<Vec<MessageHandlerRequest>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let rows = sqlx::query(&format!(
            r#"
            UPDATE message_handler_requests
            SET leased_until = ?, leased_by = ?
            WHERE rowid IN (
                SELECT rowid FROM message_handler_requests
                WHERE handler_name = ? AND (leased_until IS NULL OR leased_until < ?)
                ORDER BY timestamp
                LIMIT ?
            )
            RETURNING {HANDLER_COLUMNS}
            "#
        ))
        .bind(to_micros(lease_deadline(now, lease_time)))
        .bind(self.owner())
        .bind(handler_name)
        .bind(to_micros(now))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.pool())
        .await?;

        let mut requests = rows.iter().map(request_from_row).collect::<Result<Vec<_>>>()?;
        requests.sort_by_key(|r| r.timestamp);
        Ok(requests)
    }

    /// Delete consumed requests. Returns how many existed.
    pub async fn delete_message_handler_requests(&self, requests: &[MessageHandlerRequest]) -> Result<usize> {
        let mut tx = self.begin_immediate().await?;
        let mut deleted = 0;
        for request in requests {
            deleted += sqlx::query(
                "DELETE FROM message_handler_requests WHERE handler_name = ? AND request_id = ?",
            )
            .bind(&request.handler_name)
            .bind(request.request_id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(deleted)
    }

    /// Everything queued for a handler, leased or not
    pub async fn read_message_handler_requests(&self, handler_name: &str) -> Result<Vec<MessageHandlerRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {HANDLER_COLUMNS} FROM message_handler_requests WHERE handler_name = ? ORDER BY timestamp"
        ))
        .bind(handler_name)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(request_from_row).collect()
    }
}

fn request_from_row(row: &SqliteRow) -> Result<MessageHandlerRequest> {
    let request_id: String = row.try_get("request_id")?;
    let payload: String = row.try_get("payload")?;

    Ok(MessageHandlerRequest {
        handler_name: row.try_get("handler_name")?,
        request_id: Uuid::parse_str(&request_id)
            .map_err(|e| Error::corrupt(format!("handler request id '{request_id}': {e}")))?,
        payload: serde_json::from_str(&payload)?,
        timestamp: from_micros(row.try_get("timestamp")?)?,
        leased_until: opt_from_micros(row.try_get("leased_until")?)?,
        leased_by: row.try_get("leased_by")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_lease_is_partitioned_by_handler() {
        let store = Store::in_memory("worker-a").await.unwrap();
        store
            .write_message_handler_requests(&[
                MessageHandlerRequest::new("ClientCrash", json!({"client": 1})),
                MessageHandlerRequest::new("ClientCrash", json!({"client": 2})),
                MessageHandlerRequest::new("Enroll", json!({"client": 3})),
            ])
            .await
            .unwrap();

        let leased = store
            .lease_message_handler_requests("ClientCrash", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(leased.len(), 2);
        assert!(leased.iter().all(|r| r.handler_name == "ClientCrash"));
        assert!(leased.iter().all(|r| r.leased_by.as_deref() == Some("worker-a")));

        // Already leased
        assert!(store
            .lease_message_handler_requests("ClientCrash", Duration::from_secs(60), 10)
            .await
            .unwrap()
            .is_empty());

        assert_eq!(store.delete_message_handler_requests(&leased).await.unwrap(), 2);
        assert!(store.read_message_handler_requests("ClientCrash").await.unwrap().is_empty());
        assert_eq!(store.read_message_handler_requests("Enroll").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_handler_lease_is_reclaimable() {
        let store = Store::in_memory("worker-a").await.unwrap();
        let request = MessageHandlerRequest::new("Enroll", json!({}));
        store
            .write_message_handler_requests(&[request.clone(), request.clone()])
            .await
            .unwrap();

        let first = store
            .lease_message_handler_requests("Enroll", Duration::from_millis(20), 10)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].request_id, request.request_id);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = store
            .lease_message_handler_requests("Enroll", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
    }
}
