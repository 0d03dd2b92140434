//! Flow processing request queue
//!
//! A durable "this flow has work" notification per ready-transition of a
//! flow's cursor request. Identity is `(client_id, flow_id, timestamp)` so an
//! ack never removes a newer notification for the same flow.

use crate::{
    client::ClientId,
    error::Result,
    flow::types::{FlowId, FlowProcessingRequest},
    store::{from_micros, lease_deadline, opt_from_micros, to_micros, Store},
};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use std::time::Duration;

/// Tracing target for processing queue operations.
pub const TRACING_TARGET_QUEUE: &str = "flowkeeper::queue";

const QUEUE_COLUMNS: &str = "client_id, flow_id, timestamp, delivery_time, leased_until, leased_by";

impl Store {
    /// Queue a wakeup for a flow, optionally invisible until `delivery_time`
    pub async fn enqueue_flow_processing_request(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        delivery_time: Option<DateTime<Utc>>,
    ) -> Result<FlowProcessingRequest> {
        let mut tx = self.begin_immediate().await?;
        let request = enqueue_in(&mut *tx, client_id, flow_id, delivery_time).await?;
        tx.commit().await?;

        self.signals().flow_processing.notify_one();
        Ok(request)
    }

    /// Claim up to `limit` deliverable notifications whose lease is absent
    /// or expired
    pub async fn lease_flow_processing_requests(
        &self,
        lease_time: Duration,
        limit: usize,
    ) -> Result<Vec<FlowProcessingRequest>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = to_micros(Utc::now());
        let rows = sqlx::query(&format!(
            r#"
            UPDATE flow_processing_requests
            SET leased_until = ?, leased_by = ?
            WHERE rowid IN (
                SELECT rowid FROM flow_processing_requests
                WHERE (delivery_time IS NULL OR delivery_time <= ?)
                  AND (leased_until IS NULL OR leased_until < ?)
                ORDER BY timestamp
                LIMIT ?
            )
            RETURNING {QUEUE_COLUMNS}
            "#
        ))
        .bind(to_micros(lease_deadline(Utc::now(), lease_time)))
        .bind(self.owner())
        .bind(now)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.pool())
        .await?;

        let mut requests = rows.iter().map(request_from_row).collect::<Result<Vec<_>>>()?;
        requests.sort_by_key(|r| r.timestamp);

        if !requests.is_empty() {
            tracing::debug!(
                target: TRACING_TARGET_QUEUE,
                count = requests.len(),
                owner = %self.owner(),
                "Leased flow processing requests"
            );
        }
        Ok(requests)
    }

    /// Delete exactly the given notifications. Returns how many existed.
    pub async fn ack_flow_processing_requests(&self, requests: &[FlowProcessingRequest]) -> Result<usize> {
        let mut tx = self.begin_immediate().await?;
        let mut deleted = 0;
        for request in requests {
            deleted += sqlx::query(
                "DELETE FROM flow_processing_requests WHERE client_id = ? AND flow_id = ? AND timestamp = ?",
            )
            .bind(request.client_id.as_str())
            .bind(request.flow_id.as_str())
            .bind(to_micros(request.timestamp))
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(deleted)
    }

    /// Administrative clear of the whole queue
    pub async fn delete_all_flow_processing_requests(&self) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM flow_processing_requests")
            .execute(self.pool())
            .await?
            .rows_affected();

        tracing::warn!(
            target: TRACING_TARGET_QUEUE,
            deleted,
            "Cleared flow processing queue"
        );
        Ok(deleted)
    }

    /// Every queued notification in arrival order, leased or not.
    ///
    /// Meant for inspection; dispatch goes through
    /// [`Store::lease_flow_processing_requests`].
    pub async fn list_flow_processing_requests(&self) -> Result<Vec<FlowProcessingRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM flow_processing_requests ORDER BY timestamp"
        ))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(request_from_row).collect()
    }
}

/// Insert a notification inside an open transaction.
///
/// Timestamps are unique per flow: a second enqueue within the same
/// microsecond is pushed one microsecond past the latest one.
pub(crate) async fn enqueue_in(
    conn: &mut SqliteConnection,
    client_id: &ClientId,
    flow_id: &FlowId,
    delivery_time: Option<DateTime<Utc>>,
) -> Result<FlowProcessingRequest> {
    let latest: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(timestamp) FROM flow_processing_requests WHERE client_id = ? AND flow_id = ?",
    )
    .bind(client_id.as_str())
    .bind(flow_id.as_str())
    .fetch_one(&mut *conn)
    .await?;

    let now = to_micros(Utc::now());
    let timestamp = match latest {
        Some(latest) if latest >= now => latest + 1,
        _ => now,
    };

    sqlx::query(
        "INSERT INTO flow_processing_requests (client_id, flow_id, timestamp, delivery_time) VALUES (?, ?, ?, ?)",
    )
    .bind(client_id.as_str())
    .bind(flow_id.as_str())
    .bind(timestamp)
    .bind(delivery_time.map(to_micros))
    .execute(&mut *conn)
    .await?;

    tracing::debug!(
        target: TRACING_TARGET_QUEUE,
        client_id = %client_id,
        flow_id = %flow_id,
        delivery_time = ?delivery_time,
        "📨 Enqueued flow processing request"
    );

    Ok(FlowProcessingRequest {
        client_id: client_id.clone(),
        flow_id: flow_id.clone(),
        timestamp: from_micros(timestamp)?,
        delivery_time,
        leased_until: None,
        leased_by: None,
    })
}

fn request_from_row(row: &SqliteRow) -> Result<FlowProcessingRequest> {
    let client_id: String = row.try_get("client_id")?;
    let flow_id: String = row.try_get("flow_id")?;

    Ok(FlowProcessingRequest {
        client_id: client_id.parse()?,
        flow_id: flow_id.parse()?,
        timestamp: from_micros(row.try_get("timestamp")?)?,
        delivery_time: opt_from_micros(row.try_get("delivery_time")?)?,
        leased_until: opt_from_micros(row.try_get("leased_until")?)?,
        leased_by: row.try_get("leased_by")?,
    })
}
