//! Client mailbox: durable per-client task queue
//!
//! Messages are leased by the transport layer, deleted on ack, and dropped
//! for good once they have been leased more times than the store's TTL
//! ceiling. A crashed leaser's claim simply expires, so delivery is
//! at-least-once and consumers must be idempotent.

use crate::{
    client::types::{Client, ClientId, ClientMessage, MessageRef},
    error::{Error, Result},
    flow::FlowId,
    store::{db_id, from_db_id, from_micros, lease_deadline, opt_from_micros, to_micros, Store},
};
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use std::time::Duration;

/// Tracing target for mailbox operations.
pub const TRACING_TARGET_MAILBOX: &str = "flowkeeper::mailbox";

const MESSAGE_COLUMNS: &str =
    "client_id, task_id, flow_id, request_id, payload, created_at, leased_until, leased_by, leased_count";

impl Store {
    /// Register a client; re-registering is a no-op
    pub async fn write_client(&self, client_id: &ClientId) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO clients (client_id, first_seen) VALUES (?, ?)")
            .bind(client_id.as_str())
            .bind(to_micros(Utc::now()))
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Load a registered client.
    ///
    /// Fails with [`Error::UnknownClient`] if the client was never written.
    pub async fn read_client(&self, client_id: &ClientId) -> Result<Client> {
        let row = sqlx::query("SELECT first_seen FROM clients WHERE client_id = ?")
            .bind(client_id.as_str())
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::unknown_client(client_id))?;

        Ok(Client {
            client_id: client_id.clone(),
            first_seen: from_micros(row.try_get("first_seen")?)?,
        })
    }

    /// Queue messages for delivery, keyed by (client, task_id).
    ///
    /// Re-writing an existing message refreshes its payload and request link
    /// but keeps its lease state.
    pub async fn write_messages(&self, messages: &[ClientMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut tx = self.begin_immediate().await?;
        for message in messages {
            write_message(&mut *tx, message).await?;
        }
        tx.commit().await?;

        tracing::debug!(
            target: TRACING_TARGET_MAILBOX,
            count = messages.len(),
            "📬 Wrote client messages"
        );
        Ok(())
    }

    /// Claim up to `limit` unleased or expired messages for `client_id`.
    ///
    /// Every claim bumps the message's lease counter. Messages whose counter
    /// has already reached the TTL ceiling are deleted instead of returned.
    pub async fn lease_messages(
        &self,
        client_id: &ClientId,
        lease_time: Duration,
        limit: usize,
    ) -> Result<Vec<ClientMessage>> {
        let now = Utc::now();
        let mut tx = self.begin_immediate().await?;

        let dropped = sqlx::query(
            r#"
            DELETE FROM client_messages
            WHERE client_id = ?
              AND (leased_until IS NULL OR leased_until < ?)
              AND leased_count >= ?
            RETURNING task_id
            "#,
        )
        .bind(client_id.as_str())
        .bind(to_micros(now))
        .bind(i64::from(self.client_message_ttl()))
        .fetch_all(&mut *tx)
        .await?;

        for row in &dropped {
            let task_id: i64 = row.try_get("task_id")?;
            tracing::warn!(
                target: TRACING_TARGET_MAILBOX,
                client_id = %client_id,
                task_id,
                ttl = self.client_message_ttl(),
                "🗑️ Dropping client message after exceeding lease TTL"
            );
        }

        let rows = sqlx::query(&format!(
            r#"
            UPDATE client_messages
            SET leased_until = ?, leased_by = ?, leased_count = leased_count + 1
            WHERE rowid IN (
                SELECT rowid FROM client_messages
                WHERE client_id = ? AND (leased_until IS NULL OR leased_until < ?)
                ORDER BY task_id
                LIMIT ?
            )
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(to_micros(lease_deadline(now, lease_time)))
        .bind(self.owner())
        .bind(client_id.as_str())
        .bind(to_micros(now))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut messages = rows.iter().map(message_from_row).collect::<Result<Vec<_>>>()?;
        messages.sort_by_key(|m| m.task_id);

        if !messages.is_empty() {
            tracing::debug!(
                target: TRACING_TARGET_MAILBOX,
                client_id = %client_id,
                count = messages.len(),
                "Leased client messages"
            );
        }
        Ok(messages)
    }

    /// Permanently remove acked messages. Returns how many existed.
    pub async fn delete_messages(&self, refs: &[MessageRef]) -> Result<usize> {
        let mut tx = self.begin_immediate().await?;
        let mut deleted = 0;
        for r in refs {
            deleted += sqlx::query("DELETE FROM client_messages WHERE client_id = ? AND task_id = ?")
                .bind(r.client_id.as_str())
                .bind(db_id(r.task_id)?)
                .execute(&mut *tx)
                .await?
                .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(deleted)
    }

    /// All queued messages for a client, leased or not
    pub async fn read_messages(&self, client_id: &ClientId) -> Result<Vec<ClientMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM client_messages WHERE client_id = ? ORDER BY task_id"
        ))
        .bind(client_id.as_str())
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(message_from_row).collect()
    }
}

/// Upsert a single message inside an open transaction
pub(crate) async fn write_message(conn: &mut SqliteConnection, message: &ClientMessage) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO client_messages (client_id, task_id, flow_id, request_id, payload, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(client_id, task_id) DO UPDATE SET
            flow_id = excluded.flow_id,
            request_id = excluded.request_id,
            payload = excluded.payload
        "#,
    )
    .bind(message.client_id.as_str())
    .bind(db_id(message.task_id)?)
    .bind(message.flow_id.as_ref().map(|f| f.as_str().to_string()))
    .bind(message.request_id.map(db_id).transpose()?)
    .bind(serde_json::to_string(&message.payload)?)
    .bind(to_micros(message.created_at))
    .execute(conn)
    .await?;
    Ok(())
}

/// Delete the messages carrying work for one flow request.
///
/// Called by the ledger once the request has all of its responses.
pub(crate) async fn delete_messages_for_request(
    conn: &mut SqliteConnection,
    client_id: &ClientId,
    flow_id: &FlowId,
    request_id: u64,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM client_messages WHERE client_id = ? AND flow_id = ? AND request_id = ?",
    )
    .bind(client_id.as_str())
    .bind(flow_id.as_str())
    .bind(db_id(request_id)?)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

fn message_from_row(row: &SqliteRow) -> Result<ClientMessage> {
    let client_id: String = row.try_get("client_id")?;
    let flow_id: Option<String> = row.try_get("flow_id")?;
    let payload: String = row.try_get("payload")?;
    let leased_count: i64 = row.try_get("leased_count")?;

    Ok(ClientMessage {
        client_id: client_id.parse()?,
        task_id: from_db_id(row.try_get("task_id")?)?,
        flow_id: flow_id.map(|f| f.parse()).transpose()?,
        request_id: row
            .try_get::<Option<i64>, _>("request_id")?
            .map(from_db_id)
            .transpose()?,
        payload: serde_json::from_str(&payload)?,
        created_at: from_micros(row.try_get("created_at")?)?,
        leased_until: opt_from_micros(row.try_get("leased_until")?)?,
        leased_by: row.try_get("leased_by")?,
        leased_count: u32::try_from(leased_count)
            .map_err(|_| Error::corrupt(format!("leased_count out of range: {leased_count}")))?,
    })
}
