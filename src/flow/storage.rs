//! Flow record store
//!
//! CRUD for flow rows plus the single-writer processing lock. The lock is a
//! lease: `processing_deadline` in the past means anyone may take the flow,
//! so a crashed worker never needs an explicit unlock.

use crate::{
    client::ClientId,
    error::{Error, Result},
    flow::{
        processing::enqueue_in,
        types::{Flow, FlowId},
    },
    store::{db_id, from_db_id, from_micros, lease_deadline, opt_from_micros, to_micros, Store},
};
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use std::time::Duration;

/// Tracing target for flow record operations.
pub const TRACING_TARGET_FLOW: &str = "flowkeeper::flow";

const FLOW_COLUMNS: &str = "client_id, flow_id, parent_flow_id, flow_name, state, flow_state, \
     next_request_to_process, processing_on, processing_since, processing_deadline, \
     pending_termination, error_message, crash_info, created_at, updated_at";

impl Store {
    /// Create or overwrite a flow record.
    ///
    /// Fails with [`Error::UnknownClient`] if the client was never registered.
    pub async fn write_flow(&self, flow: &Flow) -> Result<()> {
        let mut tx = self.begin_immediate().await?;

        let client_exists = sqlx::query("SELECT 1 FROM clients WHERE client_id = ?")
            .bind(flow.client_id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !client_exists {
            return Err(Error::unknown_client(&flow.client_id));
        }

        sqlx::query(&format!(
            r#"
            INSERT INTO flows ({FLOW_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(client_id, flow_id) DO UPDATE SET
                parent_flow_id = excluded.parent_flow_id,
                flow_name = excluded.flow_name,
                state = excluded.state,
                flow_state = excluded.flow_state,
                next_request_to_process = excluded.next_request_to_process,
                processing_on = excluded.processing_on,
                processing_since = excluded.processing_since,
                processing_deadline = excluded.processing_deadline,
                pending_termination = excluded.pending_termination,
                error_message = excluded.error_message,
                crash_info = excluded.crash_info,
                updated_at = excluded.updated_at
            "#
        ))
        .bind(flow.client_id.as_str())
        .bind(flow.flow_id.as_str())
        .bind(flow.parent_flow_id.as_ref().map(|p| p.as_str().to_string()))
        .bind(&flow.flow_name)
        .bind(serde_json::to_string(&flow.state)?)
        .bind(flow.flow_state.as_str())
        .bind(db_id(flow.next_request_to_process)?)
        .bind(flow.processing_on.as_deref())
        .bind(flow.processing_since.map(to_micros))
        .bind(flow.processing_deadline.map(to_micros))
        .bind(flow.pending_termination.as_deref())
        .bind(flow.error_message.as_deref())
        .bind(flow.crash_info.as_deref())
        .bind(to_micros(flow.created_at))
        .bind(to_micros(Utc::now()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            target: TRACING_TARGET_FLOW,
            client_id = %flow.client_id,
            flow_id = %flow.flow_id,
            flow_name = %flow.flow_name,
            "Wrote flow"
        );
        Ok(())
    }

    /// Load a flow snapshot without taking its lock.
    ///
    /// The lock columns are returned as stored, so the snapshot shows who is
    /// processing the flow, if anyone.
    pub async fn read_flow(&self, client_id: &ClientId, flow_id: &FlowId) -> Result<Flow> {
        let mut conn = self.pool().acquire().await?;
        read_flow_in(&mut *conn, client_id, flow_id).await
    }

    /// Every flow, optionally restricted to one client
    pub async fn read_all_flows(&self, client_id: Option<&ClientId>) -> Result<Vec<Flow>> {
        let rows = match client_id {
            Some(client_id) => {
                sqlx::query(&format!(
                    "SELECT {FLOW_COLUMNS} FROM flows WHERE client_id = ? ORDER BY created_at, flow_id"
                ))
                .bind(client_id.as_str())
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {FLOW_COLUMNS} FROM flows ORDER BY client_id, created_at, flow_id"
                ))
                .fetch_all(self.pool())
                .await?
            }
        };

        rows.iter().map(flow_from_row).collect()
    }

    /// Direct children of a flow. Fails if the parent does not exist.
    pub async fn read_child_flows(&self, client_id: &ClientId, parent_flow_id: &FlowId) -> Result<Vec<Flow>> {
        let mut conn = self.pool().acquire().await?;
        read_flow_in(&mut *conn, client_id, parent_flow_id).await?;

        let rows = sqlx::query(&format!(
            "SELECT {FLOW_COLUMNS} FROM flows WHERE client_id = ? AND parent_flow_id = ? ORDER BY created_at, flow_id"
        ))
        .bind(client_id.as_str())
        .bind(parent_flow_id.as_str())
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(flow_from_row).collect()
    }

    /// Take the processing lock and return the locked snapshot.
    ///
    /// Fails with [`Error::AlreadyBeingProcessed`] while another holder's
    /// deadline is still in the future.
    pub async fn read_flow_for_processing(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        lease_duration: Duration,
    ) -> Result<Flow> {
        let now = Utc::now();
        let mut tx = self.begin_immediate().await?;

        let claimed = sqlx::query(&format!(
            r#"
            UPDATE flows
            SET processing_on = ?, processing_since = ?, processing_deadline = ?
            WHERE client_id = ? AND flow_id = ?
              AND (processing_deadline IS NULL OR processing_deadline <= ?)
            RETURNING {FLOW_COLUMNS}
            "#
        ))
        .bind(self.owner())
        .bind(to_micros(now))
        .bind(to_micros(lease_deadline(now, lease_duration)))
        .bind(client_id.as_str())
        .bind(flow_id.as_str())
        .bind(to_micros(now))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = claimed else {
            let current = read_flow_in(&mut *tx, client_id, flow_id).await?;
            let deadline = current
                .processing_deadline
                .ok_or_else(|| Error::corrupt("flow lock refused without a deadline"))?;
            return Err(Error::AlreadyBeingProcessed {
                client_id: client_id.clone(),
                flow_id: flow_id.clone(),
                deadline,
            });
        };

        let flow = flow_from_row(&row)?;
        tx.commit().await?;

        tracing::debug!(
            target: TRACING_TARGET_FLOW,
            client_id = %client_id,
            flow_id = %flow_id,
            owner = %self.owner(),
            cursor = flow.next_request_to_process,
            "🔒 Leased flow for processing"
        );
        Ok(flow)
    }

    /// Persist the holder's snapshot and drop the processing lock.
    ///
    /// Returns `false` without writing anything when the request at the
    /// snapshot's cursor has become ready since the lock was taken; the
    /// caller must keep processing instead of going idle, or that wakeup
    /// would be lost. A ready cursor request whose `start_time` is still in
    /// the future does not block the release; it gets a notification
    /// deferred to that time instead, unless one at or after that time is
    /// already queued.
    pub async fn return_processed_flow(&self, flow: &Flow) -> Result<bool> {
        let mut tx = self.begin_immediate().await?;

        let cursor_request: Option<(bool, Option<i64>)> = sqlx::query_as(
            "SELECT needs_processing, start_time FROM flow_requests WHERE client_id = ? AND flow_id = ? AND request_id = ?",
        )
        .bind(flow.client_id.as_str())
        .bind(flow.flow_id.as_str())
        .bind(db_id(flow.next_request_to_process)?)
        .fetch_optional(&mut *tx)
        .await?;

        let now = Utc::now();
        let mut deferred = None;
        if let Some((true, start_time)) = cursor_request {
            match opt_from_micros(start_time)? {
                Some(start_time) if start_time > now => deferred = Some(start_time),
                _ => {
                    tracing::debug!(
                        target: TRACING_TARGET_FLOW,
                        client_id = %flow.client_id,
                        flow_id = %flow.flow_id,
                        cursor = flow.next_request_to_process,
                        "Release refused: request at cursor became ready"
                    );
                    return Ok(false);
                }
            }
        }
        let updated = sqlx::query(
            r#"
            UPDATE flows SET
                parent_flow_id = ?,
                state = ?,
                flow_state = ?,
                next_request_to_process = ?,
                error_message = ?,
                crash_info = ?,
                updated_at = ?,
                processing_on = NULL,
                processing_since = NULL,
                processing_deadline = NULL
            WHERE client_id = ? AND flow_id = ?
            "#,
        )
        .bind(flow.parent_flow_id.as_ref().map(|p| p.as_str().to_string()))
        .bind(serde_json::to_string(&flow.state)?)
        .bind(flow.flow_state.as_str())
        .bind(db_id(flow.next_request_to_process)?)
        .bind(flow.error_message.as_deref())
        .bind(flow.crash_info.as_deref())
        .bind(to_micros(now))
        .bind(flow.client_id.as_str())
        .bind(flow.flow_id.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::unknown_flow(&flow.client_id, &flow.flow_id));
        }

        // A ready cursor request that may not start yet still needs a wakeup
        let mut woken = false;
        if let Some(start_time) = deferred {
            let queued: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM flow_processing_requests WHERE client_id = ? AND flow_id = ? AND delivery_time >= ? LIMIT 1",
            )
            .bind(flow.client_id.as_str())
            .bind(flow.flow_id.as_str())
            .bind(to_micros(start_time))
            .fetch_optional(&mut *tx)
            .await?;

            if queued.is_none() {
                enqueue_in(&mut *tx, &flow.client_id, &flow.flow_id, Some(start_time)).await?;
                woken = true;
            }
        }

        tx.commit().await?;
        if woken {
            self.signals().flow_processing.notify_one();
        }

        tracing::debug!(
            target: TRACING_TARGET_FLOW,
            client_id = %flow.client_id,
            flow_id = %flow.flow_id,
            cursor = flow.next_request_to_process,
            flow_state = flow.flow_state.as_str(),
            "🔓 Released processed flow"
        );
        Ok(true)
    }

    /// Ask the current (or next) lock holder to terminate the flow.
    ///
    /// Touches only the `pending_termination` column, so it is safe to call
    /// while another worker holds the lock.
    pub async fn set_pending_termination(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        reason: &str,
    ) -> Result<()> {
        let mut conn = self.pool().acquire().await?;
        mark_pending_termination(&mut *conn, client_id, flow_id, reason).await?;

        tracing::info!(
            target: TRACING_TARGET_FLOW,
            client_id = %client_id,
            flow_id = %flow_id,
            reason,
            "🛑 Flow termination requested"
        );
        Ok(())
    }
}

/// Write `pending_termination` and nothing else
pub(crate) async fn mark_pending_termination(
    conn: &mut SqliteConnection,
    client_id: &ClientId,
    flow_id: &FlowId,
    reason: &str,
) -> Result<()> {
    let updated = sqlx::query("UPDATE flows SET pending_termination = ? WHERE client_id = ? AND flow_id = ?")
        .bind(reason)
        .bind(client_id.as_str())
        .bind(flow_id.as_str())
        .execute(conn)
        .await?;

    if updated.rows_affected() == 0 {
        return Err(Error::unknown_flow(client_id, flow_id));
    }
    Ok(())
}

/// `read_flow` on a borrowed connection or transaction
pub(crate) async fn read_flow_in(
    conn: &mut SqliteConnection,
    client_id: &ClientId,
    flow_id: &FlowId,
) -> Result<Flow> {
    let row = sqlx::query(&format!(
        "SELECT {FLOW_COLUMNS} FROM flows WHERE client_id = ? AND flow_id = ?"
    ))
    .bind(client_id.as_str())
    .bind(flow_id.as_str())
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| Error::unknown_flow(client_id, flow_id))?;

    flow_from_row(&row)
}

fn flow_from_row(row: &SqliteRow) -> Result<Flow> {
    let client_id: String = row.try_get("client_id")?;
    let flow_id: String = row.try_get("flow_id")?;
    let parent_flow_id: Option<String> = row.try_get("parent_flow_id")?;
    let state: String = row.try_get("state")?;
    let flow_state: String = row.try_get("flow_state")?;

    Ok(Flow {
        client_id: client_id.parse()?,
        flow_id: flow_id.parse()?,
        parent_flow_id: parent_flow_id.map(|p| p.parse()).transpose()?,
        flow_name: row.try_get("flow_name")?,
        state: serde_json::from_str(&state)?,
        flow_state: flow_state.parse()?,
        next_request_to_process: from_db_id(row.try_get("next_request_to_process")?)?,
        processing_on: row.try_get("processing_on")?,
        processing_since: opt_from_micros(row.try_get("processing_since")?)?,
        processing_deadline: opt_from_micros(row.try_get("processing_deadline")?)?,
        pending_termination: row.try_get("pending_termination")?,
        error_message: row.try_get("error_message")?,
        crash_info: row.try_get("crash_info")?,
        created_at: from_micros(row.try_get("created_at")?)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
    })
}
