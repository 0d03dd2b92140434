//! Flow request/response ledger
//!
//! Reconciles the requests a flow issues against the responses agents send
//! back. Responses may arrive in any order and any number of times; a request
//! turns ready only once its Status has been recorded and the number of
//! distinct non-status responses equals the count that Status declared.
//!
//! Request lifecycle:
//!
//! ```text
//! pending (expected unknown) -> accumulating (expected known) -> ready -> consumed (deleted)
//! ```
//!
//! The ready transition of a flow's cursor request enqueues exactly one
//! [`FlowProcessingRequest`] in the same transaction.

use crate::{
    client::{mailbox::delete_messages_for_request, ClientId},
    error::{Error, Result},
    flow::{
        processing::enqueue_in,
        storage::mark_pending_termination,
        types::{
            FlowId, FlowProcessingRequest, FlowRequest, FlowResponse, ReadyRequest, RequestKey,
            RequestWithResponses, ResponsePayload,
        },
    },
    store::{db_id, from_db_id, from_micros, opt_from_micros, to_micros, Store},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use std::collections::{hash_map::Entry, BTreeSet, HashMap};

/// Tracing target for ledger operations.
pub const TRACING_TARGET_LEDGER: &str = "flowkeeper::ledger";

const REQUEST_COLUMNS: &str =
    "client_id, flow_id, request_id, needs_processing, responses_expected, payload, start_time, timestamp";

const RESPONSE_COLUMNS: &str = "client_id, flow_id, request_id, response_id, payload, timestamp";

/// What a [`Store::write_responses`] batch did
#[derive(Debug, Default, Clone, Serialize)]
pub struct WriteResponsesOutcome {
    /// Responses persisted
    pub stored: usize,
    /// Responses for requests that do not exist (never issued or consumed)
    pub dropped_stale: usize,
    /// Responses whose id was already stored
    pub dropped_duplicate: usize,
    /// Requests that turned ready in this batch
    pub completed: Vec<RequestKey>,
    /// Notifications enqueued for cursor requests that turned ready
    pub notifications: Vec<FlowProcessingRequest>,
}

/// Reconciliation state of one request, loaded once per batch
#[derive(Debug, Clone)]
struct RequestState {
    needs_processing: bool,
    responses_expected: Option<u64>,
    start_time: Option<DateTime<Utc>>,
}

impl Store {
    /// Insert new requests; re-inserting an existing key is a no-op.
    ///
    /// `responses_expected` is never taken from the caller: it is stored
    /// empty and only learned from the request's Status response, so data
    /// alone can never complete a request. A request submitted already ready at its flow's cursor enqueues a
    /// processing notification, deferred to its `start_time` if it has one.
    pub async fn write_requests(&self, requests: &[FlowRequest]) -> Result<Vec<FlowProcessingRequest>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.begin_immediate().await?;
        let mut cursors = HashMap::new();
        let mut notifications = Vec::new();

        for request in requests {
            let cursor = flow_cursor(&mut *tx, &mut cursors, &request.client_id, &request.flow_id)
                .await?
                .ok_or_else(|| Error::unknown_flow(&request.client_id, &request.flow_id))?;

            let inserted = sqlx::query(&format!(
                "INSERT OR IGNORE INTO flow_requests ({REQUEST_COLUMNS}) VALUES (?, ?, ?, ?, NULL, ?, ?, ?)"
            ))
            .bind(request.client_id.as_str())
            .bind(request.flow_id.as_str())
            .bind(db_id(request.request_id)?)
            .bind(request.needs_processing)
            .bind(serde_json::to_string(&request.payload)?)
            .bind(request.start_time.map(to_micros))
            .bind(to_micros(request.timestamp))
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted == 1 && request.needs_processing && request.request_id == cursor {
                notifications.push(
                    enqueue_in(&mut *tx, &request.client_id, &request.flow_id, request.start_time).await?,
                );
            }
        }

        tx.commit().await?;

        tracing::debug!(
            target: TRACING_TARGET_LEDGER,
            count = requests.len(),
            notifications = notifications.len(),
            "Wrote flow requests"
        );
        if !notifications.is_empty() {
            self.signals().flow_processing.notify_one();
        }
        Ok(notifications)
    }

    /// Record a batch of responses and flag the requests they complete.
    ///
    /// Stale and duplicate responses are dropped and counted. A Status whose
    /// expected count contradicts the one already recorded for its request
    /// rolls back the whole batch, asks the flow to terminate and fails with
    /// [`Error::ExpectedCountMismatch`].
    pub async fn write_responses(&self, responses: &[FlowResponse]) -> Result<WriteResponsesOutcome> {
        let mut outcome = WriteResponsesOutcome::default();
        if responses.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.begin_immediate().await?;
        let mut states: HashMap<RequestKey, Option<RequestState>> = HashMap::new();
        let mut touched = BTreeSet::new();

        for response in responses {
            let key = response.key();
            let state = match states.entry(key.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(load_request_state(&mut *tx, &key).await?),
            };

            let Some(state) = state else {
                tracing::debug!(
                    target: TRACING_TARGET_LEDGER,
                    client_id = %key.client_id,
                    flow_id = %key.flow_id,
                    request_id = key.request_id,
                    response_id = response.response_id,
                    "Dropping response for unknown request"
                );
                outcome.dropped_stale += 1;
                continue;
            };

            if let ResponsePayload::Status(status) = &response.payload {
                match state.responses_expected {
                    Some(recorded) if recorded != status.expected_responses => {
                        tx.rollback().await?;
                        return Err(self.halt_on_mismatch(&key, recorded, status.expected_responses).await);
                    }
                    Some(_) => {}
                    None => {
                        sqlx::query(
                            "UPDATE flow_requests SET responses_expected = ? WHERE client_id = ? AND flow_id = ? AND request_id = ?",
                        )
                        .bind(db_id(status.expected_responses)?)
                        .bind(key.client_id.as_str())
                        .bind(key.flow_id.as_str())
                        .bind(db_id(key.request_id)?)
                        .execute(&mut *tx)
                        .await?;
                        state.responses_expected = Some(status.expected_responses);
                    }
                }
            }

            let inserted = sqlx::query(&format!(
                "INSERT OR IGNORE INTO flow_responses ({RESPONSE_COLUMNS}, kind) VALUES (?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(key.client_id.as_str())
            .bind(key.flow_id.as_str())
            .bind(db_id(key.request_id)?)
            .bind(db_id(response.response_id)?)
            .bind(serde_json::to_string(&response.payload)?)
            .bind(to_micros(response.timestamp))
            .bind(response.payload.kind())
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted == 1 {
                outcome.stored += 1;
                touched.insert(key);
            } else {
                outcome.dropped_duplicate += 1;
            }
        }

        let mut cursors = HashMap::new();
        for key in touched {
            let Some(Some(state)) = states.get(&key) else {
                continue;
            };
            if state.needs_processing {
                continue;
            }
            let Some(expected) = state.responses_expected else {
                continue;
            };

            let received = count_data_responses(&mut *tx, &key).await?;
            if received < expected {
                continue;
            }
            if received > expected {
                tracing::warn!(
                    target: TRACING_TARGET_LEDGER,
                    client_id = %key.client_id,
                    flow_id = %key.flow_id,
                    request_id = key.request_id,
                    expected,
                    received,
                    "More responses than the status declared; request left unready"
                );
                continue;
            }

            sqlx::query(
                "UPDATE flow_requests SET needs_processing = 1 WHERE client_id = ? AND flow_id = ? AND request_id = ?",
            )
            .bind(key.client_id.as_str())
            .bind(key.flow_id.as_str())
            .bind(db_id(key.request_id)?)
            .execute(&mut *tx)
            .await?;

            let cursor = flow_cursor(&mut *tx, &mut cursors, &key.client_id, &key.flow_id).await?;
            if cursor == Some(key.request_id) {
                outcome
                    .notifications
                    .push(enqueue_in(&mut *tx, &key.client_id, &key.flow_id, state.start_time).await?);
            }

            let acked =
                delete_messages_for_request(&mut *tx, &key.client_id, &key.flow_id, key.request_id).await?;

            tracing::debug!(
                target: TRACING_TARGET_LEDGER,
                client_id = %key.client_id,
                flow_id = %key.flow_id,
                request_id = key.request_id,
                responses = received,
                client_messages_deleted = acked,
                "✅ Request ready for processing"
            );
            outcome.completed.push(key);
        }

        tx.commit().await?;

        if !outcome.notifications.is_empty() {
            self.signals().flow_processing.notify_one();
        }

        tracing::debug!(
            target: TRACING_TARGET_LEDGER,
            stored = outcome.stored,
            dropped_stale = outcome.dropped_stale,
            dropped_duplicate = outcome.dropped_duplicate,
            completed = outcome.completed.len(),
            "Wrote flow responses"
        );
        Ok(outcome)
    }

    /// The contiguous run of ready requests starting exactly at `cursor`,
    /// each with its responses sorted by response id.
    ///
    /// Stops at the first missing id, unready request, or request whose
    /// `start_time` has not passed.
    pub async fn read_requests_ready_for_processing(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
        cursor: u64,
    ) -> Result<Vec<ReadyRequest>> {
        let mut conn = self.pool().acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM flow_requests WHERE client_id = ? AND flow_id = ? AND request_id >= ? ORDER BY request_id"
        ))
        .bind(client_id.as_str())
        .bind(flow_id.as_str())
        .bind(db_id(cursor)?)
        .fetch_all(&mut *conn)
        .await?;

        let now = Utc::now();
        let mut ready = Vec::new();
        let mut next = cursor;
        for row in &rows {
            let request = request_from_row(row)?;
            let started = request.start_time.map_or(true, |start| start <= now);
            if request.request_id != next || !request.needs_processing || !started {
                break;
            }

            let key = request.key();
            let responses = read_responses_in(&mut *conn, &key).await?;
            ready.push(ReadyRequest { request, responses });
            next += 1;
        }

        Ok(ready)
    }

    /// Every stored request of a flow in any state, with its responses
    pub async fn read_all_requests_and_responses(
        &self,
        client_id: &ClientId,
        flow_id: &FlowId,
    ) -> Result<Vec<RequestWithResponses>> {
        let mut conn = self.pool().acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM flow_requests WHERE client_id = ? AND flow_id = ? ORDER BY request_id"
        ))
        .bind(client_id.as_str())
        .bind(flow_id.as_str())
        .fetch_all(&mut *conn)
        .await?;

        let mut all = Vec::with_capacity(rows.len());
        for row in &rows {
            let request = request_from_row(row)?;
            let responses = read_responses_in(&mut *conn, &request.key()).await?;
            all.push(RequestWithResponses { request, responses });
        }
        Ok(all)
    }

    /// Remove consumed requests together with their responses
    pub async fn delete_requests(&self, keys: &[RequestKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut tx = self.begin_immediate().await?;
        for key in keys {
            for table in ["flow_responses", "flow_requests"] {
                sqlx::query(&format!(
                    "DELETE FROM {table} WHERE client_id = ? AND flow_id = ? AND request_id = ?"
                ))
                .bind(key.client_id.as_str())
                .bind(key.flow_id.as_str())
                .bind(db_id(key.request_id)?)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;

        tracing::debug!(
            target: TRACING_TARGET_LEDGER,
            count = keys.len(),
            "Deleted consumed requests"
        );
        Ok(())
    }

    /// Drop every request and response of a flow
    pub async fn delete_all_requests_and_responses(&self, client_id: &ClientId, flow_id: &FlowId) -> Result<()> {
        let mut tx = self.begin_immediate().await?;
        for table in ["flow_responses", "flow_requests"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE client_id = ? AND flow_id = ?"))
                .bind(client_id.as_str())
                .bind(flow_id.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Runs after the failed batch has been rolled back and its connection
    /// returned to the pool.
    ///
    /// The flow is idle on a request that can no longer become ready, so the
    /// termination mark goes out together with a wakeup for it.
    async fn halt_on_mismatch(&self, key: &RequestKey, recorded: u64, received: u64) -> Error {
        let reason = format!(
            "expected response count mismatch on request {}: recorded {recorded}, received {received}",
            key.request_id
        );

        tracing::error!(
            target: TRACING_TARGET_LEDGER,
            client_id = %key.client_id,
            flow_id = %key.flow_id,
            request_id = key.request_id,
            recorded,
            received,
            "🚨 Expected response count mismatch, halting flow"
        );

        if let Err(e) = self.mark_and_wake(&key.client_id, &key.flow_id, &reason).await {
            tracing::error!(
                target: TRACING_TARGET_LEDGER,
                client_id = %key.client_id,
                flow_id = %key.flow_id,
                error = %e,
                "Failed to mark flow for termination"
            );
        }

        Error::ExpectedCountMismatch {
            client_id: key.client_id.clone(),
            flow_id: key.flow_id.clone(),
            request_id: key.request_id,
            recorded,
            received,
        }
    }

    async fn mark_and_wake(&self, client_id: &ClientId, flow_id: &FlowId, reason: &str) -> Result<()> {
        let mut tx = self.begin_immediate().await?;
        mark_pending_termination(&mut *tx, client_id, flow_id, reason).await?;
        enqueue_in(&mut *tx, client_id, flow_id, None).await?;
        tx.commit().await?;

        self.signals().flow_processing.notify_one();
        Ok(())
    }
}

/// Cursor of a flow, cached for the lifetime of one batch. `None` if the
/// flow does not exist.
async fn flow_cursor(
    conn: &mut SqliteConnection,
    cache: &mut HashMap<(ClientId, FlowId), Option<u64>>,
    client_id: &ClientId,
    flow_id: &FlowId,
) -> Result<Option<u64>> {
    let cache_key = (client_id.clone(), flow_id.clone());
    if let Some(cursor) = cache.get(&cache_key) {
        return Ok(*cursor);
    }

    let cursor: Option<i64> = sqlx::query_scalar(
        "SELECT next_request_to_process FROM flows WHERE client_id = ? AND flow_id = ?",
    )
    .bind(client_id.as_str())
    .bind(flow_id.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    let cursor = cursor.map(from_db_id).transpose()?;
    cache.insert(cache_key, cursor);
    Ok(cursor)
}

async fn load_request_state(conn: &mut SqliteConnection, key: &RequestKey) -> Result<Option<RequestState>> {
    let row = sqlx::query(
        "SELECT needs_processing, responses_expected, start_time FROM flow_requests WHERE client_id = ? AND flow_id = ? AND request_id = ?",
    )
    .bind(key.client_id.as_str())
    .bind(key.flow_id.as_str())
    .bind(db_id(key.request_id)?)
    .fetch_optional(conn)
    .await?;

    row.map(|row| -> Result<RequestState> {
        Ok(RequestState {
            needs_processing: row.try_get("needs_processing")?,
            responses_expected: row
                .try_get::<Option<i64>, _>("responses_expected")?
                .map(from_db_id)
                .transpose()?,
            start_time: opt_from_micros(row.try_get("start_time")?)?,
        })
    })
    .transpose()
}

/// Distinct non-status response ids stored for a request
async fn count_data_responses(conn: &mut SqliteConnection, key: &RequestKey) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT response_id) FROM flow_responses WHERE client_id = ? AND flow_id = ? AND request_id = ? AND kind != 'status'",
    )
    .bind(key.client_id.as_str())
    .bind(key.flow_id.as_str())
    .bind(db_id(key.request_id)?)
    .fetch_one(conn)
    .await?;

    from_db_id(count)
}

async fn read_responses_in(conn: &mut SqliteConnection, key: &RequestKey) -> Result<Vec<FlowResponse>> {
    let rows = sqlx::query(&format!(
        "SELECT {RESPONSE_COLUMNS} FROM flow_responses WHERE client_id = ? AND flow_id = ? AND request_id = ? ORDER BY response_id"
    ))
    .bind(key.client_id.as_str())
    .bind(key.flow_id.as_str())
    .bind(db_id(key.request_id)?)
    .fetch_all(conn)
    .await?;

    rows.iter().map(response_from_row).collect()
}

fn request_from_row(row: &SqliteRow) -> Result<FlowRequest> {
    let client_id: String = row.try_get("client_id")?;
    let flow_id: String = row.try_get("flow_id")?;
    let payload: String = row.try_get("payload")?;

    Ok(FlowRequest {
        client_id: client_id.parse()?,
        flow_id: flow_id.parse()?,
        request_id: from_db_id(row.try_get("request_id")?)?,
        needs_processing: row.try_get("needs_processing")?,
        responses_expected: row
            .try_get::<Option<i64>, _>("responses_expected")?
            .map(from_db_id)
            .transpose()?,
        payload: serde_json::from_str(&payload)?,
        start_time: opt_from_micros(row.try_get("start_time")?)?,
        timestamp: from_micros(row.try_get("timestamp")?)?,
    })
}

fn response_from_row(row: &SqliteRow) -> Result<FlowResponse> {
    let client_id: String = row.try_get("client_id")?;
    let flow_id: String = row.try_get("flow_id")?;
    let payload: String = row.try_get("payload")?;

    Ok(FlowResponse {
        client_id: client_id.parse()?,
        flow_id: flow_id.parse()?,
        request_id: from_db_id(row.try_get("request_id")?)?,
        response_id: from_db_id(row.try_get("response_id")?)?,
        payload: serde_json::from_str(&payload)?,
        timestamp: from_micros(row.try_get("timestamp")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::ClientMessage,
        flow::types::{Flow, FlowStatus},
    };
    use serde_json::json;

    fn client() -> ClientId {
        "C.4000000000000004".parse().unwrap()
    }

    fn flow_id() -> FlowId {
        "0000FEED".parse().unwrap()
    }

    async fn store_with_requests(ids: &[u64]) -> Store {
        let store = Store::in_memory("worker-a").await.unwrap();
        store.write_client(&client()).await.unwrap();
        store
            .write_flow(&Flow::new(client(), flow_id(), "Interrogate", json!({})))
            .await
            .unwrap();
        let requests: Vec<_> = ids
            .iter()
            .map(|id| FlowRequest::new(client(), flow_id(), *id, json!({ "step": id })))
            .collect();
        store.write_requests(&requests).await.unwrap();
        store
    }

    fn data(request_id: u64, response_id: u64) -> FlowResponse {
        FlowResponse::new(
            client(),
            flow_id(),
            request_id,
            response_id,
            ResponsePayload::Data(json!({ "n": response_id })),
        )
    }

    fn status(request_id: u64, response_id: u64, expected: u64) -> FlowResponse {
        FlowResponse::new(
            client(),
            flow_id(),
            request_id,
            response_id,
            ResponsePayload::Status(FlowStatus::ok(expected)),
        )
    }

    async fn request(store: &Store, request_id: u64) -> FlowRequest {
        store
            .read_all_requests_and_responses(&client(), &flow_id())
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.request.request_id == request_id)
            .unwrap()
            .request
    }

    #[tokio::test]
    async fn test_write_requests_is_idempotent() {
        let store = store_with_requests(&[0, 1]).await;
        store
            .write_requests(&[FlowRequest::new(client(), flow_id(), 0, json!({"step": "again"}))])
            .await
            .unwrap();

        let all = store.read_all_requests_and_responses(&client(), &flow_id()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].request.payload, json!({"step": 0}));
    }

    #[tokio::test]
    async fn test_write_requests_for_unknown_flow() {
        let store = store_with_requests(&[]).await;
        let other: FlowId = "0BADF10E".parse().unwrap();
        let err = store
            .write_requests(&[FlowRequest::new(client(), other, 0, json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownFlow { .. }));
    }

    #[tokio::test]
    async fn test_ready_request_at_cursor_enqueues_notification() {
        let store = store_with_requests(&[]).await;
        let notifications = store
            .write_requests(&[
                FlowRequest::new(client(), flow_id(), 0, json!({})).ready(),
                FlowRequest::new(client(), flow_id(), 1, json!({})).ready(),
            ])
            .await
            .unwrap();

        // Only request 0 sits at the cursor
        assert_eq!(notifications.len(), 1);
        assert_eq!(store.list_flow_processing_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_then_data_scenario() {
        let store = store_with_requests(&[0]).await;

        let outcome = store.write_responses(&[data(0, 0)]).await.unwrap();
        assert_eq!(outcome.stored, 1);
        assert!(outcome.completed.is_empty());
        assert!(!request(&store, 0).await.needs_processing);

        let outcome = store.write_responses(&[status(0, 2, 2)]).await.unwrap();
        assert!(outcome.completed.is_empty());
        let after_status = request(&store, 0).await;
        assert_eq!(after_status.responses_expected, Some(2));
        assert!(!after_status.needs_processing);

        let outcome = store.write_responses(&[data(0, 0)]).await.unwrap();
        assert_eq!(outcome.dropped_duplicate, 1);
        assert_eq!(outcome.stored, 0);
        assert!(!request(&store, 0).await.needs_processing);

        let outcome = store.write_responses(&[data(0, 1)]).await.unwrap();
        assert_eq!(outcome.completed.len(), 1);
        assert_eq!(outcome.notifications.len(), 1);
        assert!(request(&store, 0).await.needs_processing);
        assert_eq!(store.list_flow_processing_requests().await.unwrap().len(), 1);

        // Redelivering the completing response changes nothing
        let outcome = store.write_responses(&[data(0, 1)]).await.unwrap();
        assert_eq!(outcome.dropped_duplicate, 1);
        assert!(outcome.notifications.is_empty());
        assert_eq!(store.list_flow_processing_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_data_alone_never_completes_request() {
        let store = store_with_requests(&[]).await;
        let mut presumed = FlowRequest::new(client(), flow_id(), 0, json!({}));
        presumed.responses_expected = Some(1);
        store.write_requests(&[presumed]).await.unwrap();
        assert_eq!(request(&store, 0).await.responses_expected, None);

        let outcome = store.write_responses(&[data(0, 0)]).await.unwrap();
        assert_eq!(outcome.stored, 1);
        assert!(outcome.completed.is_empty());
        assert!(!request(&store, 0).await.needs_processing);
        assert!(store.list_flow_processing_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_with_zero_expected_is_ready_on_arrival() {
        let store = store_with_requests(&[0]).await;
        let outcome = store.write_responses(&[status(0, 0, 0)]).await.unwrap();
        assert_eq!(outcome.completed.len(), 1);
        assert_eq!(outcome.notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_ready_request_off_cursor_is_not_notified() {
        let store = store_with_requests(&[0, 1]).await;
        let outcome = store
            .write_responses(&[data(1, 0), status(1, 1, 1)])
            .await
            .unwrap();
        assert_eq!(outcome.completed.len(), 1);
        assert!(outcome.notifications.is_empty());
        assert!(request(&store, 1).await.needs_processing);
    }

    #[tokio::test]
    async fn test_stale_responses_dropped() {
        let store = store_with_requests(&[0]).await;
        let outcome = store.write_responses(&[data(5, 0), data(0, 0)]).await.unwrap();
        assert_eq!(outcome.dropped_stale, 1);
        assert_eq!(outcome.stored, 1);
    }

    #[tokio::test]
    async fn test_mismatched_status_rolls_back_and_halts_flow() {
        let store = store_with_requests(&[0]).await;
        store.write_responses(&[status(0, 5, 3)]).await.unwrap();

        let err = store
            .write_responses(&[data(0, 0), status(0, 6, 4)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ExpectedCountMismatch { recorded: 3, received: 4, .. }
        ));
        assert!(!err.is_retryable());

        // The data response of the failed batch was rolled back
        let all = store.read_all_requests_and_responses(&client(), &flow_id()).await.unwrap();
        assert_eq!(all[0].responses.len(), 1);

        let flow = store.read_flow(&client(), &flow_id()).await.unwrap();
        assert!(flow.pending_termination.unwrap().contains("mismatch"));

        // The idle flow is woken so its next run can stop it
        let queued = store.list_flow_processing_requests().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].delivery_time.is_none());
    }

    #[tokio::test]
    async fn test_completion_deletes_client_messages_for_request() {
        let store = store_with_requests(&[0]).await;
        store
            .write_messages(&[
                ClientMessage::new(client(), 1, json!({})).for_request(flow_id(), 0),
                ClientMessage::new(client(), 2, json!({})).for_request(flow_id(), 1),
            ])
            .await
            .unwrap();

        store.write_responses(&[status(0, 0, 0)]).await.unwrap();

        let remaining = store.read_messages(&client()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].task_id, 2);
    }

    #[tokio::test]
    async fn test_read_ready_run_stops_at_gap() {
        let store = store_with_requests(&[0, 1, 3]).await;
        store
            .write_responses(&[status(0, 0, 0), status(1, 0, 0), status(3, 0, 0)])
            .await
            .unwrap();

        let ready = store
            .read_requests_ready_for_processing(&client(), &flow_id(), 0)
            .await
            .unwrap();
        assert_eq!(ready.iter().map(|r| r.request.request_id).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(ready[0].status().map(|s| s.expected_responses), Some(0));

        // Nothing at cursor 2
        assert!(store
            .read_requests_ready_for_processing(&client(), &flow_id(), 2)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_read_ready_respects_start_time() {
        let store = store_with_requests(&[]).await;
        let later = Utc::now() + chrono::Duration::hours(1);
        let notifications = store
            .write_requests(&[FlowRequest::new(client(), flow_id(), 0, json!({}))
                .ready()
                .with_start_time(later)])
            .await
            .unwrap();
        assert_eq!(notifications[0].delivery_time, Some(later));

        assert!(store
            .read_requests_ready_for_processing(&client(), &flow_id(), 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_responses_sorted_by_id() {
        let store = store_with_requests(&[0]).await;
        store
            .write_responses(&[status(0, 3, 2), data(0, 1), data(0, 0)])
            .await
            .unwrap();

        let ready = store
            .read_requests_ready_for_processing(&client(), &flow_id(), 0)
            .await
            .unwrap();
        let ids: Vec<_> = ready[0].responses.iter().map(|r| r.response_id).collect();
        assert_eq!(ids, vec![0, 1, 3]);
    }

    #[tokio::test]
    async fn test_delete_requests_and_all() {
        let store = store_with_requests(&[0, 1, 2]).await;
        store.write_responses(&[data(0, 0), data(1, 0)]).await.unwrap();

        store
            .delete_requests(&[RequestKey { client_id: client(), flow_id: flow_id(), request_id: 0 }])
            .await
            .unwrap();
        let all = store.read_all_requests_and_responses(&client(), &flow_id()).await.unwrap();
        assert_eq!(all.iter().map(|r| r.request.request_id).collect::<Vec<_>>(), vec![1, 2]);

        store.delete_all_requests_and_responses(&client(), &flow_id()).await.unwrap();
        assert!(store
            .read_all_requests_and_responses(&client(), &flow_id())
            .await
            .unwrap()
            .is_empty());

        // Responses for the deleted requests are now stale
        let outcome = store.write_responses(&[data(1, 1)]).await.unwrap();
        assert_eq!(outcome.dropped_stale, 1);
    }
}
