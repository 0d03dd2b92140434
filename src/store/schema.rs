//! Table layout for the flow store
//!
//! All timestamps are INTEGER microseconds since the Unix epoch. Safe to run
//! on every start (IF NOT EXISTS everywhere).

use sqlx::sqlite::SqlitePool;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS clients (
        client_id TEXT PRIMARY KEY,
        first_seen INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS client_messages (
        client_id TEXT NOT NULL,
        task_id INTEGER NOT NULL,
        flow_id TEXT,
        request_id INTEGER,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        leased_until INTEGER,
        leased_by TEXT,
        leased_count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (client_id, task_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_handler_requests (
        handler_name TEXT NOT NULL,
        request_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        leased_until INTEGER,
        leased_by TEXT,
        PRIMARY KEY (handler_name, request_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS flows (
        client_id TEXT NOT NULL REFERENCES clients(client_id),
        flow_id TEXT NOT NULL,
        parent_flow_id TEXT,
        flow_name TEXT NOT NULL,
        state TEXT NOT NULL,
        flow_state TEXT NOT NULL,
        next_request_to_process INTEGER NOT NULL DEFAULT 0,
        processing_on TEXT,
        processing_since INTEGER,
        processing_deadline INTEGER,
        pending_termination TEXT,
        error_message TEXT,
        crash_info TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (client_id, flow_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS flow_requests (
        client_id TEXT NOT NULL,
        flow_id TEXT NOT NULL,
        request_id INTEGER NOT NULL,
        needs_processing INTEGER NOT NULL DEFAULT 0,
        responses_expected INTEGER,
        payload TEXT NOT NULL,
        start_time INTEGER,
        timestamp INTEGER NOT NULL,
        PRIMARY KEY (client_id, flow_id, request_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS flow_responses (
        client_id TEXT NOT NULL,
        flow_id TEXT NOT NULL,
        request_id INTEGER NOT NULL,
        response_id INTEGER NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        PRIMARY KEY (client_id, flow_id, request_id, response_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS flow_processing_requests (
        client_id TEXT NOT NULL,
        flow_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        delivery_time INTEGER,
        leased_until INTEGER,
        leased_by TEXT,
        PRIMARY KEY (client_id, flow_id, timestamp)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_client_messages_flow ON client_messages(client_id, flow_id, request_id)",
    "CREATE INDEX IF NOT EXISTS idx_flows_parent ON flows(client_id, parent_flow_id)",
    "CREATE INDEX IF NOT EXISTS idx_handler_requests_lease ON message_handler_requests(handler_name, leased_until)",
    "CREATE INDEX IF NOT EXISTS idx_processing_requests_lease ON flow_processing_requests(leased_until, delivery_time)",
];

/// Create every table and index the engine uses
pub(crate) async fn init_schema(pool: &SqlitePool) -> sqlx::Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
