//! Shared SQLite store
//!
//! Every component of the engine talks to the same [`Store`]: the client
//! mailbox, message handler queue, flow records, the request/response ledger
//! and the flow processing queue are all `impl Store` blocks in their own
//! modules. The store is the only shared mutable resource; cloning it is
//! cheap (pool handle + owner id + wakeup signals).

mod schema;

use crate::{config::DatabaseConfig, error::Error, error::Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    Sqlite, Transaction,
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio::sync::Notify;

/// Tracing target for store setup.
pub const TRACING_TARGET_STORE: &str = "flowkeeper::store";

/// Leases a client message may take before it is dropped
pub const DEFAULT_CLIENT_MESSAGE_TTL: u32 = 5;

/// In-process wakeups for the dispatch loops.
///
/// These only shorten the poll latency; every loop still polls on its fixed
/// interval so a missed notification never stalls work.
#[derive(Debug, Default)]
pub(crate) struct Signals {
    /// A flow processing request was enqueued
    pub(crate) flow_processing: Notify,
    /// A message handler request was written
    pub(crate) handler_requests: Notify,
}

/// Handle on the transactional store
#[derive(Debug, Clone)]
pub struct Store {
    /// SQLite connection pool
    pool: SqlitePool,
    /// Lease owner written to `leased_by` / `processing_on`
    owner: Arc<str>,
    /// Lease ceiling for client messages
    client_message_ttl: u32,
    signals: Arc<Signals>,
}

impl Store {
    /// Open (creating if missing) the database described by `config`
    pub async fn connect(config: &DatabaseConfig, owner: impl Into<String>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs))
            .foreign_keys(true);

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }
        }

        tracing::info!(
            target: TRACING_TARGET_STORE,
            url = %config.url,
            max_connections = config.max_connections,
            "🗄️ Opening flow store"
        );

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        Self::from_pool(pool, owner).await
    }

    /// Private in-memory database, used by tests and embedded setups.
    ///
    /// A single connection that never idles out keeps the database alive for
    /// the lifetime of the pool.
    pub async fn in_memory(owner: impl Into<String>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool, owner).await
    }

    async fn from_pool(pool: SqlitePool, owner: impl Into<String>) -> Result<Self> {
        schema::init_schema(&pool).await?;
        Ok(Self {
            pool,
            owner: Arc::from(owner.into()),
            client_message_ttl: DEFAULT_CLIENT_MESSAGE_TTL,
            signals: Arc::new(Signals::default()),
        })
    }

    /// Override how many times a client message may be leased
    pub fn with_client_message_ttl(mut self, ttl: u32) -> Self {
        self.client_message_ttl = ttl;
        self
    }

    /// Same database and wakeup signals, different lease owner.
    ///
    /// Lets several workers in one process share a pool while leasing under
    /// distinct identities.
    pub fn with_owner(&self, owner: impl Into<String>) -> Self {
        Self {
            pool: self.pool.clone(),
            owner: Arc::from(owner.into()),
            client_message_ttl: self.client_message_ttl,
            signals: Arc::clone(&self.signals),
        }
    }

    /// Lease owner of this handle
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Leases a client message survives before it is dropped
    pub fn client_message_ttl(&self) -> u32 {
        self.client_message_ttl
    }

    /// Underlying connection pool.
    ///
    /// Writes that must observe a consistent ledger go through the `Store`
    /// methods instead, which take the write lock up front.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn signals(&self) -> &Signals {
        &self.signals
    }

    /// Begin a transaction holding the database write lock from its first
    /// statement, so read-then-write sequences never race another writer.
    pub(crate) async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }
}

/// Timestamps are stored as microseconds since the epoch
pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::corrupt(format!("timestamp out of range: {micros}")))
}

pub(crate) fn opt_from_micros(micros: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    micros.map(from_micros).transpose()
}

/// `now + lease`, saturating on absurd lease lengths
pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    let micros = i64::try_from(lease.as_micros()).unwrap_or(i64::MAX);
    now.checked_add_signed(chrono::Duration::microseconds(micros))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Request and response ids are u64 in the API and INTEGER in SQLite
pub(crate) fn db_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(|_| Error::InvalidId(format!("id {id} exceeds storage range")))
}

pub(crate) fn from_db_id(id: i64) -> Result<u64> {
    u64::try_from(id).map_err(|_| Error::corrupt(format!("negative id in store: {id}")))
}
