//! Retrying query execution
//!
//! A [`QueryExecutor`] owns at most one pooled connection, acquired lazily on
//! first use. Connection-class failures are retried on freshly validated
//! connections following a fixed backoff schedule; any other failure is
//! returned as is. When the schedule runs out the poisoned connection is
//! disposed and the executor holds nothing, so the next call starts clean.
//!
//! One executor serves one logical request. It is not meant to be shared.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::RowCursor;
use crate::error::{Error, Result};
use crate::mapping::{ColumnMap, MappedRow};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::stream::{ResultStreamer, StreamSummary};
use crate::types::{Parameter, Query, Row, Value};

/// Backoff schedule for connection failures.
///
/// Each entry is one retry; the delay is waited before the replacement
/// connection is acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delays before each retry
    #[serde(default = "default_backoff", with = "backoff_serde")]
    pub backoff: Vec<Duration>,
}

fn default_backoff() -> Vec<Duration> {
    vec![Duration::from_secs(1), Duration::from_secs(4)]
}

mod backoff_serde {
    use humantime_serde::Serde;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(backoff: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        let wrapped: Vec<Serde<Duration>> = backoff.iter().copied().map(Serde::from).collect();
        wrapped.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
        let wrapped: Vec<Serde<Duration>> = Vec::deserialize(deserializer)?;
        Ok(wrapped.into_iter().map(Serde::into_inner).collect())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: default_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given delays
    pub fn new(backoff: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            backoff: backoff.into_iter().collect(),
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self::new([])
    }

    /// Number of retries after the first attempt
    #[inline]
    pub fn retries(&self) -> u32 {
        self.backoff.len() as u32
    }

    /// Total attempts, including the first
    #[inline]
    pub fn max_attempts(&self) -> u32 {
        self.retries() + 1
    }
}

/// Rows of an executing query.
///
/// Borrows the executor, so its connection stays checked out until the
/// reader is gone.
pub struct QueryReader<'a> {
    cursor: Box<dyn RowCursor>,
    _executor: PhantomData<&'a mut QueryExecutor>,
}

impl QueryReader<'_> {
    /// Read every row, then close the cursor
    pub async fn collect(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        let read = async {
            while let Some(row) = self.cursor.next().await? {
                rows.push(row);
            }
            Ok::<_, Error>(())
        }
        .await;
        let closed = self.cursor.close().await;
        read.and(closed)?;
        Ok(rows)
    }

    /// Map every row through `map`, then close the cursor.
    ///
    /// Columns are checked against the map before any row is read.
    pub async fn map<T: Default>(mut self, map: &ColumnMap<T>) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let read = async {
            map.check_columns(self.cursor.columns())?;
            while let Some(row) = self.cursor.next().await? {
                items.push(map.map_row(&row)?);
            }
            Ok::<_, Error>(())
        }
        .await;
        let closed = self.cursor.close().await;
        read.and(closed)?;
        Ok(items)
    }
}

#[async_trait]
impl RowCursor for QueryReader<'_> {
    fn columns(&self) -> &[String] {
        self.cursor.columns()
    }

    async fn next(&mut self) -> Result<Option<Row>> {
        self.cursor.next().await
    }

    async fn close(&mut self) -> Result<()> {
        self.cursor.close().await
    }
}

/// Executes queries on a pooled connection, replacing it on connection
/// failures
pub struct QueryExecutor {
    pool: Arc<ConnectionPool>,
    policy: RetryPolicy,
    streamer: ResultStreamer,
    conn: Option<PooledConnection>,
    retries: metrics::Counter,
}

impl QueryExecutor {
    /// Create an executor with the default retry policy
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            policy: RetryPolicy::default(),
            streamer: ResultStreamer::default(),
            conn: None,
            retries: metrics::counter!("xmla_executor_retries_total"),
        }
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the streamer used by `execute_json` and `execute_streaming`
    pub fn with_streamer(mut self, streamer: ResultStreamer) -> Self {
        self.streamer = streamer;
        self
    }

    /// Retry policy in use
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Session of the currently owned connection
    pub fn session_id(&self) -> Option<&str> {
        self.conn.as_ref().map(PooledConnection::session_id)
    }

    /// Create a query parameter.
    ///
    /// Names are given without the `@` marker; a leading marker is rejected.
    pub fn create_parameter(&self, name: &str, value: impl Into<Value>) -> Result<Parameter> {
        Parameter::new(name, value)
    }

    /// Make sure the executor owns a connection with a usable session
    async fn acquire(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            match self.pool.check_session(&conn) {
                Ok(()) => {
                    self.conn = Some(conn);
                    return Ok(());
                }
                Err(e) => {
                    debug!(error = %e, "Replacing owned connection");
                    self.pool.discard(conn).await;
                }
            }
        }
        self.conn = Some(self.pool.checkout().await?);
        Ok(())
    }

    /// Execute a query and return its rows as a reader.
    ///
    /// On a connection failure the connection is disposed, the next backoff
    /// delay is waited, and the query runs again on a validated connection.
    /// Other failures return immediately and keep the connection.
    ///
    /// The connection stays owned by the executor while the query runs, so
    /// a cancelled call keeps it for the next one.
    pub async fn execute_reader(&mut self, query: &Query) -> Result<QueryReader<'_>> {
        let max_attempts = self.policy.max_attempts();
        self.acquire().await?;
        let mut attempt = 1u32;

        loop {
            let Some(conn) = self.conn.as_ref() else {
                return Err(Error::internal("executor has no connection"));
            };
            let error = match conn.execute(query).await {
                Ok(cursor) => {
                    if attempt > 1 {
                        debug!(attempt, session_id = conn.session_id(), "Query succeeded after retry");
                    }
                    return Ok(QueryReader {
                        cursor,
                        _executor: PhantomData,
                    });
                }
                Err(e) if e.is_connection_failure() => e,
                Err(e) => return Err(e),
            };

            let Some(conn) = self.conn.take() else {
                return Err(Error::internal("executor has no connection"));
            };
            let Some(delay) = self.policy.backoff.get(attempt as usize - 1).copied() else {
                warn!(
                    attempts = attempt,
                    session_id = conn.session_id(),
                    error = %error,
                    "Connection failures exhausted retries"
                );
                self.pool.discard(conn).await;
                return Err(Error::retry_exhausted(attempt, error));
            };

            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                session_id = conn.session_id(),
                error = %error,
                "Connection failure executing query; retrying"
            );
            self.retries.increment(1);
            self.pool.discard(conn).await;
            tokio::time::sleep(delay).await;

            self.conn = Some(self.pool.get_validated_connection().await?);
            attempt += 1;
        }
    }

    /// Dispose the owned connection after a connection failure while reading
    async fn release_if_poisoned(&mut self, error: Option<&Error>) {
        if let Some(e) = error {
            if e.is_connection_failure() {
                if let Some(conn) = self.conn.take() {
                    debug!(session_id = conn.session_id(), "Disposing connection that failed mid-read");
                    self.pool.discard(conn).await;
                }
            }
        }
    }

    /// Execute a query and collect all rows
    pub async fn execute_rows(&mut self, query: &Query) -> Result<Vec<Row>> {
        let result = self.execute_reader(query).await?.collect().await;
        self.release_if_poisoned(result.as_ref().err()).await;
        result
    }

    /// Execute a query and map rows through `map`
    pub async fn execute_mapped<T: Default>(
        &mut self,
        query: &Query,
        map: &ColumnMap<T>,
    ) -> Result<Vec<T>> {
        let result = self.execute_reader(query).await?.map(map).await;
        self.release_if_poisoned(result.as_ref().err()).await;
        result
    }

    /// Execute a query and map rows into `T`
    pub async fn execute<T: MappedRow>(&mut self, query: &Query) -> Result<Vec<T>> {
        self.execute_mapped(query, T::column_map()).await
    }

    /// Execute a query and render the result envelope as a string
    pub async fn execute_json(&mut self, query: &Query) -> Result<String> {
        let streamer = self.streamer.clone();
        let result = {
            let mut reader = self.execute_reader(query).await?;
            streamer.to_string(&mut reader).await
        };
        self.release_if_poisoned(result.as_ref().err()).await;
        result
    }

    /// Execute a query and stream the result envelope into `sink`.
    ///
    /// Cancellation is honored while the query is being set up and before
    /// every row.
    pub async fn execute_streaming<W>(
        &mut self,
        query: &Query,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let streamer = self.streamer.clone();
        let result = {
            let mut reader = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                reader = self.execute_reader(query) => reader?,
            };
            streamer.write(&mut reader, sink, cancel).await
        };
        self.release_if_poisoned(result.as_ref().err()).await;
        result
    }

    /// Return the owned connection to the pool
    pub async fn dispose(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn).await;
        }
    }
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("policy", &self.policy)
            .field("session_id", &self.session_id())
            .finish()
    }
}

impl Drop for QueryExecutor {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                handle.spawn(async move {
                    pool.checkin(conn).await;
                });
            }
            Err(_) => drop(conn),
        }
    }
}
