//! Session-aware connection pool
//!
//! - Free-list of open connections, each paired with its session record
//! - Checkout skips closed or aged-out sessions and opens replacements
//! - Checkin retires sessions early (shorter threshold) so a connection
//!   never expires in the hands of the next caller
//! - Bounded-concurrency warm-up at construction
//! - Statistics and metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use xmla_bridge::prelude::*;
//!
//! let pool = ConnectionPool::new(options, PoolConfig::default(), Arc::new(MyFactory))?;
//!
//! let conn = pool.checkout().await?;
//! let cursor = conn.execute(&Query::new("EVALUATE Sales")).await?;
//! // ...
//! pool.checkin(conn).await;
//! ```

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionFactory, ConnectionOptions};
use crate::error::{Error, Result};
use crate::session::{Clock, SessionRecord, SessionTracker, SystemClock};
use crate::types::Query;

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of connections checked out at once
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Maximum number of idle connections kept in the free-list
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,

    /// Connections to open at startup
    #[serde(default = "default_warm_up")]
    pub warm_up: usize,

    /// Connections opened concurrently during warm-up
    #[serde(default = "default_warm_up_concurrency")]
    pub warm_up_concurrency: usize,

    /// Maximum time to wait for a connection
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Sessions older than this are never checked out
    #[serde(default = "default_checkout_threshold", with = "humantime_serde")]
    pub checkout_threshold: Duration,

    /// Sessions older than this are retired on checkin
    #[serde(default = "default_checkin_threshold", with = "humantime_serde")]
    pub checkin_threshold: Duration,

    /// No-op command used to prove a connection works
    #[serde(default = "default_validation_query")]
    pub validation_query: String,

    /// Connections tried before `get_validated_connection` gives up
    #[serde(default = "default_validation_attempts")]
    pub validation_attempts: u32,
}

fn default_max_size() -> usize {
    32
}

fn default_max_idle() -> usize {
    10
}

fn default_warm_up() -> usize {
    10
}

fn default_warm_up_concurrency() -> usize {
    4
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_checkout_threshold() -> Duration {
    Duration::from_secs(50 * 60)
}

fn default_checkin_threshold() -> Duration {
    Duration::from_secs(45 * 60)
}

fn default_validation_query() -> String {
    "EVALUATE {1}".to_string()
}

fn default_validation_attempts() -> u32 {
    3
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_idle: default_max_idle(),
            warm_up: default_warm_up(),
            warm_up_concurrency: default_warm_up_concurrency(),
            acquire_timeout: default_acquire_timeout(),
            checkout_threshold: default_checkout_threshold(),
            checkin_threshold: default_checkin_threshold(),
            validation_query: default_validation_query(),
            validation_attempts: default_validation_attempts(),
        }
    }
}

impl PoolConfig {
    /// Set maximum checked-out connections
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set maximum idle connections
    pub fn with_max_idle(mut self, size: usize) -> Self {
        self.max_idle = size;
        self
    }

    /// Set warm-up connection count (0 disables warm-up)
    pub fn with_warm_up(mut self, connections: usize) -> Self {
        self.warm_up = connections;
        self
    }

    /// Set warm-up concurrency
    pub fn with_warm_up_concurrency(mut self, concurrency: usize) -> Self {
        self.warm_up_concurrency = concurrency;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set checkout and checkin thresholds
    pub fn with_session_thresholds(mut self, checkout: Duration, checkin: Duration) -> Self {
        self.checkout_threshold = checkout;
        self.checkin_threshold = checkin;
        self
    }

    /// Set the validation command
    pub fn with_validation_query(mut self, query: impl Into<String>) -> Self {
        self.validation_query = query.into();
        self
    }

    /// Set validation attempts
    pub fn with_validation_attempts(mut self, attempts: u32) -> Self {
        self.validation_attempts = attempts;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("pool max_size must be at least 1"));
        }
        if self.warm_up_concurrency == 0 {
            return Err(Error::config("pool warm_up_concurrency must be at least 1"));
        }
        if self.validation_attempts == 0 {
            return Err(Error::config("pool validation_attempts must be at least 1"));
        }
        if self.validation_query.trim().is_empty() {
            return Err(Error::config("pool validation_query must not be empty"));
        }
        if self.checkout_threshold <= self.checkin_threshold {
            return Err(Error::config(format!(
                "checkout_threshold ({:?}) must be longer than checkin_threshold ({:?})",
                self.checkout_threshold, self.checkin_threshold
            )));
        }
        Ok(())
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections opened
    pub connections_created: u64,
    /// Connections closed and forgotten
    pub connections_disposed: u64,
    /// Successful checkouts
    pub checkouts: u64,
    /// Connections returned to the free-list
    pub checkins: u64,
    /// Connections dropped by checkout filtering
    pub discarded_on_checkout: u64,
    /// Connections retired by checkin filtering
    pub discarded_on_checkin: u64,
    /// Checkouts that timed out waiting
    pub exhausted_count: u64,
    /// Validation commands that failed
    pub validation_failures: u64,
    /// Total wait time for checkouts (in milliseconds)
    pub total_wait_time_ms: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_disposed: AtomicU64,
    pub checkouts: AtomicU64,
    pub checkins: AtomicU64,
    pub discarded_on_checkout: AtomicU64,
    pub discarded_on_checkin: AtomicU64,
    pub exhausted_count: AtomicU64,
    pub validation_failures: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection disposal
    pub fn record_disposed(&self) {
        self.connections_disposed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a checkout
    pub fn record_checkout(&self, wait_time_ms: u64) {
        self.checkouts.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record a connection returned to the free-list
    pub fn record_checkin(&self) {
        self.checkins.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection filtered out on checkout
    pub fn record_discarded_on_checkout(&self) {
        self.discarded_on_checkout.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection retired on checkin
    pub fn record_discarded_on_checkin(&self) {
        self.discarded_on_checkin.fetch_add(1, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record validation failure
    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_disposed: self.connections_disposed.load(Ordering::Relaxed),
            checkouts: self.checkouts.load(Ordering::Relaxed),
            checkins: self.checkins.load(Ordering::Relaxed),
            discarded_on_checkout: self.discarded_on_checkout.load(Ordering::Relaxed),
            discarded_on_checkin: self.discarded_on_checkin.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
        }
    }

    /// Calculate average checkout wait time in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        let checkouts = self.checkouts.load(Ordering::Relaxed);
        if checkouts == 0 {
            0.0
        } else {
            self.total_wait_time_ms.load(Ordering::Relaxed) as f64 / checkouts as f64
        }
    }
}

/// Metric handles for pool activity
#[derive(Clone)]
struct PoolMetrics {
    created: metrics::Counter,
    disposed: metrics::Counter,
    checkouts: metrics::Counter,
    idle: metrics::Gauge,
}

impl PoolMetrics {
    fn new() -> Self {
        Self {
            created: metrics::counter!("xmla_pool_connections_created_total"),
            disposed: metrics::counter!("xmla_pool_connections_disposed_total"),
            checkouts: metrics::counter!("xmla_pool_checkouts_total"),
            idle: metrics::gauge!("xmla_pool_idle_connections"),
        }
    }
}

/// Outcome of the startup warm-up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmUpReport {
    /// Connections the warm-up tried to open
    pub requested: usize,
    /// Connections opened and parked in the free-list
    pub opened: usize,
    /// Connections that failed to open
    pub failed: usize,
    /// Time the warm-up took
    pub elapsed: Duration,
}

/// A connection and the session record that lives and dies with it
struct SessionConnection {
    conn: Box<dyn Connection>,
    session: SessionRecord,
}

/// Close `conn` on a runtime task, so the close survives a dropped caller
fn close_detached(conn: Box<dyn Connection>, session_id: String) -> Option<JoinHandle<()>> {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!(session_id = session_id.as_str(), "No tokio runtime available; connection dropped without close");
        return None;
    };
    Some(handle.spawn(async move {
        if let Err(e) = conn.close().await {
            debug!(session_id = session_id.as_str(), error = %e, "Error closing connection");
        }
    }))
}

/// A connection checked out of the pool.
///
/// Hand it back with [`ConnectionPool::checkin`] or
/// [`ConnectionPool::discard`]. Dropping it instead disposes the connection.
pub struct PooledConnection {
    inner: Option<SessionConnection>,
    permit: Option<OwnedSemaphorePermit>,
    stats: Arc<AtomicPoolStats>,
    disposed: metrics::Counter,
}

impl PooledConnection {
    fn new(
        inner: SessionConnection,
        permit: OwnedSemaphorePermit,
        stats: Arc<AtomicPoolStats>,
        disposed: metrics::Counter,
    ) -> Self {
        Self {
            inner: Some(inner),
            permit: Some(permit),
            stats,
            disposed,
        }
    }

    fn entry(&self) -> &SessionConnection {
        self.inner.as_ref().expect("connection already returned")
    }

    fn into_parts(mut self) -> (SessionConnection, Option<OwnedSemaphorePermit>) {
        let inner = self.inner.take().expect("connection already returned");
        (inner, self.permit.take())
    }

    /// Session metadata of this connection
    pub fn session(&self) -> &SessionRecord {
        &self.entry().session
    }

    /// Server session identifier
    pub fn session_id(&self) -> &str {
        self.entry().session.session_id()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.entry().conn.as_ref()
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("session", &self.inner.as_ref().map(|e| &e.session))
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(entry) = self.inner.take() {
            warn!(
                session_id = entry.session.session_id(),
                "Pooled connection dropped without checkin; disposing"
            );
            self.stats.record_disposed();
            self.disposed.increment(1);
            let SessionConnection { conn, session } = entry;
            let session_id = session.session_id().to_string();
            drop(session);
            close_detached(conn, session_id);
        }
    }
}

/// Pool of session-bound connections
pub struct ConnectionPool {
    options: ConnectionOptions,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    tracker: SessionTracker,
    validation: Query,
    /// Idle connections (LIFO, most recently used first)
    idle: Mutex<Vec<SessionConnection>>,
    /// Limits concurrently checked-out connections
    semaphore: Arc<Semaphore>,
    stats: Arc<AtomicPoolStats>,
    metrics: PoolMetrics,
    shutdown: AtomicBool,
    warm_up: Mutex<Option<JoinHandle<WarmUpReport>>>,
}

impl ConnectionPool {
    /// Create a pool.
    ///
    /// Options and configuration are validated before anything is
    /// connected. When called inside a tokio runtime and `warm_up > 0`,
    /// a background task opens the warm-up connections; this call does not
    /// wait for it.
    pub fn new(
        options: ConnectionOptions,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Arc<Self>> {
        Self::with_clock(options, config, factory, Arc::new(SystemClock))
    }

    /// Create a pool that reads session ages from `clock`
    pub fn with_clock(
        options: ConnectionOptions,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        options.validate_options()?;
        config.validate()?;
        let tracker =
            SessionTracker::new(config.checkout_threshold, config.checkin_threshold, clock)?;

        let pool = Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(Vec::with_capacity(config.max_idle)),
            validation: Query::new(config.validation_query.as_str()),
            options,
            config,
            factory,
            tracker,
            stats: Arc::new(AtomicPoolStats::new()),
            metrics: PoolMetrics::new(),
            shutdown: AtomicBool::new(false),
            warm_up: Mutex::new(None),
        });

        let target = pool
            .config
            .warm_up
            .min(pool.config.max_idle)
            .min(pool.config.max_size);
        if target > 0 {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let task = handle.spawn(pool.clone().run_warm_up(target));
                    *pool.warm_up.lock() = Some(task);
                }
                Err(_) => warn!("No tokio runtime available; skipping connection pool warm-up"),
            }
        }

        Ok(pool)
    }

    async fn run_warm_up(self: Arc<Self>, target: usize) -> WarmUpReport {
        let start = Instant::now();
        info!(connections = target, "Starting connection pool warm-up");

        let results: Vec<Result<PooledConnection>> = stream::iter(0..target)
            .map(|_| self.checkout())
            .buffer_unordered(self.config.warm_up_concurrency)
            .collect()
            .await;

        let mut report = WarmUpReport {
            requested: target,
            ..Default::default()
        };
        for result in results {
            match result {
                Ok(conn) => {
                    report.opened += 1;
                    self.checkin(conn).await;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(error = %e, "Warm-up connection failed");
                }
            }
        }
        report.elapsed = start.elapsed();

        info!(
            opened = report.opened,
            failed = report.failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Completed connection pool warm-up"
        );
        report
    }

    /// Wait for the startup warm-up to finish.
    ///
    /// Returns `None` when no warm-up was started or it was already awaited.
    pub async fn wait_for_warm_up(&self) -> Option<WarmUpReport> {
        let handle = self.warm_up.lock().take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "Warm-up task did not complete");
                None
            }
        }
    }

    /// Open a new connection and start tracking its session
    async fn open(&self) -> Result<SessionConnection> {
        let conn = self.factory.connect(&self.options).await?;
        let session = self
            .tracker
            .begin(conn.session_id(), conn.credential_lifetime());
        self.stats.record_created();
        self.metrics.created.increment(1);
        info!(session_id = session.session_id(), "Opened new pooled connection");
        Ok(SessionConnection { conn, session })
    }

    /// Close a connection; its session record goes with it.
    ///
    /// The disposal is counted up front and the close runs on its own task,
    /// so dropping this future part way still closes the connection.
    async fn dispose(&self, entry: SessionConnection) {
        self.stats.record_disposed();
        self.metrics.disposed.increment(1);

        let SessionConnection { conn, session } = entry;
        let session_id = session.session_id().to_string();
        drop(session);

        if let Some(close) = close_detached(conn, session_id) {
            if let Err(e) = close.await {
                debug!(error = %e, "Connection close task did not complete");
            }
        }
    }

    fn usable_for_checkout(&self, entry: &SessionConnection) -> bool {
        entry.conn.is_open() && self.tracker.valid_for_checkout(&entry.session)
    }

    /// Check out a connection.
    ///
    /// Idle connections whose session is closed or past the checkout
    /// threshold are disposed and skipped; when the free-list runs dry a new
    /// connection is opened. Waits up to `acquire_timeout` when `max_size`
    /// connections are already checked out.
    pub async fn checkout(&self) -> Result<PooledConnection> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let start = Instant::now();

        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            self.stats.record_exhausted();
            Error::PoolExhausted {
                message: format!(
                    "timeout waiting for connection ({}ms)",
                    self.config.acquire_timeout.as_millis()
                ),
            }
        })?
        .map_err(|_| Error::PoolClosed)?;

        let entry = loop {
            let candidate = self.idle.lock().pop();
            match candidate {
                Some(entry) if self.usable_for_checkout(&entry) => break entry,
                Some(entry) => {
                    debug!(
                        session_id = entry.session.session_id(),
                        age_secs = self.tracker.age(&entry.session).as_secs(),
                        open = entry.conn.is_open(),
                        "Discarding stale connection on checkout"
                    );
                    self.stats.record_discarded_on_checkout();
                    self.dispose(entry).await;
                }
                None => {
                    let entry = self.open().await?;
                    if !self.usable_for_checkout(&entry) {
                        self.dispose(entry).await;
                        return Err(Error::connection(
                            "factory returned a connection that is not usable",
                        ));
                    }
                    break entry;
                }
            }
        };
        self.metrics.idle.set(self.idle() as f64);

        self.stats
            .record_checkout(start.elapsed().as_millis() as u64);
        self.metrics.checkouts.increment(1);

        Ok(PooledConnection::new(
            entry,
            permit,
            self.stats.clone(),
            self.metrics.disposed.clone(),
        ))
    }

    /// Return a connection to the pool.
    ///
    /// Closed connections and sessions past the checkin threshold are
    /// disposed instead of reused. Passing `None` only logs.
    pub async fn checkin(&self, conn: impl Into<Option<PooledConnection>>) {
        let Some(conn) = conn.into() else {
            debug!("Checkin called without a connection");
            return;
        };
        let (entry, permit) = conn.into_parts();

        let reject = if self.shutdown.load(Ordering::Acquire) {
            Some("pool closed")
        } else if !entry.conn.is_open() {
            Some("connection closed")
        } else if !self.tracker.valid_for_checkin(&entry.session) {
            Some("session past checkin threshold")
        } else {
            None
        };

        let surplus = match reject {
            Some(reason) => {
                debug!(
                    session_id = entry.session.session_id(),
                    reason, "Retiring connection on checkin"
                );
                self.stats.record_discarded_on_checkin();
                Some(entry)
            }
            None => {
                let mut idle = self.idle.lock();
                if idle.len() < self.config.max_idle {
                    idle.push(entry);
                    self.stats.record_checkin();
                    None
                } else {
                    Some(entry)
                }
            }
        };

        if let Some(entry) = surplus {
            self.dispose(entry).await;
        }
        self.metrics.idle.set(self.idle() as f64);

        // The free-list is updated before a waiter can wake up
        drop(permit);
    }

    /// Dispose a checked-out connection without returning it
    pub async fn discard(&self, conn: PooledConnection) {
        let (entry, permit) = conn.into_parts();
        self.dispose(entry).await;
        drop(permit);
    }

    /// Fail with `SessionExpired` when a checked-out connection's session is
    /// no longer usable
    pub fn check_session(&self, conn: &PooledConnection) -> Result<()> {
        if self.usable_for_checkout(conn.entry()) {
            Ok(())
        } else {
            Err(Error::SessionExpired {
                session_id: conn.session_id().to_string(),
            })
        }
    }

    /// Check out a connection and prove it works with the validation command.
    ///
    /// Connections that fail with a connection-class error are disposed and
    /// replaced, up to `validation_attempts` times.
    pub async fn get_validated_connection(&self) -> Result<PooledConnection> {
        let mut last = None;

        for attempt in 1..=self.config.validation_attempts {
            let conn = self.checkout().await?;
            match self.run_validation(&conn).await {
                Ok(()) => return Ok(conn),
                Err(e) if e.is_connection_failure() => {
                    warn!(
                        attempt,
                        session_id = conn.session_id(),
                        error = %e,
                        "Connection failed validation; replacing"
                    );
                    self.stats.record_validation_failure();
                    self.discard(conn).await;
                    last = Some(e);
                }
                Err(e) => {
                    self.checkin(conn).await;
                    return Err(e);
                }
            }
        }

        Err(Error::retry_exhausted(
            self.config.validation_attempts,
            last.unwrap_or_else(|| Error::connection("no validation attempt was made")),
        ))
    }

    async fn run_validation(&self, conn: &PooledConnection) -> Result<()> {
        let mut cursor = conn.execute(&self.validation).await?;
        let drained = async {
            while cursor.next().await?.is_some() {}
            Ok::<_, Error>(())
        }
        .await;
        let closed = cursor.close().await;
        drained.and(closed)
    }

    /// Close idle connections and refuse further checkouts.
    ///
    /// Connections still checked out are disposed when they come back.
    pub async fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.semaphore.close();

        if let Some(handle) = self.warm_up.lock().take() {
            handle.abort();
        }

        let drained: Vec<SessionConnection> = self.idle.lock().drain(..).collect();
        for entry in drained {
            self.dispose(entry).await;
        }
        self.metrics.idle.set(0.0);
    }

    /// Number of idle connections
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of connections currently checked out
    pub fn in_use(&self) -> usize {
        self.config
            .max_size
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Number of live connections (idle, checked out, or being disposed)
    pub fn size(&self) -> usize {
        self.tracker.live()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Session tracker used by this pool
    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }
}
