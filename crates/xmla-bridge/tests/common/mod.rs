//! In-memory engine backend shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use xmla_bridge::prelude::*;

pub const VALIDATION_QUERY: &str = "EVALUATE {1}";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("xmla_bridge=debug")
        .with_test_writer()
        .try_init();
}

pub fn options() -> ConnectionOptions {
    ConnectionOptions::new("powerbi://api.powerbi.com/v1.0/myorg/Sales", "AdventureWorks")
        .with_service_principal("app-id", "s3cret", "tenant-id")
}

/// Pool config without warm-up, so tests control every connection
pub fn quiet_config() -> PoolConfig {
    PoolConfig::default()
        .with_warm_up(0)
        .with_acquire_timeout(Duration::from_secs(5))
}

pub fn columns(names: &[&str]) -> Arc<[String]> {
    names.iter().map(|n| n.to_string()).collect()
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

/// Shared state of the fake engine
#[derive(Default)]
pub struct MockBackend {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub cursors_opened: AtomicUsize,
    pub cursors_closed: Arc<AtomicUsize>,
    /// Remaining connection failures for data queries
    pub query_failures: AtomicUsize,
    /// Remaining connection failures for validation queries
    pub validation_failures: AtomicUsize,
    /// Remaining failures of `connect`
    pub connect_failures: AtomicUsize,
    /// Next data query fails with a query-content error
    pub query_content_error: AtomicBool,
    pub credential_lifetime: Mutex<Option<Duration>>,
    /// Time each data query takes before answering
    pub query_delay: Mutex<Option<Duration>>,
    /// Time each `close` takes
    pub close_delay: Mutex<Option<Duration>>,
    pub executed: Mutex<Vec<String>>,
    /// Parameters bound to each data query, in execution order
    pub bound: Mutex<Vec<Vec<Parameter>>>,
    result: Mutex<Option<(Arc<[String]>, Vec<Vec<Value>>)>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_result(&self, columns: &[&str], rows: Vec<Vec<Value>>) {
        *self.result.lock() = Some((self::columns(columns), rows));
    }

    pub fn fail_queries(&self, times: usize) {
        self.query_failures.store(times, Ordering::Release);
    }

    pub fn fail_validations(&self, times: usize) {
        self.validation_failures.store(times, Ordering::Release);
    }

    pub fn fail_connects(&self, times: usize) {
        self.connect_failures.store(times, Ordering::Release);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::Acquire)
    }

    pub fn data_queries(&self) -> usize {
        self.executed
            .lock()
            .iter()
            .filter(|q| q.as_str() != VALIDATION_QUERY)
            .count()
    }

    pub fn validation_queries(&self) -> usize {
        self.executed
            .lock()
            .iter()
            .filter(|q| q.as_str() == VALIDATION_QUERY)
            .count()
    }

    fn cursor(&self) -> TestCursor {
        let (columns, rows) = self
            .result
            .lock()
            .clone()
            .unwrap_or_else(|| (columns(&["[Value]"]), vec![vec![Value::Int64(1)]]));
        self.cursors_opened.fetch_add(1, Ordering::AcqRel);
        TestCursor::new(columns, rows).with_close_counter(self.cursors_closed.clone())
    }
}

pub struct MockConnection {
    session_id: String,
    open: AtomicBool,
    backend: Arc<MockBackend>,
}

#[async_trait]
impl Connection for MockConnection {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn credential_lifetime(&self) -> Option<Duration> {
        *self.backend.credential_lifetime.lock()
    }

    async fn execute(&self, query: &Query) -> xmla_bridge::Result<Box<dyn RowCursor>> {
        if !self.is_open() {
            return Err(Error::connection("connection is closed"));
        }
        self.backend.executed.lock().push(query.text().to_string());

        if query.text() == VALIDATION_QUERY {
            if take_one(&self.backend.validation_failures) {
                return Err(Error::connection("validation: transport reset"));
            }
            return Ok(Box::new(TestCursor::new(
                columns(&["[Value]"]),
                vec![vec![Value::Int64(1)]],
            )));
        }

        self.backend.bound.lock().push(query.parameters().to_vec());
        let delay = *self.backend.query_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if take_one(&self.backend.query_failures) {
            return Err(Error::connection("transport reset"));
        }
        if self.backend.query_content_error.swap(false, Ordering::AcqRel) {
            return Err(Error::query("Query (1, 10) The syntax for 'EVALUATEE' is incorrect."));
        }
        Ok(Box::new(self.backend.cursor()))
    }

    async fn close(&self) -> xmla_bridge::Result<()> {
        let delay = *self.backend.close_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.open.swap(false, Ordering::AcqRel) {
            self.backend.closed.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

pub struct MockFactory {
    backend: Arc<MockBackend>,
    next_session: AtomicUsize,
}

impl MockFactory {
    pub fn new(backend: Arc<MockBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            next_session: AtomicUsize::new(1),
        })
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> xmla_bridge::Result<Box<dyn Connection>> {
        assert!(options.validate_options().is_ok());
        if take_one(&self.backend.connect_failures) {
            return Err(Error::connection("connection refused"));
        }
        self.backend.opened.fetch_add(1, Ordering::AcqRel);
        let n = self.next_session.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MockConnection {
            session_id: format!("session-{}", n),
            open: AtomicBool::new(true),
            backend: self.backend.clone(),
        }))
    }
}

/// Cursor over fixed rows with a close counter and an optional
/// cancellation trigger
pub struct TestCursor {
    columns: Arc<[String]>,
    rows: VecDeque<Row>,
    delivered: usize,
    closed: bool,
    close_counter: Option<Arc<AtomicUsize>>,
    cancel_at: Option<(usize, CancellationToken)>,
}

impl TestCursor {
    pub fn new(columns: Arc<[String]>, rows: Vec<Vec<Value>>) -> Self {
        let rows = rows
            .into_iter()
            .map(|values| Row::new(columns.clone(), values).unwrap())
            .collect();
        Self {
            columns,
            rows,
            delivered: 0,
            closed: false,
            close_counter: None,
            cancel_at: None,
        }
    }

    pub fn with_close_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.close_counter = Some(counter);
        self
    }

    /// After `rows` rows were delivered, cancel `token` and stall
    pub fn cancel_after(mut self, rows: usize, token: CancellationToken) -> Self {
        self.cancel_at = Some((rows, token));
        self
    }
}

#[async_trait]
impl RowCursor for TestCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next(&mut self) -> xmla_bridge::Result<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        if let Some((at, token)) = &self.cancel_at {
            if self.delivered == *at {
                token.cancel();
                std::future::pending::<()>().await;
            }
        }
        let row = self.rows.pop_front();
        if row.is_some() {
            self.delivered += 1;
        }
        Ok(row)
    }

    async fn close(&mut self) -> xmla_bridge::Result<()> {
        if !self.closed {
            self.closed = true;
            if let Some(counter) = &self.close_counter {
                counter.fetch_add(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }
}
