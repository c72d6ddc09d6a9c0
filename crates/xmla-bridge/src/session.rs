//! Session validity tracking
//!
//! Every pooled connection carries a [`SessionRecord`] for its whole life:
//! the record is created when the connection is opened and dropped with it.
//! [`SessionTracker`] derives validity from the record's age using two
//! thresholds:
//!
//! - checkout threshold (longer): a connection older than this is never
//!   handed out
//! - checkin threshold (shorter): a connection older than this is retired
//!   when it comes back, so it cannot expire in the hands of the next caller

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Source of the current time for session age checks
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

/// Session metadata owned by exactly one live connection
pub struct SessionRecord {
    session_id: String,
    started_at: Instant,
    credential_expires_at: Option<Instant>,
    live: Arc<AtomicUsize>,
}

impl SessionRecord {
    /// Server session identifier
    #[inline]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// When the session began
    #[inline]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// When the credential behind the session expires, if known
    #[inline]
    pub fn credential_expires_at(&self) -> Option<Instant> {
        self.credential_expires_at
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("session_id", &self.session_id)
            .field("started_at", &self.started_at)
            .field("credential_expires_at", &self.credential_expires_at)
            .finish()
    }
}

impl Drop for SessionRecord {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Issues session records and judges their validity
#[derive(Debug, Clone)]
pub struct SessionTracker {
    clock: Arc<dyn Clock>,
    checkout_threshold: Duration,
    checkin_threshold: Duration,
    live: Arc<AtomicUsize>,
}

impl SessionTracker {
    /// Create a tracker.
    ///
    /// The checkout threshold must be strictly longer than the checkin
    /// threshold.
    pub fn new(
        checkout_threshold: Duration,
        checkin_threshold: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if checkin_threshold.is_zero() {
            return Err(Error::config("checkin_threshold must be greater than zero"));
        }
        if checkout_threshold <= checkin_threshold {
            return Err(Error::config(format!(
                "checkout_threshold ({:?}) must be longer than checkin_threshold ({:?})",
                checkout_threshold, checkin_threshold
            )));
        }
        Ok(Self {
            clock,
            checkout_threshold,
            checkin_threshold,
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Start tracking a freshly opened session
    pub fn begin(
        &self,
        session_id: impl Into<String>,
        credential_lifetime: Option<Duration>,
    ) -> SessionRecord {
        let now = self.clock.now();
        self.live.fetch_add(1, Ordering::AcqRel);
        SessionRecord {
            session_id: session_id.into(),
            started_at: now,
            credential_expires_at: credential_lifetime.map(|d| now + d),
            live: self.live.clone(),
        }
    }

    /// Age of the session
    pub fn age(&self, record: &SessionRecord) -> Duration {
        self.clock.now().saturating_duration_since(record.started_at)
    }

    /// Time left before the session may no longer be checked out
    pub fn remaining(&self, record: &SessionRecord) -> Duration {
        let by_age = self.checkout_threshold.saturating_sub(self.age(record));
        match record.credential_expires_at {
            Some(expiry) => by_age.min(expiry.saturating_duration_since(self.clock.now())),
            None => by_age,
        }
    }

    /// Whether the session may be handed to a caller
    pub fn valid_for_checkout(&self, record: &SessionRecord) -> bool {
        self.is_valid(record, self.checkout_threshold, Duration::ZERO)
    }

    /// Whether the session may go back to the free-list
    pub fn valid_for_checkin(&self, record: &SessionRecord) -> bool {
        self.is_valid(record, self.checkin_threshold, self.margin())
    }

    /// Number of records currently alive
    #[inline]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Checkout threshold
    #[inline]
    pub fn checkout_threshold(&self) -> Duration {
        self.checkout_threshold
    }

    /// Checkin threshold
    #[inline]
    pub fn checkin_threshold(&self) -> Duration {
        self.checkin_threshold
    }

    fn margin(&self) -> Duration {
        self.checkout_threshold - self.checkin_threshold
    }

    fn is_valid(&self, record: &SessionRecord, max_age: Duration, credential_margin: Duration) -> bool {
        let now = self.clock.now();
        if now.saturating_duration_since(record.started_at) > max_age {
            return false;
        }
        match record.credential_expires_at {
            Some(expiry) => expiry.saturating_duration_since(now) > credential_margin,
            None => true,
        }
    }
}
