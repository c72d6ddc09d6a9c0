//! # xmla-bridge
//!
//! Query plumbing for XMLA analytical engines (Analysis Services, Power BI
//! datasets) behind a web API.
//!
//! ## Features
//!
//! - **Session-Aware Pooling**: Connections are retired before their server
//!   session expires, with a startup warm-up
//! - **Retrying Execution**: Connection failures are retried on fresh,
//!   validated connections with a fixed backoff
//! - **Streaming JSON**: Results are written row by row into a fixed
//!   response envelope, with per-row cancellation
//! - **Declared Mapping**: Result columns bind to struct fields through
//!   static column maps
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use xmla_bridge::prelude::*;
//!
//! let options = ConnectionOptions::new("powerbi://api.powerbi.com/v1.0/myorg/Sales", "AdventureWorks")
//!     .with_service_principal(client_id, client_secret, tenant_id);
//! let pool = ConnectionPool::new(options, PoolConfig::default(), Arc::new(factory))?;
//!
//! let mut executor = QueryExecutor::new(pool.clone());
//! let query = Query::new("EVALUATE FILTER(Sales, Sales[Year] = @Year)")
//!     .bind(executor.create_parameter("Year", 2024)?);
//!
//! executor
//!     .execute_streaming(&query, &mut response_body, &cancel)
//!     .await?;
//! executor.dispose().await;
//! ```
//!
//! The engine client itself is plugged in through [`ConnectionFactory`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod mapping;
pub mod pool;
pub mod session;
pub mod stream;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Value and type system
    pub use crate::types::{Parameter, Query, Row, Value, PARAMETER_MARKER};

    // Connection traits and options
    pub use crate::connection::{
        Connection, ConnectionFactory, ConnectionOptions, IdentityMode, RowCursor,
        SensitiveString, VecCursor,
    };

    // Session tracking
    pub use crate::session::{Clock, ManualClock, SessionRecord, SessionTracker, SystemClock};

    // Pool types
    pub use crate::pool::{
        AtomicPoolStats, ConnectionPool, PoolConfig, PoolStats, PooledConnection, WarmUpReport,
    };

    // Execution
    pub use crate::executor::{QueryExecutor, QueryReader, RetryPolicy};

    // Streaming
    pub use crate::stream::{ResultStreamer, StreamOptions, StreamSummary, TextEncoding};

    // Mapping
    pub use crate::mapping::{ColumnMap, FromValue, MappedRow, Setter};

    pub use crate::config::BridgeConfig;

    pub use tokio_util::sync::CancellationToken;
}

// Re-export commonly used items at crate root
pub use connection::{Connection, ConnectionFactory};
pub use error::{Error, Result};
pub use types::Value;
