//! Connection traits for xmla-bridge
//!
//! The remote engine client is an external component. This module defines
//! the surface the pool and executor need from it:
//! - Connection: an opened session that executes commands
//! - RowCursor: forward-only, single-pass row iteration
//! - ConnectionFactory: opens connections from validated `ConnectionOptions`

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

use crate::error::{Error, Result};
use crate::types::{Query, Row};

/// A session-bound connection to the remote engine
#[async_trait]
pub trait Connection: Send + Sync {
    /// Server-assigned session identifier
    fn session_id(&self) -> &str;

    /// Whether the connection is still open
    fn is_open(&self) -> bool;

    /// Time left before the credential this session was opened with expires,
    /// when the engine reports it
    fn credential_lifetime(&self) -> Option<Duration> {
        None
    }

    /// Build a command from the query text and parameters and execute it
    async fn execute(&self, query: &Query) -> Result<Box<dyn RowCursor>>;

    /// Close the connection and end its session
    async fn close(&self) -> Result<()>;
}

/// Forward-only row cursor
#[async_trait]
pub trait RowCursor: Send {
    /// Column names in response order
    fn columns(&self) -> &[String];

    /// Get the next row, `None` once exhausted
    async fn next(&mut self) -> Result<Option<Row>>;

    /// Release the cursor; further `next` calls return `None`
    async fn close(&mut self) -> Result<()>;
}

/// Factory for opening connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection. The returned connection is already open.
    async fn connect(&self, options: &ConnectionOptions) -> Result<Box<dyn Connection>>;
}

/// Row cursor over an already materialized result set.
///
/// Some engine clients hand back whole result sets; this adapter yields
/// their rows one by one so they can flow through the same streaming path.
pub struct VecCursor {
    columns: Arc<[String]>,
    rows: std::vec::IntoIter<Row>,
    closed: bool,
}

impl VecCursor {
    /// Create a cursor over `rows`, all of which share `columns`
    pub fn new(columns: Arc<[String]>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
            closed: false,
        }
    }

    /// A cursor with columns but no rows
    pub fn empty(columns: Arc<[String]>) -> Self {
        Self::new(columns, Vec::new())
    }
}

#[async_trait]
impl RowCursor for VecCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.rows.next())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Wrapper for sensitive configuration values
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    /// Expose the secret for use in a connection string
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***REDACTED***")
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// How the bridge identifies itself to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMode {
    /// Client id / secret / tenant (service principal)
    #[default]
    ServicePrincipal,
    /// Ambient identity of the host; no credential fields needed
    ManagedIdentity,
}

/// Endpoint, catalog and credential settings for opening connections
#[derive(Clone, Default, Serialize, Deserialize, Validate)]
pub struct ConnectionOptions {
    /// Absolute endpoint URI (e.g. `powerbi://api.powerbi.com/v1.0/myorg/Sales`)
    #[validate(length(min = 1, message = "endpoint is required"))]
    pub endpoint: String,

    /// Catalog / dataset name
    #[validate(length(min = 1, message = "dataset_name is required"))]
    pub dataset_name: String,

    /// Application (client) id
    #[serde(default)]
    pub client_id: Option<String>,

    /// Client secret
    #[serde(default)]
    pub client_secret: Option<SensitiveString>,

    /// Directory tenant id
    #[serde(default)]
    pub tenant_id: Option<String>,

    /// Identity mode
    #[serde(default)]
    pub identity: IdentityMode,

    /// User to impersonate for row-level security
    #[serde(default)]
    pub effective_user_name: Option<String>,
}

impl std::fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("endpoint", &self.endpoint)
            .field("dataset_name", &self.dataset_name)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("tenant_id", &self.tenant_id)
            .field("identity", &self.identity)
            .field("effective_user_name", &self.effective_user_name)
            .finish()
    }
}

impl ConnectionOptions {
    /// Create options for an endpoint and dataset
    pub fn new(endpoint: impl Into<String>, dataset_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            dataset_name: dataset_name.into(),
            ..Default::default()
        }
    }

    /// Set service principal credentials
    pub fn with_service_principal(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<SensitiveString>,
        tenant_id: impl Into<String>,
    ) -> Self {
        self.identity = IdentityMode::ServicePrincipal;
        self.client_id = Some(client_id.into());
        self.client_secret = Some(client_secret.into());
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Use the managed identity of the host
    pub fn with_managed_identity(mut self) -> Self {
        self.identity = IdentityMode::ManagedIdentity;
        self
    }

    /// Set the effective user name
    pub fn with_effective_user(mut self, user: impl Into<String>) -> Self {
        self.effective_user_name = Some(user.into());
        self
    }

    /// Validate the options.
    ///
    /// Any failure here is a configuration error; nothing has been
    /// connected yet.
    pub fn validate_options(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("invalid connection options: {}", e)))?;

        let endpoint = url::Url::parse(&self.endpoint).map_err(|e| {
            Error::config(format!(
                "endpoint '{}' must be an absolute URI: {}",
                self.endpoint, e
            ))
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::config(format!(
                "endpoint '{}' must be a hierarchical URI",
                self.endpoint
            )));
        }

        if self.identity == IdentityMode::ServicePrincipal {
            let missing: Vec<&str> = [
                ("client_id", self.client_id.as_deref().is_none_or(str::is_empty)),
                (
                    "client_secret",
                    self.client_secret
                        .as_ref()
                        .is_none_or(|s| s.expose_secret().is_empty()),
                ),
                ("tenant_id", self.tenant_id.as_deref().is_none_or(str::is_empty)),
            ]
            .into_iter()
            .filter_map(|(name, absent)| absent.then_some(name))
            .collect();

            if !missing.is_empty() {
                return Err(Error::config(format!(
                    "{} required unless identity is managed_identity",
                    missing.join(", ")
                )));
            }
        }

        Ok(())
    }

    /// Build the engine connection string.
    ///
    /// Contains the client secret; never log the result.
    pub fn connection_string(&self) -> String {
        let mut parts = vec![format!("Data Source={}", self.endpoint)];

        if self.identity == IdentityMode::ServicePrincipal {
            parts.push(format!(
                "User Id=app:{}@{}",
                self.client_id.as_deref().unwrap_or_default(),
                self.tenant_id.as_deref().unwrap_or_default()
            ));
            parts.push(format!(
                "Password={}",
                self.client_secret
                    .as_ref()
                    .map(SensitiveString::expose_secret)
                    .unwrap_or_default()
            ));
        }

        parts.push(format!("Catalog={}", self.dataset_name));

        if let Some(user) = &self.effective_user_name {
            parts.push(format!("EffectiveUserName={}", user));
        }

        parts.join(";")
    }
}
