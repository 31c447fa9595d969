//! Connection seam between device integrations and their native transport.
//!
//! The transport itself (RPC framing, serialization) is owned by whoever
//! implements [`Connection`]. Integrations only issue named calls with JSON
//! parameters and interpret the JSON reply.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{AppResult, ServiceError};

/// Upper bound for the reachability check that precedes any status query.
pub const REACHABILITY_CHECK_CAP: Duration = Duration::from_secs(1);

/// Wire serialization requested from the device transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Serialization {
    #[default]
    #[serde(alias = "j")]
    Json,
    #[serde(alias = "pkl", alias = "p")]
    Pickle,
}

/// Network address of a device service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub serialization: Serialization,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(10),
            serialization: Serialization::Json,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_serialization(mut self, serialization: Serialization) -> Self {
        self.serialization = serialization;
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A live handle to a device service.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Cheap liveness attribute of the remote service, in seconds.
    async fn uptime(&self) -> AppResult<f64>;

    /// Invokes a named remote operation.
    async fn call(&self, method: &str, params: Value) -> AppResult<Value>;
}

/// Creates connection handles for endpoints.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> AppResult<Arc<dyn Connection>>;

    /// Network reachability check, bounded by [`REACHABILITY_CHECK_CAP`].
    async fn is_reachable(&self, endpoint: &Endpoint) -> bool {
        tcp_reachable(endpoint, REACHABILITY_CHECK_CAP).await
    }
}

/// Attempts a TCP connection to the endpoint within `cap`.
pub async fn tcp_reachable(endpoint: &Endpoint, cap: Duration) -> bool {
    let cap = cap.min(endpoint.timeout);
    match tokio::time::timeout(cap, TcpStream::connect((endpoint.host.as_str(), endpoint.port)))
        .await
    {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => {
            debug!(%endpoint, error = %err, "Reachability check failed");
            false
        }
        Err(_) => {
            debug!(%endpoint, "Reachability check timed out");
            false
        }
    }
}

/// Lazily memoized connection for one device.
///
/// The handle is created on first use and reused until [`ConnectionSlot::reset`]
/// tears it down.
pub struct ConnectionSlot {
    endpoint: Endpoint,
    factory: Arc<dyn ConnectionFactory>,
    handle: Option<Arc<dyn Connection>>,
}

impl ConnectionSlot {
    pub fn new(endpoint: Endpoint, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            endpoint,
            factory,
            handle: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Returns the memoized handle, creating it if needed.
    pub fn get(&mut self) -> AppResult<Arc<dyn Connection>> {
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }
        debug!(endpoint = %self.endpoint, "Creating connection");
        let handle = self.factory.connect(&self.endpoint).map_err(|err| match err {
            ServiceError::Connectivity(_) => err,
            other => ServiceError::Connectivity(format!(
                "failed to connect to {}: {other}",
                self.endpoint
            )),
        })?;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Drops the memoized handle.
    pub fn reset(&mut self) {
        if self.handle.take().is_some() {
            debug!(endpoint = %self.endpoint, "Connection torn down");
        }
    }

    /// Tears down any existing handle and creates a fresh one.
    pub fn reconnect(&mut self) -> AppResult<Arc<dyn Connection>> {
        self.reset();
        self.get()
    }

    pub async fn is_reachable(&self) -> bool {
        self.factory.is_reachable(&self.endpoint).await
    }
}

impl fmt::Debug for ConnectionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSlot")
            .field("endpoint", &self.endpoint)
            .field("open", &self.handle.is_some())
            .finish()
    }
}
