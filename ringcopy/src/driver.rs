//! The narrow interface to the cluster driver.
//!
//! The engine never talks wire protocol: it reads a metadata snapshot,
//! opens sessions against chosen hosts and hands over structured requests.
//! A wire-facing adapter implements these traits on top of a real driver;
//! the `testkit` feature ships an in-memory implementation.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cql::{HostAddr, TableMeta, Value, protect_name};
use crate::ring::{Partitioner, TokenRange};

/// Tunable write consistency, as configured by the host shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    LocalOne,
}

impl FromStr for ConsistencyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ANY" => Ok(Self::Any),
            "ONE" => Ok(Self::One),
            "TWO" => Ok(Self::Two),
            "THREE" => Ok(Self::Three),
            "QUORUM" => Ok(Self::Quorum),
            "ALL" => Ok(Self::All),
            "LOCAL_QUORUM" => Ok(Self::LocalQuorum),
            "EACH_QUORUM" => Ok(Self::EachQuorum),
            "LOCAL_ONE" => Ok(Self::LocalOne),
            other => Err(format!("unknown consistency level {other:?}")),
        }
    }
}

/// Liveness and placement of a single cluster host.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub address: HostAddr,
    pub datacenter: String,
    pub is_up: bool,
}

/// A point-in-time snapshot of cluster metadata.
///
/// `ring` is sorted by token and may be empty when the cluster exposes no
/// token map; consumers must degrade to single-range behavior then.
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    /// The host the shell is connected to; the fallback for everything.
    pub contact_point: HostAddr,
    /// Datacenter of the contact point.
    pub local_dc: String,
    pub partitioner: Partitioner,
    /// `(token, replicas)` per ring slot, sorted by token.
    pub ring: Vec<(i64, Vec<HostAddr>)>,
    pub hosts: HashMap<HostAddr, HostInfo>,
}

/// A paged range scan over one table.
///
/// Carried in structured form so adapters can bind it natively; `cql()`
/// renders the equivalent statement text for logging and text-protocol
/// adapters.
#[derive(Debug, Clone)]
pub struct SelectQuery {
    pub keyspace: String,
    pub table: String,
    /// Projected column names, in output order.
    pub columns: Vec<String>,
    /// Partition-key column names for the `token()` bounds.
    pub partition_key: Vec<String>,
    pub token_range: TokenRange,
    pub consistency: ConsistencyLevel,
    pub page_size: usize,
    /// Per-page timeout.
    pub timeout: Duration,
}

impl SelectQuery {
    /// Render the statement text.
    #[must_use]
    pub fn cql(&self) -> String {
        let cols: Vec<String> = self.columns.iter().map(|c| protect_name(c)).collect();
        let pk: Vec<String> = self.partition_key.iter().map(|c| protect_name(c)).collect();
        let pk = pk.join(", ");
        let mut q = format!(
            "SELECT {} FROM {}.{}",
            cols.join(", "),
            protect_name(&self.keyspace),
            protect_name(&self.table)
        );
        match (self.token_range.begin, self.token_range.end) {
            (Some(b), Some(e)) => {
                q.push_str(&format!(" WHERE token({pk}) > {b} AND token({pk}) <= {e}"));
            }
            (Some(b), None) => q.push_str(&format!(" WHERE token({pk}) > {b}")),
            (None, Some(e)) => q.push_str(&format!(" WHERE token({pk}) <= {e}")),
            (None, None) => {}
        }
        q
    }
}

/// One page of a range scan; `paging_state` is `None` on the final page.
#[derive(Debug, Clone)]
pub struct Page {
    pub rows: Vec<Vec<Value>>,
    pub paging_state: Option<u64>,
}

/// Opaque handle to a server-side prepared statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreparedId(pub u64);

/// How the statements of a batch are grouped server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Unlogged,
    Counter,
}

/// One statement of a batch.
#[derive(Debug, Clone)]
pub enum BatchEntry {
    /// A prepared statement plus its bound values.
    Prepared { id: PreparedId, values: Vec<Value> },
    /// A self-contained statement string.
    Simple { cql: String },
}

/// A batch write routed at a replica group.
///
/// `replicas` is a routing hint: the driver is expected to try these hosts
/// first and only then fall back to a DC-aware round-robin, mirroring a
/// token-aware load-balancing policy without a per-statement ring lookup.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub kind: BatchKind,
    pub consistency: ConsistencyLevel,
    pub keyspace: String,
    pub replicas: Vec<HostAddr>,
    pub entries: Vec<BatchEntry>,
}

/// Driver-level failures, classified for the retry policy.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("read timeout: {0}")]
    ReadTimeout(String),
    #[error("write timeout: {0}")]
    WriteTimeout(String),
    #[error("not enough replicas available: {0}")]
    Unavailable(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Timeout-class errors are retried with exponential backoff.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReadTimeout(_) | Self::WriteTimeout(_))
    }

    /// Taxonomy tag used in error accounting and the error file.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ReadTimeout(_) => "ReadTimeout",
            Self::WriteTimeout(_) => "WriteTimeout",
            Self::Unavailable(_) => "Unavailable",
            Self::Connect(_) => "ConnectError",
            Self::Other(_) => "DriverError",
        }
    }
}

/// A connected session; cheap to share, shut down explicitly.
#[async_trait]
pub trait DriverSession: Send + Sync {
    /// Prepare a statement and return its handle.
    async fn prepare(&self, cql: &str) -> Result<PreparedId, DriverError>;

    /// Fetch one page of a range scan.
    async fn select_page(
        &self,
        query: &SelectQuery,
        paging_state: Option<u64>,
    ) -> Result<Page, DriverError>;

    /// Execute a batch write.
    async fn execute_batch(&self, batch: &BatchRequest) -> Result<(), DriverError>;

    /// Tear down the connection.
    async fn shutdown(&self);
}

/// A handle to the cluster: metadata plus session construction.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// Snapshot the current metadata.
    fn metadata(&self) -> ClusterMetadata;

    /// Table schema lookup.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Other`] for unknown tables.
    fn table_meta(&self, keyspace: &str, table: &str) -> Result<TableMeta, DriverError>;

    /// Open a session. With `whitelist` set the session must connect to
    /// the given hosts only; otherwise they are preferred contact points.
    async fn connect(
        &self,
        hosts: &[HostAddr],
        whitelist: bool,
    ) -> Result<Arc<dyn DriverSession>, DriverError>;
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Any => "ANY",
            Self::One => "ONE",
            Self::Two => "TWO",
            Self::Three => "THREE",
            Self::Quorum => "QUORUM",
            Self::All => "ALL",
            Self::LocalQuorum => "LOCAL_QUORUM",
            Self::EachQuorum => "EACH_QUORUM",
            Self::LocalOne => "LOCAL_ONE",
        };
        f.write_str(s)
    }
}
