/// Collaborator boundary between the adapter and a cluster client.
///
/// The adapter only ever talks to these traits. `crate::redis` implements them
/// on top of the `redis` crate; tests use an in-memory cluster.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ClientError;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Per-connection library option identifiers.
pub mod lib_option {
    pub const SERIALIZER: i64 = 1;
    pub const PREFIX: i64 = 2;
    pub const READ_TIMEOUT: i64 = 3;
    pub const SCAN: i64 = 4;
    pub const SLAVE_FAILOVER: i64 = 5;

    /// Every option identifier a connection understands.
    pub const KNOWN_OPTIONS: &[i64] = &[SERIALIZER, PREFIX, READ_TIMEOUT, SCAN, SLAVE_FAILOVER];

    pub const SERIALIZER_NONE: &str = "0";
    pub const SERIALIZER_JSON: &str = "4";
}

/// Everything needed to open a cluster connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub seeds: Vec<String>,
    pub timeout: Duration,
    pub read_timeout: Duration,
    pub persistent: bool,
}

/// Host and port of a cluster master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterAddress {
    pub host: String,
    pub port: u16,
}

/// Factory for cluster-aware connections and direct node connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> ClientResult<Arc<dyn ClusterConnection>>;

    /// Open a plain (non cluster-aware) connection to a single node.
    async fn connect_node(
        &self,
        address: &MasterAddress,
        timeout: Duration,
    ) -> ClientResult<Box<dyn NodeConnection>>;
}

/// A live cluster connection.
///
/// Reads return `Value::Bool(false)` for a missing key, mirroring the client
/// libraries this adapter grew up with. Writes return the server acknowledgment.
#[async_trait]
pub trait ClusterConnection: Send + Sync {
    async fn get(&self, key: &str) -> ClientResult<Value>;

    /// Positional results, one per requested key.
    async fn mget(&self, keys: &[String]) -> ClientResult<Vec<Value>>;

    async fn set(&self, key: &str, value: &Value) -> ClientResult<bool>;

    async fn set_ex(&self, key: &str, ttl_secs: u64, value: &Value) -> ClientResult<bool>;

    /// Number of keys actually deleted.
    async fn del(&self, keys: &[String]) -> ClientResult<u64>;

    /// Number of the given keys that exist.
    async fn exists(&self, key: &str) -> ClientResult<u64>;

    async fn keys(&self, pattern: &str) -> ClientResult<Vec<String>>;

    /// `INFO` against the given node addresses (or node group name).
    async fn info(&self, target: &[String]) -> ClientResult<Vec<(String, String)>>;

    async fn masters(&self) -> ClientResult<Vec<MasterAddress>>;

    async fn get_option(&self, option: i64) -> ClientResult<String>;

    async fn set_option(&self, option: i64, value: &str) -> ClientResult<()>;

    /// Last error message reported by the cluster, if any.
    fn last_error(&self) -> Option<String>;
}

/// A direct connection to one node, used by flush.
#[async_trait]
pub trait NodeConnection: Send {
    async fn flush_db(&mut self) -> ClientResult<bool>;
}

/// Escape glob metacharacters so `raw` matches literally in a `KEYS` pattern.
pub fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
