/// Cluster client backed by the `redis` crate.
///
/// Library options live client side: `SERIALIZER` selects how values are
/// encoded (plain strings or JSON) and `PREFIX` is prepended to every key.
/// A missing key reads back as `Value::Bool(false)`.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection as AsyncClusterConnection;
use redis::{AsyncCommands, RedisResult};
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::{
    escape_glob, lib_option, ClientResult, ClusterConnection, ConnectParams, Connector, MasterAddress,
    NodeConnection,
};
use crate::error::ClientError;

#[derive(Debug, Clone, Copy, Default)]
pub struct RedisConnector;

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self, params: &ConnectParams) -> ClientResult<Arc<dyn ClusterConnection>> {
        let nodes: Vec<String> = params.seeds.iter().map(|seed| node_url(seed)).collect();
        let client = ClusterClientBuilder::new(nodes)
            .connection_timeout(params.timeout)
            .response_timeout(params.read_timeout)
            .build()?;
        let connection = client.get_async_connection().await?;

        if params.persistent {
            debug!("persistent flag set, the multiplexed cluster connection is reused for the adapter lifetime");
        }
        debug!(seeds = params.seeds.len(), "redis cluster connected");

        Ok(Arc::new(RedisClusterConnection::new(connection, params)))
    }

    async fn connect_node(
        &self,
        address: &MasterAddress,
        timeout: Duration,
    ) -> ClientResult<Box<dyn NodeConnection>> {
        let connection = open_node(address, timeout).await?;
        Ok(Box::new(RedisNode { connection }))
    }
}

async fn open_node(address: &MasterAddress, timeout: Duration) -> ClientResult<MultiplexedConnection> {
    let client = redis::Client::open(node_url(&format!("{}:{}", address.host, address.port)))?;
    let connection = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
        .await
        .map_err(|_| {
            ClientError::new(format!(
                "timed out connecting to {}:{}",
                address.host, address.port
            ))
        })??;
    Ok(connection)
}

fn node_url(seed: &str) -> String {
    if seed.starts_with("redis://") || seed.starts_with("rediss://") {
        seed.to_string()
    } else {
        format!("redis://{seed}")
    }
}

pub struct RedisClusterConnection {
    connection: AsyncClusterConnection,
    timeout: Duration,
    options: Mutex<BTreeMap<i64, String>>,
    last_error: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RedisClusterConnection {
    fn new(connection: AsyncClusterConnection, params: &ConnectParams) -> Self {
        let options = BTreeMap::from([
            (lib_option::SERIALIZER, lib_option::SERIALIZER_NONE.to_string()),
            (lib_option::PREFIX, String::new()),
            (
                lib_option::READ_TIMEOUT,
                params.read_timeout.as_secs_f64().to_string(),
            ),
            (lib_option::SCAN, "0".to_string()),
            (lib_option::SLAVE_FAILOVER, "0".to_string()),
        ]);

        Self {
            connection,
            timeout: params.timeout,
            options: Mutex::new(options),
            last_error: Mutex::new(None),
        }
    }

    fn conn(&self) -> AsyncClusterConnection {
        self.connection.clone()
    }

    /// Remember the error message so callers can report it.
    fn record<T>(&self, result: RedisResult<T>) -> ClientResult<T> {
        result.map_err(|err| self.fail(err.into()))
    }

    fn fail(&self, err: ClientError) -> ClientError {
        *lock(&self.last_error) = Some(err.message().to_string());
        err
    }

    fn option(&self, option: i64) -> String {
        lock(&self.options).get(&option).cloned().unwrap_or_default()
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{key}", self.option(lib_option::PREFIX))
    }

    fn encode(&self, value: &Value) -> ClientResult<String> {
        encode(&self.option(lib_option::SERIALIZER), value).map_err(|e| self.fail(e))
    }

    fn decode(&self, raw: Option<String>) -> Value {
        decode(&self.option(lib_option::SERIALIZER), raw)
    }

    async fn node_info(&self, address: &MasterAddress) -> ClientResult<Vec<(String, String)>> {
        let mut connection = open_node(address, self.timeout).await?;
        let raw: String = redis::cmd("INFO")
            .arg("server")
            .query_async(&mut connection)
            .await?;
        Ok(parse_info(&raw))
    }
}

#[async_trait]
impl ClusterConnection for RedisClusterConnection {
    async fn get(&self, key: &str) -> ClientResult<Value> {
        let mut conn = self.conn();
        let raw: Option<String> = self.record(conn.get(self.prefixed(key)).await)?;
        Ok(self.decode(raw))
    }

    async fn mget(&self, keys: &[String]) -> ClientResult<Vec<Value>> {
        let mut conn = self.conn();
        let prefixed: Vec<String> = keys.iter().map(|key| self.prefixed(key)).collect();
        let raw: Vec<Option<String>> = self.record(
            redis::cmd("MGET")
                .arg(&prefixed)
                .query_async(&mut conn)
                .await,
        )?;
        Ok(raw.into_iter().map(|value| self.decode(value)).collect())
    }

    async fn set(&self, key: &str, value: &Value) -> ClientResult<bool> {
        let encoded = self.encode(value)?;
        let mut conn = self.conn();
        self.record(conn.set::<_, _, ()>(self.prefixed(key), encoded).await)?;
        Ok(true)
    }

    async fn set_ex(&self, key: &str, ttl_secs: u64, value: &Value) -> ClientResult<bool> {
        let encoded = self.encode(value)?;
        let mut conn = self.conn();
        self.record(
            conn.set_ex::<_, _, ()>(self.prefixed(key), encoded, ttl_secs)
                .await,
        )?;
        Ok(true)
    }

    async fn del(&self, keys: &[String]) -> ClientResult<u64> {
        let mut conn = self.conn();
        let prefixed: Vec<String> = keys.iter().map(|key| self.prefixed(key)).collect();
        let deleted: u64 = self.record(
            redis::cmd("DEL")
                .arg(&prefixed)
                .query_async(&mut conn)
                .await,
        )?;
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> ClientResult<u64> {
        let mut conn = self.conn();
        let exists: u64 = self.record(conn.exists(self.prefixed(key)).await)?;
        Ok(exists)
    }

    async fn keys(&self, pattern: &str) -> ClientResult<Vec<String>> {
        let mut conn = self.conn();
        let prefix = self.option(lib_option::PREFIX);
        let found: Vec<String> = self.record(conn.keys(prefixed_pattern(&prefix, pattern)).await)?;

        // Hand back keys as callers name them, without the library prefix.
        Ok(found
            .into_iter()
            .map(|key| {
                if !prefix.is_empty() && key.starts_with(&prefix) {
                    key[prefix.len()..].to_string()
                } else {
                    key
                }
            })
            .collect())
    }

    async fn info(&self, target: &[String]) -> ClientResult<Vec<(String, String)>> {
        let mut last_err = None;
        for seed in target {
            let Some(address) = parse_address(seed) else {
                warn!(seed = %seed, "ignoring malformed seed for INFO");
                continue;
            };

            match self.node_info(&address).await {
                Ok(info) => return Ok(info),
                Err(err) => {
                    warn!(seed = %seed, error = %err, "INFO failed, trying next seed");
                    last_err = Some(err);
                }
            }
        }

        let err = last_err.unwrap_or_else(|| ClientError::new("no seed available to run INFO against"));
        Err(self.fail(err))
    }

    async fn masters(&self) -> ClientResult<Vec<MasterAddress>> {
        let mut conn = self.conn();
        let raw: String = self.record(
            redis::cmd("CLUSTER")
                .arg("NODES")
                .query_async(&mut conn)
                .await,
        )?;
        Ok(parse_cluster_nodes(&raw))
    }

    async fn get_option(&self, option: i64) -> ClientResult<String> {
        let value = lock(&self.options).get(&option).cloned();
        value.ok_or_else(|| self.fail(ClientError::new(format!("unknown library option {option}"))))
    }

    async fn set_option(&self, option: i64, value: &str) -> ClientResult<()> {
        if !lib_option::KNOWN_OPTIONS.contains(&option) {
            return Err(self.fail(ClientError::new(format!(
                "unknown library option {option}"
            ))));
        }

        if option == lib_option::SERIALIZER
            && value != lib_option::SERIALIZER_NONE
            && value != lib_option::SERIALIZER_JSON
        {
            return Err(self.fail(ClientError::new(format!(
                "unsupported serializer {value}"
            ))));
        }

        lock(&self.options).insert(option, value.to_string());
        Ok(())
    }

    fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }
}

pub struct RedisNode {
    connection: MultiplexedConnection,
}

#[async_trait]
impl NodeConnection for RedisNode {
    async fn flush_db(&mut self) -> ClientResult<bool> {
        let reply: String = redis::cmd("FLUSHDB")
            .query_async(&mut self.connection)
            .await?;
        Ok(reply == "OK")
    }
}

/// Encode a value for storage under the given serializer.
///
/// Without a serializer only scalars can be stored and they are stored as
/// strings: `null` and `false` become empty strings, `true` becomes `"1"`.
pub fn encode(serializer: &str, value: &Value) -> ClientResult<String> {
    if serializer == lib_option::SERIALIZER_JSON {
        return Ok(value.to_string());
    }

    match value {
        Value::Null | Value::Bool(false) => Ok(String::new()),
        Value::Bool(true) => Ok("1".to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.clone()),
        Value::Array(_) | Value::Object(_) => Err(ClientError::new(
            "arrays and objects cannot be stored without a serializer",
        )),
    }
}

/// Decode a stored value. A missing key decodes to `false`.
pub fn decode(serializer: &str, raw: Option<String>) -> Value {
    let Some(raw) = raw else {
        return Value::Bool(false);
    };

    if serializer == lib_option::SERIALIZER_JSON {
        return serde_json::from_str(&raw).unwrap_or(Value::String(raw));
    }

    Value::String(raw)
}

/// A `KEYS` pattern under the library prefix. The prefix matches literally.
fn prefixed_pattern(prefix: &str, pattern: &str) -> String {
    format!("{}{pattern}", escape_glob(prefix))
}

/// Fields of an `INFO` reply.
pub fn parse_info(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(field, value)| (field.to_string(), value.to_string()))
        .collect()
}

/// Healthy masters listed in a `CLUSTER NODES` reply.
pub fn parse_cluster_nodes(raw: &str) -> Vec<MasterAddress> {
    raw.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                return None;
            }

            let flags: Vec<&str> = parts[2].split(',').collect();
            let healthy_master = flags.contains(&"master")
                && !flags
                    .iter()
                    .any(|f| matches!(*f, "fail" | "fail?" | "noaddr" | "handshake"));
            if !healthy_master {
                return None;
            }

            // ip:port@cport[,hostname]
            let address = parts[1].split(['@', ',']).next()?;
            parse_address(address)
        })
        .collect()
}

fn parse_address(raw: &str) -> Option<MasterAddress> {
    let raw = raw
        .trim_start_matches("redis://")
        .trim_start_matches("rediss://")
        .trim_end_matches('/');
    let (host, port) = raw.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }

    Some(MasterAddress {
        host: host.to_string(),
        port: port.parse().ok()?,
    })
}
