//! In-memory cluster used by the unit tests.
//!
//! Values go through the same codec as the `redis` backend, so the store holds
//! the strings a real cluster would and misses decode to the
//! `Value::Bool(false)` sentinel. Faults are injected per key or per node.
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::adapter::RedisCluster;
use crate::client::{
    lib_option, ClientResult, ClusterConnection, ConnectParams, Connector, MasterAddress, NodeConnection,
};
use crate::error::ClientError;
use crate::options::ClusterOptions;
use crate::redis::{decode, encode};
use crate::resource::ResourceManager;
use crate::seeds::StaticSeedResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeBehavior {
    Unreachable,
    Flushes,
    FailsFlush,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, String>,
    options: BTreeMap<i64, String>,
    version: String,
    masters: Vec<(MasterAddress, NodeBehavior)>,
    failing_deletes: HashSet<String>,
    failing_writes: HashSet<String>,
    refuse_connect: bool,
    reject_options: bool,
    fail_info: bool,
    fail_all: bool,
    connects: usize,
    option_reads: usize,
    last_connect: Option<ConnectParams>,
    info_targets: Vec<Vec<String>>,
    commands: Vec<&'static str>,
    flushed: Vec<u16>,
    last_error: Option<String>,
}

impl Inner {
    fn serializer(&self) -> String {
        self.options
            .get(&lib_option::SERIALIZER)
            .cloned()
            .unwrap_or_else(|| lib_option::SERIALIZER_NONE.to_string())
    }

    fn read(&self, key: &str) -> Value {
        decode(&self.serializer(), self.data.get(key).cloned())
    }

    fn write(&mut self, key: &str, value: &Value) -> ClientResult<bool> {
        let encoded = encode(&self.serializer(), value)?;
        if self.failing_writes.contains(key) {
            return Ok(false);
        }
        self.data.insert(key.to_string(), encoded);
        Ok(true)
    }
}

#[derive(Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default().with_version("7.2.4")
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_version(self, version: &str) -> Self {
        self.inner().version = version.to_string();
        self
    }

    pub fn with_masters(self, masters: &[(u16, NodeBehavior)]) -> Self {
        self.inner().masters = masters
            .iter()
            .map(|&(port, behavior)| {
                (
                    MasterAddress {
                        host: "127.0.0.1".to_string(),
                        port,
                    },
                    behavior,
                )
            })
            .collect();
        self
    }

    /// Store an already encoded value.
    pub fn insert(&self, key: &str, raw: &str) {
        self.inner().data.insert(key.to_string(), raw.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner().data.contains_key(key)
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.inner().data.get(key).cloned()
    }

    pub fn fail_delete(&self, key: &str) {
        self.inner().failing_deletes.insert(key.to_string());
    }

    pub fn fail_write(&self, key: &str) {
        self.inner().failing_writes.insert(key.to_string());
    }

    pub fn refuse_connections(&self) {
        self.inner().refuse_connect = true;
    }

    pub fn reject_options(&self) {
        self.inner().reject_options = true;
    }

    pub fn fail_info(&self) {
        self.inner().fail_info = true;
    }

    /// Every data command fails with a cluster error.
    pub fn fail_commands(&self) {
        self.inner().fail_all = true;
    }

    pub fn connects(&self) -> usize {
        self.inner().connects
    }

    pub fn option_reads(&self) -> usize {
        self.inner().option_reads
    }

    pub fn last_connect(&self) -> Option<ConnectParams> {
        self.inner().last_connect.clone()
    }

    pub fn info_targets(&self) -> Vec<Vec<String>> {
        self.inner().info_targets.clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.inner().commands.iter().filter(|c| **c == command).count()
    }

    pub fn flushed(&self) -> Vec<u16> {
        self.inner().flushed.clone()
    }

    pub fn resource_manager(&self) -> ResourceManager {
        ResourceManager::new(Arc::new(self.clone()), Arc::new(StaticSeedResolver::new()))
    }

    /// An adapter wired to this cluster.
    pub fn adapter(&self, mut options: ClusterOptions) -> RedisCluster {
        options.set_resource_manager(self.resource_manager());
        RedisCluster::new(options)
    }
}

#[async_trait]
impl Connector for MemoryCluster {
    async fn connect(&self, params: &ConnectParams) -> ClientResult<Arc<dyn ClusterConnection>> {
        let mut inner = self.inner();
        if inner.refuse_connect {
            return Err(ClientError::new("Connection refused"));
        }
        inner.connects += 1;
        inner.last_connect = Some(params.clone());
        Ok(Arc::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn connect_node(
        &self,
        address: &MasterAddress,
        _timeout: Duration,
    ) -> ClientResult<Box<dyn NodeConnection>> {
        let behavior = self
            .inner()
            .masters
            .iter()
            .find(|(master, _)| master == address)
            .map(|(_, behavior)| *behavior);

        match behavior {
            None | Some(NodeBehavior::Unreachable) => Err(ClientError::new(format!(
                "Connection refused ({}:{})",
                address.host, address.port
            ))),
            Some(behavior) => Ok(Box::new(MemoryNode {
                inner: Arc::clone(&self.inner),
                port: address.port,
                fails: behavior == NodeBehavior::FailsFlush,
            })),
        }
    }
}

struct MemoryConnection {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryConnection {
    fn command(&self, name: &'static str) -> ClientResult<MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.commands.push(name);
        if inner.fail_all {
            let message = "CLUSTERDOWN The cluster is down".to_string();
            inner.last_error = Some(message.clone());
            return Err(ClientError::new(message).with_code("CLUSTERDOWN"));
        }
        Ok(inner)
    }
}

#[async_trait]
impl ClusterConnection for MemoryConnection {
    async fn get(&self, key: &str) -> ClientResult<Value> {
        let inner = self.command("GET")?;
        Ok(inner.read(key))
    }

    async fn mget(&self, keys: &[String]) -> ClientResult<Vec<Value>> {
        let inner = self.command("MGET")?;
        Ok(keys
            .iter()
            .map(|key| inner.read(key))
            .collect())
    }

    async fn set(&self, key: &str, value: &Value) -> ClientResult<bool> {
        let mut inner = self.command("SET")?;
        inner.write(key, value)
    }

    async fn set_ex(&self, key: &str, _ttl_secs: u64, value: &Value) -> ClientResult<bool> {
        let mut inner = self.command("SETEX")?;
        inner.write(key, value)
    }

    async fn del(&self, keys: &[String]) -> ClientResult<u64> {
        let mut inner = self.command("DEL")?;
        let mut deleted = 0;
        for key in keys {
            if inner.failing_deletes.contains(key) {
                continue;
            }
            if inner.data.remove(key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> ClientResult<u64> {
        let inner = self.command("EXISTS")?;
        Ok(u64::from(inner.data.contains_key(key)))
    }

    async fn keys(&self, pattern: &str) -> ClientResult<Vec<String>> {
        let inner = self.command("KEYS")?;
        let prefix = unescape(pattern.strip_suffix('*').unwrap_or(pattern));
        Ok(inner
            .data
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn info(&self, target: &[String]) -> ClientResult<Vec<(String, String)>> {
        let mut inner = self.command("INFO")?;
        inner.info_targets.push(target.to_vec());
        if inner.fail_info {
            inner.last_error = Some("ERR node unavailable".to_string());
            return Err(ClientError::new("info failed"));
        }
        Ok(vec![
            ("redis_mode".to_string(), "cluster".to_string()),
            ("redis_version".to_string(), inner.version.clone()),
        ])
    }

    async fn masters(&self) -> ClientResult<Vec<MasterAddress>> {
        let inner = self.command("CLUSTER NODES")?;
        Ok(inner.masters.iter().map(|(m, _)| m.clone()).collect())
    }

    async fn get_option(&self, option: i64) -> ClientResult<String> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.option_reads += 1;
        Ok(inner
            .options
            .get(&option)
            .cloned()
            .unwrap_or_else(|| "0".to_string()))
    }

    async fn set_option(&self, option: i64, value: &str) -> ClientResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.reject_options {
            inner.last_error = Some("ERR option rejected".to_string());
            return Err(ClientError::new("setOption failed"));
        }
        inner.options.insert(option, value.to_string());
        Ok(())
    }

    fn last_error(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error
            .clone()
    }
}

struct MemoryNode {
    inner: Arc<Mutex<Inner>>,
    port: u16,
    fails: bool,
}

#[async_trait]
impl NodeConnection for MemoryNode {
    async fn flush_db(&mut self) -> ClientResult<bool> {
        if self.fails {
            return Ok(false);
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.data.clear();
        inner.flushed.push(self.port);
        Ok(true)
    }
}

fn unescape(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
            continue;
        }
        out.push(c);
    }
    out
}
