/// Cache storage adapter for Redis Cluster.
///
/// Every key is namespaced with `<namespace><separator>` before it reaches the
/// cluster. The connection handle, the namespace prefix and the capability
/// descriptor are cached per adapter and dropped together whenever an option
/// changes.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::capabilities::Capabilities;
use crate::client::{escape_glob, ClusterConnection};
use crate::error::{ClientError, Error, Result};
use crate::options::{ClusterOptions, OptionEvent};
use crate::plugin::{Plugin, PluginRegistry};

pub struct RedisCluster {
    options: ClusterOptions,
    plugins: PluginRegistry,
    state: Arc<Mutex<AdapterState>>,
}

#[derive(Default)]
struct AdapterState {
    resource: Option<Arc<dyn ClusterConnection>>,
    namespace_prefix: Option<String>,
    capabilities: Option<Arc<Capabilities>>,
}

impl AdapterState {
    fn invalidate(&mut self) {
        *self = Self::default();
    }
}

fn lock(state: &Mutex<AdapterState>) -> MutexGuard<'_, AdapterState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The value a connection reports for a missing key.
fn is_miss(value: &Value) -> bool {
    matches!(value, Value::Bool(false))
}

fn cluster_error(err: ClientError, redis: &dyn ClusterConnection) -> Error {
    Error::operation(err, redis.last_error())
}

impl RedisCluster {
    pub fn new(options: ClusterOptions) -> Self {
        let mut adapter = Self {
            options,
            plugins: PluginRegistry::new(),
            state: Arc::new(Mutex::new(AdapterState::default())),
        };
        adapter.attach();
        adapter
    }

    pub fn from_json(settings: &Value) -> Result<Self> {
        Ok(Self::new(ClusterOptions::from_json(settings)?))
    }

    fn attach(&mut self) {
        let state = Arc::clone(&self.state);
        self.options.subscribe(move |event: &OptionEvent| {
            trace!(option = event.name, "option changed, dropping cached cluster state");
            lock(&state).invalidate();
        });
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// Mutable access to the options. Setters invalidate this adapter's caches.
    pub fn options_mut(&mut self) -> &mut ClusterOptions {
        &mut self.options
    }

    pub fn set_options(&mut self, options: ClusterOptions) {
        self.options = options;
        self.attach();
        self.invalidate();
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn add_plugin(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.add(plugin);
        self.state().capabilities = None;
    }

    /// Drop the cached connection, namespace prefix and capabilities.
    pub fn invalidate(&self) {
        self.state().invalidate();
    }

    fn state(&self) -> MutexGuard<'_, AdapterState> {
        lock(&self.state)
    }

    async fn resource(&self) -> Result<Arc<dyn ClusterConnection>> {
        let cached = self.state().resource.clone();
        if let Some(resource) = cached {
            return Ok(resource);
        }

        let resource = self
            .options
            .resource_manager()
            .resource(&self.options)
            .await?;
        self.state().resource = Some(Arc::clone(&resource));
        Ok(resource)
    }

    fn namespace_prefix(&self) -> String {
        let mut state = self.state();
        if let Some(prefix) = &state.namespace_prefix {
            return prefix.clone();
        }

        let namespace = self.options.namespace();
        let prefix = if namespace.is_empty() {
            String::new()
        } else {
            format!("{namespace}{}", self.options.namespace_separator())
        };
        state.namespace_prefix = Some(prefix.clone());
        prefix
    }

    fn key(&self, key: &str) -> Result<String> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("An empty key isn't allowed".to_string()));
        }
        Ok(format!("{}{key}", self.namespace_prefix()))
    }

    fn keys<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<String>> {
        keys.iter().map(|key| self.key(key.as_ref())).collect()
    }

    /// Whether a miss sentinel read from `key` is a stored value. A stored
    /// `false` reads back exactly like a miss, so ask the cluster.
    async fn stored_sentinel(&self, redis: &dyn ClusterConnection, key: &str) -> Result<bool> {
        let exists = redis
            .exists(key)
            .await
            .map_err(|e| cluster_error(e, redis))?;
        Ok(exists > 0)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let key = self.key(key)?;
        let redis = self.resource().await?;

        let value = redis
            .get(&key)
            .await
            .map_err(|e| cluster_error(e, redis.as_ref()))?;

        if is_miss(&value) && !self.stored_sentinel(redis.as_ref(), &key).await? {
            return Ok(None);
        }

        Ok(Some(self.plugins.post_get(value)))
    }

    /// Values of the keys that resolved, keyed by the caller's keys.
    pub async fn get_multiple<K: AsRef<str>>(&self, keys: &[K]) -> Result<HashMap<String, Value>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let namespaced = self.keys(keys)?;
        let redis = self.resource().await?;

        let values = redis
            .mget(&namespaced)
            .await
            .map_err(|e| cluster_error(e, redis.as_ref()))?;

        let mut result = HashMap::with_capacity(values.len());
        for ((key, namespaced_key), value) in keys.iter().zip(&namespaced).zip(values) {
            if is_miss(&value) && !self.stored_sentinel(redis.as_ref(), namespaced_key).await? {
                continue;
            }
            result.insert(key.as_ref().to_string(), self.plugins.post_get(value));
        }

        Ok(result)
    }

    /// Write with the configured TTL, or without expiry when it is zero.
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<bool> {
        let key = self.key(key)?;
        let value = self.plugins.pre_set(value.into());
        let redis = self.resource().await?;
        self.write(redis.as_ref(), &key, &value).await
    }

    async fn write(&self, redis: &dyn ClusterConnection, key: &str, value: &Value) -> Result<bool> {
        let ttl = self.options.ttl();
        let written = if ttl > 0 {
            redis.set_ex(key, ttl, value).await
        } else {
            redis.set(key, value).await
        };
        written.map_err(|e| cluster_error(e, redis))
    }

    /// Write each pair in turn. Returns the namespaced keys whose write was not
    /// acknowledged; an empty list means every write succeeded.
    pub async fn set_multiple<K, V>(&self, items: impl IntoIterator<Item = (K, V)>) -> Result<Vec<String>>
    where
        K: AsRef<str>,
        V: Into<Value>,
    {
        let items = items
            .into_iter()
            .map(|(key, value)| -> Result<(String, Value)> {
                Ok((self.key(key.as_ref())?, self.plugins.pre_set(value.into())))
            })
            .collect::<Result<Vec<_>>>()?;
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let redis = self.resource().await?;
        let mut failed = Vec::new();
        for (key, value) in &items {
            if !self.write(redis.as_ref(), key, value).await? {
                warn!(key = %key, "redis cluster did not acknowledge write");
                failed.push(key.clone());
            }
        }

        Ok(failed)
    }

    /// True when exactly one key was deleted.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let key = self.key(key)?;
        let redis = self.resource().await?;

        let deleted = redis
            .del(std::slice::from_ref(&key))
            .await
            .map_err(|e| cluster_error(e, redis.as_ref()))?;
        Ok(deleted == 1)
    }

    /// Delete all keys at once. Returns the namespaced keys that still exist
    /// afterwards; the existence re-check only runs when the delete count falls
    /// short.
    pub async fn remove_multiple<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let namespaced = self.keys(keys)?;
        let redis = self.resource().await?;

        let deleted = redis
            .del(&namespaced)
            .await
            .map_err(|e| cluster_error(e, redis.as_ref()))?;
        if deleted == namespaced.len() as u64 {
            return Ok(Vec::new());
        }

        debug!(
            requested = namespaced.len(),
            deleted, "partial delete, checking which keys survived"
        );
        let mut remaining = Vec::new();
        for key in namespaced {
            let exists = redis
                .exists(&key)
                .await
                .map_err(|e| cluster_error(e, redis.as_ref()))?;
            if exists > 0 {
                remaining.push(key);
            }
        }

        Ok(remaining)
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        let key = self.key(key)?;
        let redis = self.resource().await?;

        let exists = redis
            .exists(&key)
            .await
            .map_err(|e| cluster_error(e, redis.as_ref()))?;
        Ok(exists > 0)
    }

    /// The caller's keys that exist.
    pub async fn has_multiple<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<String>> {
        let namespaced = self.keys(keys)?;
        if namespaced.is_empty() {
            return Ok(Vec::new());
        }

        let redis = self.resource().await?;
        let mut found = Vec::new();
        for (key, namespaced_key) in keys.iter().zip(&namespaced) {
            let exists = redis
                .exists(namespaced_key)
                .await
                .map_err(|e| cluster_error(e, redis.as_ref()))?;
            if exists > 0 {
                found.push(key.as_ref().to_string());
            }
        }

        Ok(found)
    }

    /// Delete every key of `namespace`, regardless of the configured namespace.
    pub async fn clear_by_namespace(&self, namespace: &str) -> Result<bool> {
        if namespace.is_empty() {
            return Err(Error::InvalidArgument("Invalid namespace provided".to_string()));
        }

        self.search_and_delete("", namespace).await
    }

    /// Delete every key of the configured namespace starting with `prefix`.
    pub async fn clear_by_prefix(&self, prefix: &str) -> Result<bool> {
        if prefix.is_empty() {
            return Err(Error::InvalidArgument("No prefix given".to_string()));
        }

        self.search_and_delete(prefix, self.options.namespace()).await
    }

    async fn search_and_delete(&self, prefix: &str, namespace: &str) -> Result<bool> {
        let redis = self.resource().await?;

        let search = if namespace.is_empty() {
            prefix.to_string()
        } else {
            format!("{namespace}{}{prefix}", self.options.namespace_separator())
        };
        let pattern = format!("{}*", escape_glob(&search));

        let keys = redis
            .keys(&pattern)
            .await
            .map_err(|e| cluster_error(e, redis.as_ref()))?;
        if keys.is_empty() {
            return Ok(true);
        }

        let deleted = redis
            .del(&keys)
            .await
            .map_err(|e| cluster_error(e, redis.as_ref()))?;
        debug!(pattern = %pattern, matched = keys.len(), deleted, "cleared keys");
        Ok(deleted == keys.len() as u64)
    }

    /// Flush every master through a direct connection.
    ///
    /// Unreachable masters are skipped, since they resync from the cluster when
    /// they come back. A master that answers the flush with a failure fails the
    /// whole operation. Succeeds only if at least one master was flushed.
    pub async fn flush(&self) -> Result<bool> {
        let redis = self.resource().await?;
        let masters = redis
            .masters()
            .await
            .map_err(|e| cluster_error(e, redis.as_ref()))?;

        let connector = self.options.resource_manager().connector();
        let timeout = self.options.timeout_duration()?;
        let mut any_flushed = false;

        for master in &masters {
            let mut node = match connector.connect_node(master, timeout).await {
                Ok(node) => node,
                Err(e) => {
                    warn!(host = %master.host, port = master.port, error = %e, "skipping unreachable master");
                    continue;
                }
            };

            match node.flush_db().await {
                Ok(true) => any_flushed = true,
                Ok(false) => {
                    warn!(host = %master.host, port = master.port, "master refused FLUSHDB");
                    return Ok(false);
                }
                Err(e) => {
                    warn!(host = %master.host, port = master.port, error = %e, "FLUSHDB failed");
                    return Ok(false);
                }
            }
        }

        Ok(any_flushed)
    }

    /// Negotiated once per adapter; recomputed after an option change.
    pub async fn capabilities(&self) -> Result<Arc<Capabilities>> {
        let cached = self.state().capabilities.clone();
        if let Some(capabilities) = cached {
            return Ok(capabilities);
        }

        let resource_manager = self.options.resource_manager();
        let serializer = resource_manager.has_serialization_support(&self.options, &self.plugins);
        let version = resource_manager.version(&self.options).await?;

        let capabilities = Arc::new(Capabilities::negotiate(serializer, &version));
        self.state().capabilities = Some(Arc::clone(&capabilities));
        Ok(capabilities)
    }
}
