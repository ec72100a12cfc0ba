use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use crate::client::lib_option;
use crate::error::{Error, Result};
use crate::redis::RedisConnector;
use crate::resource::ResourceManager;
use crate::seeds::EnvSeedResolver;

/// Per-connection library options, keyed by option id.
pub type LibOptions = BTreeMap<i64, String>;

/// Emitted by every mutating setter of [`ClusterOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionEvent {
    pub name: &'static str,
}

pub type OptionListener = Arc<dyn Fn(&OptionEvent) + Send + Sync>;

/// Validated cluster adapter configuration.
///
/// Exactly one of `nodename` and `seeds` must be set. Setters notify subscribed
/// listeners synchronously so owners can drop state derived from the old values.
pub struct ClusterOptions {
    namespace: String,
    namespace_separator: String,
    nodename: String,
    seeds: Vec<String>,
    timeout: f64,
    read_timeout: f64,
    persistent: bool,
    ttl: u64,
    redis_version: String,
    lib_options: LibOptions,
    resource_manager: OnceLock<Arc<ResourceManager>>,
    listeners: Vec<OptionListener>,
}

impl ClusterOptions {
    fn unvalidated() -> Self {
        Self {
            namespace: String::new(),
            namespace_separator: ":".to_string(),
            nodename: String::new(),
            seeds: Vec::new(),
            timeout: 1.0,
            read_timeout: 2.0,
            persistent: false,
            ttl: 0,
            redis_version: String::new(),
            lib_options: LibOptions::new(),
            resource_manager: OnceLock::new(),
            listeners: Vec::new(),
        }
    }

    pub fn builder() -> ClusterOptionsBuilder {
        ClusterOptionsBuilder::default()
    }

    /// Build options from a mapping of named settings, e.g.
    /// `{"seeds": ["10.0.0.1:7000"], "namespace": "app", "lib_options": {"1": 4}}`.
    pub fn from_json(settings: &Value) -> Result<Self> {
        let Some(map) = settings.as_object() else {
            return Err(Error::InvalidConfiguration(
                "options must be a mapping of named settings".to_string(),
            ));
        };

        let mut options = Self::unvalidated();
        for (key, value) in map {
            match key.as_str() {
                "nodename" => options.set_nodename(expect_str(key, value)?),
                "seeds" => options.set_seeds(seeds_from_json(value)?)?,
                "timeout" => options.set_timeout(expect_f64(key, value)?)?,
                "read_timeout" => options.set_read_timeout(expect_f64(key, value)?)?,
                "persistent" => options.set_persistent(expect_bool(key, value)?),
                "namespace" => options.set_namespace(expect_str(key, value)?),
                "namespace_separator" => options.set_namespace_separator(expect_str(key, value)?),
                "ttl" => options.set_ttl(expect_u64(key, value)?),
                "redis_version" => options.set_redis_version(expect_str(key, value)?)?,
                "lib_options" => options.set_lib_options(lib_options_from_json(value)?),
                other => {
                    return Err(Error::InvalidConfiguration(format!(
                        "unknown option `{other}`"
                    )))
                }
            }
        }

        options.validate()?;
        Ok(options)
    }

    /// Load options from environment variables.
    ///
    /// One of `REDIS_CLUSTER_SEEDS` (comma separated) or `REDIS_CLUSTER_NODENAME`
    /// is required. Optional: `REDIS_CLUSTER_TIMEOUT`, `REDIS_CLUSTER_READ_TIMEOUT`,
    /// `REDIS_CLUSTER_PERSISTENT`, `REDIS_CLUSTER_NAMESPACE`,
    /// `REDIS_CLUSTER_NAMESPACE_SEPARATOR`, `REDIS_CLUSTER_TTL`,
    /// `REDIS_CLUSTER_VERSION`, `REDIS_CLUSTER_SERIALIZER` (`none`, `json` or an id).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let parse_err = |name: &str, value: &str| {
            Error::InvalidConfiguration(format!("{name} has an invalid value: {value}"))
        };

        let mut options = Self::unvalidated();
        if let Some(nodename) = var("REDIS_CLUSTER_NODENAME") {
            options.set_nodename(nodename);
        }
        if let Some(seeds) = var("REDIS_CLUSTER_SEEDS") {
            options.set_seeds(
                seeds
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            )?;
        }
        if let Some(raw) = var("REDIS_CLUSTER_TIMEOUT") {
            let timeout = raw.parse().map_err(|_| parse_err("REDIS_CLUSTER_TIMEOUT", &raw))?;
            options.set_timeout(timeout)?;
        }
        if let Some(raw) = var("REDIS_CLUSTER_READ_TIMEOUT") {
            let timeout = raw
                .parse()
                .map_err(|_| parse_err("REDIS_CLUSTER_READ_TIMEOUT", &raw))?;
            options.set_read_timeout(timeout)?;
        }
        if let Some(raw) = var("REDIS_CLUSTER_PERSISTENT") {
            let persistent = match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(parse_err("REDIS_CLUSTER_PERSISTENT", &raw)),
            };
            options.set_persistent(persistent);
        }
        if let Some(namespace) = var("REDIS_CLUSTER_NAMESPACE") {
            options.set_namespace(namespace);
        }
        if let Some(separator) = lookup("REDIS_CLUSTER_NAMESPACE_SEPARATOR") {
            options.set_namespace_separator(separator);
        }
        if let Some(raw) = var("REDIS_CLUSTER_TTL") {
            let ttl = raw.parse().map_err(|_| parse_err("REDIS_CLUSTER_TTL", &raw))?;
            options.set_ttl(ttl);
        }
        if let Some(version) = var("REDIS_CLUSTER_VERSION") {
            options.set_redis_version(version)?;
        }
        if let Some(raw) = var("REDIS_CLUSTER_SERIALIZER") {
            let serializer = match raw.to_ascii_lowercase().as_str() {
                "none" => lib_option::SERIALIZER_NONE.to_string(),
                "json" => lib_option::SERIALIZER_JSON.to_string(),
                id if id.parse::<i64>().is_ok() => id.to_string(),
                _ => return Err(parse_err("REDIS_CLUSTER_SERIALIZER", &raw)),
            };
            options.set_lib_options(LibOptions::from([(lib_option::SERIALIZER, serializer)]));
        }

        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<()> {
        if !self.has_nodename() && self.seeds.is_empty() {
            return Err(Error::InvalidConfiguration(
                "Missing either `nodename` or `seeds`.".to_string(),
            ));
        }

        if self.has_nodename() && !self.seeds.is_empty() {
            return Err(Error::InvalidConfiguration(
                "Please provide either `nodename` or `seeds` configuration, not both.".to_string(),
            ));
        }

        Ok(())
    }

    /// Register a callback invoked synchronously on every option change.
    pub fn subscribe(&mut self, listener: impl Fn(&OptionEvent) + Send + Sync + 'static) {
        self.listeners.push(Arc::new(listener));
    }

    fn trigger_option_event(&self, name: &'static str) {
        if let Some(resource_manager) = self.resource_manager.get() {
            resource_manager.invalidate();
        }

        let event = OptionEvent { name };
        for listener in &self.listeners {
            listener(&event);
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.namespace = namespace.into();
        self.trigger_option_event("namespace");
    }

    pub fn namespace_separator(&self) -> &str {
        &self.namespace_separator
    }

    pub fn set_namespace_separator(&mut self, separator: impl Into<String>) {
        let separator = separator.into();
        if self.namespace_separator == separator {
            return;
        }

        self.namespace_separator = separator;
        self.trigger_option_event("namespace_separator");
    }

    pub fn has_nodename(&self) -> bool {
        !self.nodename.is_empty()
    }

    pub fn nodename(&self) -> &str {
        &self.nodename
    }

    pub fn set_nodename(&mut self, nodename: impl Into<String>) {
        self.nodename = nodename.into();
        self.trigger_option_event("nodename");
    }

    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }

    pub fn set_seeds(&mut self, seeds: Vec<String>) -> Result<()> {
        if seeds.is_empty() {
            return Err(Error::InvalidArgument("seeds must not be empty".to_string()));
        }
        if seeds.iter().any(|seed| seed.trim().is_empty()) {
            return Err(Error::InvalidArgument(
                "seeds must not contain empty entries".to_string(),
            ));
        }

        self.seeds = seeds;
        self.trigger_option_event("seeds");
        Ok(())
    }

    pub fn timeout(&self) -> f64 {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: f64) -> Result<()> {
        self.timeout = validate_seconds("timeout", timeout)?;
        self.trigger_option_event("timeout");
        Ok(())
    }

    pub fn read_timeout(&self) -> f64 {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, read_timeout: f64) -> Result<()> {
        self.read_timeout = validate_seconds("read_timeout", read_timeout)?;
        self.trigger_option_event("read_timeout");
        Ok(())
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
        self.trigger_option_event("persistent");
    }

    /// Default time to live in seconds, `0` meaning no expiry.
    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: u64) {
        self.ttl = ttl;
        self.trigger_option_event("ttl");
    }

    /// Known server version, empty until configured or detected.
    pub fn redis_version(&self) -> &str {
        &self.redis_version
    }

    pub fn set_redis_version(&mut self, version: impl Into<String>) -> Result<()> {
        let version = version.into();
        if version.is_empty() {
            return Err(Error::InvalidArgument(
                "redis version must not be empty".to_string(),
            ));
        }
        if !version_pattern().is_match(&version) {
            return Err(Error::InvalidArgument(format!(
                "redis version `{version}` does not look like <major>.<minor>"
            )));
        }

        self.redis_version = version;
        self.trigger_option_event("redis_version");
        Ok(())
    }

    pub fn lib_options(&self) -> &LibOptions {
        &self.lib_options
    }

    pub fn set_lib_options(&mut self, options: LibOptions) {
        self.lib_options = options;
        self.trigger_option_event("lib_options");
    }

    /// Replace the lazily created resource manager.
    pub fn set_resource_manager(&mut self, resource_manager: ResourceManager) {
        self.resource_manager = OnceLock::from(Arc::new(resource_manager));
        self.trigger_option_event("resource_manager");
    }

    pub fn resource_manager(&self) -> Arc<ResourceManager> {
        let resource_manager = self.resource_manager.get_or_init(|| {
            Arc::new(ResourceManager::new(
                Arc::new(RedisConnector),
                Arc::new(EnvSeedResolver),
            ))
        });
        Arc::clone(resource_manager)
    }

    pub(crate) fn timeout_duration(&self) -> Result<Duration> {
        to_duration("timeout", self.timeout)
    }
}

/// Copies every setting. The copy has no listeners and its own resource manager.
impl Clone for ClusterOptions {
    fn clone(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            namespace_separator: self.namespace_separator.clone(),
            nodename: self.nodename.clone(),
            seeds: self.seeds.clone(),
            timeout: self.timeout,
            read_timeout: self.read_timeout,
            persistent: self.persistent,
            ttl: self.ttl,
            redis_version: self.redis_version.clone(),
            lib_options: self.lib_options.clone(),
            resource_manager: OnceLock::new(),
            listeners: Vec::new(),
        }
    }
}

impl fmt::Debug for ClusterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterOptions")
            .field("namespace", &self.namespace)
            .field("namespace_separator", &self.namespace_separator)
            .field("nodename", &self.nodename)
            .field("seeds", &self.seeds)
            .field("timeout", &self.timeout)
            .field("read_timeout", &self.read_timeout)
            .field("persistent", &self.persistent)
            .field("ttl", &self.ttl)
            .field("redis_version", &self.redis_version)
            .field("lib_options", &self.lib_options)
            .finish_non_exhaustive()
    }
}

/// Programmatic construction of [`ClusterOptions`].
#[derive(Debug, Default)]
pub struct ClusterOptionsBuilder {
    nodename: Option<String>,
    seeds: Option<Vec<String>>,
    timeout: Option<f64>,
    read_timeout: Option<f64>,
    persistent: bool,
    namespace: Option<String>,
    namespace_separator: Option<String>,
    ttl: u64,
    redis_version: Option<String>,
    lib_options: LibOptions,
}

impl ClusterOptionsBuilder {
    pub fn nodename(mut self, nodename: impl Into<String>) -> Self {
        self.nodename = Some(nodename.into());
        self
    }

    pub fn seeds(mut self, seeds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.seeds = Some(seeds.into_iter().map(Into::into).collect());
        self
    }

    pub fn timeout(mut self, timeout: f64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, read_timeout: f64) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn namespace_separator(mut self, separator: impl Into<String>) -> Self {
        self.namespace_separator = Some(separator.into());
        self
    }

    pub fn ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn redis_version(mut self, version: impl Into<String>) -> Self {
        self.redis_version = Some(version.into());
        self
    }

    pub fn lib_option(mut self, option: i64, value: impl Into<String>) -> Self {
        self.lib_options.insert(option, value.into());
        self
    }

    pub fn build(self) -> Result<ClusterOptions> {
        let mut options = ClusterOptions::unvalidated();
        if let Some(nodename) = self.nodename {
            options.set_nodename(nodename);
        }
        if let Some(seeds) = self.seeds {
            options.set_seeds(seeds)?;
        }
        if let Some(timeout) = self.timeout {
            options.set_timeout(timeout)?;
        }
        if let Some(read_timeout) = self.read_timeout {
            options.set_read_timeout(read_timeout)?;
        }
        options.set_persistent(self.persistent);
        if let Some(namespace) = self.namespace {
            options.set_namespace(namespace);
        }
        if let Some(separator) = self.namespace_separator {
            options.set_namespace_separator(separator);
        }
        options.set_ttl(self.ttl);
        if let Some(version) = self.redis_version {
            options.set_redis_version(version)?;
        }
        if !self.lib_options.is_empty() {
            options.set_lib_options(self.lib_options);
        }

        options.validate()?;
        Ok(options)
    }
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+\.\d+").expect("version pattern is valid"))
}

fn validate_seconds(name: &str, seconds: f64) -> Result<f64> {
    to_duration(name, seconds)?;
    Ok(seconds)
}

pub(crate) fn to_duration(name: &str, seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds).map_err(|_| {
        Error::InvalidArgument(format!("{name} must be a non-negative number of seconds"))
    })
}

fn expect_str(key: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(String::from)
        .ok_or_else(|| Error::InvalidArgument(format!("`{key}` must be a string")))
}

fn expect_f64(key: &str, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| Error::InvalidArgument(format!("`{key}` must be a number")))
}

fn expect_u64(key: &str, value: &Value) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| Error::InvalidArgument(format!("`{key}` must be a non-negative integer")))
}

fn expect_bool(key: &str, value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| Error::InvalidArgument(format!("`{key}` must be a boolean")))
}

fn seeds_from_json(value: &Value) -> Result<Vec<String>> {
    let Some(entries) = value.as_array() else {
        return Err(Error::InvalidArgument("`seeds` must be a list".to_string()));
    };

    entries
        .iter()
        .map(|entry| {
            entry.as_str().map(String::from).ok_or_else(|| {
                Error::InvalidArgument(format!("seed {entry} is not a string"))
            })
        })
        .collect()
}

fn lib_options_from_json(value: &Value) -> Result<LibOptions> {
    let Some(map) = value.as_object() else {
        return Err(Error::InvalidArgument(
            "`lib_options` must be a mapping of option ids to values".to_string(),
        ));
    };

    map.iter()
        .map(|(key, value)| {
            let option = key.parse::<i64>().map_err(|_| {
                Error::InvalidArgument(format!("library option key `{key}` is not an integer"))
            })?;
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => u8::from(*b).to_string(),
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "library option {option} has unsupported value {other}"
                    )))
                }
            };
            Ok((option, value))
        })
        .collect()
}
