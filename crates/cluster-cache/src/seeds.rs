/// Node group resolution.
///
/// A node group is a name configured outside the application that resolves to a
/// seed list and optional timeout overrides. `EnvSeedResolver` reads the same
/// query-string layout phpredis uses for its `redis.clusters.*` ini settings:
///
/// - `REDIS_CLUSTERS_SEEDS="cache[]=10.0.0.1:7000&cache[]=10.0.0.2:7000"`
/// - `REDIS_CLUSTERS_TIMEOUT="cache=1.5"`
/// - `REDIS_CLUSTERS_READ_TIMEOUT="cache=3"`
use std::collections::HashMap;

use crate::error::{Error, Result};

pub trait SeedResolver: Send + Sync {
    fn seeds(&self, nodename: &str) -> Result<Vec<String>>;

    fn timeout(&self, nodename: &str, fallback: f64) -> f64;

    fn read_timeout(&self, nodename: &str, fallback: f64) -> f64;
}

/// Seeds and timeout overrides of one node group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeGroup {
    pub seeds: Vec<String>,
    pub timeout: Option<f64>,
    pub read_timeout: Option<f64>,
}

impl NodeGroup {
    pub fn new(seeds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            seeds: seeds.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: f64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: f64) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }
}

/// In-memory node groups.
#[derive(Debug, Clone, Default)]
pub struct StaticSeedResolver {
    groups: HashMap<String, NodeGroup>,
}

impl StaticSeedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, name: impl Into<String>, group: NodeGroup) -> Self {
        self.groups.insert(name.into(), group);
        self
    }

    fn group(&self, nodename: &str) -> Option<&NodeGroup> {
        self.groups.get(nodename)
    }
}

impl SeedResolver for StaticSeedResolver {
    fn seeds(&self, nodename: &str) -> Result<Vec<String>> {
        match self.group(nodename) {
            Some(group) if !group.seeds.is_empty() => Ok(group.seeds.clone()),
            _ => Err(Error::InvalidConfiguration(format!(
                "no seeds configured for node group `{nodename}`"
            ))),
        }
    }

    fn timeout(&self, nodename: &str, fallback: f64) -> f64 {
        self.group(nodename)
            .and_then(|g| g.timeout)
            .unwrap_or(fallback)
    }

    fn read_timeout(&self, nodename: &str, fallback: f64) -> f64 {
        self.group(nodename)
            .and_then(|g| g.read_timeout)
            .unwrap_or(fallback)
    }
}

/// Node groups read from `REDIS_CLUSTERS_*` environment variables on each lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSeedResolver;

impl EnvSeedResolver {
    fn load() -> StaticSeedResolver {
        let seeds = std::env::var("REDIS_CLUSTERS_SEEDS").unwrap_or_default();
        let timeouts = std::env::var("REDIS_CLUSTERS_TIMEOUT").unwrap_or_default();
        let read_timeouts = std::env::var("REDIS_CLUSTERS_READ_TIMEOUT").unwrap_or_default();
        parse_node_groups(&seeds, &timeouts, &read_timeouts)
    }
}

impl SeedResolver for EnvSeedResolver {
    fn seeds(&self, nodename: &str) -> Result<Vec<String>> {
        Self::load().seeds(nodename)
    }

    fn timeout(&self, nodename: &str, fallback: f64) -> f64 {
        Self::load().timeout(nodename, fallback)
    }

    fn read_timeout(&self, nodename: &str, fallback: f64) -> f64 {
        Self::load().read_timeout(nodename, fallback)
    }
}

/// Parse the phpredis `redis.clusters.*` query-string settings.
pub fn parse_node_groups(seeds: &str, timeouts: &str, read_timeouts: &str) -> StaticSeedResolver {
    let mut groups: HashMap<String, NodeGroup> = HashMap::new();

    for (name, value) in pairs(seeds) {
        let name = name.strip_suffix("[]").unwrap_or(name);
        groups
            .entry(name.to_string())
            .or_default()
            .seeds
            .push(value.to_string());
    }

    for (name, value) in pairs(timeouts) {
        if let Ok(timeout) = value.parse::<f64>() {
            groups.entry(name.to_string()).or_default().timeout = Some(timeout);
        }
    }

    for (name, value) in pairs(read_timeouts) {
        if let Ok(timeout) = value.parse::<f64>() {
            groups.entry(name.to_string()).or_default().read_timeout = Some(timeout);
        }
    }

    StaticSeedResolver { groups }
}

fn pairs(raw: &str) -> impl Iterator<Item = (&str, &str)> {
    raw.split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
}
