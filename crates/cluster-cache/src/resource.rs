/// Owner of the cluster connection.
///
/// Builds the connection on first use (from seeds or a resolved node group),
/// applies configured library options, and remembers what it learned from the
/// cluster: the merged library option table and the detected server version.
/// All of it is dropped by `invalidate()`, which options call on every change.
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::client::{lib_option, ClusterConnection, ConnectParams, Connector};
use crate::error::{ClientError, Error, Result};
use crate::options::{to_duration, ClusterOptions, LibOptions};
use crate::plugin::PluginRegistry;
use crate::seeds::SeedResolver;

pub struct ResourceManager {
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn SeedResolver>,
    state: Mutex<ResourceState>,
}

#[derive(Default)]
struct ResourceState {
    resource: Option<Arc<dyn ClusterConnection>>,
    lib_options: Option<LibOptions>,
    version: Option<String>,
}

impl ResourceManager {
    pub fn new(connector: Arc<dyn Connector>, resolver: Arc<dyn SeedResolver>) -> Self {
        Self {
            connector,
            resolver,
            state: Mutex::new(ResourceState::default()),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    fn state(&self) -> MutexGuard<'_, ResourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the connection and everything learned from it.
    pub fn invalidate(&self) {
        *self.state() = ResourceState::default();
    }

    /// The live connection, connecting on first use.
    pub async fn resource(&self, options: &ClusterOptions) -> Result<Arc<dyn ClusterConnection>> {
        let cached = self.state().resource.clone();
        if let Some(resource) = cached {
            return Ok(resource);
        }

        let params = self.connect_params(options)?;
        debug!(
            seeds = ?params.seeds,
            nodename = options.nodename(),
            persistent = params.persistent,
            "connecting to redis cluster"
        );
        let resource = self
            .connector
            .connect(&params)
            .await
            .map_err(Error::connection_failed)?;

        let explicit = options.lib_options();
        for (&option, value) in explicit {
            resource
                .set_option(option, value)
                .await
                .map_err(|e| Error::operation(e, resource.last_error()))?;
            debug!(option, value = %value, "applied library option");
        }

        let merged = merge_lib_options(explicit, resource.as_ref()).await?;

        let mut state = self.state();
        state.lib_options = Some(merged);
        state.resource = Some(Arc::clone(&resource));
        Ok(resource)
    }

    /// Seeds and timeouts to connect with. A node group is resolved through the
    /// seed resolver, which may override the configured timeouts.
    pub fn connect_params(&self, options: &ClusterOptions) -> Result<ConnectParams> {
        let (seeds, timeout, read_timeout) = if options.has_nodename() {
            let nodename = options.nodename();
            (
                self.resolver.seeds(nodename)?,
                self.resolver.timeout(nodename, options.timeout()),
                self.resolver.read_timeout(nodename, options.read_timeout()),
            )
        } else {
            (
                options.seeds().to_vec(),
                options.timeout(),
                options.read_timeout(),
            )
        };

        Ok(ConnectParams {
            seeds,
            timeout: to_duration("timeout", timeout)?,
            read_timeout: to_duration("read_timeout", read_timeout)?,
            persistent: options.persistent(),
        })
    }

    /// Server version: configured, previously detected, or read via `INFO`.
    pub async fn version(&self, options: &ClusterOptions) -> Result<String> {
        if !options.redis_version().is_empty() {
            return Ok(options.redis_version().to_string());
        }

        let cached = self.state().version.clone();
        if let Some(version) = cached {
            return Ok(version);
        }

        let resource = self.resource(options).await?;
        let target = self.connect_params(options)?.seeds;
        let info = resource
            .info(&target)
            .await
            .map_err(|e| Error::operation(e, resource.last_error()))?;

        let Some(version) = info
            .into_iter()
            .find_map(|(field, value)| (field == "redis_version").then_some(value))
        else {
            return Err(Error::operation(
                ClientError::new("INFO reply does not contain redis_version"),
                None,
            ));
        };

        debug!(version = %version, "detected redis version");
        self.state().version = Some(version.clone());
        Ok(version)
    }

    /// Effective value of a library option. Falls back to asking the live
    /// connection for options not seen when the connection was made.
    pub async fn lib_option(&self, options: &ClusterOptions, option: i64) -> Result<String> {
        let cached = self
            .state()
            .lib_options
            .as_ref()
            .and_then(|merged| merged.get(&option).cloned());
        if let Some(value) = cached {
            return Ok(value);
        }

        let resource = self.resource(options).await?;
        resource
            .get_option(option)
            .await
            .map_err(|e| Error::operation(e, resource.last_error()))
    }

    /// Whether values are serialized, either by the connection's serializer
    /// option or by a serializer plugin.
    pub fn has_serialization_support(&self, options: &ClusterOptions, plugins: &PluginRegistry) -> bool {
        let serializer = options
            .lib_options()
            .get(&lib_option::SERIALIZER)
            .cloned()
            .or_else(|| {
                self.state()
                    .lib_options
                    .as_ref()
                    .and_then(|merged| merged.get(&lib_option::SERIALIZER).cloned())
            });

        let serializer_option = serializer
            .as_deref()
            .is_some_and(|value| value != lib_option::SERIALIZER_NONE);

        serializer_option || plugins.has_serializer()
    }
}

impl fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("ResourceManager")
            .field("connected", &state.resource.is_some())
            .field("lib_options", &state.lib_options)
            .field("version", &state.version)
            .finish_non_exhaustive()
    }
}

/// Explicit options plus the connection's own value for every other known option.
async fn merge_lib_options(
    explicit: &LibOptions,
    resource: &dyn ClusterConnection,
) -> Result<LibOptions> {
    let mut merged = explicit.clone();
    for &option in lib_option::KNOWN_OPTIONS {
        if merged.contains_key(&option) {
            continue;
        }

        let value = resource
            .get_option(option)
            .await
            .map_err(|e| Error::operation(e, resource.last_error()))?;
        merged.insert(option, value);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seeds::{NodeGroup, StaticSeedResolver};
    use crate::testing::MemoryCluster;

    fn manager(cluster: &MemoryCluster, resolver: StaticSeedResolver) -> ResourceManager {
        ResourceManager::new(Arc::new(cluster.clone()), Arc::new(resolver))
    }

    fn seeded() -> ClusterOptions {
        ClusterOptions::builder().seeds(["h:1"]).build().unwrap()
    }

    #[tokio::test]
    async fn test_resource_connects_once() {
        let cluster = MemoryCluster::new();
        let manager = manager(&cluster, StaticSeedResolver::new());
        let options = seeded();

        manager.resource(&options).await.unwrap();
        manager.resource(&options).await.unwrap();
        assert_eq!(cluster.connects(), 1);

        manager.invalidate();
        manager.resource(&options).await.unwrap();
        assert_eq!(cluster.connects(), 2);
    }

    #[tokio::test]
    async fn test_connect_with_seeds() {
        let cluster = MemoryCluster::new();
        let manager = manager(&cluster, StaticSeedResolver::new());
        let options = ClusterOptions::builder()
            .seeds(["h:1", "h:2"])
            .timeout(0.5)
            .read_timeout(1.5)
            .persistent(true)
            .build()
            .unwrap();

        manager.resource(&options).await.unwrap();
        let params = cluster.last_connect().unwrap();
        assert_eq!(params.seeds, vec!["h:1", "h:2"]);
        assert_eq!(params.timeout.as_secs_f64(), 0.5);
        assert_eq!(params.read_timeout.as_secs_f64(), 1.5);
        assert!(params.persistent);
    }

    #[tokio::test]
    async fn test_connect_with_nodename() {
        let cluster = MemoryCluster::new();
        let resolver = StaticSeedResolver::new()
            .with_group("cache", NodeGroup::new(["n:1", "n:2"]).with_read_timeout(7.0));
        let manager = manager(&cluster, resolver);
        let options = ClusterOptions::builder()
            .nodename("cache")
            .timeout(3.0)
            .build()
            .unwrap();

        manager.resource(&options).await.unwrap();
        let params = cluster.last_connect().unwrap();
        assert_eq!(params.seeds, vec!["n:1", "n:2"]);
        assert_eq!(params.timeout.as_secs_f64(), 3.0);
        assert_eq!(params.read_timeout.as_secs_f64(), 7.0);
    }

    #[tokio::test]
    async fn test_unknown_nodename() {
        let cluster = MemoryCluster::new();
        let manager = manager(&cluster, StaticSeedResolver::new());
        let options = ClusterOptions::builder().nodename("nope").build().unwrap();

        let err = manager.resource(&options).await.err().unwrap();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert_eq!(cluster.connects(), 0);
    }

    #[tokio::test]
    async fn test_connection_failure_is_wrapped() {
        let cluster = MemoryCluster::new();
        cluster.refuse_connections();
        let manager = manager(&cluster, StaticSeedResolver::new());

        let err = manager.resource(&seeded()).await.err().unwrap();
        assert!(matches!(err, Error::ConnectionFailed { .. }));
    }

    #[tokio::test]
    async fn test_lib_options_applied_and_merged() {
        let cluster = MemoryCluster::new();
        let manager = manager(&cluster, StaticSeedResolver::new());
        let options = ClusterOptions::builder()
            .seeds(["h:1"])
            .lib_option(lib_option::SERIALIZER, lib_option::SERIALIZER_JSON)
            .build()
            .unwrap();

        let resource = manager.resource(&options).await.unwrap();
        let merge_reads = cluster.option_reads();
        assert_eq!(merge_reads, lib_option::KNOWN_OPTIONS.len() - 1);
        assert_eq!(
            resource.get_option(lib_option::SERIALIZER).await.unwrap(),
            lib_option::SERIALIZER_JSON
        );

        assert_eq!(
            manager.lib_option(&options, lib_option::SCAN).await.unwrap(),
            "0"
        );
        assert_eq!(
            manager.lib_option(&options, lib_option::SERIALIZER).await.unwrap(),
            lib_option::SERIALIZER_JSON
        );
        // Only the direct read above reached the connection.
        assert_eq!(cluster.option_reads(), merge_reads + 1);
    }

    #[tokio::test]
    async fn test_lib_option_falls_back_to_connection() {
        let cluster = MemoryCluster::new();
        let manager = manager(&cluster, StaticSeedResolver::new());
        let options = seeded();
        manager.resource(&options).await.unwrap();

        let before = cluster.option_reads();
        manager.lib_option(&options, 42).await.unwrap();
        assert_eq!(cluster.option_reads(), before + 1);
    }

    #[tokio::test]
    async fn test_rejected_lib_option() {
        let cluster = MemoryCluster::new();
        cluster.reject_options();
        let manager = manager(&cluster, StaticSeedResolver::new());
        let options = ClusterOptions::builder()
            .seeds(["h:1"])
            .lib_option(lib_option::PREFIX, "app:")
            .build()
            .unwrap();

        let err = manager.resource(&options).await.err().unwrap();
        match err {
            Error::Operation { message, .. } => assert_eq!(message, "ERR option rejected"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_version_detection() {
        let cluster = MemoryCluster::new().with_version("6.2.7");
        let manager = manager(&cluster, StaticSeedResolver::new());
        let options = seeded();

        assert_eq!(manager.version(&options).await.unwrap(), "6.2.7");
        assert_eq!(manager.version(&options).await.unwrap(), "6.2.7");
        assert_eq!(cluster.count("INFO"), 1);
        assert_eq!(cluster.info_targets(), vec![vec!["h:1".to_string()]]);
    }

    #[tokio::test]
    async fn test_configured_version_skips_info() {
        let cluster = MemoryCluster::new().with_version("6.2.7");
        let manager = manager(&cluster, StaticSeedResolver::new());
        let options = ClusterOptions::builder()
            .seeds(["h:1"])
            .redis_version("5.0")
            .build()
            .unwrap();

        assert_eq!(manager.version(&options).await.unwrap(), "5.0");
        assert_eq!(cluster.count("INFO"), 0);
        assert_eq!(cluster.connects(), 0);
    }

    #[tokio::test]
    async fn test_version_failure_is_wrapped() {
        let cluster = MemoryCluster::new();
        cluster.fail_info();
        let manager = manager(&cluster, StaticSeedResolver::new());

        let err = manager.version(&seeded()).await.err().unwrap();
        assert!(matches!(err, Error::Operation { .. }));
    }

    #[test]
    fn test_serialization_support() {
        let cluster = MemoryCluster::new();
        let manager = manager(&cluster, StaticSeedResolver::new());
        let mut plugins = PluginRegistry::new();

        let plain = seeded();
        assert!(!manager.has_serialization_support(&plain, &plugins));

        let json = ClusterOptions::builder()
            .seeds(["h:1"])
            .lib_option(lib_option::SERIALIZER, lib_option::SERIALIZER_JSON)
            .build()
            .unwrap();
        assert!(manager.has_serialization_support(&json, &plugins));

        plugins.add(Arc::new(crate::plugin::SerializerPlugin));
        assert!(manager.has_serialization_support(&plain, &plugins));
    }
}
