pub mod adapter;
pub mod capabilities;
pub mod client;
pub mod error;
pub mod options;
pub mod plugin;
pub mod redis;
pub mod resource;
pub mod seeds;

#[cfg(test)]
mod testing;

pub use adapter::RedisCluster;
pub use capabilities::Capabilities;
pub use error::{Error, Result};
pub use options::ClusterOptions;
pub use resource::ResourceManager;
