//! CLI command definitions.

use std::convert::Infallible;

use clap::{Parser, Subcommand};
use serde_json::Value;

/// Command line client for a Redis Cluster cache.
///
/// Connection and namespace settings come from `REDIS_CLUSTER_*` environment
/// variables.
#[derive(Debug, Parser)]
#[command(name = "cluster-cache")]
#[command(about = "Command line client for a Redis Cluster cache", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Command {
    /// Read one or more keys.
    Get {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Write a value, parsed as JSON when valid and stored as a string otherwise.
    Set {
        key: String,
        #[arg(value_parser = parse_value, allow_hyphen_values = true)]
        value: Value,
    },
    /// Remove one or more keys.
    Del {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Report which keys exist.
    Has {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Remove every key in a namespace.
    #[command(name = "clear-ns")]
    ClearNamespace { namespace: String },
    /// Remove keys of the configured namespace starting with a prefix.
    ClearPrefix { prefix: String },
    /// Flush every master node.
    Flush,
    /// Print the negotiated capabilities.
    Capabilities,
}

fn parse_value(raw: &str) -> Result<Value, Infallible> {
    Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
}
