mod command;

use clap::Parser;
use cluster_cache::{ClusterOptions, RedisCluster};
use serde_json::{json, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use command::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the JSON result
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();

    let options = ClusterOptions::from_env()?;
    info!(
        nodename = %options.nodename(),
        seeds = options.seeds().len(),
        namespace = %options.namespace(),
        "configuration loaded"
    );

    let cache = RedisCluster::new(options);
    let output = match run(&cache, cli.command).await {
        Ok(output) => output,
        Err(err) if err.is_configuration() => {
            error!(error = %err, "request rejected before reaching the cluster");
            return Err(err.into());
        }
        Err(err) => {
            error!(error = %err, "cluster request failed");
            return Err(err.into());
        }
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

async fn run(cache: &RedisCluster, command: Command) -> cluster_cache::Result<Value> {
    let output = match command {
        Command::Get { keys } => {
            let found = cache.get_multiple(&keys).await?;
            json!(found)
        }
        Command::Set { key, value } => {
            let stored = cache.set(&key, value).await?;
            json!({ "key": key, "stored": stored })
        }
        Command::Del { keys } => {
            let remaining = cache.remove_multiple(&keys).await?;
            json!({ "not_removed": remaining })
        }
        Command::Has { keys } => {
            let present = cache.has_multiple(&keys).await?;
            json!({ "present": present })
        }
        Command::ClearNamespace { namespace } => {
            let cleared = cache.clear_by_namespace(&namespace).await?;
            json!({ "namespace": namespace, "cleared": cleared })
        }
        Command::ClearPrefix { prefix } => {
            let cleared = cache.clear_by_prefix(&prefix).await?;
            json!({ "prefix": prefix, "cleared": cleared })
        }
        Command::Flush => {
            let flushed = cache.flush().await?;
            info!(flushed, "flush finished");
            json!({ "flushed": flushed })
        }
        Command::Capabilities => json!(*cache.capabilities().await?),
    };

    Ok(output)
}
