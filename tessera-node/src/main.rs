//! Tessera node daemon
//!
//! Starts the replica cluster described by the configuration in-process and
//! runs one object operation through it:
//! - `put` / `get` / `list` / `delete` - object operations
//! - `check` - validate the configuration
//! - `demo` - write an object, then crash storage nodes one at a time
//!
//! Without `--config` an in-memory cluster of 4 replicas (f=1, K=3) is used.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tessera_core::ClusterConfig;
use tessera_node::{ReplicaCluster, StorageEngine};
use tessera_storage::StorageServers;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tessera-node")]
#[command(about = "Secret-shared storage over Byzantine agreement")]
#[command(version)]
struct Cli {
    /// Cluster configuration file
    #[arg(short, long, env = "TESSERA_CONFIG")]
    config: Option<PathBuf>,

    /// Talk to the fragment stores directly instead of through agreement
    #[arg(long)]
    direct: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a file under a path
    Put {
        path: String,
        file: PathBuf,
    },

    /// Fetch the object stored under a path
    Get {
        path: String,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List stored paths
    List {
        prefix: Option<String>,
    },

    /// Delete the object stored under a path
    Delete {
        path: String,
    },

    /// Validate the configuration and print a summary
    Check,

    /// Store an object and read it back while storage nodes fail
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => ClusterConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClusterConfig::local(4, 1, 3),
    }
    .with_env_overrides();
    config.validate().context("invalid configuration")?;

    info!(
        replicas = config.replicas.len(),
        faulty = config.agreement.faulty,
        nodes = config.storage.nodes.len(),
        threshold = config.storage.threshold,
        codec = ?config.storage.codec,
        "Configuration loaded"
    );

    match cli.command {
        Commands::Check => {
            println!(
                "{} replicas (f={}), {} storage nodes, K={}",
                config.replicas.len(),
                config.agreement.faulty,
                config.storage.nodes.len(),
                config.storage.threshold
            );
            Ok(())
        }
        Commands::Demo => demo(&config).await,
        command => run(&config, cli.direct, command).await,
    }
}

async fn run(config: &ClusterConfig, direct: bool, command: Commands) -> Result<()> {
    let (cluster, servers) = if direct {
        (None, StorageServers::from_settings(&config.storage.nodes)?)
    } else {
        let cluster = ReplicaCluster::start(config)?;
        let servers = cluster.storage_servers()?;
        (Some(cluster), servers)
    };

    let engine = StorageEngine::from_config(config, servers)?;
    let reachable = engine.connect().await?;
    if reachable < config.storage.threshold {
        warn!(reachable, "Fewer storage nodes reachable than the threshold");
    }

    let outcome = execute(&engine, command).await;
    if let Err(e) = engine.disconnect().await {
        error!(error = %e, "Failed to persist the directory");
    }
    if let Some(cluster) = cluster {
        cluster.shutdown().await;
    }
    outcome
}

async fn execute(engine: &StorageEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Put { path, file } => {
            let data =
                std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let report = engine.put_object(&path, &data).await?;
            println!(
                "stored {} ({} bytes) on {} nodes",
                path,
                data.len(),
                report.success_count()
            );
        }
        Commands::Get { path, output } => {
            let data = engine.get_object(&path).await?;
            match output {
                Some(file) => std::fs::write(&file, &data)
                    .with_context(|| format!("writing {}", file.display()))?,
                None => std::io::stdout().write_all(&data)?,
            }
        }
        Commands::List { prefix } => {
            for path in engine.list(prefix.as_deref()).await? {
                println!("{path}");
            }
        }
        Commands::Delete { path } => {
            if engine.delete_object(&path).await? {
                println!("deleted {path}");
            } else {
                println!("{path} not found");
            }
        }
        Commands::Check | Commands::Demo => {}
    }
    Ok(())
}

async fn demo(config: &ClusterConfig) -> Result<()> {
    let cluster = ReplicaCluster::start(config)?;
    let engine = StorageEngine::from_config(config, cluster.storage_servers()?)?;
    engine.connect().await?;

    let path = "/demo/greeting";
    engine.put_object(path, b"hello from tessera").await?;
    println!("stored {path}; stat: {:?}", engine.stat_object(path).await?);

    let victims: Vec<_> = cluster
        .replicas()
        .iter()
        .rev()
        .take(config.storage.nodes.len() + 1 - config.storage.threshold)
        .map(|r| (r.id(), r.node_id().to_string()))
        .collect();

    for (replica, node) in victims {
        cluster.crash(replica);
        match engine.get_object(path).await {
            Ok(data) => println!(
                "{node} down: read {:?}",
                String::from_utf8_lossy(&data)
            ),
            Err(e) => println!("{node} down: read failed: {e}"),
        }
    }

    cluster.shutdown().await;
    Ok(())
}
