//! WolfRing - Self-Organizing Cluster Membership
//!
//! Command line entry point: run a node, manage its configuration, query a
//! running node and push files over the reliable channel.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfring::api::HttpServer;
use wolfring::cluster::{JoinOutcome, Node};
use wolfring::config::{WolfRingConfig, DEFAULT_LISTEN_PORT};
use wolfring::error::{Error, Result};
use wolfring::network::{TransferClient, TransferServer};
use wolfring::state::NodeAddress;

/// WolfRing - Self-Organizing Cluster Membership
#[derive(Parser)]
#[command(name = "wolfring")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfring.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node and join (or found) the cluster
    Start {
        /// Membership port, overriding the config file
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfring.toml")]
        output: PathBuf,

        /// Membership port
        #[arg(long, default_value_t = DEFAULT_LISTEN_PORT)]
        port: u16,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Query a running node's status API
    Status {
        /// API address of the node
        #[arg(short, long, default_value = "localhost:8471")]
        address: String,
    },

    /// Upload a file to a node's transfer channel
    Upload {
        /// File to send
        file: PathBuf,

        /// Transfer address of the receiving node (host:port)
        #[arg(long)]
        to: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it is readable
    let logging = WolfRingConfig::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or(logging.level);
    init_logging(&level, &logging.format);

    match cli.command {
        Commands::Start { port } => run_start(cli.config, port).await.map_err(|e| {
            if e.is_fatal() {
                tracing::error!("Node cannot start: {}", e);
            }
            e
        }),
        Commands::Init { output, port } => run_init(output, port),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Status { address } => run_status(address).await,
        Commands::Upload { file, to } => run_upload(cli.config, file, to).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Load the config file, falling back to defaults when it does not exist
fn load_config(path: &Path) -> Result<WolfRingConfig> {
    if path.exists() {
        WolfRingConfig::from_file(path)
    } else {
        tracing::warn!("Config file {} not found, using defaults", path.display());
        Ok(WolfRingConfig::default())
    }
}

/// Run a node until Ctrl-C
async fn run_start(config_path: PathBuf, port: Option<u16>) -> Result<()> {
    let mut config = load_config(&config_path)?;
    if let Some(port) = port {
        config.node.listen_port = port;
    }
    config.validate()?;

    tracing::info!("Starting WolfRing node on port {}", config.node.listen_port);

    let node = Node::bind(config.clone()).await?;
    let cancel = node.cancellation_token();
    let mut handles = Vec::new();

    if config.api.enabled {
        let server = HttpServer::new(config.api.clone(), node.context().clone());
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.start(cancel).await {
                tracing::error!("HTTP API error: {}", e);
            }
        }));
    }

    if config.transfer.enabled {
        let server = TransferServer::bind(&config.transfer_address(), config.transfer.data_dir.clone()).await?;
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run(cancel).await {
                tracing::error!("Transfer server error: {}", e);
            }
        }));
    }

    let joined = tokio::select! {
        result = node.join_system() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let interrupted = joined.is_none();
    match joined {
        Some(Ok(JoinOutcome::SelfPromoted)) => {
            tracing::info!("No cluster found, running as LEADER");
        }
        Some(Ok(JoinOutcome::Discovered(leader))) => {
            tracing::info!("Running as member, leader is {}", leader);
        }
        Some(Err(e)) => {
            tracing::error!("Failed to join: {}", e);
            node.shutdown().await;
            return Err(e);
        }
        None => {
            tracing::info!("Received shutdown signal during join");
        }
    }

    if !interrupted {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received shutdown signal");
    }

    node.shutdown().await;
    for handle in handles {
        let _ = handle.await;
    }

    tracing::info!("WolfRing shutdown complete");
    Ok(())
}

/// Check node status
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/status", address);

    match reqwest::get(&url).await {
        Ok(response) => {
            let status: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Error::Network(e.to_string()))?;
            let pretty = serde_json::to_string_pretty(&status)
                .map_err(|e| Error::Internal(e.to_string()))?;
            println!("{}", pretty);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(Error::Network(e.to_string()))
        }
    }
}

/// Upload a file over the reliable channel
async fn run_upload(config_path: PathBuf, file: PathBuf, to: String) -> Result<()> {
    let compress = load_config(&config_path)
        .map(|config| config.transfer.compress)
        .unwrap_or(true);

    let ack = TransferClient::default().upload_file(&to, &file, compress).await?;
    if ack.duplicate {
        println!("{} was already stored on {} ({} bytes)", file.display(), to, ack.stored_bytes);
    } else {
        println!("Uploaded {} to {} ({} bytes)", file.display(), to, ack.stored_bytes);
    }
    println!("Transfer ID: {}", ack.transfer_id);
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, port: u16) -> Result<()> {
    let config_content = format!(r#"# WolfRing Configuration
# Generated configuration file

[node]
listen_port = {port}
bind_ip = "0.0.0.0"
# advertise_ip = "192.168.1.10"

[cluster]
join_attempts = 5
join_interval_ms = 500
heartbeat_interval_ms = 1000
leader_timeout_ms = 3000
liveness_timeout_ms = 5000
sweep_interval_ms = 1000
election_timeout_ms = 3000
election_jitter_ms = 1000
broadcast_address = "255.255.255.255"
discovery_ports = [{default_port}]

[transfer]
enabled = false
# bind_address = "0.0.0.0:{port}"
data_dir = "/var/lib/wolfring/files"
compress = true

[api]
enabled = true
bind_address = "0.0.0.0:8471"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#, default_port = DEFAULT_LISTEN_PORT);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nStart the node with: wolfring --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfRingConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Listen Port:    {}", config.node.listen_port);
            println!("  Discovery:      {:?}", config.cluster.discovery_targets());
            println!("  Liveness:       {} ms", config.cluster.liveness_timeout_ms);
            println!("  Transfer:       {}", config.transfer.enabled);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfRingConfig::from_file(&config_path)?;

    let advertise = config
        .advertise_ip()
        .map(|ip| NodeAddress::new(ip, config.node.listen_port));

    println!("WolfRing Node Information");
    println!("=========================");
    println!();
    match &advertise {
        Ok(address) => {
            println!("Address:          {}", address);
            println!("Node ID:          {}", address.node_id());
        }
        Err(e) => println!("Address:          unresolved ({})", e),
    }
    println!("Bind Address:     {}", config.bind_address());
    println!();
    println!("Membership:");
    println!("  Join:           {} x {} ms", config.cluster.join_attempts, config.cluster.join_interval_ms);
    println!("  Heartbeat:      {} ms", config.cluster.heartbeat_interval_ms);
    println!("  Leader Timeout: {} ms", config.cluster.leader_timeout_ms);
    println!("  Liveness:       {} ms", config.cluster.liveness_timeout_ms);
    println!("  Election:       {} ms (+{} ms jitter)", config.cluster.election_timeout_ms, config.cluster.election_jitter_ms);
    println!();
    println!("Transfer:");
    println!("  Enabled:        {}", config.transfer.enabled);
    println!("  Address:        {}", config.transfer_address());
    println!("  Data Directory: {}", config.transfer.data_dir.display());
    println!();
    println!("API:              {} ({})", config.api.bind_address, if config.api.enabled { "enabled" } else { "disabled" });

    Ok(())
}
