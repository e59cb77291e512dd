use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use seal_control::config::{Config, LogFormat, TeeMode};
use seal_control::executor::{Executor, KubectlExecutor};
use seal_control::ledger::{HttpLedgerAdapter, MockLedgerAdapter};
use seal_control::lifecycle::Bridge;
use seal_control::registry::RandomJoinTokenIssuer;

#[derive(Parser)]
#[command(name = "seal-control", about = "Blockchain-mediated Kubernetes control bridge")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override the node identity used as `executor` in emitted results.
    #[arg(long)]
    node_id: Option<String>,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::load_from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config from {}: {e}", cli.config);
            eprintln!("falling back to built-in defaults");
            let config = Config::default();
            config.validate().context("default configuration failed validation")?;
            config
        }
    };

    init_tracing(&config);

    let node_id = cli.node_id.unwrap_or_else(|| format!("control-node-{}", Uuid::new_v4().simple()));
    tracing::info!(%node_id, tee_mode = ?config.tee_mode, "starting seal-control");

    let executor: Arc<dyn Executor> = Arc::new(KubectlExecutor::with_options(
        node_id.clone(),
        Duration::from_secs(config.exec_timeout_secs),
        config.exec_parallelism,
        config.queue_capacity,
        config.max_captured_output_bytes,
    ));
    let join_issuer = Arc::new(RandomJoinTokenIssuer);

    match config.tee_mode {
        TeeMode::Simulation => {
            let ledger = Arc::new(MockLedgerAdapter::new());
            let bridge = Arc::new(Bridge::bootstrap(config, ledger, executor, join_issuer, node_id).await?);
            bridge.run().await
        }
        TeeMode::Real => {
            let rpc_url = config.ledger_rpc_url.clone();
            let package_id = config.contract_package_id.clone();
            let signer_handle = config.signer_handle.clone();
            let ledger = Arc::new(HttpLedgerAdapter::new(rpc_url, package_id, signer_handle));
            let bridge = Arc::new(Bridge::bootstrap(config, ledger, executor, join_issuer, node_id).await?);
            bridge.run().await
        }
    }
}
