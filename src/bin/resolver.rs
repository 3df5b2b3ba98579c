use std::str::FromStr;
use std::sync::Arc;

use bitcoin::secp256k1::SecretKey;
use clap::Parser;
use escrow_lend::{price_oracle, ChainIndexer, EngineConfig, EscrowEngine, PriceFeed, Result, StorageAdapter};

#[derive(Parser)]
#[command(name = "escrow-lend-resolver")]
#[command(about = "Broadcast-retry sweep for the escrow lending engine")]
#[command(version = "0.1.0")]
struct Cli {
    #[arg(long, default_value = "testnet")]
    network: String,

    #[arg(long)]
    config: Option<String>,

    #[arg(long, env = "PLATFORM_SECRET_KEY")]
    platform_key: String,

    #[arg(long, env = "KMS_KEY_HEX")]
    kms_key: String,

    #[arg(short, long)]
    verbose: bool,
}

async fn build_engine(cli: &Cli) -> Result<EscrowEngine> {
    let config: EngineConfig = if let Some(path) = &cli.config {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)?
    } else {
        match cli.network.as_str() {
            "mainnet" => EngineConfig::mainnet(),
            _ => EngineConfig::testnet(),
        }
    };
    config.validate()?;

    let storage = StorageAdapter::open(&config.database_path)?;

    let platform_secret_key = SecretKey::from_str(&cli.platform_key)
        .map_err(|e| escrow_lend::EscrowError::InvalidConfig(format!("bad platform key: {}", e)))?;

    let kms_bytes = hex::decode(&cli.kms_key)
        .map_err(|e| escrow_lend::EscrowError::InvalidConfig(format!("bad kms key hex: {}", e)))?;
    let mut kms_key = [0u8; 32];
    if kms_bytes.len() != 32 {
        return Err(escrow_lend::EscrowError::InvalidConfig("kms key must be 32 bytes".into()));
    }
    kms_key.copy_from_slice(&kms_bytes);

    let indexer = escrow_lend::chain_monitor::BitcoinRpcIndexer::new(
        &config.chain_indexer_url,
        bitcoincore_rpc::Auth::None,
    )?;
    let price_feed = price_oracle::AggregatorPriceFeed::new(config.price_oracle_url.clone())
        .with_fallback(60_000.0, 55_000.0);

    EscrowEngine::new(
        config,
        storage,
        Box::new(indexer) as Box<dyn ChainIndexer>,
        Box::new(price_feed) as Box<dyn PriceFeed>,
        platform_secret_key,
        kms_key,
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let engine = Arc::new(build_engine(&cli).await?);

    log::info!("retry sweep starting, network={}", cli.network);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let sweep_task = tokio::spawn(engine.clone().run_retry_sweep_loop(shutdown_rx));

    tokio::signal::ctrl_c().await.ok();
    log::info!("shutdown signal received, stopping retry sweep");
    let _ = shutdown_tx.send(true);

    let _ = sweep_task.await;
    log::info!("retry sweep stopped");

    Ok(())
}
