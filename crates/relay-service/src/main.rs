//! Main entry point for the RGB++ relay service.
//!
//! This binary wires concrete provider implementations (Bitcoin data
//! source, SPV oracle, CKB node, remote signer) into the relay engine
//! according to configuration, recovers durable state, and runs the
//! settlement worker and reconciler until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use relay_bitcoin::implementations::{core_rpc::CoreRpcSource, esplora::EsploraSource};
use relay_bitcoin::{BitcoinDataSource, HttpSpvClient, SpvClient};
use relay_ckb::implementations::rpc::RpcCkbClient;
use relay_ckb::{CkbClient, HttpSigner, SignerInterface};
use relay_config::{BitcoinSourceKind, RelayConfig};
use relay_core::{Providers, RelayEngine};

/// Command-line arguments for the relay service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

/// Builds the configured provider implementations.
fn build_providers(config: &RelayConfig) -> Providers {
	let btc: Arc<dyn BitcoinDataSource> = match config.bitcoin.source {
		BitcoinSourceKind::Esplora => Arc::new(EsploraSource::new(config.bitcoin.url.clone())),
		BitcoinSourceKind::CoreRpc => Arc::new(CoreRpcSource::new(
			config.bitcoin.url.clone(),
			// Presence is enforced by configuration validation.
			config.bitcoin.rpc_user.clone().unwrap_or_default(),
			config.bitcoin.rpc_password.clone().unwrap_or_default(),
		)),
	};
	let spv: Arc<dyn SpvClient> = Arc::new(HttpSpvClient::new(config.bitcoin.spv_url.clone()));
	let ckb: Arc<dyn CkbClient> = Arc::new(RpcCkbClient::new(config.ckb.rpc_url.clone()));
	let signer: Arc<dyn SignerInterface> =
		Arc::new(HttpSigner::new(config.ckb.signer_url.clone()));
	Providers {
		btc,
		spv,
		ckb,
		signer,
	}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	// Initialize tracing with env filter
	use tracing_subscriber::{fmt, EnvFilter};
	let env_filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started relay");

	let config = RelayConfig::from_file(&args.config)?;
	tracing::info!("Loaded configuration [{}]", config.relay.id);

	let providers = build_providers(&config);
	let engine = RelayEngine::new(config, providers)?;

	engine.recover().await?;
	engine.run().await?;

	tracing::info!("Stopped relay");
	Ok(())
}
