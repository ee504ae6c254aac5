//! Worker host agent: stakes on chain, derives a seal token, registers with
//! the master and supervises the embedded node agent.

use std::{sync::Arc, time::Duration};

use clap::Parser;
use tracing::{error, info};

use daas_chain::{ChainClient, ChainHttpRpcClient};
use daas_worker::{
	agent::WorkerAgent,
	settings::{init_logging, WorkerOptions, WorkerSettings},
	token,
};

const CHAIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
	let mut settings = match WorkerSettings::new(WorkerOptions::parse()) {
		Ok(settings) => settings,
		Err(error) => {
			eprintln!("Error reading settings: {error}");
			std::process::exit(1);
		},
	};

	init_logging(&settings.logging);

	let signer = match token::load_or_create_signer(&settings.chain.signing_key_file) {
		Ok(signer) => Arc::new(signer),
		Err(error) => {
			error!("Could not load the worker signing key: {error:#}");
			std::process::exit(1);
		},
	};

	if settings.node.id.is_empty() {
		// A fresh node id per wallet keeps re-staking from colliding with
		// an earlier registration under a different key.
		settings.node.id = format!(
			"w-{}",
			&signer.address().0.trim_start_matches("0x")[..12]
		);
	}
	info!(node_id = %settings.node.id, wallet = %signer.address(), "Starting daas worker");

	let rpc = match ChainHttpRpcClient::new(&settings.chain.http_endpoint, CHAIN_REQUEST_TIMEOUT)
	{
		Ok(rpc) => rpc,
		Err(error) => {
			error!("Could not create chain RPC client: {error:#}");
			std::process::exit(1);
		},
	};
	let chain = Arc::new(ChainClient::new(rpc, signer.clone()));

	let agent = match WorkerAgent::new(settings, chain, signer) {
		Ok(agent) => agent,
		Err(error) => {
			error!("Could not construct the worker agent: {error:#}");
			std::process::exit(1);
		},
	};

	if let Err(error) = agent.run().await {
		error!("Worker agent stopped: {error:#}");
		std::process::exit(1);
	}
}
