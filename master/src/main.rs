//! The attested control-plane host: starts the embedded Kubernetes control
//! plane, bridges on-chain registry events into the worker roster, and
//! serves the authenticating API gateway.

use std::{fmt, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{error, info};
use utilities::task_scope::task_scope;

use daas_chain::{
	ChainClient, ChainHttpRpcClient, ChainSigner, EventFilter, EventSubscription,
};
use daas_master::{
	attestation::AttestationProvider,
	auth::{Authenticator, StakeReader},
	constants::{
		AUTH_SWEEP_INTERVAL, CHAIN_READ_TIMEOUT, EVENT_BACKLOG_CAPACITY,
		EXIT_ATTESTATION_FAILURE, EXIT_CHAIN_UNREACHABLE, EXIT_CONTROL_PLANE_TIMEOUT,
		LIVENESS_SWEEP_INTERVAL, READINESS_TIMEOUT,
	},
	event_bridge::EventBridge,
	gateway::{self, proxy::ProxyClient, GatewayState},
	logging, metrics, registry,
	settings::{MasterOptions, MasterSettings},
	store::StateStore,
	supervisor::{self, ControlPlaneApi, ControlPlaneConfig},
};

/// Marker context that carries the process exit code through anyhow.
#[derive(Debug, Clone, Copy)]
struct ExitWith(i32);

impl fmt::Display for ExitWith {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "exit code {}", self.0)
	}
}

#[tokio::main]
async fn main() {
	let settings = match MasterSettings::new(MasterOptions::parse()) {
		Ok(settings) => settings,
		Err(error) => {
			eprintln!("Error reading settings: {error}");
			std::process::exit(1);
		},
	};

	logging::init(&settings.logging);
	metrics::register_metrics();
	info!("Starting daas master");

	let code = match run(settings).await {
		Ok(()) => 0,
		Err(error) => {
			error!("Master failed: {error:#}");
			error.downcast_ref::<ExitWith>().map(|exit| exit.0).unwrap_or(1)
		},
	};
	std::process::exit(code);
}

async fn run(settings: MasterSettings) -> anyhow::Result<()> {
	// Keys and attestation first, so misconfiguration is diagnosed before
	// anything is spawned.
	let signer = Arc::new(
		ChainSigner::from_key_file(&settings.chain.signing_key_file)
			.context(ExitWith(EXIT_CHAIN_UNREACHABLE))?,
	);

	let attestation = Arc::new(AttestationProvider::new_simulated(
		&settings.cluster.name,
		signer.public_key().as_bytes(),
	));
	let startup_document = attestation.attest("startup-self-check");
	AttestationProvider::verify(&startup_document)
		.map_err(anyhow::Error::from)
		.context(ExitWith(EXIT_ATTESTATION_FAILURE))?;
	info!(simulated = attestation.simulated(), "Attestation self-check passed");

	let rpc = ChainHttpRpcClient::new(&settings.chain.http_endpoint, CHAIN_READ_TIMEOUT)
		.context(ExitWith(EXIT_CHAIN_UNREACHABLE))?;
	let chain = Arc::new(ChainClient::new(rpc, signer.clone()));
	// Reachability probe; our own wallet simply may not have a stake yet.
	chain
		.get_stake(signer.address())
		.await
		.map(|_| ())
		.context("Chain RPC endpoint unreachable")
		.context(ExitWith(EXIT_CHAIN_UNREACHABLE))?;
	info!(endpoint = %settings.chain.http_endpoint, "Chain RPC reachable");

	let store = Arc::new(StateStore::new(settings.store.soft_limit_bytes));

	task_scope(|scope| {
		async move {
			let (registry_handle, registry_task) =
				registry::start(settings.registry.capacity, store.clone());
			scope.spawn_weak(registry_task);

			let (control_plane, supervisor_task) = supervisor::start(ControlPlaneConfig {
				binary: settings.control_plane.binary.clone(),
				data_dir: settings.control_plane.data_dir.clone(),
				node_name: settings.control_plane.node_name.clone(),
				https_port: settings.control_plane.https_port,
				readiness_timeout: READINESS_TIMEOUT,
			})
			.context(ExitWith(EXIT_CONTROL_PLANE_TIMEOUT))?;
			scope.spawn(supervisor_task);
			control_plane
				.wait_ready()
				.await
				.context(ExitWith(EXIT_CONTROL_PLANE_TIMEOUT))?;

			let stake_reader: Arc<dyn StakeReader> = chain.clone();
			let control_plane_api: Arc<dyn ControlPlaneApi> = control_plane.clone();

			let auth = Arc::new(Authenticator::with_cache(
				stake_reader,
				settings.auth.tiers,
				settings.auth.cache_capacity,
				Duration::from_secs(settings.auth.cache_ttl_secs),
			));
			scope.spawn_weak(auth.clone().run_sweeper(AUTH_SWEEP_INTERVAL));
			scope.spawn_weak(registry_handle.clone().run_liveness_sweeper(
				LIVENESS_SWEEP_INTERVAL,
				Duration::from_secs(settings.registry.liveness_deadline_secs),
			));

			let (event_sender, event_receiver) = mpsc::channel(EVENT_BACKLOG_CAPACITY);
			scope.spawn_weak(
				EventSubscription::new(
					&settings.chain.ws_endpoint,
					EventFilter {
						package: settings.chain.registry_package.clone(),
						module: settings.chain.registry_module.clone(),
					},
				)
				.run(event_sender),
			);
			scope.spawn_weak(
				EventBridge::new(
					registry_handle.clone(),
					auth.clone(),
					control_plane_api.clone(),
					store.clone(),
				)
				.run(event_receiver),
			);

			let proxy = ProxyClient::new(format!(
				"https://127.0.0.1:{}",
				settings.control_plane.https_port
			))?;
			let gateway_state = Arc::new(GatewayState::new(
				auth,
				registry_handle,
				control_plane_api,
				attestation,
				proxy,
				settings.gateway.server_url.clone(),
				settings.cluster.name.clone(),
			));
			scope.spawn_weak(gateway::serve(settings.gateway.clone(), gateway_state));

			if settings.metrics.enabled {
				metrics::start(scope, &settings.metrics)?;
			}

			shutdown_signal().await;
			info!("Shutdown signal received");
			control_plane.stop();
			Ok(())
		}
		.boxed()
	})
	.await
}

async fn shutdown_signal() {
	let ctrl_c = async {
		tokio::signal::ctrl_c().await.ok();
	};

	#[cfg(unix)]
	let terminate = async {
		tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
