use std::{collections::HashMap, path::PathBuf};

use clap::Parser;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, Map, Source, Value};
use serde::Deserialize;

pub const CONFIG_ROOT: &str = "DAAS_CONFIG_ROOT";
pub const DEFAULT_CONFIG_ROOT: &str = "/etc/daas";

#[derive(Parser, Debug, Clone, Default)]
pub struct WorkerOptions {
	#[clap(long = "config-root")]
	pub config_root: Option<String>,

	#[clap(long = "node.id")]
	node_id: Option<String>,

	#[clap(long = "node.stake_amount_mist")]
	stake_amount_mist: Option<String>,

	#[clap(long = "master.url")]
	master_url: Option<String>,

	#[clap(long = "chain.http_endpoint")]
	chain_http_endpoint: Option<String>,

	#[clap(long = "chain.signing_key_file")]
	chain_signing_key_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSettings {
	pub id: String,
	pub stake_amount_mist: u64,
	pub gas_budget: u64,
	pub node_agent_binary: PathBuf,
	/// Enclave-local path where the derived seal token is cached.
	pub token_cache_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MasterEndpointSettings {
	pub url: String,
	/// The master's gateway certificate is enclave-bound and verified out
	/// of band through attestation, not through a public CA.
	pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerChainSettings {
	pub http_endpoint: String,
	pub signing_key_file: PathBuf,
	pub registry_package: String,
	pub registry_module: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerLoggingSettings {
	pub filter: String,
	pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
	pub node: NodeSettings,
	pub master: MasterEndpointSettings,
	pub chain: WorkerChainSettings,
	pub logging: WorkerLoggingSettings,
}

impl WorkerSettings {
	pub fn new(opts: WorkerOptions) -> Result<Self, ConfigError> {
		let config_root = opts
			.config_root
			.clone()
			.or_else(|| std::env::var(CONFIG_ROOT).ok())
			.unwrap_or_else(|| DEFAULT_CONFIG_ROOT.to_string());

		set_defaults(Config::builder())?
			.add_source(
				File::with_name(&format!("{config_root}/worker/Default.toml"))
					.required(false),
			)
			.add_source(Environment::default().separator("__"))
			.add_source(opts)
			.build()?
			.try_deserialize()
	}
}

fn set_defaults(
	config_builder: ConfigBuilder<config::builder::DefaultState>,
) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
	config_builder
		.set_default("node.id", "")?
		.set_default("node.stake_amount_mist", 2_000_000_000u64)?
		.set_default("node.gas_budget", 10_000_000u64)?
		.set_default("node.node_agent_binary", "/usr/local/bin/k3s-agent")?
		.set_default("node.token_cache_file", "/var/lib/daas/worker/seal-token")?
		.set_default("master.url", "https://localhost:8443")?
		.set_default("master.accept_invalid_certs", true)?
		.set_default("chain.http_endpoint", "http://localhost:9000")?
		.set_default("chain.signing_key_file", "/var/lib/daas/keys/worker.key")?
		.set_default("chain.registry_package", "0x0")?
		.set_default("chain.registry_module", "registry")?
		.set_default("logging.filter", "info")?
		.set_default("logging.json", false)
}

fn insert_command_line_option(
	map: &mut HashMap<String, Value>,
	key: &str,
	value: &Option<String>,
) {
	if let Some(value) = value {
		map.insert(key.to_string(), Value::from(value.clone()));
	}
}

impl Source for WorkerOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();

		insert_command_line_option(&mut map, "node.id", &self.node_id);
		insert_command_line_option(&mut map, "node.stake_amount_mist", &self.stake_amount_mist);
		insert_command_line_option(&mut map, "master.url", &self.master_url);
		insert_command_line_option(&mut map, "chain.http_endpoint", &self.chain_http_endpoint);
		insert_command_line_option(
			&mut map,
			"chain.signing_key_file",
			&self.chain_signing_key_file,
		);

		Ok(map)
	}
}

pub fn init_logging(settings: &WorkerLoggingSettings) {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| settings.filter.clone().into());
	let builder = tracing_subscriber::fmt().with_env_filter(filter);
	if settings.json {
		builder.json().init();
	} else {
		builder.init();
	}
}
