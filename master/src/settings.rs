//! Settings, layered the usual way: built-in defaults, then the config
//! file under the config root, then environment variables (`__` separator),
//! then command-line flags. Later sources win.

use std::{collections::HashMap, path::PathBuf};

use clap::Parser;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, Map, Source, Value};
use serde::Deserialize;

use daas_primitives::StakeTiers;

use crate::{
	constants::{CONFIG_ROOT, DEFAULT_CONFIG_ROOT},
	gateway::GatewaySettings,
	logging::LoggingSettings,
	metrics::MetricsSettings,
};

#[derive(Parser, Debug, Clone, Default)]
pub struct MasterOptions {
	#[clap(long = "config-root")]
	pub config_root: Option<String>,

	#[clap(long = "cluster.name")]
	cluster_name: Option<String>,

	#[clap(long = "chain.http_endpoint")]
	chain_http_endpoint: Option<String>,

	#[clap(long = "chain.ws_endpoint")]
	chain_ws_endpoint: Option<String>,

	#[clap(long = "chain.signing_key_file")]
	chain_signing_key_file: Option<String>,

	#[clap(long = "gateway.port")]
	gateway_port: Option<String>,

	#[clap(long = "gateway.server_url")]
	gateway_server_url: Option<String>,

	#[clap(long = "control_plane.binary")]
	control_plane_binary: Option<String>,

	#[clap(long = "control_plane.data_dir")]
	control_plane_data_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSettings {
	pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainSettings {
	pub http_endpoint: String,
	pub ws_endpoint: String,
	pub signing_key_file: PathBuf,
	/// Package id of the registry contract, used in the event filter.
	pub registry_package: String,
	pub registry_module: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
	pub cache_capacity: usize,
	pub cache_ttl_secs: u64,
	#[serde(flatten)]
	pub tiers: StakeTiers,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySettings {
	pub capacity: usize,
	pub liveness_deadline_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneSettings {
	pub binary: PathBuf,
	pub data_dir: PathBuf,
	pub node_name: String,
	pub https_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
	pub soft_limit_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MasterSettings {
	pub cluster: ClusterSettings,
	pub chain: ChainSettings,
	pub gateway: GatewaySettings,
	pub auth: AuthSettings,
	pub registry: RegistrySettings,
	pub control_plane: ControlPlaneSettings,
	pub store: StoreSettings,
	pub logging: LoggingSettings,
	pub metrics: MetricsSettings,
}

impl MasterSettings {
	pub fn new(opts: MasterOptions) -> Result<Self, ConfigError> {
		let config_root = opts
			.config_root
			.clone()
			.or_else(|| std::env::var(CONFIG_ROOT).ok())
			.unwrap_or_else(|| DEFAULT_CONFIG_ROOT.to_string());

		let settings: MasterSettings = set_defaults(Config::builder())?
			.add_source(
				File::with_name(&format!("{config_root}/master/Default.toml"))
					.required(false),
			)
			.add_source(Environment::default().separator("__"))
			.add_source(opts)
			.build()?
			.try_deserialize()?;

		settings.validate()?;
		Ok(settings)
	}

	fn validate(&self) -> Result<(), ConfigError> {
		let tiers = &self.auth.tiers;
		if !(tiers.user_stake_mist <= tiers.operator_stake_mist
			&& tiers.operator_stake_mist <= tiers.admin_stake_mist)
		{
			return Err(ConfigError::Message(
				"stake tiers must be ordered user <= operator <= admin".to_string(),
			));
		}
		if self.gateway.tls_cert_file.is_some() != self.gateway.tls_key_file.is_some() {
			return Err(ConfigError::Message(
				"gateway TLS needs both tls_cert_file and tls_key_file".to_string(),
			));
		}
		url::Url::parse(&self.gateway.server_url).map_err(|error| {
			ConfigError::Message(format!("gateway.server_url is not a valid URL: {error}"))
		})?;
		Ok(())
	}
}

fn set_defaults(
	config_builder: ConfigBuilder<config::builder::DefaultState>,
) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
	config_builder
		.set_default("cluster.name", "daas")?
		.set_default("chain.http_endpoint", "http://localhost:9000")?
		.set_default("chain.ws_endpoint", "ws://localhost:9001")?
		.set_default("chain.signing_key_file", "/var/lib/daas/keys/master.key")?
		.set_default("chain.registry_package", "0x0")?
		.set_default("chain.registry_module", "registry")?
		.set_default("gateway.bind_address", "0.0.0.0")?
		.set_default("gateway.port", 8443)?
		.set_default("gateway.server_url", "https://localhost:8443")?
		.set_default("auth.cache_capacity", 4096)?
		.set_default("auth.cache_ttl_secs", 300)?
		.set_default("auth.user_stake_mist", 1_000_000_000u64)?
		.set_default("auth.operator_stake_mist", 5_000_000_000u64)?
		.set_default("auth.admin_stake_mist", 10_000_000_000u64)?
		.set_default("registry.capacity", 10_000)?
		.set_default("registry.liveness_deadline_secs", 300)?
		.set_default("control_plane.binary", "/usr/local/bin/k3s")?
		.set_default("control_plane.data_dir", "/var/lib/daas/control-plane")?
		.set_default("control_plane.node_name", "daas-master")?
		.set_default("control_plane.https_port", 6443)?
		.set_default("store.soft_limit_bytes", 256 * 1024 * 1024)?
		.set_default("logging.filter", "info")?
		.set_default("logging.json", false)?
		.set_default("metrics.enabled", false)?
		.set_default("metrics.hostname", "127.0.0.1")?
		.set_default("metrics.port", 5566)
}

pub fn insert_command_line_option(
	map: &mut HashMap<String, Value>,
	key: &str,
	value: &Option<String>,
) {
	if let Some(value) = value {
		map.insert(key.to_string(), Value::from(value.clone()));
	}
}

impl Source for MasterOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();

		insert_command_line_option(&mut map, "cluster.name", &self.cluster_name);
		insert_command_line_option(&mut map, "chain.http_endpoint", &self.chain_http_endpoint);
		insert_command_line_option(&mut map, "chain.ws_endpoint", &self.chain_ws_endpoint);
		insert_command_line_option(
			&mut map,
			"chain.signing_key_file",
			&self.chain_signing_key_file,
		);
		insert_command_line_option(&mut map, "gateway.port", &self.gateway_port);
		insert_command_line_option(&mut map, "gateway.server_url", &self.gateway_server_url);
		insert_command_line_option(&mut map, "control_plane.binary", &self.control_plane_binary);
		insert_command_line_option(
			&mut map,
			"control_plane.data_dir",
			&self.control_plane_data_dir,
		);

		Ok(map)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use daas_primitives::MIST_PER_SUI;

	#[test]
	fn defaults_load_without_a_config_file() {
		let settings = MasterSettings::new(MasterOptions {
			config_root: Some("/nonexistent".to_string()),
			..Default::default()
		})
		.unwrap();
		assert_eq!(settings.gateway.port, 8443);
		assert_eq!(settings.auth.tiers.user_stake_mist, MIST_PER_SUI);
		assert_eq!(settings.auth.tiers.admin_stake_mist, 10 * MIST_PER_SUI);
		assert_eq!(settings.registry.capacity, 10_000);
	}

	#[test]
	fn command_line_options_override_defaults() {
		let settings = MasterSettings::new(MasterOptions {
			config_root: Some("/nonexistent".to_string()),
			chain_http_endpoint: Some("http://chain:9000".to_string()),
			gateway_port: Some("9443".to_string()),
			..Default::default()
		})
		.unwrap();
		assert_eq!(settings.chain.http_endpoint, "http://chain:9000");
		assert_eq!(settings.gateway.port, 9443);
	}

	fn settings_with(
		overrides: &[(&str, &str)],
	) -> MasterSettings {
		let mut builder = set_defaults(Config::builder()).unwrap();
		for (key, value) in overrides {
			builder = builder.set_override(*key, *value).unwrap();
		}
		builder.build().unwrap().try_deserialize().unwrap()
	}

	#[test]
	fn inverted_stake_tiers_fail_validation() {
		let settings = settings_with(&[("auth.user_stake_mist", "50000000000")]);
		let error = settings.validate().unwrap_err();
		assert!(error.to_string().contains("stake tiers"));
	}

	#[test]
	fn tls_files_must_come_in_pairs() {
		let settings = settings_with(&[("gateway.tls_cert_file", "/etc/daas/tls.crt")]);
		assert!(settings.validate().is_err());
	}
}
