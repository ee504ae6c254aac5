//! Kubeconfig generation for seal-token holders. The token lands in
//! `users[].user.token`, which is exactly where kubectl sends it back from.

use serde::{Deserialize, Serialize};

use daas_primitives::SealToken;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfig {
	kind: String,
	api_version: String,
	clusters: Vec<NamedCluster>,
	contexts: Vec<NamedContext>,
	#[serde(rename = "current-context")]
	current_context: String,
	users: Vec<NamedUser>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedCluster {
	name: String,
	cluster: Cluster,
}

#[derive(Debug, Serialize, Deserialize)]
struct Cluster {
	server: String,
	#[serde(rename = "insecure-skip-tls-verify", skip_serializing_if = "Option::is_none")]
	insecure_skip_tls_verify: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedContext {
	name: String,
	context: Context,
}

#[derive(Debug, Serialize, Deserialize)]
struct Context {
	cluster: String,
	user: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedUser {
	name: String,
	user: User,
}

#[derive(Debug, Serialize, Deserialize)]
struct User {
	token: String,
}

impl KubeConfig {
	pub fn for_token(server_url: &str, cluster_name: &str, token: &SealToken) -> Self {
		let user_name = format!("{cluster_name}-user");
		KubeConfig {
			kind: "Config".to_string(),
			api_version: "v1".to_string(),
			clusters: vec![NamedCluster {
				name: cluster_name.to_string(),
				cluster: Cluster {
					server: server_url.to_string(),
					// The gateway terminates TLS with the enclave-bound
					// certificate; clients pin it out of band.
					insecure_skip_tls_verify: Some(true),
				},
			}],
			contexts: vec![NamedContext {
				name: cluster_name.to_string(),
				context: Context {
					cluster: cluster_name.to_string(),
					user: user_name.clone(),
				},
			}],
			current_context: cluster_name.to_string(),
			users: vec![NamedUser {
				name: user_name,
				user: User { token: token.expose().to_string() },
			}],
		}
	}

	pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
		serde_yaml::to_string(self)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kubeconfig_embeds_the_token_and_server() {
		let token = SealToken::new("ab".repeat(32));
		let yaml = KubeConfig::for_token("https://master:6443", "daas", &token)
			.to_yaml()
			.unwrap();

		assert!(yaml.contains("server: https://master:6443"));
		assert!(yaml.contains(&format!("token: {}", token.expose())));
		assert!(yaml.contains("current-context: daas"));

		// And it round-trips as a valid kubeconfig document.
		let parsed: KubeConfig = serde_yaml::from_str(&yaml).unwrap();
		assert_eq!(parsed.users.len(), 1);
		assert_eq!(parsed.users[0].user.token, token.expose());
	}
}
