//! The authenticating API gateway: TLS termination, seal-token
//! authentication, identity-header injection and transparent proxying of
//! the Kubernetes API surface, plus the admin endpoints workers talk to.
//!
//! The gateway authenticates only. Authorization stays with the embedded
//! control plane's RBAC, driven by the groups we inject.

pub mod admin;
pub mod kubeconfig;
pub mod proxy;
pub mod rate_limit;

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::info;
use warp::{
	http::{HeaderMap, Method, StatusCode},
	path::FullPath,
	Filter, Reply,
};

use daas_primitives::SealToken;

use crate::{
	auth::{AuthError, Authenticator},
	constants::{
		MAX_CONCURRENT_CONNECTIONS, PROXY_REQUEST_TIMEOUT, RATE_LIMIT_BURST,
		RATE_LIMIT_PER_SECOND, REGISTRATION_WAIT,
	},
	gateway::{admin::status_json, proxy::ProxyClient, rate_limit::RateLimiter},
	metrics::RATE_LIMITED_REQUESTS,
	registry::RegistryHandle,
	supervisor::ControlPlaneApi,
};

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
	pub bind_address: String,
	pub port: u16,
	/// URL advertised to workers and embedded in kubeconfigs.
	pub server_url: String,
	pub tls_cert_file: Option<String>,
	pub tls_key_file: Option<String>,
}

pub struct GatewayState {
	pub auth: Arc<Authenticator>,
	pub registry: RegistryHandle,
	pub control_plane: Arc<dyn ControlPlaneApi>,
	pub attestation: Arc<crate::attestation::AttestationProvider>,
	pub proxy: ProxyClient,
	pub rate_limiter: RateLimiter,
	pub server_url: String,
	pub cluster_name: String,
	pub connection_semaphore: Arc<Semaphore>,
	pub registration_wait: Duration,
	pub proxy_timeout: Duration,
}

impl GatewayState {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		auth: Arc<Authenticator>,
		registry: RegistryHandle,
		control_plane: Arc<dyn ControlPlaneApi>,
		attestation: Arc<crate::attestation::AttestationProvider>,
		proxy: ProxyClient,
		server_url: String,
		cluster_name: String,
	) -> Self {
		Self {
			auth,
			registry,
			control_plane,
			attestation,
			proxy,
			rate_limiter: RateLimiter::new(RATE_LIMIT_PER_SECOND, RATE_LIMIT_BURST),
			server_url,
			cluster_name,
			connection_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTIONS)),
			registration_wait: REGISTRATION_WAIT,
			proxy_timeout: PROXY_REQUEST_TIMEOUT,
		}
	}
}

fn with_state(
	state: Arc<GatewayState>,
) -> impl Filter<Extract = (Arc<GatewayState>,), Error = Infallible> + Clone {
	warp::any().map(move || state.clone())
}

/// The full route tree: health, admin, then the proxied API surface.
pub fn routes(
	state: Arc<GatewayState>,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
	let healthz = warp::path("healthz")
		.and(warp::path::end())
		.and(with_state(state.clone()))
		.map(|state: Arc<GatewayState>| health_reply(&state, "ok"));

	let readyz = warp::path("readyz")
		.and(warp::path::end())
		.and(with_state(state.clone()))
		.map(|state: Arc<GatewayState>| health_reply(&state, "ready"));

	let register_worker = warp::path!("admin" / "v1" / "register-worker")
		.and(warp::post())
		.and(warp::body::json())
		.and(warp::header::optional::<String>("x-seal-token"))
		.and(with_state(state.clone()))
		.and_then(admin::register_worker);

	let heartbeat = warp::path!("admin" / "v1" / "heartbeat")
		.and(warp::post())
		.and(warp::body::json())
		.and(with_state(state.clone()))
		.and_then(admin::heartbeat);

	let attestation = warp::path!("admin" / "v1" / "attestation")
		.and(warp::get())
		.and(warp::query::<std::collections::HashMap<String, String>>())
		.and(with_state(state.clone()))
		.and_then(admin::attestation);

	let kubeconfig = warp::path!("admin" / "v1" / "kubeconfig")
		.and(warp::get())
		.and(warp::query::<std::collections::HashMap<String, String>>())
		.and(with_state(state.clone()))
		.and_then(admin::kubeconfig);

	let api_proxy = warp::any()
		.and(warp::method())
		.and(warp::path::full())
		.and(
			warp::filters::query::raw()
				.map(Some)
				.or(warp::any().map(|| None))
				.unify(),
		)
		.and(warp::header::headers_cloned())
		.and(warp::addr::remote())
		.and(warp::body::stream())
		.and(with_state(state))
		.and_then(proxy_request);

	healthz
		.or(readyz)
		.or(register_worker)
		.or(heartbeat)
		.or(attestation)
		.or(kubeconfig)
		.or(api_proxy)
}

fn health_reply(state: &GatewayState, ready_body: &'static str) -> warp::reply::Response {
	if state.control_plane.is_ready() {
		warp::reply::with_status(ready_body, StatusCode::OK).into_response()
	} else {
		warp::reply::with_status("control plane starting", StatusCode::SERVICE_UNAVAILABLE)
			.into_response()
	}
}

async fn proxy_request(
	method: Method,
	path: FullPath,
	raw_query: Option<String>,
	headers: HeaderMap,
	remote: Option<SocketAddr>,
	body: impl futures::Stream<Item = Result<impl warp::Buf, warp::Error>>
		+ Send
		+ Sync
		+ 'static,
	state: Arc<GatewayState>,
) -> Result<warp::reply::Response, Infallible> {
	let Some(token) = extract_token(&headers, raw_query.as_deref()) else {
		return Ok(status_json(
			StatusCode::UNAUTHORIZED,
			serde_json::json!({
				"status": "unauthenticated",
				"reason": "MissingToken",
				"message": "seal token required",
			}),
		));
	};

	let identity = match state.auth.authenticate(&token).await {
		Ok(identity) => identity,
		Err(error @ AuthError::MalformedToken) => {
			if let Some(remote) = remote {
				if !state.rate_limiter.check(remote.ip()) {
					RATE_LIMITED_REQUESTS.inc();
					return Ok(status_json(
						StatusCode::TOO_MANY_REQUESTS,
						serde_json::json!({ "status": "rate-limited" }),
					));
				}
			}
			return Ok(admin::auth_error_response(&error));
		},
		Err(error) => return Ok(admin::auth_error_response(&error)),
	};

	if !state.control_plane.is_ready() {
		let mut response = status_json(
			StatusCode::SERVICE_UNAVAILABLE,
			serde_json::json!({ "status": "error", "reason": "NotReady" }),
		);
		response
			.headers_mut()
			.insert(warp::http::header::RETRY_AFTER, warp::http::HeaderValue::from(2));
		return Ok(response);
	}

	let Ok(permit) = state.connection_semaphore.clone().try_acquire_owned() else {
		return Ok(status_json(
			StatusCode::SERVICE_UNAVAILABLE,
			serde_json::json!({ "status": "error", "reason": "ResourceExhausted" }),
		));
	};

	let response = state
		.proxy
		.forward(method, path, raw_query, headers, body, &identity, state.proxy_timeout)
		.await;
	// The permit rides along until the response body has fully streamed.
	let (parts, body) = response.into_parts();
	Ok(warp::reply::Response::from_parts(
		parts,
		warp::hyper::Body::wrap_stream(proxy::StreamWithPermit::new(body, permit)),
	))
}

/// Bearer token from `Authorization`, `X-Seal-Token` or `?token=`.
fn extract_token(headers: &HeaderMap, raw_query: Option<&str>) -> Option<SealToken> {
	if let Some(value) = headers.get(warp::http::header::AUTHORIZATION) {
		if let Ok(value) = value.to_str() {
			if let Some(bearer) = value.strip_prefix("Bearer ") {
				return Some(SealToken::new(bearer.trim()));
			}
		}
	}
	if let Some(value) = headers.get("x-seal-token") {
		if let Ok(value) = value.to_str() {
			return Some(SealToken::new(value.trim()));
		}
	}
	raw_query?.split('&').find_map(|pair| {
		pair.strip_prefix("token=").map(|token| SealToken::new(token))
	})
}

/// Serve the gateway; TLS when certificate material is configured, plain
/// only for tests and local bring-up.
pub async fn serve(settings: GatewaySettings, state: Arc<GatewayState>) -> anyhow::Result<()> {
	let address: SocketAddr =
		format!("{}:{}", settings.bind_address, settings.port).parse()?;
	let filter = routes(state);
	match (&settings.tls_cert_file, &settings.tls_key_file) {
		(Some(cert_file), Some(key_file)) => {
			info!(%address, "Gateway listening with TLS");
			warp::serve(filter)
				.tls()
				.cert_path(cert_file)
				.key_path(key_file)
				.run(address)
				.await;
		},
		_ => {
			info!(%address, "Gateway listening without TLS");
			warp::serve(filter).run(address).await;
		},
	}
	Ok(())
}
