//! Streaming reverse proxy to the embedded control plane.
//!
//! Bodies stream through in both directions, never buffered. The only
//! rewriting is on identity: inbound copies of the identity headers are
//! stripped and the authenticated identity is injected.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::{Stream, TryStreamExt};
use tracing::debug;
use warp::{
	http::{header, HeaderMap, HeaderValue, Method, Response, StatusCode},
	hyper,
	path::FullPath,
	Buf,
};

use daas_primitives::Identity;

use crate::metrics::PROXIED_REQUESTS;

pub const REMOTE_USER_HEADER: &str = "x-remote-user";
pub const REMOTE_GROUP_HEADER: &str = "x-remote-group";
pub const WALLET_ADDRESS_HEADER: &str = "x-wallet-address";

// Connection-scoped headers that must not travel across the proxy hop.
const HOP_BY_HOP_HEADERS: &[&str] = &[
	"connection",
	"host",
	"keep-alive",
	"proxy-authenticate",
	"proxy-authorization",
	"te",
	"trailer",
	"transfer-encoding",
	"upgrade",
];

#[derive(Clone)]
pub struct ProxyClient {
	client: reqwest::Client,
	upstream_base: String,
}

impl ProxyClient {
	/// `upstream_base` is the control plane's local endpoint, e.g.
	/// `https://127.0.0.1:6443`. Its certificate is self-signed inside the
	/// enclave, hence the relaxed TLS verification on this loopback hop.
	pub fn new(upstream_base: String) -> Result<Self> {
		Ok(Self {
			client: reqwest::Client::builder()
				.danger_accept_invalid_certs(true)
				.build()
				.context("Failed to build proxy client")?,
			upstream_base,
		})
	}

	pub async fn forward(
		&self,
		method: Method,
		path: FullPath,
		raw_query: Option<String>,
		mut headers: HeaderMap,
		body: impl Stream<Item = Result<impl Buf, warp::Error>> + Send + Sync + 'static,
		identity: &Identity,
		timeout: Duration,
	) -> Response<hyper::Body> {
		let mut url = format!("{}{}", self.upstream_base, path.as_str());
		if let Some(query) = raw_query.filter(|query| !query.is_empty()) {
			url.push('?');
			url.push_str(&query);
		}

		for name in HOP_BY_HOP_HEADERS {
			headers.remove(*name);
		}
		// Identity headers are ours alone; inbound copies are spoofing.
		headers.remove(REMOTE_USER_HEADER);
		headers.remove(REMOTE_GROUP_HEADER);
		headers.remove(WALLET_ADDRESS_HEADER);
		if let Ok(value) = HeaderValue::from_str(&identity.principal_name) {
			headers.insert(REMOTE_USER_HEADER, value);
		}
		for group in &identity.groups {
			if let Ok(value) = HeaderValue::from_str(group) {
				headers.append(REMOTE_GROUP_HEADER, value);
			}
		}
		if let Ok(value) = HeaderValue::from_str(&identity.wallet_address.0) {
			headers.insert(WALLET_ADDRESS_HEADER, value);
		}

		let body = reqwest::Body::wrap_stream(
			body.map_ok(|mut chunk| chunk.copy_to_bytes(chunk.remaining())),
		);

		let request =
			self.client.request(method, &url).headers(headers).body(body).send();
		let upstream_response = match tokio::time::timeout(timeout, request).await {
			Err(_elapsed) => {
				return error_response(
					StatusCode::GATEWAY_TIMEOUT,
					"control plane did not answer in time",
				)
			},
			Ok(Err(error)) => {
				debug!("Proxy request failed: {error}");
				return error_response(
					StatusCode::BAD_GATEWAY,
					"control plane unreachable",
				);
			},
			Ok(Ok(response)) => response,
		};

		PROXIED_REQUESTS.inc();

		let mut builder = Response::builder().status(upstream_response.status());
		for (name, value) in upstream_response.headers() {
			if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
				builder = builder.header(name, value);
			}
		}
		builder
			.body(hyper::Body::wrap_stream(upstream_response.bytes_stream()))
			.unwrap_or_else(|_| {
				error_response(StatusCode::BAD_GATEWAY, "invalid upstream response")
			})
	}
}

/// Keeps a connection-cap permit alive for as long as the response body is
/// being streamed to the client.
pub struct StreamWithPermit<S> {
	stream: S,
	_permit: tokio::sync::OwnedSemaphorePermit,
}

impl<S> StreamWithPermit<S> {
	pub fn new(stream: S, permit: tokio::sync::OwnedSemaphorePermit) -> Self {
		Self { stream, _permit: permit }
	}
}

impl<S: Stream + Unpin> Stream for StreamWithPermit<S> {
	type Item = S::Item;

	fn poll_next(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<Option<Self::Item>> {
		std::pin::Pin::new(&mut self.stream).poll_next(cx)
	}
}

fn error_response(status: StatusCode, message: &str) -> Response<hyper::Body> {
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "application/json")
		.body(hyper::Body::from(
			serde_json::json!({ "status": "error", "message": message }).to_string(),
		))
		.expect("static response builds")
}
