//! Bounded retry with exponential backoff and jitter for chain calls.
//!
//! Transient failures are retried up to the policy's attempt budget;
//! permanent failures ([`ChainError::is_retryable`] == false) surface to
//! the caller immediately.

use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::warn;

use crate::error::ChainError;

pub type Attempt = u32;

/// Names a request in retry logs without carrying any payload secrets.
#[derive(Debug, Clone)]
pub struct RequestLog {
	pub request_name: &'static str,
	pub detail: Option<String>,
}

impl RequestLog {
	pub fn new(request_name: &'static str, detail: Option<String>) -> Self {
		Self { request_name, detail }
	}
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
	pub base_delay: Duration,
	pub max_delay: Duration,
	/// Fractional jitter applied symmetrically, e.g. 0.2 for ±20%.
	pub jitter: f64,
	pub max_attempts: Attempt,
}

impl Default for BackoffPolicy {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_millis(500),
			max_delay: Duration::from_secs(8),
			jitter: 0.2,
			max_attempts: 5,
		}
	}
}

impl BackoffPolicy {
	/// Delay before the retry following `attempt` (0-based).
	pub fn delay(&self, attempt: Attempt) -> Duration {
		let exponential = self
			.base_delay
			.saturating_mul(2u32.saturating_pow(attempt))
			.min(self.max_delay);
		let jitter_factor =
			1.0 + self.jitter * rand::thread_rng().gen_range(-1.0..=1.0);
		exponential.mul_f64(jitter_factor.max(0.0))
	}
}

/// Run `request` until it succeeds, fails permanently, or the attempt
/// budget is exhausted.
pub async fn with_retries<T, F, Fut>(
	policy: BackoffPolicy,
	log: RequestLog,
	mut request: F,
) -> Result<T, ChainError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, ChainError>>,
{
	let mut attempt: Attempt = 0;
	loop {
		match request().await {
			Ok(value) => return Ok(value),
			Err(error) if error.is_retryable() && attempt + 1 < policy.max_attempts => {
				let delay = policy.delay(attempt);
				warn!(
					request = log.request_name,
					detail = log.detail.as_deref().unwrap_or(""),
					attempt,
					?delay,
					"Chain request failed transiently, retrying: {error}"
				);
				tokio::time::sleep(delay).await;
				attempt += 1;
			},
			Err(error) => return Err(error),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	fn fast_policy() -> BackoffPolicy {
		BackoffPolicy {
			base_delay: Duration::from_millis(1),
			max_delay: Duration::from_millis(4),
			jitter: 0.2,
			max_attempts: 5,
		}
	}

	#[tokio::test]
	async fn retries_transient_errors_until_success() {
		let calls = AtomicU32::new(0);
		let result = with_retries(fast_policy(), RequestLog::new("get_stake", None), || {
			let attempt = calls.fetch_add(1, Ordering::Relaxed);
			async move {
				if attempt < 2 {
					Err(ChainError::Transient(anyhow::anyhow!("rpc timeout")))
				} else {
					Ok(attempt)
				}
			}
		})
		.await
		.unwrap();
		assert_eq!(result, 2);
		assert_eq!(calls.load(Ordering::Relaxed), 3);
	}

	#[tokio::test]
	async fn gives_up_after_attempt_budget() {
		let calls = AtomicU32::new(0);
		let result: Result<(), _> =
			with_retries(fast_policy(), RequestLog::new("execute", None), || {
				calls.fetch_add(1, Ordering::Relaxed);
				async { Err(ChainError::Transient(anyhow::anyhow!("unreachable node"))) }
			})
			.await;
		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::Relaxed), 5);
	}

	#[tokio::test]
	async fn permanent_errors_are_not_retried() {
		let calls = AtomicU32::new(0);
		let result: Result<(), _> =
			with_retries(fast_policy(), RequestLog::new("execute", None), || {
				calls.fetch_add(1, Ordering::Relaxed);
				async { Err(ChainError::ContractAbort(3)) }
			})
			.await;
		assert!(matches!(result, Err(ChainError::ContractAbort(3))));
		assert_eq!(calls.load(Ordering::Relaxed), 1);
	}

	#[test]
	fn delay_is_capped_with_jitter_margin() {
		let policy = BackoffPolicy::default();
		for attempt in 0..10 {
			let delay = policy.delay(attempt);
			assert!(delay <= policy.max_delay.mul_f64(1.0 + policy.jitter));
		}
		assert!(policy.delay(0) >= policy.base_delay.mul_f64(1.0 - policy.jitter));
	}
}
