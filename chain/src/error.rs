use std::time::Duration;

/// Chain-facing failures, split into the transient class (retried inside
/// this crate with backoff) and the permanent classes that are surfaced to
/// the caller unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
	#[error("transient chain error: {0}")]
	Transient(#[source] anyhow::Error),
	#[error("insufficient gas")]
	InsufficientGas,
	#[error("invalid signature")]
	InvalidSignature,
	#[error("contract abort with code {0}")]
	ContractAbort(u64),
	#[error("chain call timed out after {0:?}")]
	Timeout(Duration),
}

impl ChainError {
	pub fn is_retryable(&self) -> bool {
		matches!(self, ChainError::Transient(_) | ChainError::Timeout(_))
	}

	/// Classify an RPC-level failure. Node implementations surface contract
	/// failures as call errors with a recognizable message; anything we do
	/// not recognize is assumed transient and retried.
	pub fn classify(error: anyhow::Error) -> Self {
		let message = error.to_string().to_lowercase();
		if message.contains("insufficient gas") || message.contains("insufficientgas") {
			ChainError::InsufficientGas
		} else if message.contains("invalid signature") || message.contains("invalidsignature") {
			ChainError::InvalidSignature
		} else if let Some(code) = abort_code(&message) {
			ChainError::ContractAbort(code)
		} else {
			ChainError::Transient(error)
		}
	}
}

// Parses "... abort ... <code>" out of a call-error message.
fn abort_code(message: &str) -> Option<u64> {
	let at = message.find("abort")?;
	message[at..]
		.chars()
		.skip_while(|c| !c.is_ascii_digit())
		.take_while(|c| c.is_ascii_digit())
		.collect::<String>()
		.parse()
		.ok()
}
