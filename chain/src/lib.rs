//! Client for the on-chain worker registry: signed transaction submission,
//! read-only object queries with a short-lived cache, and the contract event
//! subscription the master's event bridge drains.

pub mod client;
pub mod error;
pub mod events;
pub mod retrier;
pub mod rpc;
pub mod signer;
pub mod subscription;

pub use client::{ChainClient, ContractCall, WorkerProjection};
pub use error::ChainError;
pub use events::{ContractEvent, ContractEventKind, EventCursor, EventId};
pub use rpc::{ChainHttpRpcClient, ChainRpcApi, TransactionResponse};
pub use signer::ChainSigner;
pub use subscription::{EventFilter, EventSubscription};
