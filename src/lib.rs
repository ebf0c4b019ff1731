//! On-chain subscription state for the backend: wallet status reads behind
//! a cache and an RPC circuit breaker, reconciliation into the local user
//! record, and a batch renewal worker.

pub mod chain;
pub mod config;
pub mod error;
pub mod model;
pub mod renewal;
pub mod service;
pub mod status;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use error::{CallError, ErrorKind, RenewalError, SubscriptionError};
pub use model::{SubscriptionSnapshot, SubscriptionStatus, UserSubscriptionRecord};
pub use service::{AccessDecision, ServiceSettings, SubscriptionService};
