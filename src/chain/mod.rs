//! Access to the subscription contract.
//!
//! [`ConnectionManager`] owns the node session and the contract bindings and
//! runs the circuit breaker. The traits below are the seam between it and
//! the transport: [`alloy_client`] talks JSON-RPC, tests plug in a scripted
//! connector.

use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CallError, RenewalError};

pub mod alloy_client;
pub mod connection;

pub use alloy_client::AlloyConnector;
pub use connection::{Binding, ChainSettings, ConnectionManager, ConnectionStateView};

/// Builds node sessions. Opening a session does no network I/O.
pub trait Connector: Send + Sync {
    fn open(&self, endpoint: &str, chain_id: u64) -> Result<Arc<dyn NodeSession>, CallError>;
}

/// One live connection to the node.
#[async_trait]
pub trait NodeSession: Send + Sync {
    async fn block_number(&self) -> Result<u64, CallError>;

    fn read_contract(&self, contract: Address) -> Arc<dyn SubscriptionReader>;

    fn write_contract(
        &self,
        contract: Address,
        operator: &PrivateKeySigner,
    ) -> Arc<dyn SubscriptionWriter>;
}

/// Read-only view of the subscription contract.
#[async_trait]
pub trait SubscriptionReader: Send + Sync {
    async fn is_active(&self, user: Address) -> Result<bool, CallError>;
    async fn is_due(&self, user: Address) -> Result<bool, CallError>;
    async fn next_due_at(&self, user: Address) -> Result<u64, CallError>;
    async fn cycle_seconds(&self) -> Result<u64, CallError>;
    async fn price(&self) -> Result<U256, CallError>;
    async fn tx_fee_bps(&self) -> Result<u16, CallError>;
    async fn token(&self) -> Result<Address, CallError>;
    async fn treasury(&self) -> Result<Address, CallError>;
    async fn gas_vault(&self) -> Result<Address, CallError>;
}

/// Operator-signed renewals. The call submits and waits for the receipt.
#[async_trait]
pub trait SubscriptionWriter: Send + Sync {
    async fn renew(&self, user: Address) -> Result<TxConfirmation, RenewalError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxConfirmation {
    pub tx_hash: String,
    pub block_number: Option<u64>,
}

/// Commercial terms configured on the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanTerms {
    pub price: U256,
    pub tx_fee_bps: u16,
    pub cycle_seconds: u64,
    pub token: Address,
    pub treasury: Address,
    pub gas_vault: Address,
}

/// Runs one chain call under `timeout`; expiry is reported as
/// [`CallError::Timeout`].
pub(crate) async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, CallError>>,
) -> Result<T, CallError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(CallError::Timeout(timeout)),
    }
}
