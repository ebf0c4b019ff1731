use alloy::{
    network::{Ethereum, EthereumWallet, ReceiptResponse},
    primitives::{Address, U256},
    providers::{DynProvider, PendingTransactionBuilder, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    sol,
    transports::{http::reqwest::Url, RpcError},
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{Connector, NodeSession, SubscriptionReader, SubscriptionWriter, TxConfirmation};
use crate::error::{CallError, RenewalError};

sol! {
    #[sol(rpc)]
    contract SubscriptionManager {
        function price() external view returns (uint256);
        function txFeeBps() external view returns (uint16);
        function cycleSeconds() external view returns (uint256);
        function token() external view returns (address);
        function treasury() external view returns (address);
        function gasVault() external view returns (address);
        function isActive(address user) external view returns (bool);
        function isDue(address user) external view returns (bool);
        function nextDueAt(address user) external view returns (uint256);

        function subscribe(address user, address directReferrer) external;
        function renew(address user) external;
        function cancel(address user) external;
    }
}

/// Opens HTTP JSON-RPC sessions pinned to one chain id.
#[derive(Debug, Clone)]
pub struct AlloyConnector {
    submit_timeout: Duration,
    confirm_timeout: Duration,
}

impl AlloyConnector {
    /// `submit_timeout` bounds gas estimation plus broadcast, `confirm_timeout`
    /// bounds the wait for the receipt.
    pub fn new(submit_timeout: Duration, confirm_timeout: Duration) -> Self {
        Self {
            submit_timeout,
            confirm_timeout,
        }
    }
}

impl Connector for AlloyConnector {
    fn open(&self, endpoint: &str, chain_id: u64) -> Result<Arc<dyn NodeSession>, CallError> {
        let url: Url = endpoint
            .parse()
            .map_err(|e| CallError::Transport(format!("invalid rpc url: {e}")))?;

        // Fixed chain id: the provider never asks the node which network it is.
        let provider = ProviderBuilder::new()
            .with_chain_id(chain_id)
            .connect_http(url.clone())
            .erased();

        debug!(chain_id, "Opened rpc session");
        Ok(Arc::new(AlloySession {
            url,
            chain_id,
            provider,
            submit_timeout: self.submit_timeout,
            confirm_timeout: self.confirm_timeout,
        }))
    }
}

struct AlloySession {
    url: Url,
    chain_id: u64,
    provider: DynProvider,
    submit_timeout: Duration,
    confirm_timeout: Duration,
}

#[async_trait]
impl NodeSession for AlloySession {
    async fn block_number(&self) -> Result<u64, CallError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))
    }

    fn read_contract(&self, contract: Address) -> Arc<dyn SubscriptionReader> {
        Arc::new(AlloyReader {
            contract: SubscriptionManager::new(contract, self.provider.clone()),
        })
    }

    fn write_contract(
        &self,
        contract: Address,
        operator: &PrivateKeySigner,
    ) -> Arc<dyn SubscriptionWriter> {
        let provider = ProviderBuilder::new()
            .with_chain_id(self.chain_id)
            .wallet(EthereumWallet::from(operator.clone()))
            .connect_http(self.url.clone())
            .erased();

        info!(operator = %operator.address(), %contract, "Built operator contract binding");
        Arc::new(AlloyWriter {
            contract: SubscriptionManager::new(contract, provider),
            submit_timeout: self.submit_timeout,
            confirm_timeout: self.confirm_timeout,
        })
    }
}

fn call_error(err: alloy::contract::Error) -> CallError {
    match err {
        alloy::contract::Error::TransportError(RpcError::ErrorResp(payload)) => {
            CallError::Rejected(payload.to_string())
        }
        alloy::contract::Error::TransportError(other) => CallError::Transport(other.to_string()),
        other => CallError::Decode(other.to_string()),
    }
}

fn to_u64(value: U256, field: &str) -> Result<u64, CallError> {
    u64::try_from(value)
        .map_err(|_| CallError::Decode(format!("{field} does not fit in u64: {value}")))
}

struct AlloyReader {
    contract: SubscriptionManager::SubscriptionManagerInstance<DynProvider>,
}

#[async_trait]
impl SubscriptionReader for AlloyReader {
    async fn is_active(&self, user: Address) -> Result<bool, CallError> {
        self.contract.isActive(user).call().await.map_err(call_error)
    }

    async fn is_due(&self, user: Address) -> Result<bool, CallError> {
        self.contract.isDue(user).call().await.map_err(call_error)
    }

    async fn next_due_at(&self, user: Address) -> Result<u64, CallError> {
        let value = self.contract.nextDueAt(user).call().await.map_err(call_error)?;
        to_u64(value, "nextDueAt")
    }

    async fn cycle_seconds(&self) -> Result<u64, CallError> {
        let value = self.contract.cycleSeconds().call().await.map_err(call_error)?;
        to_u64(value, "cycleSeconds")
    }

    async fn price(&self) -> Result<U256, CallError> {
        self.contract.price().call().await.map_err(call_error)
    }

    async fn tx_fee_bps(&self) -> Result<u16, CallError> {
        self.contract.txFeeBps().call().await.map_err(call_error)
    }

    async fn token(&self) -> Result<Address, CallError> {
        self.contract.token().call().await.map_err(call_error)
    }

    async fn treasury(&self) -> Result<Address, CallError> {
        self.contract.treasury().call().await.map_err(call_error)
    }

    async fn gas_vault(&self) -> Result<Address, CallError> {
        self.contract.gasVault().call().await.map_err(call_error)
    }
}

struct AlloyWriter {
    contract: SubscriptionManager::SubscriptionManagerInstance<DynProvider>,
    submit_timeout: Duration,
    confirm_timeout: Duration,
}

impl AlloyWriter {
    /// Errors from `send()` happen before the transaction reached the
    /// mempool. A JSON-RPC error there is the node refusing it (usually a
    /// revert during gas estimation); anything else means we never got
    /// through.
    fn submission_error(err: alloy::contract::Error) -> RenewalError {
        match call_error(err) {
            CallError::Rejected(reason) => RenewalError::Rejected(reason),
            other => RenewalError::NotSubmitted(other),
        }
    }

    async fn submit<F>(&self, send: F) -> Result<PendingTransactionBuilder<Ethereum>, RenewalError>
    where
        F: std::future::Future<
            Output = Result<PendingTransactionBuilder<Ethereum>, alloy::contract::Error>,
        >,
    {
        match tokio::time::timeout(self.submit_timeout, send).await {
            Ok(sent) => sent.map_err(Self::submission_error),
            Err(_) => Err(RenewalError::NotSubmitted(CallError::Timeout(
                self.submit_timeout,
            ))),
        }
    }

    async fn confirm(
        &self,
        pending: PendingTransactionBuilder<Ethereum>,
    ) -> Result<TxConfirmation, RenewalError> {
        let tx_hash = format!("0x{}", hex::encode(pending.tx_hash()));
        debug!(%tx_hash, "Transaction submitted, waiting for receipt");

        let receipt = pending
            .with_timeout(Some(self.confirm_timeout))
            .get_receipt()
            .await
            .map_err(|e| RenewalError::Unconfirmed {
                tx_hash: tx_hash.clone(),
                reason: e.to_string(),
            })?;

        if !receipt.status() {
            return Err(RenewalError::Reverted { tx_hash });
        }

        Ok(TxConfirmation {
            tx_hash,
            block_number: receipt.block_number,
        })
    }
}

#[async_trait]
impl SubscriptionWriter for AlloyWriter {
    async fn renew(&self, user: Address) -> Result<TxConfirmation, RenewalError> {
        let call = self.contract.renew(user);
        let pending = self.submit(call.send()).await?;
        self.confirm(pending).await
    }
}
