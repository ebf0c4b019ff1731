use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::UserId;
use crate::store::StoreError;

/// Coarse classification of a [`SubscriptionError`], safe to serialize into
/// snapshots and HTTP payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidWallet,
    EnvironmentIncomplete,
    RpcCooldown,
    RpcTimeout,
    RpcUnavailable,
    OperatorKeyMissing,
    TransactionFailed,
    UserNotFound,
    Store,
}

impl ErrorKind {
    /// The RPC family: the chain could not be asked, so nothing is known.
    pub fn is_unavailable(self) -> bool {
        matches!(
            self,
            ErrorKind::RpcCooldown | ErrorKind::RpcTimeout | ErrorKind::RpcUnavailable
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("invalid wallet address: {0:?}")]
    InvalidWallet(String),
    #[error("web3 environment incomplete: {0} is not configured")]
    EnvironmentIncomplete(&'static str),
    #[error("rpc endpoint cooling down for another {}ms", .remaining.as_millis())]
    RpcCooldown { remaining: Duration },
    #[error("rpc call timed out after {}ms", .after.as_millis())]
    RpcTimeout { after: Duration },
    #[error("rpc endpoint unavailable: {0}")]
    RpcUnavailable(String),
    #[error("operator signing key is not configured")]
    OperatorKeyMissing,
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
    #[error("user {0} not found")]
    UserNotFound(UserId),
    #[error("user store error: {0}")]
    Store(String),
}

impl SubscriptionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubscriptionError::InvalidWallet(_) => ErrorKind::InvalidWallet,
            SubscriptionError::EnvironmentIncomplete(_) => ErrorKind::EnvironmentIncomplete,
            SubscriptionError::RpcCooldown { .. } => ErrorKind::RpcCooldown,
            SubscriptionError::RpcTimeout { .. } => ErrorKind::RpcTimeout,
            SubscriptionError::RpcUnavailable(_) => ErrorKind::RpcUnavailable,
            SubscriptionError::OperatorKeyMissing => ErrorKind::OperatorKeyMissing,
            SubscriptionError::TransactionFailed(_) => ErrorKind::TransactionFailed,
            SubscriptionError::UserNotFound(_) => ErrorKind::UserNotFound,
            SubscriptionError::Store(_) => ErrorKind::Store,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind().is_unavailable()
    }

    /// Status code the HTTP layer should answer with. Unavailability is a
    /// 503, never a 403.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::InvalidWallet => 400,
            ErrorKind::UserNotFound => 404,
            ErrorKind::RpcCooldown | ErrorKind::RpcTimeout | ErrorKind::RpcUnavailable => 503,
            ErrorKind::EnvironmentIncomplete => 503,
            ErrorKind::OperatorKeyMissing
            | ErrorKind::TransactionFailed
            | ErrorKind::Store => 500,
        }
    }
}

impl From<StoreError> for SubscriptionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(user_id) => SubscriptionError::UserNotFound(user_id),
            other => SubscriptionError::Store(other.to_string()),
        }
    }
}

/// Failure of a single call against the node or the contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The node answered with a JSON-RPC error: revert, missing method,
    /// bad arguments. Retrying will not help.
    #[error("call rejected by node: {0}")]
    Rejected(String),
    /// The request never got an answer.
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("call exceeded {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("unexpected return value: {0}")]
    Decode(String),
}

impl CallError {
    /// Whether the failure says something about the endpoint's health and
    /// should therefore feed the circuit breaker.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, CallError::Transport(_) | CallError::Timeout(_))
    }

    pub(crate) fn into_unavailable(self) -> SubscriptionError {
        match self {
            CallError::Timeout(after) => SubscriptionError::RpcTimeout { after },
            other => SubscriptionError::RpcUnavailable(other.to_string()),
        }
    }
}

/// Outcome of a `renew` transaction that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenewalError {
    /// The transaction never left the process because the node could not be
    /// reached. Nothing is known about the subscriber.
    #[error("could not submit renewal: {0}")]
    NotSubmitted(CallError),
    /// The node refused the transaction (e.g. a revert during gas
    /// estimation because the allowance is too small).
    #[error("renewal rejected: {0}")]
    Rejected(String),
    #[error("renewal {tx_hash} reverted on-chain")]
    Reverted { tx_hash: String },
    #[error("renewal {tx_hash} not confirmed: {reason}")]
    Unconfirmed { tx_hash: String, reason: String },
}

impl RenewalError {
    /// Confirmed failures mark the subscriber past due; a submission that
    /// never happened does not.
    pub fn is_subscriber_failure(&self) -> bool {
        !matches!(self, RenewalError::NotSubmitted(_))
    }
}

impl From<RenewalError> for SubscriptionError {
    fn from(err: RenewalError) -> Self {
        match err {
            RenewalError::NotSubmitted(call) => call.into_unavailable(),
            other => SubscriptionError::TransactionFailed(other.to_string()),
        }
    }
}
