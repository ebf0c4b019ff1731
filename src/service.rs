//! The surface handed to the HTTP layer. Every outcome carries the status
//! code it should be answered with.

use alloy::primitives::Address;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::{ChainSettings, ConnectionManager, ConnectionStateView, Connector, PlanTerms};
use crate::error::{ErrorKind, SubscriptionError};
use crate::model::{SubscriptionSnapshot, UserId};
use crate::renewal::{RenewalWorker, TickOutcome};
use crate::status::{ReadOptions, StatusCache, StatusReader};
use crate::store::UserStore;
use crate::sync::{SyncBridge, SyncResult};

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub chain: ChainSettings,
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
    pub renewal_batch_size: u32,
}

/// Outcome of gating a request on an active on-chain subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessDecision {
    Granted { onchain: SubscriptionSnapshot },
    WalletRequired,
    InvalidWallet,
    Inactive { onchain: SubscriptionSnapshot },
    /// The chain could not be asked. Access is refused, but not as
    /// "inactive".
    Unavailable { kind: ErrorKind },
}

impl AccessDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, AccessDecision::Granted { .. })
    }

    pub fn http_status(&self) -> u16 {
        match self {
            AccessDecision::Granted { .. } => 200,
            AccessDecision::InvalidWallet => 400,
            AccessDecision::WalletRequired | AccessDecision::Inactive { .. } => 403,
            AccessDecision::Unavailable { .. } => 503,
        }
    }

    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            AccessDecision::Granted { .. } => None,
            AccessDecision::WalletRequired => Some("WALLET_REQUIRED"),
            AccessDecision::InvalidWallet => Some("INVALID_WALLET"),
            AccessDecision::Inactive { .. } => Some("SUBSCRIPTION_INACTIVE"),
            AccessDecision::Unavailable { .. } => Some("ONCHAIN_UNAVAILABLE"),
        }
    }
}

pub struct SubscriptionService {
    connections: Arc<ConnectionManager>,
    reader: Arc<StatusReader>,
    sync: SyncBridge,
    worker: Arc<RenewalWorker>,
}

impl SubscriptionService {
    pub fn new(
        settings: ServiceSettings,
        connector: Arc<dyn Connector>,
        store: Arc<dyn UserStore>,
    ) -> Self {
        let connections = Arc::new(ConnectionManager::new(settings.chain, connector));
        let cache = StatusCache::new(settings.cache_ttl, settings.cache_capacity);
        let reader = Arc::new(StatusReader::new(Arc::clone(&connections), cache.clone()));
        let sync = SyncBridge::new(Arc::clone(&reader), Arc::clone(&store));
        let worker = Arc::new(RenewalWorker::new(
            Arc::clone(&connections),
            store,
            cache,
            settings.renewal_batch_size,
        ));
        Self {
            connections,
            reader,
            sync,
            worker,
        }
    }

    pub fn worker(&self) -> Arc<RenewalWorker> {
        Arc::clone(&self.worker)
    }

    pub async fn get_status(
        &self,
        raw_wallet: &str,
        options: ReadOptions,
    ) -> Result<SubscriptionSnapshot, SubscriptionError> {
        self.reader.read_status(raw_wallet, options).await
    }

    /// Gate for subscriber-only routes. `wallet` is the one linked to the
    /// authenticated user, if any.
    pub async fn check_access(&self, wallet: Option<&str>) -> AccessDecision {
        let Some(raw) = wallet.map(str::trim).filter(|w| !w.is_empty()) else {
            return AccessDecision::WalletRequired;
        };

        match self.reader.read_status(raw, ReadOptions::default()).await {
            Ok(snapshot) => match snapshot.active {
                Some(true) => AccessDecision::Granted { onchain: snapshot },
                Some(false) => AccessDecision::Inactive { onchain: snapshot },
                None => AccessDecision::Unavailable {
                    kind: snapshot.unavailable.unwrap_or(ErrorKind::RpcUnavailable),
                },
            },
            Err(SubscriptionError::InvalidWallet(_)) => AccessDecision::InvalidWallet,
            Err(err) => AccessDecision::Unavailable { kind: err.kind() },
        }
    }

    pub async fn sync_user(
        &self,
        user_id: UserId,
        raw_wallet: &str,
    ) -> Result<SyncResult, SubscriptionError> {
        self.sync.sync_user(user_id, raw_wallet).await
    }

    pub async fn link_wallet(
        &self,
        user_id: UserId,
        raw_wallet: &str,
    ) -> Result<Address, SubscriptionError> {
        self.sync.link_wallet(user_id, raw_wallet).await
    }

    pub async fn run_renewal_tick(&self) -> TickOutcome {
        self.worker.tick().await
    }

    pub async fn plan_terms(&self) -> Result<PlanTerms, SubscriptionError> {
        self.reader.plan_terms().await
    }

    pub fn connection_state(&self) -> ConnectionStateView {
        self.connections.state()
    }

    /// Probes the endpoint and returns the resulting breaker state.
    pub async fn probe(&self) -> ConnectionStateView {
        // Failures are already reflected in the state.
        let _ = self.connections.assert_ready().await;
        self.connections.state()
    }
}
