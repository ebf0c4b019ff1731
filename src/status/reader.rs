use alloy::primitives::Address;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use super::cache::StatusCache;
use crate::chain::{bounded, ConnectionManager, PlanTerms};
use crate::error::{CallError, ErrorKind, SubscriptionError};
use crate::model::{normalize_wallet, SnapshotSource, SubscriptionSnapshot};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub bypass_cache: bool,
}

impl ReadOptions {
    /// Skip the cache and ask the chain.
    pub fn fresh() -> Self {
        Self { bypass_cache: true }
    }
}

/// Raw result of one status read. `isActive` is mandatory; the secondary
/// fields keep their own outcome so a revert ("method not on this
/// contract") stays distinguishable from a transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnchainFields {
    pub active: bool,
    pub due: Result<bool, CallError>,
    pub next_due_at: Result<u64, CallError>,
}

pub struct StatusReader {
    connections: Arc<ConnectionManager>,
    cache: StatusCache,
}

impl StatusReader {
    pub fn new(connections: Arc<ConnectionManager>, cache: StatusCache) -> Self {
        Self { connections, cache }
    }

    pub fn cache(&self) -> &StatusCache {
        &self.cache
    }

    /// Validates `raw_wallet` before anything touches the network.
    pub async fn read_status(
        &self,
        raw_wallet: &str,
        options: ReadOptions,
    ) -> Result<SubscriptionSnapshot, SubscriptionError> {
        let wallet = normalize_wallet(raw_wallet)?;
        self.read_wallet(wallet, options).await
    }

    pub async fn read_wallet(
        &self,
        wallet: Address,
        options: ReadOptions,
    ) -> Result<SubscriptionSnapshot, SubscriptionError> {
        if !options.bypass_cache {
            if let Some(hit) = self.cache.get(&wallet) {
                return Ok(hit);
            }
        }

        let snapshot = match self.read_fields(wallet).await {
            Ok(fields) => self.snapshot(wallet, &fields),
            Err(err) if err.is_unavailable() => {
                warn!(%wallet, reason = %err, "Subscription status unavailable");
                self.unavailable(wallet, err.kind())
            }
            Err(err) => return Err(err),
        };

        self.cache.put(&wallet, snapshot.clone(), self.cache.ttl());
        Ok(snapshot)
    }

    /// Queries the contract directly, without the cache.
    pub async fn read_fields(&self, wallet: Address) -> Result<OnchainFields, SubscriptionError> {
        self.connections.assert_ready().await?;
        let reader = self.connections.read_contract()?;
        let timeout = self.connections.settings().rpc_timeout;

        let active = match bounded(timeout, reader.handle.is_active(wallet)).await {
            Ok(active) => active,
            Err(err) => {
                if err.is_connectivity() {
                    self.connections
                        .report_failure(reader.generation, &err.to_string());
                }
                return Err(err.into_unavailable());
            }
        };

        let (due, next_due_at) = tokio::join!(
            bounded(timeout, reader.handle.is_due(wallet)),
            bounded(timeout, reader.handle.next_due_at(wallet)),
        );
        let failures = [
            ("isDue", due.as_ref().err()),
            ("nextDueAt", next_due_at.as_ref().err()),
        ];
        for (field, outcome) in failures {
            match outcome {
                Some(CallError::Rejected(reason)) => {
                    debug!(%wallet, field, %reason, "Optional field not served by contract")
                }
                Some(err) => warn!(%wallet, field, reason = %err, "Optional field unavailable"),
                None => {}
            }
        }

        Ok(OnchainFields {
            active,
            due,
            next_due_at,
        })
    }

    /// Reads the contract's commercial terms.
    pub async fn plan_terms(&self) -> Result<PlanTerms, SubscriptionError> {
        self.connections.assert_ready().await?;
        let reader = self.connections.read_contract()?;
        let timeout = self.connections.settings().rpc_timeout;
        let c = &reader.handle;

        let terms = tokio::try_join!(
            bounded(timeout, c.price()),
            bounded(timeout, c.tx_fee_bps()),
            bounded(timeout, c.cycle_seconds()),
            bounded(timeout, c.token()),
            bounded(timeout, c.treasury()),
            bounded(timeout, c.gas_vault()),
        );

        match terms {
            Ok((price, tx_fee_bps, cycle_seconds, token, treasury, gas_vault)) => Ok(PlanTerms {
                price,
                tx_fee_bps,
                cycle_seconds,
                token,
                treasury,
                gas_vault,
            }),
            Err(err) => {
                if err.is_connectivity() {
                    self.connections
                        .report_failure(reader.generation, &err.to_string());
                }
                Err(err.into_unavailable())
            }
        }
    }

    fn snapshot(&self, wallet: Address, fields: &OnchainFields) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            wallet_address: wallet,
            chain_id: self.connections.settings().chain_id,
            contract: self.connections.settings().contract,
            active: Some(fields.active),
            due: fields.due.as_ref().ok().copied(),
            next_due_at_unix_seconds: fields.next_due_at.as_ref().ok().copied(),
            checked_at: Utc::now(),
            source: SnapshotSource::Rpc,
            unavailable: None,
        }
    }

    fn unavailable(&self, wallet: Address, kind: ErrorKind) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            wallet_address: wallet,
            chain_id: self.connections.settings().chain_id,
            contract: self.connections.settings().contract,
            active: None,
            due: None,
            next_due_at_unix_seconds: None,
            checked_at: Utc::now(),
            source: SnapshotSource::Rpc,
            unavailable: Some(kind),
        }
    }
}
