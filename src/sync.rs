//! Copies on-chain truth into the local user record so profile reads and
//! gating do not need an RPC round-trip.

use alloy::primitives::Address;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::SubscriptionError;
use crate::model::{
    normalize_wallet, SubscriptionSnapshot, SubscriptionStatus, SubscriptionUpdate, UserId,
};
use crate::status::{ReadOptions, StatusReader};
use crate::store::UserStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncSkipReason {
    OnchainUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub synced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SyncSkipReason>,
    pub subscription: SubscriptionSnapshot,
}

pub struct SyncBridge {
    reader: Arc<StatusReader>,
    store: Arc<dyn UserStore>,
}

impl SyncBridge {
    pub fn new(reader: Arc<StatusReader>, store: Arc<dyn UserStore>) -> Self {
        Self { reader, store }
    }

    /// Reads the wallet fresh and records the outcome for `user_id`.
    ///
    /// An undetermined read never touches the store: the user keeps
    /// whatever status was recorded last.
    pub async fn sync_user(
        &self,
        user_id: UserId,
        raw_wallet: &str,
    ) -> Result<SyncResult, SubscriptionError> {
        let wallet = normalize_wallet(raw_wallet)?;
        if self.store.find_user(user_id).await?.is_none() {
            return Err(SubscriptionError::UserNotFound(user_id));
        }

        let snapshot = self.reader.read_wallet(wallet, ReadOptions::fresh()).await?;
        let Some(active) = snapshot.active else {
            warn!(user_id, %wallet, "Sync skipped, on-chain status unavailable");
            return Ok(SyncResult {
                synced: false,
                reason: Some(SyncSkipReason::OnchainUnavailable),
                subscription: snapshot,
            });
        };

        let update = SubscriptionUpdate {
            status: if active {
                SubscriptionStatus::Active
            } else {
                SubscriptionStatus::Inactive
            },
            current_period_end: snapshot.next_due_at(),
            renewal_attempted_at: None,
        };
        self.store.update_subscription(user_id, update).await?;
        info!(user_id, %wallet, status = %update.status, "Subscription synced");

        Ok(SyncResult {
            synced: true,
            reason: None,
            subscription: snapshot,
        })
    }

    /// Stores the checksummed form of `raw_wallet` on the user.
    pub async fn link_wallet(
        &self,
        user_id: UserId,
        raw_wallet: &str,
    ) -> Result<Address, SubscriptionError> {
        let wallet = normalize_wallet(raw_wallet)?;
        self.store.set_wallet(user_id, wallet).await?;
        info!(user_id, %wallet, "Wallet linked");
        Ok(wallet)
    }
}
