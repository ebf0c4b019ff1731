//! Local user records. The core reads and updates subscription fields
//! through [`UserStore`]; which users are due for renewal is decided by the
//! store query behind [`UserStore::due_for_renewal`].

use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{SubscriptionUpdate, UserId, UserSubscriptionRecord};

pub mod postgres;

pub use postgres::PgUserStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("user {0} not found")]
    NotFound(UserId),
    #[error("corrupt user record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<UserSubscriptionRecord>, StoreError>;

    async fn set_wallet(&self, user_id: UserId, wallet: Address) -> Result<(), StoreError>;

    async fn update_subscription(
        &self,
        user_id: UserId,
        update: SubscriptionUpdate,
    ) -> Result<(), StoreError>;

    /// Records with status `active` or `past_due`, auto-renew on, a period
    /// end at or before `now` and a linked wallet, at most `limit` rows.
    /// Never-attempted records come first, then the least recently attempted,
    /// so subscribers that keep failing cannot starve the rest. Rows that
    /// cannot be decoded are skipped.
    async fn due_for_renewal(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<UserSubscriptionRecord>, StoreError>;
}
