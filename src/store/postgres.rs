use alloy::primitives::Address;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::warn;

use super::{StoreError, UserStore};
use crate::model::{SubscriptionUpdate, UserId, UserRow, UserSubscriptionRecord};

const USER_COLUMNS: &str = "id, wallet_address, subscription_status, auto_renew, \
     current_period_end, last_renewal_attempt_at";

pub async fn get_db_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres. Ensure the service is running.")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to apply database migrations")?;

    Ok(pool)
}

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn into_record(row: UserRow) -> Result<UserSubscriptionRecord, StoreError> {
    UserSubscriptionRecord::try_from(row).map_err(StoreError::Corrupt)
}

/// Drops rows that cannot be decoded so one bad record does not block the
/// rest of a renewal scan.
fn renewable_records(rows: Vec<UserRow>) -> Vec<UserSubscriptionRecord> {
    rows.into_iter()
        .filter_map(|row| {
            let user_id = row.id;
            match into_record(row) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(user_id, reason = %err, "Skipping corrupt user record in renewal scan");
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<UserSubscriptionRecord>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(into_record).transpose()
    }

    async fn set_wallet(&self, user_id: UserId, wallet: Address) -> Result<(), StoreError> {
        // Stored checksummed, the form the frontend shows back to the user.
        let result = sqlx::query(
            "UPDATE users SET wallet_address = $1, updated_at = now() WHERE id = $2",
        )
        .bind(wallet.to_checksum(None))
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(user_id));
        }
        Ok(())
    }

    async fn update_subscription(
        &self,
        user_id: UserId,
        update: SubscriptionUpdate,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users
             SET subscription_status = $1,
                 current_period_end = COALESCE($2, current_period_end),
                 last_renewal_attempt_at = COALESCE($3, last_renewal_attempt_at),
                 updated_at = now()
             WHERE id = $4",
        )
        .bind(update.status.as_str())
        .bind(update.current_period_end)
        .bind(update.renewal_attempted_at)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(user_id));
        }
        Ok(())
    }

    async fn due_for_renewal(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<UserSubscriptionRecord>, StoreError> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE subscription_status IN ('active', 'past_due')
               AND auto_renew = TRUE
               AND current_period_end IS NOT NULL
               AND current_period_end <= $1
               AND wallet_address IS NOT NULL
             ORDER BY last_renewal_attempt_at ASC NULLS FIRST, current_period_end ASC
             LIMIT $2"
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(renewable_records(rows))
    }
}
