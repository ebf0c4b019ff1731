use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorKind, SubscriptionError};

pub type UserId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    Rpc,
    Cache,
}

/// Point-in-time read of a wallet's on-chain subscription.
///
/// `active == None` means the chain could not be asked and `unavailable`
/// says why. It must never be read as "inactive".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSnapshot {
    pub wallet_address: Address,
    pub chain_id: u64,
    pub contract: Option<Address>,
    pub active: Option<bool>,
    pub due: Option<bool>,
    pub next_due_at_unix_seconds: Option<u64>,
    pub checked_at: DateTime<Utc>,
    pub source: SnapshotSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable: Option<ErrorKind>,
}

impl SubscriptionSnapshot {
    pub fn is_determined(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active == Some(true)
    }

    /// Next due time as a timestamp. A zero `nextDueAt` means the wallet
    /// never subscribed and is treated as unknown.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.next_due_at_unix_seconds
            .filter(|secs| *secs > 0)
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }

    pub(crate) fn from_cache(&self) -> Self {
        Self {
            source: SnapshotSource::Cache,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Inactive,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(SubscriptionStatus::Inactive),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(format!("unknown subscription status {other:?}")),
        }
    }
}

/// Local view of a user's subscription, owned by the user store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSubscriptionRecord {
    pub user_id: UserId,
    pub wallet_address: Option<Address>,
    pub status: SubscriptionStatus,
    pub auto_renew: bool,
    pub current_period_end: Option<DateTime<Utc>>,
    /// Last time the renewal worker sent (or tried to send) `renew` for
    /// this user. Renewal scans serve the least recently attempted first.
    pub last_renewal_attempt_at: Option<DateTime<Utc>>,
}

/// Fields the core is allowed to change on a record. `auto_renew` is never
/// touched; a `None` period end or attempt time keeps the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    pub status: SubscriptionStatus,
    pub current_period_end: Option<DateTime<Utc>>,
    pub renewal_attempted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: i64,
    pub wallet_address: Option<String>,
    pub subscription_status: String,
    pub auto_renew: bool,
    pub current_period_end: Option<DateTime<Utc>>,
    pub last_renewal_attempt_at: Option<DateTime<Utc>>,
}

impl TryFrom<UserRow> for UserSubscriptionRecord {
    type Error = String;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let wallet_address = row
            .wallet_address
            .as_deref()
            .map(|raw| normalize_wallet(raw).map_err(|e| format!("user {}: {e}", row.id)))
            .transpose()?;

        Ok(Self {
            user_id: row.id,
            wallet_address,
            status: row.subscription_status.parse()?,
            auto_renew: row.auto_renew,
            current_period_end: row.current_period_end,
            last_renewal_attempt_at: row.last_renewal_attempt_at,
        })
    }
}

/// Parses a wallet the way the frontend's wallet library does: `0x` plus 40
/// hex digits, and a mixed-case input must carry a valid EIP-55 checksum.
pub fn normalize_wallet(raw: &str) -> Result<Address, SubscriptionError> {
    let trimmed = raw.trim();
    let invalid = || SubscriptionError::InvalidWallet(raw.to_string());

    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(invalid)?;
    if digits.len() != 40 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    let address = Address::from_str(digits).map_err(|_| invalid())?;

    let has_upper = digits.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = digits.chars().any(|c| c.is_ascii_lowercase());
    if has_upper && has_lower && address.to_checksum(None)[2..] != *digits {
        return Err(invalid());
    }

    Ok(address)
}

/// Key used for per-wallet maps; case-insensitive by construction.
pub fn wallet_key(wallet: &Address) -> String {
    format!("{wallet:#x}")
}
