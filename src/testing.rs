//! Scripted chain and in-memory user store shared by the unit tests.

use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::chain::{
    ChainSettings, Connector, NodeSession, SubscriptionReader, SubscriptionWriter, TxConfirmation,
};
use crate::error::{CallError, RenewalError};
use crate::model::{SubscriptionStatus, SubscriptionUpdate, UserId, UserSubscriptionRecord};
use crate::store::{StoreError, UserStore};

pub(crate) fn wallet(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

pub(crate) fn chain_settings() -> ChainSettings {
    ChainSettings {
        rpc_url: Some("http://node.test:8545".into()),
        chain_id: 56,
        contract: Some(Address::repeat_byte(0xC0)),
        operator: Some(PrivateKeySigner::random()),
        rpc_timeout: Duration::from_millis(2500),
        cooldown: Duration::from_secs(30),
    }
}

/// Chain double: counts every call and answers from per-wallet scripts.
#[derive(Default)]
pub(crate) struct MockChain {
    pub opens: AtomicUsize,
    pub liveness_checks: AtomicUsize,
    pub active_calls: AtomicUsize,
    pub due_calls: AtomicUsize,
    pub next_due_calls: AtomicUsize,
    pub cycle_calls: AtomicUsize,
    pub renew_calls: AtomicUsize,
    pub renewed: Mutex<Vec<Address>>,
    pub renew_started: Notify,
    liveness_failure: Mutex<Option<CallError>>,
    liveness_delay: Mutex<Option<Duration>>,
    active: Mutex<HashMap<Address, Result<bool, CallError>>>,
    due: Mutex<Option<Result<bool, CallError>>>,
    next_due: Mutex<Option<Result<u64, CallError>>>,
    cycle_seconds: Mutex<Option<Result<u64, CallError>>>,
    renew_failures: Mutex<HashMap<Address, RenewalError>>,
    renew_delay: Mutex<Option<Duration>>,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector(Arc::clone(self)))
    }

    pub fn fail_liveness(&self, err: Option<CallError>) {
        *self.liveness_failure.lock().unwrap() = err;
    }

    pub fn delay_liveness(&self, delay: Duration) {
        *self.liveness_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_active(&self, user: Address, result: Result<bool, CallError>) {
        self.active.lock().unwrap().insert(user, result);
    }

    pub fn set_due(&self, result: Result<bool, CallError>) {
        *self.due.lock().unwrap() = Some(result);
    }

    pub fn set_next_due(&self, result: Result<u64, CallError>) {
        *self.next_due.lock().unwrap() = Some(result);
    }

    pub fn set_cycle_seconds(&self, result: Result<u64, CallError>) {
        *self.cycle_seconds.lock().unwrap() = Some(result);
    }

    pub fn fail_renewal(&self, user: Address, err: RenewalError) {
        self.renew_failures.lock().unwrap().insert(user, err);
    }

    pub fn delay_renewals(&self, delay: Duration) {
        *self.renew_delay.lock().unwrap() = Some(delay);
    }

    pub fn renewed(&self) -> Vec<Address> {
        self.renewed.lock().unwrap().clone()
    }
}

struct MockConnector(Arc<MockChain>);

impl Connector for MockConnector {
    fn open(&self, _endpoint: &str, _chain_id: u64) -> Result<Arc<dyn NodeSession>, CallError> {
        self.0.opens.fetch_add(1, SeqCst);
        Ok(Arc::new(MockHandle(Arc::clone(&self.0))))
    }
}

struct MockHandle(Arc<MockChain>);

#[async_trait]
impl NodeSession for MockHandle {
    async fn block_number(&self) -> Result<u64, CallError> {
        self.0.liveness_checks.fetch_add(1, SeqCst);
        let delay = *self.0.liveness_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.0.liveness_failure.lock().unwrap().clone();
        match failure {
            Some(err) => Err(err),
            None => Ok(1_000),
        }
    }

    fn read_contract(&self, _contract: Address) -> Arc<dyn SubscriptionReader> {
        Arc::new(MockHandle(Arc::clone(&self.0)))
    }

    fn write_contract(
        &self,
        _contract: Address,
        _operator: &PrivateKeySigner,
    ) -> Arc<dyn SubscriptionWriter> {
        Arc::new(MockHandle(Arc::clone(&self.0)))
    }
}

#[async_trait]
impl SubscriptionReader for MockHandle {
    async fn is_active(&self, user: Address) -> Result<bool, CallError> {
        self.0.active_calls.fetch_add(1, SeqCst);
        self.0
            .active
            .lock()
            .unwrap()
            .get(&user)
            .cloned()
            .unwrap_or(Ok(false))
    }

    async fn is_due(&self, _user: Address) -> Result<bool, CallError> {
        self.0.due_calls.fetch_add(1, SeqCst);
        self.0.due.lock().unwrap().clone().unwrap_or(Ok(false))
    }

    async fn next_due_at(&self, _user: Address) -> Result<u64, CallError> {
        self.0.next_due_calls.fetch_add(1, SeqCst);
        self.0.next_due.lock().unwrap().clone().unwrap_or(Ok(0))
    }

    async fn cycle_seconds(&self) -> Result<u64, CallError> {
        self.0.cycle_calls.fetch_add(1, SeqCst);
        self.0
            .cycle_seconds
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(Ok(2_592_000))
    }

    async fn price(&self) -> Result<U256, CallError> {
        Ok(U256::from(10_000_000_000_000_000_000u128))
    }

    async fn tx_fee_bps(&self) -> Result<u16, CallError> {
        Ok(250)
    }

    async fn token(&self) -> Result<Address, CallError> {
        Ok(Address::repeat_byte(0x55))
    }

    async fn treasury(&self) -> Result<Address, CallError> {
        Ok(Address::repeat_byte(0x77))
    }

    async fn gas_vault(&self) -> Result<Address, CallError> {
        Ok(Address::repeat_byte(0x99))
    }
}

#[async_trait]
impl SubscriptionWriter for MockHandle {
    async fn renew(&self, user: Address) -> Result<TxConfirmation, RenewalError> {
        let n = self.0.renew_calls.fetch_add(1, SeqCst);
        self.0.renew_started.notify_one();
        let delay = *self.0.renew_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.0.renew_failures.lock().unwrap().get(&user).cloned();
        if let Some(err) = failure {
            return Err(err);
        }
        self.0.renewed.lock().unwrap().push(user);
        Ok(TxConfirmation {
            tx_hash: format!("0x{:064x}", n + 1),
            block_number: Some(1_000 + n as u64),
        })
    }
}

/// User store kept in memory; counts every write.
#[derive(Default)]
pub(crate) struct MemoryUserStore {
    records: Mutex<BTreeMap<UserId, UserSubscriptionRecord>>,
    pub writes: AtomicUsize,
    pub failed_writes: AtomicUsize,
    fail_updates: AtomicBool,
}

impl MemoryUserStore {
    pub fn insert(&self, record: UserSubscriptionRecord) {
        self.records.lock().unwrap().insert(record.user_id, record);
    }

    pub fn get(&self, user_id: UserId) -> Option<UserSubscriptionRecord> {
        self.records.lock().unwrap().get(&user_id).cloned()
    }

    /// Makes `update_subscription` fail as if the database were down.
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, SeqCst);
    }
}

pub(crate) fn record(
    user_id: UserId,
    wallet_address: Option<Address>,
    status: SubscriptionStatus,
    current_period_end: Option<DateTime<Utc>>,
) -> UserSubscriptionRecord {
    UserSubscriptionRecord {
        user_id,
        wallet_address,
        status,
        auto_renew: true,
        current_period_end,
        last_renewal_attempt_at: None,
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<UserSubscriptionRecord>, StoreError> {
        Ok(self.get(user_id))
    }

    async fn set_wallet(&self, user_id: UserId, wallet: Address) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&user_id).ok_or(StoreError::NotFound(user_id))?;
        self.writes.fetch_add(1, SeqCst);
        record.wallet_address = Some(wallet);
        Ok(())
    }

    async fn update_subscription(
        &self,
        user_id: UserId,
        update: SubscriptionUpdate,
    ) -> Result<(), StoreError> {
        if self.fail_updates.load(SeqCst) {
            self.failed_writes.fetch_add(1, SeqCst);
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&user_id).ok_or(StoreError::NotFound(user_id))?;
        self.writes.fetch_add(1, SeqCst);
        record.status = update.status;
        if let Some(end) = update.current_period_end {
            record.current_period_end = Some(end);
        }
        if let Some(at) = update.renewal_attempted_at {
            record.last_renewal_attempt_at = Some(at);
        }
        Ok(())
    }

    async fn due_for_renewal(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<UserSubscriptionRecord>, StoreError> {
        let mut due: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                matches!(r.status, SubscriptionStatus::Active | SubscriptionStatus::PastDue)
            })
            .filter(|r| r.auto_renew && r.wallet_address.is_some())
            .filter(|r| r.current_period_end.is_some_and(|end| end <= now))
            .cloned()
            .collect();
        // None sorts first, like NULLS FIRST.
        due.sort_by_key(|r| (r.last_renewal_attempt_at, r.current_period_end));
        due.truncate(limit as usize);
        Ok(due)
    }
}
