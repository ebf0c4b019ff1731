//! Recurring batch renewal of expiring subscriptions.
//!
//! Each tick scans the store for records whose period has ended and sends
//! `renew(user)` for them one by one. A subscriber whose renewal fails on
//! chain is marked `past_due`; a renewal that could not even be submitted
//! stops the tick and leaves everyone untouched.

use alloy::primitives::Address;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::chain::{bounded, ConnectionManager};
use crate::error::{CallError, ErrorKind, RenewalError, SubscriptionError};
use crate::model::{SubscriptionStatus, SubscriptionUpdate, UserId};
use crate::status::StatusCache;
use crate::store::UserStore;

/// A renewal that failed for the subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalFailure {
    pub user_id: UserId,
    pub wallet: Address,
    pub kind: ErrorKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub scanned_at: DateTime<Utc>,
    pub cycle_seconds: u64,
    pub scanned: usize,
    pub renewed: Vec<UserId>,
    pub past_due: Vec<UserId>,
    pub failures: Vec<RenewalFailure>,
    /// Renewed on chain but not yet recorded in the store. They are written
    /// before the next scan and never renewed twice.
    pub unsaved: Vec<UserId>,
    /// Set when the rest of the batch was left for the next tick.
    pub interrupted: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick was still running.
    Skipped,
    /// Nothing was attempted.
    Aborted(SubscriptionError),
    Completed(TickReport),
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RenewalWorker {
    connections: Arc<ConnectionManager>,
    store: Arc<dyn UserStore>,
    cache: StatusCache,
    batch_size: u32,
    running: AtomicBool,
    /// Confirmed renewals whose store write failed.
    unsaved: Mutex<HashMap<UserId, SubscriptionUpdate>>,
}

impl RenewalWorker {
    pub fn new(
        connections: Arc<ConnectionManager>,
        store: Arc<dyn UserStore>,
        cache: StatusCache,
        batch_size: u32,
    ) -> Self {
        Self {
            connections,
            store,
            cache,
            batch_size,
            running: AtomicBool::new(false),
            unsaved: Mutex::new(HashMap::new()),
        }
    }

    fn try_begin(&self) -> Option<TickGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickGuard(&self.running))
    }

    /// Runs one tick unless another one is still in flight.
    pub async fn tick(&self) -> TickOutcome {
        let Some(_guard) = self.try_begin() else {
            info!("Renewal tick already running, skipping");
            return TickOutcome::Skipped;
        };

        match self.process().await {
            Ok(report) => {
                info!(
                    scanned = report.scanned,
                    renewed = report.renewed.len(),
                    past_due = report.past_due.len(),
                    unsaved = report.unsaved.len(),
                    interrupted = report.interrupted.is_some(),
                    "Renewal tick finished"
                );
                TickOutcome::Completed(report)
            }
            Err(err) => {
                warn!(reason = %err, "Renewal tick aborted");
                TickOutcome::Aborted(err)
            }
        }
    }

    async fn process(&self) -> Result<TickReport, SubscriptionError> {
        self.connections.assert_ready().await?;
        let writer = self.connections.write_contract()?;

        let held = self.flush_unsaved().await;

        let scanned_at = Utc::now();
        let due = self
            .store
            .due_for_renewal(scanned_at, self.batch_size)
            .await?;

        let cycle_seconds = self.cycle_seconds().await?;
        let cycle = i64::try_from(cycle_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| {
                CallError::Decode(format!("cycleSeconds {cycle_seconds} out of range"))
                    .into_unavailable()
            })?;
        let period_end = scanned_at + cycle;

        let mut report = TickReport {
            scanned_at,
            cycle_seconds,
            scanned: due.len(),
            renewed: Vec::new(),
            past_due: Vec::new(),
            failures: Vec::new(),
            unsaved: held.iter().copied().collect(),
            interrupted: None,
        };

        for (position, record) in due.iter().enumerate() {
            let user_id = record.user_id;
            if held.contains(&user_id) {
                continue;
            }
            let Some(wallet) = record.wallet_address else {
                continue;
            };

            match writer.handle.renew(wallet).await {
                Ok(confirmation) => {
                    info!(
                        user_id,
                        %wallet,
                        tx_hash = %confirmation.tx_hash,
                        period_end = %period_end,
                        "Subscription renewed"
                    );
                    self.cache.invalidate(&wallet);
                    let update = SubscriptionUpdate {
                        status: SubscriptionStatus::Active,
                        current_period_end: Some(period_end),
                        renewal_attempted_at: Some(scanned_at),
                    };
                    if let Err(err) = self.store.update_subscription(user_id, update).await {
                        error!(
                            user_id,
                            %wallet,
                            reason = %err,
                            "Renewed on chain but failed to record it, stopping batch"
                        );
                        self.hold_unsaved(user_id, update);
                        report.unsaved.push(user_id);
                        report.interrupted = Some(format!("store write failed: {err}"));
                        break;
                    }
                    report.renewed.push(user_id);
                }
                Err(RenewalError::NotSubmitted(err)) => {
                    if err.is_connectivity() {
                        self.connections
                            .report_failure(writer.generation, &err.to_string());
                    }
                    let left = due.len() - position;
                    warn!(
                        user_id,
                        %wallet,
                        reason = %err,
                        left,
                        "Renewal not submitted, stopping batch"
                    );
                    report.interrupted = Some(err.to_string());
                    break;
                }
                Err(err) => {
                    let failure = SubscriptionError::from(err);
                    warn!(user_id, %wallet, reason = %failure, "Renewal failed, marking past due");
                    report.failures.push(RenewalFailure {
                        user_id,
                        wallet,
                        kind: failure.kind(),
                        reason: failure.to_string(),
                    });
                    let update = SubscriptionUpdate {
                        status: SubscriptionStatus::PastDue,
                        current_period_end: None,
                        renewal_attempted_at: Some(scanned_at),
                    };
                    match self.store.update_subscription(user_id, update).await {
                        Ok(()) => report.past_due.push(user_id),
                        Err(err) => error!(
                            user_id,
                            reason = %err,
                            "Failed to record past due status"
                        ),
                    }
                }
            }
        }

        Ok(report)
    }

    fn hold_unsaved(&self, user_id: UserId, update: SubscriptionUpdate) {
        self.unsaved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id, update);
    }

    /// Writes renewals left over from earlier ticks. Returns the users that
    /// still could not be written; they must not be renewed again.
    async fn flush_unsaved(&self) -> HashSet<UserId> {
        let pending: Vec<_> = self
            .unsaved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        let mut held = HashSet::new();
        for (user_id, update) in pending {
            match self.store.update_subscription(user_id, update).await {
                Ok(()) => info!(user_id, "Recorded earlier renewal"),
                Err(err) => {
                    warn!(user_id, reason = %err, "Earlier renewal still not recorded");
                    self.hold_unsaved(user_id, update);
                    held.insert(user_id);
                }
            }
        }
        held
    }

    async fn cycle_seconds(&self) -> Result<u64, SubscriptionError> {
        let reader = self.connections.read_contract()?;
        let timeout = self.connections.settings().rpc_timeout;
        bounded(timeout, reader.handle.cycle_seconds())
            .await
            .map_err(|err| {
                if err.is_connectivity() {
                    self.connections
                        .report_failure(reader.generation, &err.to_string());
                }
                err.into_unavailable()
            })
    }

    /// Ticks after `initial_delay` and then every `interval` until the task
    /// is dropped. Returns at once when no operator key is configured.
    pub async fn run(self: Arc<Self>, initial_delay: Duration, interval: Duration) {
        if !self.connections.has_operator_key() {
            info!("No operator key configured, renewal worker disabled");
            return;
        }

        info!(
            initial_delay_secs = initial_delay.as_secs(),
            interval_secs = interval.as_secs(),
            batch_size = self.batch_size,
            "Renewal worker started"
        );
        let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainSettings;
    use crate::model::{SnapshotSource, SubscriptionSnapshot};
    use crate::testing::{chain_settings, record, wallet, MemoryUserStore, MockChain};
    use std::sync::atomic::Ordering::SeqCst;

    const THIRTY_DAYS: u64 = 2_592_000;

    struct Fixture {
        chain: Arc<MockChain>,
        store: Arc<MemoryUserStore>,
        cache: StatusCache,
        worker: Arc<RenewalWorker>,
    }

    fn fixture_with(settings: ChainSettings, batch_size: u32) -> Fixture {
        let chain = MockChain::new();
        let store = Arc::new(MemoryUserStore::default());
        let cache = StatusCache::new(Duration::from_secs(45), 100);
        let connections = Arc::new(ConnectionManager::new(settings, chain.connector()));
        let worker = Arc::new(RenewalWorker::new(
            connections,
            store.clone(),
            cache.clone(),
            batch_size,
        ));
        Fixture {
            chain,
            store,
            cache,
            worker,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(chain_settings(), 50)
    }

    fn expired(hours_ago: i64) -> Option<DateTime<Utc>> {
        Some(Utc::now() - TimeDelta::hours(hours_ago))
    }

    fn seed_three(store: &MemoryUserStore) {
        store.insert(record(1, Some(wallet(1)), SubscriptionStatus::Active, expired(3)));
        store.insert(record(2, Some(wallet(2)), SubscriptionStatus::Active, expired(2)));
        store.insert(record(3, Some(wallet(3)), SubscriptionStatus::PastDue, expired(1)));
    }

    fn completed(outcome: TickOutcome) -> TickReport {
        match outcome {
            TickOutcome::Completed(report) => report,
            other => panic!("expected a completed tick, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_renewal_is_isolated_to_its_subscriber() {
        let f = fixture();
        seed_three(&f.store);
        f.chain.fail_renewal(
            wallet(2),
            RenewalError::Reverted {
                tx_hash: "0xdead".into(),
            },
        );

        let report = completed(f.worker.tick().await);
        assert_eq!(report.scanned, 3);
        assert_eq!(report.renewed, vec![1, 3]);
        assert_eq!(report.past_due, vec![2]);
        assert_eq!(report.interrupted, None);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].user_id, 2);
        assert_eq!(report.failures[0].wallet, wallet(2));
        assert_eq!(report.failures[0].kind, ErrorKind::TransactionFailed);
        assert_eq!(f.chain.renew_calls.load(SeqCst), 3);

        let end = report.scanned_at + TimeDelta::seconds(THIRTY_DAYS as i64);
        for user_id in [1, 3] {
            let user = f.store.get(user_id).unwrap();
            assert_eq!(user.status, SubscriptionStatus::Active);
            assert_eq!(user.current_period_end, Some(end));
        }
        let failed = f.store.get(2).unwrap();
        assert_eq!(failed.status, SubscriptionStatus::PastDue);
        assert!(failed.current_period_end.unwrap() < report.scanned_at);
    }

    #[tokio::test]
    async fn thirty_day_cycle_extends_from_scan_time() {
        let f = fixture();
        f.chain.set_cycle_seconds(Ok(THIRTY_DAYS));
        f.store.insert(record(7, Some(wallet(7)), SubscriptionStatus::Active, expired(48)));
        f.store.insert(record(8, Some(wallet(8)), SubscriptionStatus::Active, expired(1)));

        let report = completed(f.worker.tick().await);
        assert_eq!(report.cycle_seconds, THIRTY_DAYS);
        assert_eq!(f.chain.cycle_calls.load(SeqCst), 1);

        let expected = report.scanned_at + TimeDelta::days(30);
        assert_eq!(f.store.get(7).unwrap().current_period_end, Some(expected));
        assert_eq!(f.store.get(8).unwrap().current_period_end, Some(expected));
    }

    #[tokio::test]
    async fn renewal_invalidates_cached_status() {
        let f = fixture();
        f.store.insert(record(1, Some(wallet(1)), SubscriptionStatus::Active, expired(1)));
        f.cache.put(
            &wallet(1),
            SubscriptionSnapshot {
                wallet_address: wallet(1),
                chain_id: 56,
                contract: None,
                active: Some(false),
                due: Some(true),
                next_due_at_unix_seconds: None,
                checked_at: Utc::now(),
                source: SnapshotSource::Rpc,
                unavailable: None,
            },
            Duration::from_secs(45),
        );

        completed(f.worker.tick().await);
        assert!(f.cache.get(&wallet(1)).is_none());
    }

    #[tokio::test]
    async fn unreachable_node_aborts_before_touching_records() {
        let f = fixture();
        seed_three(&f.store);
        f.chain.fail_liveness(Some(CallError::Transport("refused".into())));

        let outcome = f.worker.tick().await;
        assert!(
            matches!(outcome, TickOutcome::Aborted(ref e) if e.is_unavailable()),
            "{outcome:?}"
        );
        assert_eq!(f.chain.renew_calls.load(SeqCst), 0);
        assert_eq!(f.store.writes.load(SeqCst), 0);
        assert_eq!(f.store.get(2).unwrap().status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn missing_operator_key_aborts() {
        let f = fixture_with(
            ChainSettings {
                operator: None,
                ..chain_settings()
            },
            50,
        );
        seed_three(&f.store);
        let outcome = f.worker.tick().await;
        assert_eq!(outcome, TickOutcome::Aborted(SubscriptionError::OperatorKeyMissing));
        assert_eq!(f.store.writes.load(SeqCst), 0);
    }

    #[tokio::test]
    async fn unreadable_cycle_aborts() {
        let f = fixture();
        seed_three(&f.store);
        f.chain
            .set_cycle_seconds(Err(CallError::Rejected("execution reverted".into())));

        let outcome = f.worker.tick().await;
        assert!(matches!(outcome, TickOutcome::Aborted(_)));
        assert_eq!(f.chain.renew_calls.load(SeqCst), 0);
        assert_eq!(f.store.writes.load(SeqCst), 0);
    }

    #[tokio::test]
    async fn unsent_renewal_leaves_rest_of_batch_untouched() {
        let f = fixture();
        seed_three(&f.store);
        f.chain.fail_renewal(
            wallet(2),
            RenewalError::NotSubmitted(CallError::Transport("connection reset".into())),
        );

        let report = completed(f.worker.tick().await);
        assert_eq!(report.renewed, vec![1]);
        assert!(report.past_due.is_empty());
        assert!(report.interrupted.is_some());
        assert_eq!(f.chain.renew_calls.load(SeqCst), 2);
        assert_eq!(f.store.writes.load(SeqCst), 1);
        assert_eq!(f.store.get(2).unwrap().status, SubscriptionStatus::Active);
        assert_eq!(f.store.get(3).unwrap().status, SubscriptionStatus::PastDue);

        let state = f.worker.connections.state();
        assert_eq!(state.consecutive_failures, 1);
        assert!(!state.connected);
    }

    #[tokio::test]
    async fn unconfirmed_renewal_marks_past_due() {
        let f = fixture();
        f.store.insert(record(1, Some(wallet(1)), SubscriptionStatus::Active, expired(1)));
        f.chain.fail_renewal(
            wallet(1),
            RenewalError::Unconfirmed {
                tx_hash: "0xbeef".into(),
                reason: "receipt wait timed out".into(),
            },
        );

        let report = completed(f.worker.tick().await);
        assert_eq!(report.past_due, vec![1]);
        assert_eq!(f.store.get(1).unwrap().status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn batch_takes_oldest_first_up_to_limit() {
        let f = fixture_with(chain_settings(), 2);
        seed_three(&f.store);
        f.store.insert(record(4, None, SubscriptionStatus::Active, expired(9)));
        f.store.insert(record(5, Some(wallet(5)), SubscriptionStatus::Canceled, expired(9)));

        let report = completed(f.worker.tick().await);
        assert_eq!(report.scanned, 2);
        assert_eq!(report.renewed, vec![1, 2]);
        assert_eq!(f.chain.renewed(), vec![wallet(1), wallet(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_tick_is_skipped() {
        let f = fixture();
        seed_three(&f.store);
        f.chain.delay_renewals(Duration::from_secs(10));

        let worker = Arc::clone(&f.worker);
        let first = tokio::spawn(async move { worker.tick().await });
        f.chain.renew_started.notified().await;

        assert_eq!(f.worker.tick().await, TickOutcome::Skipped);

        let report = completed(first.await.unwrap());
        assert_eq!(report.renewed.len(), 3);

        // The guard is released once the tick is done.
        assert!(matches!(f.worker.tick().await, TickOutcome::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_waits_for_initial_delay_then_ticks_on_interval() {
        let f = fixture();
        let handle = tokio::spawn(
            Arc::clone(&f.worker).run(Duration::from_secs(15), Duration::from_secs(600)),
        );

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(f.chain.liveness_checks.load(SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.chain.liveness_checks.load(SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(f.chain.liveness_checks.load(SeqCst), 2);
        handle.abort();
    }

    #[tokio::test]
    async fn run_returns_without_operator_key() {
        let f = fixture_with(
            ChainSettings {
                operator: None,
                ..chain_settings()
            },
            50,
        );
        Arc::clone(&f.worker)
            .run(Duration::ZERO, Duration::from_secs(1))
            .await;
        assert_eq!(f.chain.liveness_checks.load(SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_subscribers_do_not_starve_the_queue() {
        let f = fixture_with(chain_settings(), 2);
        f.store.insert(record(1, Some(wallet(1)), SubscriptionStatus::PastDue, expired(60 * 24)));
        f.store.insert(record(2, Some(wallet(2)), SubscriptionStatus::PastDue, expired(59 * 24)));
        f.store.insert(record(3, Some(wallet(3)), SubscriptionStatus::Active, expired(1)));
        for user in [wallet(1), wallet(2)] {
            f.chain
                .fail_renewal(user, RenewalError::Rejected("insufficient allowance".into()));
        }

        let first = completed(f.worker.tick().await);
        assert_eq!(first.past_due, vec![1, 2]);
        assert!(f.store.get(1).unwrap().last_renewal_attempt_at.is_some());

        let second = completed(f.worker.tick().await);
        assert_eq!(second.renewed, vec![3]);
        assert_eq!(f.chain.renewed(), vec![wallet(3)]);
        let user = f.store.get(3).unwrap();
        assert_eq!(user.status, SubscriptionStatus::Active);
        assert!(user.current_period_end.unwrap() > second.scanned_at);
    }

    #[tokio::test]
    async fn unrecorded_renewal_is_never_sent_twice() {
        let f = fixture();
        seed_three(&f.store);
        f.store.fail_updates(true);

        let first = completed(f.worker.tick().await);
        assert!(first.renewed.is_empty());
        assert_eq!(first.unsaved, vec![1]);
        assert!(first.interrupted.is_some());
        assert_eq!(f.chain.renewed(), vec![wallet(1)]);

        // Store still down: user 1 is held back, the batch stops again.
        let second = completed(f.worker.tick().await);
        assert!(second.unsaved.contains(&1));
        assert_eq!(f.chain.renewed(), vec![wallet(1), wallet(2)]);

        f.store.fail_updates(false);
        let third = completed(f.worker.tick().await);
        assert_eq!(third.renewed, vec![3]);
        assert!(third.unsaved.is_empty());
        assert_eq!(f.chain.renewed(), vec![wallet(1), wallet(2), wallet(3)]);
        for user_id in [1, 2, 3] {
            assert_eq!(f.store.get(user_id).unwrap().status, SubscriptionStatus::Active);
        }
    }
}
