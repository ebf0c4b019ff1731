use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{bounded, Connector, NodeSession, SubscriptionReader, SubscriptionWriter};
use crate::error::SubscriptionError;

#[derive(Clone)]
pub struct ChainSettings {
    pub rpc_url: Option<String>,
    pub chain_id: u64,
    pub contract: Option<Address>,
    pub operator: Option<PrivateKeySigner>,
    pub rpc_timeout: Duration,
    pub cooldown: Duration,
}

impl fmt::Debug for ChainSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainSettings")
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("contract", &self.contract)
            .field("operator", &self.operator.as_ref().map(|s| s.address()))
            .field("rpc_timeout", &self.rpc_timeout)
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

/// A handle together with the connection generation it was built on.
/// Failures are reported back with that generation so a late failure never
/// tears down a connection that was rebuilt in the meantime.
pub struct Binding<T: ?Sized> {
    pub handle: Arc<T>,
    pub generation: u64,
}

impl<T: ?Sized> Clone for Binding<T> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
            generation: self.generation,
        }
    }
}

#[derive(Default)]
struct ConnectionState {
    session: Option<Arc<dyn NodeSession>>,
    reader: Option<Arc<dyn SubscriptionReader>>,
    writer: Option<Arc<dyn SubscriptionWriter>>,
    generation: u64,
    last_failure_at: Option<Instant>,
    last_failure_wall: Option<DateTime<Utc>>,
    last_failure_reason: Option<String>,
    consecutive_failures: u32,
    /// A caller is checking the endpoint after a cooldown ran out.
    checking: bool,
}

impl ConnectionState {
    fn cooldown_remaining(&self, cooldown: Duration, now: Instant) -> Option<Duration> {
        let failed_at = self.last_failure_at?;
        let elapsed = now.saturating_duration_since(failed_at);
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }

    fn drop_handles(&mut self) {
        self.session = None;
        self.reader = None;
        self.writer = None;
        self.generation += 1;
    }
}

/// Held by the one caller allowed to test a recovering endpoint.
struct HalfOpenGate<'a>(&'a ConnectionManager);

impl Drop for HalfOpenGate<'_> {
    fn drop(&mut self) {
        self.0.lock().checking = false;
    }
}

/// Diagnostic view of the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStateView {
    pub has_env: bool,
    pub has_operator_key: bool,
    pub chain_id: u64,
    pub connected: bool,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub consecutive_failures: u32,
    pub cooldown_remaining_ms: Option<u64>,
}

/// Owns the node session and contract bindings, and trips a cooldown
/// breaker when the endpoint stops answering.
pub struct ConnectionManager {
    settings: ChainSettings,
    connector: Arc<dyn Connector>,
    state: Mutex<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(settings: ChainSettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            settings,
            connector,
            state: Mutex::new(ConnectionState::default()),
        }
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    pub fn has_operator_key(&self) -> bool {
        self.settings.operator.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rpc_url(&self) -> Result<&str, SubscriptionError> {
        self.settings
            .rpc_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or(SubscriptionError::EnvironmentIncomplete("rpc url"))
    }

    fn contract(&self) -> Result<Address, SubscriptionError> {
        self.settings
            .contract
            .ok_or(SubscriptionError::EnvironmentIncomplete("subscription contract"))
    }

    fn ensure_session(
        &self,
        state: &mut ConnectionState,
    ) -> Result<Arc<dyn NodeSession>, SubscriptionError> {
        if let Some(session) = &state.session {
            return Ok(Arc::clone(session));
        }

        let url = self.rpc_url()?;
        match self.connector.open(url, self.settings.chain_id) {
            Ok(session) => {
                debug!(
                    chain_id = self.settings.chain_id,
                    generation = state.generation,
                    "Created rpc session"
                );
                state.session = Some(Arc::clone(&session));
                Ok(session)
            }
            Err(err) => {
                let reason = err.to_string();
                Self::record_failure(state, &reason);
                state.drop_handles();
                Err(SubscriptionError::RpcUnavailable(reason))
            }
        }
    }

    /// The cached node session, created on first use.
    pub fn connection(&self) -> Result<Binding<dyn NodeSession>, SubscriptionError> {
        let mut state = self.lock();
        let handle = self.ensure_session(&mut state)?;
        Ok(Binding {
            handle,
            generation: state.generation,
        })
    }

    /// Fails fast on missing configuration or an open breaker, otherwise
    /// checks the node once under the rpc timeout. After a cooldown only one
    /// caller at a time checks the endpoint; the others keep failing fast.
    pub async fn assert_ready(&self) -> Result<(), SubscriptionError> {
        self.rpc_url()?;
        self.contract()?;

        let _gate = {
            let mut state = self.lock();
            if let Some(remaining) =
                state.cooldown_remaining(self.settings.cooldown, Instant::now())
            {
                return Err(SubscriptionError::RpcCooldown { remaining });
            }
            if state.last_failure_at.is_some() {
                if state.checking {
                    return Err(SubscriptionError::RpcCooldown {
                        remaining: self.settings.rpc_timeout,
                    });
                }
                state.checking = true;
                Some(HalfOpenGate(self))
            } else {
                None
            }
        };

        let session = self.connection()?;
        let check = bounded(self.settings.rpc_timeout, session.handle.block_number()).await;
        match check {
            Ok(block) => {
                self.clear_failures();
                debug!(block, "Rpc liveness check ok");
                Ok(())
            }
            Err(err) => {
                self.report_failure(session.generation, &err.to_string());
                Err(err.into_unavailable())
            }
        }
    }

    /// Read-only contract binding. Never needs the operator key.
    pub fn read_contract(&self) -> Result<Binding<dyn SubscriptionReader>, SubscriptionError> {
        let contract = self.contract()?;
        let mut state = self.lock();
        let session = self.ensure_session(&mut state)?;
        let handle = state
            .reader
            .get_or_insert_with(|| session.read_contract(contract))
            .clone();
        Ok(Binding {
            handle,
            generation: state.generation,
        })
    }

    /// Operator-signed contract binding.
    pub fn write_contract(&self) -> Result<Binding<dyn SubscriptionWriter>, SubscriptionError> {
        let contract = self.contract()?;
        let operator = self
            .settings
            .operator
            .as_ref()
            .ok_or(SubscriptionError::OperatorKeyMissing)?;
        let mut state = self.lock();
        let session = self.ensure_session(&mut state)?;
        let handle = state
            .writer
            .get_or_insert_with(|| session.write_contract(contract, operator))
            .clone();
        Ok(Binding {
            handle,
            generation: state.generation,
        })
    }

    /// Records a connectivity failure observed on handles of `generation`.
    /// Handles are dropped only if they are still the current ones.
    pub fn report_failure(&self, generation: u64, reason: &str) {
        let mut state = self.lock();
        if state.generation != generation {
            debug!(
                generation,
                current = state.generation,
                "Ignoring failure from a stale connection"
            );
            return;
        }
        Self::record_failure(&mut state, reason);
        state.drop_handles();
        warn!(
            consecutive_failures = state.consecutive_failures,
            cooldown_ms = self.settings.cooldown.as_millis() as u64,
            %reason,
            "Rpc unavailable, connection dropped"
        );
    }

    fn record_failure(state: &mut ConnectionState, reason: &str) {
        state.last_failure_at = Some(Instant::now());
        state.last_failure_wall = Some(Utc::now());
        state.last_failure_reason = Some(reason.to_string());
        state.consecutive_failures += 1;
    }

    fn clear_failures(&self) {
        let mut state = self.lock();
        if state.consecutive_failures > 0 {
            info!(after_failures = state.consecutive_failures, "Rpc endpoint recovered");
        }
        state.last_failure_at = None;
        state.last_failure_wall = None;
        state.last_failure_reason = None;
        state.consecutive_failures = 0;
    }

    pub fn state(&self) -> ConnectionStateView {
        let state = self.lock();
        ConnectionStateView {
            has_env: self.rpc_url().is_ok() && self.contract().is_ok(),
            has_operator_key: self.has_operator_key(),
            chain_id: self.settings.chain_id,
            connected: state.session.is_some(),
            last_failure_at: state.last_failure_wall,
            last_failure_reason: state.last_failure_reason.clone(),
            consecutive_failures: state.consecutive_failures,
            cooldown_remaining_ms: state
                .cooldown_remaining(self.settings.cooldown, Instant::now())
                .map(|d| d.as_millis() as u64),
        }
    }
}
