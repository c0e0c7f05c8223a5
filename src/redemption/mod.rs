//! Escalating redemption of settled positions.
//!
//! [`RedemptionManager::redeem`] walks an ordered list of
//! [`RedemptionStrategy`] tiers (relay endpoints, direct chain, manual) in a
//! single loop. Every attempt is recorded before the loop advances, and an
//! operator cancel is honoured between tiers.

pub mod payload;
pub mod strategy;
pub mod types;

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, U256};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub use strategy::{AttemptContext, RedemptionStrategy, StepOutcome};
pub use types::{AttemptOutcome, RedemptionAttempt, RedemptionMethod, RedemptionResult};

use crate::chain::{ChainClient, Confirmation, TxRef};
use crate::config::Config;
use crate::error::{ConfigError, EngineError};
use crate::metrics;
use crate::relay::RelayTransport;
use crate::signing::SigningAuthority;
use crate::trading::position::Position;

/// Sink that persists each attempt before the protocol moves on.
pub trait AttemptRecorder: Send + Sync {
    /// Append `attempt` to the position's history.
    fn record(&self, condition_id: &str, attempt: RedemptionAttempt) -> Result<(), EngineError>;
}

/// Contract addresses and budgets for redemption.
#[derive(Debug, Clone)]
pub struct RedemptionSettings {
    /// Conditional tokens contract.
    pub ctf: Address,
    /// Collateral token.
    pub collateral: Address,
    /// Minimum gas balance for the direct tier.
    pub min_gas_balance_wei: U256,
    /// Budget for a direct broadcast to confirm.
    pub confirm_timeout: Duration,
    /// Base of operator links.
    pub market_url_base: String,
}

impl RedemptionSettings {
    /// Settings from configuration.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            ctf: config.ctf()?,
            collateral: config.collateral()?,
            min_gas_balance_wei: config.min_gas_balance_wei(),
            confirm_timeout: config.chain_confirm_timeout(),
            market_url_base: config.market_url_base.clone(),
        })
    }
}

/// Drives the redemption protocol for one position at a time per caller.
pub struct RedemptionManager {
    strategies: Vec<RedemptionStrategy>,
    authority: Arc<SigningAuthority>,
    relay: Arc<dyn RelayTransport>,
    chain: Arc<dyn ChainClient>,
    recorder: Arc<dyn AttemptRecorder>,
    settings: RedemptionSettings,
}

impl RedemptionManager {
    /// Create a manager over an explicit tier list.
    pub fn new(
        strategies: Vec<RedemptionStrategy>,
        authority: Arc<SigningAuthority>,
        relay: Arc<dyn RelayTransport>,
        chain: Arc<dyn ChainClient>,
        recorder: Arc<dyn AttemptRecorder>,
        settings: RedemptionSettings,
    ) -> Self {
        Self {
            strategies,
            authority,
            relay,
            chain,
            recorder,
            settings,
        }
    }

    /// Configured tiers, in order.
    pub fn strategies(&self) -> &[RedemptionStrategy] {
        &self.strategies
    }

    /// Operator link for a position.
    pub fn manual_link(&self, condition_id: &str) -> String {
        payload::manual_link(&self.settings.market_url_base, condition_id)
    }

    fn manual_index(&self) -> Option<usize> {
        self.strategies
            .iter()
            .position(|s| *s == RedemptionStrategy::Manual)
    }

    /// Run the protocol for `position` until success, exhaustion or cancel.
    ///
    /// An unconfirmed direct broadcast from a previous run is reconciled first.
    #[instrument(skip(self, position, cancel), fields(condition_id = %position.condition_id))]
    pub async fn redeem(
        &self,
        position: &Position,
        cancel: &CancellationToken,
    ) -> Result<RedemptionResult, EngineError> {
        if let Some(done) = position.redemption_attempts.iter().find(|a| a.is_success()) {
            info!("Position already holds a successful redemption");
            return Ok(RedemptionResult {
                attempts: Vec::new(),
                ..RedemptionResult::succeeded(vec![done.clone()])
            });
        }

        if let Some(result) = self.reconcile(position).await? {
            return Ok(result);
        }

        let link = self.manual_link(&position.condition_id);
        let condition = payload::parse_condition_id(&position.condition_id)?;
        let call = payload::redeem_call(self.settings.ctf, self.settings.collateral, condition);

        let ctx = AttemptContext {
            authority: &self.authority,
            relay: self.relay.as_ref(),
            chain: self.chain.as_ref(),
            call: &call,
            min_gas_balance_wei: self.settings.min_gas_balance_wei,
            confirm_timeout: self.settings.confirm_timeout,
            manual_link: &link,
        };

        let mut attempts = Vec::new();
        let mut next = 0;

        while let Some(strategy) = self.strategies.get(next) {
            if cancel.is_cancelled() {
                info!(next = %strategy.method(), "Redemption cancelled by operator");
                return Ok(RedemptionResult::cancelled(
                    attempts,
                    Some(strategy.method()),
                    link,
                ));
            }

            let started = Instant::now();
            let step = strategy.attempt(&ctx).await?;
            let attempt = step.attempt().clone();
            metrics::record_redemption_attempt(
                attempt.method.label(),
                &attempt.outcome.to_string(),
                started.elapsed(),
            );

            self.recorder.record(&position.condition_id, attempt.clone())?;
            attempts.push(attempt);

            match step {
                StepOutcome::Succeeded(_) => return Ok(RedemptionResult::succeeded(attempts)),
                StepOutcome::Terminal(_) => break,
                StepOutcome::Advance(a) if a.outcome == AttemptOutcome::InsufficientFunds => {
                    next = self.manual_index().filter(|i| *i > next).unwrap_or(next + 1);
                }
                StepOutcome::Advance(_) => next += 1,
            }
        }

        warn!(attempts = attempts.len(), "Redemption tiers exhausted");
        Ok(RedemptionResult::failed(attempts, None, link))
    }

    /// Settle the fate of a previous direct broadcast before any new attempt.
    ///
    /// Returns a result when the earlier transaction turns out to be mined
    /// successfully; `None` means a new attempt is needed.
    #[instrument(skip(self, position), fields(condition_id = %position.condition_id))]
    pub async fn reconcile(
        &self,
        position: &Position,
    ) -> Result<Option<RedemptionResult>, EngineError> {
        let Some(last) = position
            .redemption_attempts
            .iter()
            .rev()
            .find(|a| a.is_unconfirmed_broadcast())
        else {
            return Ok(None);
        };
        let Some(reference) = last.tx_reference.clone() else {
            return Ok(None);
        };
        let tx = TxRef(reference);

        let mined = match self.chain.receipt_status(&tx).await {
            Ok(Some(status)) => Some(status),
            Ok(None) | Err(_) => {
                info!(tx = %tx, "Waiting on earlier broadcast before a new attempt");
                match self
                    .chain
                    .await_confirmation(&tx, self.settings.confirm_timeout)
                    .await
                {
                    Confirmation::Confirmed => Some(true),
                    Confirmation::Reverted => Some(false),
                    Confirmation::TimedOut => None,
                }
            }
        };

        match mined {
            Some(true) => {
                info!(tx = %tx, "Earlier broadcast confirmed on reconciliation");
                let attempt = RedemptionAttempt::succeeded(
                    RedemptionMethod::DirectChain,
                    Utc::now(),
                    tx.0,
                    "confirmed on reconciliation",
                );
                metrics::record_redemption_attempt(
                    attempt.method.label(),
                    &attempt.outcome.to_string(),
                    Duration::ZERO,
                );
                self.recorder.record(&position.condition_id, attempt.clone())?;
                Ok(Some(RedemptionResult::succeeded(vec![attempt])))
            }
            Some(false) => {
                info!(tx = %tx, "Earlier broadcast reverted, redeeming again");
                Ok(None)
            }
            None => {
                warn!(tx = %tx, "Earlier broadcast still unconfirmed, redeeming again");
                Ok(None)
            }
        }
    }
}
