//! Redemption attempt records and results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Redemption tier used by an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedemptionMethod {
    /// Relay endpoint, 1-based position in the configured list.
    Relay {
        /// 1-based endpoint index.
        endpoint_index: usize,
    },
    /// Broadcast from the signing key, paying gas.
    DirectChain,
    /// Operator does it by hand.
    Manual,
}

impl RedemptionMethod {
    /// Label without the endpoint index, for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            RedemptionMethod::Relay { .. } => "relay",
            RedemptionMethod::DirectChain => "direct_chain",
            RedemptionMethod::Manual => "manual",
        }
    }
}

impl fmt::Display for RedemptionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedemptionMethod::Relay { endpoint_index } => write!(f, "RELAY[{}]", endpoint_index),
            RedemptionMethod::DirectChain => f.write_str("DIRECT_CHAIN"),
            RedemptionMethod::Manual => f.write_str("MANUAL"),
        }
    }
}

/// Classified result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    /// Redemption executed.
    Success,
    /// Worth escalating; nothing is wrong with the configuration.
    TransientFailure,
    /// Credential or signature refused.
    AuthFailure,
    /// Not enough gas for a direct broadcast.
    InsufficientFunds,
    /// Connection or DNS failure.
    Unreachable,
}

/// Immutable record of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionAttempt {
    /// Tier used.
    pub method: RedemptionMethod,
    /// When the attempt began.
    pub started_at: DateTime<Utc>,
    /// Classified outcome.
    pub outcome: AttemptOutcome,
    /// Free-text diagnostic.
    pub detail: String,
    /// Present iff SUCCESS, or a DIRECT_CHAIN attempt that broadcast.
    pub tx_reference: Option<String>,
}

impl RedemptionAttempt {
    /// A successful attempt.
    pub fn succeeded(
        method: RedemptionMethod,
        started_at: DateTime<Utc>,
        tx_reference: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            method,
            started_at,
            outcome: AttemptOutcome::Success,
            detail: detail.into(),
            tx_reference: Some(tx_reference.into()),
        }
    }

    /// A failed attempt that produced no transaction.
    pub fn failed(
        method: RedemptionMethod,
        started_at: DateTime<Utc>,
        outcome: AttemptOutcome,
        detail: impl Into<String>,
    ) -> Self {
        debug_assert_ne!(outcome, AttemptOutcome::Success);
        Self {
            method,
            started_at,
            outcome,
            detail: detail.into(),
            tx_reference: None,
        }
    }

    /// A direct broadcast that did not confirm.
    pub fn broadcast_unconfirmed(
        started_at: DateTime<Utc>,
        tx_reference: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            method: RedemptionMethod::DirectChain,
            started_at,
            outcome: AttemptOutcome::TransientFailure,
            detail: detail.into(),
            tx_reference: Some(tx_reference.into()),
        }
    }

    /// Whether this is a SUCCESS.
    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }

    /// A direct broadcast whose fate was not observed.
    pub fn is_unconfirmed_broadcast(&self) -> bool {
        self.method == RedemptionMethod::DirectChain
            && !self.is_success()
            && self.tx_reference.is_some()
    }
}

/// Outcome of one `redeem` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionResult {
    /// Whether collateral was redeemed.
    pub success: bool,
    /// Last method attempted.
    pub method: Option<RedemptionMethod>,
    /// Reference of the successful transaction.
    pub tx_reference: Option<String>,
    /// Why the protocol did not succeed.
    pub error: Option<String>,
    /// Tier that would have run next, when stopped early.
    pub next_fallback: Option<RedemptionMethod>,
    /// Link for the operator.
    pub manual_link: Option<String>,
    /// Attempts made by this invocation, in order.
    pub attempts: Vec<RedemptionAttempt>,
    /// Stopped by an operator cancel.
    #[serde(default)]
    pub cancelled: bool,
}

impl RedemptionResult {
    /// Result for a successful attempt.
    pub fn succeeded(attempts: Vec<RedemptionAttempt>) -> Self {
        let last = attempts.last();
        Self {
            success: true,
            method: last.map(|a| a.method),
            tx_reference: last.and_then(|a| a.tx_reference.clone()),
            error: None,
            next_fallback: None,
            manual_link: None,
            attempts,
            cancelled: false,
        }
    }

    /// Result for an exhausted protocol.
    pub fn failed(
        attempts: Vec<RedemptionAttempt>,
        next_fallback: Option<RedemptionMethod>,
        manual_link: String,
    ) -> Self {
        let last = attempts.last();
        Self {
            success: false,
            method: last.map(|a| a.method),
            tx_reference: None,
            error: Some(
                last.map(|a| format!("{} {}: {}", a.method, a.outcome, a.detail))
                    .unwrap_or_else(|| "no redemption method configured".to_string()),
            ),
            next_fallback,
            manual_link: Some(manual_link),
            attempts,
            cancelled: false,
        }
    }

    /// Result for an operator cancel between tiers.
    pub fn cancelled(
        attempts: Vec<RedemptionAttempt>,
        next_fallback: Option<RedemptionMethod>,
        manual_link: String,
    ) -> Self {
        Self {
            error: Some("cancelled by operator".to_string()),
            cancelled: true,
            ..Self::failed(attempts, next_fallback, manual_link)
        }
    }
}
