//! Redemption tiers and the single-attempt logic of each.

use std::time::Duration;

use alloy::primitives::U256;
use chrono::Utc;
use tracing::{info, warn};
use url::Url;

use super::payload::exec_transaction_call;
use super::types::{AttemptOutcome, RedemptionAttempt, RedemptionMethod};
use crate::chain::{ChainClient, Confirmation, TxRef};
use crate::error::{ChainError, EngineError, RelayError, SigningError};
use crate::relay::RelayTransport;
use crate::signing::{ContractCall, NonceUse, SigningAuthority};

/// One tier of the escalation chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedemptionStrategy {
    /// Gasless relay endpoint (1-based index).
    Relay {
        /// 1-based position in the relay list.
        index: usize,
        /// Submit URL.
        endpoint: Url,
    },
    /// Broadcast from the signing key.
    DirectChain,
    /// Hand off to the operator.
    Manual,
}

/// What the driver does after a tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Redeemed; stop.
    Succeeded(RedemptionAttempt),
    /// Failed; try the next tier.
    Advance(RedemptionAttempt),
    /// Failed; no tier follows.
    Terminal(RedemptionAttempt),
}

impl StepOutcome {
    /// Attempt produced by the tier.
    pub fn attempt(&self) -> &RedemptionAttempt {
        match self {
            StepOutcome::Succeeded(a) | StepOutcome::Advance(a) | StepOutcome::Terminal(a) => a,
        }
    }
}

/// Everything a tier needs for one position.
pub struct AttemptContext<'a> {
    /// Signing gate.
    pub authority: &'a SigningAuthority,
    /// Relay transport.
    pub relay: &'a dyn RelayTransport,
    /// Chain access.
    pub chain: &'a dyn ChainClient,
    /// `redeemPositions` call for the position.
    pub call: &'a ContractCall,
    /// Minimum gas balance for the direct tier.
    pub min_gas_balance_wei: U256,
    /// Wall-clock budget for a direct broadcast to confirm.
    pub confirm_timeout: Duration,
    /// Link handed to the operator.
    pub manual_link: &'a str,
}

impl RedemptionStrategy {
    /// Ordered tiers: relays (Safe wallets only), then direct chain, then manual.
    pub fn plan(relay_endpoints: &[Url], has_safe: bool) -> Vec<Self> {
        let mut plan = Vec::with_capacity(relay_endpoints.len() + 2);
        if has_safe {
            plan.extend(
                relay_endpoints
                    .iter()
                    .enumerate()
                    .map(|(i, endpoint)| RedemptionStrategy::Relay {
                        index: i + 1,
                        endpoint: endpoint.clone(),
                    }),
            );
        }
        plan.push(RedemptionStrategy::DirectChain);
        plan.push(RedemptionStrategy::Manual);
        plan
    }

    /// Method recorded for attempts of this tier.
    pub fn method(&self) -> RedemptionMethod {
        match self {
            RedemptionStrategy::Relay { index, .. } => RedemptionMethod::Relay {
                endpoint_index: *index,
            },
            RedemptionStrategy::DirectChain => RedemptionMethod::DirectChain,
            RedemptionStrategy::Manual => RedemptionMethod::Manual,
        }
    }

    /// Run this tier once.
    ///
    /// Adapter failures become attempt outcomes. Only nonce reuse is
    /// returned as an error.
    pub async fn attempt(&self, ctx: &AttemptContext<'_>) -> Result<StepOutcome, EngineError> {
        match self {
            RedemptionStrategy::Relay { index, endpoint } => relay_attempt(ctx, *index, endpoint).await,
            RedemptionStrategy::DirectChain => direct_attempt(ctx).await,
            RedemptionStrategy::Manual => Ok(manual_attempt(ctx)),
        }
    }
}

fn signing_failure(
    method: RedemptionMethod,
    started_at: chrono::DateTime<Utc>,
    err: SigningError,
) -> Result<StepOutcome, EngineError> {
    match err {
        SigningError::NonceReuse { .. } => Err(err.into()),
        other => Ok(StepOutcome::Advance(RedemptionAttempt::failed(
            method,
            started_at,
            AttemptOutcome::TransientFailure,
            format!("signing: {}", other),
        ))),
    }
}

/// Outcome and nonce disposition of a relay answer.
fn classify_relay(
    result: &Result<crate::relay::RelayResponse, RelayError>,
) -> (AttemptOutcome, NonceUse, String) {
    match result {
        Ok(resp) => match resp.reference() {
            Some(reference) => (AttemptOutcome::Success, NonceUse::Consumed, reference.to_string()),
            None => (
                AttemptOutcome::TransientFailure,
                NonceUse::PossiblyConsumed,
                "accepted without transaction reference, nonce possibly consumed".to_string(),
            ),
        },
        Err(RelayError::Rejected { status, body }) if *status == 401 || *status == 403 => (
            AttemptOutcome::AuthFailure,
            NonceUse::Unused,
            format!("HTTP {}: {}", status, body),
        ),
        Err(RelayError::Rejected { status, body }) => (
            AttemptOutcome::TransientFailure,
            NonceUse::Unused,
            format!("HTTP {}: {}", status, body),
        ),
        Err(RelayError::Unreachable(msg)) => {
            (AttemptOutcome::Unreachable, NonceUse::Unused, msg.clone())
        }
        Err(RelayError::Timeout(msg)) => (
            AttemptOutcome::TransientFailure,
            NonceUse::PossiblyConsumed,
            format!("timed out after send, nonce possibly consumed: {}", msg),
        ),
        Err(RelayError::InvalidResponse(msg)) => (
            AttemptOutcome::TransientFailure,
            NonceUse::PossiblyConsumed,
            format!("unreadable response, nonce possibly consumed: {}", msg),
        ),
        Err(RelayError::Request(msg)) => (
            AttemptOutcome::TransientFailure,
            NonceUse::Unused,
            format!("request not sent: {}", msg),
        ),
    }
}

async fn relay_attempt(
    ctx: &AttemptContext<'_>,
    index: usize,
    endpoint: &Url,
) -> Result<StepOutcome, EngineError> {
    let method = RedemptionMethod::Relay {
        endpoint_index: index,
    };
    let started_at = Utc::now();

    // Counter read, sign and POST stay inside one session.
    let mut session = ctx.authority.gate().await;
    let nonce = match session.next_nonce(ctx.call).await {
        Ok(nonce) => nonce,
        Err(e) => return signing_failure(method, started_at, e),
    };
    let signed = match session.sign(ctx.call, nonce).await {
        Ok(signed) => signed,
        Err(e) => return signing_failure(method, started_at, e),
    };

    let result = ctx.relay.post(endpoint, &signed).await;
    let (outcome, usage, detail) = classify_relay(&result);
    session.release(nonce, usage);
    drop(session);

    let attempt = if outcome == AttemptOutcome::Success {
        info!(endpoint = %endpoint, nonce = %nonce, tx = %detail, "Relay accepted redemption");
        RedemptionAttempt::succeeded(method, started_at, detail, format!("nonce {}", nonce))
    } else {
        warn!(
            endpoint = %endpoint,
            nonce = %nonce,
            outcome = %outcome,
            detail = %detail,
            "Relay attempt failed"
        );
        RedemptionAttempt::failed(method, started_at, outcome, detail)
    };

    Ok(if attempt.is_success() {
        StepOutcome::Succeeded(attempt)
    } else {
        StepOutcome::Advance(attempt)
    })
}

async fn direct_attempt(ctx: &AttemptContext<'_>) -> Result<StepOutcome, EngineError> {
    let method = RedemptionMethod::DirectChain;
    let started_at = Utc::now();
    let payer = ctx.authority.address();

    let balance = match ctx.chain.native_balance(payer).await {
        Ok(balance) => balance,
        Err(e) => {
            warn!(error = %e, "Gas balance query failed");
            return Ok(StepOutcome::Advance(RedemptionAttempt::failed(
                method,
                started_at,
                AttemptOutcome::Unreachable,
                format!("balance query: {}", e),
            )));
        }
    };

    if balance < ctx.min_gas_balance_wei {
        warn!(balance = %balance, required = %ctx.min_gas_balance_wei, "Gas balance too low for direct redemption");
        return Ok(StepOutcome::Advance(RedemptionAttempt::failed(
            method,
            started_at,
            AttemptOutcome::InsufficientFunds,
            format!(
                "gas balance {} wei below minimum {} wei",
                balance, ctx.min_gas_balance_wei
            ),
        )));
    }

    let (broadcast, safe_nonce): (Result<TxRef, ChainError>, Option<U256>) =
        match ctx.authority.safe() {
            Some(_) => {
                let mut session = ctx.authority.gate().await;
                let nonce = match session.next_nonce(ctx.call).await {
                    Ok(nonce) => nonce,
                    Err(e) => return signing_failure(method, started_at, e),
                };
                let signed = match session.sign(ctx.call, nonce).await {
                    Ok(signed) => signed,
                    Err(e) => return signing_failure(method, started_at, e),
                };
                let result = ctx.chain.broadcast(&exec_transaction_call(&signed)).await;
                let usage = match &result {
                    Ok(_) => NonceUse::Consumed,
                    Err(ChainError::Broadcast(_)) => NonceUse::Unused,
                    Err(_) => NonceUse::PossiblyConsumed,
                };
                session.release(nonce, usage);
                (result, Some(nonce))
            }
            None => {
                // The provider fills the account nonce; keep that read and the
                // send out of reach of a concurrent redemption.
                let _session = ctx.authority.gate().await;
                (ctx.chain.broadcast(ctx.call).await, None)
            }
        };

    let tx = match broadcast {
        Ok(tx) => tx,
        Err(e) => {
            warn!(error = %e, "Direct broadcast failed");
            return Ok(StepOutcome::Advance(RedemptionAttempt::failed(
                method,
                started_at,
                AttemptOutcome::TransientFailure,
                format!("broadcast: {}", e),
            )));
        }
    };

    let confirmation = ctx.chain.await_confirmation(&tx, ctx.confirm_timeout).await;

    // A reverted execTransaction leaves the Safe nonce unused.
    if let Some(nonce) = safe_nonce {
        let usage = match confirmation {
            Confirmation::Confirmed => NonceUse::Consumed,
            Confirmation::Reverted => NonceUse::Unused,
            Confirmation::TimedOut => NonceUse::PossiblyConsumed,
        };
        ctx.authority.gate().await.release(nonce, usage);
    }

    let step = match confirmation {
        Confirmation::Confirmed => {
            info!(tx = %tx, "Direct redemption confirmed");
            StepOutcome::Succeeded(RedemptionAttempt::succeeded(
                method,
                started_at,
                tx.0,
                "confirmed",
            ))
        }
        Confirmation::Reverted => {
            warn!(tx = %tx, "Direct redemption reverted");
            StepOutcome::Advance(RedemptionAttempt::broadcast_unconfirmed(
                started_at,
                tx.0,
                "transaction reverted",
            ))
        }
        Confirmation::TimedOut => {
            warn!(tx = %tx, timeout = ?ctx.confirm_timeout, "Direct redemption not confirmed in time");
            StepOutcome::Advance(RedemptionAttempt::broadcast_unconfirmed(
                started_at,
                tx.0,
                format!("no receipt within {}s", ctx.confirm_timeout.as_secs()),
            ))
        }
    };
    Ok(step)
}

fn manual_attempt(ctx: &AttemptContext<'_>) -> StepOutcome {
    StepOutcome::Terminal(RedemptionAttempt::failed(
        RedemptionMethod::Manual,
        Utc::now(),
        AttemptOutcome::TransientFailure,
        format!("manual action required: {}", ctx.manual_link),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayResponse;

    fn urls(n: usize) -> Vec<Url> {
        (1..=n)
            .map(|i| Url::parse(&format!("https://relay-{}.test/submit", i)).unwrap())
            .collect()
    }

    #[test]
    fn plan_orders_relays_then_chain_then_manual() {
        let plan = RedemptionStrategy::plan(&urls(2), true);
        let methods: Vec<String> = plan.iter().map(|s| s.method().to_string()).collect();
        assert_eq!(methods, vec!["RELAY[1]", "RELAY[2]", "DIRECT_CHAIN", "MANUAL"]);
    }

    #[test]
    fn plan_without_safe_skips_relays() {
        let plan = RedemptionStrategy::plan(&urls(3), false);
        assert_eq!(
            plan,
            vec![RedemptionStrategy::DirectChain, RedemptionStrategy::Manual]
        );
    }

    #[test]
    fn relay_classification() {
        let auth = classify_relay(&Err(RelayError::Rejected {
            status: 403,
            body: "forbidden".to_string(),
        }));
        assert_eq!((auth.0, auth.1), (AttemptOutcome::AuthFailure, NonceUse::Unused));

        let limited = classify_relay(&Err(RelayError::Rejected {
            status: 429,
            body: String::new(),
        }));
        assert_eq!(limited.0, AttemptOutcome::TransientFailure);

        let down = classify_relay(&Err(RelayError::Unreachable("dns".to_string())));
        assert_eq!((down.0, down.1), (AttemptOutcome::Unreachable, NonceUse::Unused));

        let timeout = classify_relay(&Err(RelayError::Timeout("read".to_string())));
        assert_eq!(timeout.1, NonceUse::PossiblyConsumed);
        assert!(timeout.2.contains("possibly consumed"));

        let ok = classify_relay(&Ok(RelayResponse {
            transaction_hash: Some("0xfeed".to_string()),
            ..Default::default()
        }));
        assert_eq!((ok.0, ok.1), (AttemptOutcome::Success, NonceUse::Consumed));
        assert_eq!(ok.2, "0xfeed");
    }
}
