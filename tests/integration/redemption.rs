//! Escalation, nonce and recovery behaviour of the redemption protocol.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use pretty_assertions::assert_eq;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use polymarket_redeemer::chain::TxRef;
use polymarket_redeemer::engine::redeem_position;
use polymarket_redeemer::error::{EngineError, PositionError, RelayError};
use polymarket_redeemer::redemption::{
    AttemptOutcome, RedemptionAttempt, RedemptionMethod, RedemptionResult,
};
use polymarket_redeemer::testing::{condition_id, Harness, TEST_MARKET_URL};
use polymarket_redeemer::trading::{Direction, PositionStatus};

const RELAY_1: RedemptionMethod = RedemptionMethod::Relay { endpoint_index: 1 };
const RELAY_2: RedemptionMethod = RedemptionMethod::Relay { endpoint_index: 2 };

/// Begin, redeem and apply the result, like one engine task does.
async fn redeem(harness: &Harness, id: &str) -> RedemptionResult {
    let position = harness.tracker.begin_redemption(id).unwrap();
    let result = harness
        .manager
        .redeem(&position, &CancellationToken::new())
        .await
        .unwrap();
    harness.tracker.on_redemption_result(id, &result).await.unwrap();
    result
}

fn trail(attempts: &[RedemptionAttempt]) -> Vec<(RedemptionMethod, AttemptOutcome)> {
    attempts.iter().map(|a| (a.method, a.outcome)).collect()
}

#[tokio::test]
async fn auth_failure_on_first_relay_escalates_to_second() {
    let harness = Harness::new("relay-auth");
    let id = condition_id(0x01);
    harness.settled_position(&id);

    harness.relay.script(
        &harness.relay_urls[0],
        Err(RelayError::Rejected {
            status: 401,
            body: "invalid builder key".to_string(),
        }),
    );
    harness.relay.accept(&harness.relay_urls[1], "0xabc1");

    let result = redeem(&harness, &id).await;

    assert!(result.success);
    assert_eq!(result.method, Some(RELAY_2));
    assert_eq!(result.tx_reference.as_deref(), Some("0xabc1"));
    assert_eq!(
        trail(&result.attempts),
        vec![
            (RELAY_1, AttemptOutcome::AuthFailure),
            (RELAY_2, AttemptOutcome::Success),
        ]
    );

    let position = harness.tracker.get(&id).unwrap();
    assert_eq!(position.status, PositionStatus::Redeemed);
    assert_eq!(position.redemption_attempts.len(), 2);
    assert!(harness.notifier.messages().is_empty());

    // The refused nonce never reached a counterparty and is signed again.
    let posts = harness.relay.posts();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].1, posts[1].1);
}

#[tokio::test]
async fn every_tier_failing_ends_with_one_manual_notification() {
    let harness = Harness::new("all-fail");
    let id = condition_id(0x02);
    harness.settled_position(&id);
    harness.chain.set_balance(U256::from(10u64).pow(U256::from(15)));

    let result = redeem(&harness, &id).await;

    assert!(!result.success);
    assert_eq!(result.method, Some(RedemptionMethod::Manual));
    assert_eq!(
        trail(&result.attempts),
        vec![
            (RELAY_1, AttemptOutcome::Unreachable),
            (RELAY_2, AttemptOutcome::Unreachable),
            (RedemptionMethod::DirectChain, AttemptOutcome::InsufficientFunds),
            (RedemptionMethod::Manual, AttemptOutcome::TransientFailure),
        ]
    );
    let link = format!("{}/{}", TEST_MARKET_URL, id);
    assert_eq!(result.manual_link.as_deref(), Some(link.as_str()));
    assert!(harness.chain.broadcasts().is_empty());

    let position = harness.tracker.get(&id).unwrap();
    assert_eq!(position.status, PositionStatus::RedemptionFailed);

    let messages = harness.notifier.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains(&id));
    assert!(messages[0].contains(&link));
}

#[tokio::test]
async fn exhausted_relays_fall_through_to_direct_chain() {
    let harness = Harness::new("direct");
    let id = condition_id(0x03);
    harness.settled_position(&id);

    let result = redeem(&harness, &id).await;

    assert!(result.success);
    assert_eq!(result.method, Some(RedemptionMethod::DirectChain));
    assert_eq!(
        trail(&result.attempts),
        vec![
            (RELAY_1, AttemptOutcome::Unreachable),
            (RELAY_2, AttemptOutcome::Unreachable),
            (RedemptionMethod::DirectChain, AttemptOutcome::Success),
        ]
    );
    // Executed through the Safe.
    let broadcasts = harness.chain.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].to, Address::repeat_byte(0xaa));
}

#[tokio::test]
async fn second_settlement_signal_is_a_no_op() {
    let harness = Harness::new("settle-twice");
    let id = condition_id(0x04);
    let first = harness.settled_position(&id);

    let again = assert_ok!(harness.tracker.on_market_settled(&id, Direction::Down));
    assert!(again.is_none());

    let position = harness.tracker.get(&id).unwrap();
    assert_eq!(position.status, PositionStatus::Settling);
    assert_eq!(position.winning_direction, Some(Direction::Up));
    assert_eq!(position.settled_at, first.settled_at);
}

#[tokio::test]
async fn redeemed_position_accepts_no_further_attempts() {
    let harness = Harness::new("redeemed");
    let id = condition_id(0x05);
    harness.settled_position(&id);
    harness.relay.accept(&harness.relay_urls[0], "0xabc5");
    redeem(&harness, &id).await;

    let position = harness.tracker.get(&id).unwrap();
    assert_eq!(position.status, PositionStatus::Redeemed);

    let extra = RedemptionAttempt::failed(
        RELAY_2,
        chrono::Utc::now(),
        AttemptOutcome::TransientFailure,
        "late",
    );
    let err = assert_err!(harness.tracker.record_attempt(&id, extra));
    assert!(matches!(
        err,
        EngineError::Position(PositionError::TerminalPosition { .. })
    ));

    let again = harness
        .manager
        .redeem(&position, &CancellationToken::new())
        .await
        .unwrap();
    assert!(again.success);
    assert!(again.attempts.is_empty());
    assert_eq!(harness.relay.posts().len(), 1);

    let successes = position
        .redemption_attempts
        .iter()
        .filter(|a| a.is_success())
        .count();
    assert_eq!(successes, 1);
    assert!(position.redemption_attempts.last().unwrap().is_success());
}

#[tokio::test]
async fn concurrent_redemptions_sign_distinct_nonces() {
    let harness = Harness::new("concurrent");
    let first = condition_id(0x06);
    let second = condition_id(0x07);
    harness.settled_position(&first);
    harness.settled_position(&second);
    harness.relay.accept(&harness.relay_urls[0], "0xaaa1");
    harness.relay.accept(&harness.relay_urls[0], "0xaaa2");
    harness.relay.set_delay(Duration::from_millis(20));

    let cancel = CancellationToken::new();
    let (a, b) = tokio::join!(
        redeem_position(&harness.tracker, &harness.manager, &first, &cancel),
        redeem_position(&harness.tracker, &harness.manager, &second, &cancel),
    );
    assert_eq!(a.unwrap().status, PositionStatus::Redeemed);
    assert_eq!(b.unwrap().status, PositionStatus::Redeemed);

    let nonces: Vec<U256> = harness.relay.posts().into_iter().map(|(_, n)| n).collect();
    assert_eq!(nonces, vec![U256::from(0), U256::from(1)]);
}

#[tokio::test]
async fn relay_timeout_resigns_at_the_safe_counter() {
    let harness = Harness::new("relay-timeout");
    let id = condition_id(0x0c);
    harness.settled_position(&id);
    harness.chain.set_safe_nonce(5);

    harness.relay.script(
        &harness.relay_urls[0],
        Err(RelayError::Timeout("no answer in 30s".to_string())),
    );
    harness.relay.accept(&harness.relay_urls[1], "0xabcc");

    let result = redeem(&harness, &id).await;

    assert!(result.success);
    assert_eq!(result.method, Some(RELAY_2));
    assert_eq!(
        trail(&result.attempts),
        vec![
            (RELAY_1, AttemptOutcome::TransientFailure),
            (RELAY_2, AttemptOutcome::Success),
        ]
    );

    // The Safe counter never moved, so anything above 5 could not execute.
    let nonces: Vec<U256> = harness.relay.posts().into_iter().map(|(_, n)| n).collect();
    assert_eq!(nonces, vec![U256::from(5), U256::from(5)]);
}

#[tokio::test]
async fn unknown_relay_outcome_holds_back_other_positions() {
    let harness = Harness::new("relay-unknown");
    let first = condition_id(0x0d);
    let second = condition_id(0x0e);
    harness.settled_position(&first);
    harness.settled_position(&second);
    harness.chain.set_balance(U256::ZERO);

    harness.relay.script(
        &harness.relay_urls[0],
        Err(RelayError::Timeout("no answer in 30s".to_string())),
    );
    let first_result = redeem(&harness, &first).await;
    assert!(!first_result.success);

    let second_result = redeem(&harness, &second).await;
    assert!(!second_result.success);

    // Only the first position's nonce went out; the second never signed above it.
    let posts = harness.relay.posts();
    assert!(posts.iter().all(|(_, n)| *n == U256::ZERO));
    assert_eq!(posts.len(), 2);
}

#[tokio::test]
async fn unconfirmed_broadcast_is_reconciled_after_restart() {
    let harness = Harness::new("reconcile");
    let id = condition_id(0x08);
    harness.settled_position(&id);
    harness.chain.set_auto_receipt(None);

    let result = redeem(&harness, &id).await;
    assert!(!result.success);
    let broadcast = result
        .attempts
        .iter()
        .find(|a| a.is_unconfirmed_broadcast())
        .and_then(|a| a.tx_reference.clone())
        .expect("direct attempt broadcast");

    // The transaction lands while nobody is watching.
    harness.chain.set_receipt(&TxRef(broadcast.clone()), Some(true));
    let posts_before = harness.relay.posts().len();

    let restarted = harness.restart();
    let recovered = restarted.tracker.get(&id).unwrap();
    assert_eq!(recovered.status, PositionStatus::RedemptionFailed);
    assert_eq!(recovered.redemption_attempts.len(), result.attempts.len());

    restarted.tracker.retry_failed(&id).unwrap();
    let position = redeem_position(
        &restarted.tracker,
        &restarted.manager,
        &id,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(position.status, PositionStatus::Redeemed);
    let last = position.redemption_attempts.last().unwrap();
    assert_eq!(last.method, RedemptionMethod::DirectChain);
    assert_eq!(last.tx_reference.as_deref(), Some(broadcast.as_str()));
    assert_eq!(restarted.relay.posts().len(), posts_before);
    assert_eq!(restarted.chain.broadcasts().len(), 1);
}

#[tokio::test]
async fn cancel_stops_before_the_next_tier() {
    let harness = Arc::new(Harness::new("cancel"));
    let id = condition_id(0x09);
    harness.settled_position(&id);
    harness.relay.set_delay(Duration::from_millis(50));

    let cancel = CancellationToken::new();
    let task = {
        let harness = harness.clone();
        let id = id.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            redeem_position(&harness.tracker, &harness.manager, &id, &cancel).await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();
    let position = task.await.unwrap().unwrap();

    assert_eq!(position.status, PositionStatus::RedemptionFailed);
    assert_eq!(trail(&position.redemption_attempts), vec![(RELAY_1, AttemptOutcome::Unreachable)]);
    assert_eq!(harness.relay.posts().len(), 1);

    let messages = harness.notifier.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("cancelled by operator"));
}

#[tokio::test]
async fn eoa_wallet_redeems_directly() {
    let harness = Harness::without_safe("eoa");
    let id = condition_id(0x0a);
    harness.settled_position(&id);

    let result = redeem(&harness, &id).await;

    assert!(result.success);
    assert_eq!(
        trail(&result.attempts),
        vec![(RedemptionMethod::DirectChain, AttemptOutcome::Success)]
    );
    assert!(harness.relay.posts().is_empty());

    let broadcasts = harness.chain.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].to, Address::repeat_byte(0xc7));
}

#[tokio::test]
async fn concurrent_eoa_broadcasts_never_overlap() {
    let harness = Harness::without_safe("eoa-concurrent");
    let first = condition_id(0x0f);
    let second = condition_id(0x10);
    harness.settled_position(&first);
    harness.settled_position(&second);
    harness.chain.set_broadcast_delay(Duration::from_millis(30));

    let cancel = CancellationToken::new();
    let (a, b) = tokio::join!(
        redeem_position(&harness.tracker, &harness.manager, &first, &cancel),
        redeem_position(&harness.tracker, &harness.manager, &second, &cancel),
    );
    assert_eq!(a.unwrap().status, PositionStatus::Redeemed);
    assert_eq!(b.unwrap().status, PositionStatus::Redeemed);

    assert_eq!(harness.chain.broadcasts().len(), 2);
    assert_eq!(harness.chain.max_concurrent_broadcasts(), 1);
}

#[tokio::test]
async fn operator_retry_starts_a_fresh_escalation() {
    let harness = Harness::new("retry");
    let id = condition_id(0x0b);
    harness.settled_position(&id);
    harness.chain.set_balance(U256::ZERO);

    let failed = redeem(&harness, &id).await;
    assert!(!failed.success);

    let retried = harness.tracker.retry_failed(&id).unwrap();
    assert_eq!(retried.status, PositionStatus::Settling);

    harness.relay.accept(&harness.relay_urls[0], "0xabcb");
    let result = redeem(&harness, &id).await;
    assert!(result.success);
    assert_eq!(result.method, Some(RELAY_1));

    let position = harness.tracker.get(&id).unwrap();
    assert_eq!(position.redemption_attempts.len(), failed.attempts.len() + 1);
    assert_eq!(harness.notifier.messages().len(), 1);
}
