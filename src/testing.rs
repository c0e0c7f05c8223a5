//! In-memory adapters and fixtures for tests.
//!
//! Every external collaborator of the engine has a scriptable double here so
//! unit tests and the `tests/` suites can drive failure paths without network
//! access. Panics on setup failure are intended.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use rust_decimal_macros::dec;
use url::Url;

use crate::chain::{ChainClient, SafeNonceSource, TxRef};
use crate::error::{ChainError, NotifyError, OrderError, RelayError, SigningError};
use crate::notify::NotificationGateway;
use crate::redemption::{RedemptionManager, RedemptionSettings, RedemptionStrategy};
use crate::relay::{RelayResponse, RelayTransport};
use crate::signing::{ContractCall, NonceSource, SignedMetaTransaction, SigningAuthority};
use crate::store::Store;
use crate::trading::execution::{ExchangeApi, SubmitResult};
use crate::trading::order::{Order, OrderRequest, OrderState, OrderStatus};
use crate::trading::position::{Direction, Position};
use crate::trading::tracker::PositionTracker;

/// Throwaway signing key.
pub const TEST_KEY: &str = "0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

/// Base of operator links in tests.
pub const TEST_MARKET_URL: &str = "https://polymarket.com/market";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A fresh, unique state directory under the system temp dir.
pub fn temp_state_dir(name: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    std::env::temp_dir().join(format!(
        "redeemer-{}-{}-{}-{}",
        name,
        std::process::id(),
        nanos,
        unique
    ))
}

/// A fully filled 10-share UP buy at 0.40.
pub fn filled_order(condition_id: &str, order_id: &str) -> Order {
    let request = OrderRequest::buy("1234567890123", condition_id, Direction::Up, dec!(0.4), dec!(10));
    let mut order = Order::submitted(order_id.to_string(), &request);
    order.status = OrderStatus::Filled;
    order.filled_size = dec!(10);
    order
}

/// Nonce counter set by hand.
#[derive(Debug)]
pub struct StaticNonce {
    value: Mutex<U256>,
}

impl StaticNonce {
    /// Counter starting at `value`.
    pub fn new(value: u64) -> Self {
        Self {
            value: Mutex::new(U256::from(value)),
        }
    }

    /// Move the counter.
    pub fn set(&self, value: u64) {
        *lock(&self.value) = U256::from(value);
    }
}

#[async_trait]
impl NonceSource for StaticNonce {
    async fn current_nonce(&self) -> Result<U256, SigningError> {
        Ok(*lock(&self.value))
    }
}

/// Notifier that keeps every message.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingNotifier {
    /// Notifier that accepts every message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifier that records, then reports a delivery failure.
    pub fn failing() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Messages received so far.
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl NotificationGateway for RecordingNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        lock(&self.messages).push(message.to_string());
        if self.fail {
            return Err(NotifyError::Rejected {
                status: 500,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

/// Exchange double. Accepts orders with sequential ids unless scripted.
#[derive(Debug, Default)]
pub struct MockExchange {
    next_id: AtomicU64,
    submits: Mutex<VecDeque<Result<SubmitResult, OrderError>>>,
    statuses: Mutex<HashMap<String, OrderState>>,
    placed: Mutex<Vec<OrderRequest>>,
    cancelled: Mutex<Vec<String>>,
}

impl MockExchange {
    /// Exchange that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next `place_order` with `result`.
    pub fn push_submit(&self, result: Result<SubmitResult, OrderError>) {
        lock(&self.submits).push_back(result);
    }

    /// Status reported for `order_id` from now on.
    pub fn set_status(&self, order_id: &str, status: OrderStatus, filled: rust_decimal::Decimal) {
        lock(&self.statuses).insert(
            order_id.to_string(),
            OrderState {
                order_id: order_id.to_string(),
                status: Some(status),
                filled_size: Some(filled),
            },
        );
    }

    /// Requests that reached the exchange.
    pub fn placed(&self) -> Vec<OrderRequest> {
        lock(&self.placed).clone()
    }

    /// Ids passed to `cancel_order`.
    pub fn cancelled(&self) -> Vec<String> {
        lock(&self.cancelled).clone()
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<SubmitResult, OrderError> {
        lock(&self.placed).push(request.clone());
        if let Some(scripted) = lock(&self.submits).pop_front() {
            return scripted;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(SubmitResult {
            order_id: Some(format!("order-{}", id)),
            error: None,
            success: Some(true),
        })
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderState, OrderError> {
        Ok(lock(&self.statuses)
            .get(order_id)
            .cloned()
            .unwrap_or_else(|| OrderState {
                order_id: order_id.to_string(),
                status: None,
                filled_size: None,
            }))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), OrderError> {
        lock(&self.cancelled).push(order_id.to_string());
        Ok(())
    }
}

/// Relay double with a response script per endpoint.
///
/// Unscripted endpoints are unreachable.
#[derive(Debug, Default)]
pub struct MockRelay {
    scripts: Mutex<HashMap<String, VecDeque<Result<RelayResponse, RelayError>>>>,
    posts: Mutex<Vec<(String, U256)>>,
    delay: Mutex<Duration>,
}

impl MockRelay {
    /// Relay with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `endpoint`.
    pub fn script(&self, endpoint: &Url, response: Result<RelayResponse, RelayError>) {
        lock(&self.scripts)
            .entry(endpoint.to_string())
            .or_default()
            .push_back(response);
    }

    /// Accept with a transaction hash.
    pub fn accept(&self, endpoint: &Url, hash: &str) {
        self.script(
            endpoint,
            Ok(RelayResponse {
                transaction_hash: Some(hash.to_string()),
                state: Some("STATE_NEW".to_string()),
                ..Default::default()
            }),
        );
    }

    /// Hold every post for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// `(endpoint, nonce)` for every post, in order.
    pub fn posts(&self) -> Vec<(String, U256)> {
        lock(&self.posts).clone()
    }
}

#[async_trait]
impl RelayTransport for MockRelay {
    async fn post(
        &self,
        endpoint: &Url,
        tx: &SignedMetaTransaction,
    ) -> Result<RelayResponse, RelayError> {
        lock(&self.posts).push((endpoint.to_string(), tx.nonce));
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        lock(&self.scripts)
            .get_mut(endpoint.as_str())
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Err(RelayError::Unreachable(format!("{} is down", endpoint))))
    }
}

/// Chain double.
///
/// Broadcasts succeed with sequential hashes and, by default, confirm at once.
#[derive(Debug)]
pub struct MockChain {
    balance: Mutex<Result<U256, String>>,
    safe_nonce: Mutex<U256>,
    receipts: Mutex<HashMap<String, Option<bool>>>,
    broadcast_script: Mutex<VecDeque<Result<TxRef, ChainError>>>,
    broadcasts: Mutex<Vec<ContractCall>>,
    auto_receipt: Mutex<Option<bool>>,
    next_tx: AtomicU64,
    broadcast_delay: Mutex<Duration>,
    sending: AtomicUsize,
    max_sending: AtomicUsize,
}

impl Default for MockChain {
    fn default() -> Self {
        Self {
            balance: Mutex::new(Ok(U256::from(10u64).pow(U256::from(18)))),
            safe_nonce: Mutex::new(U256::ZERO),
            receipts: Mutex::new(HashMap::new()),
            broadcast_script: Mutex::new(VecDeque::new()),
            broadcasts: Mutex::new(Vec::new()),
            auto_receipt: Mutex::new(Some(true)),
            next_tx: AtomicU64::new(0),
            broadcast_delay: Mutex::new(Duration::ZERO),
            sending: AtomicUsize::new(0),
            max_sending: AtomicUsize::new(0),
        }
    }
}

impl MockChain {
    /// Funded chain with confirming broadcasts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Time each broadcast takes to reach the node.
    pub fn set_broadcast_delay(&self, delay: Duration) {
        *lock(&self.broadcast_delay) = delay;
    }

    /// Most broadcasts ever in progress at once.
    pub fn max_concurrent_broadcasts(&self) -> usize {
        self.max_sending.load(Ordering::SeqCst)
    }

    /// Gas balance of every address.
    pub fn set_balance(&self, wei: U256) {
        *lock(&self.balance) = Ok(wei);
    }

    /// Make balance reads fail.
    pub fn fail_balance(&self, reason: &str) {
        *lock(&self.balance) = Err(reason.to_string());
    }

    /// Safe nonce reported by the chain.
    pub fn set_safe_nonce(&self, nonce: u64) {
        *lock(&self.safe_nonce) = U256::from(nonce);
    }

    /// Receipt for `tx`: `None` pending, `Some(ok)` mined.
    pub fn set_receipt(&self, tx: &TxRef, status: Option<bool>) {
        lock(&self.receipts).insert(tx.0.clone(), status);
    }

    /// Receipt given to future broadcasts.
    pub fn set_auto_receipt(&self, status: Option<bool>) {
        *lock(&self.auto_receipt) = status;
    }

    /// Answer the next broadcast with `result`.
    pub fn push_broadcast(&self, result: Result<TxRef, ChainError>) {
        lock(&self.broadcast_script).push_back(result);
    }

    /// Calls broadcast so far.
    pub fn broadcasts(&self) -> Vec<ContractCall> {
        lock(&self.broadcasts).clone()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn native_balance(&self, _address: Address) -> Result<U256, ChainError> {
        lock(&self.balance).clone().map_err(ChainError::Rpc)
    }

    async fn safe_nonce(&self, _safe: Address) -> Result<U256, ChainError> {
        Ok(*lock(&self.safe_nonce))
    }

    async fn broadcast(&self, call: &ContractCall) -> Result<TxRef, ChainError> {
        let sending = self.sending.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_sending.fetch_max(sending, Ordering::SeqCst);
        let delay = *lock(&self.broadcast_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.sending.fetch_sub(1, Ordering::SeqCst);

        lock(&self.broadcasts).push(call.clone());
        let tx = match lock(&self.broadcast_script).pop_front() {
            Some(scripted) => scripted?,
            None => {
                let n = self.next_tx.fetch_add(1, Ordering::Relaxed) + 1;
                TxRef(format!("0x{:064x}", n))
            }
        };
        let receipt = *lock(&self.auto_receipt);
        lock(&self.receipts).entry(tx.0.clone()).or_insert(receipt);
        Ok(tx)
    }

    async fn receipt_status(&self, tx: &TxRef) -> Result<Option<bool>, ChainError> {
        Ok(lock(&self.receipts).get(&tx.0).copied().flatten())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(5)
    }
}

/// Redemption wiring over in-memory adapters.
pub struct Harness {
    /// State directory.
    pub dir: PathBuf,
    /// Store in `dir`.
    pub store: Arc<Store>,
    /// Operator messages.
    pub notifier: Arc<RecordingNotifier>,
    /// Position state.
    pub tracker: Arc<PositionTracker>,
    /// Relay double.
    pub relay: Arc<MockRelay>,
    /// Chain double, also the Safe nonce source.
    pub chain: Arc<MockChain>,
    /// Signing gate.
    pub authority: Arc<SigningAuthority>,
    /// Manager under test.
    pub manager: Arc<RedemptionManager>,
    /// Relay endpoints, in tier order.
    pub relay_urls: Vec<Url>,
}

impl Harness {
    /// Two relay endpoints, a Safe, the direct tier and manual.
    pub fn new(name: &str) -> Self {
        Self::build(temp_state_dir(name), 2, true, Arc::new(MockChain::new()), Arc::new(MockRelay::new()))
    }

    /// EOA wiring: no relay tiers.
    pub fn without_safe(name: &str) -> Self {
        Self::build(temp_state_dir(name), 2, false, Arc::new(MockChain::new()), Arc::new(MockRelay::new()))
    }

    /// Same adapters and directory, with state recovered from disk.
    pub fn restart(&self) -> Self {
        Self::build(
            self.dir.clone(),
            self.relay_urls.len(),
            self.authority.safe().is_some(),
            self.chain.clone(),
            self.relay.clone(),
        )
    }

    fn build(
        dir: PathBuf,
        relays: usize,
        with_safe: bool,
        chain: Arc<MockChain>,
        relay: Arc<MockRelay>,
    ) -> Self {
        let store = Arc::new(Store::open(&dir).expect("open store"));
        let notifier = Arc::new(RecordingNotifier::new());
        let tracker = Arc::new(
            PositionTracker::recover(store.clone(), notifier.clone(), TEST_MARKET_URL)
                .expect("recover tracker"),
        );

        let safe: Option<Address> = with_safe.then(|| Address::repeat_byte(0xaa));
        let nonce_source = Arc::new(SafeNonceSource::new(chain.clone(), safe));
        let authority = Arc::new(
            SigningAuthority::new(TEST_KEY, safe, 137, nonce_source).expect("signing authority"),
        );

        let relay_urls: Vec<Url> = (1..=relays)
            .map(|i| Url::parse(&format!("https://relay-{}.test/submit", i)).expect("relay url"))
            .collect();
        let settings = RedemptionSettings {
            ctf: Address::repeat_byte(0xc7),
            collateral: Address::repeat_byte(0xcc),
            min_gas_balance_wei: U256::from(10u64).pow(U256::from(16)),
            confirm_timeout: Duration::from_millis(60),
            market_url_base: TEST_MARKET_URL.to_string(),
        };
        let manager = Arc::new(RedemptionManager::new(
            RedemptionStrategy::plan(&relay_urls, with_safe),
            authority.clone(),
            relay.clone(),
            chain.clone(),
            tracker.clone(),
            settings,
        ));

        Self {
            dir,
            store,
            notifier,
            tracker,
            relay,
            chain,
            authority,
            manager,
            relay_urls,
        }
    }

    /// Open a filled UP position and settle the market with UP winning.
    pub fn settled_position(&self, condition_id: &str) -> Position {
        let order_id = format!("order-{}", &condition_id[condition_id.len().saturating_sub(6)..]);
        self.tracker
            .on_order_filled(&filled_order(condition_id, &order_id))
            .expect("open position");
        self.tracker
            .on_market_settled(condition_id, Direction::Up)
            .expect("settle")
            .expect("position was open")
    }
}

/// A valid condition id built from one repeated byte.
pub fn condition_id(byte: u8) -> String {
    format!("0x{}", hex::encode([byte; 32]))
}
