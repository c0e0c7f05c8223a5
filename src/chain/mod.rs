//! Direct chain access: balances, Safe nonce, broadcast and confirmation.

pub mod contracts;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy::network::{EthereumWallet, ReceiptResponse, TransactionBuilder};
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::eth::TransactionRequest;
use alloy::transports::RpcError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};
use url::Url;

use self::contracts::IGnosisSafe;
use crate::error::{ChainError, SigningError};
use crate::signing::{ContractCall, NonceSource};

/// Hash of a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxRef(pub String);

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<B256> for TxRef {
    fn from(hash: B256) -> Self {
        TxRef(format!("{:#x}", hash))
    }
}

/// Final state of a confirmation wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Mined with status 1.
    Confirmed,
    /// Mined with status 0.
    Reverted,
    /// No receipt within the budget.
    TimedOut,
}

/// Chain access used by the direct-chain tier and the Safe nonce source.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Native (gas) balance of `address`, in wei.
    async fn native_balance(&self, address: Address) -> Result<U256, ChainError>;

    /// Current nonce of a Safe.
    async fn safe_nonce(&self, safe: Address) -> Result<U256, ChainError>;

    /// Send `call` from the signing key.
    async fn broadcast(&self, call: &ContractCall) -> Result<TxRef, ChainError>;

    /// `Some(success)` once mined, `None` while pending or unknown.
    async fn receipt_status(&self, tx: &TxRef) -> Result<Option<bool>, ChainError>;

    /// Delay between receipt polls.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(2)
    }

    /// Poll for a receipt until mined or `timeout` elapses.
    async fn await_confirmation(&self, tx: &TxRef, timeout: Duration) -> Confirmation {
        let deadline = Instant::now() + timeout;

        loop {
            match self.receipt_status(tx).await {
                Ok(Some(true)) => return Confirmation::Confirmed,
                Ok(Some(false)) => return Confirmation::Reverted,
                Ok(None) => {}
                Err(e) => warn!(tx = %tx, error = %e, "Receipt poll failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Confirmation::TimedOut;
            }
            sleep(self.poll_interval().min(deadline - now)).await;
        }
    }
}

/// alloy-backed chain client trying each RPC URL in order.
pub struct RpcChainClient {
    urls: Vec<Url>,
    wallet: EthereumWallet,
    gas_limit: u64,
    chain_id: u64,
    poll_interval: Duration,
}

impl fmt::Debug for RpcChainClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcChainClient")
            .field("urls", &self.urls)
            .field("gas_limit", &self.gas_limit)
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

impl RpcChainClient {
    /// Create a client. At least one URL is required.
    pub fn new(
        urls: Vec<Url>,
        wallet: EthereumWallet,
        gas_limit: u64,
        chain_id: u64,
        poll_interval: Duration,
    ) -> Result<Self, ChainError> {
        if urls.is_empty() {
            return Err(ChainError::NoEndpoint);
        }
        Ok(Self {
            urls,
            wallet,
            gas_limit,
            chain_id,
            poll_interval,
        })
    }

    fn provider(&self, url: &Url) -> DynProvider {
        ProviderBuilder::new()
            .wallet(self.wallet.clone())
            .connect_http(url.clone())
            .erased()
    }

    /// Run a read against each endpoint until one answers.
    async fn first_answer<T, E, F, Fut>(&self, op: &'static str, f: F) -> Result<T, ChainError>
    where
        E: fmt::Display,
        F: Fn(DynProvider) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut last_error = String::new();
        for url in &self.urls {
            match f(self.provider(url)).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(op, rpc = %url, error = %e, "RPC endpoint failed, trying next");
                    last_error = e.to_string();
                }
            }
        }
        Err(ChainError::Rpc(format!("{}: {}", op, last_error)))
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn native_balance(&self, address: Address) -> Result<U256, ChainError> {
        self.first_answer("get_balance", move |p| async move { p.get_balance(address).await })
            .await
    }

    async fn safe_nonce(&self, safe: Address) -> Result<U256, ChainError> {
        self.first_answer("safe_nonce", move |p| async move {
            IGnosisSafe::new(safe, p).nonce().call().await
        })
        .await
    }

    #[instrument(skip(self, call), fields(to = %call.to))]
    async fn broadcast(&self, call: &ContractCall) -> Result<TxRef, ChainError> {
        let tx = TransactionRequest::default()
            .with_to(call.to)
            .with_value(call.value)
            .with_input(call.data.clone())
            .with_gas_limit(self.gas_limit)
            .with_chain_id(self.chain_id);

        let mut last_error = String::new();
        for url in &self.urls {
            match self.provider(url).send_transaction(tx.clone()).await {
                Ok(pending) => {
                    let tx_ref = TxRef::from(*pending.tx_hash());
                    info!(tx = %tx_ref, rpc = %url, "Transaction broadcast");
                    return Ok(tx_ref);
                }
                // The node saw and refused it; another node would too.
                Err(RpcError::ErrorResp(payload)) => {
                    return Err(ChainError::Broadcast(payload.to_string()));
                }
                Err(e) => {
                    warn!(rpc = %url, error = %e, "Broadcast transport failed, trying next");
                    last_error = e.to_string();
                }
            }
        }
        Err(ChainError::Rpc(format!("broadcast: {}", last_error)))
    }

    async fn receipt_status(&self, tx: &TxRef) -> Result<Option<bool>, ChainError> {
        let hash: B256 = tx
            .0
            .parse()
            .map_err(|e| ChainError::Rpc(format!("bad tx hash {}: {}", tx, e)))?;

        let receipt = self
            .first_answer("get_transaction_receipt", move |p| async move {
                p.get_transaction_receipt(hash).await
            })
            .await?;

        debug!(tx = %tx, mined = receipt.is_some(), "Receipt polled");
        Ok(receipt.map(|r| r.status()))
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Reads a Safe's on-chain nonce as the authoritative counter.
pub struct SafeNonceSource {
    chain: Arc<dyn ChainClient>,
    safe: Option<Address>,
}

impl SafeNonceSource {
    /// Create a nonce source for `safe`.
    pub fn new(chain: Arc<dyn ChainClient>, safe: Option<Address>) -> Self {
        Self { chain, safe }
    }
}

#[async_trait]
impl NonceSource for SafeNonceSource {
    async fn current_nonce(&self) -> Result<U256, SigningError> {
        let safe = self
            .safe
            .ok_or_else(|| SigningError::NonceUnavailable("no Safe configured".to_string()))?;
        self.chain
            .safe_nonce(safe)
            .await
            .map_err(|e| SigningError::NonceUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChain;

    #[test]
    fn rpc_client_requires_endpoint() {
        let signer = crate::signing::create_signer(
            "0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
        )
        .unwrap();
        let result = RpcChainClient::new(
            Vec::new(),
            EthereumWallet::from(signer),
            300_000,
            137,
            Duration::from_secs(2),
        );
        assert!(matches!(result, Err(ChainError::NoEndpoint)));
    }

    #[test]
    fn tx_ref_from_hash_is_prefixed_hex() {
        let tx = TxRef::from(B256::repeat_byte(0xab));
        assert!(tx.0.starts_with("0xabab"));
        assert_eq!(tx.0.len(), 66);
    }

    #[tokio::test]
    async fn await_confirmation_sees_mined_receipt() {
        let chain = MockChain::new();
        let tx = TxRef("0x01".to_string());
        chain.set_receipt(&tx, Some(true));
        assert_eq!(
            chain.await_confirmation(&tx, Duration::from_millis(50)).await,
            Confirmation::Confirmed
        );
    }

    #[tokio::test]
    async fn await_confirmation_reports_revert() {
        let chain = MockChain::new();
        let tx = TxRef("0x02".to_string());
        chain.set_receipt(&tx, Some(false));
        assert_eq!(
            chain.await_confirmation(&tx, Duration::from_millis(50)).await,
            Confirmation::Reverted
        );
    }

    #[tokio::test]
    async fn await_confirmation_is_bounded() {
        let chain = MockChain::new();
        let tx = TxRef("0x03".to_string());
        let started = std::time::Instant::now();
        assert_eq!(
            chain.await_confirmation(&tx, Duration::from_millis(30)).await,
            Confirmation::TimedOut
        );
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn safe_nonce_source_requires_safe() {
        let source = SafeNonceSource::new(Arc::new(MockChain::new()), None);
        assert!(matches!(
            source.current_nonce().await,
            Err(SigningError::NonceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn safe_nonce_source_reads_chain() {
        let chain = Arc::new(MockChain::new());
        chain.set_safe_nonce(12);
        let source = SafeNonceSource::new(chain, Some(Address::repeat_byte(1)));
        assert_eq!(source.current_nonce().await.unwrap(), U256::from(12));
    }
}
