//! Serialized nonce acquisition and Safe transaction signing.
//!
//! All signing for one identity passes through [`SigningAuthority::gate`].
//! The returned [`SigningSession`] holds the gate until it is dropped, so
//! "read counter, sign, submit" forms one critical section.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use alloy::sol;
use alloy::sol_types::{Eip712Domain, SolStruct};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

use super::create_signer;
use crate::error::SigningError;
use crate::metrics;

sol! {
    /// Gnosis Safe transaction, hashed per EIP-712.
    #[derive(Debug)]
    struct SafeTx {
        address to;
        uint256 value;
        bytes data;
        uint8 operation;
        uint256 safeTxGas;
        uint256 baseGas;
        uint256 gasPrice;
        address gasToken;
        address refundReceiver;
        uint256 nonce;
    }
}

/// How long a consumed nonce blocks reuse when the counter never catches up.
const IN_FLIGHT_TTL: Duration = Duration::from_secs(600);

/// Authoritative, externally verified nonce counter for the signing identity.
#[async_trait]
pub trait NonceSource: Send + Sync {
    /// Read the current counter. Must reflect confirmed transactions.
    async fn current_nonce(&self) -> Result<U256, SigningError>;
}

/// A contract call to be executed by the signing identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCall {
    /// Destination contract.
    pub to: Address,
    /// Native value sent with the call.
    pub value: U256,
    /// ABI-encoded call data.
    pub data: Bytes,
    /// 0 = CALL, 1 = DELEGATECALL.
    pub operation: u8,
}

/// A signed Safe meta-transaction ready for relay or direct execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMetaTransaction {
    /// EOA that produced the signature.
    pub from: Address,
    /// Safe that executes the call.
    pub safe: Address,
    /// Destination contract.
    pub to: Address,
    /// Native value.
    pub value: U256,
    /// Call data.
    pub data: Bytes,
    /// Execution flag.
    pub operation: u8,
    /// Zero for gasless relay.
    pub safe_tx_gas: U256,
    /// Zero for gasless relay.
    pub base_gas: U256,
    /// Zero for gasless relay.
    pub gas_price: U256,
    /// Zero address for gasless relay.
    pub gas_token: Address,
    /// Zero address for gasless relay.
    pub refund_receiver: Address,
    /// Safe nonce consumed by this transaction.
    pub nonce: U256,
    /// 65-byte r || s || v signature over the EIP-712 hash.
    pub signature: Bytes,
}

/// What happened to a nonce after the session tried to use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceUse {
    /// Never reached a counterparty; may be handed out again.
    Unused,
    /// Accepted by a relay or broadcast on chain.
    Consumed,
    /// Sent, but the outcome is unknown.
    PossiblyConsumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Signed in the current session, not yet released.
    Signed,
    /// Accepted by a counterparty; executes once the counter reaches it.
    Consumed,
    /// Sent with an unknown outcome.
    PossiblyConsumed,
}

#[derive(Debug, Clone)]
struct Slot {
    state: SlotState,
    owner: ContractCall,
    /// Some send with this nonce had an unknown outcome.
    unresolved: bool,
    at: Instant,
}

#[derive(Debug, Default)]
struct NonceLedger {
    /// Nonces at or above the authoritative counter that were signed.
    slots: BTreeMap<U256, Slot>,
}

impl NonceLedger {
    fn prune(&mut self, authoritative: U256) {
        let now = Instant::now();
        self.slots.retain(|nonce, slot| {
            *nonce >= authoritative && now.duration_since(slot.at) < IN_FLIGHT_TTL
        });
    }

    fn highest(&self) -> Option<U256> {
        self.slots.keys().next_back().copied()
    }

    /// A `call` may sign `nonce` again only over its own unresolved attempt.
    fn reusable_by(&self, nonce: U256, call: &ContractCall) -> bool {
        match self.slots.get(&nonce) {
            None => true,
            Some(slot) => slot.state == SlotState::PossiblyConsumed && slot.owner == *call,
        }
    }
}

/// Holds the signing key and serializes every use of the nonce counter.
pub struct SigningAuthority {
    signer: PrivateKeySigner,
    safe: Option<Address>,
    chain_id: u64,
    nonce_source: Arc<dyn NonceSource>,
    ledger: Mutex<NonceLedger>,
}

impl fmt::Debug for SigningAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningAuthority")
            .field("address", &self.signer.address())
            .field("safe", &self.safe)
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

impl SigningAuthority {
    /// Create an authority from a hex private key.
    pub fn new(
        private_key: &str,
        safe: Option<Address>,
        chain_id: u64,
        nonce_source: Arc<dyn NonceSource>,
    ) -> Result<Self, SigningError> {
        let signer = create_signer(private_key)?.with_chain_id(Some(chain_id));
        Ok(Self {
            signer,
            safe,
            chain_id,
            nonce_source,
            ledger: Mutex::new(NonceLedger::default()),
        })
    }

    /// Address of the signing key.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Safe executing signed transactions, if any.
    pub fn safe(&self) -> Option<Address> {
        self.safe
    }

    /// Wallet for transactions sent directly from the signing key.
    pub fn wallet(&self) -> EthereumWallet {
        EthereumWallet::from(self.signer.clone())
    }

    /// Enter the serializing gate. Blocks while another session is held.
    pub async fn gate(&self) -> SigningSession<'_> {
        let ledger = self.ledger.lock().await;
        SigningSession {
            authority: self,
            ledger,
        }
    }

    fn domain(&self, safe: Address) -> Eip712Domain {
        Eip712Domain::new(None, None, Some(U256::from(self.chain_id)), Some(safe), None)
    }
}

/// Exclusive hold on the signing identity.
pub struct SigningSession<'a> {
    authority: &'a SigningAuthority,
    ledger: MutexGuard<'a, NonceLedger>,
}

impl SigningSession<'_> {
    /// Next usable nonce for `call`.
    ///
    /// Always re-reads the authoritative counter, then walks past nonces
    /// other calls hold as consumed. A nonce this call sent with an unknown
    /// outcome is returned again, since the Safe executes at most one
    /// transaction per nonce. A nonce another call sent with an unknown
    /// outcome blocks: anything signed above it may never execute.
    #[instrument(skip(self, call))]
    pub async fn next_nonce(&mut self, call: &ContractCall) -> Result<U256, SigningError> {
        let authoritative = self.authority.nonce_source.current_nonce().await?;
        self.ledger.prune(authoritative);

        let mut nonce = authoritative;
        while let Some(slot) = self.ledger.slots.get(&nonce) {
            if self.ledger.reusable_by(nonce, call) {
                break;
            }
            if slot.state == SlotState::PossiblyConsumed {
                warn!(nonce = %nonce, "Earlier nonce has an unknown outcome");
                return Err(SigningError::NonceUnavailable(format!(
                    "nonce {} was sent for another call with unknown outcome",
                    nonce
                )));
            }
            nonce += U256::from(1);
        }

        debug!(authoritative = %authoritative, nonce = %nonce, "Nonce acquired");
        Ok(nonce)
    }

    /// Sign `call` as a Safe transaction with `nonce`.
    ///
    /// The nonce is marked in flight until released as [`NonceUse::Unused`].
    #[instrument(skip(self, call), fields(nonce = %nonce))]
    pub async fn sign(
        &mut self,
        call: &ContractCall,
        nonce: U256,
    ) -> Result<SignedMetaTransaction, SigningError> {
        if !self.ledger.reusable_by(nonce, call) {
            let highest = self.ledger.highest().unwrap_or(nonce);
            warn!(nonce = %nonce, highest = %highest, "Refusing to sign with a nonce already in flight");
            return Err(SigningError::NonceReuse { nonce, highest });
        }

        let safe = self
            .authority
            .safe
            .ok_or_else(|| SigningError::Signing("no Safe configured for meta-transactions".to_string()))?;

        let _timer = metrics::timer_signing();

        let tx = SafeTx {
            to: call.to,
            value: call.value,
            data: call.data.clone(),
            operation: call.operation,
            safeTxGas: U256::ZERO,
            baseGas: U256::ZERO,
            gasPrice: U256::ZERO,
            gasToken: Address::ZERO,
            refundReceiver: Address::ZERO,
            nonce,
        };
        let hash = tx.eip712_signing_hash(&self.authority.domain(safe));

        let signature = self
            .authority
            .signer
            .sign_hash(&hash)
            .await
            .map_err(|e| SigningError::Signing(e.to_string()))?;

        let unresolved = self
            .ledger
            .slots
            .get(&nonce)
            .is_some_and(|slot| slot.unresolved);
        self.ledger.slots.insert(
            nonce,
            Slot {
                state: SlotState::Signed,
                owner: call.clone(),
                unresolved,
                at: Instant::now(),
            },
        );

        Ok(SignedMetaTransaction {
            from: self.authority.address(),
            safe,
            to: call.to,
            value: call.value,
            data: call.data.clone(),
            operation: call.operation,
            safe_tx_gas: U256::ZERO,
            base_gas: U256::ZERO,
            gas_price: U256::ZERO,
            gas_token: Address::ZERO,
            refund_receiver: Address::ZERO,
            nonce,
            signature: Bytes::copy_from_slice(&signature.as_bytes()),
        })
    }

    /// Report what happened to a signed nonce.
    ///
    /// An unused release of a nonce that an earlier send left unresolved
    /// keeps it unresolved.
    pub fn release(&mut self, nonce: U256, usage: NonceUse) {
        let unresolved = match self.ledger.slots.get(&nonce) {
            Some(slot) => slot.unresolved,
            None => return,
        };
        if usage == NonceUse::Unused && !unresolved {
            self.ledger.slots.remove(&nonce);
            debug!(nonce = %nonce, "Nonce released unused");
            return;
        }
        if let Some(slot) = self.ledger.slots.get_mut(&nonce) {
            match usage {
                NonceUse::Consumed => slot.state = SlotState::Consumed,
                NonceUse::Unused | NonceUse::PossiblyConsumed => {
                    slot.state = SlotState::PossiblyConsumed;
                    slot.unresolved = true;
                }
            }
            slot.at = Instant::now();
        }
        debug!(nonce = %nonce, usage = ?usage, "Nonce released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticNonce;

    const KEY: &str = "0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn authority(counter: u64) -> (SigningAuthority, Arc<StaticNonce>) {
        let source = Arc::new(StaticNonce::new(counter));
        let safe: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let auth = SigningAuthority::new(KEY, Some(safe), 137, source.clone()).unwrap();
        (auth, source)
    }

    fn call() -> ContractCall {
        ContractCall {
            to: Address::repeat_byte(0x11),
            value: U256::ZERO,
            data: Bytes::from_static(&[0xde, 0xad]),
            operation: 0,
        }
    }

    #[tokio::test]
    async fn next_nonce_follows_authoritative_counter() {
        let (auth, source) = authority(7);
        let mut session = auth.gate().await;
        assert_eq!(session.next_nonce(&call()).await.unwrap(), U256::from(7));

        source.set(9);
        assert_eq!(session.next_nonce(&call()).await.unwrap(), U256::from(9));
    }

    fn other_call() -> ContractCall {
        ContractCall {
            data: Bytes::from_static(&[0xbe, 0xef]),
            ..call()
        }
    }

    #[tokio::test]
    async fn consumed_nonce_is_skipped_until_counter_catches_up() {
        let (auth, source) = authority(3);
        let mut session = auth.gate().await;

        let nonce = session.next_nonce(&call()).await.unwrap();
        session.sign(&call(), nonce).await.unwrap();
        session.release(nonce, NonceUse::Consumed);

        assert_eq!(session.next_nonce(&other_call()).await.unwrap(), U256::from(4));

        source.set(4);
        assert_eq!(session.next_nonce(&other_call()).await.unwrap(), U256::from(4));
    }

    #[tokio::test]
    async fn unknown_outcome_is_resigned_at_the_same_nonce() {
        let (auth, _) = authority(5);
        let mut session = auth.gate().await;

        session.sign(&call(), U256::from(5)).await.unwrap();
        session.release(U256::from(5), NonceUse::PossiblyConsumed);

        // Counter has not moved: the first send never executed.
        let nonce = session.next_nonce(&call()).await.unwrap();
        assert_eq!(nonce, U256::from(5));
        assert!(session.sign(&call(), nonce).await.is_ok());
    }

    #[tokio::test]
    async fn unused_resend_keeps_earlier_unknown_outcome() {
        let (auth, _) = authority(5);
        let mut session = auth.gate().await;

        session.sign(&call(), U256::from(5)).await.unwrap();
        session.release(U256::from(5), NonceUse::PossiblyConsumed);
        session.sign(&call(), U256::from(5)).await.unwrap();
        session.release(U256::from(5), NonceUse::Unused);

        assert!(session.next_nonce(&other_call()).await.is_err());
        assert_eq!(session.next_nonce(&call()).await.unwrap(), U256::from(5));
    }

    #[tokio::test]
    async fn unknown_outcome_blocks_other_calls() {
        let (auth, source) = authority(5);
        let mut session = auth.gate().await;

        session.sign(&call(), U256::from(5)).await.unwrap();
        session.release(U256::from(5), NonceUse::PossiblyConsumed);

        assert!(matches!(
            session.next_nonce(&other_call()).await,
            Err(SigningError::NonceUnavailable(_))
        ));
        assert!(matches!(
            session.sign(&other_call(), U256::from(5)).await,
            Err(SigningError::NonceReuse { .. })
        ));

        source.set(6);
        assert_eq!(session.next_nonce(&other_call()).await.unwrap(), U256::from(6));
    }

    #[tokio::test]
    async fn unused_nonce_is_handed_out_again() {
        let (auth, _) = authority(5);
        let mut session = auth.gate().await;

        let nonce = session.next_nonce(&call()).await.unwrap();
        session.sign(&call(), nonce).await.unwrap();
        session.release(nonce, NonceUse::Unused);

        assert_eq!(session.next_nonce(&call()).await.unwrap(), U256::from(5));
    }

    #[tokio::test]
    async fn signing_an_in_flight_nonce_is_refused() {
        let (auth, _) = authority(1);
        let mut session = auth.gate().await;

        session.sign(&call(), U256::from(1)).await.unwrap();
        session.release(U256::from(1), NonceUse::Consumed);

        let err = session.sign(&call(), U256::from(1)).await.unwrap_err();
        assert!(matches!(err, SigningError::NonceReuse { .. }));
    }

    #[tokio::test]
    async fn signature_is_65_bytes_and_carries_fields() {
        let (auth, _) = authority(0);
        let mut session = auth.gate().await;
        let signed = session.sign(&call(), U256::from(0)).await.unwrap();

        assert_eq!(signed.signature.len(), 65);
        assert_eq!(signed.to, call().to);
        assert_eq!(signed.from, auth.address());
        assert_eq!(signed.gas_price, U256::ZERO);
        let v = signed.signature[64];
        assert!(v == 27 || v == 28);
    }

    #[tokio::test]
    async fn signing_without_safe_fails() {
        let source = Arc::new(StaticNonce::new(0));
        let auth = SigningAuthority::new(KEY, None, 137, source).unwrap();
        let mut session = auth.gate().await;
        assert!(matches!(
            session.sign(&call(), U256::ZERO).await,
            Err(SigningError::Signing(_))
        ));
    }

    #[test]
    fn debug_never_prints_key() {
        let (auth, _) = authority(0);
        let printed = format!("{:?}", auth);
        assert!(!printed.contains("0123456789abcdef0123456789abcdef"));
    }
}
