//! Call data for redemption.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::SolCall;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::chain::contracts::{IConditionalTokens, IGnosisSafe};
use crate::error::PositionError;
use crate::signing::{ContractCall, SignedMetaTransaction};

static CONDITION_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("valid regex"));

/// Outcome index sets for a binary market: both slots, so the contract pays
/// whichever side won.
pub const BINARY_INDEX_SETS: [u64; 2] = [1, 2];

/// Parse a `0x`-prefixed 32-byte condition id.
pub fn parse_condition_id(condition_id: &str) -> Result<B256, PositionError> {
    if !CONDITION_ID.is_match(condition_id) {
        return Err(PositionError::UnusableOrder(format!(
            "condition id {} is not 32 bytes of hex",
            condition_id
        )));
    }
    condition_id
        .parse()
        .map_err(|e| PositionError::UnusableOrder(format!("condition id {}: {}", condition_id, e)))
}

/// `redeemPositions(collateral, 0x0, conditionId, [1, 2])` on the conditional tokens contract.
pub fn redeem_call(ctf: Address, collateral: Address, condition_id: B256) -> ContractCall {
    let data = IConditionalTokens::redeemPositionsCall {
        collateralToken: collateral,
        parentCollectionId: B256::ZERO,
        conditionId: condition_id,
        indexSets: BINARY_INDEX_SETS.iter().map(|i| U256::from(*i)).collect(),
    }
    .abi_encode();

    ContractCall {
        to: ctf,
        value: U256::ZERO,
        data: Bytes::from(data),
        operation: 0,
    }
}

/// Wrap a signed Safe transaction in `execTransaction` for a direct broadcast.
pub fn exec_transaction_call(signed: &SignedMetaTransaction) -> ContractCall {
    let data = IGnosisSafe::execTransactionCall {
        to: signed.to,
        value: signed.value,
        data: signed.data.clone(),
        operation: signed.operation,
        safeTxGas: signed.safe_tx_gas,
        baseGas: signed.base_gas,
        gasPrice: signed.gas_price,
        gasToken: signed.gas_token,
        refundReceiver: signed.refund_receiver,
        signatures: signed.signature.clone(),
    }
    .abi_encode();

    ContractCall {
        to: signed.safe,
        value: U256::ZERO,
        data: Bytes::from(data),
        operation: 0,
    }
}

/// Operator link for a market.
pub fn manual_link(base: &str, condition_id: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), condition_id)
}
