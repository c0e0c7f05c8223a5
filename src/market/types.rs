//! CLOB wire types and the signed order struct.

use alloy::primitives::{address, Address, U256};
use alloy::sol;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::trading::order::{Side, TimeInForce};

/// CTF exchange contract (verifying contract for order signatures).
pub const CTF_EXCHANGE: Address = address!("4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E");

/// Neg-risk CTF exchange contract.
pub const NEG_RISK_CTF_EXCHANGE: Address = address!("C5d563A36AE78145C45a50134d48A1215220f80a");

/// Collateral and outcome tokens both use 6 decimals.
const TOKEN_DECIMALS: u32 = 6;

sol! {
    /// Limit order as signed for the exchange contract.
    #[derive(Debug)]
    struct ClobOrder {
        uint256 salt;
        address maker;
        address signer;
        address taker;
        uint256 tokenId;
        uint256 makerAmount;
        uint256 takerAmount;
        uint256 expiration;
        uint256 nonce;
        uint256 feeRateBps;
        uint8 side;
        uint8 signatureType;
    }
}

/// Scale a decimal amount to base units, truncating dust.
pub fn to_base_units(amount: Decimal) -> Option<U256> {
    let scaled = (amount * Decimal::from(10u64.pow(TOKEN_DECIMALS))).trunc();
    scaled.to_u128().map(U256::from)
}

/// Maker and taker amounts for a limit order.
///
/// Buyers give collateral (`price * size`) and take shares; sellers the reverse.
pub fn order_amounts(side: Side, price: Decimal, size: Decimal) -> Option<(U256, U256)> {
    let shares = to_base_units(size)?;
    let collateral = to_base_units(price * size)?;
    Some(match side {
        Side::Buy => (collateral, shares),
        Side::Sell => (shares, collateral),
    })
}

/// Exchange side code.
pub fn side_code(side: Side) -> u8 {
    match side {
        Side::Buy => 0,
        Side::Sell => 1,
    }
}

/// Exchange side name.
pub fn side_name(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

/// Exchange order type string.
pub fn order_type(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::FOK => "FOK",
        TimeInForce::FAK => "FAK",
        TimeInForce::GTC => "GTC",
    }
}

/// Signed order in the JSON shape the CLOB expects.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedOrderBody {
    /// Random salt.
    pub salt: u64,
    /// Funding address.
    pub maker: String,
    /// Signing address.
    pub signer: String,
    /// Zero address for public orders.
    pub taker: String,
    /// Outcome token id.
    pub token_id: String,
    /// Amount given, base units.
    pub maker_amount: String,
    /// Amount received, base units.
    pub taker_amount: String,
    /// Zero for non-expiring orders.
    pub expiration: String,
    /// Exchange nonce.
    pub nonce: String,
    /// Fee rate.
    pub fee_rate_bps: String,
    /// `BUY` or `SELL`.
    pub side: String,
    /// Wallet signature type code.
    pub signature_type: u8,
    /// Hex signature.
    pub signature: String,
}

/// `POST /order` request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostOrderBody {
    /// The signed order.
    pub order: SignedOrderBody,
    /// API key owning the order.
    pub owner: String,
    /// FOK, FAK or GTC.
    pub order_type: String,
}

/// `DELETE /order` request body.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOrderBody {
    /// Order to cancel.
    #[serde(rename = "orderID")]
    pub order_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn buy_gives_collateral_and_takes_shares() {
        let (maker, taker) = order_amounts(Side::Buy, dec!(0.45), dec!(10)).unwrap();
        assert_eq!(maker, U256::from(4_500_000u64));
        assert_eq!(taker, U256::from(10_000_000u64));

        let (maker, taker) = order_amounts(Side::Sell, dec!(0.45), dec!(10)).unwrap();
        assert_eq!(maker, U256::from(10_000_000u64));
        assert_eq!(taker, U256::from(4_500_000u64));
    }

    #[test]
    fn base_units_truncate_dust() {
        assert_eq!(to_base_units(dec!(0.0000019)), Some(U256::from(1u64)));
        assert_eq!(to_base_units(dec!(-1)), None);
    }

    #[test]
    fn cancel_body_uses_exchange_field_name() {
        let body = serde_json::to_string(&CancelOrderBody {
            order_id: "0xabc".to_string(),
        })
        .unwrap();
        assert_eq!(body, r#"{"orderID":"0xabc"}"#);
    }
}
