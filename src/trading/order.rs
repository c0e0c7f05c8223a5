//! Order types and validation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::position::Direction;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Buy order.
    #[strum(serialize = "BUY", serialize = "buy")]
    Buy,
    /// Sell order.
    #[strum(serialize = "SELL", serialize = "sell")]
    Sell,
}

/// Order time-in-force.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Fill-or-kill: must fill entirely or cancel.
    #[strum(serialize = "FOK", serialize = "fok")]
    FOK,
    /// Fill-and-kill: fill what's available, cancel rest.
    #[strum(serialize = "FAK", serialize = "fak")]
    FAK,
    /// Good-till-cancelled: stays on book until filled or cancelled.
    #[default]
    #[strum(serialize = "GTC", serialize = "gtc")]
    GTC,
}

/// Caller's request to place an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Outcome token to trade.
    pub market_token_id: String,
    /// Market the token belongs to.
    pub condition_id: String,
    /// Outcome the token represents.
    pub direction: Direction,
    /// Order side (buy/sell).
    pub side: Side,
    /// Limit price, strictly inside (0, 1).
    pub limit_price: Decimal,
    /// Order size in shares.
    pub size: Decimal,
    /// Time-in-force.
    #[serde(default)]
    pub tif: TimeInForce,
}

impl OrderRequest {
    /// Create a new buy order.
    pub fn buy(
        market_token_id: impl Into<String>,
        condition_id: impl Into<String>,
        direction: Direction,
        limit_price: Decimal,
        size: Decimal,
    ) -> Self {
        Self {
            market_token_id: market_token_id.into(),
            condition_id: condition_id.into(),
            direction,
            side: Side::Buy,
            limit_price,
            size,
            tif: TimeInForce::GTC,
        }
    }

    /// Set time-in-force.
    pub fn with_tif(mut self, tif: TimeInForce) -> Self {
        self.tif = tif;
        self
    }

    /// Notional value (price * size).
    pub fn notional(&self) -> Decimal {
        self.limit_price * self.size
    }

    /// Structural checks that never need the network.
    pub fn validate(&self, min_lot: Decimal) -> Result<(), String> {
        if self.market_token_id.is_empty() {
            return Err("market_token_id is required".to_string());
        }
        if self.condition_id.is_empty() {
            return Err("condition_id is required".to_string());
        }
        if self.limit_price <= Decimal::ZERO || self.limit_price >= Decimal::ONE {
            return Err(format!(
                "limit_price {} must be strictly between 0 and 1",
                self.limit_price
            ));
        }
        if self.size < min_lot {
            return Err(format!("size {} is below the minimum lot {}", self.size, min_lot));
        }
        Ok(())
    }
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(ascii_case_insensitive)]
pub enum OrderStatus {
    /// Created locally, not yet sent.
    #[strum(serialize = "NEW")]
    New,
    /// Accepted by the exchange, status not yet observed.
    #[strum(serialize = "SUBMITTED")]
    Submitted,
    /// Resting on the book.
    #[strum(serialize = "OPEN", serialize = "LIVE", serialize = "DELAYED")]
    Open,
    /// Some size matched.
    #[strum(serialize = "PARTIALLY_FILLED", serialize = "PARTIAL")]
    PartiallyFilled,
    /// Fully matched.
    #[strum(serialize = "FILLED", serialize = "MATCHED")]
    Filled,
    /// Cancelled or expired.
    #[strum(
        serialize = "CANCELLED",
        serialize = "CANCELED",
        serialize = "UNMATCHED",
        serialize = "EXPIRED"
    )]
    Cancelled,
    /// Refused by the exchange.
    #[strum(serialize = "REJECTED")]
    Rejected,
    /// Tracking gave up before a terminal status was seen.
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

impl OrderStatus {
    /// Check if status is terminal (won't change).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Check if order was filled.
    pub fn is_filled(&self) -> bool {
        matches!(self, OrderStatus::Filled)
    }
}

/// Status snapshot returned by the exchange.
#[derive(Debug, Clone, Default)]
pub struct OrderState {
    /// Order ID.
    pub order_id: String,
    /// Current status.
    pub status: Option<OrderStatus>,
    /// Filled size.
    pub filled_size: Option<Decimal>,
}

/// An order accepted by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Exchange-assigned id.
    pub order_id: Option<String>,
    /// Outcome token.
    pub market_token_id: String,
    /// Market.
    pub condition_id: String,
    /// Outcome direction.
    pub direction: Direction,
    /// Side.
    pub side: Side,
    /// Limit price.
    pub limit_price: Decimal,
    /// Requested size.
    pub size: Decimal,
    /// Current status.
    pub status: OrderStatus,
    /// Matched size so far.
    pub filled_size: Decimal,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Build the local record for an accepted request.
    pub fn submitted(order_id: String, request: &OrderRequest) -> Self {
        let now = Utc::now();
        Self {
            order_id: Some(order_id),
            market_token_id: request.market_token_id.clone(),
            condition_id: request.condition_id.clone(),
            direction: request.direction,
            side: request.side,
            limit_price: request.limit_price,
            size: request.size,
            status: OrderStatus::Submitted,
            filled_size: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an exchange status snapshot.
    pub fn apply(&mut self, state: &OrderState) {
        if let Some(filled) = state.filled_size {
            self.filled_size = filled;
        }
        if let Some(status) = state.status {
            self.status = status;
        }
        // A full fill can show up as size before the status flips.
        if self.filled_size >= self.size && !self.status.is_terminal() {
            self.status = OrderStatus::Filled;
        }
        self.updated_at = Utc::now();
    }

    /// Size that produced exposure.
    pub fn exposure(&self) -> Decimal {
        if self.status == OrderStatus::Filled && self.filled_size.is_zero() {
            self.size
        } else {
            self.filled_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    fn request(price: Decimal, size: Decimal) -> OrderRequest {
        OrderRequest::buy("1234567890123", "0xabc", Direction::Up, price, size)
    }

    #[test]
    fn order_request_validation() {
        let min = dec!(0.0001);
        assert!(request(dec!(0.50), dec!(10)).validate(min).is_ok());
        assert!(request(dec!(0.50), dec!(0.0001)).validate(min).is_ok());

        assert!(request(dec!(0), dec!(10)).validate(min).is_err());
        assert!(request(dec!(1), dec!(10)).validate(min).is_err());
        assert!(request(dec!(0.50), dec!(0.00005)).validate(min).is_err());
        assert!(request(dec!(0.50), dec!(-10)).validate(min).is_err());

        let mut no_token = request(dec!(0.50), dec!(10));
        no_token.market_token_id.clear();
        assert!(no_token.validate(min).is_err());
    }

    #[test]
    fn order_status_terminal() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
        assert!(!OrderStatus::Unknown.is_terminal());
    }

    #[test]
    fn order_status_parses_exchange_names() {
        assert_eq!(OrderStatus::from_str("live").unwrap(), OrderStatus::Open);
        assert_eq!(OrderStatus::from_str("MATCHED").unwrap(), OrderStatus::Filled);
        assert_eq!(OrderStatus::from_str("canceled").unwrap(), OrderStatus::Cancelled);
        assert_eq!(OrderStatus::from_str("UNMATCHED").unwrap(), OrderStatus::Cancelled);
        assert!(OrderStatus::from_str("bogus").is_err());
    }

    #[test]
    fn apply_promotes_full_fill() {
        let mut order = Order::submitted("id-1".to_string(), &request(dec!(0.4), dec!(10)));
        order.apply(&OrderState {
            order_id: "id-1".to_string(),
            status: Some(OrderStatus::Open),
            filled_size: Some(dec!(10)),
        });
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.exposure(), dec!(10));
    }

    #[test]
    fn time_in_force_from_string() {
        assert_eq!(TimeInForce::from_str("FOK").unwrap(), TimeInForce::FOK);
        assert_eq!(TimeInForce::from_str("gtc").unwrap(), TimeInForce::GTC);
    }
}
