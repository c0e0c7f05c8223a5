//! Pre-submission checks: input validation and risk limits.

use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use super::order::OrderRequest;

/// Sizes above this are accepted but logged.
const LARGE_ORDER_SIZE: Decimal = dec!(10000);

/// Minimum digits in an outcome token id.
const MIN_TOKEN_ID_LEN: usize = 10;

/// Rejects malformed requests before any network call.
pub trait OrderValidator: Send + Sync {
    /// `Err(reason)` when the request must not be sent.
    fn validate(&self, request: &OrderRequest) -> Result<(), String>;
}

/// Decides whether a well-formed request may be sent.
pub trait RiskCheck: Send + Sync {
    /// `true` to allow submission.
    fn approve(&self, request: &OrderRequest) -> bool;

    /// Feed realized P&L back into the limits.
    fn record_pnl(&self, _pnl: Decimal) {}
}

/// Structural checks plus token id format.
#[derive(Debug, Clone)]
pub struct BasicValidator {
    min_lot: Decimal,
}

impl BasicValidator {
    /// Create a validator with the given minimum lot.
    pub fn new(min_lot: Decimal) -> Self {
        Self { min_lot }
    }
}

impl Default for BasicValidator {
    fn default() -> Self {
        Self::new(dec!(0.0001))
    }
}

impl OrderValidator for BasicValidator {
    fn validate(&self, request: &OrderRequest) -> Result<(), String> {
        request.validate(self.min_lot)?;

        let token = &request.market_token_id;
        if token.len() < MIN_TOKEN_ID_LEN || !token.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!(
                "market_token_id {} must be a numeric string of at least {} digits",
                token, MIN_TOKEN_ID_LEN
            ));
        }

        if request.size > LARGE_ORDER_SIZE {
            warn!(size = %request.size, token_id = %token, "Unusually large order size");
        }

        Ok(())
    }
}

#[derive(Debug)]
struct DailyLoss {
    day: NaiveDate,
    realized: Decimal,
}

/// Per-order notional cap and a daily loss budget, reset at UTC midnight.
#[derive(Debug)]
pub struct RiskLimits {
    max_order_notional: Decimal,
    daily_max_loss: Decimal,
    state: Mutex<DailyLoss>,
}

impl RiskLimits {
    /// Create risk limits.
    pub fn new(max_order_notional: Decimal, daily_max_loss: Decimal) -> Self {
        Self {
            max_order_notional,
            daily_max_loss,
            state: Mutex::new(DailyLoss {
                day: Utc::now().date_naive(),
                realized: Decimal::ZERO,
            }),
        }
    }

    /// Realized P&L for the current UTC day.
    pub fn daily_pnl(&self) -> Decimal {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        roll_day(&mut state);
        state.realized
    }
}

fn roll_day(state: &mut DailyLoss) {
    let today = Utc::now().date_naive();
    if state.day != today {
        info!(previous = %state.day, realized = %state.realized, "Daily P&L reset");
        state.day = today;
        state.realized = Decimal::ZERO;
    }
}

impl RiskCheck for RiskLimits {
    fn approve(&self, request: &OrderRequest) -> bool {
        let notional = request.notional();
        if notional > self.max_order_notional {
            warn!(notional = %notional, max = %self.max_order_notional, "Order notional above limit");
            return false;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        roll_day(&mut state);
        if -state.realized >= self.daily_max_loss {
            warn!(realized = %state.realized, limit = %self.daily_max_loss, "Daily loss limit reached");
            return false;
        }
        true
    }

    fn record_pnl(&self, pnl: Decimal) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        roll_day(&mut state);
        state.realized += pnl;
    }
}
