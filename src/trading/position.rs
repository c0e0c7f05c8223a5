//! Position records and their lifecycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::redemption::types::{AttemptOutcome, RedemptionAttempt};

/// Outcome side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// YES / UP outcome.
    #[strum(serialize = "UP", serialize = "up", serialize = "YES", serialize = "yes")]
    Up,
    /// NO / DOWN outcome.
    #[strum(serialize = "DOWN", serialize = "down", serialize = "NO", serialize = "no")]
    Down,
}

/// Position lifecycle.
///
/// ```text
/// OPEN -> SETTLING -> REDEEMING -> REDEEMED
///                              \-> REDEMPTION_FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    /// Holding exposure, market unresolved.
    Open,
    /// Market resolved, redemption not yet started.
    Settling,
    /// Redemption protocol running.
    Redeeming,
    /// Collateral withdrawn.
    Redeemed,
    /// Every automatic method exhausted.
    RedemptionFailed,
}

impl PositionStatus {
    /// REDEEMED and REDEMPTION_FAILED never change automatically.
    pub fn is_terminal(&self) -> bool {
        match self {
            PositionStatus::Open | PositionStatus::Settling | PositionStatus::Redeeming => false,
            PositionStatus::Redeemed | PositionStatus::RedemptionFailed => true,
        }
    }

    /// Automatic transitions. Operator retry is handled separately.
    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        match self {
            PositionStatus::Open => matches!(next, PositionStatus::Settling),
            PositionStatus::Settling => matches!(
                next,
                PositionStatus::Redeeming
                    | PositionStatus::Redeemed
                    | PositionStatus::RedemptionFailed
            ),
            PositionStatus::Redeeming => matches!(
                next,
                PositionStatus::Redeemed | PositionStatus::RedemptionFailed
            ),
            PositionStatus::Redeemed | PositionStatus::RedemptionFailed => false,
        }
    }
}

/// One market exposure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Market identifier.
    pub condition_id: String,
    /// Held outcome.
    pub direction: Direction,
    /// Average entry price.
    pub entry_price: Decimal,
    /// Shares held.
    pub size: Decimal,
    /// Lifecycle status.
    pub status: PositionStatus,
    /// When the fill arrived.
    pub opened_at: DateTime<Utc>,
    /// When settlement was detected.
    pub settled_at: Option<DateTime<Utc>>,
    /// Resolved outcome, once known.
    pub winning_direction: Option<Direction>,
    /// Chronological, append-only.
    pub redemption_attempts: Vec<RedemptionAttempt>,
    /// Operator acknowledged a REDEMPTION_FAILED.
    #[serde(default)]
    pub acknowledged: bool,
    /// Order that opened the position.
    #[serde(default)]
    pub order_id: Option<String>,
}

impl Position {
    /// Calculate the cost basis.
    pub fn cost_basis(&self) -> Decimal {
        self.size * self.entry_price
    }

    /// Payout at settlement: one unit per share when the held side won.
    pub fn expected_payout(&self) -> Option<Decimal> {
        self.winning_direction.map(|winner| {
            if winner == self.direction {
                self.size
            } else {
                Decimal::ZERO
            }
        })
    }

    /// Realized P&L once the winner is known.
    pub fn pnl(&self) -> Option<Decimal> {
        self.expected_payout().map(|payout| payout - self.cost_basis())
    }

    /// Whether a SUCCESS attempt is already recorded.
    pub fn has_success(&self) -> bool {
        self.redemption_attempts
            .iter()
            .any(|a| a.outcome == AttemptOutcome::Success)
    }

    /// Can leave the active set.
    pub fn is_archivable(&self) -> bool {
        match self.status {
            PositionStatus::Redeemed => true,
            PositionStatus::RedemptionFailed => self.acknowledged,
            _ => false,
        }
    }
}
