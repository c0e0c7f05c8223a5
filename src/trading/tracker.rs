//! Position ownership and the position state machine.
//!
//! Every mutation is written to the [`Store`] before the call returns:
//! attempts go to the append-only log, statuses to the snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument, warn};

use super::order::Order;
use super::position::{Direction, Position, PositionStatus};
use super::validation::RiskCheck;
use crate::error::{EngineError, PositionError, Result};
use crate::metrics;
use crate::notify::{notify_quietly, NotificationGateway};
use crate::redemption::payload::manual_link;
use crate::redemption::{AttemptRecorder, RedemptionAttempt, RedemptionResult};
use crate::store::{PositionSnapshot, Store};

#[derive(Debug, Default)]
struct TrackerState {
    active: HashMap<String, Position>,
    last_attempt_seq: u64,
}

impl TrackerState {
    fn get_mut(&mut self, condition_id: &str) -> std::result::Result<&mut Position, PositionError> {
        self.active
            .get_mut(condition_id)
            .ok_or_else(|| PositionError::NotFound(condition_id.to_string()))
    }
}

fn transition(position: &mut Position, to: PositionStatus) -> std::result::Result<(), PositionError> {
    if position.status.is_terminal() {
        return Err(PositionError::TerminalPosition {
            condition_id: position.condition_id.clone(),
            status: position.status,
        });
    }
    if !position.status.can_transition_to(to) {
        return Err(PositionError::InvalidTransition {
            condition_id: position.condition_id.clone(),
            from: position.status,
            to,
        });
    }
    debug!(condition_id = %position.condition_id, from = %position.status, to = %to, "Position transition");
    position.status = to;
    Ok(())
}

/// Owns all positions.
pub struct PositionTracker {
    state: Mutex<TrackerState>,
    store: Arc<Store>,
    notifier: Arc<dyn NotificationGateway>,
    market_url_base: String,
    risk: Option<Arc<dyn RiskCheck>>,
}

impl PositionTracker {
    /// Load the snapshot from `store` and replay attempts logged after it.
    pub fn recover(
        store: Arc<Store>,
        notifier: Arc<dyn NotificationGateway>,
        market_url_base: impl Into<String>,
    ) -> Result<Self> {
        let snapshot = store.load_positions()?.unwrap_or_default();
        let mut state = TrackerState {
            active: snapshot
                .positions
                .into_iter()
                .map(|p| (p.condition_id.clone(), p))
                .collect(),
            last_attempt_seq: snapshot.last_attempt_seq,
        };

        let mut replayed = 0usize;
        for record in store.read_attempts()? {
            if record.seq <= state.last_attempt_seq {
                continue;
            }
            state.last_attempt_seq = record.seq;
            if let Some(position) = state.active.get_mut(&record.condition_id) {
                position.redemption_attempts.push(record.attempt);
                replayed += 1;
            }
        }

        info!(
            positions = state.active.len(),
            replayed,
            "Position state recovered"
        );

        let tracker = Self {
            state: Mutex::new(state),
            store,
            notifier,
            market_url_base: market_url_base.into(),
            risk: None,
        };
        if replayed > 0 {
            tracker.persist(&tracker.lock())?;
        }
        Ok(tracker)
    }

    /// Report realized P&L to `risk` as markets settle.
    ///
    /// Positions already settled today count toward the current day.
    pub fn with_risk(mut self, risk: Arc<dyn RiskCheck>) -> Self {
        let today = Utc::now().date_naive();
        for position in self.lock().active.values() {
            let settled_today = position
                .settled_at
                .is_some_and(|at| at.date_naive() == today);
            if let (true, Some(pnl)) = (settled_today, position.pnl()) {
                risk.record_pnl(pnl);
            }
        }
        self.risk = Some(risk);
        self
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &TrackerState) -> Result<()> {
        let mut positions: Vec<Position> = state.active.values().cloned().collect();
        positions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        self.store.save_positions(&PositionSnapshot {
            last_attempt_seq: state.last_attempt_seq,
            positions,
        })?;
        metrics::set_active_positions(state.active.len());
        Ok(())
    }

    /// Open a position from a filled (or partially filled) order.
    #[instrument(skip(self, order), fields(condition_id = %order.condition_id))]
    pub fn on_order_filled(&self, order: &Order) -> Result<Position> {
        let size = order.exposure();
        if size <= Decimal::ZERO {
            return Err(PositionError::UnusableOrder(format!(
                "order {:?} has no filled size",
                order.order_id
            ))
            .into());
        }

        let mut state = self.lock();
        if let Some(existing) = state.active.get(&order.condition_id) {
            if !existing.is_archivable() {
                error!(existing = %existing.status, "Duplicate position refused");
                return Err(PositionError::DuplicatePosition {
                    condition_id: order.condition_id.clone(),
                    existing: existing.status,
                }
                .into());
            }
            info!("Archiving finished position to make room for a new one");
        }

        let position = Position {
            condition_id: order.condition_id.clone(),
            direction: order.direction,
            entry_price: order.limit_price,
            size,
            status: PositionStatus::Open,
            opened_at: Utc::now(),
            settled_at: None,
            winning_direction: None,
            redemption_attempts: Vec::new(),
            acknowledged: false,
            order_id: order.order_id.clone(),
        };
        state
            .active
            .insert(position.condition_id.clone(), position.clone());
        self.persist(&state)?;

        info!(
            direction = %position.direction,
            size = %position.size,
            entry_price = %position.entry_price,
            "Position opened"
        );
        Ok(position)
    }

    /// Settlement signal. Only an OPEN position moves; anything else is a no-op.
    #[instrument(skip(self))]
    pub fn on_market_settled(
        &self,
        condition_id: &str,
        winning_direction: Direction,
    ) -> Result<Option<Position>> {
        let mut state = self.lock();
        let Some(position) = state.active.get_mut(condition_id) else {
            debug!("Settlement for unknown market ignored");
            return Ok(None);
        };
        if position.status != PositionStatus::Open {
            debug!(status = %position.status, "Settlement ignored, position not open");
            return Ok(None);
        }

        transition(position, PositionStatus::Settling)?;
        position.settled_at = Some(Utc::now());
        position.winning_direction = Some(winning_direction);
        let settled = position.clone();
        self.persist(&state)?;
        drop(state);

        if let (Some(risk), Some(pnl)) = (&self.risk, settled.pnl()) {
            risk.record_pnl(pnl);
        }

        info!(
            held = %settled.direction,
            winner = %winning_direction,
            payout = ?settled.expected_payout(),
            "Market settled"
        );
        Ok(Some(settled))
    }

    /// SETTLING -> REDEEMING. A position already REDEEMING is returned as is.
    pub fn begin_redemption(&self, condition_id: &str) -> Result<Position> {
        let mut state = self.lock();
        let position = state.get_mut(condition_id)?;
        if position.status != PositionStatus::Redeeming {
            transition(position, PositionStatus::Redeeming)?;
        }
        let position = position.clone();
        self.persist(&state)?;
        Ok(position)
    }

    /// Append an attempt. Refused on terminal positions and after a success.
    pub fn record_attempt(&self, condition_id: &str, attempt: RedemptionAttempt) -> Result<()> {
        let mut state = self.lock();
        let position = state.get_mut(condition_id)?;
        if position.status.is_terminal() {
            return Err(PositionError::TerminalPosition {
                condition_id: condition_id.to_string(),
                status: position.status,
            }
            .into());
        }
        if position.has_success() {
            return Err(PositionError::AlreadyRedeemed(condition_id.to_string()).into());
        }

        let seq = self.store.append_attempt(condition_id, &attempt)?;
        position.redemption_attempts.push(attempt);
        state.last_attempt_seq = seq;
        self.persist(&state)
    }

    /// Apply the outcome of a redemption run.
    ///
    /// Failure moves the position to REDEMPTION_FAILED and sends exactly one
    /// operator notification.
    #[instrument(skip(self, result), fields(success = result.success))]
    pub async fn on_redemption_result(
        &self,
        condition_id: &str,
        result: &RedemptionResult,
    ) -> Result<Position> {
        let position = {
            let mut state = self.lock();
            let position = state.get_mut(condition_id)?;
            let to = if result.success {
                PositionStatus::Redeemed
            } else {
                PositionStatus::RedemptionFailed
            };
            transition(position, to)?;
            let position = position.clone();
            self.persist(&state)?;
            position
        };
        metrics::inc_redemptions(result.success);

        if result.success {
            info!(
                method = ?result.method.map(|m| m.to_string()),
                tx = ?result.tx_reference,
                pnl = ?position.pnl(),
                "Position redeemed"
            );
        } else {
            let link = result
                .manual_link
                .clone()
                .unwrap_or_else(|| manual_link(&self.market_url_base, condition_id));
            warn!(error = ?result.error, link = %link, "Redemption failed, operator action needed");
            notify_quietly(self.notifier.as_ref(), &failure_message(&position, result, &link)).await;
        }
        Ok(position)
    }

    /// Operator retry: REDEMPTION_FAILED -> SETTLING.
    #[instrument(skip(self))]
    pub fn retry_failed(&self, condition_id: &str) -> Result<Position> {
        let mut state = self.lock();
        let position = state.get_mut(condition_id)?;
        if position.status != PositionStatus::RedemptionFailed {
            return Err(PositionError::InvalidTransition {
                condition_id: condition_id.to_string(),
                from: position.status,
                to: PositionStatus::Settling,
            }
            .into());
        }
        position.status = PositionStatus::Settling;
        position.acknowledged = false;
        let position = position.clone();
        self.persist(&state)?;
        info!("Redemption retry requested by operator");
        Ok(position)
    }

    /// Operator acknowledgement of a REDEMPTION_FAILED position.
    pub fn acknowledge(&self, condition_id: &str) -> Result<Position> {
        let mut state = self.lock();
        let position = state.get_mut(condition_id)?;
        if position.status != PositionStatus::RedemptionFailed {
            return Err(PositionError::InvalidTransition {
                condition_id: condition_id.to_string(),
                from: position.status,
                to: PositionStatus::RedemptionFailed,
            }
            .into());
        }
        position.acknowledged = true;
        let position = position.clone();
        self.persist(&state)?;
        info!(condition_id, "Failed redemption acknowledged");
        Ok(position)
    }

    /// Drop REDEEMED and acknowledged REDEMPTION_FAILED positions from the active set.
    pub fn archive_terminal(&self) -> Result<Vec<Position>> {
        let mut state = self.lock();
        let done: Vec<String> = state
            .active
            .values()
            .filter(|p| p.is_archivable())
            .map(|p| p.condition_id.clone())
            .collect();
        if done.is_empty() {
            return Ok(Vec::new());
        }

        let archived: Vec<Position> = done
            .iter()
            .filter_map(|id| state.active.remove(id))
            .collect();
        self.persist(&state)?;
        info!(count = archived.len(), "Archived finished positions");
        Ok(archived)
    }

    /// One position.
    pub fn get(&self, condition_id: &str) -> Option<Position> {
        self.lock().active.get(condition_id).cloned()
    }

    /// All active positions, oldest first.
    pub fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.lock().active.values().cloned().collect();
        positions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        positions
    }

    /// Positions whose redemption should be (re)started.
    pub fn pending_redemption(&self) -> Vec<Position> {
        self.positions()
            .into_iter()
            .filter(|p| matches!(p.status, PositionStatus::Settling | PositionStatus::Redeeming))
            .collect()
    }

    /// Send an operator alert outside of the redemption path.
    pub async fn alert(&self, message: &str) {
        notify_quietly(self.notifier.as_ref(), message).await;
    }
}

impl AttemptRecorder for PositionTracker {
    fn record(&self, condition_id: &str, attempt: RedemptionAttempt) -> std::result::Result<(), EngineError> {
        self.record_attempt(condition_id, attempt)
    }
}

fn failure_message(position: &Position, result: &RedemptionResult, link: &str) -> String {
    let reason = if result.cancelled {
        "cancelled by operator".to_string()
    } else {
        result.error.clone().unwrap_or_else(|| "unknown error".to_string())
    };
    format!(
        "Redemption failed for {} ({} x {}) after {} attempt(s): {}. Manual action: {}",
        position.condition_id,
        position.direction,
        position.size,
        position.redemption_attempts.len(),
        reason,
        link
    )
}
