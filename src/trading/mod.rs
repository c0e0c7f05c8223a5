//! Trading module for order management and position tracking.
//!
//! This module handles:
//! - Order types, validation and risk checks
//! - Order submission and status tracking
//! - Position lifecycle from fill to redemption

pub mod execution;
pub mod order;
pub mod position;
pub mod tracker;
pub mod validation;

pub use execution::{ExchangeApi, ExecutorSettings, OrderEvent, OrderExecutor, SubmitResult};
pub use order::{Order, OrderRequest, OrderState, OrderStatus, Side, TimeInForce};
pub use position::{Direction, Position, PositionStatus};
pub use tracker::PositionTracker;
pub use validation::{BasicValidator, OrderValidator, RiskCheck, RiskLimits};
