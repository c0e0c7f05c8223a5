//! Unified error types for the execution and redemption engine.

use alloy::primitives::U256;
use thiserror::Error;

use crate::trading::position::PositionStatus;

/// Unified error type for the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration loading or validation error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Order submission/tracking error.
    #[error("order error: {0}")]
    Order(#[from] OrderError),

    /// Position state machine error.
    #[error("position error: {0}")]
    Position(#[from] PositionError),

    /// Signing authority error.
    #[error("signing error: {0}")]
    Signing(#[from] SigningError),

    /// Relay transport error.
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// Chain RPC error.
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    /// Persistence error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Notification delivery error.
    #[error("notify error: {0}")]
    Notify(#[from] NotifyError),

    /// HTTP request error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine loop is no longer running.
    #[error("engine stopped")]
    Stopped,
}

impl EngineError {
    /// Invariant violations halt processing of a position until an operator steps in.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            EngineError::Position(PositionError::DuplicatePosition { .. })
                | EngineError::Signing(SigningError::NonceReuse { .. })
        )
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment deserialization failed.
    #[error("environment: {0}")]
    Env(#[from] envy::Error),

    /// A value was present but invalid.
    #[error("{0}")]
    Invalid(String),
}

/// Order submission and tracking errors.
#[derive(Error, Debug)]
pub enum OrderError {
    /// Caller input malformed; rejected before any network call.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Risk limits refused the order.
    #[error("risk check refused order: {0}")]
    RiskRejected(String),

    /// Exchange did not accept the order despite transport success.
    #[error("order rejected by exchange: {reason}")]
    ExchangeRejected {
        /// Rejection reason from the exchange.
        reason: String,
    },

    /// Network failure talking to the exchange.
    #[error("exchange transport failed: {0}")]
    Transport(String),

    /// Failed to get order status.
    #[error("failed to get order status for {order_id}: {reason}")]
    StatusFailed {
        /// Order ID.
        order_id: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to cancel order.
    #[error("failed to cancel order {order_id}: {reason}")]
    CancelFailed {
        /// Order ID that failed to cancel.
        order_id: String,
        /// Reason for failure.
        reason: String,
    },

    /// Signing the order failed.
    #[error("order signing failed: {0}")]
    Signing(String),
}

/// Position state machine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PositionError {
    /// A non-terminal position already exists for this condition.
    #[error("duplicate position for {condition_id} (existing is {existing})")]
    DuplicatePosition {
        /// Condition id.
        condition_id: String,
        /// Status of the existing position.
        existing: PositionStatus,
    },

    /// No position for this condition.
    #[error("no position for {0}")]
    NotFound(String),

    /// Requested transition is not part of the state machine.
    #[error("invalid transition for {condition_id}: {from} -> {to}")]
    InvalidTransition {
        /// Condition id.
        condition_id: String,
        /// Current status.
        from: PositionStatus,
        /// Requested status.
        to: PositionStatus,
    },

    /// Position is terminal and immutable.
    #[error("position {condition_id} is terminal ({status})")]
    TerminalPosition {
        /// Condition id.
        condition_id: String,
        /// Terminal status.
        status: PositionStatus,
    },

    /// A successful redemption is already on record.
    #[error("position {0} already holds a successful redemption")]
    AlreadyRedeemed(String),

    /// The order cannot become a position.
    #[error("order cannot open a position: {0}")]
    UnusableOrder(String),
}

/// Signing authority errors.
#[derive(Error, Debug)]
pub enum SigningError {
    /// Private key could not be parsed.
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// Signature production failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// A nonce was about to be used twice.
    #[error("nonce reuse detected: {nonce} is already in flight (highest {highest})")]
    NonceReuse {
        /// The nonce that would be reused.
        nonce: U256,
        /// Highest nonce currently tracked as in flight.
        highest: U256,
    },

    /// Authoritative nonce counter could not be read.
    #[error("nonce unavailable: {0}")]
    NonceUnavailable(String),
}

/// Relay transport errors. No retries happen inside the client.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Connection or DNS failure before the request reached the relay.
    #[error("relay unreachable: {0}")]
    Unreachable(String),

    /// Request was sent but no response arrived in time.
    #[error("relay timed out after sending: {0}")]
    Timeout(String),

    /// Relay answered with a non-success status.
    #[error("relay rejected request: HTTP {status} - {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body (truncated).
        body: String,
    },

    /// Relay answered with success but an unreadable body.
    #[error("relay response unreadable: {0}")]
    InvalidResponse(String),

    /// Request body or credentials could not be prepared.
    #[error("relay request invalid: {0}")]
    Request(String),
}

/// Chain RPC errors.
#[derive(Error, Debug)]
pub enum ChainError {
    /// Every configured RPC endpoint failed.
    #[error("rpc failed: {0}")]
    Rpc(String),

    /// The node refused the transaction.
    #[error("broadcast rejected: {0}")]
    Broadcast(String),

    /// No RPC endpoints configured.
    #[error("no rpc endpoints configured")]
    NoEndpoint,
}

/// Persistence errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization failure.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Notification delivery errors. Never fatal to the engine.
#[derive(Error, Debug)]
pub enum NotifyError {
    /// HTTP request failed.
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Notification service rejected the message.
    #[error("notification rejected: HTTP {status} - {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, EngineError>;
