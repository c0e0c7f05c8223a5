//! Order execution and escalating redemption engine for Polymarket
//! binary-outcome positions.
//!
//! Orders are validated, submitted to the CLOB and tracked to a terminal
//! status. Filled orders become positions; once a market settles, the
//! position is redeemed through an ordered list of methods:
//!
//! ```text
//! RELAY[1] -> RELAY[2] -> ... -> DIRECT_CHAIN -> MANUAL
//! ```
//!
//! Every attempt is persisted before the next one starts, every signature
//! goes through one nonce gate, and a successful redemption is never
//! attempted again.
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from environment
//! - [`error`]: Unified error types
//! - [`trading`]: Orders, execution, positions and their tracker
//! - [`redemption`]: The escalating redemption protocol
//! - [`signing`]: Signing authority and request authentication
//! - [`relay`]: Gasless relayer client
//! - [`chain`]: Direct chain access
//! - [`market`]: Polymarket CLOB client
//! - [`store`]: Crash-safe persistence
//! - [`notify`]: Operator notifications
//! - [`engine`]: The control loop
//! - [`api`]: HTTP API for health, metrics and operator actions
//! - [`metrics`]: Prometheus metrics
//! - [`utils`]: Utility functions
//! - [`testing`]: In-memory adapters for tests

pub mod api;
pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod market;
pub mod metrics;
pub mod notify;
pub mod redemption;
pub mod relay;
pub mod signing;
pub mod store;
pub mod testing;
pub mod trading;
pub mod utils;

pub use config::Config;
pub use error::{EngineError, Result};
