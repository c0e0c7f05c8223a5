//! Polymarket CLOB access.
//!
//! This module handles:
//! - Order signing for the CTF exchange
//! - The authenticated CLOB client behind [`crate::trading::ExchangeApi`]

pub mod client;
pub mod types;

pub use client::ClobClient;
