//! End-to-end tests over the in-memory adapters.
//!
//! Run with: cargo test --test integration

mod orders;
mod redemption;
