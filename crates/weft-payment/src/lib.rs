//! Payment service for the weft bundling platform.
//!
//! Owns the credit ledger: user balances, reservations, x402 payments,
//! nonces, fraud records, bans, and the append-only audit log. The
//! upload service talks to it over the private bearer-authenticated
//! HTTP surface.

pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod pricing;
pub mod routes;
pub mod state;
pub mod x402;
