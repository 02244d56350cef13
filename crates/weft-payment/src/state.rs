use std::sync::Arc;

use crate::db::PaymentDb;
use crate::ledger::Ledger;
use crate::x402::X402Processor;

/// Shared application state for the payment server.
pub struct AppState {
    pub db: Arc<PaymentDb>,
    pub ledger: Arc<Ledger>,
    pub x402: Arc<X402Processor>,
    /// Shared secret for the private surface (bearer token).
    pub private_secret: Vec<u8>,
    /// Separate bearer token for /metrics (None = forbidden).
    pub metrics_token: Option<String>,
}
