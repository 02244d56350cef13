//! Core protocol library for the weft bundling platform.
//!
//! Weft ingests binary data items, collects payment for their durable
//! storage on a content-addressed permanent storage network, and packs
//! them into archival bundles. This crate holds everything the two
//! services (`weft-upload`, `weft-payment`) share:
//!
//! - Content addressing ([`ItemId`]) and the supported signature/chain
//!   families ([`SignatureKind`])
//! - The closed error taxonomy ([`WeftError`]) surfaced across both
//!   HTTP surfaces and the job pipeline
//! - x402 wire types and EIP-3009 typed-data verification
//! - The settlement facilitator client
//! - The private Upload→Payment API: typed request/response bodies and
//!   an HTTP client wrapped in a circuit breaker

pub mod auth;
pub mod backoff;
pub mod breaker;
pub mod eip3009;
pub mod error;
pub mod facilitator;
pub mod item;
pub mod network;
pub mod payment_client;
pub mod private_api;
pub mod x402;

use alloy::sol;

// EIP-3009 transfer authorization. The sol! macro derives SolStruct,
// which provides eip712_signing_hash().
sol! {
    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

pub use error::WeftError;
pub use item::{ItemId, SignatureKind};
pub use network::NetworkConfig;
pub use payment_client::{PaymentApi, PaymentClient};
pub use x402::{PaymentHeader, PaymentMode, PaymentRequiredBody, PaymentRequirements};
