//! Settlement network catalog.
//!
//! Each [`NetworkConfig`] names an EVM network the payment service can
//! accept EIP-3009 authorizations on, with the token contract and the
//! EIP-712 domain parameters verification requires.

use alloy::primitives::{address, Address};

/// USDC token decimals on every supported network.
pub const USDC_DECIMALS: u32 = 6;

/// x402 scheme identifier for EIP-3009 token authorizations.
pub const SCHEME_EIP3009: &str = "eip-3009";

/// Runtime network configuration. Decouples verification from
/// compile-time constants so new networks are a config entry away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Wire name, e.g. `base-mainnet`.
    pub network: String,
    pub chain_id: u64,
    /// Token contract the authorization must be drawn on.
    pub token_address: Address,
    pub token_decimals: u32,
    /// EIP-712 domain name/version of the token contract.
    pub domain_name: String,
    pub domain_version: String,
}

impl NetworkConfig {
    pub fn base_mainnet() -> Self {
        Self {
            network: "base-mainnet".to_string(),
            chain_id: 8453,
            token_address: address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            token_decimals: USDC_DECIMALS,
            domain_name: "USD Coin".to_string(),
            domain_version: "2".to_string(),
        }
    }

    pub fn base_sepolia() -> Self {
        Self {
            network: "base-sepolia".to_string(),
            chain_id: 84532,
            token_address: address!("036CbD53842c5426634e7929541eC2318f3dCF7e"),
            token_decimals: USDC_DECIMALS,
            domain_name: "USDC".to_string(),
            domain_version: "2".to_string(),
        }
    }

    /// All networks this build knows how to verify.
    pub fn known() -> Vec<NetworkConfig> {
        vec![Self::base_mainnet(), Self::base_sepolia()]
    }

    /// Look a network up by wire name within an enabled set.
    pub fn lookup<'a>(enabled: &'a [NetworkConfig], name: &str) -> Option<&'a NetworkConfig> {
        enabled.iter().find(|n| n.network == name)
    }
}
