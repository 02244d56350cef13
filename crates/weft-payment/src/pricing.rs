//! Price oracle: bytes → credits → token smallest units.
//!
//! The production oracle is a fixed-rate table refreshed out of band;
//! the two-step conversion (bytes to native credits, credits to a
//! fiat-stable token amount) is what the x402 quote and settlement
//! checks are built on.

use weft::x402::{PaymentRequirements, PaymentRequirementsExtra};
use weft::NetworkConfig;

pub trait PriceOracle: Send + Sync {
    /// Storage price of `bytes` in credits, before any buffer.
    fn credits_for_bytes(&self, bytes: u64) -> u64;

    /// Convert credits to the token's smallest unit, rounding up so the
    /// service is never underpaid by rounding.
    fn token_units_for_credits(&self, credits: u64, token_decimals: u32) -> u128;

    /// Convert a settled token amount back to credits, rounding down.
    fn credits_for_token_units(&self, units: u128, token_decimals: u32) -> u64;
}

/// Fixed-rate oracle: a flat credits-per-KiB storage rate and a flat
/// credits-per-USD exchange rate.
pub struct FixedRateOracle {
    credits_per_kib: u64,
    credits_per_usd: u64,
}

impl FixedRateOracle {
    pub fn new(credits_per_kib: u64, credits_per_usd: u64) -> Self {
        Self {
            credits_per_kib,
            credits_per_usd,
        }
    }
}

impl PriceOracle for FixedRateOracle {
    fn credits_for_bytes(&self, bytes: u64) -> u64 {
        let numerator = bytes as u128 * self.credits_per_kib as u128;
        numerator.div_ceil(1024) as u64
    }

    fn token_units_for_credits(&self, credits: u64, token_decimals: u32) -> u128 {
        let unit_scale = 10u128.pow(token_decimals);
        (credits as u128 * unit_scale).div_ceil(self.credits_per_usd as u128)
    }

    fn credits_for_token_units(&self, units: u128, token_decimals: u32) -> u64 {
        let unit_scale = 10u128.pow(token_decimals);
        ((units * self.credits_per_usd as u128) / unit_scale) as u64
    }
}

/// Build the 402 `accepts` entry for one network.
pub fn requirements_for(
    oracle: &dyn PriceOracle,
    network: &NetworkConfig,
    pay_to: alloy::primitives::Address,
    credits_with_buffer: u64,
    byte_count: u64,
    max_timeout_seconds: u64,
) -> PaymentRequirements {
    let amount = oracle.token_units_for_credits(credits_with_buffer, network.token_decimals);
    PaymentRequirements {
        scheme: weft::network::SCHEME_EIP3009.to_string(),
        network: network.network.clone(),
        max_amount_required: amount.to_string(),
        resource: format!("upload/{byte_count}-bytes"),
        asset: network.token_address,
        pay_to,
        max_timeout_seconds,
        extra: PaymentRequirementsExtra {
            name: network.domain_name.clone(),
            version: network.domain_version.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kib_rate_scales_linearly() {
        let oracle = FixedRateOracle::new(10_000, 1_000_000_000);
        assert_eq!(oracle.credits_for_bytes(1024), 10_000);
        assert_eq!(oracle.credits_for_bytes(2048), 20_000);
        // Partial KiB rounds up.
        assert_eq!(oracle.credits_for_bytes(1), 10);
    }

    #[test]
    fn token_conversion_rounds_against_us() {
        let oracle = FixedRateOracle::new(10_000, 1_000_000_000);
        // 1e9 credits = $1 = 1_000_000 units at 6 decimals.
        assert_eq!(oracle.token_units_for_credits(1_000_000_000, 6), 1_000_000);
        // A single credit still costs at least one unit.
        assert_eq!(oracle.token_units_for_credits(1, 6), 1);
        // Round-trip loses at most the rounding margin.
        let units = oracle.token_units_for_credits(11_500, 6);
        let back = oracle.credits_for_token_units(units, 6);
        assert!(back >= 11_500);
    }
}
