//! EIP-712 typed-data verification for EIP-3009 authorizations.
//!
//! Builds the token contract's domain separator, computes the signing
//! hash for a [`TransferWithAuthorization`], and recovers the signer with
//! EIP-2 malleability protection.

use alloy::primitives::{Address, FixedBytes, Signature, B256, U256};
use alloy::sol_types::SolStruct;

use crate::network::NetworkConfig;
use crate::x402::Eip3009Authorization;
use crate::{TransferWithAuthorization, WeftError};

/// Build the EIP-712 domain for the token contract on the given network.
pub fn token_domain(network: &NetworkConfig) -> alloy::sol_types::Eip712Domain {
    alloy::sol_types::Eip712Domain {
        name: Some(std::borrow::Cow::Owned(network.domain_name.clone())),
        version: Some(std::borrow::Cow::Owned(network.domain_version.clone())),
        chain_id: Some(U256::from(network.chain_id)),
        verifying_contract: Some(network.token_address),
        salt: None,
    }
}

/// Compute the EIP-712 signing hash of an authorization.
pub fn signing_hash(
    auth: &TransferWithAuthorization,
    network: &NetworkConfig,
) -> B256 {
    auth.eip712_signing_hash(&token_domain(network))
}

/// Lift the wire authorization into the typed EIP-712 struct.
pub fn typed_authorization(
    auth: &Eip3009Authorization,
) -> Result<TransferWithAuthorization, WeftError> {
    Ok(TransferWithAuthorization {
        from: auth.from,
        to: auth.to,
        value: U256::from(auth.value_units()?),
        validAfter: U256::from(auth.valid_after),
        validBefore: U256::from(auth.valid_before),
        nonce: auth.nonce_bytes()?,
    })
}

/// secp256k1 curve order N / 2 — signatures with s above this are
/// malleable (EIP-2) and rejected.
const SECP256K1_N_DIV_2: U256 = U256::from_limbs([
    0xBFD25E8CD0364140,
    0xBAAEDCE6AF48A03B,
    0xFFFFFFFFFFFFFFFE,
    0x7FFFFFFFFFFFFFFF,
]);

/// Verify a signed authorization and return the recovered signer.
///
/// Callers must still compare the recovered address to the declared
/// `from`; this function only proves who signed.
pub fn recover_signer(
    auth: &Eip3009Authorization,
    signature_hex: &str,
    network: &NetworkConfig,
) -> Result<Address, WeftError> {
    let hex = signature_hex.strip_prefix("0x").unwrap_or(signature_hex);
    let sig_bytes = alloy::hex::decode(hex)
        .map_err(|e| WeftError::SignatureInvalid(format!("signature is not hex: {e}")))?;
    if sig_bytes.len() != 65 {
        return Err(WeftError::SignatureInvalid(format!(
            "signature must be 65 bytes, got {}",
            sig_bytes.len()
        )));
    }

    let sig = Signature::from_raw(&sig_bytes)
        .map_err(|e| WeftError::SignatureInvalid(format!("unparseable signature: {e}")))?;

    if sig.s() > SECP256K1_N_DIV_2 {
        return Err(WeftError::SignatureInvalid(
            "high-s signature rejected".to_string(),
        ));
    }

    let typed = typed_authorization(auth)?;
    let hash = signing_hash(&typed, network);
    sig.recover_address_from_prehash(&hash)
        .map_err(|e| WeftError::SignatureInvalid(format!("recovery failed: {e}")))
}

/// Generate a random 32-byte authorization nonce.
pub fn random_nonce() -> FixedBytes<32> {
    let mut bytes = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
    FixedBytes::new(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;

    fn sign(auth: &Eip3009Authorization, signer: &PrivateKeySigner) -> String {
        let typed = typed_authorization(auth).unwrap();
        let hash = signing_hash(&typed, &NetworkConfig::base_mainnet());
        let sig = signer.sign_hash_sync(&hash).unwrap();
        format!("0x{}", alloy::hex::encode(sig.as_bytes()))
    }

    fn sample_auth(from: Address) -> Eip3009Authorization {
        Eip3009Authorization {
            from,
            to: Address::repeat_byte(0x22),
            value: "150000".to_string(),
            valid_after: 0,
            valid_before: u64::MAX / 2,
            nonce: format!("0x{}", alloy::hex::encode(random_nonce())),
        }
    }

    #[test]
    fn sign_and_recover_roundtrip() {
        let signer = PrivateKeySigner::random();
        let auth = sample_auth(signer.address());
        let sig_hex = sign(&auth, &signer);

        let recovered =
            recover_signer(&auth, &sig_hex, &NetworkConfig::base_mainnet()).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn recovery_mismatches_for_tampered_value() {
        let signer = PrivateKeySigner::random();
        let mut auth = sample_auth(signer.address());
        let sig_hex = sign(&auth, &signer);

        auth.value = "999999".to_string();
        let recovered =
            recover_signer(&auth, &sig_hex, &NetworkConfig::base_mainnet()).unwrap();
        assert_ne!(recovered, signer.address());
    }

    #[test]
    fn different_domain_changes_hash() {
        let signer = PrivateKeySigner::random();
        let auth = sample_auth(signer.address());
        let sig_hex = sign(&auth, &signer);

        let recovered =
            recover_signer(&auth, &sig_hex, &NetworkConfig::base_sepolia()).unwrap();
        assert_ne!(recovered, signer.address());
    }

    #[test]
    fn rejects_short_signature() {
        let signer = PrivateKeySigner::random();
        let auth = sample_auth(signer.address());
        let err = recover_signer(&auth, "0xdeadbeef", &NetworkConfig::base_mainnet())
            .unwrap_err();
        assert_eq!(err.tag(), "signature_invalid");
    }

    #[test]
    fn random_nonces_are_unique() {
        assert_ne!(random_nonce(), random_nonce());
    }
}
