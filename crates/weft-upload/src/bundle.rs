//! Bundle framing and envelope signing.
//!
//! Layout: a 4-byte little-endian item count, then one 40-byte entry
//! per item (32-byte raw item id + 8-byte little-endian length), then
//! the concatenated item payloads in entry order. Offsets are therefore
//! fully determined by the header, and assembly can stream payloads
//! without buffering the bundle.

use alloy::primitives::B256;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use sha2::{Digest, Sha256};
use weft::{ItemId, WeftError};

const COUNT_LEN: usize = 4;
const ENTRY_LEN: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub item_id: ItemId,
    pub length: u64,
}

/// The header of a bundle: the ordered set of member ids and lengths.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BundleManifest {
    pub entries: Vec<ManifestEntry>,
}

impl BundleManifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    pub fn header_len(&self) -> u64 {
        (COUNT_LEN + ENTRY_LEN * self.entries.len()) as u64
    }

    pub fn payload_len(&self) -> u64 {
        self.entries.iter().map(|e| e.length).sum()
    }

    pub fn total_len(&self) -> u64 {
        self.header_len() + self.payload_len()
    }

    /// Serialize the header bytes.
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(COUNT_LEN + ENTRY_LEN * self.entries.len());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.item_id.digest());
            out.extend_from_slice(&entry.length.to_le_bytes());
        }
        out
    }

    /// `(item_id, offset, length)` for every member, in bundle order.
    pub fn offsets(&self) -> Vec<(ItemId, u64, u64)> {
        let mut offset = self.header_len();
        self.entries
            .iter()
            .map(|e| {
                let this = (e.item_id.clone(), offset, e.length);
                offset += e.length;
                this
            })
            .collect()
    }

    /// Parse a header from the front of a container payload. Returns
    /// `None` when the bytes are not plausibly a bundle of `total_len`
    /// bytes — used to detect nested-bundle containers.
    pub fn parse(header: &[u8], total_len: u64) -> Option<BundleManifest> {
        if header.len() < COUNT_LEN {
            return None;
        }
        let count = u32::from_le_bytes(header[..COUNT_LEN].try_into().ok()?) as usize;
        if count == 0 {
            return None;
        }
        let need = COUNT_LEN + ENTRY_LEN * count;
        if header.len() < need {
            return None;
        }
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = COUNT_LEN + ENTRY_LEN * i;
            let digest: [u8; 32] = header[at..at + 32].try_into().ok()?;
            let length = u64::from_le_bytes(header[at + 32..at + 40].try_into().ok()?);
            if length == 0 {
                return None;
            }
            entries.push(ManifestEntry {
                item_id: ItemId::from_digest(digest),
                length,
            });
        }
        let manifest = BundleManifest { entries };
        if manifest.total_len() != total_len {
            return None;
        }
        Some(manifest)
    }
}

/// Signs bundle envelopes with the service key. The bundle transaction
/// id is content-addressed from the signature, matching how items are
/// addressed on the storage network.
pub struct BundleSigner {
    signer: PrivateKeySigner,
}

#[derive(Debug, Clone)]
pub struct SignedEnvelope {
    pub tx_id: ItemId,
    pub signature_hex: String,
}

impl BundleSigner {
    pub fn from_hex_key(key: &str) -> Result<Self, WeftError> {
        let signer: PrivateKeySigner = key
            .parse()
            .map_err(|_| WeftError::BadRequest("invalid service key".to_string()))?;
        Ok(Self { signer })
    }

    pub fn random() -> Self {
        Self {
            signer: PrivateKeySigner::random(),
        }
    }

    /// Sign the payload digest of an assembled bundle.
    pub fn sign(&self, payload_digest: [u8; 32]) -> Result<SignedEnvelope, WeftError> {
        let sig = self
            .signer
            .sign_hash_sync(&B256::from(payload_digest))
            .map_err(|e| WeftError::Internal(format!("bundle signing failed: {e}")))?;
        let sig_bytes = sig.as_bytes();
        let tx_digest: [u8; 32] = Sha256::digest(sig_bytes).into();
        Ok(SignedEnvelope {
            tx_id: ItemId::from_digest(tx_digest),
            signature_hex: format!("0x{}", alloy::hex::encode(sig_bytes)),
        })
    }
}
