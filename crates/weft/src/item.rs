//! Content addressing for data items.
//!
//! An [`ItemId`] is the 43-character base64url (unpadded) encoding of a
//! 32-byte SHA-256 digest. It is the item's identity across every
//! lifecycle table and on the storage network.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::WeftError;

/// Encoded length of a 32-byte digest in unpadded base64url.
pub const ITEM_ID_LEN: usize = 43;

/// Content-addressed identifier of a data item or bundle transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

impl ItemId {
    /// Derive the id from a raw 32-byte digest.
    pub fn from_digest(digest: [u8; 32]) -> Self {
        ItemId(URL_SAFE_NO_PAD.encode(digest))
    }

    /// Hash arbitrary bytes and derive the id from the digest.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let digest: [u8; 32] = Sha256::digest(bytes).into();
        Self::from_digest(digest)
    }

    /// Parse and validate a client-supplied id.
    pub fn parse(s: &str) -> Result<Self, WeftError> {
        if s.len() != ITEM_ID_LEN {
            return Err(WeftError::BadRequest(format!(
                "item id must be {ITEM_ID_LEN} characters, got {}",
                s.len()
            )));
        }
        let decoded = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| WeftError::BadRequest("item id is not valid base64url".to_string()))?;
        if decoded.len() != 32 {
            return Err(WeftError::BadRequest(
                "item id does not decode to 32 bytes".to_string(),
            ));
        }
        Ok(ItemId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The raw 32-byte digest behind this id.
    pub fn digest(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        // Validated at construction; decode cannot fail.
        let decoded = URL_SAFE_NO_PAD.decode(&self.0).unwrap_or_default();
        out.copy_from_slice(&decoded);
        out
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ItemId {
    type Error = WeftError;
    fn try_from(s: String) -> Result<Self, WeftError> {
        ItemId::parse(&s)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> String {
        id.0
    }
}

/// Incremental SHA-256 hasher used while a payload streams through ingest.
#[derive(Default)]
pub struct ItemDigest {
    hasher: Sha256,
    bytes_seen: u64,
}

impl ItemDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes_seen += chunk.len() as u64;
    }

    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    pub fn finish(self) -> ItemId {
        let digest: [u8; 32] = self.hasher.finalize().into();
        ItemId::from_digest(digest)
    }
}

/// The six supported signature/chain families for item owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureKind {
    Arweave,
    Ethereum,
    Solana,
    Polygon,
    Base,
    Kyve,
}

impl SignatureKind {
    /// Single-letter code used in addresses and wire paths.
    pub fn code(&self) -> &'static str {
        match self {
            SignatureKind::Arweave => "A",
            SignatureKind::Ethereum => "E",
            SignatureKind::Solana => "S",
            SignatureKind::Polygon => "P",
            SignatureKind::Base => "B",
            SignatureKind::Kyve => "K",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureKind::Arweave => "arweave",
            SignatureKind::Ethereum => "ethereum",
            SignatureKind::Solana => "solana",
            SignatureKind::Polygon => "polygon",
            SignatureKind::Base => "base",
            SignatureKind::Kyve => "kyve",
        }
    }

    /// Accepts both the long name and the single-letter code.
    pub fn parse(s: &str) -> Result<Self, WeftError> {
        match s.to_ascii_lowercase().as_str() {
            "arweave" | "a" => Ok(SignatureKind::Arweave),
            "ethereum" | "e" => Ok(SignatureKind::Ethereum),
            "solana" | "s" => Ok(SignatureKind::Solana),
            "polygon" | "p" => Ok(SignatureKind::Polygon),
            "base" | "b" => Ok(SignatureKind::Base),
            "kyve" | "k" => Ok(SignatureKind::Kyve),
            other => Err(WeftError::BadRequest(format!(
                "unsupported signature kind: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for SignatureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
