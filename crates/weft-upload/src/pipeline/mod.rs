//! The asynchronous fulfillment pipeline.
//!
//! Jobs flow `newDataItem → plan → prepare → post → verify`, with side
//! jobs (`opticalPost`, `putOffsets`, `cleanupFs`, `unbundleBdi`,
//! `oversizedItem`, `finalizePayment`) hanging off the main spine.
//! Every handler is idempotent: the queue delivers at least once, and a
//! crashed worker's lease returns its job to the pool.

pub mod cleanup;
pub mod finalize_payment;
pub mod new_item;
pub mod offsets;
pub mod optical;
pub mod oversized;
pub mod plan;
pub mod post;
pub mod prepare;
pub mod runner;
pub mod unbundle;
pub mod verify;

#[cfg(test)]
pub(crate) mod testsupport;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use weft::payment_client::PaymentApi;

use crate::bundle::BundleSigner;
use crate::config::UploadConfig;
use crate::db::UploadDb;
use crate::error::UploadError;
use crate::gateway::StorageNetwork;
use crate::optical::OpticalBridge;
use crate::store::{CacheStore, JobQueue, ObjectStore};

/// Everything a worker needs; one instance shared by the whole process.
pub struct PipelineCtx {
    pub cfg: UploadConfig,
    pub db: Arc<UploadDb>,
    pub objects: Arc<dyn ObjectStore>,
    pub cache: Arc<dyn CacheStore>,
    pub queue: Arc<JobQueue>,
    pub payment: Arc<dyn PaymentApi>,
    pub network: Arc<dyn StorageNetwork>,
    pub optical: Arc<OpticalBridge>,
    pub signer: Arc<BundleSigner>,
}

impl PipelineCtx {
    /// Local scratch file for an item, when a scratch dir is configured.
    pub fn scratch_path(&self, item_id: &str) -> Option<PathBuf> {
        self.cfg
            .scratch_dir
            .as_ref()
            .map(|dir| PathBuf::from(dir).join(item_id))
    }

    /// Cache key of an item's hot bytes.
    pub fn item_cache_key(item_id: &str) -> String {
        format!("item:{item_id}")
    }
}

// --- job payloads ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemJob {
    pub item_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleJob {
    pub bundle_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyJob {
    pub bundle_id: String,
    /// Poll round, drives the re-enqueue backoff.
    #[serde(default)]
    pub poll: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettleAction {
    /// Item reached `Permanent`: consume the hold, finalize x402.
    Consume,
    /// Item failed: release the hold; the x402 row is left untouched.
    Refund,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeJob {
    pub item_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    pub byte_count: u64,
    pub action: SettleAction,
}

pub fn parse_payload<T: DeserializeOwned>(payload: &serde_json::Value) -> Result<T, UploadError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| UploadError::internal(format!("malformed job payload: {e}")))
}

pub fn item_job(item_id: &str) -> serde_json::Value {
    serde_json::json!({ "itemId": item_id })
}

pub fn bundle_job(bundle_id: &str) -> serde_json::Value {
    serde_json::json!({ "bundleId": bundle_id })
}
