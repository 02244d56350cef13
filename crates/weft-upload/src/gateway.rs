//! Storage network client.
//!
//! The network accepts chunked, resumable uploads keyed by the bundle
//! transaction id, and reports inclusion depth for confirmation. Only
//! the interface is owned here; the network itself is an external
//! collaborator.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;
use weft::WeftError;

#[async_trait]
pub trait StorageNetwork: Send + Sync {
    /// How many bytes of this transaction the network has acknowledged.
    /// Zero for an unknown transaction.
    async fn uploaded_offset(&self, tx_id: &str) -> Result<u64, WeftError>;

    /// Upload one chunk at the given byte offset.
    async fn upload_chunk(&self, tx_id: &str, offset: u64, chunk: Bytes) -> Result<(), WeftError>;

    /// Submit the transaction envelope once every chunk is uploaded.
    async fn submit(
        &self,
        tx_id: &str,
        total_bytes: u64,
        signature_hex: &str,
    ) -> Result<(), WeftError>;

    /// Confirmation depth of the transaction; zero when unseen.
    async fn confirmations(&self, tx_id: &str) -> Result<u64, WeftError>;
}

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

pub struct HttpStorageNetwork {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct OffsetResponse {
    offset: u64,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(default)]
    confirmations: u64,
}

impl HttpStorageNetwork {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl StorageNetwork for HttpStorageNetwork {
    async fn uploaded_offset(&self, tx_id: &str) -> Result<u64, WeftError> {
        let resp = self
            .client
            .get(self.url(&format!("/chunk/{tx_id}/offset")))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| WeftError::from_transport("storage network", &e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        if !resp.status().is_success() {
            return Err(WeftError::Unavailable(format!(
                "storage network returned {}",
                resp.status()
            )));
        }
        let body: OffsetResponse = resp
            .json()
            .await
            .map_err(|e| WeftError::Internal(format!("unparseable offset response: {e}")))?;
        Ok(body.offset)
    }

    async fn upload_chunk(&self, tx_id: &str, offset: u64, chunk: Bytes) -> Result<(), WeftError> {
        let resp = self
            .client
            .post(self.url(&format!("/chunk/{tx_id}/{offset}")))
            .timeout(self.timeout)
            .header("Content-Type", "application/octet-stream")
            .body(chunk)
            .send()
            .await
            .map_err(|e| WeftError::from_transport("storage network", &e))?;
        if !resp.status().is_success() {
            return Err(WeftError::Unavailable(format!(
                "chunk upload rejected with {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn submit(
        &self,
        tx_id: &str,
        total_bytes: u64,
        signature_hex: &str,
    ) -> Result<(), WeftError> {
        let resp = self
            .client
            .post(self.url("/tx"))
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "id": tx_id,
                "byteCount": total_bytes,
                "signature": signature_hex,
            }))
            .send()
            .await
            .map_err(|e| WeftError::from_transport("storage network", &e))?;
        if !resp.status().is_success() {
            return Err(WeftError::Unavailable(format!(
                "transaction submit rejected with {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn confirmations(&self, tx_id: &str) -> Result<u64, WeftError> {
        let resp = self
            .client
            .get(self.url(&format!("/tx/{tx_id}/status")))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| WeftError::from_transport("storage network", &e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        if !resp.status().is_success() {
            return Err(WeftError::Unavailable(format!(
                "status query returned {}",
                resp.status()
            )));
        }
        let body: StatusResponse = resp
            .json()
            .await
            .map_err(|e| WeftError::Internal(format!("unparseable status response: {e}")))?;
        Ok(body.confirmations)
    }
}
