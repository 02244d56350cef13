//! Shared fixtures for pipeline unit tests: a recording payment stub, a
//! controllable in-memory storage network, and a ready-made context.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use weft::payment_client::PaymentApi;
use weft::private_api::*;
use weft::WeftError;

use crate::bundle::BundleSigner;
use crate::config::UploadConfig;
use crate::db::UploadDb;
use crate::gateway::StorageNetwork;
use crate::optical::OpticalBridge;
use crate::pipeline::PipelineCtx;
use crate::store::{queue::QueueConfig, FsObjectStore, JobQueue, MemCacheStore};

/// Records ledger calls; reserve/settle succeed with canned values.
#[derive(Default)]
pub struct RecordingPayment {
    pub consumed: Mutex<Vec<String>>,
    pub refunded: Mutex<Vec<String>>,
    pub finalized: Mutex<Vec<X402FinalizeRequest>>,
    pub reserve_count: AtomicU64,
    /// When set, reserve calls fail with this tag.
    pub reserve_rejects: Mutex<Option<WeftError>>,
}

#[async_trait]
impl PaymentApi for RecordingPayment {
    async fn reserve(&self, req: ReserveRequest) -> Result<ReserveResponse, WeftError> {
        if let Some(err) = self.reserve_rejects.lock().unwrap().take() {
            return Err(err);
        }
        let n = self.reserve_count.fetch_add(1, Ordering::SeqCst);
        Ok(ReserveResponse {
            reservation_id: format!("res-{n}"),
            credits_reserved: req.byte_count * 10,
        })
    }

    async fn consume(&self, reservation_id: &str) -> Result<ConsumeResponse, WeftError> {
        self.consumed.lock().unwrap().push(reservation_id.to_string());
        Ok(ConsumeResponse {
            credits_charged: 1,
            buffer_released: 0,
        })
    }

    async fn refund(&self, reservation_id: &str) -> Result<StatusResponse, WeftError> {
        self.refunded.lock().unwrap().push(reservation_id.to_string());
        Ok(StatusResponse {
            status: "refunded".to_string(),
        })
    }

    async fn adjust(&self, _req: AdjustRequest) -> Result<AdjustResponse, WeftError> {
        Ok(AdjustResponse {
            resulting_balance: 0,
        })
    }

    async fn quote(&self, byte_count: u64) -> Result<QuoteResponse, WeftError> {
        Ok(QuoteResponse {
            credits: byte_count * 10,
            accepts: vec![],
        })
    }

    async fn x402_settle(&self, _req: X402SettleRequest) -> Result<X402SettleResponse, WeftError> {
        Err(WeftError::SettlementFailed("stub has no facilitator".into()))
    }

    async fn x402_finalize(
        &self,
        req: X402FinalizeRequest,
    ) -> Result<X402FinalizeResponse, WeftError> {
        let actual = req.actual_byte_count;
        self.finalized.lock().unwrap().push(req);
        Ok(X402FinalizeResponse {
            status: "confirmed".to_string(),
            actual_byte_count: actual,
            refund_credits: 0,
            fraud_type: None,
            action_taken: None,
        })
    }
}

/// In-memory storage network with a settable confirmation depth.
#[derive(Default)]
pub struct StubNetwork {
    pub chunks: DashMap<String, Vec<(u64, Bytes)>>,
    pub submitted: DashMap<String, u64>,
    pub confirmation_depth: AtomicU64,
}

impl StubNetwork {
    pub fn set_confirmations(&self, depth: u64) {
        self.confirmation_depth.store(depth, Ordering::SeqCst);
    }

    pub fn received_bytes(&self, tx_id: &str) -> u64 {
        self.chunks
            .get(tx_id)
            .map(|c| c.iter().map(|(_, b)| b.len() as u64).sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl StorageNetwork for StubNetwork {
    async fn uploaded_offset(&self, tx_id: &str) -> Result<u64, WeftError> {
        Ok(self
            .chunks
            .get(tx_id)
            .and_then(|c| c.iter().map(|(o, b)| o + b.len() as u64).max())
            .unwrap_or(0))
    }

    async fn upload_chunk(&self, tx_id: &str, offset: u64, chunk: Bytes) -> Result<(), WeftError> {
        self.chunks
            .entry(tx_id.to_string())
            .or_default()
            .push((offset, chunk));
        Ok(())
    }

    async fn submit(&self, tx_id: &str, total_bytes: u64, _sig: &str) -> Result<(), WeftError> {
        self.submitted.insert(tx_id.to_string(), total_bytes);
        Ok(())
    }

    async fn confirmations(&self, tx_id: &str) -> Result<u64, WeftError> {
        if self.submitted.contains_key(tx_id) {
            Ok(self.confirmation_depth.load(Ordering::SeqCst))
        } else {
            Ok(0)
        }
    }
}

pub struct TestCtx {
    pub ctx: Arc<PipelineCtx>,
    pub payment: Arc<RecordingPayment>,
    pub network: Arc<StubNetwork>,
    _dir: tempfile::TempDir,
}

pub fn test_ctx_with(mutate: impl FnOnce(&mut UploadConfig)) -> TestCtx {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = UploadConfig::local_defaults(&dir.path().display().to_string());
    mutate(&mut cfg);
    let payment = Arc::new(RecordingPayment::default());
    let network = Arc::new(StubNetwork::default());
    let ctx = Arc::new(PipelineCtx {
        cfg,
        db: Arc::new(UploadDb::open(":memory:").unwrap()),
        objects: Arc::new(FsObjectStore::new(dir.path())),
        cache: Arc::new(MemCacheStore::new()),
        queue: Arc::new(JobQueue::open(":memory:", QueueConfig::default()).unwrap()),
        payment: payment.clone(),
        network: network.clone(),
        optical: Arc::new(OpticalBridge::new(vec![], None)),
        signer: Arc::new(BundleSigner::random()),
    });
    TestCtx {
        ctx,
        payment,
        network,
        _dir: dir,
    }
}

pub fn test_ctx() -> TestCtx {
    test_ctx_with(|_| {})
}
