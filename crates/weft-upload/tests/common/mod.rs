//! Shared fixtures for the integration suites: an in-process payment
//! ledger stub and a controllable storage network.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use weft::payment_client::PaymentApi;
use weft::private_api::*;
use weft::WeftError;

use weft_upload::bundle::BundleSigner;
use weft_upload::config::UploadConfig;
use weft_upload::db::UploadDb;
use weft_upload::gateway::StorageNetwork;
use weft_upload::optical::OpticalBridge;
use weft_upload::pipeline::PipelineCtx;
use weft_upload::store::{queue::QueueConfig, FsObjectStore, JobQueue, MemCacheStore};

/// Minimal in-memory ledger: funded unless told otherwise, records
/// every consume/refund/finalize.
#[derive(Default)]
pub struct LedgerStub {
    pub reserve_count: AtomicU64,
    pub consumed: Mutex<Vec<String>>,
    pub refunded: Mutex<Vec<String>>,
    pub finalized: Mutex<Vec<X402FinalizeRequest>>,
    pub unfunded: AtomicU64,
}

impl LedgerStub {
    pub fn set_unfunded(&self, unfunded: bool) {
        self.unfunded.store(unfunded as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentApi for LedgerStub {
    async fn reserve(&self, req: ReserveRequest) -> Result<ReserveResponse, WeftError> {
        if self.unfunded.load(Ordering::SeqCst) != 0 {
            return Err(WeftError::InsufficientCredit {
                required: req.byte_count * 10,
                available: 0,
            });
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
        Err(WeftError::SettlementFailed(
            "stub has no facilitator".to_string(),
        ))
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

/// Storage network that confirms after a settable depth.
#[derive(Default)]
pub struct NetworkStub {
    pub chunks: DashMap<String, Vec<(u64, Bytes)>>,
    pub submitted: DashMap<String, u64>,
    pub confirmations: AtomicU64,
}

#[async_trait]
impl StorageNetwork for NetworkStub {
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

    async fn submit(&self, tx_id: &str, total: u64, _sig: &str) -> Result<(), WeftError> {
        self.submitted.insert(tx_id.to_string(), total);
        Ok(())
    }

    async fn confirmations(&self, tx_id: &str) -> Result<u64, WeftError> {
        if self.submitted.contains_key(tx_id) {
            Ok(self.confirmations.load(Ordering::SeqCst))
        } else {
            Ok(0)
        }
    }
}

pub struct Harness {
    pub ctx: Arc<PipelineCtx>,
    pub ledger: Arc<LedgerStub>,
    pub network: Arc<NetworkStub>,
    _dir: tempfile::TempDir,
}

pub fn harness(mutate: impl FnOnce(&mut UploadConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = UploadConfig::local_defaults(&dir.path().display().to_string());
    mutate(&mut cfg);
    let ledger = Arc::new(LedgerStub::default());
    let network = Arc::new(NetworkStub::default());
    let ctx = Arc::new(PipelineCtx {
        cfg,
        db: Arc::new(UploadDb::open(":memory:").unwrap()),
        objects: Arc::new(FsObjectStore::new(dir.path())),
        cache: Arc::new(MemCacheStore::new()),
        queue: Arc::new(JobQueue::open(":memory:", QueueConfig::default()).unwrap()),
        payment: ledger.clone(),
        network: network.clone(),
        optical: Arc::new(OpticalBridge::new(vec![], None)),
        signer: Arc::new(BundleSigner::random()),
    });
    Harness {
        ctx,
        ledger,
        network,
        _dir: dir,
    }
}

/// Drain one queue label by running its handler until empty.
pub async fn drain(ctx: &PipelineCtx, label: weft_upload::store::queue::JobLabel) {
    use weft_upload::pipeline as p;
    use weft_upload::store::queue::JobLabel;
    while let Some(job) = ctx.queue.lease(label, 60).unwrap() {
        let result = match label {
            JobLabel::NewDataItem => p::new_item::handle(ctx, &job.payload).await,
            JobLabel::Plan => p::plan::handle(ctx).await,
            JobLabel::Prepare => p::prepare::handle(ctx, &job.payload).await,
            JobLabel::Post => p::post::handle(ctx, &job.payload).await,
            JobLabel::Verify => p::verify::handle(ctx, &job.payload).await,
            JobLabel::OversizedItem => p::oversized::handle(ctx, &job.payload).await,
            JobLabel::Unbundle => p::unbundle::handle(ctx, &job.payload).await,
            JobLabel::OpticalPost => p::optical::handle(ctx, &job.payload).await,
            JobLabel::PutOffsets => p::offsets::handle(ctx, &job.payload).await,
            JobLabel::CleanupFs => p::cleanup::handle(ctx, &job.payload).await,
            JobLabel::FinalizePayment => p::finalize_payment::handle(ctx, &job.payload).await,
        };
        result.unwrap();
        ctx.queue.ack(job.id).unwrap();
    }
}
