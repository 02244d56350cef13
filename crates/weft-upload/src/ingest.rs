//! Streaming ingest.
//!
//! One producer reads the client stream and feeds up to three sinks
//! over bounded channels — the raw bucket (authoritative), the cache
//! (small items), and a local scratch file — so the slowest sink paces
//! the client. The canonical content address is resolved when the
//! stream completes; the in-flight lock and the `new_item` UNIQUE
//! constraint together give exactly-once acceptance.
//!
//! Failure discipline: the [`IngestGuard`] is armed before any side
//! effect and disarmed after the last one. Any early return — client
//! abort, duplicate, payment rejection — releases the lock, deletes
//! partial objects, and refunds the reservation.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use weft::item::ItemDigest;
use weft::payment_client::PaymentApi;
use weft::private_api::{ReserveRequest, X402FinalizeRequest, X402SettleRequest};
use weft::x402::{PaymentHeader, PaymentMode, PaymentRequiredBody, X402_VERSION};
use weft::{ItemId, SignatureKind, WeftError};

use crate::db::ItemRow;
use crate::error::UploadError;
use crate::pipeline::{item_job, PipelineCtx};
use crate::store::object::item_key;
use crate::store::queue::JobLabel;
use crate::store::{Bucket, CacheStore, ObjectStore, ObjectWriter};

const FANOUT_CHANNEL_DEPTH: usize = 16;

/// Parsed ingest metadata, extracted from headers by the route layer.
#[derive(Debug, Clone)]
pub struct IngestMeta {
    pub content_length: u64,
    pub owner: String,
    pub kind: SignatureKind,
    pub declared_id: Option<ItemId>,
    /// Raw base64 `X-PAYMENT` header, if the client attached one.
    pub payment_header: Option<String>,
    pub payment_mode: PaymentMode,
    pub is_container: bool,
}

/// The provisional receipt returned on acceptance.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub id: String,
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    pub receipt: Receipt,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub reserved_credits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    pub uploaded_at: i64,
    /// Acceptance is provisional until the bundle is verified.
    pub provisional: bool,
}

/// Cleans up after an aborted ingest. Armed before the first side
/// effect; `disarm` after the item row is committed.
struct IngestGuard {
    cache: Arc<dyn CacheStore>,
    objects: Arc<dyn ObjectStore>,
    payment: Arc<dyn PaymentApi>,
    lock_key: String,
    lock_owner: String,
    staging_key: Option<String>,
    scratch_path: Option<PathBuf>,
    reservation_id: Option<String>,
    armed: bool,
}

impl IngestGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for IngestGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cache.unlock(&self.lock_key, &self.lock_owner);

        let objects = Arc::clone(&self.objects);
        let payment = Arc::clone(&self.payment);
        let staging_key = self.staging_key.take();
        let scratch_path = self.scratch_path.take();
        let reservation_id = self.reservation_id.take();
        tokio::spawn(async move {
            if let Some(key) = staging_key {
                if let Err(e) = objects.delete(Bucket::Raw, &key).await {
                    tracing::warn!(key = %key, error = %e, "could not delete partial object");
                }
            }
            if let Some(path) = scratch_path {
                let _ = tokio::fs::remove_file(&path).await;
            }
            if let Some(reservation_id) = reservation_id {
                match payment.refund(&reservation_id).await {
                    Ok(_) => {
                        tracing::info!(reservation = %reservation_id, "aborted ingest refunded")
                    }
                    Err(e) => tracing::error!(
                        reservation = %reservation_id,
                        error = %e,
                        "could not refund aborted ingest"
                    ),
                }
            }
        });
    }
}

/// Funds secured for one upload.
struct Funding {
    reservation_id: Option<String>,
    payment_id: Option<String>,
    reserved_credits: u64,
    payer: Option<String>,
}

async fn secure_funding(
    ctx: &PipelineCtx,
    meta: &IngestMeta,
    tentative_id: &ItemId,
) -> Result<Funding, UploadError> {
    let reserve_req = ReserveRequest {
        address: meta.owner.clone(),
        address_kind: meta.kind,
        byte_count: meta.content_length,
        item_id: Some(tentative_id.as_str().to_string()),
    };

    match ctx.payment.reserve(reserve_req.clone()).await {
        Ok(resp) => Ok(Funding {
            reservation_id: Some(resp.reservation_id),
            payment_id: None,
            reserved_credits: resp.credits_reserved,
            payer: None,
        }),
        Err(WeftError::InsufficientCredit { .. }) => {
            let Some(header) = &meta.payment_header else {
                // Emit the 402 quote so the client can sign and retry.
                let quote = ctx.payment.quote(meta.content_length).await?;
                let body = PaymentRequiredBody {
                    x402_version: X402_VERSION,
                    accepts: quote.accepts,
                    description: Some(format!(
                        "payment required for {} bytes",
                        meta.content_length
                    )),
                };
                let body = serde_json::to_string(&body)
                    .map_err(|e| UploadError::internal(e.to_string()))?;
                return Err(UploadError::Core(WeftError::PaymentRequired(Some(body))));
            };

            // Sign-and-pay: settle the attached authorization, which
            // funds (and for payg/hybrid also reserves) this upload.
            let payer = PaymentHeader::decode(header)
                .ok()
                .map(|h| format!("{:#x}", h.payload.authorization.from));
            let settle = ctx
                .payment
                .x402_settle(X402SettleRequest {
                    payment_header: header.clone(),
                    address: meta.owner.clone(),
                    address_kind: meta.kind,
                    byte_count: meta.content_length,
                    item_id: Some(tentative_id.as_str().to_string()),
                    mode: meta.payment_mode,
                })
                .await?;

            if let Some(reservation_id) = settle.reservation_id.clone() {
                Ok(Funding {
                    reservation_id: Some(reservation_id),
                    payment_id: Some(settle.payment_id),
                    reserved_credits: settle.credits_reserved,
                    payer,
                })
            } else {
                // Topup mode credited the balance; reserve normally now.
                let resp = ctx.payment.reserve(reserve_req).await?;
                Ok(Funding {
                    reservation_id: Some(resp.reservation_id),
                    payment_id: Some(settle.payment_id),
                    reserved_credits: resp.credits_reserved,
                    payer,
                })
            }
        }
        Err(e) => Err(e.into()),
    }
}

enum FanoutEnd {
    Complete {
        canonical_id: ItemId,
        actual_bytes: u64,
        cache_bytes: Option<Bytes>,
        scratch_path: Option<PathBuf>,
    },
    /// The client streamed past the declared length beyond tolerance.
    Overflow { actual_bytes: u64 },
}

/// Drive the stream through the sink fan-out. The raw sink is
/// authoritative — its failure fails the ingest; cache and scratch
/// degrade to logging.
async fn stream_fanout(
    ctx: &PipelineCtx,
    meta: &IngestMeta,
    staging_key: &str,
    scratch_path: Option<PathBuf>,
    first_chunk: Bytes,
    mut rest: impl Stream<Item = Result<Bytes, WeftError>> + Unpin,
) -> Result<FanoutEnd, UploadError> {
    let tolerance = (meta.content_length as f64 * ctx.cfg.fraud_tolerance_pct / 100.0) as u64;
    let limit = meta.content_length + tolerance;
    let want_cache = meta.content_length <= ctx.cfg.cache_max_item_bytes;

    let writer = ctx.objects.open_writer(Bucket::Raw, staging_key).await?;
    let (raw_tx, mut raw_rx) = mpsc::channel::<Bytes>(FANOUT_CHANNEL_DEPTH);
    let raw_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(chunk) = raw_rx.recv().await {
            writer.write_chunk(chunk).await?;
        }
        writer.finish().await
    });

    let (cache_tx, cache_task) = if want_cache {
        let (tx, mut rx) = mpsc::channel::<Bytes>(FANOUT_CHANNEL_DEPTH);
        let capacity = meta.content_length as usize;
        let task = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(capacity);
            while let Some(chunk) = rx.recv().await {
                buf.extend_from_slice(&chunk);
            }
            buf.freeze()
        });
        (Some(tx), Some(task))
    } else {
        (None, None)
    };

    let (scratch_tx, scratch_task) = match &scratch_path {
        Some(path) => {
            let path = path.clone();
            let (tx, mut rx) = mpsc::channel::<Bytes>(FANOUT_CHANNEL_DEPTH);
            let task = tokio::spawn(async move {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.ok();
                }
                let mut file = match tokio::fs::File::create(&path).await {
                    Ok(file) => file,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "scratch disabled");
                        while rx.recv().await.is_some() {}
                        return None;
                    }
                };
                while let Some(chunk) = rx.recv().await {
                    if file.write_all(&chunk).await.is_err() {
                        while rx.recv().await.is_some() {}
                        let _ = tokio::fs::remove_file(&path).await;
                        return None;
                    }
                }
                if file.flush().await.is_err() {
                    let _ = tokio::fs::remove_file(&path).await;
                    return None;
                }
                Some(path)
            });
            (Some(tx), Some(task))
        }
        None => (None, None),
    };

    let mut digest = ItemDigest::new();
    let mut overflow = false;
    let mut producer_err: Option<WeftError> = None;
    let mut chunk = Some(first_chunk);
    loop {
        let Some(bytes) = chunk.take() else { break };
        if digest.bytes_seen() + bytes.len() as u64 > limit {
            overflow = true;
            break;
        }
        digest.update(&bytes);
        if raw_tx.send(bytes.clone()).await.is_err() {
            producer_err = Some(WeftError::Internal("raw sink closed early".to_string()));
            break;
        }
        if let Some(tx) = &cache_tx {
            let _ = tx.send(bytes.clone()).await;
        }
        if let Some(tx) = &scratch_tx {
            let _ = tx.send(bytes).await;
        }

        chunk = match rest.next().await {
            None => None,
            Some(Ok(bytes)) => Some(bytes),
            Some(Err(e)) => {
                producer_err = Some(e);
                break;
            }
        };
    }

    // Close the sinks and collect them before deciding anything, so a
    // cleanup never races a sink still writing.
    drop(raw_tx);
    drop(cache_tx);
    drop(scratch_tx);
    let raw_result = raw_task
        .await
        .map_err(|e| UploadError::internal(format!("raw sink panicked: {e}")))?;
    let cache_bytes = match cache_task {
        Some(task) => task.await.ok(),
        None => None,
    };
    let scratch_written = match scratch_task {
        Some(task) => task.await.ok().flatten(),
        None => None,
    };

    if let Some(e) = producer_err {
        return Err(e.into());
    }
    if overflow {
        return Ok(FanoutEnd::Overflow {
            actual_bytes: digest.bytes_seen(),
        });
    }
    let written = raw_result?;
    let actual_bytes = digest.bytes_seen();
    if written != actual_bytes {
        return Err(UploadError::internal(format!(
            "raw sink wrote {written} of {actual_bytes} bytes"
        )));
    }
    if actual_bytes == 0 {
        return Err(UploadError::Core(WeftError::BadRequest(
            "zero-byte items are not accepted".to_string(),
        )));
    }
    if actual_bytes < meta.content_length {
        return Err(UploadError::Core(WeftError::BadRequest(format!(
            "stream ended at {actual_bytes} of {} declared bytes",
            meta.content_length
        ))));
    }

    Ok(FanoutEnd::Complete {
        canonical_id: digest.finish(),
        actual_bytes,
        cache_bytes,
        scratch_path: scratch_written,
    })
}

/// Accept one streamed item. This is the whole §ingest path: guards,
/// funding, fan-out, canonicalization, persistence, enqueue.
pub async fn ingest_stream(
    ctx: &PipelineCtx,
    meta: IngestMeta,
    mut stream: impl Stream<Item = Result<Bytes, WeftError>> + Unpin,
) -> Result<IngestOutcome, UploadError> {
    if meta.content_length == 0 {
        return Err(UploadError::bad_request("content length must be positive"));
    }
    if meta.content_length > ctx.cfg.max_item_bytes {
        return Err(UploadError::Core(WeftError::TooLarge {
            limit: ctx.cfg.max_item_bytes,
            actual: meta.content_length,
        }));
    }

    // Early duplicate guard on the declared id. Tolerant of false
    // negatives; the UNIQUE insert below is the race-free authority.
    if let Some(declared) = &meta.declared_id {
        if ctx.db.item_state(declared.as_str())?.is_some() {
            return Err(UploadError::Core(WeftError::Duplicate(
                declared.as_str().to_string(),
            )));
        }
    }

    // First chunk feeds the tentative fingerprint when no id was
    // declared; the canonical id is still resolved from the full body.
    let first_chunk = match stream.next().await {
        Some(Ok(bytes)) => bytes,
        Some(Err(e)) => return Err(e.into()),
        None => return Err(UploadError::bad_request("empty request body")),
    };
    let tentative_id = meta.declared_id.clone().unwrap_or_else(|| {
        let mut seed = meta.owner.clone().into_bytes();
        seed.extend_from_slice(&first_chunk);
        ItemId::from_bytes(&seed)
    });

    let lock_key = format!("inflight:{tentative_id}");
    let lock_owner = Uuid::new_v4().to_string();
    let ttl = ctx.cfg.in_flight_ttl_for(meta.content_length);
    if !ctx.cache.try_lock(&lock_key, &lock_owner, ttl) {
        return Err(UploadError::Core(WeftError::InProgress(
            tentative_id.as_str().to_string(),
        )));
    }

    let mut guard = IngestGuard {
        cache: Arc::clone(&ctx.cache),
        objects: Arc::clone(&ctx.objects),
        payment: Arc::clone(&ctx.payment),
        lock_key: lock_key.clone(),
        lock_owner: lock_owner.clone(),
        staging_key: None,
        scratch_path: None,
        reservation_id: None,
        armed: true,
    };

    let funding = secure_funding(ctx, &meta, &tentative_id).await?;
    guard.reservation_id = funding.reservation_id.clone();

    let staging_key = format!("staging/{}", Uuid::new_v4());
    guard.staging_key = Some(staging_key.clone());
    let scratch_tmp = ctx.scratch_path(&format!("ingest-{}", Uuid::new_v4()));
    guard.scratch_path = scratch_tmp.clone();

    let fanout = stream_fanout(ctx, &meta, &staging_key, scratch_tmp, first_chunk, stream).await?;
    let (canonical_id, actual_bytes, cache_bytes, scratch_path) = match fanout {
        FanoutEnd::Complete {
            canonical_id,
            actual_bytes,
            cache_bytes,
            scratch_path,
        } => (canonical_id, actual_bytes, cache_bytes, scratch_path),
        FanoutEnd::Overflow { actual_bytes } => {
            tracing::warn!(
                owner = %meta.owner,
                declared = meta.content_length,
                actual = actual_bytes,
                "stream exceeded declared length beyond tolerance; quarantined"
            );
            // Declared-size fraud on a paid upload gets its verdict now.
            if let Some(payment_id) = &funding.payment_id {
                let payment = Arc::clone(&ctx.payment);
                let req = X402FinalizeRequest {
                    payment_id: Some(payment_id.clone()),
                    item_id: None,
                    actual_byte_count: actual_bytes,
                };
                tokio::spawn(async move {
                    if let Err(e) = payment.x402_finalize(req).await {
                        tracing::error!(error = %e, "fraud finalize failed");
                    }
                });
            }
            return Err(UploadError::bad_request(
                "stream exceeded the declared content length",
            ));
        }
    };

    if let Some(declared) = &meta.declared_id {
        if *declared != canonical_id {
            return Err(UploadError::Core(WeftError::ContentMismatch));
        }
    }
    if canonical_id != tentative_id && ctx.db.item_state(canonical_id.as_str())?.is_some() {
        return Err(UploadError::Core(WeftError::Duplicate(
            canonical_id.as_str().to_string(),
        )));
    }

    // Promote staging to the canonical key; from here cleanup must
    // target the final key instead.
    let final_key = item_key(&canonical_id);
    ctx.objects
        .rename(Bucket::Raw, &staging_key, &final_key)
        .await?;
    guard.staging_key = Some(final_key.clone());

    let cached = if let Some(bytes) = cache_bytes {
        ctx.cache.put(
            &PipelineCtx::item_cache_key(canonical_id.as_str()),
            bytes,
            std::time::Duration::from_secs(ctx.cfg.cache_item_ttl_secs),
        );
        true
    } else {
        false
    };

    // Scratch files are keyed by the canonical id for prepare to find.
    if let (Some(tmp), Some(dest)) = (scratch_path, ctx.scratch_path(canonical_id.as_str())) {
        if tokio::fs::rename(&tmp, &dest).await.is_ok() {
            guard.scratch_path = Some(dest);
        }
    }

    let uploaded_at = chrono::Utc::now().timestamp();
    let row = ItemRow {
        item_id: canonical_id.as_str().to_string(),
        owner_address: meta.owner.clone(),
        signature_kind: meta.kind.as_str().to_string(),
        byte_count: actual_bytes,
        uploaded_at,
        payment_id: funding.payment_id.clone(),
        reservation_id: funding.reservation_id.clone(),
        cached,
        is_container: meta.is_container,
    };
    if let Err(e) = ctx.db.insert_new_item(&row) {
        if matches!(&e, UploadError::Core(WeftError::Duplicate(_))) {
            // Lost the insert race to a concurrent identical upload.
            // The promoted object is byte-identical to the winner's, so
            // it must NOT be deleted; only the lock and reservation are
            // rolled back.
            guard.staging_key = None;
        }
        return Err(e);
    }

    // The row is durable: cleanup must no longer undo anything.
    guard.disarm();
    ctx.cache.unlock(&lock_key, &lock_owner);

    if let Err(e) = ctx
        .queue
        .enqueue(JobLabel::NewDataItem, &item_job(canonical_id.as_str()))
    {
        // The periodic plan tick will still bundle the item.
        tracing::error!(item = %canonical_id, error = %e, "could not enqueue newDataItem");
    }

    crate::metrics::INGEST_BYTES.inc_by(actual_bytes);
    tracing::info!(
        item = %canonical_id,
        owner = %meta.owner,
        bytes = actual_bytes,
        reservation = funding.reservation_id.as_deref().unwrap_or("none"),
        "item accepted"
    );

    Ok(IngestOutcome {
        id: canonical_id.as_str().to_string(),
        owner: meta.owner,
        payer: funding.payer,
        receipt: Receipt {
            reserved_credits: funding.reserved_credits,
            reservation_id: funding.reservation_id,
            payment_id: funding.payment_id,
            uploaded_at,
            provisional: true,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testsupport::{test_ctx, test_ctx_with};

    fn meta(bytes: u64) -> IngestMeta {
        IngestMeta {
            content_length: bytes,
            owner: "alice".to_string(),
            kind: SignatureKind::Arweave,
            declared_id: None,
            payment_header: None,
            payment_mode: PaymentMode::Hybrid,
            is_container: false,
        }
    }

    fn body(chunks: &[&[u8]]) -> impl Stream<Item = Result<Bytes, WeftError>> + Unpin {
        futures::stream::iter(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from(c.to_vec())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn accepts_and_persists_a_small_item() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        let payload = b"hello weft";

        let outcome = ingest_stream(ctx, meta(10), body(&[payload]))
            .await
            .unwrap();

        let expected_id = ItemId::from_bytes(payload);
        assert_eq!(outcome.id, expected_id.as_str());
        assert!(outcome.receipt.provisional);
        assert!(outcome.receipt.reservation_id.is_some());

        // Raw object, cache entry, row, and job are all in place.
        assert!(ctx
            .objects
            .exists(Bucket::Raw, &item_key(&expected_id))
            .await
            .unwrap());
        assert!(ctx
            .cache
            .get(&PipelineCtx::item_cache_key(expected_id.as_str()))
            .is_some());
        assert!(ctx.db.new_item(expected_id.as_str()).unwrap().is_some());
        assert_eq!(ctx.queue.pending_count(JobLabel::NewDataItem).unwrap(), 1);
    }

    #[tokio::test]
    async fn second_upload_of_same_payload_is_duplicate() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        let payload = b"only-once";

        ingest_stream(ctx, meta(9), body(&[payload])).await.unwrap();
        let err = ingest_stream(ctx, meta(9), body(&[payload]))
            .await
            .unwrap_err();
        assert_eq!(err.as_wire().error, "duplicate");
        assert_eq!(ctx.db.table_count("new_item").unwrap(), 1);
        // The loser's reservation is refunded by the guard.
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn in_flight_lock_rejects_concurrent_upload() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        let payload = b"locked-payload";
        let declared = ItemId::from_bytes(payload);

        // A concurrent ingest of the same declared id holds the lock.
        assert!(ctx.cache.try_lock(
            &format!("inflight:{declared}"),
            "other-request",
            std::time::Duration::from_secs(60),
        ));

        let mut m = meta(14);
        m.declared_id = Some(declared);
        let err = ingest_stream(ctx, m, body(&[payload])).await.unwrap_err();
        assert_eq!(err.as_wire().error, "in_progress");
    }

    #[tokio::test]
    async fn declared_id_mismatch_is_content_mismatch() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        let mut m = meta(12);
        m.declared_id = Some(ItemId::from_bytes(b"something else"));

        let err = ingest_stream(ctx, m, body(&[b"actual bytes"]))
            .await
            .unwrap_err();
        assert_eq!(err.as_wire().error, "content_mismatch");
        assert_eq!(ctx.db.table_count("new_item").unwrap(), 0);
    }

    #[tokio::test]
    async fn rejects_oversized_declarations_up_front() {
        let t = test_ctx_with(|cfg| cfg.max_item_bytes = 100);
        let err = ingest_stream(&t.ctx, meta(101), body(&[b"x"]))
            .await
            .unwrap_err();
        assert_eq!(err.as_wire().error, "too_large");

        // Exactly the limit passes the gate.
        let payload = vec![1u8; 100];
        let ok = ingest_stream(&t.ctx, meta(100), body(&[payload.as_slice()])).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn overflowing_stream_is_quarantined() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        // Declares 10 bytes, streams 1200 — far past the 1% tolerance.
        let err = ingest_stream(ctx, meta(10), body(&[&[0u8; 1200]]))
            .await
            .unwrap_err();
        assert_eq!(err.as_wire().error, "bad_request");
        assert_eq!(ctx.db.table_count("new_item").unwrap(), 0);
    }

    #[tokio::test]
    async fn short_stream_is_rejected_and_cleaned() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        let err = ingest_stream(ctx, meta(100), body(&[b"short"]))
            .await
            .unwrap_err();
        assert_eq!(err.as_wire().error, "bad_request");
        // Give the guard's spawned cleanup a beat, then check nothing
        // leaked into the stateful tables.
        tokio::task::yield_now().await;
        assert_eq!(ctx.db.table_count("new_item").unwrap(), 0);
    }

    #[tokio::test]
    async fn unfunded_upload_gets_a_quote() {
        let t = test_ctx();
        *t.payment.reserve_rejects.lock().unwrap() = Some(WeftError::InsufficientCredit {
            required: 100,
            available: 0,
        });

        let err = ingest_stream(&t.ctx, meta(4), body(&[b"data"]))
            .await
            .unwrap_err();
        match err {
            UploadError::Core(WeftError::PaymentRequired(Some(body))) => {
                let quote: serde_json::Value = serde_json::from_str(&body).unwrap();
                assert_eq!(quote["x402Version"], 1);
            }
            other => panic!("expected PaymentRequired, got {other:?}"),
        }
    }
}
