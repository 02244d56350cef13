//! `newDataItem`: validate a freshly ingested item and fan out the
//! side jobs. Safe to rerun — a missing row means another worker
//! already handled it.

use weft::ItemId;

use crate::error::UploadError;
use crate::pipeline::{item_job, parse_payload, ItemJob, PipelineCtx};
use crate::store::object::{digest_object, item_key};
use crate::store::queue::JobLabel;
use crate::store::Bucket;

pub async fn handle(ctx: &PipelineCtx, payload: &serde_json::Value) -> Result<(), UploadError> {
    let job: ItemJob = parse_payload(payload)?;
    let Some(row) = ctx.db.new_item(&job.item_id)? else {
        return Ok(());
    };
    let item_id = ItemId::parse(&row.item_id).map_err(UploadError::Core)?;
    let key = item_key(&item_id);

    // Re-verify the content address against the stored bytes.
    let digest = match ctx.cache.get(&PipelineCtx::item_cache_key(&row.item_id)) {
        Some(bytes) => ItemId::from_bytes(&bytes),
        None => digest_object(ctx.objects.as_ref(), Bucket::Raw, &key, ctx.cfg.chunk_bytes).await?,
    };
    if digest != item_id {
        tracing::warn!(
            item = %row.item_id,
            recomputed = %digest,
            "stored bytes do not hash to the item id"
        );
        // Refund before moving the row: a transient refund failure
        // retries the whole (idempotent) job.
        if let Some(reservation_id) = &row.reservation_id {
            match ctx.payment.refund(reservation_id).await {
                Ok(_) => {}
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => tracing::error!(
                    reservation = %reservation_id,
                    error = %e,
                    "refund rejected for corrupt item"
                ),
            }
        }
        ctx.db.fail_new_item(&row.item_id, "hash_mismatch")?;
        ctx.objects.delete(Bucket::Raw, &key).await.ok();
        ctx.cache.delete(&PipelineCtx::item_cache_key(&row.item_id));
        return Ok(());
    }

    // Parallel side jobs; none of them gate the item's progress.
    ctx.queue
        .enqueue(JobLabel::OpticalPost, &item_job(&row.item_id))?;
    ctx.queue
        .enqueue(JobLabel::PutOffsets, &item_job(&row.item_id))?;
    if row.is_container {
        ctx.queue
            .enqueue(JobLabel::Unbundle, &item_job(&row.item_id))?;
    }
    // Reactive plan trigger; the periodic tick covers missed ones.
    ctx.queue.enqueue(JobLabel::Plan, &serde_json::json!({}))?;

    tracing::debug!(item = %row.item_id, bytes = row.byte_count, "item validated");
    Ok(())
}
