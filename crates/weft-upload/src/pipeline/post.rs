//! `post`: deliver the assembled payload to the storage network.
//!
//! Uploads are chunked and resumable: the network reports the last
//! acknowledged offset and the worker continues from there, so a retry
//! never re-sends what already landed.

use crate::db::bundle_status;
use crate::error::UploadError;
use crate::pipeline::{parse_payload, BundleJob, PipelineCtx};
use crate::store::object::bundle_key;
use crate::store::queue::JobLabel;
use crate::store::Bucket;

pub async fn handle(ctx: &PipelineCtx, payload: &serde_json::Value) -> Result<(), UploadError> {
    let job: BundleJob = parse_payload(payload)?;
    let Some(bundle) = ctx.db.bundle(&job.bundle_id)? else {
        return Ok(());
    };
    match bundle.status.as_str() {
        bundle_status::PREPARED | bundle_status::POSTED => {}
        _ => return Ok(()),
    }
    let (Some(tx_id), Some(signature)) = (&bundle.tx_id, &bundle.tx_signature) else {
        return Err(UploadError::internal(format!(
            "bundle {} reached post without a signed envelope",
            job.bundle_id
        )));
    };

    let key = bundle_key(&job.bundle_id);
    let total = ctx.objects.size(Bucket::Backup, &key).await?;

    // Resume from the last byte the network acknowledged.
    let mut offset = ctx.network.uploaded_offset(tx_id).await?;
    if offset > total {
        tracing::warn!(
            bundle = %job.bundle_id,
            acknowledged = offset,
            total,
            "network reports more bytes than we hold; restarting upload"
        );
        offset = 0;
    }
    while offset < total {
        let len = ctx.cfg.chunk_bytes.min(total - offset);
        let chunk = ctx
            .objects
            .read_range(Bucket::Backup, &key, offset, len)
            .await?;
        ctx.network.upload_chunk(tx_id, offset, chunk).await?;
        offset += len;
    }

    ctx.network.submit(tx_id, total, signature).await?;
    ctx.db.set_bundle_posted(&job.bundle_id)?;
    ctx.queue.enqueue_delayed(
        JobLabel::Verify,
        &serde_json::json!({ "bundleId": job.bundle_id, "poll": 0 }),
        ctx.cfg.post_confirm_delay_secs,
    )?;
    tracing::info!(
        bundle = %job.bundle_id,
        tx = %tx_id,
        bytes = total,
        "bundle posted to storage network"
    );
    Ok(())
}
