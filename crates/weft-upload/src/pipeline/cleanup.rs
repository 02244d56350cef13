//! `cleanupFs`: reclaim space once a bundle is verified.
//!
//! Drops scratch files, cached bytes, and the placeholder offsets for
//! every member. Raw-bucket objects are deleted only when the retention
//! config says so; the backup copy of the bundle is kept.

use weft::ItemId;

use crate::db::{bundle_status, RAW_POINTER_BUNDLE};
use crate::error::UploadError;
use crate::pipeline::{parse_payload, BundleJob, PipelineCtx};
use crate::store::object::item_key;
use crate::store::Bucket;

pub async fn handle(ctx: &PipelineCtx, payload: &serde_json::Value) -> Result<(), UploadError> {
    let job: BundleJob = parse_payload(payload)?;
    let Some(bundle) = ctx.db.bundle(&job.bundle_id)? else {
        return Ok(());
    };
    if bundle.status != bundle_status::VERIFIED {
        return Ok(());
    }

    let items = ctx.db.permanent_items(&job.bundle_id)?;
    for item in &items {
        ctx.db.delete_offset(RAW_POINTER_BUNDLE, &item.item_id)?;
        ctx.cache.delete(&PipelineCtx::item_cache_key(&item.item_id));

        if let Some(path) = ctx.scratch_path(&item.item_id) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    item = %item.item_id,
                    error = %e,
                    "could not remove scratch file"
                ),
            }
        }

        if ctx.cfg.delete_raw_after_verify {
            if let Ok(item_id) = ItemId::parse(&item.item_id) {
                ctx.objects.delete(Bucket::Raw, &item_key(&item_id)).await.ok();
            }
        }
    }

    tracing::debug!(
        bundle = %job.bundle_id,
        items = items.len(),
        "cleanup complete"
    );
    Ok(())
}
