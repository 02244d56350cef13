//! `opticalPost`: hand the item's metadata envelope to the read-side
//! bridges. Best-effort by contract — the job always completes, and
//! failures surface only in logs and metrics.

use crate::error::UploadError;
use crate::optical::ItemEnvelope;
use crate::pipeline::{parse_payload, ItemJob, PipelineCtx};

pub async fn handle(ctx: &PipelineCtx, payload: &serde_json::Value) -> Result<(), UploadError> {
    if !ctx.optical.is_configured() {
        return Ok(());
    }
    let job: ItemJob = parse_payload(payload)?;
    let Some(row) = ctx.db.item_any(&job.item_id)? else {
        // Failed or swept; nothing to advertise.
        return Ok(());
    };

    let envelope = ItemEnvelope {
        id: row.item_id.clone(),
        owner: row.owner_address.clone(),
        signature_kind: row.signature_kind.clone(),
        byte_count: row.byte_count,
        uploaded_at: row.uploaded_at,
    };
    let delivered = ctx.optical.post_item(&envelope).await;
    if delivered == 0 {
        tracing::warn!(item = %row.item_id, "no optical bridge accepted the hand-off");
    }
    Ok(())
}
