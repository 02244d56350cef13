//! `putOffsets`: make the item readable before it is bundled.
//!
//! Writes a placeholder offset row pointing at the whole raw-bucket
//! object; `prepare` supersedes it with the real in-bundle offset, and
//! `cleanupFs` removes the placeholder after verification.

use crate::db::{OffsetRow, RAW_POINTER_BUNDLE};
use crate::error::UploadError;
use crate::pipeline::{parse_payload, ItemJob, PipelineCtx};

pub async fn handle(ctx: &PipelineCtx, payload: &serde_json::Value) -> Result<(), UploadError> {
    let job: ItemJob = parse_payload(payload)?;
    let Some(row) = ctx.db.item_any(&job.item_id)? else {
        return Ok(());
    };
    ctx.db.upsert_offsets(&[OffsetRow {
        bundle_id: RAW_POINTER_BUNDLE.to_string(),
        item_id: row.item_id.clone(),
        offset: 0,
        length: row.byte_count,
    }])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ItemRow;
    use crate::pipeline::testsupport::test_ctx;

    #[tokio::test]
    async fn placeholder_points_at_whole_object() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        ctx.db
            .insert_new_item(&ItemRow {
                item_id: "item-a".into(),
                owner_address: "owner".into(),
                signature_kind: "arweave".into(),
                byte_count: 512,
                uploaded_at: 1,
                payment_id: None,
                reservation_id: None,
                cached: false,
                is_container: false,
            })
            .unwrap();

        let payload = serde_json::json!({ "itemId": "item-a" });
        handle(ctx, &payload).await.unwrap();
        // Idempotent on redelivery.
        handle(ctx, &payload).await.unwrap();

        let offsets = ctx.db.offsets_for_bundle(RAW_POINTER_BUNDLE).unwrap();
        assert_eq!(offsets.len(), 1);
        assert_eq!(offsets[0].offset, 0);
        assert_eq!(offsets[0].length, 512);
    }
}
