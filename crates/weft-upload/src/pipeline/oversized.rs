//! `oversizedItem`: items larger than the bundle cap are never bundled;
//! each becomes a standalone single-member bundle and rides the normal
//! prepare/post/verify spine. The worker pool has concurrency 1.

use uuid::Uuid;

use crate::error::UploadError;
use crate::pipeline::{bundle_job, parse_payload, ItemJob, PipelineCtx};
use crate::store::queue::JobLabel;

pub async fn handle(ctx: &PipelineCtx, payload: &serde_json::Value) -> Result<(), UploadError> {
    let job: ItemJob = parse_payload(payload)?;
    let Some(row) = ctx.db.new_item(&job.item_id)? else {
        // Already planned by an earlier delivery.
        return Ok(());
    };

    let bundle_id = Uuid::new_v4().to_string();
    ctx.db
        .assign_bundle(&bundle_id, &[row.item_id.clone()], row.byte_count, true)?;
    ctx.queue.enqueue(JobLabel::Prepare, &bundle_job(&bundle_id))?;
    tracing::info!(
        item = %row.item_id,
        bundle = %bundle_id,
        bytes = row.byte_count,
        "oversized item planned standalone"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ItemRow, ItemState};
    use crate::pipeline::testsupport::test_ctx;

    #[tokio::test]
    async fn plans_a_standalone_bundle_once() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        ctx.db
            .insert_new_item(&ItemRow {
                item_id: "huge".into(),
                owner_address: "owner".into(),
                signature_kind: "arweave".into(),
                byte_count: 3 * 1024 * 1024 * 1024,
                uploaded_at: 1,
                payment_id: None,
                reservation_id: None,
                cached: false,
                is_container: false,
            })
            .unwrap();

        let payload = serde_json::json!({ "itemId": "huge" });
        handle(ctx, &payload).await.unwrap();

        let Some(ItemState::Planned { bundle_id }) = ctx.db.item_state("huge").unwrap() else {
            panic!("item not planned");
        };
        assert!(ctx.db.bundle(&bundle_id).unwrap().unwrap().standalone);
        assert_eq!(ctx.queue.pending_count(JobLabel::Prepare).unwrap(), 1);

        // Redelivery after planning is a no-op.
        handle(ctx, &payload).await.unwrap();
        assert_eq!(ctx.queue.pending_count(JobLabel::Prepare).unwrap(), 1);
    }
}
