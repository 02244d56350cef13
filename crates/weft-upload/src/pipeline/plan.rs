//! `plan`: group pending items into bundles.
//!
//! Planning is serialized behind a cache-store leader lock so bundle
//! assignment never races. Packing is first-fit decreasing, bounded by
//! the bundle byte and item caps; the decreasing sort is stable, so
//! equal-sized items keep their oldest-first fetch order.

use std::time::Duration;
use uuid::Uuid;

use crate::db::ItemRow;
use crate::error::UploadError;
use crate::pipeline::{bundle_job, item_job, PipelineCtx};
use crate::store::queue::JobLabel;

const PLAN_LEADER_KEY: &str = "plan-leader";
const PLAN_LEADER_TTL: Duration = Duration::from_secs(60);
const OVERSIZED_DEDUPE_TTL: Duration = Duration::from_secs(3_600);

struct Bin {
    item_ids: Vec<String>,
    byte_count: u64,
}

pub async fn handle(ctx: &PipelineCtx) -> Result<(), UploadError> {
    let owner = Uuid::new_v4().to_string();
    if !ctx.cache.try_lock(PLAN_LEADER_KEY, &owner, PLAN_LEADER_TTL) {
        // Another planner holds the lock; its run covers our trigger.
        return Ok(());
    }
    let result = plan_locked(ctx).await;
    ctx.cache.unlock(PLAN_LEADER_KEY, &owner);
    result
}

async fn plan_locked(ctx: &PipelineCtx) -> Result<(), UploadError> {
    let candidates = ctx.db.new_items_for_planning(ctx.cfg.plan_candidates)?;
    if candidates.is_empty() {
        return Ok(());
    }

    let mut packable: Vec<ItemRow> = Vec::with_capacity(candidates.len());
    for item in candidates {
        if item.byte_count > ctx.cfg.max_bundle_bytes {
            // Never bundled; posted standalone by a single-concurrency
            // worker. The dedupe lock keeps the periodic tick from
            // flooding the queue while the item waits.
            let dedupe = format!("oversized:{}", item.item_id);
            if ctx.cache.try_lock(&dedupe, "plan", OVERSIZED_DEDUPE_TTL) {
                ctx.queue
                    .enqueue(JobLabel::OversizedItem, &item_job(&item.item_id))?;
                tracing::info!(
                    item = %item.item_id,
                    bytes = item.byte_count,
                    "oversized item queued for standalone posting"
                );
            }
        } else {
            packable.push(item);
        }
    }

    // First-fit decreasing. The sort is stable: within a size class the
    // oldest-first candidate order survives.
    packable.sort_by(|a, b| b.byte_count.cmp(&a.byte_count));

    let mut bins: Vec<Bin> = Vec::new();
    for item in &packable {
        let slot = bins.iter_mut().find(|bin| {
            bin.byte_count + item.byte_count <= ctx.cfg.max_bundle_bytes
                && (bin.item_ids.len() as u64) < ctx.cfg.max_items_per_bundle
        });
        match slot {
            Some(bin) => {
                bin.item_ids.push(item.item_id.clone());
                bin.byte_count += item.byte_count;
            }
            None => bins.push(Bin {
                item_ids: vec![item.item_id.clone()],
                byte_count: item.byte_count,
            }),
        }
    }

    for bin in bins {
        let bundle_id = Uuid::new_v4().to_string();
        ctx.db
            .assign_bundle(&bundle_id, &bin.item_ids, bin.byte_count, false)?;
        ctx.queue.enqueue(JobLabel::Prepare, &bundle_job(&bundle_id))?;
        tracing::info!(
            bundle = %bundle_id,
            items = bin.item_ids.len(),
            bytes = bin.byte_count,
            "bundle planned"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ItemState;
    use crate::pipeline::testsupport::{test_ctx_with, TestCtx};

    fn plan_ctx(max_bundle_bytes: u64, max_items: u64) -> TestCtx {
        test_ctx_with(|cfg| {
            cfg.max_bundle_bytes = max_bundle_bytes;
            cfg.max_items_per_bundle = max_items;
            cfg.plan_candidates = 1_000;
        })
    }

    fn seed_item(ctx: &PipelineCtx, id: &str, bytes: u64, at: i64) {
        ctx.db
            .insert_new_item(&ItemRow {
                item_id: id.to_string(),
                owner_address: "owner".into(),
                signature_kind: "arweave".into(),
                byte_count: bytes,
                uploaded_at: at,
                payment_id: None,
                reservation_id: None,
                cached: false,
                is_container: false,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn packs_within_caps_and_respects_oversize() {
        let t = plan_ctx(100, 10);
        let ctx = &*t.ctx;
        seed_item(ctx, "big", 300, 1); // over the bundle cap
        seed_item(ctx, "a", 60, 2);
        seed_item(ctx, "b", 60, 3);
        seed_item(ctx, "c", 40, 4);

        handle(ctx).await.unwrap();

        // The oversized item stayed in new_item, queued standalone.
        assert_eq!(ctx.db.item_state("big").unwrap(), Some(ItemState::New));
        assert_eq!(ctx.queue.pending_count(JobLabel::OversizedItem).unwrap(), 1);

        // a(60)+c(40) fit one bundle; b(60) overflows to a second.
        for id in ["a", "b", "c"] {
            assert!(matches!(
                ctx.db.item_state(id).unwrap(),
                Some(ItemState::Planned { .. })
            ));
        }
        assert_eq!(ctx.queue.pending_count(JobLabel::Prepare).unwrap(), 2);

        // Every bundle honors the byte cap.
        let ItemState::Planned { bundle_id } = ctx.db.item_state("a").unwrap().unwrap() else {
            panic!("a not planned");
        };
        let bundle = ctx.db.bundle(&bundle_id).unwrap().unwrap();
        assert!(bundle.byte_count <= 100);
    }

    #[tokio::test]
    async fn item_cap_limits_bundle_membership() {
        let t = plan_ctx(1_000_000, 2);
        let ctx = &*t.ctx;
        for (i, at) in [(0, 1), (1, 2), (2, 3), (3, 4), (4, 5)] {
            seed_item(ctx, &format!("item-{i}"), 10, at);
        }
        handle(ctx).await.unwrap();

        // 5 items, 2 per bundle → 3 bundles.
        assert_eq!(ctx.queue.pending_count(JobLabel::Prepare).unwrap(), 3);
        assert_eq!(ctx.db.table_count("new_item").unwrap(), 0);
    }

    #[tokio::test]
    async fn rerun_on_planned_input_is_a_noop() {
        let t = plan_ctx(1_000, 10);
        let ctx = &*t.ctx;
        seed_item(ctx, "a", 10, 1);
        handle(ctx).await.unwrap();
        assert_eq!(ctx.queue.pending_count(JobLabel::Prepare).unwrap(), 1);

        // Nothing left in new_item: a second run plans nothing.
        handle(ctx).await.unwrap();
        assert_eq!(ctx.queue.pending_count(JobLabel::Prepare).unwrap(), 1);
        assert_eq!(ctx.db.table_count("bundle").unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_planner_defers_to_leader() {
        let t = plan_ctx(1_000, 10);
        let ctx = &*t.ctx;
        seed_item(ctx, "a", 10, 1);
        assert!(ctx
            .cache
            .try_lock(PLAN_LEADER_KEY, "other-planner", PLAN_LEADER_TTL));

        handle(ctx).await.unwrap();
        // Deferred: the item is still unplanned.
        assert_eq!(ctx.db.item_state("a").unwrap(), Some(ItemState::New));
    }
}
