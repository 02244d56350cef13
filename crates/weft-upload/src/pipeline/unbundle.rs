//! `unbundleBdi`: unpack a nested-bundle container.
//!
//! A container item's payload is itself bundle-framed. Each inner item
//! is copied out of the raw object into its own key, digest-verified
//! against the manifest entry, inserted as a `new_item`, and re-enters
//! the pipeline through `newDataItem`. Inner items carry no reservation
//! of their own — the container paid for the bytes.

use weft::item::ItemDigest;
use weft::ItemId;

use crate::bundle::BundleManifest;
use crate::db::ItemRow;
use crate::error::UploadError;
use crate::pipeline::{item_job, parse_payload, ItemJob, PipelineCtx};
use crate::store::object::item_key;
use crate::store::queue::JobLabel;
use crate::store::{Bucket, ObjectWriter};

const HEADER_COUNT_LEN: u64 = 4;
const HEADER_ENTRY_LEN: u64 = 40;

pub async fn handle(ctx: &PipelineCtx, payload: &serde_json::Value) -> Result<(), UploadError> {
    let job: ItemJob = parse_payload(payload)?;
    let Some(row) = ctx.db.item_any(&job.item_id)? else {
        return Ok(());
    };
    let container_id = ItemId::parse(&row.item_id).map_err(UploadError::Core)?;
    let key = item_key(&container_id);
    let total = ctx.objects.size(Bucket::Raw, &key).await?;

    // Read the count, bound it, then read the full header.
    if total < HEADER_COUNT_LEN {
        tracing::warn!(item = %row.item_id, "container too small for a bundle header");
        return Ok(());
    }
    let count_bytes = ctx.objects.read_range(Bucket::Raw, &key, 0, HEADER_COUNT_LEN).await?;
    let count = u32::from_le_bytes(count_bytes[..4].try_into().unwrap_or_default()) as u64;
    if count == 0 || count > ctx.cfg.max_items_per_bundle {
        tracing::warn!(item = %row.item_id, count, "implausible container item count");
        return Ok(());
    }
    let header_len = HEADER_COUNT_LEN + HEADER_ENTRY_LEN * count;
    if header_len > total {
        tracing::warn!(item = %row.item_id, "container header exceeds payload");
        return Ok(());
    }
    let header = ctx.objects.read_range(Bucket::Raw, &key, 0, header_len).await?;
    let Some(manifest) = BundleManifest::parse(&header, total) else {
        tracing::warn!(item = %row.item_id, "payload is not a valid container");
        return Ok(());
    };

    let mut unpacked = 0usize;
    for (inner_id, offset, length) in manifest.offsets() {
        // Duplicate guard: the inner item may already be anywhere in
        // the lifecycle.
        if ctx.db.item_state(inner_id.as_str())?.is_some() {
            continue;
        }

        let staging = format!("staging/unbundle-{}", uuid::Uuid::new_v4());
        let mut writer = ctx.objects.open_writer(Bucket::Raw, &staging).await?;
        let mut digest = ItemDigest::new();
        let mut copied = 0u64;
        let mut copy_failed = false;
        while copied < length {
            let len = ctx.cfg.chunk_bytes.min(length - copied);
            match ctx
                .objects
                .read_range(Bucket::Raw, &key, offset + copied, len)
                .await
            {
                Ok(chunk) => {
                    digest.update(&chunk);
                    writer.write_chunk(chunk).await?;
                    copied += len;
                }
                Err(e) => {
                    tracing::warn!(
                        container = %row.item_id,
                        inner = %inner_id,
                        error = %e,
                        "could not copy inner item"
                    );
                    copy_failed = true;
                    break;
                }
            }
        }
        if copy_failed || digest.finish() != inner_id {
            if !copy_failed {
                tracing::warn!(
                    container = %row.item_id,
                    inner = %inner_id,
                    "inner item does not hash to its manifest id; skipped"
                );
            }
            writer.abort().await.ok();
            continue;
        }
        writer.finish().await?;
        ctx.objects
            .rename(Bucket::Raw, &staging, &item_key(&inner_id))
            .await?;

        let inner_row = ItemRow {
            item_id: inner_id.as_str().to_string(),
            owner_address: row.owner_address.clone(),
            signature_kind: row.signature_kind.clone(),
            byte_count: length,
            uploaded_at: chrono::Utc::now().timestamp(),
            payment_id: None,
            reservation_id: None,
            cached: false,
            is_container: false,
        };
        match ctx.db.insert_new_item(&inner_row) {
            Ok(()) => {
                ctx.queue
                    .enqueue(JobLabel::NewDataItem, &item_job(inner_id.as_str()))?;
                unpacked += 1;
            }
            Err(UploadError::Core(weft::WeftError::Duplicate(_))) => {
                // Raced another unbundle of the same inner item.
            }
            Err(e) => return Err(e),
        }
    }

    tracing::info!(
        container = %row.item_id,
        total = manifest.entries.len(),
        unpacked,
        "container unbundled"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ManifestEntry;
    use crate::db::ItemState;
    use crate::pipeline::testsupport::test_ctx;
    use bytes::Bytes;

    /// Build a container payload wrapping the given inner payloads.
    fn container_bytes(inners: &[&[u8]]) -> Vec<u8> {
        let manifest = BundleManifest::new(
            inners
                .iter()
                .map(|p| ManifestEntry {
                    item_id: ItemId::from_bytes(p),
                    length: p.len() as u64,
                })
                .collect(),
        );
        let mut out = manifest.header_bytes();
        for p in inners {
            out.extend_from_slice(p);
        }
        out
    }

    #[tokio::test]
    async fn unpacks_inner_items_into_the_pipeline() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        let payload = container_bytes(&[b"inner-one", b"inner-two-longer"]);
        let container = ItemId::from_bytes(&payload);
        ctx.objects
            .put(Bucket::Raw, &item_key(&container), Bytes::from(payload.clone()))
            .await
            .unwrap();
        ctx.db
            .insert_new_item(&ItemRow {
                item_id: container.as_str().to_string(),
                owner_address: "owner".into(),
                signature_kind: "arweave".into(),
                byte_count: payload.len() as u64,
                uploaded_at: 1,
                payment_id: None,
                reservation_id: Some("res-c".into()),
                cached: false,
                is_container: true,
            })
            .unwrap();

        handle(ctx, &serde_json::json!({ "itemId": container.as_str() }))
            .await
            .unwrap();

        for inner in [b"inner-one".as_slice(), b"inner-two-longer".as_slice()] {
            let id = ItemId::from_bytes(inner);
            assert_eq!(ctx.db.item_state(id.as_str()).unwrap(), Some(ItemState::New));
            assert_eq!(
                ctx.objects.get(Bucket::Raw, &item_key(&id)).await.unwrap(),
                Bytes::from(inner.to_vec())
            );
            // Inner items carry no reservation.
            let row = ctx.db.new_item(id.as_str()).unwrap().unwrap();
            assert!(row.reservation_id.is_none());
        }
        assert_eq!(ctx.queue.pending_count(JobLabel::NewDataItem).unwrap(), 2);

        // Redelivery skips the already-unpacked inner items.
        handle(ctx, &serde_json::json!({ "itemId": container.as_str() }))
            .await
            .unwrap();
        assert_eq!(ctx.queue.pending_count(JobLabel::NewDataItem).unwrap(), 2);
    }

    #[tokio::test]
    async fn non_container_payload_is_skipped() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        let payload = b"just some opaque bytes, not a bundle".to_vec();
        let id = ItemId::from_bytes(&payload);
        ctx.objects
            .put(Bucket::Raw, &item_key(&id), Bytes::from(payload.clone()))
            .await
            .unwrap();
        ctx.db
            .insert_new_item(&ItemRow {
                item_id: id.as_str().to_string(),
                owner_address: "owner".into(),
                signature_kind: "arweave".into(),
                byte_count: payload.len() as u64,
                uploaded_at: 1,
                payment_id: None,
                reservation_id: None,
                cached: false,
                is_container: true,
            })
            .unwrap();

        handle(ctx, &serde_json::json!({ "itemId": id.as_str() }))
            .await
            .unwrap();
        assert_eq!(ctx.queue.pending_count(JobLabel::NewDataItem).unwrap(), 0);
    }
}
