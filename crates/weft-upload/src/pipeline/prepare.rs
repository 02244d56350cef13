//! `prepare`: assemble the bundle payload, sign the envelope, persist
//! offsets.
//!
//! Streams member bytes from scratch, cache, or the raw bucket into the
//! backup bucket without buffering the bundle. Idempotent by bundle id:
//! a re-run rewrites the backup object byte-for-byte (ECDSA signing is
//! deterministic) and re-upserts identical offset rows.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use weft::ItemId;

use crate::bundle::{BundleManifest, ManifestEntry};
use crate::db::{bundle_status, ItemRow, OffsetRow};
use crate::error::UploadError;
use crate::pipeline::{bundle_job, parse_payload, BundleJob, PipelineCtx};
use crate::store::object::{bundle_key, item_key};
use crate::store::queue::JobLabel;
use crate::store::{Bucket, ObjectWriter};

pub async fn handle(ctx: &PipelineCtx, payload: &serde_json::Value) -> Result<(), UploadError> {
    let job: BundleJob = parse_payload(payload)?;
    let Some(bundle) = ctx.db.bundle(&job.bundle_id)? else {
        return Ok(());
    };
    match bundle.status.as_str() {
        bundle_status::PLANNED | bundle_status::PREPARED => {}
        // Already past this stage or terminally failed.
        _ => return Ok(()),
    }

    let items = ctx.db.bundle_items(&job.bundle_id)?;
    if items.is_empty() {
        // Members already moved on (verified bundle re-queued late).
        return Ok(());
    }

    let manifest = BundleManifest::new(
        items
            .iter()
            .map(|item| {
                Ok(ManifestEntry {
                    item_id: ItemId::parse(&item.item_id).map_err(UploadError::Core)?,
                    length: item.byte_count,
                })
            })
            .collect::<Result<Vec<_>, UploadError>>()?,
    );

    let key = bundle_key(&job.bundle_id);
    let mut writer = ctx.objects.open_writer(Bucket::Backup, &key).await?;
    let mut hasher = Sha256::new();

    let header = manifest.header_bytes();
    hasher.update(&header);
    if let Err(e) = writer.write_chunk(Bytes::from(header)).await {
        writer.abort().await.ok();
        return Err(e.into());
    }

    for item in &items {
        if let Err(e) = stream_member(ctx, item, writer.as_mut(), &mut hasher).await {
            writer.abort().await.ok();
            return Err(e);
        }
    }
    writer.finish().await?;

    let digest: [u8; 32] = hasher.finalize().into();
    let envelope = ctx.signer.sign(digest).map_err(UploadError::Core)?;
    ctx.db.set_bundle_prepared(
        &job.bundle_id,
        envelope.tx_id.as_str(),
        &envelope.signature_hex,
    )?;

    let offsets: Vec<OffsetRow> = manifest
        .offsets()
        .into_iter()
        .map(|(item_id, offset, length)| OffsetRow {
            bundle_id: job.bundle_id.clone(),
            item_id: item_id.as_str().to_string(),
            offset,
            length,
        })
        .collect();
    ctx.db.upsert_offsets(&offsets)?;

    ctx.queue.enqueue(JobLabel::Post, &bundle_job(&job.bundle_id))?;
    tracing::info!(
        bundle = %job.bundle_id,
        tx = %envelope.tx_id,
        items = items.len(),
        bytes = manifest.total_len(),
        "bundle prepared"
    );
    Ok(())
}

/// Copy one member's bytes into the bundle, cheapest source first:
/// scratch file, cache, then ranged reads from the raw bucket.
async fn stream_member(
    ctx: &PipelineCtx,
    item: &ItemRow,
    writer: &mut dyn ObjectWriter,
    hasher: &mut Sha256,
) -> Result<(), UploadError> {
    if let Some(path) = ctx.scratch_path(&item.item_id) {
        if let Ok(bytes) = tokio::fs::read(&path).await {
            if bytes.len() as u64 == item.byte_count {
                hasher.update(&bytes);
                writer.write_chunk(Bytes::from(bytes)).await?;
                return Ok(());
            }
            tracing::warn!(item = %item.item_id, "scratch file size mismatch; falling back");
        }
    }

    if let Some(bytes) = ctx.cache.get(&PipelineCtx::item_cache_key(&item.item_id)) {
        if bytes.len() as u64 == item.byte_count {
            hasher.update(&bytes);
            writer.write_chunk(bytes).await?;
            return Ok(());
        }
    }

    let item_id = ItemId::parse(&item.item_id).map_err(UploadError::Core)?;
    let key = item_key(&item_id);
    let total = ctx.objects.size(Bucket::Raw, &key).await?;
    if total != item.byte_count {
        return Err(UploadError::internal(format!(
            "raw object for {} is {total} bytes, row says {}",
            item.item_id, item.byte_count
        )));
    }
    let mut offset = 0u64;
    while offset < total {
        let len = ctx.cfg.chunk_bytes.min(total - offset);
        let chunk = ctx.objects.read_range(Bucket::Raw, &key, offset, len).await?;
        hasher.update(&chunk);
        writer.write_chunk(chunk).await?;
        offset += len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testsupport::test_ctx;
    use weft::ItemId;

    async fn seed(ctx: &PipelineCtx, payload: &[u8]) -> String {
        let id = ItemId::from_bytes(payload);
        ctx.objects
            .put(Bucket::Raw, &item_key(&id), Bytes::from(payload.to_vec()))
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
                is_container: false,
            })
            .unwrap();
        id.as_str().to_string()
    }

    #[tokio::test]
    async fn assembles_signs_and_records_offsets() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        let a = seed(ctx, b"payload-a").await;
        let b = seed(ctx, b"payload-b!").await;
        ctx.db
            .assign_bundle("b1", &[a.clone(), b.clone()], 19, false)
            .unwrap();

        handle(ctx, &serde_json::json!({ "bundleId": "b1" }))
            .await
            .unwrap();

        let bundle = ctx.db.bundle("b1").unwrap().unwrap();
        assert_eq!(bundle.status, bundle_status::PREPARED);
        assert!(bundle.tx_id.is_some());
        assert!(bundle.tx_signature.is_some());

        // Payload = header + both members, in assignment order.
        let payload = ctx
            .objects
            .get(Bucket::Backup, &bundle_key("b1"))
            .await
            .unwrap();
        let header_len = 4 + 40 * 2;
        assert_eq!(&payload[header_len..header_len + 9], b"payload-a");
        assert_eq!(&payload[header_len + 9..], b"payload-b!");

        let offsets = ctx.db.offsets_for_bundle("b1").unwrap();
        assert_eq!(offsets.len(), 2);
        assert_eq!(offsets[0].offset, header_len as u64);
        assert_eq!(offsets[0].length, 9);
        assert_eq!(offsets[1].offset, header_len as u64 + 9);

        assert_eq!(ctx.queue.pending_count(JobLabel::Post).unwrap(), 1);
    }

    #[tokio::test]
    async fn rerun_replaces_backup_byte_for_byte() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        let a = seed(ctx, b"stable-payload").await;
        ctx.db.assign_bundle("b1", &[a], 14, false).unwrap();

        let job = serde_json::json!({ "bundleId": "b1" });
        handle(ctx, &job).await.unwrap();
        let first = ctx.objects.get(Bucket::Backup, &bundle_key("b1")).await.unwrap();
        let first_tx = ctx.db.bundle("b1").unwrap().unwrap().tx_id;

        handle(ctx, &job).await.unwrap();
        let second = ctx.objects.get(Bucket::Backup, &bundle_key("b1")).await.unwrap();
        let second_tx = ctx.db.bundle("b1").unwrap().unwrap().tx_id;

        assert_eq!(first, second);
        assert_eq!(first_tx, second_tx);
        assert_eq!(ctx.db.offsets_for_bundle("b1").unwrap().len(), 1);
    }
}
