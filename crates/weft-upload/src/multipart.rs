//! Multipart uploads.
//!
//! Parts land as individual raw-bucket objects under the upload's
//! prefix; finalize replays them in the client's order through the
//! regular ingest path, so multipart items share the in-flight lock,
//! duplicate guard, and payment flow with single-shot uploads.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use weft::WeftError;

use crate::error::UploadError;
use crate::ingest::{ingest_stream, IngestMeta, IngestOutcome};
use crate::pipeline::PipelineCtx;
use crate::store::{Bucket, ObjectStore, ObjectWriter};

/// Object key of one uploaded part.
pub fn part_key(upload_id: &str, part: u32) -> String {
    format!("uploads/{upload_id}/{part:08}")
}

/// Store one part's bytes; returns the part's etag (hex SHA-256).
pub async fn put_part(
    ctx: &PipelineCtx,
    upload_id: &str,
    part: u32,
    content_length: u64,
    mut stream: impl Stream<Item = Result<Bytes, WeftError>> + Unpin,
) -> Result<String, UploadError> {
    if content_length == 0 {
        return Err(UploadError::bad_request("part content length must be positive"));
    }
    if content_length > ctx.cfg.max_item_bytes {
        return Err(UploadError::Core(WeftError::TooLarge {
            limit: ctx.cfg.max_item_bytes,
            actual: content_length,
        }));
    }
    let Some(upload) = ctx.db.multipart(upload_id)? else {
        return Err(UploadError::bad_request(format!(
            "unknown multipart upload: {upload_id}"
        )));
    };
    if upload.finalized_at.is_some() {
        return Err(UploadError::bad_request(format!(
            "multipart upload {upload_id} is already finalized"
        )));
    }

    let key = part_key(upload_id, part);
    let mut writer = ctx.objects.open_writer(Bucket::Raw, &key).await?;
    let mut hasher = Sha256::new();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                writer.abort().await.ok();
                return Err(e.into());
            }
        };
        written += chunk.len() as u64;
        if written > content_length {
            writer.abort().await.ok();
            return Err(UploadError::bad_request(
                "part exceeded its declared content length",
            ));
        }
        hasher.update(&chunk);
        if let Err(e) = writer.write_chunk(chunk).await {
            writer.abort().await.ok();
            return Err(e.into());
        }
    }
    if written < content_length {
        writer.abort().await.ok();
        return Err(UploadError::bad_request(format!(
            "part ended at {written} of {content_length} declared bytes"
        )));
    }
    writer.finish().await?;

    ctx.db.record_multipart_chunk(upload_id, written)?;
    let digest: [u8; 32] = hasher.finalize().into();
    Ok(alloy::hex::encode(digest))
}

struct PartCursor {
    objects: Arc<dyn ObjectStore>,
    parts: Vec<(String, u64)>,
    index: usize,
    offset: u64,
    chunk_bytes: u64,
}

fn part_stream(
    cursor: PartCursor,
) -> impl Stream<Item = Result<Bytes, WeftError>> + Unpin + Send {
    Box::pin(futures::stream::unfold(cursor, |mut c| async move {
        loop {
            let (key, size) = match c.parts.get(c.index) {
                Some(entry) => entry.clone(),
                None => return None,
            };
            if c.offset >= size {
                c.index += 1;
                c.offset = 0;
                continue;
            }
            let len = c.chunk_bytes.min(size - c.offset);
            let result = c.objects.read_range(Bucket::Raw, &key, c.offset, len).await;
            c.offset += len;
            return Some((result, c));
        }
    }))
}

/// Assemble the listed parts, in order, into one data item through the
/// normal ingest path; then retire the multipart bookkeeping.
pub async fn finalize(
    ctx: &PipelineCtx,
    upload_id: &str,
    parts: &[u32],
    mut meta: IngestMeta,
) -> Result<IngestOutcome, UploadError> {
    if parts.is_empty() {
        return Err(UploadError::bad_request("part list is empty"));
    }
    let Some(upload) = ctx.db.multipart(upload_id)? else {
        return Err(UploadError::bad_request(format!(
            "unknown multipart upload: {upload_id}"
        )));
    };
    if upload.finalized_at.is_some() {
        return Err(UploadError::bad_request(format!(
            "multipart upload {upload_id} is already finalized"
        )));
    }
    if parts.len() as u64 != upload.chunk_count {
        return Err(UploadError::bad_request(format!(
            "part list names {} parts but {} were uploaded",
            parts.len(),
            upload.chunk_count
        )));
    }

    let mut sized_parts = Vec::with_capacity(parts.len());
    let mut total = 0u64;
    for part in parts {
        let key = part_key(upload_id, *part);
        let size = ctx.objects.size(Bucket::Raw, &key).await.map_err(|_| {
            UploadError::bad_request(format!("part {part} was never uploaded"))
        })?;
        total += size;
        sized_parts.push((key, size));
    }
    meta.content_length = total;

    let stream = part_stream(PartCursor {
        objects: Arc::clone(&ctx.objects),
        parts: sized_parts.clone(),
        index: 0,
        offset: 0,
        chunk_bytes: ctx.cfg.chunk_bytes,
    });
    let outcome = ingest_stream(ctx, meta, stream).await?;

    ctx.db.finalize_multipart(upload_id)?;
    // Part objects are no longer needed; best-effort removal.
    let objects = Arc::clone(&ctx.objects);
    tokio::spawn(async move {
        for (key, _) in sized_parts {
            let _ = objects.delete(Bucket::Raw, &key).await;
        }
    });

    tracing::info!(
        upload = %upload_id,
        item = %outcome.id,
        parts = parts.len(),
        bytes = total,
        "multipart upload finalized"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testsupport::test_ctx;
    use weft::x402::PaymentMode;
    use weft::{ItemId, SignatureKind};

    fn meta() -> IngestMeta {
        IngestMeta {
            content_length: 0, // resolved from parts
            owner: "alice".to_string(),
            kind: SignatureKind::Arweave,
            declared_id: None,
            payment_header: None,
            payment_mode: PaymentMode::Hybrid,
            is_container: false,
        }
    }

    fn one_chunk(payload: &[u8]) -> impl Stream<Item = Result<Bytes, WeftError>> + Unpin {
        futures::stream::iter(vec![Ok(Bytes::from(payload.to_vec()))])
    }

    #[tokio::test]
    async fn parts_assemble_into_one_item() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        let up = ctx.db.create_multipart(3_600).unwrap();

        put_part(ctx, &up.upload_id, 1, 6, one_chunk(b"first-")).await.unwrap();
        put_part(ctx, &up.upload_id, 2, 7, one_chunk(b"second-")).await.unwrap();
        put_part(ctx, &up.upload_id, 3, 5, one_chunk(b"third")).await.unwrap();

        let outcome = finalize(ctx, &up.upload_id, &[1, 2, 3], meta()).await.unwrap();
        let expected = ItemId::from_bytes(b"first-second-third");
        assert_eq!(outcome.id, expected.as_str());

        let row = ctx.db.new_item(expected.as_str()).unwrap().unwrap();
        assert_eq!(row.byte_count, 18);
        assert!(ctx.db.multipart(&up.upload_id).unwrap().unwrap().finalized_at.is_some());
    }

    #[tokio::test]
    async fn finalize_respects_client_part_order() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        let up = ctx.db.create_multipart(3_600).unwrap();
        put_part(ctx, &up.upload_id, 1, 2, one_chunk(b"ab")).await.unwrap();
        put_part(ctx, &up.upload_id, 2, 2, one_chunk(b"cd")).await.unwrap();

        // Reversed order assembles a different item.
        let outcome = finalize(ctx, &up.upload_id, &[2, 1], meta()).await.unwrap();
        assert_eq!(outcome.id, ItemId::from_bytes(b"cdab").as_str());
    }

    #[tokio::test]
    async fn etag_is_the_part_digest() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        let up = ctx.db.create_multipart(3_600).unwrap();
        let etag = put_part(ctx, &up.upload_id, 1, 4, one_chunk(b"data")).await.unwrap();
        let expected: [u8; 32] = Sha256::digest(b"data").into();
        assert_eq!(etag, alloy::hex::encode(expected));
    }

    #[tokio::test]
    async fn finalize_rejects_incomplete_part_lists() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        let up = ctx.db.create_multipart(3_600).unwrap();
        put_part(ctx, &up.upload_id, 1, 2, one_chunk(b"ab")).await.unwrap();
        put_part(ctx, &up.upload_id, 2, 2, one_chunk(b"cd")).await.unwrap();

        let err = finalize(ctx, &up.upload_id, &[1], meta()).await.unwrap_err();
        assert_eq!(err.as_wire().error, "bad_request");

        let err = finalize(ctx, &up.upload_id, &[1, 3], meta()).await.unwrap_err();
        assert_eq!(err.as_wire().error, "bad_request");
    }

    #[tokio::test]
    async fn double_finalize_is_rejected() {
        let t = test_ctx();
        let ctx = &*t.ctx;
        let up = ctx.db.create_multipart(3_600).unwrap();
        put_part(ctx, &up.upload_id, 1, 2, one_chunk(b"zz")).await.unwrap();
        finalize(ctx, &up.upload_id, &[1], meta()).await.unwrap();

        let err = finalize(ctx, &up.upload_id, &[1], meta()).await.unwrap_err();
        assert_eq!(err.as_wire().error, "bad_request");
    }
}
