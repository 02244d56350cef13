//! Object store interface and the filesystem implementation.
//!
//! Two buckets: `raw` holds authoritative inbound item bytes, `backup`
//! holds assembled bundle payloads. Writers stream to a temporary file
//! and rename on finish, so a crashed upload never leaves a readable
//! partial object under its final key.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use weft::{ItemId, WeftError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Raw,
    Backup,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Raw => "raw",
            Bucket::Backup => "backup",
        }
    }
}

/// Streaming writer returned by [`ObjectStore::open_writer`].
#[async_trait]
pub trait ObjectWriter: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), WeftError>;
    /// Commit the object; returns total bytes written.
    async fn finish(self: Box<Self>) -> Result<u64, WeftError>;
    /// Discard everything written so far.
    async fn abort(self: Box<Self>) -> Result<(), WeftError>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bucket: Bucket, key: &str, bytes: Bytes) -> Result<(), WeftError>;
    async fn open_writer(
        &self,
        bucket: Bucket,
        key: &str,
    ) -> Result<Box<dyn ObjectWriter>, WeftError>;
    async fn get(&self, bucket: Bucket, key: &str) -> Result<Bytes, WeftError>;
    async fn read_range(
        &self,
        bucket: Bucket,
        key: &str,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, WeftError>;
    async fn size(&self, bucket: Bucket, key: &str) -> Result<u64, WeftError>;
    async fn exists(&self, bucket: Bucket, key: &str) -> Result<bool, WeftError>;
    async fn delete(&self, bucket: Bucket, key: &str) -> Result<(), WeftError>;
    /// Atomic move within a bucket (staging → final key).
    async fn rename(&self, bucket: Bucket, from: &str, to: &str) -> Result<(), WeftError>;
}

/// Object key for an ingested item's bytes in the raw bucket.
pub fn item_key(item_id: &ItemId) -> String {
    format!("items/{item_id}")
}

/// Object key for an assembled bundle payload in the backup bucket.
pub fn bundle_key(bundle_id: &str) -> String {
    format!("bundles/{bundle_id}")
}

/// Stream an object through SHA-256 without loading it whole.
pub async fn digest_object(
    store: &dyn ObjectStore,
    bucket: Bucket,
    key: &str,
    chunk_bytes: u64,
) -> Result<ItemId, WeftError> {
    let total = store.size(bucket, key).await?;
    let mut digest = weft::item::ItemDigest::new();
    let mut offset = 0u64;
    while offset < total {
        let len = chunk_bytes.min(total - offset);
        let chunk = store.read_range(bucket, key, offset, len).await?;
        digest.update(&chunk);
        offset += len;
    }
    Ok(digest.finish())
}

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, bucket: Bucket, key: &str) -> Result<PathBuf, WeftError> {
        if key.is_empty()
            || key.starts_with('/')
            || Path::new(key)
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(WeftError::BadRequest(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(bucket.as_str()).join(key))
    }

    fn io_err(context: &str, e: std::io::Error) -> WeftError {
        WeftError::Internal(format!("{context}: {e}"))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, bucket: Bucket, key: &str, bytes: Bytes) -> Result<(), WeftError> {
        let mut writer = self.open_writer(bucket, key).await?;
        writer.write_chunk(bytes).await?;
        writer.finish().await?;
        Ok(())
    }

    async fn open_writer(
        &self,
        bucket: Bucket,
        key: &str,
    ) -> Result<Box<dyn ObjectWriter>, WeftError> {
        let path = self.resolve(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err("create object directory", e))?;
        }
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Self::io_err("create object", e))?;
        Ok(Box::new(FsObjectWriter {
            file: Some(file),
            tmp,
            path,
            written: 0,
        }))
    }

    async fn get(&self, bucket: Bucket, key: &str) -> Result<Bytes, WeftError> {
        let path = self.resolve(bucket, key)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| Self::io_err("read object", e))?;
        Ok(Bytes::from(bytes))
    }

    async fn read_range(
        &self,
        bucket: Bucket,
        key: &str,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, WeftError> {
        let path = self.resolve(bucket, key)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Self::io_err("open object", e))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| Self::io_err("seek object", e))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| Self::io_err("read object range", e))?;
        Ok(Bytes::from(buf))
    }

    async fn size(&self, bucket: Bucket, key: &str) -> Result<u64, WeftError> {
        let path = self.resolve(bucket, key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Self::io_err("stat object", e))?;
        Ok(meta.len())
    }

    async fn exists(&self, bucket: Bucket, key: &str) -> Result<bool, WeftError> {
        let path = self.resolve(bucket, key)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn delete(&self, bucket: Bucket, key: &str) -> Result<(), WeftError> {
        let path = self.resolve(bucket, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err("delete object", e)),
        }
    }

    async fn rename(&self, bucket: Bucket, from: &str, to: &str) -> Result<(), WeftError> {
        let from_path = self.resolve(bucket, from)?;
        let to_path = self.resolve(bucket, to)?;
        if let Some(parent) = to_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err("create object directory", e))?;
        }
        tokio::fs::rename(&from_path, &to_path)
            .await
            .map_err(|e| Self::io_err("rename object", e))
    }
}

struct FsObjectWriter {
    file: Option<tokio::fs::File>,
    tmp: PathBuf,
    path: PathBuf,
    written: u64,
}

#[async_trait]
impl ObjectWriter for FsObjectWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), WeftError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| WeftError::Internal("writer already closed".to_string()))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| FsObjectStore::io_err("write object chunk", e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<u64, WeftError> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| WeftError::Internal("writer already closed".to_string()))?;
        file.flush()
            .await
            .map_err(|e| FsObjectStore::io_err("flush object", e))?;
        drop(file);
        tokio::fs::rename(&self.tmp, &self.path)
            .await
            .map_err(|e| FsObjectStore::io_err("commit object", e))?;
        Ok(self.written)
    }

    async fn abort(mut self: Box<Self>) -> Result<(), WeftError> {
        self.file.take();
        match tokio::fs::remove_file(&self.tmp).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsObjectStore::io_err("abort object", e)),
        }
    }
}
