//! Storage adapters: object store, cache store, durable job queue.
//! One trait per external store, one production implementation each.

pub mod cache;
pub mod object;
pub mod queue;

pub use cache::{CacheStore, MemCacheStore};
pub use object::{Bucket, FsObjectStore, ObjectStore, ObjectWriter};
pub use queue::{Job, JobLabel, JobQueue};
