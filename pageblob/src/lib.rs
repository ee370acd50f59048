#![cfg_attr(test, allow(clippy::unwrap_used))]
#![warn(clippy::panic)]
#![cfg_attr(test, allow(clippy::panic))]
#![allow(clippy::result_large_err)]

/// Re-export the bytes crate.
///
/// This is useful for users of the crate who want to use pageblob
/// without having to depend on the bytes crate directly.
pub use bytes;

/// Re-export the object store crate.
///
/// This is useful for users of the crate who want to use pageblob
/// without having to depend on the object store crate directly.
pub use object_store;

pub use backend::{
    BlobMetadata, BlobProperties, ObjectStorePageBackend, PageBlobBackend, RevisionTag,
};
pub use config::{RetrySettings, Settings};
pub use error::{Error, ErrorKind};
pub use page_blob::{PageBlob, PageBlobStore, PageBlobStoreBuilder, DEFAULT_PAGE_SIZE};
pub use record::{JsonCodec, KeyResolver, ObjectCodec, PageRecord, PrefixKeyResolver, RecordStore};
pub use retry::{
    Backoff, ConflictRetryExecutor, JitteredExponentialBackoff, RetryOptions, VersionedResource,
};

pub mod admin;
pub mod backend;
pub mod clock;
pub mod config;
pub mod rand;
pub mod retry;
pub mod stats;

mod error;
mod page_blob;
mod record;
#[cfg(test)]
mod test_utils;
mod utils;
