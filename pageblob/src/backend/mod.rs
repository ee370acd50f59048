//! # Page Blob Backends
//!
//! A page blob is a remote object made of fixed-size pages. The service storing it only
//! understands whole-page writes, explicit resizes, and a single conditional primitive: an
//! operation carrying a [RevisionTag] precondition succeeds only if the object's tag is
//! unchanged since the caller fetched it. Every successful mutation returns a new tag.
//!
//! `PageBlobBackend` is the seam between the page-aligned handle in `page_blob.rs` and the
//! service. Backends report failures with `object_store::Error`. In particular, a failed
//! precondition must be reported as `object_store::Error::Precondition` (the HTTP 412
//! equivalent); the handle maps exactly that variant to a concurrency conflict.
//!
//! Backends do not enforce page alignment; the handle does. They do not retry.
//!
//! - `ObjectStorePageBackend`: emulates page blobs on any `object_store::ObjectStore` that
//!   supports `PutMode::Create` and `PutMode::Update`.

pub(crate) mod object_store;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Range;

pub use self::object_store::ObjectStorePageBackend;

/// Out-of-band attributes stored alongside a blob.
pub type BlobMetadata = BTreeMap<String, String>;

/// An opaque token issued by the backend that changes on every successful mutation of an
/// object. It is the fencing token for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionTag(String);

impl RevisionTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RevisionTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A snapshot of a blob's attributes as last fetched from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    /// Allocated capacity in bytes.
    pub size_bytes: u64,
    pub revision_tag: RevisionTag,
    pub metadata: BlobMetadata,
}

/// The operations a page blob service must provide.
///
/// Read operations accept an optional precondition; `None` reads the latest state. Mutating
/// operations always carry one. On success they return the object's new tag.
#[async_trait]
pub trait PageBlobBackend: Debug + Send + Sync {
    /// Lists blobs whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> ::object_store::Result<Vec<(String, BlobProperties)>>;

    /// Creates a zero-filled blob of `size_bytes`. Fails with
    /// `object_store::Error::AlreadyExists` if the key is taken.
    async fn create(&self, key: &str, size_bytes: u64) -> ::object_store::Result<BlobProperties>;

    /// Fetches the blob's attributes. Fails with `object_store::Error::NotFound` if the blob
    /// does not exist.
    async fn get_properties(
        &self,
        key: &str,
        condition: Option<&RevisionTag>,
    ) -> ::object_store::Result<BlobProperties>;

    /// Reads `range` from the blob. `range` is non-empty.
    async fn get_range(
        &self,
        key: &str,
        range: Range<u64>,
        condition: Option<&RevisionTag>,
    ) -> ::object_store::Result<Bytes>;

    /// Overwrites the pages starting at `offset` with `data`.
    async fn put_pages(
        &self,
        key: &str,
        offset: u64,
        data: Bytes,
        condition: &RevisionTag,
    ) -> ::object_store::Result<RevisionTag>;

    /// Changes the blob's capacity to `size_bytes`. New pages are zero-filled.
    async fn resize(
        &self,
        key: &str,
        size_bytes: u64,
        condition: &RevisionTag,
    ) -> ::object_store::Result<RevisionTag>;

    /// Replaces the blob's metadata.
    async fn set_metadata(
        &self,
        key: &str,
        metadata: &BlobMetadata,
        condition: &RevisionTag,
    ) -> ::object_store::Result<RevisionTag>;
}
