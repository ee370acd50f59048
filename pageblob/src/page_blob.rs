//! # Page Aligned Store
//!
//! `PageBlobStore` hands out `PageBlob` handles for keys in a namespace. A `PageBlob` is a
//! local view of one remote page blob: its key, the store's page size, and the attributes
//! (`size_bytes`, `revision_tag`, `metadata`) as of the last time this handle observed them.
//!
//! Every mutation is conditioned on the cached revision tag. If another writer changed the
//! blob since this handle last observed it, the backend rejects the mutation in full and
//! the handle reports [`ErrorKind::Conflict`](crate::ErrorKind::Conflict). The handle never
//! re-reads or retries on its own; that is the job of
//! [`ConflictRetryExecutor`](crate::retry::ConflictRetryExecutor).
//!
//! Alignment contract
//! ------------------
//! - `write` only accepts an offset and a length that are multiples of the page size.
//! - `read_range` accepts any byte range and requests the covering pages from the backend.
//! - `resize` rounds the requested size up to whole pages. It does not over-allocate.
//!
//! Keys
//! ----
//! Keys are `/`-separated and canonical: no empty segments, no leading or trailing `/`,
//! and no characters the object store would percent-encode. Any other key is rejected as
//! invalid, so two distinct keys never address the same blob.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use object_store::path::Path;

use crate::backend::{BlobMetadata, BlobProperties, PageBlobBackend, RevisionTag};
use crate::error::PageBlobError;
use crate::stats::{BlobStats, StatRegistry};
use crate::utils::{is_page_aligned, page_aligned_size, page_range_covering};

pub const DEFAULT_PAGE_SIZE: u64 = 512;

/// Creates and looks up page blobs that share one backend and one page size.
///
/// Cloning a store is cheap. Clones share the backend and the metrics registry.
#[derive(Debug, Clone)]
pub struct PageBlobStore {
    backend: Arc<dyn PageBlobBackend>,
    page_size: u64,
    stats: BlobStats,
    stat_registry: Arc<StatRegistry>,
}

/// Builder for [PageBlobStore].
pub struct PageBlobStoreBuilder {
    backend: Arc<dyn PageBlobBackend>,
    page_size: u64,
    stat_registry: Option<Arc<StatRegistry>>,
}

impl PageBlobStoreBuilder {
    pub fn new(backend: Arc<dyn PageBlobBackend>) -> Self {
        Self {
            backend,
            page_size: DEFAULT_PAGE_SIZE,
            stat_registry: None,
        }
    }

    /// Sets the page size. Every client of a namespace must use the same value.
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    /// Registers the store's counters in an existing registry instead of a new one.
    pub fn with_stat_registry(mut self, stat_registry: Arc<StatRegistry>) -> Self {
        self.stat_registry = Some(stat_registry);
        self
    }

    pub fn build(self) -> Result<PageBlobStore, crate::Error> {
        if self.page_size == 0 {
            return Err(PageBlobError::InvalidPageSize(self.page_size).into());
        }
        let stat_registry = self
            .stat_registry
            .unwrap_or_else(|| Arc::new(StatRegistry::new()));
        Ok(PageBlobStore {
            backend: self.backend,
            page_size: self.page_size,
            stats: BlobStats::new(&stat_registry),
            stat_registry,
        })
    }
}

impl PageBlobStore {
    pub fn builder(backend: Arc<dyn PageBlobBackend>) -> PageBlobStoreBuilder {
        PageBlobStoreBuilder::new(backend)
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Returns the registry holding this store's counters.
    pub fn metrics(&self) -> Arc<StatRegistry> {
        self.stat_registry.clone()
    }

    pub fn backend(&self) -> &Arc<dyn PageBlobBackend> {
        &self.backend
    }

    /// Returns a handle to the blob at `key`, creating it with `initial_page_count` zeroed
    /// pages if it does not exist yet. If another caller creates the blob between the
    /// existence check and the create, the existing blob is adopted.
    pub async fn create_if_absent(
        &self,
        key: &str,
        initial_page_count: u32,
    ) -> Result<PageBlob, crate::Error> {
        if initial_page_count == 0 {
            return Err(PageBlobError::InvalidInitialPageCount(initial_page_count).into());
        }
        let size_bytes = u64::from(initial_page_count)
            .checked_mul(self.page_size)
            .ok_or(PageBlobError::SizeOverflow {
                needed: u64::from(initial_page_count),
                page_size: self.page_size,
            })?;
        if let Some(blob) = self.get_existing(key).await? {
            return Ok(blob);
        }
        match self.backend.create(key, size_bytes).await {
            Ok(properties) => {
                debug!(
                    "created page blob [key={}, size_bytes={}, tag={}]",
                    key, size_bytes, properties.revision_tag
                );
                Ok(self.handle(key, properties))
            }
            Err(object_store::Error::AlreadyExists { .. }) => {
                debug!("page blob created concurrently, adopting it [key={}]", key);
                let properties = self
                    .backend
                    .get_properties(key, None)
                    .await
                    .map_err(|e| map_backend_error(key, &self.stats, e))?;
                Ok(self.handle(key, properties))
            }
            Err(e) => Err(map_backend_error(key, &self.stats, e).into()),
        }
    }

    /// Returns a handle to the blob at exactly `key`, or `None` if it does not exist.
    pub async fn get_existing(&self, key: &str) -> Result<Option<PageBlob>, crate::Error> {
        validate_key(key)?;
        match self.backend.get_properties(key, None).await {
            Ok(properties) => Ok(Some(self.handle(key, properties))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(map_backend_error(key, &self.stats, e).into()),
        }
    }

    /// Returns handles to every blob whose key starts with `prefix`, sorted by key.
    /// The prefix is a key, a partial final segment, or a key followed by `/`.
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<PageBlob>, crate::Error> {
        if !prefix.is_empty() {
            validate_key(prefix.strip_suffix('/').unwrap_or(prefix))?;
        }
        let items = self
            .backend
            .list(prefix)
            .await
            .map_err(|e| map_backend_error(prefix, &self.stats, e))?;
        Ok(items
            .into_iter()
            .map(|(key, properties)| self.handle(&key, properties))
            .collect())
    }

    fn handle(&self, key: &str, properties: BlobProperties) -> PageBlob {
        if !is_page_aligned(properties.size_bytes, self.page_size) {
            warn!(
                "blob size is not a multiple of the page size [key={}, size_bytes={}, page_size={}]",
                key, properties.size_bytes, self.page_size
            );
        }
        PageBlob {
            key: key.to_string(),
            page_size: self.page_size,
            properties,
            backend: self.backend.clone(),
            stats: self.stats.clone(),
        }
    }
}

/// A handle to one remote page blob with its last observed attributes.
#[derive(Debug)]
pub struct PageBlob {
    key: String,
    page_size: u64,
    properties: BlobProperties,
    backend: Arc<dyn PageBlobBackend>,
    stats: BlobStats,
}

impl PageBlob {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Returns the attributes as last observed by this handle. They may be stale.
    pub fn properties(&self) -> &BlobProperties {
        &self.properties
    }

    pub fn size_bytes(&self) -> u64 {
        self.properties.size_bytes
    }

    pub fn revision_tag(&self) -> &RevisionTag {
        &self.properties.revision_tag
    }

    pub fn metadata(&self) -> &BlobMetadata {
        &self.properties.metadata
    }

    /// Returns the backend this handle talks to.
    pub fn backend(&self) -> &Arc<dyn PageBlobBackend> {
        &self.backend
    }

    /// Re-fetches the blob's attributes.
    ///
    /// With `ignore_concurrency_check` unset, the fetch is conditioned on the cached tag and
    /// fails with a conflict if the blob changed. Otherwise the latest attributes are
    /// adopted whatever the tag.
    pub async fn refresh_attributes(
        &mut self,
        ignore_concurrency_check: bool,
    ) -> Result<&BlobProperties, crate::Error> {
        let condition = self.condition(ignore_concurrency_check);
        debug!(
            "refreshing attributes [key={}, condition={:?}]",
            self.key, condition
        );
        let properties = self
            .backend
            .get_properties(&self.key, condition)
            .await
            .map_err(|e| self.map_error(e))?;
        self.properties = properties;
        Ok(&self.properties)
    }

    /// Reads `end - start` bytes starting at `start`. The range need not be page aligned.
    pub async fn read_range(
        &self,
        start: u64,
        end: u64,
        ignore_concurrency_check: bool,
    ) -> Result<Bytes, crate::Error> {
        let size = self.properties.size_bytes;
        if start > end || end > size {
            return Err(PageBlobError::RangeOutOfBounds { start, end, size }.into());
        }
        let condition = self.condition(ignore_concurrency_check);
        if start == end {
            // nothing to read, but a checked read still has to observe a stale tag
            if condition.is_some() {
                self.backend
                    .get_properties(&self.key, condition)
                    .await
                    .map_err(|e| self.map_error(e))?;
            }
            return Ok(Bytes::new());
        }

        let pages = page_range_covering(&(start..end), self.page_size)
            .ok_or(PageBlobError::RangeOutOfBounds { start, end, size })?;
        debug!(
            "reading pages [key={}, start={}, end={}, pages={:?}, condition={:?}]",
            self.key, start, end, pages, condition
        );
        let bytes = self
            .backend
            .get_range(&self.key, pages.clone(), condition)
            .await
            .map_err(|e| self.map_error(e))?;
        let from = (start - pages.start) as usize;
        let to = (end - pages.start) as usize;
        if bytes.len() < to {
            return Err(PageBlobError::RangeOutOfBounds {
                start,
                end,
                size: pages.start + bytes.len() as u64,
            }
            .into());
        }
        Ok(bytes.slice(from..to))
    }

    /// Writes `data` at `start_offset`, conditioned on the cached tag. Both the offset and
    /// the length must be multiples of the page size and the write must fit in the blob.
    /// On success the cached tag advances to the blob's new tag.
    pub async fn write(&mut self, data: Bytes, start_offset: u64) -> Result<(), crate::Error> {
        let len = data.len() as u64;
        if !is_page_aligned(start_offset, self.page_size) || !is_page_aligned(len, self.page_size)
        {
            return Err(PageBlobError::UnalignedWrite {
                offset: start_offset,
                len,
                page_size: self.page_size,
            }
            .into());
        }
        let size = self.properties.size_bytes;
        let end = start_offset.saturating_add(len);
        if end > size {
            return Err(PageBlobError::RangeOutOfBounds {
                start: start_offset,
                end,
                size,
            }
            .into());
        }
        if data.is_empty() {
            return Ok(());
        }

        debug!(
            "writing pages [key={}, offset={}, len={}, tag={}]",
            self.key, start_offset, len, self.properties.revision_tag
        );
        let tag = self
            .backend
            .put_pages(&self.key, start_offset, data, &self.properties.revision_tag)
            .await
            .map_err(|e| self.map_error(e))?;
        self.stats.writes.inc();
        self.properties.revision_tag = tag;
        Ok(())
    }

    /// Grows the blob to hold at least `needed_size_bytes`, rounded up to whole pages.
    /// A blob is never shrunk; a request below the current size still issues a conditioned
    /// resize to the current size, so it fails with a conflict if the blob changed.
    pub async fn resize(&mut self, needed_size_bytes: u64) -> Result<(), crate::Error> {
        let target = page_aligned_size(needed_size_bytes, self.page_size)
            .ok_or(PageBlobError::SizeOverflow {
                needed: needed_size_bytes,
                page_size: self.page_size,
            })?
            .max(self.properties.size_bytes);
        debug!(
            "resizing blob [key={}, from={}, to={}, tag={}]",
            self.key, self.properties.size_bytes, target, self.properties.revision_tag
        );
        let tag = self
            .backend
            .resize(&self.key, target, &self.properties.revision_tag)
            .await
            .map_err(|e| self.map_error(e))?;
        self.stats.resizes.inc();
        self.properties.size_bytes = target;
        self.properties.revision_tag = tag;
        Ok(())
    }

    /// Replaces the blob's metadata, conditioned on the cached tag.
    pub async fn set_metadata(&mut self, metadata: BlobMetadata) -> Result<(), crate::Error> {
        debug!(
            "setting metadata [key={}, entries={}, tag={}]",
            self.key,
            metadata.len(),
            self.properties.revision_tag
        );
        let tag = self
            .backend
            .set_metadata(&self.key, &metadata, &self.properties.revision_tag)
            .await
            .map_err(|e| self.map_error(e))?;
        self.properties.metadata = metadata;
        self.properties.revision_tag = tag;
        Ok(())
    }

    pub(crate) fn stats(&self) -> &BlobStats {
        &self.stats
    }

    fn condition(&self, ignore_concurrency_check: bool) -> Option<&RevisionTag> {
        if ignore_concurrency_check {
            None
        } else {
            Some(&self.properties.revision_tag)
        }
    }

    fn map_error(&self, err: object_store::Error) -> PageBlobError {
        map_backend_error(&self.key, &self.stats, err)
    }
}

/// Rejects keys the object store would normalize or percent-encode.
fn validate_key(key: &str) -> Result<(), PageBlobError> {
    let invalid = |reason: String| PageBlobError::InvalidKey {
        key: key.to_string(),
        reason,
    };
    if key.is_empty() {
        return Err(invalid("key is empty".to_string()));
    }
    Path::parse(key).map_err(|e| invalid(e.to_string()))?;
    let canonical = Path::from(key);
    if canonical.as_ref() != key {
        return Err(invalid(format!(
            "key is not canonical, it would be stored as `{}`",
            canonical
        )));
    }
    Ok(())
}

/// Maps a backend failure to a domain error. Exactly `Precondition` becomes a conflict.
fn map_backend_error(key: &str, stats: &BlobStats, err: object_store::Error) -> PageBlobError {
    match err {
        err @ object_store::Error::Precondition { .. } => {
            stats.conflicts.inc();
            debug!("precondition failed [key={}]", key);
            PageBlobError::PreconditionFailed {
                key: key.to_string(),
                source: Arc::new(err),
            }
        }
        err @ object_store::Error::NotFound { .. } => PageBlobError::ObjectNotFound {
            key: key.to_string(),
            source: Arc::new(err),
        },
        err => PageBlobError::ObjectStoreError(Arc::new(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ObjectStorePageBackend;
    use crate::stats::{BLOB_CONFLICTS, BLOB_RESIZES, BLOB_WRITES};
    use crate::test_utils::{BackendOp, FaultInjectingBackend, InjectedFault};
    use crate::ErrorKind;
    use object_store::memory::InMemory;
    use object_store::path::Path;
    use object_store::ObjectStore;
    use proptest::prelude::*;
    use rstest::rstest;

    fn new_store(page_size: u64) -> PageBlobStore {
        let backend = Arc::new(ObjectStorePageBackend::new(
            &Path::from("/root"),
            Arc::new(InMemory::new()),
        ));
        PageBlobStore::builder(backend)
            .with_page_size(page_size)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_rejects_zero_page_size() {
        let backend = Arc::new(ObjectStorePageBackend::new(
            &Path::from("/root"),
            Arc::new(InMemory::new()),
        ));
        let err = PageBlobStore::builder(backend)
            .with_page_size(0)
            .build()
            .unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
    }

    #[tokio::test]
    async fn test_create_if_absent_allocates_initial_pages() {
        let store = new_store(512);
        let blob = store.create_if_absent("streams/a", 10).await.unwrap();
        assert_eq!("streams/a", blob.key());
        assert_eq!(5120, blob.size_bytes());

        // second call adopts the existing blob
        let again = store.create_if_absent("streams/a", 3).await.unwrap();
        assert_eq!(5120, again.size_bytes());
        assert_eq!(blob.revision_tag(), again.revision_tag());
    }

    #[tokio::test]
    async fn test_create_if_absent_adopts_concurrently_created_blob() {
        let inner = Arc::new(ObjectStorePageBackend::new(
            &Path::from("/root"),
            Arc::new(InMemory::new()),
        ));
        let created = inner.create("streams/a", 1024).await.unwrap();
        let backend = Arc::new(FaultInjectingBackend::new(inner));
        // the existence check misses the blob, so the create races with the other caller
        backend.inject(BackendOp::GetProperties, InjectedFault::NotFound);
        let store = PageBlobStore::builder(backend.clone()).build().unwrap();

        let blob = store.create_if_absent("streams/a", 1).await.unwrap();
        assert_eq!(1024, blob.size_bytes());
        assert_eq!(&created.revision_tag, blob.revision_tag());
        assert_eq!(1, backend.calls(BackendOp::Create));
        assert_eq!(2, backend.calls(BackendOp::GetProperties));
    }

    #[tokio::test]
    async fn test_create_if_absent_rejects_zero_pages() {
        let store = new_store(512);
        let err = store.create_if_absent("streams/a", 0).await.unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
    }

    #[tokio::test]
    async fn test_get_existing_and_list_prefix() {
        let store = new_store(512);
        assert!(store.get_existing("streams/a").await.unwrap().is_none());
        assert!(store.list_prefix("streams/").await.unwrap().is_empty());

        store.create_if_absent("streams/a", 1).await.unwrap();
        store.create_if_absent("streams/b", 2).await.unwrap();
        store.create_if_absent("other/c", 1).await.unwrap();

        let blob = store.get_existing("streams/b").await.unwrap().unwrap();
        assert_eq!(1024, blob.size_bytes());
        let keys: Vec<String> = store
            .list_prefix("streams/")
            .await
            .unwrap()
            .iter()
            .map(|blob| blob.key().to_string())
            .collect();
        assert_eq!(vec!["streams/a", "streams/b"], keys);
    }

    #[tokio::test]
    async fn test_write_then_read_returns_same_bytes() {
        let store = new_store(512);
        let mut blob = store.create_if_absent("streams/a", 4).await.unwrap();
        let data = Bytes::from((0..1024).map(|i| (i % 251) as u8).collect::<Vec<u8>>());

        blob.write(data.clone(), 512).await.unwrap();

        assert_eq!(data, blob.read_range(512, 1536, false).await.unwrap());
        // unaligned reads slice the covering pages
        assert_eq!(
            data.slice(10..600),
            blob.read_range(522, 1112, false).await.unwrap()
        );
        assert_eq!(
            Bytes::from(vec![0u8; 12]),
            blob.read_range(500, 512, false).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_write_advances_cached_tag() {
        let store = new_store(512);
        let mut blob = store.create_if_absent("streams/a", 1).await.unwrap();
        let before = blob.revision_tag().clone();
        blob.write(Bytes::from(vec![1u8; 512]), 0).await.unwrap();
        assert_ne!(&before, blob.revision_tag());

        // the handle can keep writing on its own tag
        blob.write(Bytes::from(vec![2u8; 512]), 0).await.unwrap();
        let latest = store.get_existing("streams/a").await.unwrap().unwrap();
        assert_eq!(latest.revision_tag(), blob.revision_tag());
        assert_eq!(2, store.metrics().lookup(BLOB_WRITES).unwrap().get());
    }

    #[tokio::test]
    async fn test_two_writers_on_same_tag_one_conflicts() {
        let store = new_store(512);
        store.create_if_absent("streams/a", 2).await.unwrap();
        let mut first = store.get_existing("streams/a").await.unwrap().unwrap();
        let mut second = store.get_existing("streams/a").await.unwrap().unwrap();
        assert_eq!(first.revision_tag(), second.revision_tag());

        first.write(Bytes::from(vec![1u8; 512]), 0).await.unwrap();
        let err = second
            .write(Bytes::from(vec![2u8; 512]), 512)
            .await
            .unwrap_err();

        assert_eq!(ErrorKind::Conflict, err.kind());
        assert!(err.is_conflict());
        assert_eq!(1, store.metrics().lookup(BLOB_CONFLICTS).unwrap().get());
        // the losing write left no trace
        let bytes = first.read_range(512, 1024, false).await.unwrap();
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_unaligned_write_then_resize_and_padded_write() {
        let store = new_store(512);
        let mut blob = store.create_if_absent("streams/a", 1).await.unwrap();

        let err = blob
            .write(Bytes::from(vec![9u8; 600]), 0)
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());

        blob.resize(600).await.unwrap();
        assert_eq!(1024, blob.size_bytes());

        let mut padded = vec![9u8; 600];
        padded.resize(1024, 0);
        blob.write(Bytes::from(padded), 0).await.unwrap();
        assert_eq!(1024, blob.size_bytes());

        let remote = store.get_existing("streams/a").await.unwrap().unwrap();
        assert_eq!(1024, remote.size_bytes());
        assert_eq!(1, store.metrics().lookup(BLOB_RESIZES).unwrap().get());
    }

    #[rstest]
    #[case(0, 2048)]
    #[case(512, 1024)]
    #[case(1536, 1024)]
    #[tokio::test]
    async fn test_write_past_end_is_invalid(#[case] offset: u64, #[case] len: usize) {
        let store = new_store(512);
        let mut blob = store.create_if_absent("streams/a", 2).await.unwrap();
        let err = blob
            .write(Bytes::from(vec![1u8; len]), offset)
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
    }

    #[rstest]
    #[case(0, 1025)]
    #[case(600, 500)]
    #[tokio::test]
    async fn test_read_out_of_bounds_is_invalid(#[case] start: u64, #[case] end: u64) {
        let store = new_store(512);
        let blob = store.create_if_absent("streams/a", 2).await.unwrap();
        let err = blob.read_range(start, end, true).await.unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
    }

    #[tokio::test]
    async fn test_resize_never_shrinks() {
        let store = new_store(512);
        let mut blob = store.create_if_absent("streams/a", 4).await.unwrap();
        blob.resize(100).await.unwrap();
        assert_eq!(2048, blob.size_bytes());
        blob.resize(2049).await.unwrap();
        assert_eq!(2560, blob.size_bytes());
    }

    #[tokio::test]
    async fn test_stale_handle_sees_conflict_on_checked_operations() {
        let store = new_store(512);
        let mut writer = store.create_if_absent("streams/a", 1).await.unwrap();
        let mut stale = store.get_existing("streams/a").await.unwrap().unwrap();
        writer.resize(1024).await.unwrap();

        let err = stale.read_range(0, 512, false).await.unwrap_err();
        assert_eq!(ErrorKind::Conflict, err.kind());
        let err = stale.read_range(0, 0, false).await.unwrap_err();
        assert_eq!(ErrorKind::Conflict, err.kind());
        let err = stale.resize(2048).await.unwrap_err();
        assert_eq!(ErrorKind::Conflict, err.kind());
        let err = stale.refresh_attributes(false).await.unwrap_err();
        assert_eq!(ErrorKind::Conflict, err.kind());

        // an unchecked read still succeeds against the latest state
        assert_eq!(512, stale.read_range(0, 512, true).await.unwrap().len());

        let properties = stale.refresh_attributes(true).await.unwrap();
        assert_eq!(1024, properties.size_bytes);
        assert_eq!(writer.revision_tag(), stale.revision_tag());
        stale.write(Bytes::from(vec![3u8; 512]), 512).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_metadata_replaces_map_and_is_conditioned() {
        let store = new_store(512);
        let mut blob = store.create_if_absent("streams/a", 1).await.unwrap();
        let mut stale = store.get_existing("streams/a").await.unwrap().unwrap();
        let metadata = BlobMetadata::from([("owner".to_string(), "orders".to_string())]);

        blob.set_metadata(metadata.clone()).await.unwrap();
        assert_eq!(&metadata, blob.metadata());

        let err = stale.set_metadata(BlobMetadata::new()).await.unwrap_err();
        assert_eq!(ErrorKind::Conflict, err.kind());

        let remote = store.get_existing("streams/a").await.unwrap().unwrap();
        assert_eq!(&metadata, remote.metadata());
    }

    #[tokio::test]
    async fn test_backend_failures_are_not_conflicts() {
        let inner = Arc::new(ObjectStorePageBackend::new(
            &Path::from("/root"),
            Arc::new(InMemory::new()),
        ));
        let backend = Arc::new(FaultInjectingBackend::new(inner));
        let store = PageBlobStore::builder(backend.clone()).build().unwrap();
        let mut blob = store.create_if_absent("streams/a", 1).await.unwrap();

        backend.inject(BackendOp::PutPages, InjectedFault::Unavailable);
        let err = blob.write(Bytes::from(vec![1u8; 512]), 0).await.unwrap_err();
        assert_eq!(ErrorKind::Unavailable, err.kind());
        assert!(std::error::Error::source(&err).is_some());

        backend.inject(BackendOp::GetProperties, InjectedFault::Unavailable);
        let err = store.get_existing("streams/a").await.unwrap_err();
        assert_eq!(ErrorKind::Unavailable, err.kind());

        // the failed write did not advance the tag
        blob.write(Bytes::from(vec![1u8; 512]), 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_deleted_blob_is_not_found() {
        let memory = Arc::new(InMemory::new());
        let backend = Arc::new(ObjectStorePageBackend::new(
            &Path::from("/root"),
            memory.clone(),
        ));
        let store = PageBlobStore::builder(backend).build().unwrap();
        let mut blob = store.create_if_absent("streams/a", 1).await.unwrap();
        memory
            .delete(&Path::from("/root/streams/a"))
            .await
            .unwrap();

        let err = blob.refresh_attributes(true).await.unwrap_err();
        assert_eq!(ErrorKind::NotFound, err.kind());
    }

    #[rstest]
    #[case("")]
    #[case("streams//a")]
    #[case("/streams/a")]
    #[case("streams/a/")]
    #[case("streams/order#1")]
    #[case("streams/100%")]
    #[case("streams/./a")]
    #[tokio::test]
    async fn test_non_canonical_keys_are_invalid(#[case] key: &str) {
        let store = new_store(512);
        let err = store.create_if_absent(key, 1).await.unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
        let err = store.get_existing(key).await.unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
        assert!(store.list_prefix("streams/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_alias_of_existing_key_is_invalid() {
        let store = new_store(512);
        store.create_if_absent("streams/a", 2).await.unwrap();

        let err = store.get_existing("streams//a/").await.unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
        let err = store.list_prefix("streams//").await.unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
    }

    #[tokio::test]
    async fn test_listed_keys_resolve_with_get_existing() {
        let store = new_store(512);
        store.create_if_absent("streams/order-1", 1).await.unwrap();
        store.create_if_absent("streams/order_2.v1", 2).await.unwrap();

        let listed = store.list_prefix("streams/").await.unwrap();
        assert_eq!(2, listed.len());
        for blob in listed {
            let existing = store.get_existing(blob.key()).await.unwrap().unwrap();
            assert_eq!(blob.size_bytes(), existing.size_bytes());
            assert_eq!(blob.revision_tag(), existing.revision_tag());
        }
    }

    #[tokio::test]
    async fn test_create_failure_is_unavailable_and_not_adopted() {
        let inner = Arc::new(ObjectStorePageBackend::new(
            &Path::from("/root"),
            Arc::new(InMemory::new()),
        ));
        let backend = Arc::new(FaultInjectingBackend::new(inner));
        let store = PageBlobStore::builder(backend.clone()).build().unwrap();

        backend.inject(BackendOp::Create, InjectedFault::Unavailable);
        let err = store.create_if_absent("streams/a", 1).await.unwrap_err();

        assert_eq!(ErrorKind::Unavailable, err.kind());
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("injected unavailable"));
        assert_eq!(1, backend.calls(BackendOp::Create));
        // only the existence check ran, the adopt path was not taken
        assert_eq!(1, backend.calls(BackendOp::GetProperties));
        assert!(store.get_existing("streams/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sizes_past_u64_are_invalid() {
        let store = new_store(512);
        let mut blob = store.create_if_absent("streams/a", 1).await.unwrap();
        let tag = blob.revision_tag().clone();

        let err = blob.resize(u64::MAX).await.unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
        assert_eq!(512, blob.size_bytes());
        assert_eq!(&tag, blob.revision_tag());
        assert_eq!(0, store.metrics().lookup(BLOB_RESIZES).unwrap().get());

        let huge_pages = new_store(u64::MAX / 2);
        let err = huge_pages.create_if_absent("streams/b", 3).await.unwrap_err();
        assert_eq!(ErrorKind::Invalid, err.kind());
    }

    proptest! {
        #[test]
        fn test_writes_accepted_iff_page_aligned(
            offset in 0u64..1024,
            len in 0usize..1024,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let result = runtime.block_on(async {
                let store = new_store(64);
                let mut blob = store.create_if_absent("streams/a", 64).await.unwrap();
                blob.write(Bytes::from(vec![1u8; len]), offset).await
            });
            let aligned = offset % 64 == 0 && len % 64 == 0;
            prop_assert_eq!(aligned, result.is_ok());
            if let Err(err) = result {
                prop_assert_eq!(ErrorKind::Invalid, err.kind());
            }
        }

        #[test]
        fn test_resize_allocates_smallest_covering_multiple(
            page_size in 1u64..2048,
            needed in 0u64..100_000,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let size = runtime.block_on(async {
                let store = new_store(page_size);
                let mut blob = store.create_if_absent("streams/a", 1).await.unwrap();
                blob.resize(needed).await.unwrap();
                blob.size_bytes()
            });
            prop_assert_eq!(0, size % page_size);
            prop_assert!(size >= needed);
            prop_assert!(size < needed.max(page_size) + page_size);
        }
    }
}
