use crate::backend::{BlobMetadata, BlobProperties, PageBlobBackend, RevisionTag};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use log::{debug, warn};
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, Error, GetOptions, GetRange, GetResult, ObjectStore,
    PutMode, PutOptions, PutPayload, UpdateVersion,
};
use std::borrow::Cow;
use std::ops::Range;
use std::sync::Arc;

const STORE_NAME: &str = "ObjectStorePageBackend";

/// Implements `PageBlobBackend` on object storage.
///
/// Layout
/// ------
/// - Blobs are stored under a root directory provided at construction time. A blob's key is
///   its path relative to that root.
/// - The object holds the blob's full capacity, so the object size is the blob size and
///   unwritten pages read back as zeros.
/// - The object's e-tag is the revision tag. Blob metadata is stored as object attributes.
///
/// Object stores have no partial writes, so page writes, resizes, and metadata updates are
/// a read of the whole object conditioned on the caller's tag, followed by a
/// `PutMode::Update` conditioned on the same e-tag. A concurrent writer between the two
/// calls makes the put fail with `Precondition`, which is the same outcome as a conflicting
/// page write on a native page blob service.
///
/// The store must support conditional puts. `InMemory`, S3 with conditional put enabled,
/// Azure and GCS do; `LocalFileSystem` does not.
#[derive(Debug)]
pub struct ObjectStorePageBackend {
    object_store: Box<dyn ObjectStore>,
}

impl ObjectStorePageBackend {
    pub fn new(root_path: &Path, object_store: Arc<dyn ObjectStore>) -> Self {
        Self {
            object_store: Box::new(::object_store::prefix::PrefixStore::new(
                object_store,
                root_path.clone(),
            )),
        }
    }

    fn tag_of(key: &str, e_tag: Option<String>) -> object_store::Result<RevisionTag> {
        e_tag.map(RevisionTag::new).ok_or_else(|| Error::NotSupported {
            source: format!("object store returned no e-tag [key={}]", key).into(),
        })
    }

    fn metadata_of(attributes: &Attributes) -> BlobMetadata {
        attributes
            .iter()
            .filter_map(|(attribute, value)| match attribute {
                Attribute::Metadata(name) => Some((name.to_string(), value.to_string())),
                _ => None,
            })
            .collect()
    }

    fn attributes_of(metadata: &BlobMetadata) -> Attributes {
        let mut attributes = Attributes::new();
        for (name, value) in metadata {
            attributes.insert(
                Attribute::Metadata(Cow::Owned(name.clone())),
                AttributeValue::from(value.clone()),
            );
        }
        attributes
    }

    fn properties_of(key: &str, result: &GetResult) -> object_store::Result<BlobProperties> {
        Ok(BlobProperties {
            size_bytes: result.meta.size,
            revision_tag: Self::tag_of(key, result.meta.e_tag.clone())?,
            metadata: Self::metadata_of(&result.attributes),
        })
    }

    async fn get(
        &self,
        location: &Path,
        condition: Option<&RevisionTag>,
        head: bool,
        range: Option<Range<u64>>,
    ) -> object_store::Result<GetResult> {
        let options = GetOptions {
            if_match: condition.map(|tag| tag.to_string()),
            range: range.map(GetRange::Bounded),
            head,
            ..Default::default()
        };
        self.object_store.get_opts(location, options).await
    }

    /// Reads the whole object conditioned on `condition`, applies `mutate` to its bytes and
    /// attributes, and writes it back conditioned on the e-tag that was read.
    async fn read_modify_write<F>(
        &self,
        key: &str,
        condition: &RevisionTag,
        mutate: F,
    ) -> object_store::Result<RevisionTag>
    where
        F: FnOnce(&mut BytesMut, &mut Attributes) -> object_store::Result<()> + Send,
    {
        let current = self
            .get(&Path::from(key), Some(condition), false, None)
            .await?;
        let version = UpdateVersion {
            e_tag: current.meta.e_tag.clone(),
            version: current.meta.version.clone(),
        };
        let mut attributes = current.attributes.clone();
        let mut content = BytesMut::from(current.bytes().await?.as_ref());
        mutate(&mut content, &mut attributes)?;
        let options = PutOptions {
            mode: PutMode::Update(version),
            attributes,
            ..Default::default()
        };
        let result = self
            .object_store
            .put_opts(
                &Path::from(key),
                PutPayload::from_bytes(content.freeze()),
                options,
            )
            .await?;
        Self::tag_of(key, result.e_tag)
    }
}

#[async_trait]
impl PageBlobBackend for ObjectStorePageBackend {
    async fn list(&self, prefix: &str) -> object_store::Result<Vec<(String, BlobProperties)>> {
        // object store prefixes match whole path segments, so list the enclosing directory
        // and filter on the raw key prefix
        let directory = prefix.rsplit_once('/').map(|(dir, _)| Path::from(dir));
        let mut files_stream = self.object_store.list(directory.as_ref());
        let mut locations = Vec::new();
        while let Some(file) = files_stream.next().await.transpose()? {
            if file.location.as_ref().starts_with(prefix) {
                locations.push(file.location);
            }
        }
        locations.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));

        // fetch by the listed location, the key string is its encoded form
        let mut items = Vec::with_capacity(locations.len());
        for location in locations {
            let key = location.to_string();
            let properties = self
                .get(&location, None, true, None)
                .await
                .and_then(|result| Self::properties_of(&key, &result));
            match properties {
                Ok(properties) => items.push((key, properties)),
                Err(Error::NotFound { .. }) => {
                    warn!("listed blob missing on read, skipping [key={}]", key)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(items)
    }

    async fn create(&self, key: &str, size_bytes: u64) -> object_store::Result<BlobProperties> {
        debug!("creating blob [key={}, size_bytes={}]", key, size_bytes);
        let payload = PutPayload::from_bytes(Bytes::from(vec![0u8; size_bytes as usize]));
        let result = self
            .object_store
            .put_opts(&Path::from(key), payload, PutOptions::from(PutMode::Create))
            .await?;
        Ok(BlobProperties {
            size_bytes,
            revision_tag: Self::tag_of(key, result.e_tag)?,
            metadata: BlobMetadata::new(),
        })
    }

    async fn get_properties(
        &self,
        key: &str,
        condition: Option<&RevisionTag>,
    ) -> object_store::Result<BlobProperties> {
        let result = self.get(&Path::from(key), condition, true, None).await?;
        Self::properties_of(key, &result)
    }

    async fn get_range(
        &self,
        key: &str,
        range: Range<u64>,
        condition: Option<&RevisionTag>,
    ) -> object_store::Result<Bytes> {
        self.get(&Path::from(key), condition, false, Some(range))
            .await?
            .bytes()
            .await
    }

    async fn put_pages(
        &self,
        key: &str,
        offset: u64,
        data: Bytes,
        condition: &RevisionTag,
    ) -> object_store::Result<RevisionTag> {
        self.read_modify_write(key, condition, |content, _| {
            let start = offset as usize;
            let end = start + data.len();
            if end > content.len() {
                return Err(Error::Generic {
                    store: STORE_NAME,
                    source: format!(
                        "page write past end of blob [key={}, end={}, size={}]",
                        key,
                        end,
                        content.len()
                    )
                    .into(),
                });
            }
            content[start..end].copy_from_slice(&data);
            Ok(())
        })
        .await
    }

    async fn resize(
        &self,
        key: &str,
        size_bytes: u64,
        condition: &RevisionTag,
    ) -> object_store::Result<RevisionTag> {
        self.read_modify_write(key, condition, |content, _| {
            content.resize(size_bytes as usize, 0);
            Ok(())
        })
        .await
    }

    async fn set_metadata(
        &self,
        key: &str,
        metadata: &BlobMetadata,
        condition: &RevisionTag,
    ) -> object_store::Result<RevisionTag> {
        let replacement = Self::attributes_of(metadata);
        self.read_modify_write(key, condition, move |_, attributes| {
            let mut merged = Attributes::new();
            for (attribute, value) in attributes.iter() {
                if !matches!(attribute, Attribute::Metadata(_)) {
                    merged.insert(attribute.clone(), value.clone());
                }
            }
            for (attribute, value) in replacement.iter() {
                merged.insert(attribute.clone(), value.clone());
            }
            *attributes = merged;
            Ok(())
        })
        .await
    }
}
