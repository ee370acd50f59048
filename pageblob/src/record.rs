//! # Record Store
//!
//! Stores one serialized value per stream in its own page blob and updates it with the
//! conflict retry loop.
//!
//! Frame layout
//! ------------
//! ```text
//! +----------------------+-------------------+-----------------+
//! | payload length (u64) | payload           | zero padding    |
//! | little endian        | codec output      | to a whole page |
//! +----------------------+-------------------+-----------------+
//! ```
//!
//! - The frame always starts at offset 0 and is written with a single conditioned page
//!   write, so a record is replaced atomically or not at all.
//! - A blob that was never written is all zeros and decodes as an empty record.
//! - When a frame does not fit, the blob is grown to at least `growth_factor` times its
//!   current size before the write. The resize and the write are both conditioned on the
//!   revision observed by the load, so a concurrent writer turns either into a conflict.
//! - After a successful write the payload length is mirrored into the blob's metadata
//!   under [CONTENT_LENGTH_METADATA] for inspection. The frame header is authoritative.

use std::fmt::Debug;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::{BlobMetadata, PageBlobBackend};
use crate::clock::DefaultSystemClock;
use crate::config::Settings;
use crate::error::PageBlobError;
use crate::page_blob::{PageBlob, PageBlobStore};
use crate::rand::BlobRand;
use crate::retry::{ConflictRetryExecutor, VersionedResource};
use crate::utils::{grown_size, page_aligned_size};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Size of the frame header holding the payload length.
pub const FRAME_HEADER_LEN: u64 = 8;

/// Metadata key mirroring the committed payload length.
pub const CONTENT_LENGTH_METADATA: &str = "pageblobcontentlength";

/// Serializes and deserializes record values.
pub trait ObjectCodec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Bytes, BoxError>;
    fn decode(&self, bytes: &Bytes) -> Result<T, BoxError>;
}

/// Encodes values as JSON with `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<T: Serialize + DeserializeOwned> ObjectCodec<T> for JsonCodec {
    fn encode(&self, value: &T) -> Result<Bytes, BoxError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, bytes: &Bytes) -> Result<T, BoxError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Maps stream ids to blob keys.
pub trait KeyResolver: Debug + Send + Sync {
    fn key_for(&self, stream_id: &str) -> String;

    /// The key prefix shared by every stream this resolver produces.
    fn prefix(&self) -> String;
}

/// Places every stream under `<prefix>/<stream_id>`.
#[derive(Debug, Clone)]
pub struct PrefixKeyResolver {
    prefix: String,
}

impl PrefixKeyResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }
}

impl KeyResolver for PrefixKeyResolver {
    fn key_for(&self, stream_id: &str) -> String {
        format!("{}/{}", self.prefix, stream_id)
    }

    fn prefix(&self) -> String {
        format!("{}/", self.prefix)
    }
}

fn encode_frame(payload: &[u8], page_size: u64) -> Result<Bytes, PageBlobError> {
    let overflow = || PageBlobError::SizeOverflow {
        needed: payload.len() as u64,
        page_size,
    };
    let frame_len = FRAME_HEADER_LEN
        .checked_add(payload.len() as u64)
        .ok_or_else(overflow)?;
    let padded_len = page_aligned_size(frame_len, page_size).ok_or_else(overflow)? as usize;
    let mut frame = BytesMut::with_capacity(padded_len);
    frame.put_u64_le(payload.len() as u64);
    frame.put_slice(payload);
    frame.resize(padded_len, 0);
    Ok(frame.freeze())
}

/// One stream's value, stored as a frame in a page blob.
pub struct PageRecord<T> {
    blob: PageBlob,
    codec: Arc<dyn ObjectCodec<T>>,
    growth_factor: f64,
}

impl<T: Send + Sync> PageRecord<T> {
    pub fn new(blob: PageBlob, codec: Arc<dyn ObjectCodec<T>>, growth_factor: f64) -> Self {
        Self {
            blob,
            codec,
            growth_factor,
        }
    }

    pub fn blob(&self) -> &PageBlob {
        &self.blob
    }

    async fn read_payload(&self) -> Result<Bytes, crate::Error> {
        let size = self.blob.size_bytes();
        if size < FRAME_HEADER_LEN {
            return Ok(Bytes::new());
        }
        // the first page usually holds the whole frame
        let first_end = self.blob.page_size().max(FRAME_HEADER_LEN).min(size);
        let mut head = self.blob.read_range(0, first_end, false).await?;
        let payload_len = head.get_u64_le();
        let frame_end = FRAME_HEADER_LEN.saturating_add(payload_len);
        if frame_end > size {
            return Err(PageBlobError::InvalidFrame {
                key: self.blob.key().to_string(),
                reason: format!("payload length {payload_len} exceeds blob size {size}"),
            }
            .into());
        }
        if frame_end <= first_end {
            return Ok(head.slice(..payload_len as usize));
        }
        let rest = self.blob.read_range(first_end, frame_end, false).await?;
        let mut payload = BytesMut::with_capacity(payload_len as usize);
        payload.extend_from_slice(&head);
        payload.extend_from_slice(&rest);
        Ok(payload.freeze())
    }

    async fn mirror_content_length(&mut self, payload_len: usize) {
        let value = payload_len.to_string();
        if self.blob.metadata().get(CONTENT_LENGTH_METADATA) == Some(&value) {
            return;
        }
        let mut metadata: BlobMetadata = self.blob.metadata().clone();
        metadata.insert(CONTENT_LENGTH_METADATA.to_string(), value);
        // the frame is already committed, so a failure here must not fail the update
        match self.blob.set_metadata(metadata).await {
            Ok(()) => {}
            // a later writer mirrors its own length
            Err(e) if e.is_conflict() => debug!(
                "record changed before its content length was mirrored [key={}]",
                self.blob.key()
            ),
            Err(e) => {
                self.blob.stats().mirror_failures.inc();
                warn!(
                    "failed to mirror content length to metadata [key={}, error={}]",
                    self.blob.key(),
                    e
                );
            }
        }
    }
}

#[async_trait::async_trait]
impl<T: Send + Sync> VersionedResource for PageRecord<T> {
    type Value = Option<T>;

    async fn load(&mut self) -> Result<Option<T>, crate::Error> {
        self.blob.refresh_attributes(true).await?;
        let payload = self.read_payload().await?;
        if payload.is_empty() {
            return Ok(None);
        }
        let value = self
            .codec
            .decode(&payload)
            .map_err(|e| PageBlobError::InvalidFrame {
                key: self.blob.key().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Some(value))
    }

    async fn store(&mut self, value: &Option<T>) -> Result<(), crate::Error> {
        let payload = match value {
            Some(value) => self
                .codec
                .encode(value)
                .map_err(PageBlobError::CallbackError)?,
            None => Bytes::new(),
        };
        let frame = encode_frame(&payload, self.blob.page_size())?;
        let size = self.blob.size_bytes();
        let frame_len = frame.len() as u64;
        if frame_len > size {
            let needed = grown_size(size, frame_len, self.growth_factor);
            debug!(
                "record outgrew its blob [key={}, size={}, frame_len={}, needed={}]",
                self.blob.key(),
                size,
                frame_len,
                needed
            );
            self.blob.resize(needed).await?;
        }
        self.blob.write(frame, 0).await?;
        self.mirror_content_length(payload.len()).await;
        Ok(())
    }
}

/// Keeps one value per stream and applies updates with optimistic concurrency.
pub struct RecordStore<T> {
    store: PageBlobStore,
    codec: Arc<dyn ObjectCodec<T>>,
    resolver: Arc<dyn KeyResolver>,
    executor: ConflictRetryExecutor,
    initial_page_count: u32,
    growth_factor: f64,
}

impl<T: Send + Sync + 'static> RecordStore<T> {
    pub fn new(
        store: PageBlobStore,
        codec: Arc<dyn ObjectCodec<T>>,
        resolver: Arc<dyn KeyResolver>,
        executor: ConflictRetryExecutor,
        initial_page_count: u32,
        growth_factor: f64,
    ) -> Result<Self, crate::Error> {
        if initial_page_count == 0 {
            return Err(PageBlobError::InvalidInitialPageCount(initial_page_count).into());
        }
        if growth_factor.is_nan() || growth_factor < 1.0 {
            return Err(PageBlobError::InvalidGrowthFactor(growth_factor).into());
        }
        Ok(Self {
            store,
            codec,
            resolver,
            executor,
            initial_page_count,
            growth_factor,
        })
    }

    /// Builds a record store and everything under it from `settings`.
    pub fn from_settings(
        backend: Arc<dyn PageBlobBackend>,
        settings: &Settings,
        codec: Arc<dyn ObjectCodec<T>>,
        resolver: Arc<dyn KeyResolver>,
    ) -> Result<Self, crate::Error> {
        settings.validate()?;
        let store = PageBlobStore::builder(backend)
            .with_page_size(settings.page_size)
            .build()?;
        let executor = ConflictRetryExecutor::from_settings(
            &settings.retry,
            Arc::new(BlobRand::default()),
            Arc::new(DefaultSystemClock::new()),
            &store.metrics(),
        )?;
        Self::new(
            store,
            codec,
            resolver,
            executor,
            settings.initial_page_count,
            settings.growth_factor,
        )
    }

    pub fn page_store(&self) -> &PageBlobStore {
        &self.store
    }

    /// Applies `mutate` to the stream's current value, `None` if it was never written, and
    /// stores the result. Creates the stream's blob on first use. Conflicting writers are
    /// retried, so `mutate` may run more than once.
    pub async fn update<F, E>(&self, stream_id: &str, mut mutate: F) -> Result<T, crate::Error>
    where
        F: FnMut(Option<T>) -> Result<T, E> + Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        let key = self.resolver.key_for(stream_id);
        let blob = self
            .store
            .create_if_absent(&key, self.initial_page_count)
            .await?;
        let mut record = PageRecord::new(blob, self.codec.clone(), self.growth_factor);
        let value = self
            .executor
            .run_with_retry(&mut record, |current| mutate(current).map(Some))
            .await?;
        value.ok_or_else(|| crate::Error::internal(format!("update stored no value [key={key}]")))
    }

    /// Returns the stream's latest value, or `None` if it does not exist or was never
    /// written.
    pub async fn read(&self, stream_id: &str) -> Result<Option<T>, crate::Error> {
        let key = self.resolver.key_for(stream_id);
        let Some(blob) = self.store.get_existing(&key).await? else {
            return Ok(None);
        };
        let mut record = PageRecord::new(blob, self.codec.clone(), self.growth_factor);
        loop {
            match record.load().await {
                // a writer committed between the refresh and the read
                Err(e) if e.is_conflict() => {
                    info!("record changed while reading, reading again [key={}]", key);
                    continue;
                }
                result => return result,
            }
        }
    }

    /// Returns the ids of every stream in the store, sorted.
    pub async fn list_streams(&self) -> Result<Vec<String>, crate::Error> {
        let prefix = self.resolver.prefix();
        let blobs = self.store.list_prefix(&prefix).await?;
        Ok(blobs
            .iter()
            .filter_map(|blob| blob.key().strip_prefix(prefix.as_str()))
            .map(str::to_string)
            .collect())
    }
}
