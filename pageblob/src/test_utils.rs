use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::backend::{BlobMetadata, BlobProperties, PageBlobBackend, RevisionTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum BackendOp {
    List,
    Create,
    GetProperties,
    GetRange,
    PutPages,
    Resize,
    SetMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InjectedFault {
    Conflict,
    NotFound,
    Unavailable,
}

impl InjectedFault {
    fn into_error(self, key: &str) -> object_store::Error {
        match self {
            InjectedFault::Conflict => object_store::Error::Precondition {
                path: key.to_string(),
                source: "injected precondition failure".into(),
            },
            InjectedFault::NotFound => object_store::Error::NotFound {
                path: key.to_string(),
                source: "injected not found".into(),
            },
            InjectedFault::Unavailable => object_store::Error::Generic {
                store: "FaultInjectingBackend",
                source: "injected unavailable".into(),
            },
        }
    }
}

/// Wraps a backend, counts calls per operation, and fails queued calls with injected
/// faults. A queued fault is consumed by the next call of its operation, and that call
/// never reaches the wrapped backend.
#[derive(Debug)]
pub(crate) struct FaultInjectingBackend {
    inner: Arc<dyn PageBlobBackend>,
    faults: Mutex<HashMap<BackendOp, VecDeque<InjectedFault>>>,
    calls: Mutex<HashMap<BackendOp, usize>>,
}

impl FaultInjectingBackend {
    pub(crate) fn new(inner: Arc<dyn PageBlobBackend>) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn inject(&self, op: BackendOp, fault: InjectedFault) {
        let mut faults = self.faults.lock().expect("lock poisoned");
        faults.entry(op).or_default().push_back(fault);
    }

    pub(crate) fn calls(&self, op: BackendOp) -> usize {
        let calls = self.calls.lock().expect("lock poisoned");
        calls.get(&op).copied().unwrap_or(0)
    }

    fn before(&self, op: BackendOp, key: &str) -> object_store::Result<()> {
        *self
            .calls
            .lock()
            .expect("lock poisoned")
            .entry(op)
            .or_insert(0) += 1;
        let fault = self
            .faults
            .lock()
            .expect("lock poisoned")
            .get_mut(&op)
            .and_then(|queue| queue.pop_front());
        match fault {
            Some(fault) => Err(fault.into_error(key)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PageBlobBackend for FaultInjectingBackend {
    async fn list(&self, prefix: &str) -> object_store::Result<Vec<(String, BlobProperties)>> {
        self.before(BackendOp::List, prefix)?;
        self.inner.list(prefix).await
    }

    async fn create(&self, key: &str, size_bytes: u64) -> object_store::Result<BlobProperties> {
        self.before(BackendOp::Create, key)?;
        self.inner.create(key, size_bytes).await
    }

    async fn get_properties(
        &self,
        key: &str,
        condition: Option<&RevisionTag>,
    ) -> object_store::Result<BlobProperties> {
        self.before(BackendOp::GetProperties, key)?;
        self.inner.get_properties(key, condition).await
    }

    async fn get_range(
        &self,
        key: &str,
        range: Range<u64>,
        condition: Option<&RevisionTag>,
    ) -> object_store::Result<Bytes> {
        self.before(BackendOp::GetRange, key)?;
        self.inner.get_range(key, range, condition).await
    }

    async fn put_pages(
        &self,
        key: &str,
        offset: u64,
        data: Bytes,
        condition: &RevisionTag,
    ) -> object_store::Result<RevisionTag> {
        self.before(BackendOp::PutPages, key)?;
        self.inner.put_pages(key, offset, data, condition).await
    }

    async fn resize(
        &self,
        key: &str,
        size_bytes: u64,
        condition: &RevisionTag,
    ) -> object_store::Result<RevisionTag> {
        self.before(BackendOp::Resize, key)?;
        self.inner.resize(key, size_bytes, condition).await
    }

    async fn set_metadata(
        &self,
        key: &str,
        metadata: &BlobMetadata,
        condition: &RevisionTag,
    ) -> object_store::Result<RevisionTag> {
        self.before(BackendOp::SetMetadata, key)?;
        self.inner.set_metadata(key, metadata, condition).await
    }
}
