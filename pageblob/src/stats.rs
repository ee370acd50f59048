//! # Statistics Module
//!
//! Page blob stores expose counters through [`PageBlobStore::metrics`] rather than
//! integrating with an observability platform. Applications poll the registry and export
//! the values themselves.
//!
//! * [`ReadableStat`]: implemented by all metric types, reads the current value as `i64`.
//! * [`StatRegistry`]: looks up metrics by name.
//! * [`Counter`]: atomic counter for incrementing values.
//!
//! [`PageBlobStore::metrics`]: crate::PageBlobStore::metrics

use log::warn;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub trait ReadableStat: Send + Sync + std::fmt::Debug {
    fn get(&self) -> i64;
}

#[derive(Debug)]
pub struct StatRegistry {
    stats: Mutex<BTreeMap<&'static str, Arc<dyn ReadableStat>>>,
}

impl Default for StatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatRegistry {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(BTreeMap::new()),
        }
    }

    /// Get a metric with a specific name, or `None` if no metric was registered
    /// for the name.
    pub fn lookup(&self, name: &'static str) -> Option<Arc<dyn ReadableStat>> {
        let guard = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let guard = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        guard.keys().copied().collect()
    }

    pub(crate) fn register(&self, name: &'static str, stat: Arc<dyn ReadableStat>) {
        let mut guard = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        if guard.contains_key(name) {
            warn!(
                "registry already contains metric, will not register again [name={}]",
                name
            );
            return;
        }
        guard.insert(name, stat);
    }
}

#[derive(Clone, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.value.load(Ordering::Relaxed))
    }
}

impl ReadableStat for Counter {
    fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed) as i64
    }
}

impl Counter {
    pub fn inc(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed)
    }
}

#[macro_export]
macro_rules! stat_name {
    ($prefix:expr, $suffix:expr) => {
        concat!($prefix, "/", $suffix)
    };
}

macro_rules! blob_stat_name {
    ($suffix:expr) => {
        crate::stat_name!("blob", $suffix)
    };
}

macro_rules! retry_stat_name {
    ($suffix:expr) => {
        crate::stat_name!("retry", $suffix)
    };
}

pub const BLOB_WRITES: &str = blob_stat_name!("writes");
pub const BLOB_RESIZES: &str = blob_stat_name!("resizes");
pub const BLOB_CONFLICTS: &str = blob_stat_name!("conflicts");
pub const BLOB_MIRROR_FAILURES: &str = blob_stat_name!("mirror_failures");
pub const RETRY_ATTEMPTS: &str = retry_stat_name!("attempts");
pub const RETRY_CONFLICTS: &str = retry_stat_name!("conflicts");
pub const RETRY_EXHAUSTED: &str = retry_stat_name!("exhausted");

/// Counters for page blob operations, shared by every handle of a store.
#[derive(Debug, Clone)]
pub(crate) struct BlobStats {
    pub(crate) writes: Arc<Counter>,
    pub(crate) resizes: Arc<Counter>,
    pub(crate) conflicts: Arc<Counter>,
    pub(crate) mirror_failures: Arc<Counter>,
}

impl BlobStats {
    pub(crate) fn new(registry: &StatRegistry) -> Self {
        let stats = Self {
            writes: Arc::new(Counter::default()),
            resizes: Arc::new(Counter::default()),
            conflicts: Arc::new(Counter::default()),
            mirror_failures: Arc::new(Counter::default()),
        };
        registry.register(BLOB_WRITES, stats.writes.clone());
        registry.register(BLOB_RESIZES, stats.resizes.clone());
        registry.register(BLOB_CONFLICTS, stats.conflicts.clone());
        registry.register(BLOB_MIRROR_FAILURES, stats.mirror_failures.clone());
        stats
    }
}

/// Counters for the conflict retry loop.
#[derive(Debug, Clone)]
pub(crate) struct RetryStats {
    pub(crate) attempts: Arc<Counter>,
    pub(crate) conflicts: Arc<Counter>,
    pub(crate) exhausted: Arc<Counter>,
}

impl RetryStats {
    pub(crate) fn new(registry: &StatRegistry) -> Self {
        let stats = Self {
            attempts: Arc::new(Counter::default()),
            conflicts: Arc::new(Counter::default()),
            exhausted: Arc::new(Counter::default()),
        };
        registry.register(RETRY_ATTEMPTS, stats.attempts.clone());
        registry.register(RETRY_CONFLICTS, stats.conflicts.clone());
        registry.register(RETRY_EXHAUSTED, stats.exhausted.clone());
        stats
    }
}
