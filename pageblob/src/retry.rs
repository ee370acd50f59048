//! # Conflict Retry
//!
//! Optimistic read-modify-write over any [VersionedResource]. Each attempt loads the
//! current value, applies the caller's mutation, and stores the result conditioned on the
//! revision observed by the load. A conflict means another writer got there first: the
//! executor sleeps for a jittered delay and starts over from a fresh load.
//!
//! ```text
//! Reading -> Mutating -> Writing -> Done
//!    ^                      |
//!    +------ Conflict ------+--> Failed
//! ```
//!
//! Only conflicts are retried. Any other failure, including a failing mutation, is returned
//! after the attempt that produced it. The mutation may run many times and must not have
//! side effects.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use rand::Rng;

use crate::clock::SystemClock;
use crate::config::RetrySettings;
use crate::error::PageBlobError;
use crate::rand::BlobRand;
use crate::stats::{RetryStats, StatRegistry};

/// A value stored remotely that supports a versioned read and a write conditioned on the
/// version returned by the last read.
#[async_trait]
pub trait VersionedResource: Send {
    type Value: Send + Sync;

    /// Loads the latest value and remembers its version.
    async fn load(&mut self) -> Result<Self::Value, crate::Error>;

    /// Stores `value` if the resource is still at the version remembered by the last
    /// `load`. Fails with [`ErrorKind::Conflict`](crate::ErrorKind::Conflict) otherwise.
    async fn store(&mut self, value: &Self::Value) -> Result<(), crate::Error>;
}

/// Computes the delay to wait after a conflict.
pub trait Backoff: Debug + Send + Sync {
    /// `attempt` is the number of the attempt that just conflicted, starting at 1.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with jitter. The delay after attempt `n` is drawn uniformly from
/// `[min_delay, min(max_delay, min_delay * 2^(n-1))]`. `min_delay` must be non-zero.
#[derive(Debug)]
pub struct JitteredExponentialBackoff {
    min_delay: Duration,
    max_delay: Duration,
    rand: Arc<BlobRand>,
}

impl JitteredExponentialBackoff {
    pub fn new(
        min_delay: Duration,
        max_delay: Duration,
        rand: Arc<BlobRand>,
    ) -> Result<Self, crate::Error> {
        // a zero base never grows, so the delay would stay at zero
        if min_delay.is_zero() {
            return Err(PageBlobError::InvalidMinDelay.into());
        }
        if min_delay > max_delay {
            return Err(PageBlobError::InvalidRetryDelays {
                min_delay,
                max_delay,
            }
            .into());
        }
        Ok(Self {
            min_delay,
            max_delay,
            rand,
        })
    }
}

impl Backoff for JitteredExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let cap = self
            .min_delay
            .saturating_mul(factor)
            .min(self.max_delay);
        let low = self.min_delay.as_nanos() as u64;
        let high = cap.as_nanos() as u64;
        Duration::from_nanos(self.rand.thread_rng().gen_range(low..=high))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOptions {
    /// Gives up with `RetryExhausted` after this many attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

/// Runs optimistic read-modify-write loops.
#[derive(Debug, Clone)]
pub struct ConflictRetryExecutor {
    options: RetryOptions,
    backoff: Arc<dyn Backoff>,
    clock: Arc<dyn SystemClock>,
    stats: RetryStats,
}

impl ConflictRetryExecutor {
    pub fn new(
        options: RetryOptions,
        backoff: Arc<dyn Backoff>,
        clock: Arc<dyn SystemClock>,
        stat_registry: &StatRegistry,
    ) -> Self {
        Self {
            options,
            backoff,
            clock,
            stats: RetryStats::new(stat_registry),
        }
    }

    /// Builds an executor with [JitteredExponentialBackoff] from `settings`.
    pub fn from_settings(
        settings: &RetrySettings,
        rand: Arc<BlobRand>,
        clock: Arc<dyn SystemClock>,
        stat_registry: &StatRegistry,
    ) -> Result<Self, crate::Error> {
        settings.validate()?;
        let backoff =
            JitteredExponentialBackoff::new(settings.min_delay, settings.max_delay, rand)?;
        Ok(Self::new(
            RetryOptions {
                max_attempts: settings.max_attempts,
            },
            Arc::new(backoff),
            clock,
            stat_registry,
        ))
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Applies `mutate` to the resource's current value and stores the result, starting
    /// over from a fresh load whenever the store conflicts. Returns the stored value.
    pub async fn run_with_retry<R, F, E>(
        &self,
        resource: &mut R,
        mut mutate: F,
    ) -> Result<R::Value, crate::Error>
    where
        R: VersionedResource,
        F: FnMut(R::Value) -> Result<R::Value, E> + Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.stats.attempts.inc();
            let err = match Self::attempt(resource, &mut mutate).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_conflict() => err,
                Err(err) => return Err(err),
            };
            self.stats.conflicts.inc();
            if self
                .options
                .max_attempts
                .is_some_and(|max_attempts| attempt >= max_attempts)
            {
                self.stats.exhausted.inc();
                warn!("giving up after repeated conflicts [attempts={}]", attempt);
                return Err(crate::Error::from(PageBlobError::RetryExhausted {
                    attempts: attempt,
                })
                .with_source(Box::new(err)));
            }
            let delay = self.backoff.delay(attempt);
            info!(
                "conflict during update, retrying [attempt={}, delay={:?}]",
                attempt, delay
            );
            self.clock.sleep(delay).await;
        }
    }

    async fn attempt<R, F, E>(resource: &mut R, mutate: &mut F) -> Result<R::Value, crate::Error>
    where
        R: VersionedResource,
        F: FnMut(R::Value) -> Result<R::Value, E> + Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        let current = resource.load().await?;
        let next = mutate(current).map_err(|e| PageBlobError::CallbackError(Box::new(e)))?;
        resource.store(&next).await?;
        Ok(next)
    }
}
