//! The scrape cache: a bounded, TTL-governed byte buffer serving hot scrapes
//! without touching PostgreSQL.
//!
//! One writer at a time; a reader that misses becomes the writer. Lock
//! acquisition backs off in 10 ms steps and gives up after the configured
//! blocking timeout. A partial payload never becomes readable: only
//! [`ScrapeCache::finalize`] stamps `valid_until`, and an overflowing append
//! invalidates the buffer while the response keeps streaming uncached.

use std::sync::Arc;
use std::time::Duration;

use quanta::{Clock, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

/// Cache buffer size used when the operator does not configure one.
pub const DEFAULT_CACHE_SIZE: usize = 256 * 1024;

/// Upper clamp for `metrics_cache_max_size`.
pub const MAX_CACHE_SIZE: usize = 8 * 1024 * 1024;

const BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
#[error("cache lock not acquired within {0:?}")]
pub struct CacheLockTimeout(pub Duration);

/// The cache payload and its validity window.
#[derive(Debug)]
pub struct ScrapeCache {
    clock: Clock,
    capacity: usize,
    max_age: Duration,
    data: Vec<u8>,
    valid_until: Option<Instant>,
}

impl ScrapeCache {
    /// Clamps the requested size into `[DEFAULT_CACHE_SIZE, MAX_CACHE_SIZE]`.
    /// `max_age == 0` or `requested == 0` disables caching entirely.
    pub fn new(max_age: Duration, requested: usize, clock: Clock) -> Self {
        let capacity = if max_age.is_zero() || requested == 0 {
            0
        } else {
            requested.clamp(DEFAULT_CACHE_SIZE, MAX_CACHE_SIZE)
        };
        ScrapeCache { clock, capacity, max_age, data: Vec::new(), valid_until: None }
    }

    pub fn enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether a non-empty payload is still within its validity window.
    pub fn is_valid(&self) -> bool {
        match self.valid_until {
            Some(until) if !self.data.is_empty() => self.clock.now() <= until,
            _ => false,
        }
    }

    /// The payload, when it can be served.
    pub fn get(&self) -> Option<&[u8]> {
        if self.is_valid() {
            Some(&self.data)
        } else {
            None
        }
    }

    /// Clears the payload and zeroes the validity stamp.
    pub fn invalidate(&mut self) {
        self.data.clear();
        self.valid_until = None;
    }

    /// Appends a chunk of the response being built. Returns `false` after an
    /// overflow: the cache is invalidated and later appends are ignored for
    /// this build.
    pub fn append(&mut self, chunk: &[u8]) -> bool {
        if !self.enabled() {
            return false;
        }
        if self.data.len() + chunk.len() >= self.capacity {
            tracing::debug!(
                chunk = chunk.len(),
                capacity = self.capacity,
                used = self.data.len(),
                "payload overflows the metrics cache; serving uncached. \
                 HINT: adjust metrics_cache_max_size"
            );
            self.invalidate();
            return false;
        }
        self.data.extend_from_slice(chunk);
        true
    }

    /// Marks the payload complete and readable until `now + max_age`.
    pub fn finalize(&mut self) {
        if self.enabled() && !self.data.is_empty() {
            self.valid_until = Some(self.clock.now() + self.max_age);
        }
    }
}

/// Shared handle; callers acquire the lock for the whole serve-or-build cycle.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    inner: Arc<Mutex<ScrapeCache>>,
}

impl CacheHandle {
    pub fn new(max_age: Duration, requested: usize) -> Self {
        Self::with_clock(max_age, requested, Clock::new())
    }

    pub fn with_clock(max_age: Duration, requested: usize, clock: Clock) -> Self {
        CacheHandle { inner: Arc::new(Mutex::new(ScrapeCache::new(max_age, requested, clock))) }
    }

    /// Acquires the cache lock, spinning with a 10 ms backoff until
    /// `blocking_timeout` elapses.
    pub async fn lock(
        &self,
        blocking_timeout: Duration,
    ) -> Result<MutexGuard<'_, ScrapeCache>, CacheLockTimeout> {
        let start = std::time::Instant::now();
        loop {
            if let Ok(guard) = self.inner.try_lock() {
                return Ok(guard);
            }
            if start.elapsed() >= blocking_timeout {
                return Err(CacheLockTimeout(blocking_timeout));
            }
            tokio::time::sleep(BACKOFF).await;
        }
    }

    /// Invalidation for `reset` and reload: zero the stamp under the lock.
    pub async fn invalidate(&self, blocking_timeout: Duration) -> Result<(), CacheLockTimeout> {
        let mut guard = self.lock(blocking_timeout).await?;
        guard.invalidate();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_cache(max_age: Duration, size: usize) -> (ScrapeCache, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        (ScrapeCache::new(max_age, size, clock), mock)
    }

    #[test]
    fn capacity_is_clamped() {
        let (cache, _mock) = mock_cache(Duration::from_secs(5), 1);
        assert_eq!(cache.capacity(), DEFAULT_CACHE_SIZE);

        let (cache, _mock) = mock_cache(Duration::from_secs(5), usize::MAX);
        assert_eq!(cache.capacity(), MAX_CACHE_SIZE);

        let (cache, _mock) = mock_cache(Duration::from_secs(5), 512 * 1024);
        assert_eq!(cache.capacity(), 512 * 1024);
    }

    #[test]
    fn zero_age_disables_caching() {
        let (mut cache, _mock) = mock_cache(Duration::ZERO, 512 * 1024);
        assert!(!cache.enabled());
        assert!(!cache.append(b"payload"));
        cache.finalize();
        assert!(cache.get().is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn payload_only_readable_after_finalize() {
        let (mut cache, mock) = mock_cache(Duration::from_secs(5), DEFAULT_CACHE_SIZE);
        assert!(cache.append(b"# HELP x x\n"));
        assert!(cache.append(b"x 1\n"));
        assert!(cache.get().is_none());

        cache.finalize();
        assert_eq!(cache.get(), Some(&b"# HELP x x\nx 1\n"[..]));

        // Within the window it stays readable, past it it does not.
        mock.increment(Duration::from_secs(5));
        assert!(cache.get().is_some());
        mock.increment(Duration::from_millis(1));
        assert!(cache.get().is_none());
    }

    #[test]
    fn overflow_invalidates_and_stops_caching() {
        let (mut cache, _mock) = mock_cache(Duration::from_secs(5), DEFAULT_CACHE_SIZE);
        let big = vec![b'x'; DEFAULT_CACHE_SIZE];
        assert!(cache.append(b"start"));
        assert!(!cache.append(&big));
        assert!(cache.is_empty());
        cache.finalize();
        assert!(cache.get().is_none());
    }

    #[test]
    fn invalidate_zeroes_the_stamp() {
        let (mut cache, _mock) = mock_cache(Duration::from_secs(5), DEFAULT_CACHE_SIZE);
        cache.append(b"payload");
        cache.finalize();
        assert!(cache.is_valid());
        cache.invalidate();
        assert!(!cache.is_valid());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn lock_times_out_under_contention() {
        let handle = CacheHandle::new(Duration::from_secs(5), DEFAULT_CACHE_SIZE);
        let guard = handle.lock(Duration::from_millis(50)).await.unwrap();

        let contender = handle.clone();
        let err = contender.lock(Duration::from_millis(50)).await;
        assert!(err.is_err());
        drop(guard);

        assert!(handle.lock(Duration::from_millis(50)).await.is_ok());
    }
}
