//! Serialization lock (C7): a cluster-wide mutex over the isolated socket,
//! backed by a conditional `SET key value NX EX ttl` / `DEL` in Redis.

use std::thread;
use std::time::{Duration, Instant};

use redis::Commands;

use crate::error::{JouleTraceError, Result};

/// Seam `MeasurementService` holds the lock through, so tests can swap in
/// an in-process stand-in instead of a real Redis connection.
pub trait LockBackend: Send + Sync {
    fn acquire_blocking(&self, timeout: Duration) -> Result<bool>;
    fn release(&self);
}

pub struct SerializationLock {
    client: redis::Client,
    key: String,
    lease: Duration,
    poll_interval: Duration,
    /// Random-ish token identifying this process's hold, so a stale release
    /// after expiry (or by a different holder) cannot clobber someone
    /// else's lock. Not strictly required by the fixed-key design this is
    /// grounded on, but cheap to add and makes `release` safer.
    token: String,
}

impl SerializationLock {
    pub fn new(redis_url: &str, key: &str, lease: Duration, poll_interval: Duration) -> Result<SerializationLock> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| JouleTraceError::Busy(format!("connecting to lock backend {redis_url}: {e}")))?;
        Ok(SerializationLock {
            client,
            key: key.to_string(),
            lease,
            poll_interval,
            token: format!("{}-{}", std::process::id(), Instant::now().elapsed().as_nanos()),
        })
    }

    fn try_acquire_once(&self) -> Result<bool> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| JouleTraceError::Busy(format!("connecting to lock backend: {e}")))?;
        let result: redis::RedisResult<Option<String>> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.token)
            .arg("NX")
            .arg("EX")
            .arg(self.lease.as_secs())
            .query(&mut conn);
        match result {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(JouleTraceError::Busy(format!("acquiring lock: {e}"))),
        }
    }

    /// Blocks, polling at `poll_interval`, until the lock is acquired or
    /// `timeout` elapses.
    pub fn acquire_blocking(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire_once()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Best-effort, idempotent: releasing twice, or releasing after the
    /// lease expired, never errors.
    pub fn release(&self) {
        if let Ok(mut conn) = self.client.get_connection() {
            let held_by: redis::RedisResult<Option<String>> = conn.get(&self.key);
            if let Ok(Some(holder)) = held_by {
                if holder == self.token {
                    let _: redis::RedisResult<()> = conn.del(&self.key);
                }
            }
        }
    }

    /// Acquire and wrap in a guard that releases on drop, including on a
    /// panic unwinding through the caller.
    pub fn acquire_guarded(&self, timeout: Duration) -> Result<Option<LockGuard<'_>>> {
        acquire_guarded(self, timeout)
    }
}

impl LockBackend for SerializationLock {
    fn acquire_blocking(&self, timeout: Duration) -> Result<bool> {
        SerializationLock::acquire_blocking(self, timeout)
    }

    fn release(&self) {
        SerializationLock::release(self)
    }
}

pub struct LockGuard<'a> {
    lock: &'a dyn LockBackend,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Acquire through any [`LockBackend`] and wrap in a guard that releases on
/// drop, including on a panic unwinding through the caller.
pub fn acquire_guarded<'a>(lock: &'a dyn LockBackend, timeout: Duration) -> Result<Option<LockGuard<'a>>> {
    if lock.acquire_blocking(timeout)? {
        Ok(Some(LockGuard { lock }))
    } else {
        Ok(None)
    }
}

/// An in-process stand-in for [`SerializationLock`]: acquisition is a single
/// atomic compare-exchange instead of a Redis round trip. Used to exercise
/// `MeasurementService`'s serialization behavior without a Redis server.
pub mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::LockBackend;
    use crate::error::Result;

    #[derive(Default)]
    pub struct FakeLock {
        held: AtomicBool,
    }

    impl FakeLock {
        pub fn new() -> Self {
            FakeLock::default()
        }
    }

    impl LockBackend for FakeLock {
        fn acquire_blocking(&self, _timeout: Duration) -> Result<bool> {
            Ok(self.held.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok())
        }

        fn release(&self) {
            self.held.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_with_bad_url_fails_cleanly() {
        let err = SerializationLock::new("not-a-redis-url", "k", Duration::from_secs(1), Duration::from_millis(10));
        assert!(err.is_err());
    }

    #[test]
    fn fake_lock_is_exclusive_until_released() {
        let lock = testing::FakeLock::new();
        assert!(lock.acquire_blocking(Duration::from_millis(0)).unwrap());
        assert!(!lock.acquire_blocking(Duration::from_millis(0)).unwrap());
        lock.release();
        assert!(lock.acquire_blocking(Duration::from_millis(0)).unwrap());
    }

    #[test]
    fn releasing_twice_is_not_an_error_and_leaves_the_lock_free() {
        let lock = testing::FakeLock::new();
        assert!(lock.acquire_blocking(Duration::from_millis(0)).unwrap());
        lock.release();
        lock.release(); // idempotent: must not panic or flip held state
        assert!(lock.acquire_blocking(Duration::from_millis(0)).unwrap());
    }
}
