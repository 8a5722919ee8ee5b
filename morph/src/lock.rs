//! Cross-process leased mutex.
//!
//! Migrators racing from different processes serialize on a row in the
//! `db_lock` table: whoever inserts the row holds the lease until `ExpireAt`,
//! a background refresher renews it while held, and a peer may steal a lease
//! whose expiry has passed. Acquisition retries on a jittered backoff so a
//! herd of restarting migrators does not hammer the database in step.

use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;

use crate::error::Error;

/// Table holding one row per mutex key.
pub const MUTEX_TABLE_NAME: &str = "db_lock";

/// Lease lifetime granted on acquire.
pub const TTL: Duration = Duration::from_secs(15);

/// Cadence of background lease renewal while held.
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(TTL.as_millis() as u64 / 2);

/// Minimum amount of time to wait between locking attempts.
pub const MIN_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum amount of time to wait between locking attempts.
pub const MAX_WAIT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// The usual time to wait after an unsuccessful locking attempt.
pub const POLL_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Jitter amplitude added to each retry gap to avoid thundering herds.
pub const JITTER_WAIT_INTERVAL: Duration =
    Duration::from_millis(MIN_WAIT_INTERVAL.as_millis() as u64 / 2);

/// Validates a mutex key.
pub fn make_lock_key(key: &str) -> Result<String, Error> {
    if key.is_empty() {
        return Err(Error::app("lock", "must specify valid mutex key"));
    }
    Ok(key.to_string())
}

/// Determines how long to wait until the next lock retry.
///
/// Errors double the previous interval up to [`MAX_WAIT_INTERVAL`]; a clean
/// miss resets to [`POLL_WAIT_INTERVAL`]. A uniform jitter in
/// `[-JITTER/2, +JITTER/2]` is added either way.
pub fn next_wait_interval(last: Duration, had_err: bool) -> Duration {
    let base = if last.is_zero() { MIN_WAIT_INTERVAL } else { last };

    let mut next = if had_err {
        std::cmp::min(base * 2, MAX_WAIT_INTERVAL)
    } else {
        POLL_WAIT_INTERVAL
    };

    let jitter_ms = JITTER_WAIT_INTERVAL.as_millis() as i64;
    let offset = rand::thread_rng().gen_range(0..jitter_ms) - jitter_ms / 2;
    if offset >= 0 {
        next += Duration::from_millis(offset as u64);
    } else {
        next = next.saturating_sub(Duration::from_millis(offset.unsigned_abs()));
    }

    next
}

/// Cooperative cancellation for lock acquisition and the lease refresher.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: StdMutex<bool>,
    cond: Condvar,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock().unwrap();
        *cancelled = true;
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock().unwrap()
    }

    /// Sleeps for `timeout` unless cancelled first. Returns whether the
    /// token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.inner.cancelled.lock().unwrap();
        let (guard, _) = self
            .inner
            .cond
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap();
        *guard
    }
}

/// Row-level operations a dialect implements to back the mutex.
///
/// Each store owns its own database session: the refresher runs on a
/// separate thread and must never share the migration connection.
pub trait LockStore: Send {
    /// Inserts `(key, expire_at)` unless the row already exists. Returns
    /// whether the insert took effect.
    fn try_insert(&mut self, key: &str, expire_at: i64) -> Result<bool, Error>;

    /// Reads the current expiry for `key`, if any row exists.
    fn read_expiry(&mut self, key: &str) -> Result<Option<i64>, Error>;

    /// Conditionally updates the expiry: only applies when the stored value
    /// still equals `observed`. Returns whether a row matched.
    fn refresh(&mut self, key: &str, observed: i64, expire_at: i64) -> Result<bool, Error>;

    /// Deletes the row for `key`. Deleting an absent row is not an error.
    fn delete(&mut self, key: &str) -> Result<(), Error>;
}

/// Capability interface for drivers that can host the mutex.
pub trait Lockable {
    fn driver_name(&self) -> &'static str;

    /// Opens a fresh session against the lock table.
    fn open_lock_session(&self) -> Result<Box<dyn LockStore>, Error>;
}

/// A held or acquirable cross-process lock.
pub trait Locker: Send {
    /// Blocks until the lock is acquired or `token` is cancelled.
    fn lock(&mut self, token: &CancellationToken) -> Result<(), Error>;

    /// Releases the lock. Idempotent; safe to call after the lease was
    /// already lost.
    fn unlock(&mut self) -> Result<(), Error>;
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Outcome of one renewal attempt.
pub(crate) fn refresh_lease(
    store: &mut dyn LockStore,
    key: &str,
    last_known: i64,
) -> Result<Option<i64>, Error> {
    let expire_at = unix_now() + TTL.as_secs() as i64;
    if store.refresh(key, last_known, expire_at)? {
        Ok(Some(expire_at))
    } else {
        Ok(None)
    }
}

/// The leased database-backed mutex.
///
/// One holder at a time: acquisition inserts the lock row, or steals it with
/// a conditional update once the previous lease has expired. While held, a
/// background thread renews the lease every [`REFRESH_INTERVAL`]. Losing the
/// lease stops the refresher without re-acquiring; the migrator decides
/// whether to abort.
pub struct Mutex {
    key: String,
    store: Box<dyn LockStore>,
    refresh_store: Option<Box<dyn LockStore>>,
    refresher: Option<Refresher>,
}

struct Refresher {
    stop: CancellationToken,
    handle: JoinHandle<Box<dyn LockStore>>,
}

impl Mutex {
    /// Builds a mutex for `key`, opening the two sessions it needs from the
    /// driver's [`Lockable`] capability.
    pub fn open(key: &str, lockable: &dyn Lockable) -> Result<Mutex, Error> {
        let key = make_lock_key(key)?;
        let store = lockable.open_lock_session()?;
        let refresh_store = lockable.open_lock_session()?;
        Ok(Mutex {
            key,
            store,
            refresh_store: Some(refresh_store),
            refresher: None,
        })
    }

    /// One iteration of the acquire protocol. Returns the granted expiry on
    /// success.
    fn try_acquire(&mut self) -> Result<Option<i64>, Error> {
        let now = unix_now();
        let expire_at = now + TTL.as_secs() as i64;

        if self.store.try_insert(&self.key, expire_at)? {
            return Ok(Some(expire_at));
        }

        // Row exists. The lease may be stale: steal it with a conditional
        // update so two thieves cannot both win.
        let Some(observed) = self.store.read_expiry(&self.key)? else {
            return Ok(None);
        };
        if observed <= now && self.store.refresh(&self.key, observed, expire_at)? {
            return Ok(Some(expire_at));
        }

        Ok(None)
    }

    fn spawn_refresher(&mut self, expire_at: i64) {
        let stop = CancellationToken::new();
        let thread_stop = stop.clone();
        let key = self.key.clone();
        let mut store = self
            .refresh_store
            .take()
            .expect("refresher session already in use");

        let handle = std::thread::spawn(move || {
            let mut last_known = expire_at;
            loop {
                if thread_stop.wait_timeout(REFRESH_INTERVAL) {
                    break;
                }
                match refresh_lease(store.as_mut(), &key, last_known) {
                    Ok(Some(renewed)) => last_known = renewed,
                    Ok(None) => {
                        tracing::warn!(key = %key, "mutex lease lost, stopping refresh");
                        break;
                    }
                    Err(err) => {
                        // Transient failure: keep the cadence and try again;
                        // the lease has slack until the TTL runs out.
                        tracing::warn!(key = %key, error = %err, "failed to refresh mutex lease");
                    }
                }
            }
            store
        });

        self.refresher = Some(Refresher { stop, handle });
    }

    fn stop_refresher(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.stop.cancel();
            if let Ok(store) = refresher.handle.join() {
                self.refresh_store = Some(store);
            }
        }
    }
}

impl Locker for Mutex {
    fn lock(&mut self, token: &CancellationToken) -> Result<(), Error> {
        if self.refresher.is_some() {
            return Ok(());
        }

        let mut wait = Duration::ZERO;

        loop {
            if token.is_cancelled() {
                return Err(Error::LockUnavailable);
            }

            let failed = match self.try_acquire() {
                Ok(Some(expire_at)) => {
                    tracing::debug!(key = %self.key, expire_at, "acquired mutex");
                    self.spawn_refresher(expire_at);
                    return Ok(());
                }
                Ok(None) => false,
                Err(err) => {
                    tracing::warn!(key = %self.key, error = %err, "failed to acquire mutex");
                    true
                }
            };

            wait = next_wait_interval(wait, failed);
            if token.wait_timeout(wait) {
                return Err(Error::LockUnavailable);
            }
        }
    }

    fn unlock(&mut self) -> Result<(), Error> {
        self.stop_refresher();
        self.store.delete(&self.key)
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        self.stop_refresher();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_lock_key_rejects_empty() {
        assert!(make_lock_key("").is_err());
        assert_eq!(make_lock_key("mk").unwrap(), "mk");
    }

    #[test]
    fn wait_interval_grows_on_errors() {
        let mut interval = Duration::from_secs(1);
        for _ in 0..5 {
            let previous = interval;
            interval = next_wait_interval(interval, true);
            assert!(interval > previous);
        }
    }

    #[test]
    fn wait_interval_caps_at_max() {
        let interval = next_wait_interval(MAX_WAIT_INTERVAL, true);
        assert!(interval <= MAX_WAIT_INTERVAL + JITTER_WAIT_INTERVAL);
    }

    #[test]
    fn wait_interval_resets_without_error() {
        let interval = next_wait_interval(MAX_WAIT_INTERVAL, false);
        assert!(interval <= POLL_WAIT_INTERVAL + JITTER_WAIT_INTERVAL);
    }

    #[test]
    fn first_wait_starts_from_minimum() {
        let interval = next_wait_interval(Duration::ZERO, true);
        assert!(interval >= 2 * MIN_WAIT_INTERVAL - JITTER_WAIT_INTERVAL);
        assert!(interval <= 2 * MIN_WAIT_INTERVAL + JITTER_WAIT_INTERVAL);
    }

    #[test]
    fn cancellation_token_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let started = std::time::Instant::now();

        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(50));
        token.cancel();

        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(token.is_cancelled());
    }

    #[test]
    fn uncancelled_wait_times_out() {
        let token = CancellationToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(10)));
    }
}
