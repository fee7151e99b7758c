//! Webhook Session Locks
//!
//! Short-lived, named mutual exclusion used to keep two deliveries of the same
//! checkout session from reconciling at once.
//!
//! ```text
//! delivery A ──▶ try_acquire("stripe-webhook-cs_1") ──▶ Some(lock) ──▶ reconcile ──▶ release
//! delivery B ──▶ try_acquire("stripe-webhook-cs_1") ──▶ None (busy) ──▶ 200 "Already processing"
//! delivery C ──▶ try_acquire("stripe-webhook-cs_2") ──▶ Some(lock)   (independent session)
//! ```
//!
//! Acquisition never waits. A TTL bounds how long a crashed holder can keep a
//! session wedged; normal release is explicit.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;

/// Prefix for per-session webhook lock keys
pub const WEBHOOK_LOCK_PREFIX: &str = "stripe-webhook-";

/// Default lock TTL
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

/// Lock key for a checkout session
pub fn webhook_lock_key(session_id: &str) -> String {
    format!("{WEBHOOK_LOCK_PREFIX}{session_id}")
}

/// A held lock
///
/// The token identifies this particular holder, so a release after TTL
/// expiry cannot remove a lock someone else has since taken.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lock {
    pub key: String,
    pub token: String,
    pub ttl: Duration,
}

impl Lock {
    fn new(key: &str, ttl: Duration) -> Self {
        Self {
            key: key.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            ttl,
        }
    }
}

/// Lock backend trait
///
/// `try_acquire` must be a single atomic acquire-if-absent, never a read
/// followed by a write.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// `Ok(None)` when another holder has the key
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lock>>;

    /// Release a lock we hold. Releasing an expired or foreign lock is a no-op.
    async fn release(&self, lock: &Lock) -> Result<()>;

    /// Backend name for diagnostics
    fn name(&self) -> &'static str;
}

/// Scoped lock acquisition
///
/// Call [`LockGuard::release`] on the normal path. If the guard is dropped
/// while still holding the lock (panic, cancelled request future) the
/// release is spawned onto the current tokio runtime instead.
pub struct LockGuard {
    manager: Arc<dyn LockManager>,
    lock: Option<Lock>,
}

impl LockGuard {
    /// Try to take `key`, returning a guard or `None` if busy
    pub async fn acquire(
        manager: Arc<dyn LockManager>,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Self>> {
        let lock = manager.try_acquire(key, ttl).await?;
        Ok(lock.map(|lock| Self {
            manager,
            lock: Some(lock),
        }))
    }

    pub fn key(&self) -> &str {
        self.lock.as_ref().map_or("", |l| l.key.as_str())
    }

    /// Release now
    pub async fn release(mut self) -> Result<()> {
        match self.lock.take() {
            Some(lock) => self.manager.release(&lock).await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };

        let manager = Arc::clone(&self.manager);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(key = %lock.key, "Releasing abandoned lock in background");
                handle.spawn(async move {
                    if let Err(e) = manager.release(&lock).await {
                        tracing::warn!(key = %lock.key, error = %e, "Background lock release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    key = %lock.key,
                    ttl = ?lock.ttl,
                    "No runtime to release lock; it will expire after its TTL"
                );
            }
        }
    }
}

struct Held {
    token: String,
    expires_at: Instant,
}

/// In-process lock manager (single instance deployments and tests)
#[derive(Default)]
pub struct MemoryLockManager {
    held: Mutex<HashMap<String, Held>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired locks
    pub async fn held_count(&self) -> usize {
        let now = Instant::now();
        self.held
            .lock()
            .await
            .values()
            .filter(|h| h.expires_at > now)
            .count()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lock>> {
        let mut held = self.held.lock().await;
        let now = Instant::now();

        if held.get(key).is_some_and(|h| h.expires_at > now) {
            return Ok(None);
        }

        let lock = Lock::new(key, ttl);
        held.insert(
            key.to_string(),
            Held {
                token: lock.token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(lock))
    }

    async fn release(&self, lock: &Lock) -> Result<()> {
        let mut held = self.held.lock().await;
        if held.get(&lock.key).is_some_and(|h| h.token == lock.token) {
            held.remove(&lock.key);
        } else {
            tracing::debug!(key = %lock.key, "Lock already expired or taken over");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(feature = "redis")]
pub use redis_backend::RedisLockManager;

#[cfg(feature = "redis")]
mod redis_backend {
    use async_trait::async_trait;
    use redis::aio::MultiplexedConnection;
    use std::time::Duration;

    use super::{Lock, LockManager};
    use crate::error::{PaymentError, Result};

    /// Deletes the key only if it still holds our token
    const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

    /// Redis-backed lock manager for multi-instance deployments
    ///
    /// Acquire is `SET key token NX PX ttl`; release is a compare-and-delete
    /// script so an expired holder cannot free someone else's lock.
    #[derive(Clone)]
    pub struct RedisLockManager {
        conn: MultiplexedConnection,
    }

    impl RedisLockManager {
        pub fn new(conn: MultiplexedConnection) -> Self {
            Self { conn }
        }

        /// Connect to `redis_url`
        pub async fn connect(redis_url: &str) -> Result<Self> {
            let client = redis::Client::open(redis_url)
                .map_err(|e| PaymentError::Config(format!("invalid REDIS_URL: {e}")))?;
            let conn = client.get_multiplexed_tokio_connection().await?;
            Ok(Self::new(conn))
        }
    }

    #[async_trait]
    impl LockManager for RedisLockManager {
        async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lock>> {
            let lock = Lock::new(key, ttl);
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            let mut conn = self.conn.clone();

            let reply: Option<String> = redis::cmd("SET")
                .arg(&lock.key)
                .arg(&lock.token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await?;

            Ok(reply.map(|_| lock))
        }

        async fn release(&self, lock: &Lock) -> Result<()> {
            let mut conn = self.conn.clone();
            let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
                .key(&lock.key)
                .arg(&lock.token)
                .invoke_async(&mut conn)
                .await?;

            if deleted == 0 {
                tracing::debug!(key = %lock.key, "Lock already expired or taken over");
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "redis"
        }
    }

    impl std::fmt::Debug for RedisLockManager {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedisLockManager").finish_non_exhaustive()
        }
    }
}
