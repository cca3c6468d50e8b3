// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Account/Session Directory
//!
//! Resolves usernames to their durable [`Account`] and [`LockAccount`] and
//! keeps the result, together with the user's payment gate, in a bounded
//! in-process pool.
//!
//! ## Pool Rules
//!
//! - A cached session is returned as is; its activity stamp is refreshed.
//! - A miss resolves the user from storage, creating the normal account and
//!   its lock account on first access.
//! - A miss while the pool is at capacity fails with `PoolFull`. The pool
//!   never makes room by dropping another user's session.
//! - Disabling a user whose payment is still running keeps the session
//!   (and its gate) but refuses further resolutions.
//! - Idle sessions are evicted by [`SessionSweeper`]. The house session and
//!   sessions whose gate is held or still cooling down are never evicted,
//!   so a user can never end up with two gates.

mod gate;
mod sweeper;

pub use gate::{PayGate, PayPermit};
pub use sweeper::SessionSweeper;

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::error::{CustodyError, CustodyResult};
use crate::models::{Account, AccountRole, AccountStatus, LockAccount, User};
use crate::storage::{AccountRepository, LedgerDb};

/// Everything needed to act on behalf of one user.
pub struct UserSession {
    pub user: User,
    pub account: Account,
    pub lock_account: LockAccount,
    pub gate: Arc<PayGate>,
    last_active: Mutex<Instant>,
    disabled: AtomicBool,
}

impl UserSession {
    pub fn username(&self) -> &str {
        &self.user.username
    }

    /// Refresh the activity stamp.
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_active.lock() {
            *last = Instant::now();
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSession")
            .field("username", &self.user.username)
            .field("account_id", &self.account.account_id)
            .field("lock_account_id", &self.lock_account.lock_account_id)
            .finish()
    }
}

/// Bounded, inactivity-evicting session cache.
pub struct SessionPool {
    db: Arc<LedgerDb>,
    cache: RwLock<LruCache<String, Arc<UserSession>>>,
    capacity: usize,
    idle_timeout: Duration,
    pay_cooldown: Duration,
    system_username: String,
}

impl SessionPool {
    pub fn new(
        db: Arc<LedgerDb>,
        capacity: usize,
        idle_timeout: Duration,
        pay_cooldown: Duration,
        system_username: impl Into<String>,
    ) -> Self {
        let capacity = capacity.max(1);
        // The system session lives outside the user capacity.
        let slots = NonZeroUsize::new(capacity + 1).unwrap_or(NonZeroUsize::MIN);
        Self {
            db,
            cache: RwLock::new(LruCache::new(slots)),
            capacity,
            idle_timeout,
            pay_cooldown,
            system_username: system_username.into(),
        }
    }

    pub fn system_username(&self) -> &str {
        &self.system_username
    }

    /// Resolve a user to a session, creating accounts on first access.
    pub fn resolve(&self, username: &str) -> CustodyResult<Arc<UserSession>> {
        if let Some(session) = self.cached(username)? {
            if session.is_disabled() {
                return Err(CustodyError::UserLocked(username.to_string()));
            }
            session.touch();
            return Ok(session);
        }

        if self.is_full(&*self.read_cache()?, username) {
            tracing::warn!(username, capacity = self.capacity, "Session pool full");
            return Err(CustodyError::PoolFull);
        }

        let session = self.load(username)?;
        self.admit(username, session)
    }

    /// Read a user's accounts from storage into a fresh session.
    fn load(&self, username: &str) -> CustodyResult<Arc<UserSession>> {
        let (user, account, lock_account) = self.db.write(|txn| {
            let repo = AccountRepository::new(txn);
            let user = repo
                .user(username)?
                .ok_or_else(|| CustodyError::UserNotFound(username.to_string()))?;
            if user.status == AccountStatus::Disabled {
                return Err(CustodyError::UserLocked(username.to_string()));
            }
            let account = repo.ensure_account(username, AccountRole::Normal)?;
            let lock_account = repo.ensure_lock_account(&account)?;
            Ok((user, account, lock_account))
        })?;

        let session = Arc::new(UserSession {
            user,
            account,
            lock_account,
            gate: Arc::new(PayGate::new(self.pay_cooldown)),
            last_active: Mutex::new(Instant::now()),
            disabled: AtomicBool::new(false),
        });
        Ok(session)
    }

    /// Insert a freshly loaded session.
    ///
    /// Capacity is checked again under the write lock: `put` on a full
    /// cache would evict a live session and hand its user a second gate.
    fn admit(&self, username: &str, session: Arc<UserSession>) -> CustodyResult<Arc<UserSession>> {
        let mut cache = self.write_cache()?;
        // Another caller may have resolved the same user meanwhile: keep
        // theirs so the user keeps a single gate.
        if let Some(existing) = cache.peek(username) {
            if existing.is_disabled() {
                return Err(CustodyError::UserLocked(username.to_string()));
            }
            existing.touch();
            return Ok(existing.clone());
        }
        if self.is_full(&cache, username) {
            tracing::warn!(username, capacity = self.capacity, "Session pool full");
            return Err(CustodyError::PoolFull);
        }
        cache.put(username.to_string(), session.clone());
        tracing::debug!(username, "Session created");
        Ok(session)
    }

    /// Register a user. Registering an existing user returns its record.
    pub fn register_user(&self, username: &str) -> CustodyResult<User> {
        if username.trim().is_empty() {
            return Err(CustodyError::InvalidReference("empty username".to_string()));
        }
        let user = self
            .db
            .write(|txn| AccountRepository::new(txn).register_user(username))?;
        tracing::info!(username, "User registered");
        Ok(user)
    }

    /// Enable or disable a user.
    ///
    /// A disabled user stops resolving immediately. An idle cached session
    /// is dropped; a session whose gate is busy stays cached and is flagged,
    /// so the running payment keeps the user's only gate.
    pub fn set_user_status(&self, username: &str, status: AccountStatus) -> CustodyResult<User> {
        let user = self.db.write(|txn| {
            let repo = AccountRepository::new(txn);
            let mut user = repo
                .user(username)?
                .ok_or_else(|| CustodyError::UserNotFound(username.to_string()))?;
            user.status = status;
            user.updated_at = chrono::Utc::now();
            repo.update_user(&user)?;
            Ok::<_, CustodyError>(user)
        })?;
        let mut cache = self.write_cache()?;
        if let Some(session) = cache.peek(username).cloned() {
            if session.gate.is_idle() {
                cache.pop(username);
            } else {
                session
                    .disabled
                    .store(status == AccountStatus::Disabled, Ordering::SeqCst);
            }
        }
        drop(cache);
        tracing::info!(username, status = ?status, "User status changed");
        Ok(user)
    }

    /// Refresh a cached session's activity stamp.
    pub fn touch(&self, username: &str) -> CustodyResult<bool> {
        match self.cached(username)? {
            Some(session) => {
                session.touch();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop a session so the next resolution reloads it from storage.
    ///
    /// A session whose gate is still busy is kept; the caller retries the
    /// invalidation on the next sweep.
    pub fn invalidate(&self, username: &str) -> CustodyResult<bool> {
        let mut cache = self.write_cache()?;
        let evictable = cache
            .peek(username)
            .map(|s| s.gate.is_idle())
            .unwrap_or(false);
        if evictable {
            cache.pop(username);
        }
        Ok(evictable)
    }

    /// Evict sessions idle beyond the configured window.
    pub fn evict_idle(&self) -> CustodyResult<usize> {
        let mut cache = self.write_cache()?;
        let stale: Vec<String> = cache
            .iter()
            .filter(|(name, session)| {
                name.as_str() != self.system_username
                    && session.idle_for() >= self.idle_timeout
                    && session.gate.is_idle()
                    && Arc::strong_count(session) == 1
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            cache.pop(name);
        }
        Ok(stale.len())
    }

    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve an auxiliary account (e.g. game-receive) of a registered user.
    pub fn resolve_account(&self, username: &str, role: AccountRole) -> CustodyResult<Account> {
        self.db.write(|txn| {
            let repo = AccountRepository::new(txn);
            let user = repo
                .user(username)?
                .ok_or_else(|| CustodyError::UserNotFound(username.to_string()))?;
            if user.status == AccountStatus::Disabled {
                return Err(CustodyError::UserLocked(username.to_string()));
            }
            Ok(repo.ensure_account(username, role)?)
        })
    }

    fn cached(&self, username: &str) -> CustodyResult<Option<Arc<UserSession>>> {
        Ok(self.read_cache()?.peek(username).cloned())
    }

    /// Whether admitting `username` would exceed the user capacity. The
    /// system session never counts.
    fn is_full(&self, cache: &LruCache<String, Arc<UserSession>>, username: &str) -> bool {
        if username == self.system_username {
            return false;
        }
        let system = usize::from(cache.contains(&self.system_username));
        cache.len() - system >= self.capacity
    }

    fn read_cache(
        &self,
    ) -> CustodyResult<std::sync::RwLockReadGuard<'_, LruCache<String, Arc<UserSession>>>> {
        self.cache
            .read()
            .map_err(|_| CustodyError::Internal("session pool lock poisoned".to_string()))
    }

    fn write_cache(
        &self,
    ) -> CustodyResult<std::sync::RwLockWriteGuard<'_, LruCache<String, Arc<UserSession>>>> {
        self.cache
            .write()
            .map_err(|_| CustodyError::Internal("session pool lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: usize, idle: Duration) -> (SessionPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(LedgerDb::open(&dir.path().join("ledger.redb")).unwrap());
        db.write(|txn| {
            let repo = AccountRepository::new(txn);
            for name in ["house", "alice", "bob", "carol"] {
                repo.register_user(name)?;
            }
            Ok::<_, crate::storage::LedgerDbError>(())
        })
        .unwrap();
        (
            SessionPool::new(db, capacity, idle, Duration::ZERO, "house"),
            dir,
        )
    }

    #[test]
    fn resolve_creates_accounts_once() {
        let (pool, _dir) = pool(10, Duration::from_secs(60));
        let first = pool.resolve("alice").unwrap();
        let second = pool.resolve("alice").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first.gate, &second.gate));
        assert_eq!(first.lock_account.account_id, first.account.account_id);
    }

    #[test]
    fn unknown_and_disabled_users_are_rejected() {
        let (pool, _dir) = pool(10, Duration::from_secs(60));
        assert!(matches!(
            pool.resolve("mallory"),
            Err(CustodyError::UserNotFound(_))
        ));

        pool.db
            .write(|txn| {
                let repo = AccountRepository::new(txn);
                let mut user = repo.user("bob")?.unwrap();
                user.status = AccountStatus::Disabled;
                repo.update_user(&user)
            })
            .unwrap();
        assert!(matches!(pool.resolve("bob"), Err(CustodyError::UserLocked(_))));
    }

    #[test]
    fn disabling_a_user_drops_the_cached_session() {
        let (pool, _dir) = pool(10, Duration::from_secs(60));
        pool.register_user("dave").unwrap();
        pool.resolve("dave").unwrap();

        pool.set_user_status("dave", AccountStatus::Disabled).unwrap();
        assert!(matches!(pool.resolve("dave"), Err(CustodyError::UserLocked(_))));

        pool.set_user_status("dave", AccountStatus::Enabled).unwrap();
        assert!(pool.resolve("dave").is_ok());
    }

    #[test]
    fn full_pool_refuses_new_users_but_not_the_system_account() {
        let (pool, _dir) = pool(1, Duration::from_secs(60));
        pool.resolve("alice").unwrap();
        assert!(matches!(pool.resolve("bob"), Err(CustodyError::PoolFull)));
        assert!(pool.resolve("house").is_ok());
        assert!(pool.resolve("alice").is_ok());
    }

    #[test]
    fn idle_sessions_are_evicted_except_system() {
        let (pool, _dir) = pool(10, Duration::ZERO);
        drop(pool.resolve("alice").unwrap());
        drop(pool.resolve("house").unwrap());
        let held = pool.resolve("carol").unwrap();

        let evicted = pool.evict_idle().unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(pool.len(), 2);
        assert!(!pool.touch("alice").unwrap());
        assert!(pool.touch("house").unwrap());
        drop(held);
    }

    #[tokio::test]
    async fn busy_gate_blocks_eviction() {
        let (pool, _dir) = pool(10, Duration::ZERO);
        let gate = pool.resolve("alice").unwrap().gate.clone();
        let permit = gate.acquire().await.unwrap();

        assert!(!pool.invalidate("alice").unwrap());
        drop(permit);
        assert!(pool.invalidate("alice").unwrap());
    }

    #[tokio::test]
    async fn disabling_a_busy_user_keeps_its_gate() {
        let (pool, _dir) = pool(10, Duration::from_secs(60));
        let gate = pool.resolve("alice").unwrap().gate.clone();
        let permit = gate.acquire().await.unwrap();

        pool.set_user_status("alice", AccountStatus::Disabled).unwrap();
        assert!(matches!(pool.resolve("alice"), Err(CustodyError::UserLocked(_))));
        assert!(pool.touch("alice").unwrap());

        pool.set_user_status("alice", AccountStatus::Enabled).unwrap();
        let again = pool.resolve("alice").unwrap();
        assert!(Arc::ptr_eq(&again.gate, &gate));
        drop(permit);
    }

    #[tokio::test]
    async fn late_admission_never_evicts_a_busy_session() {
        let (pool, _dir) = pool(1, Duration::from_secs(60));
        let gate = pool.resolve("alice").unwrap().gate.clone();
        let permit = gate.acquire().await.unwrap();

        // bob was loaded while the pool still had room, then lost the race.
        let bob = pool.load("bob").unwrap();
        assert!(matches!(pool.admit("bob", bob), Err(CustodyError::PoolFull)));

        let again = pool.resolve("alice").unwrap();
        assert!(Arc::ptr_eq(&again.gate, &gate));
        drop(permit);
    }

    #[test]
    fn concurrent_misses_respect_capacity() {
        let (pool, _dir) = pool(2, Duration::from_secs(60));
        for name in ["dave", "erin", "frank", "grace"] {
            pool.register_user(name).unwrap();
        }
        let names = ["alice", "bob", "carol", "dave", "erin", "frank", "grace"];
        std::thread::scope(|scope| {
            for name in names {
                let pool = &pool;
                scope.spawn(move || {
                    let _ = pool.resolve(name);
                });
            }
        });
        assert_eq!(pool.len(), 2);
    }
}
