//! Named, typed, leased locks.
//!
//! Locks live in the `LockStore`, not in process memory: one submission spans
//! several independent request cycles, and the holder presents its `HeldLock`
//! again on each of them. A lease lapses `max_age` after the last refresh and
//! can then be reclaimed by anyone.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::ports::{LockStore, Result};
use crate::types::{HeldLock, LockKey, LockRecord};

/// Timing knobs for lock acquisition and leases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockPolicy {
    /// How long `acquire` keeps polling before failing with `ResourceLocked`.
    pub acquire_timeout: Duration,
    /// Lease length, counted from acquisition or the last `reset_expiry`.
    pub max_age: Duration,
    /// Delay between acquisition attempts.
    pub poll_interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
            max_age: Duration::from_secs(4 * 60 * 60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    policy: LockPolicy,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, policy: LockPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    /// Acquire `key` for `holder` using the configured timeout and lease.
    pub async fn acquire(&self, key: &LockKey, holder: &str) -> Result<HeldLock> {
        self.acquire_with(key, holder, self.policy.acquire_timeout, self.policy.max_age)
            .await
    }

    /// Acquire `key` for `holder`, polling until `timeout` elapses.
    ///
    /// Not re-entrant: a live lock blocks every other acquisition, including
    /// one by its own holder, so two confirms from one user still run one at a
    /// time. A zero timeout makes exactly one attempt.
    pub async fn acquire_with(
        &self,
        key: &LockKey,
        holder: &str,
        timeout: Duration,
        max_age: Duration,
    ) -> Result<HeldLock> {
        let started = tokio::time::Instant::now();
        let deadline = started + timeout;
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);

        loop {
            let candidate = LockRecord::new(key.clone(), holder, max_age_ms);
            let Some(existing) = self.store.try_create_lock(&candidate).await? else {
                tracing::info!(
                    target: "calreg.lock",
                    key = %key,
                    holder,
                    wait_ms = started.elapsed().as_millis() as u64,
                    "lock acquired"
                );
                return Ok(HeldLock::from(&candidate));
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::info!(
                    target: "calreg.lock",
                    key = %key,
                    holder,
                    owner = %existing.holder,
                    "lock acquisition timed out"
                );
                return Err(RegistryError::ResourceLocked {
                    key: key.clone(),
                    holder: existing.holder,
                });
            }
            tracing::debug!(
                target: "calreg.lock",
                key = %key,
                owner = %existing.holder,
                "lock busy, waiting"
            );
            tokio::time::sleep(self.policy.poll_interval.min(deadline - now)).await;
        }
    }

    /// Release a held lock. Releasing a lock already lost is logged, not an error.
    pub async fn release(&self, lock: &HeldLock) -> Result<()> {
        if self.store.delete_lock(&lock.key, lock.token).await? {
            tracing::info!(target: "calreg.lock", key = %lock.key, holder = %lock.holder, "lock released");
        } else {
            tracing::warn!(
                target: "calreg.lock",
                key = %lock.key,
                holder = %lock.holder,
                "release of a lock not held"
            );
        }
        Ok(())
    }

    /// Extend the lease of a held lock. Fails with `BrokenLock` when it lapsed
    /// or passed to another holder.
    pub async fn reset_expiry(&self, lock: &HeldLock) -> Result<HeldLock> {
        match self
            .store
            .touch_lock(&lock.key, lock.token, Utc::now())
            .await?
        {
            Some(refreshed) => Ok(HeldLock::from(&refreshed)),
            None => Err(RegistryError::BrokenLock(format!(
                "{} is no longer held by {}",
                lock.key, lock.holder
            ))),
        }
    }

    /// Extend every live lease owned by `holder`. Returns how many were extended.
    pub async fn reset_all_expiry(&self, holder: &str) -> Result<u32> {
        let now = Utc::now();
        let mut refreshed = 0;
        for lock in self.store.list_locks().await? {
            if lock.holder == holder
                && self.store.touch_lock(&lock.key, lock.token, now).await?.is_some()
            {
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    /// Confirm the holder still owns a live lease on the key.
    pub async fn verify(&self, lock: &HeldLock) -> Result<LockRecord> {
        let current = self.store.get_lock(&lock.key).await?.ok_or_else(|| {
            RegistryError::BrokenLock(format!("{} no longer exists", lock.key))
        })?;
        if current.holder != lock.holder {
            return Err(RegistryError::BrokenLock(format!(
                "{} is now held by {}",
                lock.key, current.holder
            )));
        }
        if current.token != lock.token {
            return Err(RegistryError::BrokenLock(format!(
                "{} was released and acquired again since {}",
                lock.key, lock.acquired_at
            )));
        }
        if current.is_expired() {
            return Err(RegistryError::BrokenLock(format!(
                "{} expired at {}",
                lock.key,
                current.expires_at()
            )));
        }
        Ok(current)
    }

    /// Holder of the live lock on `key`, if any.
    pub async fn owner_of(&self, key: &LockKey) -> Result<Option<String>> {
        Ok(self
            .store
            .get_lock(key)
            .await?
            .filter(|lock| !lock.is_expired())
            .map(|lock| lock.holder))
    }

    /// Every stored lock, ordered by key.
    pub async fn list(&self) -> Result<Vec<LockRecord>> {
        let mut locks = self.store.list_locks().await?;
        locks.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(locks)
    }

    /// Drop every lock `holder` owns. Returns how many were released.
    pub async fn release_all(&self, holder: &str) -> Result<u32> {
        let mut released = 0;
        for lock in self.store.list_locks().await? {
            if lock.holder == holder && self.store.delete_lock(&lock.key, lock.token).await? {
                released += 1;
            }
        }
        tracing::info!(target: "calreg.lock", holder, released, "released all locks");
        Ok(released)
    }
}
