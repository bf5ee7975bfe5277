//! Memo of environments that have been woken.
//!
//! Waking a hosted environment is slow, so each one is woken at most once
//! per TTL window. The record is taken before the wake call is issued:
//! concurrent callers for the same environment never issue a second wake,
//! and a failed wake is not retried inside the window. Downstream
//! database or file operations fail loudly if the environment never came
//! up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shift_core::EnvironmentRef;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::directory::EnvironmentDirectory;

/// What `ensure_awake` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeOutcome {
    /// A fresh record existed; nothing was sent.
    Skipped,
    /// The wake call succeeded.
    Woken,
    /// The wake call failed; the error was logged and swallowed.
    Failed(String),
}

pub struct EnvironmentWakeCache {
    directory: Arc<dyn EnvironmentDirectory>,
    /// `None` keeps records for the life of the cache.
    ttl: Option<Duration>,
    /// Rendered `site.stage` → time the wake was issued.
    records: Mutex<HashMap<String, Instant>>,
}

impl EnvironmentWakeCache {
    pub fn new(directory: Arc<dyn EnvironmentDirectory>, ttl: Option<Duration>) -> Self {
        Self {
            directory,
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Wake `env` unless it was woken within the TTL.
    pub async fn ensure_awake(&self, env: &EnvironmentRef) -> WakeOutcome {
        if !self.claim(env) {
            debug!(%env, "wake skipped (recent)");
            return WakeOutcome::Skipped;
        }

        info!(%env, "initializing environment");
        match self.directory.wake(env).await {
            Ok(()) => WakeOutcome::Woken,
            Err(e) => {
                warn!(%env, error = %e, "wake failed; continuing");
                WakeOutcome::Failed(e.to_string())
            }
        }
    }

    /// Whether a fresh record exists for `env`.
    pub fn is_fresh(&self, env: &EnvironmentRef) -> bool {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records
            .get(&env.to_string())
            .is_some_and(|at| self.fresh(*at))
    }

    /// Drop the record for `env` so the next call wakes it again.
    pub fn forget(&self, env: &EnvironmentRef) -> bool {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.remove(&env.to_string()).is_some()
    }

    /// Insert a record unless a fresh one exists. True if the caller
    /// should issue the wake.
    fn claim(&self, env: &EnvironmentRef) -> bool {
        let key = env.to_string();
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        if records.get(&key).is_some_and(|at| self.fresh(*at)) {
            return false;
        }
        records.insert(key, Instant::now());
        true
    }

    fn fresh(&self, at: Instant) -> bool {
        match self.ttl {
            Some(ttl) => at.elapsed() < ttl,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDirectory;

    fn env(s: &str) -> EnvironmentRef {
        EnvironmentRef::parse(s).unwrap()
    }

    #[tokio::test]
    async fn wakes_at_most_once() {
        let dir = Arc::new(MemoryDirectory::new());
        let cache = EnvironmentWakeCache::new(dir.clone(), None);

        assert_eq!(cache.ensure_awake(&env("a.live")).await, WakeOutcome::Woken);
        assert_eq!(cache.ensure_awake(&env("a.live")).await, WakeOutcome::Skipped);
        assert_eq!(dir.wake_count(&env("a.live")), 1);

        assert_eq!(cache.ensure_awake(&env("a.dev")).await, WakeOutcome::Woken);
        assert_eq!(dir.wake_count(&env("a.dev")), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_wake_once() {
        let dir = Arc::new(MemoryDirectory::new());
        let cache = Arc::new(EnvironmentWakeCache::new(dir.clone(), None));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let cache = cache.clone();
            tasks.spawn(async move { cache.ensure_awake(&env("a.live")).await });
        }
        while tasks.join_next().await.is_some() {}
        assert_eq!(dir.wake_count(&env("a.live")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_record_wakes_again() {
        let dir = Arc::new(MemoryDirectory::new());
        let cache = EnvironmentWakeCache::new(dir.clone(), Some(Duration::from_secs(60)));

        cache.ensure_awake(&env("a.live")).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.ensure_awake(&env("a.live")).await, WakeOutcome::Skipped);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!cache.is_fresh(&env("a.live")));
        assert_eq!(cache.ensure_awake(&env("a.live")).await, WakeOutcome::Woken);
        assert_eq!(dir.wake_count(&env("a.live")), 2);
    }

    #[tokio::test]
    async fn failed_wake_is_not_retried() {
        let dir = Arc::new(MemoryDirectory::new());
        dir.fail_wakes(&env("a.live"));
        let cache = EnvironmentWakeCache::new(dir.clone(), None);

        assert!(matches!(
            cache.ensure_awake(&env("a.live")).await,
            WakeOutcome::Failed(_)
        ));
        assert_eq!(cache.ensure_awake(&env("a.live")).await, WakeOutcome::Skipped);
        assert_eq!(dir.wake_count(&env("a.live")), 1);
    }

    #[tokio::test]
    async fn forget_allows_rewake() {
        let dir = Arc::new(MemoryDirectory::new());
        let cache = EnvironmentWakeCache::new(dir.clone(), None);
        cache.ensure_awake(&env("a.live")).await;
        assert!(cache.forget(&env("a.live")));
        cache.ensure_awake(&env("a.live")).await;
        assert_eq!(dir.wake_count(&env("a.live")), 2);
    }
}
