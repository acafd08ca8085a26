//! Key pool: cooldown map, random selection and blocking acquisition
//!
//! The pool maps every managed key to its remaining cooldown. Selection reads
//! the map under a shared lock and picks uniformly at random among keys at
//! zero. Penalize, remove and the decay sweep take the lock exclusively.
//!
//! When no key is ready, `acquire` releases the lock, sleeps for the smallest
//! remaining cooldown and tries again. Several waiters may wake for the same
//! freshly-ready key; losers simply loop.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use common::ApiKey;
use rand::RngExt;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cooldown::Cooldown;
use crate::decay::spawn_decay_task;
use crate::error::{Error, Result};
use crate::lock::SharedLock;

/// Reference decay tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest decay tick a pool runs with. Smaller values, including zero, are
/// raised to it.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Reference cooldown for a key rejected with a rate limit.
pub const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// Pool tuning. Plain values; the service fills them from its config file.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How often the decay sweep runs. Each sweep lowers every positive
    /// cooldown by one tick. Clamped to at least [`MIN_TICK_INTERVAL`].
    pub tick_interval: Duration,
    /// Cooldown applied by `penalize_rate_limited` when the upstream gave no hint.
    pub rate_limit_cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            rate_limit_cooldown: DEFAULT_RATE_LIMIT_COOLDOWN,
        }
    }
}

/// Pool of interchangeable rate-limited keys.
///
/// Always handed out as `Arc<KeyPool>`. The decay task only holds a weak
/// reference, so dropping the last `Arc` stops it.
pub struct KeyPool {
    keys: SharedLock<HashMap<ApiKey, Cooldown>>,
    config: PoolConfig,
    /// Woken when a key becomes ready or a penalty is lowered, so waiters
    /// re-check before their sleep runs out.
    cooled: Notify,
    shutdown: watch::Sender<bool>,
    decay_task: OnceLock<JoinHandle<()>>,
}

impl KeyPool {
    /// Create a pool with every key ready and start its decay task.
    ///
    /// Duplicate keys collapse into one entry. A tick interval below
    /// [`MIN_TICK_INTERVAL`] is raised to it. Must be called from within a
    /// tokio runtime.
    pub fn new<I, K>(keys: I, mut config: PoolConfig) -> Arc<Self>
    where
        I: IntoIterator<Item = K>,
        K: Into<ApiKey>,
    {
        if config.tick_interval < MIN_TICK_INTERVAL {
            warn!(
                tick_ns = config.tick_interval.as_nanos() as u64,
                min_ms = MIN_TICK_INTERVAL.as_millis() as u64,
                "tick interval too small, using the minimum"
            );
            config.tick_interval = MIN_TICK_INTERVAL;
        }
        let keys: HashMap<ApiKey, Cooldown> = keys
            .into_iter()
            .map(|k| (k.into(), Cooldown::READY))
            .collect();
        info!(
            keys = keys.len(),
            tick_ms = config.tick_interval.as_millis() as u64,
            "key pool initialized"
        );
        record_ready(&keys);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let pool = Arc::new(Self {
            keys: SharedLock::new(keys),
            config,
            cooled: Notify::new(),
            shutdown,
            decay_task: OnceLock::new(),
        });

        let handle = spawn_decay_task(
            Arc::downgrade(&pool),
            pool.config.tick_interval,
            shutdown_rx,
        );
        // Freshly created lock, nobody else can have set it.
        let _ = pool.decay_task.set(handle);
        pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquire a ready key, waiting for one if every key is cooling down.
    ///
    /// Returns `NoAvailableKeys` immediately when the pool is empty and
    /// `ShuttingDown` if the pool is shut down while waiting.
    pub async fn acquire(&self) -> Result<ApiKey> {
        self.acquire_with_cancel(std::future::pending::<()>()).await
    }

    /// Like [`acquire`](Self::acquire), but gives up with `Cancelled` as soon
    /// as `cancel` completes.
    pub async fn acquire_with_cancel<F>(&self, cancel: F) -> Result<ApiKey>
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let mut shutdown = self.shutdown.subscribe();
        tokio::pin!(cancel);

        loop {
            if *shutdown.borrow_and_update() {
                return Err(Error::ShuttingDown);
            }

            // Registered before reading the map so a sweep landing between the
            // read and the wait is not missed.
            let cooled = self.cooled.notified();
            tokio::pin!(cooled);
            cooled.as_mut().enable();

            if let Some(key) = self.try_acquire().await? {
                metrics::counter!("key_pool_acquire_total").increment(1);
                metrics::histogram!("key_pool_acquire_wait_seconds")
                    .record(started.elapsed().as_secs_f64());
                return Ok(key);
            }

            let min = self.minimum_cooldown().await;
            if min.is_ready() {
                // A key became ready (or was penalized again) between the two
                // reads. Re-check right away.
                tokio::task::yield_now().await;
                continue;
            }

            let wait = min.as_duration(self.config.tick_interval);
            info!(
                wait_secs = wait.as_secs_f64(),
                "all keys cooling down, waiting for the next ready key"
            );

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cooled => {}
                _ = shutdown.wait_for(|stopped| *stopped) => return Err(Error::ShuttingDown),
                _ = &mut cancel => {
                    debug!("key acquisition cancelled by caller");
                    return Err(Error::Cancelled);
                }
            }
        }
    }

    /// Pick a ready key without waiting.
    ///
    /// `Ok(None)` means keys exist but all are cooling down.
    pub async fn try_acquire(&self) -> Result<Option<ApiKey>> {
        let keys = self.keys.read_locked().await;
        if keys.is_empty() {
            return Err(Error::NoAvailableKeys);
        }
        Ok(pick_ready(&keys))
    }

    /// Set a key's cooldown.
    ///
    /// Unknown keys are ignored: the key may have been removed concurrently,
    /// and a penalty must never bring it back.
    pub async fn penalize(&self, key: &ApiKey, cooldown: Cooldown) {
        let mut keys = self.keys.write_locked().await;
        match keys.get_mut(key) {
            Some(current) => {
                let lowered = cooldown < *current;
                *current = cooldown;
                if lowered {
                    self.cooled.notify_waiters();
                }
                metrics::counter!("key_pool_penalties_total").increment(1);
                record_ready(&keys);
                info!(
                    key = %key,
                    cooldown_secs = cooldown.as_duration(self.config.tick_interval).as_secs(),
                    "key penalized, cooling down"
                );
            }
            None => debug!(key = %key, "penalize ignored, key not in pool"),
        }
    }

    /// Penalize for a wall-clock duration, rounded up to whole ticks.
    pub async fn penalize_for(&self, key: &ApiKey, duration: Duration) {
        let cooldown = Cooldown::from_duration(duration, self.config.tick_interval);
        self.penalize(key, cooldown).await;
    }

    /// Penalize with the configured rate-limit cooldown.
    pub async fn penalize_rate_limited(&self, key: &ApiKey) {
        self.penalize_for(key, self.config.rate_limit_cooldown).await;
    }

    /// Penalize from a signed tick count (admin input and the like).
    ///
    /// Negative values are rejected with `InvalidCooldown` and leave the pool
    /// untouched.
    pub async fn penalize_ticks(&self, key: &ApiKey, ticks: i64) -> Result<()> {
        let cooldown = Cooldown::try_from(ticks)?;
        self.penalize(key, cooldown).await;
        Ok(())
    }

    /// Stop managing a key. Idempotent.
    ///
    /// Waiters are woken so that emptying the pool fails them with
    /// `NoAvailableKeys` instead of leaving them asleep.
    pub async fn remove(&self, key: &ApiKey) {
        let mut keys = self.keys.write_locked().await;
        if keys.remove(key).is_some() {
            metrics::counter!("key_pool_keys_removed_total").increment(1);
            record_ready(&keys);
            info!(key = %key, remaining = keys.len(), "key removed from pool");
            self.cooled.notify_waiters();
        }
    }

    /// Smallest cooldown among managed keys, `READY` when the pool is empty.
    ///
    /// Only a hint for how long to wait; it may be stale by the time the
    /// caller acts on it.
    pub async fn minimum_cooldown(&self) -> Cooldown {
        let keys = self.keys.read_locked().await;
        keys.values().copied().min().unwrap_or(Cooldown::READY)
    }

    /// Current cooldown of a key, `None` if it is not managed.
    pub async fn cooldown_of(&self, key: &ApiKey) -> Option<Cooldown> {
        self.keys.read_locked().await.get(key).copied()
    }

    /// Snapshot of all managed keys.
    pub async fn keys(&self) -> Vec<ApiKey> {
        self.keys.read_locked().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.keys.read_locked().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.keys.read_locked().await.is_empty()
    }

    /// One decay sweep: every positive cooldown drops by exactly one tick.
    ///
    /// The whole sweep runs under a single exclusive acquisition, so readers
    /// see either all keys before the sweep or all keys after it.
    pub(crate) async fn decay_once(&self) {
        let mut keys = self.keys.write_locked().await;
        let mut ready = 0usize;
        let mut expired = 0usize;
        for (key, cooldown) in keys.iter_mut() {
            if cooldown.is_ready() {
                ready += 1;
                continue;
            }
            *cooldown = cooldown.decremented();
            if cooldown.is_ready() {
                ready += 1;
                expired += 1;
                info!(key = %key, "cooldown expired, key available again");
            }
        }
        metrics::gauge!("key_pool_keys_ready").set(ready as f64);
        if expired > 0 {
            self.cooled.notify_waiters();
        }
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: all keys ready → healthy, some ready → degraded,
    /// none ready or no keys → unhealthy. Keys are listed by fingerprint.
    pub async fn health(&self) -> serde_json::Value {
        let keys = self.keys.read_locked().await;
        let tick = self.config.tick_interval;

        let mut entries: Vec<(&ApiKey, Cooldown)> = keys.iter().map(|(k, c)| (k, *c)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut listed = Vec::with_capacity(entries.len());
        let mut ready_count = 0usize;
        for (key, cooldown) in entries {
            if cooldown.is_ready() {
                ready_count += 1;
                listed.push(serde_json::json!({
                    "key": key.fingerprint(),
                    "status": "ready",
                }));
            } else {
                listed.push(serde_json::json!({
                    "key": key.fingerprint(),
                    "status": "cooling_down",
                    "cooldown_remaining_secs": cooldown.as_duration(tick).as_secs(),
                }));
            }
        }

        let total = keys.len();
        let status = if ready_count == total && total > 0 {
            "healthy"
        } else if ready_count > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "keys_total": total,
            "keys_ready": ready_count,
            "keys_cooling_down": total - ready_count,
            "keys": listed,
        })
    }

    /// Stop the decay task and release every waiting acquirer with
    /// `ShuttingDown`. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!("key pool shutting down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been called.
    pub async fn shut_down(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Drop for KeyPool {
    fn drop(&mut self) {
        if let Some(handle) = self.decay_task.get() {
            handle.abort();
        }
    }
}

/// Uniform random choice among keys with zero cooldown.
fn pick_ready(keys: &HashMap<ApiKey, Cooldown>) -> Option<ApiKey> {
    let ready: Vec<&ApiKey> = keys
        .iter()
        .filter(|(_, cooldown)| cooldown.is_ready())
        .map(|(key, _)| key)
        .collect();
    if ready.is_empty() {
        return None;
    }
    let index = rand::rng().random_range(0..ready.len());
    Some(ready[index].clone())
}

fn record_ready(keys: &HashMap<ApiKey, Cooldown>) {
    let ready = keys.values().filter(|cooldown| cooldown.is_ready()).count();
    metrics::gauge!("key_pool_keys_ready").set(ready as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn key(s: &str) -> ApiKey {
        ApiKey::from(s)
    }

    fn pool_of(keys: &[&str]) -> Arc<KeyPool> {
        KeyPool::new(keys.iter().copied(), PoolConfig::default())
    }

    #[tokio::test]
    async fn new_pool_collapses_duplicates_and_starts_ready() {
        let pool = pool_of(&["k1", "k2", "k1"]);
        assert_eq!(pool.len().await, 2);
        assert_eq!(pool.cooldown_of(&key("k1")).await, Some(Cooldown::READY));
        assert_eq!(pool.cooldown_of(&key("k2")).await, Some(Cooldown::READY));
    }

    #[tokio::test]
    async fn acquire_returns_managed_key() {
        let pool = pool_of(&["k1", "k2", "k3"]);
        let managed: HashSet<ApiKey> = pool.keys().await.into_iter().collect();
        for _ in 0..100 {
            let k = pool.acquire().await.unwrap();
            assert!(managed.contains(&k));
        }
    }

    #[tokio::test]
    async fn selection_is_spread_across_ready_keys() {
        let pool = pool_of(&["k1", "k2", "k3", "k4"]);
        let mut counts: HashMap<ApiKey, usize> = HashMap::new();
        for _ in 0..4000 {
            *counts.entry(pool.acquire().await.unwrap()).or_default() += 1;
        }
        assert_eq!(counts.len(), 4, "every key must be selected at least once");
        for (k, n) in &counts {
            // Expected ~1000 each; a uniform pick lands far inside this band.
            assert!(*n > 600 && *n < 1400, "{k} selected {n} times out of 4000");
        }
    }

    #[tokio::test]
    async fn empty_pool_fails_instead_of_blocking() {
        let pool = KeyPool::new(Vec::<String>::new(), PoolConfig::default());
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableKeys));
        assert!(matches!(
            pool.try_acquire().await.unwrap_err(),
            Error::NoAvailableKeys
        ));
    }

    #[tokio::test]
    async fn penalized_key_is_excluded_immediately() {
        let pool = pool_of(&["k1", "k2"]);
        pool.penalize(&key("k1"), Cooldown::from_ticks(60)).await;
        for _ in 0..200 {
            assert_eq!(pool.acquire().await.unwrap(), key("k2"));
        }
    }

    #[tokio::test]
    async fn penalize_unknown_key_is_noop() {
        let pool = pool_of(&["k1"]);
        pool.penalize(&key("ghost"), Cooldown::from_ticks(60)).await;
        assert_eq!(pool.len().await, 1);
        assert_eq!(pool.cooldown_of(&key("ghost")).await, None);
    }

    #[tokio::test]
    async fn penalize_zero_leaves_key_ready() {
        let pool = pool_of(&["k1"]);
        pool.penalize(&key("k1"), Cooldown::READY).await;
        assert_eq!(pool.try_acquire().await.unwrap(), Some(key("k1")));
    }

    #[tokio::test]
    async fn negative_penalty_rejected_and_state_unchanged() {
        let pool = pool_of(&["k1"]);
        pool.penalize(&key("k1"), Cooldown::from_ticks(5)).await;

        let err = pool.penalize_ticks(&key("k1"), -3).await.unwrap_err();
        assert!(matches!(err, Error::InvalidCooldown(-3)));
        assert_eq!(pool.cooldown_of(&key("k1")).await, Some(Cooldown::from_ticks(5)));

        pool.penalize_ticks(&key("k1"), 9).await.unwrap();
        assert_eq!(pool.cooldown_of(&key("k1")).await, Some(Cooldown::from_ticks(9)));
    }

    #[tokio::test]
    async fn penalize_for_rounds_up_to_ticks() {
        let pool = pool_of(&["k1"]);
        pool.penalize_for(&key("k1"), Duration::from_millis(2500)).await;
        assert_eq!(pool.cooldown_of(&key("k1")).await, Some(Cooldown::from_ticks(3)));
    }

    #[tokio::test]
    async fn penalize_rate_limited_uses_configured_cooldown() {
        let pool = KeyPool::new(
            ["k1"],
            PoolConfig {
                rate_limit_cooldown: Duration::from_secs(90),
                ..PoolConfig::default()
            },
        );
        pool.penalize_rate_limited(&key("k1")).await;
        assert_eq!(pool.cooldown_of(&key("k1")).await, Some(Cooldown::from_ticks(90)));
    }

    #[tokio::test]
    async fn remove_is_permanent_and_idempotent() {
        let pool = pool_of(&["k1", "k2"]);
        pool.remove(&key("k1")).await;
        pool.remove(&key("k1")).await;

        // A late penalty must not bring the key back
        pool.penalize(&key("k1"), Cooldown::READY).await;

        assert_eq!(pool.keys().await, vec![key("k2")]);
        for _ in 0..100 {
            assert_eq!(pool.acquire().await.unwrap(), key("k2"));
        }
    }

    #[tokio::test]
    async fn removing_every_key_makes_acquire_fail() {
        let pool = pool_of(&["k1"]);
        pool.remove(&key("k1")).await;
        assert!(pool.is_empty().await);
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            Error::NoAvailableKeys
        ));
    }

    #[tokio::test]
    async fn minimum_cooldown_reports_smallest() {
        let pool = pool_of(&["k1", "k2", "k3"]);
        assert_eq!(pool.minimum_cooldown().await, Cooldown::READY);

        pool.penalize(&key("k1"), Cooldown::from_ticks(30)).await;
        pool.penalize(&key("k2"), Cooldown::from_ticks(10)).await;
        pool.penalize(&key("k3"), Cooldown::from_ticks(20)).await;
        assert_eq!(pool.minimum_cooldown().await, Cooldown::from_ticks(10));
    }

    #[tokio::test]
    async fn minimum_cooldown_of_empty_pool_is_zero() {
        let pool = KeyPool::new(Vec::<String>::new(), PoolConfig::default());
        assert_eq!(pool.minimum_cooldown().await, Cooldown::READY);
    }

    #[tokio::test]
    async fn try_acquire_returns_none_when_all_cooling() {
        let pool = pool_of(&["k1"]);
        pool.penalize(&key("k1"), Cooldown::from_ticks(3)).await;
        assert_eq!(pool.try_acquire().await.unwrap(), None);
    }

    #[tokio::test]
    async fn decay_sweep_lowers_positive_cooldowns_by_one() {
        let pool = pool_of(&["k1", "k2", "k3"]);
        pool.penalize(&key("k1"), Cooldown::from_ticks(3)).await;
        pool.penalize(&key("k2"), Cooldown::from_ticks(1)).await;

        pool.decay_once().await;
        assert_eq!(pool.cooldown_of(&key("k1")).await, Some(Cooldown::from_ticks(2)));
        assert_eq!(pool.cooldown_of(&key("k2")).await, Some(Cooldown::READY));
        assert_eq!(pool.cooldown_of(&key("k3")).await, Some(Cooldown::READY));

        pool.decay_once().await;
        pool.decay_once().await;
        pool.decay_once().await;
        assert_eq!(pool.cooldown_of(&key("k1")).await, Some(Cooldown::READY));
    }

    #[tokio::test(start_paused = true)]
    async fn penalized_key_returns_after_cooldown_ticks() {
        let pool = pool_of(&["k1", "k2"]);
        pool.penalize(&key("k1"), Cooldown::from_ticks(60)).await;

        tokio::time::sleep(Duration::from_millis(59_500)).await;
        assert_eq!(pool.cooldown_of(&key("k1")).await, Some(Cooldown::from_ticks(1)));
        for _ in 0..50 {
            assert_eq!(pool.acquire().await.unwrap(), key("k2"));
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pool.cooldown_of(&key("k1")).await, Some(Cooldown::READY));

        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(pool.acquire().await.unwrap());
        }
        assert!(seen.contains(&key("k1")), "k1 must be selectable again");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_minimum_cooldown() {
        let pool = pool_of(&["k1", "k2"]);
        pool.penalize(&key("k1"), Cooldown::from_ticks(10)).await;
        pool.penalize(&key("k2"), Cooldown::from_ticks(3)).await;

        let started = tokio::time::Instant::now();
        let k = pool.acquire().await.unwrap();
        let waited = started.elapsed();

        assert_eq!(k, key("k2"));
        assert!(waited >= Duration::from_secs(3), "waited {waited:?}");
        assert!(waited < Duration::from_secs(5), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_acquirer_does_not_block_writers() {
        let pool = pool_of(&["k1", "k2"]);
        pool.penalize(&key("k1"), Cooldown::from_ticks(100)).await;
        pool.penalize(&key("k2"), Cooldown::from_ticks(100)).await;

        let started = tokio::time::Instant::now();
        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!waiter.is_finished());

        // These need the write lock; they would hang if the waiter held it.
        pool.remove(&key("k1")).await;
        pool.penalize(&key("k2"), Cooldown::from_ticks(1)).await;

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, key("k2"));
        // Lowering the cooldown wakes the waiter; it must not sleep out the
        // original 100 ticks.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_waiters() {
        let pool = pool_of(&["k1"]);
        pool.penalize(&key("k1"), Cooldown::from_ticks(3600)).await;

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await });
        tokio::time::sleep(Duration::from_secs(5)).await;

        pool.shutdown();
        pool.shutdown();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
        assert!(pool.is_shut_down());
        assert!(matches!(pool.acquire().await.unwrap_err(), Error::ShuttingDown));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_with_cancel_gives_up() {
        let pool = pool_of(&["k1"]);
        pool.penalize(&key("k1"), Cooldown::from_ticks(3600)).await;

        let err = pool
            .acquire_with_cancel(tokio::time::sleep(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_decay() {
        let pool = pool_of(&["k1"]);
        pool.penalize(&key("k1"), Cooldown::from_ticks(10)).await;
        pool.shutdown();
        pool.shut_down().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(pool.cooldown_of(&key("k1")).await, Some(Cooldown::from_ticks(10)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_only_return_managed_keys() {
        let pool = pool_of(&["k1", "k2", "k3"]);
        let managed: HashSet<ApiKey> = pool.keys().await.into_iter().collect();

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let mut got = Vec::with_capacity(100);
                for _ in 0..100 {
                    got.push(pool.acquire().await.unwrap());
                }
                got
            }));
        }

        let mut total = 0;
        for task in tasks {
            for k in task.await.unwrap() {
                assert!(managed.contains(&k));
                total += 1;
            }
        }
        assert_eq!(total, 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn removal_during_concurrent_acquires_is_consistent() {
        let pool = pool_of(&["k1", "k2"]);

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..20 {
                    got.push(pool.acquire().await.unwrap());
                    tokio::task::yield_now().await;
                }
                got
            }));
        }

        tokio::task::yield_now().await;
        pool.remove(&key("k1")).await;

        for task in tasks {
            for k in task.await.unwrap() {
                assert!(k == key("k1") || k == key("k2"));
            }
        }
        // Once removal has completed, only k2 can come back
        for _ in 0..100 {
            assert_eq!(pool.acquire().await.unwrap(), key("k2"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn contended_acquire_never_returns_cooling_key() {
        let pool = pool_of(&["k1", "k2", "k3"]);
        pool.penalize(&key("k1"), Cooldown::from_ticks(3600)).await;
        pool.penalize(&key("k2"), Cooldown::from_ticks(3600)).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..50 {
                    got.push(pool.acquire().await.unwrap());
                }
                got
            }));
        }
        for task in tasks {
            for k in task.await.unwrap() {
                assert_eq!(k, key("k3"));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_all_served_once_key_returns() {
        let pool = pool_of(&["k1"]);
        pool.penalize(&key("k1"), Cooldown::from_ticks(2)).await;

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move { pool.acquire().await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), key("k1"));
        }
    }

    #[tokio::test]
    async fn pool_operations_are_recorded_as_metrics() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let pool = pool_of(&["k1", "k2"]);
        pool.acquire().await.unwrap();
        pool.penalize(&key("k1"), Cooldown::from_ticks(5)).await;
        pool.remove(&key("k2")).await;

        let output = handle.render();
        assert!(output.contains("key_pool_acquire_total 1"), "got: {output}");
        assert!(output.contains("key_pool_penalties_total 1"), "got: {output}");
        assert!(output.contains("key_pool_keys_removed_total 1"), "got: {output}");
        assert!(output.contains("key_pool_keys_ready"), "got: {output}");
        assert!(output.contains("key_pool_acquire_wait_seconds"), "got: {output}");
    }

    #[tokio::test(start_paused = true)]
    async fn ready_gauge_follows_penalize_and_remove() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let pool = pool_of(&["k1", "k2", "k3"]);
        assert!(handle.render().contains("key_pool_keys_ready 3"));

        pool.penalize(&key("k1"), Cooldown::from_ticks(60)).await;
        let output = handle.render();
        assert!(output.contains("key_pool_keys_ready 2"), "got: {output}");

        pool.remove(&key("k2")).await;
        let output = handle.render();
        assert!(output.contains("key_pool_keys_ready 1"), "got: {output}");
    }

    #[tokio::test(start_paused = true)]
    async fn removing_last_key_releases_waiter() {
        let pool = pool_of(&["k1"]);
        pool.penalize(&key("k1"), Cooldown::from_ticks(3600)).await;

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let started = tokio::time::Instant::now();
                (pool.acquire().await, started.elapsed())
            })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!waiter.is_finished());

        pool.remove(&key("k1")).await;
        let (result, waited) = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::NoAvailableKeys)), "got {result:?}");
        assert!(waited < Duration::from_secs(5), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn removing_one_of_several_cooling_keys_keeps_waiter_waiting() {
        let pool = pool_of(&["k1", "k2"]);
        pool.penalize(&key("k1"), Cooldown::from_ticks(3600)).await;
        pool.penalize(&key("k2"), Cooldown::from_ticks(3)).await;

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        pool.remove(&key("k1")).await;

        assert_eq!(waiter.await.unwrap().unwrap(), key("k2"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_tick_interval_is_raised_to_minimum() {
        let pool = KeyPool::new(
            ["k1"],
            PoolConfig {
                tick_interval: Duration::ZERO,
                ..PoolConfig::default()
            },
        );
        assert_eq!(pool.config().tick_interval, MIN_TICK_INTERVAL);

        pool.penalize(&key("k1"), Cooldown::from_ticks(10)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.cooldown_of(&key("k1")).await, Some(Cooldown::READY));
    }

    #[tokio::test]
    async fn health_all_ready_is_healthy() {
        let pool = pool_of(&["sk-first-key-0001", "sk-second-key-0002"]);
        let health = pool.health().await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["keys_total"], 2);
        assert_eq!(health["keys_ready"], 2);
    }

    #[tokio::test]
    async fn health_some_ready_is_degraded() {
        let pool = pool_of(&["sk-first-key-0001", "sk-second-key-0002"]);
        pool.penalize(&key("sk-first-key-0001"), Cooldown::from_ticks(60))
            .await;

        let health = pool.health().await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["keys_cooling_down"], 1);
    }

    #[tokio::test]
    async fn health_empty_pool_is_unhealthy() {
        let pool = KeyPool::new(Vec::<String>::new(), PoolConfig::default());
        let health = pool.health().await;
        assert_eq!(health["status"], "unhealthy");
        assert_eq!(health["keys_total"], 0);
    }

    #[tokio::test]
    async fn health_lists_fingerprints_not_raw_keys() {
        let pool = pool_of(&["sk-secret-value-9876"]);
        pool.penalize(&key("sk-secret-value-9876"), Cooldown::from_ticks(42))
            .await;

        let health = pool.health().await;
        let rendered = health.to_string();
        assert!(!rendered.contains("secret-value"), "got: {rendered}");

        let entry = &health["keys"][0];
        assert_eq!(entry["key"], "sk-\u{2026}9876");
        assert_eq!(entry["status"], "cooling_down");
        assert_eq!(entry["cooldown_remaining_secs"], 42);
    }
}
