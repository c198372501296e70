// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The Sandbox Pool & Dispatcher (C3): one warm pool per language tag, MRU reuse, and a
//! background sweeper that evicts idle sandboxes past their TTL/age/overflow thresholds. Shaped
//! after the nailgun warm-process pool's acquire/release/sweep idiom, generalized from a single
//! process type to an arbitrary `SandboxRuntime`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use config::{Config, Language};
use parking_lot::Mutex;
use task_executor::Executor;
use telemetry::{Counter, TelemetryRecorder};
use uuid::Uuid;

use crate::driver::{Limits, NetworkId, SandboxId, SandboxRuntime};
use crate::error::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Spawning,
    Idle,
    Leased,
    Draining,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseId(pub String);

/// The exclusive right to execute one job in a specific sandbox.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: LeaseId,
    pub sandbox_id: SandboxId,
    pub session_id: String,
    pub acquired_at: Instant,
}

/// Outcome a caller reports back at `Release`, used to decide idle-vs-draining (the explicit
/// separation of "idle" from "healthy" — the reuse criterion is purely `state == Idle`, never
/// inferred from the last release outcome after that transition has happened).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Healthy,
    Unhealthy,
}

struct SandboxRecord {
    language: Language,
    state: SandboxState,
    created_at: Instant,
    last_used_at: Instant,
    reuse_count: u64,
    network_id: NetworkId,
}

struct PoolState {
    /// Idle sandboxes per language, front = most recently used.
    idle: HashMap<Language, VecDeque<SandboxId>>,
    sandboxes: HashMap<SandboxId, SandboxRecord>,
    leases: HashMap<LeaseId, Lease>,
}

impl PoolState {
    fn new() -> Self {
        PoolState {
            idle: HashMap::new(),
            sandboxes: HashMap::new(),
            leases: HashMap::new(),
        }
    }

    fn total_count(&self) -> usize {
        self.sandboxes.len()
    }
}

pub struct SandboxPool<R: SandboxRuntime> {
    runtime: Arc<R>,
    telemetry: TelemetryRecorder,
    config: Arc<Config>,
    state: Mutex<PoolState>,
}

impl<R: SandboxRuntime + 'static> SandboxPool<R> {
    pub fn new(runtime: Arc<R>, telemetry: TelemetryRecorder, config: Arc<Config>) -> Arc<Self> {
        Arc::new(SandboxPool {
            runtime,
            telemetry,
            config,
            state: Mutex::new(PoolState::new()),
        })
    }

    pub fn total_sandboxes(&self) -> usize {
        self.state.lock().total_count()
    }

    /// The underlying driver, for callers (the execution pipeline) that need to `copy`/`exec`
    /// inside an already-leased sandbox. The pool itself never calls these directly outside of
    /// `Acquire`/`Release`/the sweeper.
    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    /// Acquire(language) → Lease. Policy, in order: reuse the MRU idle sandbox of the requested
    /// language; otherwise evict the global LRU idle sandbox if at `max_sandboxes`, then spawn a
    /// fresh one.
    pub async fn acquire(
        &self,
        language: Language,
        session_id: &str,
        image: &str,
    ) -> Result<(Lease, bool), SandboxError> {
        if let Some(sandbox_id) = self.try_pop_idle(language) {
            let lease = self.lease_sandbox(sandbox_id, session_id);
            self.telemetry.increment_counter(Counter::SandboxReused, 1);
            return Ok((lease, true));
        }

        self.evict_if_at_capacity().await;

        let network_id = self
            .runtime
            .network_create()
            .await
            .map_err(|e| {
                log::warn!("failed to create sandbox network: {e}");
                e
            })?;

        self.telemetry
            .increment_counter(Counter::SandboxSpawnAttempted, 1);
        let spawn_result = tokio::time::timeout(
            self.config.spawn_timeout.as_duration(),
            self.runtime.spawn(image, &network_id, &Limits::default()),
        )
        .await;

        let sandbox_id = match spawn_result {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                self.telemetry
                    .increment_counter(Counter::SandboxSpawnFailed, 1);
                let _ = self.runtime.network_destroy(&network_id).await;
                return Err(e);
            }
            Err(_) => {
                self.telemetry
                    .increment_counter(Counter::SandboxSpawnFailed, 1);
                let _ = self.runtime.network_destroy(&network_id).await;
                return Err(SandboxError::ReadinessTimeout(
                    self.config.spawn_timeout.as_duration(),
                ));
            }
        };

        self.telemetry
            .increment_counter(Counter::SandboxSpawnSucceeded, 1);

        let now = Instant::now();
        {
            let mut state = self.state.lock();
            state.sandboxes.insert(
                sandbox_id.clone(),
                SandboxRecord {
                    language,
                    state: SandboxState::Leased,
                    created_at: now,
                    last_used_at: now,
                    reuse_count: 0,
                    network_id,
                },
            );
        }

        let lease = self.lease_sandbox(sandbox_id, session_id);
        Ok((lease, false))
    }

    fn try_pop_idle(&self, language: Language) -> Option<SandboxId> {
        let mut state = self.state.lock();
        let id = state.idle.get_mut(&language)?.pop_front()?;
        if let Some(record) = state.sandboxes.get_mut(&id) {
            record.state = SandboxState::Leased;
        }
        Some(id)
    }

    fn lease_sandbox(&self, sandbox_id: SandboxId, session_id: &str) -> Lease {
        let lease = Lease {
            id: LeaseId(Uuid::new_v4().to_string()),
            sandbox_id,
            session_id: session_id.to_string(),
            acquired_at: Instant::now(),
        };
        self.state
            .lock()
            .leases
            .insert(lease.id.clone(), lease.clone());
        lease
    }

    /// If at `max_sandboxes`, evict the single global LRU idle sandbox before spawning a new
    /// one. By construction (admission caps concurrency ≤ max_sandboxes) this never needs to
    /// block on an empty idle set.
    async fn evict_if_at_capacity(&self) {
        let at_capacity = {
            let state = self.state.lock();
            state.total_count() >= self.config.max_sandboxes
        };
        if !at_capacity {
            return;
        }
        if let Some(victim) = self.pick_global_lru_idle() {
            self.drain_and_destroy(victim).await;
        }
    }

    fn pick_global_lru_idle(&self) -> Option<SandboxId> {
        let state = self.state.lock();
        state
            .idle
            .values()
            .flatten()
            .min_by_key(|id| state.sandboxes.get(*id).map(|r| r.last_used_at))
            .cloned()
    }

    /// Release(lease, outcome). Healthy releases return the sandbox to the front of its pool as
    /// MRU; unhealthy releases drain and destroy it. The release itself is tracked against
    /// `release_timeout`: a slow runtime destroy is force-abandoned (logged, not retried) rather
    /// than blocking the caller's Cleanup stage indefinitely.
    pub async fn release(&self, lease_id: &LeaseId, outcome: ReleaseOutcome) -> Result<(), SandboxError> {
        let (sandbox_id, language) = {
            let mut state = self.state.lock();
            let lease = state
                .leases
                .remove(lease_id)
                .ok_or_else(|| SandboxError::Unavailable("unknown lease".to_string()))?;
            let language = state
                .sandboxes
                .get(&lease.sandbox_id)
                .map(|r| r.language)
                .unwrap_or(Language::Python);
            (lease.sandbox_id, language)
        };

        match outcome {
            ReleaseOutcome::Healthy => {
                let mut state = self.state.lock();
                if let Some(record) = state.sandboxes.get_mut(&sandbox_id) {
                    record.state = SandboxState::Idle;
                    record.last_used_at = Instant::now();
                    record.reuse_count += 1;
                }
                state.idle.entry(language).or_default().push_front(sandbox_id);
                Ok(())
            }
            ReleaseOutcome::Unhealthy => {
                let result = tokio::time::timeout(
                    self.config.release_timeout.as_duration(),
                    self.drain_and_destroy(sandbox_id.clone()),
                )
                .await;
                if result.is_err() {
                    log::warn!(
                        "sandbox {sandbox_id} destroy exceeded release_timeout; abandoning asynchronously"
                    );
                }
                Ok(())
            }
        }
    }

    /// Transitions a sandbox to `Draining`, calls the runtime's `destroy`/`network_destroy`, then
    /// removes it once the runtime confirms `Gone`.
    async fn drain_and_destroy(&self, sandbox_id: SandboxId) {
        let network_id = {
            let mut state = self.state.lock();
            for ids in state.idle.values_mut() {
                ids.retain(|id| *id != sandbox_id);
            }
            state
                .sandboxes
                .get_mut(&sandbox_id)
                .map(|record| {
                    record.state = SandboxState::Draining;
                    record.network_id.clone()
                })
        };

        if let Err(e) = self.runtime.destroy(&sandbox_id).await {
            log::warn!("failed to destroy sandbox {sandbox_id}: {e}");
        }
        if let Some(network_id) = network_id {
            if let Err(e) = self.runtime.network_destroy(&network_id).await {
                log::warn!("failed to destroy network for sandbox {sandbox_id}: {e}");
            }
        }

        self.state.lock().sandboxes.remove(&sandbox_id);
        self.telemetry
            .increment_counter(telemetry::Counter::SandboxDestroyed, 1);
    }

    /// One sweep: evict idle sandboxes past `idle_ttl`/`max_age`, then trim idle overflow beyond
    /// `per_lang_warm_cap` per language.
    async fn sweep_once(self: &Arc<Self>) {
        let now = Instant::now();
        let idle_ttl = self.config.idle_ttl.as_duration();
        let max_age = self.config.max_age.as_duration();
        let warm_cap = self.config.per_lang_warm_cap;

        let mut victims = Vec::new();
        {
            let state = self.state.lock();
            for (language, ids) in state.idle.iter() {
                for (position, id) in ids.iter().enumerate() {
                    let Some(record) = state.sandboxes.get(id) else {
                        continue;
                    };
                    let too_idle = now.duration_since(record.last_used_at) > idle_ttl;
                    let too_old = now.duration_since(record.created_at) > max_age;
                    let overflow = position >= warm_cap;
                    if too_idle || too_old || overflow {
                        victims.push(id.clone());
                    }
                }
                let _ = language;
            }
        }
        victims.dedup();

        for victim in victims {
            self.telemetry
                .increment_counter(telemetry::Counter::SandboxEvicted, 1);
            self.drain_and_destroy(victim).await;
        }
    }

    /// Spawns the background sweeper as a named task on `executor`, running until the executor
    /// shuts down. Runs periodically, default every 30s.
    pub fn spawn_sweeper(self: &Arc<Self>, executor: &Executor) {
        let pool = self.clone();
        let interval = self.config.sweep_interval.as_duration().max(Duration::from_millis(100));
        executor.native_spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                pool.sweep_once().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeRuntime;

    fn test_config() -> Arc<Config> {
        Arc::new(Config::default())
    }

    #[tokio::test]
    async fn acquire_spawns_fresh_sandbox_when_pool_empty() {
        let pool = SandboxPool::new(Arc::new(FakeRuntime::new()), TelemetryRecorder::new(10), test_config());
        let (lease, reused) = pool.acquire(Language::Python, "s1", "image").await.unwrap();
        assert!(!reused);
        assert_eq!(pool.total_sandboxes(), 1);
        pool.release(&lease.id, ReleaseOutcome::Healthy).await.unwrap();
    }

    #[tokio::test]
    async fn healthy_release_makes_sandbox_reusable() {
        let pool = SandboxPool::new(Arc::new(FakeRuntime::new()), TelemetryRecorder::new(10), test_config());
        let (lease, _) = pool.acquire(Language::Python, "s1", "image").await.unwrap();
        let sandbox_id = lease.sandbox_id.clone();
        pool.release(&lease.id, ReleaseOutcome::Healthy).await.unwrap();

        let (lease2, reused) = pool.acquire(Language::Python, "s2", "image").await.unwrap();
        assert!(reused);
        assert_eq!(lease2.sandbox_id, sandbox_id);
        pool.release(&lease2.id, ReleaseOutcome::Healthy).await.unwrap();
    }

    #[tokio::test]
    async fn unhealthy_release_destroys_sandbox() {
        let pool = SandboxPool::new(Arc::new(FakeRuntime::new()), TelemetryRecorder::new(10), test_config());
        let (lease, _) = pool.acquire(Language::Python, "s1", "image").await.unwrap();
        pool.release(&lease.id, ReleaseOutcome::Unhealthy).await.unwrap();
        assert_eq!(pool.total_sandboxes(), 0);

        let (_, reused) = pool.acquire(Language::Python, "s2", "image").await.unwrap();
        assert!(!reused, "destroyed sandbox must not be reused");
    }

    #[tokio::test]
    async fn total_sandboxes_never_exceeds_max_sandboxes() {
        let mut config = Config::default();
        config.max_sandboxes = 1;
        let pool = SandboxPool::new(Arc::new(FakeRuntime::new()), TelemetryRecorder::new(10), Arc::new(config));

        let (lease1, _) = pool.acquire(Language::Python, "s1", "image").await.unwrap();
        pool.release(&lease1.id, ReleaseOutcome::Healthy).await.unwrap();

        let (lease2, _) = pool.acquire(Language::Javascript, "s2", "image").await.unwrap();
        assert_eq!(pool.total_sandboxes(), 1, "capacity evicted the idle python sandbox");
        pool.release(&lease2.id, ReleaseOutcome::Healthy).await.unwrap();
    }

    #[tokio::test]
    async fn spawn_retry_after_failure_still_succeeds() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_next_spawns(1);
        let pool = SandboxPool::new(runtime, TelemetryRecorder::new(10), test_config());
        assert!(pool.acquire(Language::Python, "s1", "image").await.is_err());
        let (lease, reused) = pool.acquire(Language::Python, "s1", "image").await.unwrap();
        assert!(!reused);
        pool.release(&lease.id, ReleaseOutcome::Healthy).await.unwrap();
    }
}
