//! Component registry and resource accounting.
//!
//! Every pipeline component registers here with its declared dependencies.
//! The registry embeds one [`StateCell`] per component, accounts pool usage
//! per component and tier, and keeps the thread table the liveness sweep
//! walks. Records are only mutated under the Component-rank lock; state cells
//! are handed out as `Arc`s and transitioned with no registry lock held —
//! state is the outermost rank, so transitions must never nest inside the
//! registry lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{DuplexError, Result};
use crate::locks::{LockRank, RankedMutex};
use crate::monitor::Reporter;
use crate::pool::{PooledBuffer, Tier, TieredPool};
use crate::state::{ComponentState, StateCell};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Capture,
    Processing,
    Storage,
    Monitoring,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Failed,
}

/// A component's registration receipt: its name plus the shared state cell.
#[derive(Clone)]
pub struct ComponentHandle {
    name: String,
    cell: Arc<StateCell>,
}

impl ComponentHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cell(&self) -> &Arc<StateCell> {
        &self.cell
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub kind: ComponentKind,
    pub state: ComponentState,
    pub health: Health,
    pub threads: usize,
    pub allocated: [usize; 3],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A thread that missed its heartbeat deadline, as found by a sweep.
pub struct StaleThread {
    pub tid: u64,
    pub component: String,
    pub cell: Arc<StateCell>,
}

struct ComponentRecord {
    kind: ComponentKind,
    cell: Arc<StateCell>,
    dependencies: BTreeSet<String>,
    allocated: [usize; 3],
    threads: BTreeSet<u64>,
    health: Health,
    last_error: Option<String>,
}

struct ThreadEntry {
    component: String,
    last_tick: Instant,
}

struct RegistryInner {
    components: HashMap<String, ComponentRecord>,
    threads: HashMap<u64, ThreadEntry>,
    next_tid: u64,
}

pub struct ComponentCoordinator {
    pool: TieredPool,
    reporter: Reporter,
    history_cap: usize,
    /// Per-component buffer quota per tier; `None` leaves only the pool's
    /// own tier caps as the global bound.
    quota: Option<[usize; 3]>,
    inner: RankedMutex<RegistryInner>,
}

impl ComponentCoordinator {
    pub fn new(
        pool: TieredPool,
        reporter: Reporter,
        history_cap: usize,
        quota: Option<[usize; 3]>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            reporter,
            history_cap,
            quota,
            inner: RankedMutex::new(
                LockRank::Component,
                RegistryInner {
                    components: HashMap::new(),
                    threads: HashMap::new(),
                    next_tid: 1,
                },
            ),
        })
    }

    /// Register a component. Dependencies must already be registered, which
    /// keeps the dependency graph acyclic by construction; `add_dependency`
    /// re-checks explicitly for edges added later.
    pub fn register(
        &self,
        name: &str,
        kind: ComponentKind,
        dependencies: &[&str],
    ) -> Result<ComponentHandle> {
        let cell = Arc::new(StateCell::new(name, self.history_cap, self.reporter.clone()));
        let mut inner = self.inner.lock();
        if inner.components.contains_key(name) {
            return Err(DuplexError::DuplicateComponent { name: name.into() });
        }
        let mut deps = BTreeSet::new();
        for dep in dependencies {
            if !inner.components.contains_key(*dep) {
                return Err(DuplexError::UnknownComponent { name: (*dep).into() });
            }
            deps.insert((*dep).to_string());
        }
        inner.components.insert(
            name.to_string(),
            ComponentRecord {
                kind,
                cell: Arc::clone(&cell),
                dependencies: deps,
                allocated: [0; 3],
                threads: BTreeSet::new(),
                health: Health::Healthy,
                last_error: None,
            },
        );
        drop(inner);
        info!(component = name, ?kind, "component registered");
        Ok(ComponentHandle {
            name: name.to_string(),
            cell,
        })
    }

    /// Add a dependency edge after registration, rejecting cycles.
    pub fn add_dependency(&self, name: &str, dep: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.components.contains_key(dep) {
            return Err(DuplexError::UnknownComponent { name: dep.into() });
        }
        if Self::reaches(&inner, dep, name) {
            return Err(DuplexError::DependencyCycle { name: name.into() });
        }
        let record = inner
            .components
            .get_mut(name)
            .ok_or_else(|| DuplexError::UnknownComponent { name: name.into() })?;
        record.dependencies.insert(dep.to_string());
        Ok(())
    }

    fn reaches(inner: &RegistryInner, from: &str, target: &str) -> bool {
        if from == target {
            return true;
        }
        let mut stack = vec![from.to_string()];
        let mut seen = BTreeSet::new();
        while let Some(node) = stack.pop() {
            if !seen.insert(node.clone()) {
                continue;
            }
            if let Some(rec) = inner.components.get(&node) {
                for dep in &rec.dependencies {
                    if dep == target {
                        return true;
                    }
                    stack.push(dep.clone());
                }
            }
        }
        false
    }

    pub fn handle(&self, name: &str) -> Result<ComponentHandle> {
        let inner = self.inner.lock();
        let record = inner
            .components
            .get(name)
            .ok_or_else(|| DuplexError::UnknownComponent { name: name.into() })?;
        Ok(ComponentHandle {
            name: name.to_string(),
            cell: Arc::clone(&record.cell),
        })
    }

    /// Verify every declared dependency of `name` is at least IDLE. Called
    /// before a component leaves INITIALIZING.
    pub fn dependencies_ready(&self, name: &str) -> Result<()> {
        let deps: Vec<(String, Arc<StateCell>)> = {
            let inner = self.inner.lock();
            let record = inner
                .components
                .get(name)
                .ok_or_else(|| DuplexError::UnknownComponent { name: name.into() })?;
            record
                .dependencies
                .iter()
                .filter_map(|dep| {
                    inner
                        .components
                        .get(dep)
                        .map(|r| (dep.clone(), Arc::clone(&r.cell)))
                })
                .collect()
        };
        // State reads happen with the registry lock released.
        for (dep_name, cell) in deps {
            if !cell.current().is_at_least_idle() {
                return Err(DuplexError::DependencyNotReady { name: dep_name });
            }
        }
        Ok(())
    }

    /// Allocate from the pool on behalf of a component, enforcing the
    /// per-component tier quota.
    pub fn request_resource(&self, handle: &ComponentHandle, size: usize) -> Result<PooledBuffer> {
        let mut buf = self.pool.allocate(size).map_err(DuplexError::from)?;
        let tier = buf.tier();

        let verdict = {
            let mut inner = self.inner.lock();
            match inner.components.get_mut(&handle.name) {
                None => Err(DuplexError::UnknownComponent {
                    name: handle.name.clone(),
                }),
                Some(rec) => {
                    let over_quota = self
                        .quota
                        .map(|q| rec.allocated[tier.index()] + 1 > q[tier.index()])
                        .unwrap_or(false);
                    if over_quota {
                        Err(DuplexError::QuotaExceeded {
                            component: handle.name.clone(),
                            tier,
                        })
                    } else {
                        rec.allocated[tier.index()] += 1;
                        Ok(())
                    }
                }
            }
        };

        match verdict {
            Ok(()) => Ok(buf),
            Err(e) => {
                // The lease never reached the component; hand it straight back.
                let _ = self.pool.release(&mut buf);
                Err(e)
            }
        }
    }

    /// Release a component's buffer back to the pool. Under-release (more
    /// releases than recorded allocations) is refused before the pool is
    /// touched.
    pub fn release_resource(&self, handle: &ComponentHandle, buf: &mut PooledBuffer) -> Result<()> {
        let tier = buf.tier();
        {
            let mut inner = self.inner.lock();
            let rec = inner.components.get_mut(&handle.name).ok_or_else(|| {
                DuplexError::UnknownComponent {
                    name: handle.name.clone(),
                }
            })?;
            if rec.allocated[tier.index()] == 0 {
                return Err(DuplexError::UnknownBuffer { id: buf.id() });
            }
            rec.allocated[tier.index()] -= 1;
        }

        if let Err(e) = self.pool.release(buf) {
            // The counter was decremented optimistically; restore it.
            let mut inner = self.inner.lock();
            if let Some(rec) = inner.components.get_mut(&handle.name) {
                rec.allocated[tier.index()] += 1;
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub fn register_thread(&self, handle: &ComponentHandle) -> Result<u64> {
        let mut inner = self.inner.lock();
        if !inner.components.contains_key(&handle.name) {
            return Err(DuplexError::UnknownComponent {
                name: handle.name.clone(),
            });
        }
        let tid = inner.next_tid;
        inner.next_tid += 1;
        inner.threads.insert(
            tid,
            ThreadEntry {
                component: handle.name.clone(),
                last_tick: Instant::now(),
            },
        );
        if let Some(rec) = inner.components.get_mut(&handle.name) {
            rec.threads.insert(tid);
        }
        debug!(component = %handle.name, tid, "thread registered");
        Ok(tid)
    }

    /// Remove a thread from the table and from its owning component's set.
    /// Unknown tids (already swept) are a no-op.
    pub fn unregister_thread(&self, tid: u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.threads.remove(&tid) {
            if let Some(rec) = inner.components.get_mut(&entry.component) {
                rec.threads.remove(&tid);
            }
            debug!(component = %entry.component, tid, "thread unregistered");
        }
    }

    /// Heartbeat. Unknown tids are ignored (the thread may have been swept
    /// or unregistered during shutdown).
    pub fn thread_tick(&self, tid: u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.threads.get_mut(&tid) {
            entry.last_tick = Instant::now();
        } else {
            debug!(tid, "heartbeat from unregistered thread");
        }
    }

    /// Find threads whose last heartbeat is older than `timeout`, remove
    /// them from the table and mark their component failed. The caller
    /// (monitoring) reports and drives the state transition — with no
    /// registry lock held.
    pub fn liveness_sweep(&self, timeout: Duration) -> Vec<StaleThread> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let stale_tids: Vec<u64> = inner
            .threads
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_tick) > timeout)
            .map(|(tid, _)| *tid)
            .collect();

        let mut out = Vec::with_capacity(stale_tids.len());
        for tid in stale_tids {
            if let Some(entry) = inner.threads.remove(&tid) {
                if let Some(rec) = inner.components.get_mut(&entry.component) {
                    rec.threads.remove(&tid);
                    rec.health = Health::Failed;
                    rec.last_error = Some(format!("thread {tid} missed heartbeats"));
                    out.push(StaleThread {
                        tid,
                        component: entry.component,
                        cell: Arc::clone(&rec.cell),
                    });
                }
            }
        }
        out
    }

    /// Note a routed error against a component (monitoring calls this for
    /// every report). Does not change state; health degrades unless already
    /// failed.
    pub fn note_error(&self, name: &str, message: &str) {
        let mut inner = self.inner.lock();
        if let Some(rec) = inner.components.get_mut(name) {
            if rec.health == Health::Healthy {
                rec.health = Health::Degraded;
            }
            rec.last_error = Some(message.to_string());
        }
    }

    /// Sum of per-component allocation counters, per tier. At quiescence this
    /// matches the pool's own in-use totals.
    pub fn accounted_resources(&self) -> [usize; 3] {
        let inner = self.inner.lock();
        let mut totals = [0usize; 3];
        for rec in inner.components.values() {
            for (i, n) in rec.allocated.iter().enumerate() {
                totals[i] += n;
            }
        }
        totals
    }

    pub fn health(&self) -> HashMap<String, HealthReport> {
        // Collect under the registry lock, read states after releasing it
        // (state is an outer rank).
        let collected: Vec<(String, ComponentKind, Arc<StateCell>, Health, usize, [usize; 3], Option<String>)> = {
            let inner = self.inner.lock();
            inner
                .components
                .iter()
                .map(|(name, rec)| {
                    (
                        name.clone(),
                        rec.kind,
                        Arc::clone(&rec.cell),
                        rec.health,
                        rec.threads.len(),
                        rec.allocated,
                        rec.last_error.clone(),
                    )
                })
                .collect()
        };

        collected
            .into_iter()
            .map(|(name, kind, cell, health, threads, allocated, last_error)| {
                let state = cell.current();
                let health = if state == ComponentState::Error {
                    Health::Failed
                } else {
                    health
                };
                (
                    name,
                    HealthReport {
                        kind,
                        state,
                        health,
                        threads,
                        allocated,
                        last_error,
                    },
                )
            })
            .collect()
    }

    pub fn component_names(&self) -> Vec<String> {
        self.inner.lock().components.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (TieredPool, Arc<ComponentCoordinator>) {
        let pool = TieredPool::new([4, 4, 4], Duration::from_millis(50));
        let coordinator =
            ComponentCoordinator::new(pool.clone(), Reporter::disconnected(), 64, Some([2, 2, 2]));
        (pool, coordinator)
    }

    #[test]
    fn registration_rejects_duplicates_and_unknown_dependencies() {
        let (_pool, reg) = registry();
        reg.register("storage", ComponentKind::Storage, &[]).unwrap();
        assert!(matches!(
            reg.register("storage", ComponentKind::Storage, &[]),
            Err(DuplexError::DuplicateComponent { .. })
        ));
        assert!(matches!(
            reg.register("capture", ComponentKind::Capture, &["ghost"]),
            Err(DuplexError::UnknownComponent { .. })
        ));
    }

    #[test]
    fn added_dependency_cycles_are_rejected() {
        let (_pool, reg) = registry();
        reg.register("a", ComponentKind::System, &[]).unwrap();
        reg.register("b", ComponentKind::System, &["a"]).unwrap();
        reg.register("c", ComponentKind::System, &["b"]).unwrap();
        assert!(matches!(
            reg.add_dependency("a", "c"),
            Err(DuplexError::DependencyCycle { .. })
        ));
        // Non-cyclic additions still work.
        reg.add_dependency("c", "a").unwrap();
    }

    #[test]
    fn dependencies_gate_leaving_initializing() {
        use ComponentState::*;
        let (_pool, reg) = registry();
        let dep = reg.register("storage", ComponentKind::Storage, &[]).unwrap();
        let comp = reg
            .register("processing", ComponentKind::Processing, &["storage"])
            .unwrap();

        comp.cell().transition(Initializing, "init").unwrap();
        assert!(matches!(
            reg.dependencies_ready("processing"),
            Err(DuplexError::DependencyNotReady { .. })
        ));

        dep.cell().transition(Initializing, "init").unwrap();
        dep.cell().transition(Idle, "ready").unwrap();
        reg.dependencies_ready("processing").unwrap();
        comp.cell().transition(Idle, "ready").unwrap();
    }

    #[test]
    fn resource_accounting_tracks_allocations_and_quota() {
        let (pool, reg) = registry();
        let handle = reg.register("capture", ComponentKind::Capture, &[]).unwrap();

        let mut a = reg.request_resource(&handle, 64).unwrap();
        let mut b = reg.request_resource(&handle, 64).unwrap();
        assert_eq!(reg.accounted_resources(), [2, 0, 0]);
        assert_eq!(pool.stats().total_in_use(), 2);

        // Quota is 2 per tier.
        assert!(matches!(
            reg.request_resource(&handle, 64),
            Err(DuplexError::QuotaExceeded { .. })
        ));
        // The denied lease went straight back to the pool.
        assert_eq!(pool.stats().total_in_use(), 2);

        reg.release_resource(&handle, &mut a).unwrap();
        reg.release_resource(&handle, &mut b).unwrap();
        assert_eq!(reg.accounted_resources(), [0, 0, 0]);
        assert_eq!(pool.stats().total_in_use(), 0);
    }

    #[test]
    fn under_release_is_refused() {
        let (pool, reg) = registry();
        let handle = reg.register("capture", ComponentKind::Capture, &[]).unwrap();
        let mut foreign = pool.allocate(64).unwrap();
        assert!(matches!(
            reg.release_resource(&handle, &mut foreign),
            Err(DuplexError::UnknownBuffer { .. })
        ));
        pool.release(&mut foreign).unwrap();
    }

    #[test]
    fn double_release_restores_the_accounting_counter() {
        let (_pool, reg) = registry();
        let handle = reg.register("capture", ComponentKind::Capture, &[]).unwrap();
        let mut buf = reg.request_resource(&handle, 64).unwrap();
        reg.release_resource(&handle, &mut buf).unwrap();

        // Second release: pool rejects, counter must not go negative or drift.
        assert!(matches!(
            reg.release_resource(&handle, &mut buf),
            Err(DuplexError::UnknownBuffer { .. }) | Err(DuplexError::AlreadyReleased { .. })
        ));
        assert_eq!(reg.accounted_resources(), [0, 0, 0]);
    }

    #[test]
    fn liveness_sweep_finds_silent_threads_once() {
        let (_pool, reg) = registry();
        let handle = reg.register("processing", ComponentKind::Processing, &[]).unwrap();
        let tid = reg.register_thread(&handle).unwrap();

        // Fresh thread is not stale.
        assert!(reg.liveness_sweep(Duration::from_secs(10)).is_empty());

        std::thread::sleep(Duration::from_millis(30));
        let stale = reg.liveness_sweep(Duration::from_millis(10));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].tid, tid);
        assert_eq!(stale[0].component, "processing");

        // Swept threads are not reported twice.
        assert!(reg.liveness_sweep(Duration::from_millis(10)).is_empty());
        assert_eq!(reg.health()["processing"].health, Health::Failed);
    }

    #[test]
    fn heartbeats_keep_threads_alive() {
        let (_pool, reg) = registry();
        let handle = reg.register("processing", ComponentKind::Processing, &[]).unwrap();
        let tid = reg.register_thread(&handle).unwrap();

        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(10));
            reg.thread_tick(tid);
        }
        assert!(reg.liveness_sweep(Duration::from_millis(25)).is_empty());

        reg.unregister_thread(tid);
        assert!(reg.liveness_sweep(Duration::from_millis(0)).is_empty());
    }

    #[test]
    fn health_reflects_state_and_errors() {
        use ComponentState::*;
        let (_pool, reg) = registry();
        let handle = reg.register("storage", ComponentKind::Storage, &[]).unwrap();
        handle.cell().transition(Initializing, "init").unwrap();
        handle.cell().transition(Idle, "ready").unwrap();

        assert_eq!(reg.health()["storage"].health, Health::Healthy);

        reg.note_error("storage", "flush hiccup");
        let report = &reg.health()["storage"];
        assert_eq!(report.health, Health::Degraded);
        assert_eq!(report.last_error.as_deref(), Some("flush hiccup"));

        handle.cell().mark_error("disk gone", None).unwrap();
        assert_eq!(reg.health()["storage"].health, Health::Failed);
    }
}
