//! Tiered byte-buffer pool.
//!
//! Three size classes (SMALL 4 KiB, MEDIUM 64 KiB, LARGE 1 MiB), each with a
//! LIFO free stack for cache-warm reuse under steady-state frame sizes.
//! `allocate` picks the smallest tier that fits and never promotes upward; a
//! saturated tier is waited on (bounded) and then reported exhausted.
//!
//! Releases land on a per-tier pending list; the list is folded back into the
//! LIFO stack on the allocation path or eagerly by the GC cleanup stage.
//! Staged cleanup (`Gc → Soft → Hard → Emergency`) is monotonic and driven by
//! the monitoring coordinator under memory pressure.
//!
//! Lock order inside the pool: the stage lock (Performance rank) before any
//! tier shelf (Update rank).

use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::error::DuplexError;
use crate::locks::{LockRank, RankedCondvar, RankedGuard, RankedMutex};

/// Buffer size classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum Tier {
    Small,
    Medium,
    Large,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Small, Tier::Medium, Tier::Large];

    /// Payload bytes a buffer of this tier holds.
    pub fn payload_capacity(self) -> usize {
        match self {
            Tier::Small => 4 * 1024,
            Tier::Medium => 64 * 1024,
            Tier::Large => 1024 * 1024,
        }
    }

    /// Smallest tier whose capacity covers `size`. `None` if nothing fits.
    pub fn fitting(size: usize) -> Option<Tier> {
        Tier::ALL
            .into_iter()
            .find(|t| t.payload_capacity() >= size)
    }

    pub fn index(self) -> usize {
        match self {
            Tier::Small => 0,
            Tier::Medium => 1,
            Tier::Large => 2,
        }
    }
}

/// Staged cleanup levels, strictly ordered. Progression is monotonic; a
/// request for an earlier stage is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CleanupStage {
    /// Normal operation.
    Active = 0,
    /// Pending-free lists folded back into the LIFO stacks.
    Gc = 1,
    /// Half of every free list dropped.
    Soft = 2,
    /// All free lists dropped.
    Hard = 3,
    /// New allocations refused; in-use buffers honored until release.
    Emergency = 4,
}

impl CleanupStage {
    fn from_u8(v: u8) -> CleanupStage {
        match v {
            0 => CleanupStage::Active,
            1 => CleanupStage::Gc,
            2 => CleanupStage::Soft,
            3 => CleanupStage::Hard,
            _ => CleanupStage::Emergency,
        }
    }
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("{0:?} tier exhausted")]
    Exhausted(Tier),
    #[error("allocation timed out")]
    Timeout,
}

impl From<AllocError> for DuplexError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::Exhausted(tier) => DuplexError::PoolExhausted { tier },
            AllocError::Timeout => DuplexError::AllocationTimeout,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("buffer {0} already released")]
    AlreadyReleased(u64),
    #[error("buffer {0} unknown to this pool")]
    UnknownBuffer(u64),
}

impl From<ReleaseError> for DuplexError {
    fn from(e: ReleaseError) -> Self {
        match e {
            ReleaseError::AlreadyReleased(id) => DuplexError::AlreadyReleased { id },
            ReleaseError::UnknownBuffer(id) => DuplexError::UnknownBuffer { id },
        }
    }
}

/// An exclusively owned byte region leased from the pool.
///
/// Exactly one `release` per buffer; a buffer dropped without release is
/// counted as leaked and its memory is returned to the allocator, not the
/// pool.
pub struct PooledBuffer {
    id: u64,
    tier: Tier,
    used: usize,
    data: Vec<u8>,
    shared: Arc<PoolShared>,
    released: bool,
}

impl PooledBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Copy `bytes` into the buffer and set the used length.
    ///
    /// # Panics
    /// Panics if `bytes` exceeds the buffer capacity; callers size requests
    /// through [`TieredPool::allocate`], which guarantees fit.
    pub fn write(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.data.len(), "write exceeds buffer capacity");
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.used = bytes.len();
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn set_used(&mut self, used: usize) {
        assert!(used <= self.data.len());
        self.used = used;
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("used", &self.used)
            .field("capacity", &self.data.len())
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Leak: the lease was never handed back. Account for it so the
        // conservation invariant stays checkable.
        let shelf = &self.shared.tiers[self.tier.index()];
        let mut inner = shelf.shelf.lock();
        inner.live.remove(&self.id);
        inner.created = inner.created.saturating_sub(1);
        drop(inner);
        self.shared.leaked.fetch_add(1, Ordering::Relaxed);
        shelf.freed.notify_one();
        debug!(id = self.id, tier = ?self.tier, "pooled buffer dropped without release");
    }
}

struct ShelfInner {
    /// LIFO stack of reusable payloads.
    free: Vec<Vec<u8>>,
    /// Released payloads not yet folded into `free`.
    pending: Vec<Vec<u8>>,
    /// Outstanding allocation ids (the ownership tokens).
    live: HashSet<u64>,
    /// Payloads currently existing for this tier (live + free + pending).
    created: usize,
    /// Most buffers simultaneously live.
    high_water: usize,
}

struct TierShelf {
    max: usize,
    shelf: RankedMutex<ShelfInner>,
    freed: RankedCondvar,
}

struct PoolShared {
    tiers: [TierShelf; 3],
    stage_lock: RankedMutex<CleanupStage>,
    stage: AtomicU8,
    next_id: AtomicU64,
    allocations: AtomicU64,
    releases: AtomicU64,
    leaked: AtomicU64,
    alloc_timeout: Duration,
}

impl PoolShared {
    fn current_stage(&self) -> CleanupStage {
        CleanupStage::from_u8(self.stage.load(Ordering::Acquire))
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct TierStats {
    pub capacity: usize,
    pub in_use: usize,
    pub free: usize,
    pub high_water: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub per_tier: [TierStats; 3],
    pub allocations: u64,
    pub releases: u64,
    pub leaked: u64,
    /// Bytes currently resident across live and free payloads.
    pub resident_bytes: usize,
}

impl PoolStats {
    pub fn total_in_use(&self) -> usize {
        self.per_tier.iter().map(|t| t.in_use).sum()
    }
}

/// The pool handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct TieredPool {
    shared: Arc<PoolShared>,
}

impl TieredPool {
    /// `caps` are the per-tier buffer-count limits (small, medium, large).
    pub fn new(caps: [usize; 3], alloc_timeout: Duration) -> Self {
        let tier = |max| TierShelf {
            max,
            shelf: RankedMutex::new(
                LockRank::Update,
                ShelfInner {
                    free: Vec::new(),
                    pending: Vec::new(),
                    live: HashSet::new(),
                    created: 0,
                    high_water: 0,
                },
            ),
            freed: RankedCondvar::new(),
        };
        Self {
            shared: Arc::new(PoolShared {
                tiers: [tier(caps[0]), tier(caps[1]), tier(caps[2])],
                stage_lock: RankedMutex::new(LockRank::Performance, CleanupStage::Active),
                stage: AtomicU8::new(CleanupStage::Active as u8),
                next_id: AtomicU64::new(1),
                allocations: AtomicU64::new(0),
                releases: AtomicU64::new(0),
                leaked: AtomicU64::new(0),
                alloc_timeout,
            }),
        }
    }

    pub fn stage(&self) -> CleanupStage {
        self.shared.current_stage()
    }

    /// Lease a buffer of the smallest tier covering `size`.
    ///
    /// Waits up to the configured allocation timeout for a release when the
    /// tier is saturated; a saturated tier after the wait is `Exhausted`, a
    /// lock that never became available is `Timeout`. Never promotes the
    /// request to a larger tier.
    pub fn allocate(&self, size: usize) -> Result<PooledBuffer, AllocError> {
        let tier = Tier::fitting(size).ok_or(AllocError::Exhausted(Tier::Large))?;
        if self.shared.current_stage() >= CleanupStage::Emergency {
            return Err(AllocError::Exhausted(tier));
        }

        let deadline = Instant::now() + self.shared.alloc_timeout;
        let shelf = &self.shared.tiers[tier.index()];
        let mut inner = shelf
            .shelf
            .try_lock_for(self.shared.alloc_timeout)
            .ok_or(AllocError::Timeout)?;

        loop {
            if let Some(data) = Self::pop_free(&mut inner) {
                return Ok(self.lease(tier, &mut inner, data));
            }
            if inner.created < shelf.max {
                inner.created += 1;
                let data = vec![0u8; tier.payload_capacity()];
                return Ok(self.lease(tier, &mut inner, data));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AllocError::Exhausted(tier));
            }
            shelf.freed.wait_for(&mut inner, remaining);
            if self.shared.current_stage() >= CleanupStage::Emergency {
                return Err(AllocError::Exhausted(tier));
            }
        }
    }

    fn pop_free(inner: &mut RankedGuard<'_, ShelfInner>) -> Option<Vec<u8>> {
        if inner.free.is_empty() && !inner.pending.is_empty() {
            let pending = std::mem::take(&mut inner.pending);
            inner.free.extend(pending);
        }
        inner.free.pop()
    }

    fn lease(
        &self,
        tier: Tier,
        inner: &mut RankedGuard<'_, ShelfInner>,
        data: Vec<u8>,
    ) -> PooledBuffer {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        inner.live.insert(id);
        let live_now = inner.live.len();
        if live_now > inner.high_water {
            inner.high_water = live_now;
        }
        self.shared.allocations.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            id,
            tier,
            used: 0,
            data,
            shared: Arc::clone(&self.shared),
            released: false,
        }
    }

    /// Hand a lease back. The payload returns to its tier LIFO (or is dropped
    /// under Hard/Emergency cleanup); the used length is zeroed.
    pub fn release(&self, buf: &mut PooledBuffer) -> Result<(), ReleaseError> {
        if buf.released {
            return Err(ReleaseError::AlreadyReleased(buf.id));
        }
        if !Arc::ptr_eq(&buf.shared, &self.shared) {
            return Err(ReleaseError::UnknownBuffer(buf.id));
        }

        let shelf = &self.shared.tiers[buf.tier.index()];
        let mut inner = shelf.shelf.lock();
        if !inner.live.remove(&buf.id) {
            return Err(ReleaseError::UnknownBuffer(buf.id));
        }
        buf.released = true;
        buf.used = 0;
        let data = std::mem::take(&mut buf.data);

        match self.shared.current_stage() {
            CleanupStage::Active => inner.pending.push(data),
            CleanupStage::Gc | CleanupStage::Soft => inner.free.push(data),
            CleanupStage::Hard | CleanupStage::Emergency => {
                // Shrinking: released payloads go back to the allocator.
                inner.created = inner.created.saturating_sub(1);
                drop(data);
            }
        }
        drop(inner);

        self.shared.releases.fetch_add(1, Ordering::Relaxed);
        shelf.freed.notify_one();
        Ok(())
    }

    /// Advance the staged cleanup level. Returns `false` when `target` would
    /// regress the current stage; requesting the current stage is a no-op
    /// that returns `true`.
    pub fn cleanup_stage(&self, target: CleanupStage) -> bool {
        let mut stage = self.shared.stage_lock.lock();
        if target < *stage {
            return false;
        }
        if target == *stage {
            return true;
        }
        *stage = target;
        self.shared.stage.store(target as u8, Ordering::Release);

        for shelf in &self.shared.tiers {
            let mut inner = shelf.shelf.lock();
            match target {
                CleanupStage::Active => {}
                CleanupStage::Gc => {
                    let pending = std::mem::take(&mut inner.pending);
                    inner.free.extend(pending);
                }
                CleanupStage::Soft => {
                    let pending = std::mem::take(&mut inner.pending);
                    inner.free.extend(pending);
                    // Drop the cold half (bottom of the LIFO).
                    let drop_n = inner.free.len() / 2;
                    inner.free.drain(..drop_n);
                    inner.created = inner.created.saturating_sub(drop_n);
                }
                CleanupStage::Hard | CleanupStage::Emergency => {
                    let dropped = inner.free.len() + inner.pending.len();
                    inner.free.clear();
                    inner.pending.clear();
                    inner.created = inner.created.saturating_sub(dropped);
                }
            }
            drop(inner);
            shelf.freed.notify_all();
        }
        debug!(stage = ?target, "pool cleanup stage advanced");
        true
    }

    pub fn stats(&self) -> PoolStats {
        let mut per_tier = [TierStats {
            capacity: 0,
            in_use: 0,
            free: 0,
            high_water: 0,
        }; 3];
        let mut resident = 0usize;
        for t in Tier::ALL {
            let shelf = &self.shared.tiers[t.index()];
            let inner = shelf.shelf.lock();
            per_tier[t.index()] = TierStats {
                capacity: shelf.max,
                in_use: inner.live.len(),
                free: inner.free.len() + inner.pending.len(),
                high_water: inner.high_water,
            };
            resident += inner.created * t.payload_capacity();
        }
        PoolStats {
            per_tier,
            allocations: self.shared.allocations.load(Ordering::Relaxed),
            releases: self.shared.releases.load(Ordering::Relaxed),
            leaked: self.shared.leaked.load(Ordering::Relaxed),
            resident_bytes: resident,
        }
    }
}
