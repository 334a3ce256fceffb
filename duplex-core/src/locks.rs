//! Ranked locks.
//!
//! Every shared-state lock in the system carries a [`LockRank`]. The hierarchy,
//! outermost to innermost, is fixed:
//!
//! ```text
//! State → Metrics → Performance → Component → Update
//! ```
//!
//! A thread holding a lock may only acquire locks of strictly inner rank.
//! Debug builds track held ranks per thread and panic on a violation; release
//! builds compile the check away.

use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};

/// Lock ranks, outermost first. The discriminant is the rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockRank {
    /// Component state cells (outermost — inner locks may be taken while held,
    /// which lets invariant predicates observe queues and pool stats).
    State = 0,
    /// Metrics ring and kinded error counters.
    Metrics = 1,
    /// Performance windows (latency/skew) and the pool-wide stage lock.
    Performance = 2,
    /// Component registry and thread table.
    Component = 3,
    /// Leaf data locks: queue interiors, pool tier shelves, write buffers.
    Update = 4,
}

#[cfg(debug_assertions)]
mod tracker {
    use super::LockRank;
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
    }

    pub fn acquire(rank: LockRank) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&innermost) = held.last() {
                assert!(
                    innermost < rank,
                    "lock rank violation: acquiring {rank:?} while holding {innermost:?}"
                );
            }
            held.push(rank);
        });
    }

    pub fn release(rank: LockRank) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            match held.iter().rposition(|&r| r == rank) {
                Some(pos) => {
                    held.remove(pos);
                }
                None => panic!("lock rank tracker: releasing {rank:?} that was never acquired"),
            }
        });
    }
}

/// A `parking_lot::Mutex` that participates in the rank check.
pub struct RankedMutex<T> {
    rank: LockRank,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    pub fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: Mutex::new(value),
        }
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }

    pub fn lock(&self) -> RankedGuard<'_, T> {
        #[cfg(debug_assertions)]
        tracker::acquire(self.rank);
        RankedGuard {
            rank: self.rank,
            guard: Some(self.inner.lock()),
        }
    }

    /// Bounded lock acquisition. `None` means the deadline passed without the
    /// lock becoming available. The rank check runs before the wait so an
    /// ordering bug panics instead of stalling for the timeout.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<RankedGuard<'_, T>> {
        #[cfg(debug_assertions)]
        tracker::acquire(self.rank);
        match self.inner.try_lock_for(timeout) {
            Some(guard) => Some(RankedGuard {
                rank: self.rank,
                guard: Some(guard),
            }),
            None => {
                #[cfg(debug_assertions)]
                tracker::release(self.rank);
                None
            }
        }
    }
}

pub struct RankedGuard<'a, T> {
    rank: LockRank,
    guard: Option<MutexGuard<'a, T>>,
}

impl<'a, T> RankedGuard<'a, T> {
    fn inner(&mut self) -> &mut MutexGuard<'a, T> {
        self.guard.as_mut().expect("guard already released")
    }
}

impl<T> std::ops::Deref for RankedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard already released")
    }
}

impl<T> std::ops::DerefMut for RankedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard already released")
    }
}

impl<T> Drop for RankedGuard<'_, T> {
    fn drop(&mut self) {
        self.guard.take();
        #[cfg(debug_assertions)]
        tracker::release(self.rank);
    }
}

/// Condvar companion for [`RankedMutex`]. The wait itself is the only place
/// the system suspends while a lock is (logically) held, and it is always the
/// innermost rank.
#[derive(Default)]
pub struct RankedCondvar {
    inner: Condvar,
}

impl RankedCondvar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_for<'a, T>(
        &self,
        guard: &mut RankedGuard<'a, T>,
        timeout: Duration,
    ) -> WaitTimeoutResult {
        self.inner.wait_for(guard.inner(), timeout)
    }

    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_acquisition_is_accepted() {
        let outer = RankedMutex::new(LockRank::Metrics, 1u32);
        let inner = RankedMutex::new(LockRank::Update, 2u32);
        let a = outer.lock();
        let b = inner.lock();
        assert_eq!(*a + *b, 3);
    }

    #[test]
    fn sequential_reacquisition_is_accepted() {
        let m = RankedMutex::new(LockRank::Component, ());
        drop(m.lock());
        drop(m.lock());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock rank violation")]
    fn inverted_acquisition_panics() {
        let inner = RankedMutex::new(LockRank::Update, ());
        let outer = RankedMutex::new(LockRank::State, ());
        let _u = inner.lock();
        let _s = outer.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock rank violation")]
    fn equal_rank_nesting_panics() {
        let a = RankedMutex::new(LockRank::Update, ());
        let b = RankedMutex::new(LockRank::Update, ());
        let _a = a.lock();
        let _b = b.lock();
    }

    #[test]
    fn condvar_times_out_under_ranked_guard() {
        let m = RankedMutex::new(LockRank::Update, false);
        let cv = RankedCondvar::new();
        let mut guard = m.lock();
        let result = cv.wait_for(&mut guard, Duration::from_millis(10));
        assert!(result.timed_out());
    }
}
