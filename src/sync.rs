//! Synchronisation Primitives
//!
//! A counting semaphore used for the thrashing block. Threads that drove
//! the system into thrashing park here after evicting their own pages;
//! process destruction releases one waiter at a time.
//!
//! ## Usage
//!
//! ```rust
//! use vmpager::sync::Semaphore;
//!
//! let sem = Semaphore::new(1);
//! sem.wait();                  // consumes the permit
//! assert_eq!(sem.waiters(), 0);
//! sem.signal_if_waiting();     // no-op, nobody is parked
//! ```

use std::sync::{Condvar, Mutex};

struct SemState {
    permits: u32,
    waiters: u32,
}

/// Counting semaphore with waiter tracking.
///
/// Code holding the system state lock MUST NOT wait on this semaphore;
/// waiting with the state lock held would stall every other client.
pub struct Semaphore {
    state: Mutex<SemState>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore with `permits` initial permits.
    pub fn new(permits: u32) -> Self {
        Self {
            state: Mutex::new(SemState { permits, waiters: 0 }),
            cond: Condvar::new(),
        }
    }

    /// Consume a permit, blocking until one is available.
    pub fn wait(&self) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.waiters += 1;
        while guard.permits == 0 {
            guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
        guard.permits -= 1;
        guard.waiters -= 1;
    }

    /// Release one permit unconditionally.
    pub fn signal(&self) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.permits += 1;
        drop(guard);
        self.cond.notify_one();
    }

    /// Release one permit only if a thread is currently parked.
    ///
    /// Returns true if a permit was handed out. Keeps the permit count from
    /// growing when nothing is blocked.
    pub fn signal_if_waiting(&self) -> bool {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if guard.waiters > guard.permits {
            guard.permits += 1;
            drop(guard);
            self.cond.notify_one();
            true
        } else {
            false
        }
    }

    /// Number of threads currently parked in [`wait`](Self::wait).
    pub fn waiters(&self) -> u32 {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.waiters.saturating_sub(guard.permits)
    }
}
