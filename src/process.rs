//! Processes
//!
//! A [`Process`] is the client-facing handle: every operation locks the
//! system state at the boundary and runs against the shared state.
//! Dropping the handle destroys the address space and returns every
//! frame, cluster, PMT slot and shared-segment participation it held.
//!
//! `ProcState` is the bookkeeping the system keeps per process: its
//! first-level table and the segment list, sorted by start address.

use std::sync::Arc;

use crate::pmt::DescRef;
use crate::system::{SystemInner, VmState};
use crate::types::{AccessType, Pid, Status, VirtualAddress, PAGE_SIZE};
use crate::vdebug;

/// One segment the process has created.
pub(crate) struct SegmentInfo {
    pub start: VirtualAddress,
    pub access: AccessType,
    pub pages: u32,
    /// Descriptor of the first page; the rest chain through `next`.
    pub first: DescRef,
    /// Present when this segment is a window onto a named shared segment.
    pub shared_name: Option<String>,
}

impl SegmentInfo {
    /// First address past the segment.
    #[inline]
    pub fn end(&self) -> VirtualAddress {
        self.start + self.pages * PAGE_SIZE as u32
    }
}

/// Per-process state owned by the system.
pub(crate) struct ProcState {
    /// PMT-arena slot of this process's first-level table.
    pub pmt1_slot: u32,
    /// Segments sorted by start address.
    pub segments: Vec<SegmentInfo>,
    /// Set by thrashing detection; consumed by `block_if_thrashing`.
    pub should_block: bool,
}

impl ProcState {
    pub fn new(pmt1_slot: u32) -> Self {
        Self {
            pmt1_slot,
            segments: Vec::new(),
            should_block: false,
        }
    }

    /// Insert keeping the list sorted by start address.
    pub fn insert_segment(&mut self, seg: SegmentInfo) {
        let at = self
            .segments
            .partition_point(|s| s.start < seg.start);
        self.segments.insert(at, seg);
    }
}

// ============================================================================
// Client handle
// ============================================================================

/// Handle to one process's address space.
///
/// All methods are safe to call from any thread; each takes the global
/// state lock for its duration.
pub struct Process {
    pid: Pid,
    inner: Arc<SystemInner>,
}

impl Process {
    pub(crate) fn new(pid: Pid, inner: Arc<SystemInner>) -> Self {
        Self { pid, inner }
    }

    /// The system-assigned process id.
    pub fn id(&self) -> Pid {
        self.pid
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VmState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create `pages` pages of fresh, unbacked address space at `start`.
    pub fn create_segment(
        &self,
        start: VirtualAddress,
        pages: u32,
        flags: AccessType,
    ) -> Status {
        self.lock().create_segment(self.pid, start, pages, flags)
    }

    /// Create a segment whose initial contents are `content`, staged to
    /// disk clusters and demand-paged in. `content` must cover
    /// `pages * PAGE_SIZE` bytes.
    pub fn load_segment(
        &self,
        start: VirtualAddress,
        pages: u32,
        flags: AccessType,
        content: &[u8],
    ) -> Status {
        self.lock()
            .load_segment(self.pid, start, pages, flags, content)
    }

    /// Tear down the segment starting exactly at `start`.
    pub fn delete_segment(&self, start: VirtualAddress) -> Status {
        self.lock().delete_segment(self.pid, start)
    }

    /// Resolve a page fault at `va`: bring the page into a frame,
    /// evicting a victim if the free list is empty.
    pub fn page_fault(&self, va: VirtualAddress) -> Status {
        self.lock().page_fault(self.pid, va)
    }

    /// Physical address for `va`, or null when unmapped / not resident.
    pub fn physical_address(&self, va: VirtualAddress) -> *mut u8 {
        self.lock().physical_address(self.pid, va)
    }

    /// Park if this process was flagged for thrashing: evict its own
    /// resident pages, then wait until some process is destroyed.
    pub fn block_if_thrashing(&self) {
        let should_wait = {
            let mut st = self.lock();
            st.prepare_thrash_block(self.pid)
        };
        if should_wait {
            self.inner.thrash.wait();
        }
    }

    /// Connect to (or create) the named shared segment.
    pub fn create_shared_segment(
        &self,
        start: VirtualAddress,
        pages: u32,
        name: &str,
        flags: AccessType,
    ) -> Status {
        self.lock()
            .connect_shared(self.pid, start, pages, name, flags)
    }

    /// Drop this process's window onto the named shared segment. The
    /// segment itself lives on for other sharers.
    pub fn disconnect_shared_segment(&self, name: &str) -> Status {
        self.lock().disconnect_shared(self.pid, name)
    }

    /// Destroy the named shared segment for everyone sharing it.
    pub fn delete_shared_segment(&self, name: &str) -> Status {
        self.lock().delete_shared(name)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        {
            let mut st = self.lock();
            st.destroy_process(self.pid);
        }
        // Reclaimed resources may unblock a thrashing waiter.
        self.inner.thrash.signal_if_waiting();
    }
}

// ============================================================================
// Destruction
// ============================================================================

impl VmState {
    /// Tear down a whole address space. Infallible once entered: every
    /// segment is released exactly as `delete_segment` would, then the
    /// first-level table goes back to the arena.
    pub(crate) fn destroy_process(&mut self, pid: Pid) {
        let Some(proc) = self.procs.get(&pid) else { return };
        let starts: Vec<VirtualAddress> =
            proc.segments.iter().map(|s| s.start).collect();
        for start in starts {
            // Shared windows disconnect; ordinary segments release their
            // frames and clusters.
            let _ = self.delete_segment(pid, start);
        }

        let proc = self.procs.remove(&pid).expect("process still registered");
        debug_assert!(proc.segments.is_empty());
        self.pmt.free_slot(proc.pmt1_slot);
        self.write_intents.retain(|(p, _)| *p != pid);
        vdebug!("process", "destroyed"; pid = pid);
    }
}
