//! System Facade and Global State
//!
//! One [`System`] instance owns everything: both arenas, the disk
//! allocator, the reference registers, the process map, the PMT2 counter
//! map, the shared-segment registry and the thrashing semaphore.
//!
//! ## Locking discipline
//!
//! All state lives behind a single `Mutex<VmState>`. Public entry points
//! lock at the boundary and call private helpers that take
//! `&mut VmState` and assume the lock is held — no helper ever locks, so
//! no reentrancy is needed. The thrashing semaphore is the only thing a
//! client waits on, and always with the state lock released.
//!
//! ## Ownership cycles
//!
//! Shared segments know their sharing processes and process descriptors
//! point back into shared tables. The cycle is broken with ids and
//! coordinates: processes live in a map keyed by pid, shared segments in
//! a registry keyed by name, and descriptors are addressed as
//! `(slot, entry)` pairs resolved through the PMT arena.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::arena::Arena;
use crate::descriptor::{AdvancedBits, BasicBits};
use crate::disk::DiskManager;
use crate::partition::Partition;
use crate::pmt::{DescRef, Pmt2Counter, PmtArena, NO_SLOT};
use crate::process::{ProcState, Process};
use crate::replace::{self, RefRegister};
use crate::shared::SharedSegment;
use crate::sync::Semaphore;
use crate::types::{
    page1, page2, page_base, word, AccessType, Pid, Status, VirtualAddress, TICK_MS,
};
use crate::{vdebug, vinfo};

// ============================================================================
// State
// ============================================================================

/// Everything the lock protects.
pub(crate) struct VmState {
    pub frames: Arena,
    pub pmt: PmtArena,
    pub disk: DiskManager,
    /// One register per frame, indexed by frame number.
    pub regs: Vec<RefRegister>,
    pub procs: HashMap<Pid, ProcState>,
    /// Liveness counters for process-owned and cloning PMT2s.
    pub counters: HashMap<u64, Pmt2Counter>,
    pub shared: HashMap<String, SharedSegment>,
    pub next_pid: Pid,
    /// Sequence feeding [`crate::pmt::cloning_key`].
    pub cloning_seq: u32,
    /// Consecutive faults served by eviction; drives thrashing detection.
    pub consecutive_faults: u32,
    /// `(pid, page base)` pairs whose next fault carries write intent.
    pub write_intents: HashSet<(Pid, VirtualAddress)>,
}

// SAFETY: VmState owns raw pointers into the two host regions. The host
// guarantees the regions stay valid and are not handed to anyone else
// while the system lives, and every mutation of them goes through the
// Mutex wrapping this state.
unsafe impl Send for VmState {}

pub(crate) struct SystemInner {
    pub state: Mutex<VmState>,
    /// Processes that triggered thrashing park here after self-evicting.
    pub thrash: Semaphore,
}

impl VmState {
    /// Descriptor coordinate for `(pid, va)`, if its PMT2 exists.
    pub(crate) fn walk(&self, pid: Pid, va: VirtualAddress) -> Option<DescRef> {
        let proc = self.procs.get(&pid)?;
        let pmt2 = self.pmt.pmt1_entry(proc.pmt1_slot, page1(va));
        if pmt2 == NO_SLOT {
            return None;
        }
        Some(DescRef::new(pmt2, page2(va)))
    }

    /// Follow one level of `SHARED`/`CLONED` indirection to the
    /// authoritative descriptor. Identity for ordinary descriptors.
    pub(crate) fn effective(&self, r: DescRef) -> DescRef {
        let d = self.pmt.desc(r);
        if d.redirects() {
            DescRef::from_raw(d.block)
        } else {
            r
        }
    }

    /// Hardware-side access check (§ the access operation).
    pub(crate) fn access(&mut self, pid: Pid, va: VirtualAddress, ty: AccessType) -> Status {
        if !self.procs.contains_key(&pid) {
            return Status::Trap;
        }
        let Some(r) = self.walk(pid, va) else {
            return Status::PageFault;
        };
        let d = self.pmt.desc(r);
        if !d.in_use() {
            return Status::Trap;
        }

        // Write intent through a cloned page never touches the shared
        // frame: record the intent and report a fault; the fault handler
        // diverges the page.
        if d.cloned() && ty.writes() {
            if !d.allows(ty) {
                return Status::Trap;
            }
            self.write_intents.insert((pid, page_base(va)));
            return Status::PageFault;
        }

        let er = self.effective(r);
        let e = self.pmt.desc(er);
        if !e.valid() {
            return Status::PageFault;
        }

        self.pmt.update(er, |x| x.set_adv(AdvancedBits::REFERENCED));

        // Rights come from the caller's own descriptor; for shared pages
        // that is the access type it declared when connecting.
        if !d.allows(ty) {
            return Status::Trap;
        }
        if ty == AccessType::Write {
            self.pmt.update(er, |x| x.set(BasicBits::DIRTY));
        }
        Status::Ok
    }

    /// Final translation for the host's byte access. Null when the page
    /// is unmapped or not resident.
    pub(crate) fn physical_address(&self, pid: Pid, va: VirtualAddress) -> *mut u8 {
        let Some(r) = self.walk(pid, va) else {
            return std::ptr::null_mut();
        };
        let e = self.pmt.desc(self.effective(r));
        if !e.valid() {
            return std::ptr::null_mut();
        }
        // SAFETY: word(va) < PAGE_SIZE, so the offset stays inside the
        // frame the descriptor owns.
        unsafe { self.frames.unit_ptr(e.frame()).add(word(va)) }
    }
}

// ============================================================================
// Public facade
// ============================================================================

/// The virtual-memory system. Cheap to share: clients hold [`Process`]
/// handles that reference the same inner state.
pub struct System {
    pub(crate) inner: Arc<SystemInner>,
}

impl System {
    /// Build a system over two host-supplied regions and a partition.
    ///
    /// `frame_region` backs pages in memory (`frame_pages` × 1 KiB);
    /// `pmt_region` backs page map tables (`pmt_pages` × 1 KiB).
    ///
    /// # Safety
    ///
    /// Both regions must be page-aligned, sized as stated, writable, and
    /// remain valid and otherwise untouched (except through translated
    /// addresses) until the system and every `Process` handle are gone.
    pub unsafe fn new(
        frame_region: *mut u8,
        frame_pages: usize,
        pmt_region: *mut u8,
        pmt_pages: usize,
        partition: Box<dyn Partition>,
    ) -> Self {
        let frames = Arena::new(frame_region, frame_pages as u32, "frames");
        let pmt = PmtArena::new(pmt_region, pmt_pages as u32);
        let disk = DiskManager::new(partition);
        vinfo!("system", "init_ok";
            frames = frame_pages, pmt_slots = pmt_pages, clusters = disk.cluster_count());

        System {
            inner: Arc::new(SystemInner {
                state: Mutex::new(VmState {
                    regs: vec![RefRegister::idle(); frame_pages],
                    frames,
                    pmt,
                    disk,
                    procs: HashMap::new(),
                    counters: HashMap::new(),
                    shared: HashMap::new(),
                    next_pid: 0,
                    cloning_seq: 0,
                    consecutive_faults: 0,
                    write_intents: HashSet::new(),
                }),
                thrash: Semaphore::new(0),
            }),
        }
    }

    /// Create a process with an empty address space. None when no PMT
    /// slot is left for its first-level table.
    pub fn create_process(&self) -> Option<Process> {
        let mut st = self.lock();
        let pmt1_slot = st.pmt.alloc_pmt1()?;
        let pid = st.next_pid;
        st.next_pid += 1;
        st.procs.insert(pid, ProcState::new(pmt1_slot));
        vdebug!("system", "process_created"; pid = pid);
        drop(st);
        Some(Process::new(pid, Arc::clone(&self.inner)))
    }

    /// Duplicate `pid`'s address space copy-on-write.
    pub fn clone_process(&self, pid: Pid) -> Option<Process> {
        let mut st = self.lock();
        let new_pid = st.clone_process(pid)?;
        drop(st);
        Some(Process::new(new_pid, Arc::clone(&self.inner)))
    }

    /// Clock tick: age every reference history. Returns the next tick
    /// interval in milliseconds.
    pub fn periodic_job(&self) -> u64 {
        let mut st = self.lock();
        let VmState { regs, pmt, .. } = &mut *st;
        replace::tick(regs, pmt);
        TICK_MS
    }

    /// Hardware-side access check for `(pid, va, ty)`.
    pub fn access(&self, pid: Pid, va: VirtualAddress, ty: AccessType) -> Status {
        self.lock().access(pid, va, ty)
    }

    /// Frames currently on the free list.
    pub fn free_frames(&self) -> u32 {
        self.lock().frames.free_count()
    }

    /// PMT slots currently on the free list.
    pub fn free_pmt_slots(&self) -> u32 {
        self.lock().pmt.free_slots()
    }

    /// Clusters currently unallocated on the partition.
    pub fn free_clusters(&self) -> u32 {
        self.lock().disk.free_clusters()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VmState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod testhost {
    use super::*;
    use crate::arena::testmem::{region, Aligned};
    use crate::partition::MemPartition;

    /// A System plus the backing memory that must outlive it.
    pub struct Host {
        pub system: System,
        _frame_mem: Box<[Aligned]>,
        _pmt_mem: Box<[Aligned]>,
    }

    pub fn host(frames: usize, pmt_slots: usize, clusters: u32) -> Host {
        let mut frame_mem = region(frames);
        let mut pmt_mem = region(pmt_slots);
        let system = unsafe {
            System::new(
                frame_mem.as_mut_ptr() as *mut u8,
                frames,
                pmt_mem.as_mut_ptr() as *mut u8,
                pmt_slots,
                Box::new(MemPartition::new(clusters)),
            )
        };
        Host {
            system,
            _frame_mem: frame_mem,
            _pmt_mem: pmt_mem,
        }
    }
}
