//! Page-Fault Resolution
//!
//! The fault path brings one page into a frame:
//!
//! 1. resolve write intent through cloned descriptors (copy-on-write
//!    divergence — the faulting process gets its own cluster and leaves
//!    the cloning descriptor);
//! 2. redirect to the authoritative descriptor for shared/cloned pages;
//! 3. take a frame from the free list, or evict a victim;
//! 4. read the page's cluster into the frame if one is reserved;
//! 5. publish the mapping and hook the frame's reference register.
//!
//! Faults served by eviction feed the thrashing detector: a run of them
//! with no free-list relief flags the faulting process, which then
//! self-evicts and parks on the semaphore in `block_if_thrashing`.

use crate::descriptor::{AdvancedBits, BasicBits, NO_REF};
use crate::pmt::DescRef;
use crate::replace::{self, RefRegister};
use crate::system::VmState;
use crate::types::{page_base, PageBuf, Pid, Status, VirtualAddress, PAGE_SIZE};
use crate::{klog::hex32, vdebug, vwarn};

/// Consecutive eviction-served faults before the faulting process is
/// told to block.
const PAGE_FAULT_LIMIT: u32 = 50;

impl VmState {
    /// Resolve a fault at `(pid, va)`.
    pub(crate) fn page_fault(&mut self, pid: Pid, va: VirtualAddress) -> Status {
        if !self.procs.contains_key(&pid) {
            return Status::Trap;
        }
        let Some(r) = self.walk(pid, va) else {
            // Not part of any segment: nothing to resolve.
            return Status::Trap;
        };
        let d = self.pmt.desc(r);
        if !d.in_use() {
            return Status::Trap;
        }

        if d.cloned() && self.write_intents.remove(&(pid, page_base(va))) {
            if !self.diverge(r) {
                return Status::Trap;
            }
        }

        let er = self.effective(r);
        let e = self.pmt.desc(er);
        if e.valid() {
            // Another thread resolved it between the access and this call.
            return Status::Ok;
        }

        let Some(frame) = self.obtain_frame(pid) else {
            vwarn!("fault", "no_frame"; pid = pid, va = hex32(va));
            return Status::Trap;
        };

        if e.has_cluster() {
            let mut buf: PageBuf = [0; PAGE_SIZE];
            if !self.disk.read(&mut buf, e.cluster()) {
                // Device failure: the frame goes straight back.
                self.frames.free(frame);
                return Status::Trap;
            }
            self.frames.write_unit(frame, &buf);
        }

        self.pmt.update(er, |x| {
            x.set(BasicBits::VALID);
            x.block = frame;
        });
        self.regs[frame as usize] = RefRegister {
            history: 0,
            desc: Some(er),
        };
        vdebug!("fault", "resolved"; pid = pid, va = hex32(va), frame = frame);
        Status::Ok
    }

    /// Copy-on-write divergence of the cloned descriptor at `r`: give
    /// the page its own cluster, then drop the stake in the cloning
    /// descriptor. False when the disk cannot supply the cluster.
    fn diverge(&mut self, r: DescRef) -> bool {
        let d = self.pmt.desc(r);
        let cref = DescRef::from_raw(d.cloning_ref());
        let key = d.cloning_key();
        let cd = self.pmt.desc(cref);

        // Content source: the cloning descriptor's frame when resident,
        // its cluster otherwise. A page that was never materialised has
        // no content to copy.
        let new_cluster = if cd.valid() {
            let mut buf: PageBuf = [0; PAGE_SIZE];
            self.frames.read_unit(cd.frame(), &mut buf);
            match self.disk.write(&buf) {
                Some(c) => Some(c),
                None => {
                    vwarn!("fault", "diverge_no_cluster"; key = hex32(key));
                    return false;
                }
            }
        } else if cd.has_cluster() {
            match self.disk.write_from(cd.cluster()) {
                Some(c) => Some(c),
                None => {
                    vwarn!("fault", "diverge_no_cluster"; key = hex32(key));
                    return false;
                }
            }
        } else {
            None
        };

        self.pmt.update(r, |x| {
            x.clear_adv(AdvancedBits::CLONED | AdvancedBits::COPY_ON_WRITE);
            x.clear(BasicBits::VALID);
            x.block = NO_REF;
            match new_cluster {
                Some(c) => {
                    x.disk = c;
                    x.set_adv(AdvancedBits::HAS_CLUSTER);
                }
                None => x.disk = 0,
            }
        });
        self.release_cloned_stake(key, cref);
        vdebug!("fault", "cow_diverged"; key = hex32(key));
        true
    }

    /// A frame for a faulting page: free list first, then eviction.
    /// Feeds the thrashing detector.
    fn obtain_frame(&mut self, pid: Pid) -> Option<u32> {
        if let Some(frame) = self.frames.alloc() {
            self.consecutive_faults = 0;
            return Some(frame);
        }

        let VmState {
            regs,
            pmt,
            frames,
            disk,
            ..
        } = self;
        let frame = replace::select_victim(regs, pmt, frames, disk)?;

        self.consecutive_faults += 1;
        if self.consecutive_faults > PAGE_FAULT_LIMIT {
            self.consecutive_faults = 0;
            if let Some(proc) = self.procs.get_mut(&pid) {
                proc.should_block = true;
                vwarn!("fault", "thrashing_flagged"; pid = pid);
            }
        }
        Some(frame)
    }

    /// First half of `block_if_thrashing`, under the lock: when flagged,
    /// evict every resident page this process exclusively owns (writing
    /// dirty ones back), clear its referenced bits, and report that the
    /// caller should park on the semaphore.
    pub(crate) fn prepare_thrash_block(&mut self, pid: Pid) -> bool {
        let Some(proc) = self.procs.get_mut(&pid) else {
            return false;
        };
        if !proc.should_block {
            return false;
        }
        proc.should_block = false;

        let chains: Vec<(DescRef, u32)> = proc
            .segments
            .iter()
            .map(|s| (s.first, s.pages))
            .collect();

        let mut evicted = 0u32;
        for (first, pages) in chains {
            let mut r = first;
            for _ in 0..pages {
                let d = self.pmt.desc(r);
                let next = DescRef::from_raw(d.next);
                if !d.redirects() {
                    self.evict_own_page(r);
                } else {
                    self.pmt
                        .update(r, |x| x.clear_adv(AdvancedBits::REFERENCED));
                }
                evicted += 1;
                r = next;
            }
        }
        vdebug!("fault", "thrash_block"; pid = pid, pages = evicted);
        true
    }

    /// Push one exclusively-owned page out of memory if resident.
    /// A page whose writeback cannot get a cluster stays resident.
    fn evict_own_page(&mut self, r: DescRef) {
        let mut d = self.pmt.desc(r);
        d.clear_adv(AdvancedBits::REFERENCED);
        if !d.valid() {
            self.pmt.put(r, d);
            return;
        }

        if d.dirty() {
            let mut buf: PageBuf = [0; PAGE_SIZE];
            self.frames.read_unit(d.frame(), &mut buf);
            if d.has_cluster() {
                if !self.disk.write_to(&buf, d.cluster()) {
                    self.pmt.put(r, d);
                    return;
                }
            } else {
                match self.disk.write(&buf) {
                    Some(c) => {
                        d.disk = c;
                        d.set_adv(AdvancedBits::HAS_CLUSTER);
                    }
                    None => {
                        // Disk full: keep the page resident rather than
                        // lose its contents.
                        self.pmt.put(r, d);
                        return;
                    }
                }
            }
            d.clear(BasicBits::DIRTY);
        }

        let frame = d.frame();
        d.clear(BasicBits::VALID);
        d.block = NO_REF;
        self.pmt.put(r, d);
        self.release_frame(frame);
    }
}
