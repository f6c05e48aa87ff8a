//! Segment Lifecycle
//!
//! Creation is two-phase: a first walk over the page range proves every
//! resource the operation needs is available (PMT slots for missing
//! second-level tables, clusters for preloaded content), a second walk
//! materialises tables and descriptors. A rejected create mutates
//! nothing.
//!
//! Deletion is the single release path for descriptors and is shared by
//! `delete_segment`, shared-segment disconnection and process
//! destruction — release must be infallible once entered.

use crate::descriptor::{AdvancedBits, Descriptor};
use crate::pmt::{process_key, DescRef, Pmt2Counter, NO_SLOT};
use crate::process::SegmentInfo;
use crate::system::VmState;
use crate::types::{
    is_page_aligned, page1, page2, range_fits, AccessType, PageBuf, Pid, Status,
    VirtualAddress, PAGE_SIZE,
};
use crate::{klog::hex32, vdebug, vwarn};

impl VmState {
    /// Alignment, range and overlap admission for a new segment.
    pub(crate) fn check_new_range(
        &self,
        pid: Pid,
        start: VirtualAddress,
        pages: u32,
    ) -> bool {
        if pages == 0 || !is_page_aligned(start) || !range_fits(start, pages) {
            return false;
        }
        let end = start + pages * PAGE_SIZE as u32;
        let proc = match self.procs.get(&pid) {
            Some(p) => p,
            None => return false,
        };
        proc.segments
            .iter()
            .all(|s| end <= s.start || s.end() <= start)
    }

    /// PMT1 indices in `[start, start + pages)` whose second-level table
    /// does not exist yet. The range is ascending, so duplicates are
    /// adjacent and collapse with a last-seen check.
    pub(crate) fn missing_pmt2s(
        &self,
        pmt1_slot: u32,
        start: VirtualAddress,
        pages: u32,
    ) -> Vec<usize> {
        let mut missing = Vec::new();
        for i in 0..pages {
            let p1 = page1(start + i * PAGE_SIZE as u32);
            if missing.last() == Some(&p1) {
                continue;
            }
            if self.pmt.pmt1_entry(pmt1_slot, p1) == NO_SLOT {
                missing.push(p1);
            }
        }
        missing
    }

    pub(crate) fn create_segment(
        &mut self,
        pid: Pid,
        start: VirtualAddress,
        pages: u32,
        flags: AccessType,
    ) -> Status {
        self.build_segment(pid, start, pages, flags, None)
    }

    pub(crate) fn load_segment(
        &mut self,
        pid: Pid,
        start: VirtualAddress,
        pages: u32,
        flags: AccessType,
        content: &[u8],
    ) -> Status {
        if content.len() < pages as usize * PAGE_SIZE {
            vwarn!("segment", "short_content";
                pid = pid, pages = pages, bytes = content.len());
            return Status::Trap;
        }
        self.build_segment(pid, start, pages, flags, Some(content))
    }

    fn build_segment(
        &mut self,
        pid: Pid,
        start: VirtualAddress,
        pages: u32,
        flags: AccessType,
        content: Option<&[u8]>,
    ) -> Status {
        if !self.check_new_range(pid, start, pages) {
            vwarn!("segment", "range_rejected"; pid = pid, start = hex32(start), pages = pages);
            return Status::Trap;
        }

        // Phase one: prove sufficiency before touching anything.
        let pmt1_slot = self.procs[&pid].pmt1_slot;
        let missing = self.missing_pmt2s(pmt1_slot, start, pages);
        if missing.len() as u32 > self.pmt.free_slots() {
            vwarn!("segment", "no_pmt_slots"; pid = pid, needed = missing.len());
            return Status::Trap;
        }
        if content.is_some() && !self.disk.has_space(pages as usize) {
            vwarn!("segment", "no_clusters"; pid = pid, needed = pages);
            return Status::Trap;
        }

        // Phase two: materialise.
        match self.allocate_descriptors(pid, start, pages, flags, content) {
            Some(first) => {
                self.procs.get_mut(&pid).expect("checked above").insert_segment(
                    SegmentInfo {
                        start,
                        access: flags,
                        pages,
                        first,
                        shared_name: None,
                    },
                );
                vdebug!("segment", "created";
                    pid = pid, start = hex32(start), pages = pages);
                Status::Ok
            }
            None => Status::Trap,
        }
    }

    /// Walk the range, creating second-level tables and descriptors.
    /// Returns the first descriptor of the chain.
    ///
    /// Only a partition failure can stop this after the admission
    /// checks; in that case everything built so far is unwound.
    fn allocate_descriptors(
        &mut self,
        pid: Pid,
        start: VirtualAddress,
        pages: u32,
        flags: AccessType,
        content: Option<&[u8]>,
    ) -> Option<DescRef> {
        let pmt1_slot = self.procs[&pid].pmt1_slot;
        let mut first = DescRef::NONE;
        let mut prev = DescRef::NONE;

        for i in 0..pages {
            let va = start + i * PAGE_SIZE as u32;
            let p1 = page1(va);

            let pmt2_slot = match self.ensure_pmt2(pid, pmt1_slot, p1) {
                Some(slot) => slot,
                None => {
                    self.unwind_partial(pid, start, i);
                    return None;
                }
            };

            let r = DescRef::new(pmt2_slot, page2(va));
            let mut d = Descriptor::empty();
            d.set_adv(AdvancedBits::IN_USE);
            d.grant(flags);

            if let Some(bytes) = content {
                let mut buf: PageBuf = [0; PAGE_SIZE];
                let at = i as usize * PAGE_SIZE;
                buf.copy_from_slice(&bytes[at..at + PAGE_SIZE]);
                match self.disk.write(&buf) {
                    Some(cluster) => {
                        d.disk = cluster;
                        d.set_adv(AdvancedBits::HAS_CLUSTER);
                    }
                    None => {
                        // Admission said the clusters existed; the device
                        // failed. Leave no trace of the half-built segment.
                        self.drop_pmt2_ref(pid, p1);
                        self.unwind_partial(pid, start, i);
                        return None;
                    }
                }
            }

            self.pmt.put(r, d);
            if first.is_none() {
                first = r;
            } else {
                self.pmt.update(prev, |p| p.next = r.raw());
            }
            prev = r;
        }
        Some(first)
    }

    /// Create the PMT2 for `p1` if absent, bump its liveness counter.
    pub(crate) fn ensure_pmt2(&mut self, pid: Pid, pmt1_slot: u32, p1: usize) -> Option<u32> {
        let key = process_key(pid, p1);
        let existing = self.pmt.pmt1_entry(pmt1_slot, p1);
        let slot = if existing == NO_SLOT {
            let slot = self.pmt.alloc_pmt2()?;
            self.pmt.set_pmt1_entry(pmt1_slot, p1, slot);
            self.counters.insert(key, Pmt2Counter::new(slot));
            slot
        } else {
            existing
        };
        self.counters
            .get_mut(&key)
            .expect("counter entry exists for live PMT2")
            .counter += 1;
        Some(slot)
    }

    /// Undo the first `built` pages of a failed allocation walk.
    fn unwind_partial(&mut self, pid: Pid, start: VirtualAddress, built: u32) {
        for i in 0..built {
            let va = start + i * PAGE_SIZE as u32;
            let r = self
                .walk(pid, va)
                .expect("descriptor was just built");
            let d = self.pmt.desc(r);
            if d.has_cluster() {
                self.disk.free_cluster(d.cluster());
            }
            self.pmt.put(r, Descriptor::empty());
            self.drop_pmt2_ref(pid, page1(va));
        }
    }

    /// Tear down the segment starting exactly at `start`.
    pub(crate) fn delete_segment(&mut self, pid: Pid, start: VirtualAddress) -> Status {
        let Some(proc) = self.procs.get(&pid) else {
            return Status::Trap;
        };
        let Some(idx) = proc.segments.iter().position(|s| s.start == start) else {
            vwarn!("segment", "delete_unknown"; pid = pid, start = hex32(start));
            return Status::Trap;
        };

        // A window onto a named shared segment releases only this
        // process's participation.
        if let Some(name) = proc.segments[idx].shared_name.clone() {
            return self.disconnect_shared(pid, &name);
        }

        let seg = self.procs.get_mut(&pid).expect("present").segments.remove(idx);
        let mut r = seg.first;
        for i in 0..seg.pages {
            let d = self.pmt.desc(r);
            let next = DescRef::from_raw(d.next);
            self.release_descriptor(d, r);
            self.drop_pmt2_ref(pid, page1(seg.start + i * PAGE_SIZE as u32));
            r = next;
        }
        vdebug!("segment", "deleted"; pid = pid, start = hex32(start), pages = seg.pages);
        Status::Ok
    }

    /// Release whatever one descriptor owns and clear it.
    ///
    /// Ordinary pages give back their frame and cluster. Cloned pages
    /// drop their stake in the cloning descriptor instead. Shared pages
    /// own nothing — the registry entry does.
    pub(crate) fn release_descriptor(&mut self, d: Descriptor, r: DescRef) {
        if d.cloned() {
            self.release_cloned_stake(d.cloning_key(), DescRef::from_raw(d.cloning_ref()));
        } else if !d.shared() {
            if d.valid() {
                self.release_frame(d.frame());
            }
            if d.has_cluster() {
                self.disk.free_cluster(d.cluster());
            }
        }
        self.pmt.put(r, Descriptor::empty());
    }

    /// Return a frame to the free list and quiet its register.
    pub(crate) fn release_frame(&mut self, frame: u32) {
        self.frames.free(frame);
        self.regs[frame as usize] = crate::replace::RefRegister::idle();
    }

    /// One originating descriptor stops pointing at `cref`. On the last
    /// drop the cloning descriptor's frame and cluster are released and
    /// the cloning PMT2 may be garbage-collected.
    pub(crate) fn release_cloned_stake(&mut self, key: u32, cref: DescRef) {
        let entry = cref.entry();
        let counter = self
            .counters
            .get_mut(&(key as u64))
            .expect("cloning counter entry");
        let refs = counter
            .entry_refs
            .as_mut()
            .expect("cloning PMT2 carries per-entry refcounts");
        refs[entry] -= 1;
        if refs[entry] > 0 {
            return;
        }

        let d = self.pmt.desc(cref);
        if d.valid() {
            self.release_frame(d.frame());
        }
        if d.has_cluster() {
            self.disk.free_cluster(d.cluster());
        }
        self.pmt.put(cref, Descriptor::empty());
        self.drop_counted_entry(key as u64);
    }

    /// Decrement a process PMT2's liveness counter; free the table and
    /// unhook it from the PMT1 when it reaches zero.
    pub(crate) fn drop_pmt2_ref(&mut self, pid: Pid, p1: usize) {
        let key = process_key(pid, p1);
        let counter = self
            .counters
            .get_mut(&key)
            .expect("counter entry for owned PMT2");
        counter.counter -= 1;
        if counter.counter == 0 {
            let slot = counter.slot;
            self.counters.remove(&key);
            self.pmt.free_slot(slot);
            let pmt1_slot = self.procs[&pid].pmt1_slot;
            self.pmt.set_pmt1_entry(pmt1_slot, p1, NO_SLOT);
        }
    }

    /// Same, for a cloning PMT2 addressed by its map key.
    fn drop_counted_entry(&mut self, key: u64) {
        let counter = self.counters.get_mut(&key).expect("counter entry");
        counter.counter -= 1;
        if counter.counter == 0 {
            let slot = counter.slot;
            self.counters.remove(&key);
            self.pmt.free_slot(slot);
            vdebug!("clone", "cloning_pmt2_freed"; slot = slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::system::testhost::host;
    use crate::types::{AccessType, Status};

    #[test]
    fn create_then_delete_restores_counts() {
        let h = host(8, 8, 16);
        let p = h.system.create_process().unwrap();
        let slots_before = h.system.free_pmt_slots();

        assert_eq!(p.create_segment(0x0400, 3, AccessType::ReadWrite), Status::Ok);
        assert!(h.system.free_pmt_slots() < slots_before);

        assert_eq!(p.delete_segment(0x0400), Status::Ok);
        assert_eq!(h.system.free_pmt_slots(), slots_before);
    }

    #[test]
    fn unaligned_start_rejected() {
        let h = host(8, 8, 16);
        let p = h.system.create_process().unwrap();
        assert_eq!(p.create_segment(0x0401, 1, AccessType::Read), Status::Trap);
    }

    #[test]
    fn zero_pages_rejected() {
        let h = host(8, 8, 16);
        let p = h.system.create_process().unwrap();
        assert_eq!(p.create_segment(0x0400, 0, AccessType::Read), Status::Trap);
    }

    #[test]
    fn overlap_rejected() {
        let h = host(8, 8, 16);
        let p = h.system.create_process().unwrap();
        assert_eq!(p.create_segment(0x0400, 2, AccessType::Read), Status::Ok);
        assert_eq!(p.create_segment(0x0400, 1, AccessType::Read), Status::Trap);
        assert_eq!(p.create_segment(0x0800, 1, AccessType::Read), Status::Trap);
        // Adjacent is fine.
        assert_eq!(p.create_segment(0x0C00, 1, AccessType::Read), Status::Ok);
    }

    #[test]
    fn range_overflow_rejected() {
        let h = host(8, 8, 16);
        let p = h.system.create_process().unwrap();
        assert_eq!(p.create_segment(0xFFFC00, 2, AccessType::Read), Status::Trap);
        assert_eq!(p.create_segment(0xFFFC00, 1, AccessType::Read), Status::Ok);
    }

    #[test]
    fn pmt_exhaustion_is_clean() {
        // 2 slots: one for the PMT1, one PMT2. A segment spanning two
        // PMT1 entries needs two PMT2s and must fail without side
        // effects.
        let h = host(8, 2, 64);
        let p = h.system.create_process().unwrap();
        let slots_before = h.system.free_pmt_slots();

        // 0x00FC00..0x010400 crosses the page1 boundary at 0x010000.
        assert_eq!(p.create_segment(0x00FC00, 2, AccessType::Read), Status::Trap);
        assert_eq!(h.system.free_pmt_slots(), slots_before);

        // A one-PMT2 segment still fits.
        assert_eq!(p.create_segment(0x0400, 1, AccessType::Read), Status::Ok);
    }

    #[test]
    fn load_without_clusters_rejected() {
        let h = host(8, 8, 1);
        let p = h.system.create_process().unwrap();
        let content = vec![0u8; 2 * 1024];
        let clusters_before = h.system.free_clusters();
        assert_eq!(
            p.load_segment(0x0400, 2, AccessType::Read, &content),
            Status::Trap
        );
        assert_eq!(h.system.free_clusters(), clusters_before);
    }

    #[test]
    fn load_short_content_rejected() {
        let h = host(8, 8, 8);
        let p = h.system.create_process().unwrap();
        assert_eq!(
            p.load_segment(0x0400, 2, AccessType::Read, &[0u8; 1024]),
            Status::Trap
        );
    }

    #[test]
    fn load_reserves_clusters() {
        let h = host(8, 8, 8);
        let p = h.system.create_process().unwrap();
        let content = vec![7u8; 2 * 1024];
        assert_eq!(
            p.load_segment(0x0400, 2, AccessType::Read, &content),
            Status::Ok
        );
        assert_eq!(h.system.free_clusters(), 6);

        assert_eq!(p.delete_segment(0x0400), Status::Ok);
        assert_eq!(h.system.free_clusters(), 8);
    }

    #[test]
    fn delete_requires_exact_start() {
        let h = host(8, 8, 8);
        let p = h.system.create_process().unwrap();
        assert_eq!(p.create_segment(0x0400, 2, AccessType::Read), Status::Ok);
        assert_eq!(p.delete_segment(0x0800), Status::Trap);
        assert_eq!(p.delete_segment(0x0400), Status::Ok);
    }
}
