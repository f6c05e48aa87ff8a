//! Shared Segments
//!
//! A shared segment is a named, globally registered run of pages with
//! its own first- and second-level tables. Processes see it through
//! ordinary segments whose descriptors carry `SHARED` and point at the
//! registry's descriptors; all residency state (valid, dirty,
//! referenced, cluster) lives on the registry side, so every sharer
//! observes every write.
//!
//! The registry entry owns the shared tables, frames and clusters. They
//! are released only by `delete_shared`, which first disconnects every
//! sharer; disconnecting, by itself, never frees shared state.

use crate::descriptor::{AdvancedBits, Descriptor};
use crate::pmt::{DescRef, NO_SLOT};
use crate::process::SegmentInfo;
use crate::system::VmState;
use crate::types::{page1, page2, AccessType, Pid, Status, VirtualAddress, PAGE_SIZE, PMT2_LEN};
use crate::{klog::hex32, vdebug, vwarn};

/// One process's participation in a shared segment.
pub(crate) struct Sharer {
    pub pid: Pid,
    /// First descriptor of the window in the sharer's own tables.
    pub first: DescRef,
}

/// Registry entry for one named segment.
pub(crate) struct SharedSegment {
    pub access: AccessType,
    pub pages: u32,
    /// Second-level tables backing the segment (`ceil(pages / 64)`).
    pub pmt2_count: u32,
    /// The segment's own first-level table.
    pub pmt1_slot: u32,
    pub sharers: Vec<Sharer>,
}

impl SharedSegment {
    /// Descriptor coordinate of shared page `i`, resolved through the
    /// segment's own PMT1.
    pub(crate) fn page_ref(&self, pmt: &crate::pmt::PmtArena, i: u32) -> DescRef {
        let slot = pmt.pmt1_entry(self.pmt1_slot, (i as usize) / PMT2_LEN);
        debug_assert!(slot != NO_SLOT);
        DescRef::new(slot, (i as usize) % PMT2_LEN)
    }
}

/// Which declared access types may share one segment. Read and write
/// windows mix freely with read-write segments; executable segments
/// only ever pair with executable windows.
fn compatible(caller: AccessType, segment: AccessType) -> bool {
    use AccessType::*;
    match caller {
        Read => matches!(segment, Read | ReadWrite),
        Write => matches!(segment, Write | ReadWrite),
        ReadWrite => matches!(segment, Read | Write | ReadWrite),
        Execute => segment == Execute,
    }
}

impl VmState {
    /// Connect `pid` to the named segment, creating it on first use.
    pub(crate) fn connect_shared(
        &mut self,
        pid: Pid,
        start: VirtualAddress,
        pages: u32,
        name: &str,
        flags: AccessType,
    ) -> Status {
        if !self.check_new_range(pid, start, pages) {
            vwarn!("shared", "range_rejected"; pid = pid, start = hex32(start));
            return Status::Trap;
        }
        let proc = &self.procs[&pid];
        if proc
            .segments
            .iter()
            .any(|s| s.shared_name.as_deref() == Some(name))
        {
            vwarn!("shared", "already_connected"; pid = pid, name = name);
            return Status::Trap;
        }

        // Admission: the caller's missing PMT2s plus whatever the shared
        // segment itself would need, against the same slot pool.
        let pmt1_slot = proc.pmt1_slot;
        let missing = self.missing_pmt2s(pmt1_slot, start, pages);
        let new_shared_slots = match self.shared.get(name) {
            Some(seg) => {
                if pages > seg.pages || !compatible(flags, seg.access) {
                    vwarn!("shared", "incompatible"; pid = pid, name = name);
                    return Status::Trap;
                }
                0
            }
            None => 1 + (pages as usize).div_ceil(PMT2_LEN),
        };
        if missing.len() + new_shared_slots > self.pmt.free_slots() as usize {
            vwarn!("shared", "no_pmt_slots"; pid = pid, name = name);
            return Status::Trap;
        }

        if !self.shared.contains_key(name) {
            self.create_shared_entry(name, pages, flags);
        }

        // Caller-side window: one SHARED descriptor per page, pointing
        // at the registry's descriptor for the same index.
        let mut first = DescRef::NONE;
        let mut prev = DescRef::NONE;
        for i in 0..pages {
            let va = start + i * PAGE_SIZE as u32;
            let pmt2_slot = self
                .ensure_pmt2(pid, pmt1_slot, page1(va))
                .expect("slot admission checked");
            let target = self.shared[name].page_ref(&self.pmt, i);

            let r = DescRef::new(pmt2_slot, page2(va));
            let mut d = Descriptor::empty();
            d.set_adv(AdvancedBits::IN_USE | AdvancedBits::SHARED);
            d.grant(flags);
            d.block = target.raw();
            self.pmt.put(r, d);

            if first.is_none() {
                first = r;
            } else {
                self.pmt.update(prev, |p| p.next = r.raw());
            }
            prev = r;
        }

        self.shared
            .get_mut(name)
            .expect("registered above")
            .sharers
            .push(Sharer { pid, first });
        self.procs
            .get_mut(&pid)
            .expect("checked above")
            .insert_segment(SegmentInfo {
                start,
                access: flags,
                pages,
                first,
                shared_name: Some(name.to_string()),
            });
        vdebug!("shared", "connected"; pid = pid, name = name, pages = pages);
        Status::Ok
    }

    /// Materialise the registry side: its own PMT1 plus enough PMT2s,
    /// descriptors marked in-use with the segment's access bits.
    fn create_shared_entry(&mut self, name: &str, pages: u32, flags: AccessType) {
        let pmt1_slot = self.pmt.alloc_pmt1().expect("slot admission checked");
        let pmt2_count = (pages as usize).div_ceil(PMT2_LEN) as u32;
        for t in 0..pmt2_count {
            let slot = self.pmt.alloc_pmt2().expect("slot admission checked");
            self.pmt.set_pmt1_entry(pmt1_slot, t as usize, slot);
        }

        let seg = SharedSegment {
            access: flags,
            pages,
            pmt2_count,
            pmt1_slot,
            sharers: Vec::new(),
        };
        for i in 0..pages {
            let r = seg.page_ref(&self.pmt, i);
            let mut d = Descriptor::empty();
            d.set_adv(AdvancedBits::IN_USE);
            d.grant(flags);
            self.pmt.put(r, d);
        }
        self.shared.insert(name.to_string(), seg);
        vdebug!("shared", "registered"; name = name, pages = pages);
    }

    /// Remove `pid`'s window onto the named segment. Registry state,
    /// frames and clusters stay untouched.
    pub(crate) fn disconnect_shared(&mut self, pid: Pid, name: &str) -> Status {
        let Some(proc) = self.procs.get_mut(&pid) else {
            return Status::Trap;
        };
        let Some(idx) = proc
            .segments
            .iter()
            .position(|s| s.shared_name.as_deref() == Some(name))
        else {
            vwarn!("shared", "disconnect_unknown"; pid = pid, name = name);
            return Status::Trap;
        };
        let seg = proc.segments.remove(idx);

        let mut r = seg.first;
        for i in 0..seg.pages {
            let d = self.pmt.desc(r);
            debug_assert!(d.shared());
            let next = DescRef::from_raw(d.next);
            self.pmt.put(r, Descriptor::empty());
            self.drop_pmt2_ref(pid, page1(seg.start + i * PAGE_SIZE as u32));
            r = next;
        }

        if let Some(shared) = self.shared.get_mut(name) {
            shared.sharers.retain(|s| s.pid != pid);
        }
        vdebug!("shared", "disconnected"; pid = pid, name = name);
        Status::Ok
    }

    /// Destroy the named segment: disconnect every sharer, then release
    /// the registry's frames, clusters and tables.
    pub(crate) fn delete_shared(&mut self, name: &str) -> Status {
        if !self.shared.contains_key(name) {
            vwarn!("shared", "delete_unknown"; name = name);
            return Status::Trap;
        }

        let pids: Vec<Pid> = self.shared[name].sharers.iter().map(|s| s.pid).collect();
        for pid in pids {
            let _ = self.disconnect_shared(pid, name);
        }

        let seg = self.shared.remove(name).expect("checked above");
        debug_assert!(seg.sharers.is_empty());
        for i in 0..seg.pages {
            let r = seg.page_ref(&self.pmt, i);
            let d = self.pmt.desc(r);
            if d.valid() {
                self.release_frame(d.frame());
            }
            if d.has_cluster() {
                self.disk.free_cluster(d.cluster());
            }
            self.pmt.put(r, Descriptor::empty());
        }
        for t in 0..seg.pmt2_count {
            let slot = self.pmt.pmt1_entry(seg.pmt1_slot, t as usize);
            self.pmt.free_slot(slot);
        }
        self.pmt.free_slot(seg.pmt1_slot);
        vdebug!("shared", "deleted"; name = name);
        Status::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::compatible;
    use crate::system::testhost::host;
    use crate::types::{AccessType, Status};
    use AccessType::*;

    #[test]
    fn compatibility_matrix() {
        assert!(compatible(Read, Read));
        assert!(compatible(Read, ReadWrite));
        assert!(!compatible(Read, Write));
        assert!(compatible(Write, Write));
        assert!(compatible(Write, ReadWrite));
        assert!(!compatible(Write, Read));
        assert!(compatible(ReadWrite, Read));
        assert!(compatible(ReadWrite, Write));
        assert!(compatible(ReadWrite, ReadWrite));
        assert!(!compatible(ReadWrite, Execute));
        assert!(compatible(Execute, Execute));
        assert!(!compatible(Execute, Read));
        assert!(!compatible(Execute, ReadWrite));
    }

    #[test]
    fn first_connector_creates_the_segment() {
        let h = host(8, 16, 16);
        let p1 = h.system.create_process().unwrap();
        assert_eq!(
            p1.create_shared_segment(0x0400, 1, "scratch", ReadWrite),
            Status::Ok
        );
        // Registry PMT1 + registry PMT2 + caller PMT2, beyond the
        // process's own PMT1.
        assert_eq!(h.system.free_pmt_slots(), 16 - 1 - 3);
    }

    #[test]
    fn second_connector_must_fit() {
        let h = host(8, 16, 16);
        let p1 = h.system.create_process().unwrap();
        let p2 = h.system.create_process().unwrap();
        assert_eq!(
            p1.create_shared_segment(0x0400, 2, "buf", ReadWrite),
            Status::Ok
        );

        // Longer than the segment: rejected.
        assert_eq!(
            p2.create_shared_segment(0x0400, 3, "buf", Read),
            Status::Trap
        );
        // Incompatible access: rejected.
        assert_eq!(
            p2.create_shared_segment(0x0400, 2, "buf", Execute),
            Status::Trap
        );
        // Shorter window with compatible access: fine.
        assert_eq!(
            p2.create_shared_segment(0x0400, 1, "buf", Read),
            Status::Ok
        );
    }

    #[test]
    fn double_connection_rejected() {
        let h = host(8, 16, 16);
        let p = h.system.create_process().unwrap();
        assert_eq!(p.create_shared_segment(0x0400, 1, "s", Read), Status::Ok);
        assert_eq!(p.create_shared_segment(0x2000, 1, "s", Read), Status::Trap);
    }

    #[test]
    fn writes_are_visible_across_sharers() {
        let h = host(8, 16, 16);
        let p1 = h.system.create_process().unwrap();
        let p2 = h.system.create_process().unwrap();
        assert_eq!(p1.create_shared_segment(0x0400, 1, "w", ReadWrite), Status::Ok);
        assert_eq!(p2.create_shared_segment(0x0400, 1, "w", Read), Status::Ok);

        assert_eq!(h.system.access(p1.id(), 0x0420, Write), Status::PageFault);
        assert_eq!(p1.page_fault(0x0420), Status::Ok);
        assert_eq!(h.system.access(p1.id(), 0x0420, Write), Status::Ok);
        unsafe { *p1.physical_address(0x0420) = 0xAB };

        // The page is already resident for p2 — same frame.
        assert_eq!(h.system.access(p2.id(), 0x0420, Read), Status::Ok);
        assert_eq!(unsafe { *p2.physical_address(0x0420) }, 0xAB);
    }

    #[test]
    fn rights_are_per_window() {
        let h = host(8, 16, 16);
        let p1 = h.system.create_process().unwrap();
        let p2 = h.system.create_process().unwrap();
        assert_eq!(p1.create_shared_segment(0x0400, 1, "ro", ReadWrite), Status::Ok);
        assert_eq!(p2.create_shared_segment(0x0400, 1, "ro", Read), Status::Ok);

        assert_eq!(p1.page_fault(0x0400), Status::Ok);
        // p2 declared read-only: writing through its window traps.
        assert_eq!(h.system.access(p2.id(), 0x0400, Write), Status::Trap);
    }

    #[test]
    fn disconnect_keeps_the_segment_alive() {
        let h = host(8, 16, 16);
        let p1 = h.system.create_process().unwrap();
        let p2 = h.system.create_process().unwrap();
        assert_eq!(p1.create_shared_segment(0x0400, 1, "k", ReadWrite), Status::Ok);
        assert_eq!(p2.create_shared_segment(0x0400, 1, "k", ReadWrite), Status::Ok);

        assert_eq!(p1.page_fault(0x0400), Status::Ok);
        unsafe { *p1.physical_address(0x0400) = 0x5C };

        assert_eq!(p1.disconnect_shared_segment("k"), Status::Ok);
        assert!(p1.physical_address(0x0400).is_null());

        // p2 still sees the contents.
        assert_eq!(unsafe { *p2.physical_address(0x0400) }, 0x5C);
    }

    #[test]
    fn delete_disconnects_everyone_and_frees_state() {
        let h = host(8, 16, 16);
        let frames0 = h.system.free_frames();
        let slots0 = h.system.free_pmt_slots();

        let p1 = h.system.create_process().unwrap();
        let p2 = h.system.create_process().unwrap();
        assert_eq!(p1.create_shared_segment(0x0400, 1, "d", ReadWrite), Status::Ok);
        assert_eq!(p2.create_shared_segment(0x0400, 1, "d", Read), Status::Ok);
        assert_eq!(p1.page_fault(0x0400), Status::Ok);

        assert_eq!(p1.delete_shared_segment("d"), Status::Ok);
        assert!(p2.physical_address(0x0400).is_null());
        // Deleting again: the name is gone.
        assert_eq!(p2.delete_shared_segment("d"), Status::Trap);

        drop(p1);
        drop(p2);
        assert_eq!(h.system.free_frames(), frames0);
        assert_eq!(h.system.free_pmt_slots(), slots0);
    }

    #[test]
    fn disconnect_without_connection_traps() {
        let h = host(8, 16, 16);
        let p = h.system.create_process().unwrap();
        assert_eq!(p.disconnect_shared_segment("ghost"), Status::Trap);
    }
}
