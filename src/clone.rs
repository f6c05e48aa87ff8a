//! Process Cloning
//!
//! Cloning duplicates an address space without copying a single page.
//! For every source PMT2 holding ordinary pages, one *cloning PMT2* is
//! allocated; each ordinary page moves its residency state (frame,
//! cluster, dirty) into the cloning descriptor at the same index, and
//! both the source and the clone descriptor become `CLONED` indirections
//! with a per-entry reference count of two. The first write fault
//! through either side diverges that page (see the fault module);
//! deleting a segment drops its stake the same way.
//!
//! Shared pages stay shared: the clone joins the registry entry. Pages
//! that were already cloned just gain one more stakeholder.

use crate::descriptor::{AdvancedBits, BasicBits, Descriptor};
use crate::pmt::{cloning_key, process_key, DescRef, Pmt2Counter, NO_SLOT};
use crate::process::{ProcState, SegmentInfo};
use crate::system::VmState;
use crate::types::{page1, page2, Pid, VirtualAddress, PAGE_SIZE, PMT1_LEN, PMT2_LEN};
use crate::vdebug;

impl VmState {
    /// Clone `src_pid`'s address space. Returns the new pid, or None for
    /// an unknown source or too few PMT slots.
    pub(crate) fn clone_process(&mut self, src_pid: Pid) -> Option<Pid> {
        let src_pmt1 = self.procs.get(&src_pid)?.pmt1_slot;

        // Admission: one PMT1, one copy of every source PMT2, and one
        // cloning PMT2 per source PMT2 that holds an ordinary page not
        // yet behind a cloning descriptor. Exact, so nothing below can
        // run out of slots.
        let mut src_slots: Vec<(usize, u32)> = Vec::new();
        let mut cloning_needed = 0usize;
        for p1 in 0..PMT1_LEN {
            let slot = self.pmt.pmt1_entry(src_pmt1, p1);
            if slot == NO_SLOT {
                continue;
            }
            src_slots.push((p1, slot));
            let needs_cloning = (0..PMT2_LEN).any(|e| {
                let d = self.pmt.desc(DescRef::new(slot, e));
                d.in_use() && !d.shared() && !d.cloned()
            });
            if needs_cloning {
                cloning_needed += 1;
            }
        }
        let slots_needed = 1 + src_slots.len() + cloning_needed;
        if slots_needed > self.pmt.free_slots() as usize {
            vdebug!("clone", "no_pmt_slots"; src = src_pid, needed = slots_needed);
            return None;
        }

        let new_pmt1 = self.pmt.alloc_pmt1().expect("slot admission checked");
        let new_pid = self.next_pid;
        self.next_pid += 1;

        for &(p1, src_slot) in &src_slots {
            let dst_slot = self.pmt.alloc_pmt2().expect("slot admission checked");
            self.pmt.set_pmt1_entry(new_pmt1, p1, dst_slot);

            let mut in_use = 0u16;
            let mut cloning_slot: Option<(u32, u32)> = None; // (slot, key)

            for e in 0..PMT2_LEN {
                let src_ref = DescRef::new(src_slot, e);
                let sd = self.pmt.desc(src_ref);
                if !sd.in_use() {
                    continue;
                }
                in_use += 1;
                let dst_ref = DescRef::new(dst_slot, e);

                if sd.shared() {
                    // The clone sees the same registry descriptor.
                    let mut dd = Descriptor::empty();
                    dd.set_adv(AdvancedBits::IN_USE | AdvancedBits::SHARED);
                    dd.set(sd.basic());
                    dd.block = sd.shared_ref();
                    self.pmt.put(dst_ref, dd);
                } else if sd.cloned() {
                    // Another stakeholder in the existing cloning entry.
                    let mut dd = sd;
                    dd.next = crate::descriptor::NO_REF;
                    self.pmt.put(dst_ref, dd);
                    self.add_cloned_stake(sd.cloning_key(), sd.cloning_ref());
                } else {
                    let (cslot, key) = match cloning_slot {
                        Some(pair) => pair,
                        None => {
                            let cslot =
                                self.pmt.alloc_pmt2().expect("slot admission checked");
                            let key = cloning_key(self.cloning_seq);
                            self.cloning_seq += 1;
                            self.counters
                                .insert(key as u64, Pmt2Counter::new_cloning(cslot));
                            cloning_slot = Some((cslot, key));
                            (cslot, key)
                        }
                    };
                    self.split_to_cloning(src_ref, dst_ref, DescRef::new(cslot, e), key);
                }
            }

            // The copied PMT2 tracks its own liveness under the clone's key.
            let mut counter = Pmt2Counter::new(dst_slot);
            counter.counter = in_use;
            self.counters.insert(process_key(new_pid, p1), counter);
        }

        let segments = self.mirror_segments(src_pid, new_pid, new_pmt1);
        self.procs.insert(
            new_pid,
            ProcState {
                pmt1_slot: new_pmt1,
                segments,
                should_block: false,
            },
        );
        vdebug!("clone", "cloned"; src = src_pid, new = new_pid);
        Some(new_pid)
    }

    /// Move an ordinary page's state behind a cloning descriptor and
    /// turn both sides into `CLONED` stakeholders of it.
    fn split_to_cloning(
        &mut self,
        src_ref: DescRef,
        dst_ref: DescRef,
        clone_ref: DescRef,
        key: u32,
    ) {
        let sd = self.pmt.desc(src_ref);

        // The cloning descriptor inherits residency wholesale: frame,
        // cluster, dirty and referenced state.
        let mut cd = sd;
        cd.clear_adv(AdvancedBits::COPY_ON_WRITE);
        cd.next = crate::descriptor::NO_REF;
        self.pmt.put(clone_ref, cd);
        if sd.valid() {
            // The frame's register now belongs to the cloning descriptor.
            self.regs[sd.frame() as usize].desc = Some(clone_ref);
        }

        {
            let counter = self
                .counters
                .get_mut(&(key as u64))
                .expect("cloning counter inserted");
            counter.counter += 1;
            counter.entry_refs.as_mut().expect("cloning refcounts")[clone_ref.entry()] = 2;
        }

        // Both sides: permission bits only, indirecting through the
        // cloning descriptor. The source keeps its segment chain.
        let mut stake = Descriptor::empty();
        stake.set_adv(AdvancedBits::IN_USE | AdvancedBits::CLONED | AdvancedBits::COPY_ON_WRITE);
        stake.set(sd.basic() & (BasicBits::READ | BasicBits::WRITE | BasicBits::EXECUTE));
        stake.block = clone_ref.raw();
        stake.disk = key;

        let mut new_src = stake;
        new_src.next = sd.next;
        self.pmt.put(src_ref, new_src);
        self.pmt.put(dst_ref, stake);
    }

    /// One more originating descriptor points at an existing cloning
    /// descriptor.
    fn add_cloned_stake(&mut self, key: u32, clone_raw: u32) {
        let counter = self
            .counters
            .get_mut(&(key as u64))
            .expect("cloning counter entry");
        let refs = counter.entry_refs.as_mut().expect("cloning refcounts");
        refs[DescRef::from_raw(clone_raw).entry()] += 1;
    }

    /// Duplicate the segment list, rebuilding each `next` chain over the
    /// clone's tables and joining shared registry entries.
    fn mirror_segments(
        &mut self,
        src_pid: Pid,
        new_pid: Pid,
        new_pmt1: u32,
    ) -> Vec<SegmentInfo> {
        let specs: Vec<(VirtualAddress, crate::types::AccessType, u32, Option<String>)> = self
            .procs[&src_pid]
            .segments
            .iter()
            .map(|s| (s.start, s.access, s.pages, s.shared_name.clone()))
            .collect();

        let mut segments = Vec::with_capacity(specs.len());
        for (start, access, pages, shared_name) in specs {
            let mut first = DescRef::NONE;
            let mut prev = DescRef::NONE;
            for i in 0..pages {
                let va = start + i * PAGE_SIZE as u32;
                let slot = self.pmt.pmt1_entry(new_pmt1, page1(va));
                debug_assert!(slot != NO_SLOT);
                let r = DescRef::new(slot, page2(va));
                if first.is_none() {
                    first = r;
                } else {
                    self.pmt.update(prev, |p| p.next = r.raw());
                }
                prev = r;
            }

            if let Some(name) = &shared_name {
                if let Some(seg) = self.shared.get_mut(name) {
                    seg.sharers.push(crate::shared::Sharer {
                        pid: new_pid,
                        first,
                    });
                }
            }
            segments.push(SegmentInfo {
                start,
                access,
                pages,
                first,
                shared_name,
            });
        }
        segments
    }
}
