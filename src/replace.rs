//! Reference History and Victim Selection
//!
//! One register per frame, holding a 32-bit reference history and the
//! coordinate of the descriptor currently backed by that frame. The
//! periodic job shifts each occupied register right and feeds the
//! descriptor's referenced bit into the MSB — frames touched recently
//! keep large histories, cold frames decay toward zero.
//!
//! Victim selection scans the registers and keeps two minima side by
//! side: the coldest page that already owns a cluster and the coldest
//! page that does not. Normally the overall minimum wins; when the disk
//! is full, a page that would need a fresh cluster for its writeback can
//! never be evicted while a page with a reserved cluster exists. That
//! tie-break is what keeps eviction live on a full disk.

use crate::arena::Arena;
use crate::descriptor::{AdvancedBits, BasicBits};
use crate::disk::DiskManager;
use crate::pmt::{DescRef, PmtArena};
use crate::types::{PageBuf, PAGE_SIZE};
use crate::{vdebug, vtrace};

/// History register for one frame.
#[derive(Clone, Copy)]
pub struct RefRegister {
    /// Shift history; MSB is the most recent tick.
    pub history: u32,
    /// Descriptor currently using this frame, if any.
    pub desc: Option<DescRef>,
}

impl RefRegister {
    pub const fn idle() -> Self {
        Self { history: 0, desc: None }
    }
}

/// Shift every occupied register and consume the referenced bits.
/// Called from the periodic job, under the system lock.
pub fn tick(regs: &mut [RefRegister], pmt: &mut PmtArena) {
    for reg in regs.iter_mut() {
        let Some(r) = reg.desc else { continue };
        let mut d = pmt.desc(r);
        reg.history >>= 1;
        if d.has_adv(AdvancedBits::REFERENCED) {
            reg.history |= 1 << 31;
            d.clear_adv(AdvancedBits::REFERENCED);
            pmt.put(r, d);
        }
    }
}

/// Pick and evict a victim, returning its now-free frame index.
///
/// Returns None when nothing can be evicted: no resident pages at all,
/// or every candidate needs a cluster the disk cannot provide, or the
/// device failed during writeback.
pub fn select_victim(
    regs: &mut [RefRegister],
    pmt: &mut PmtArena,
    frames: &Arena,
    disk: &mut DiskManager,
) -> Option<u32> {
    // Coldest page in each category, by first-discovery tie-break.
    let mut with_cluster: Option<(usize, u32)> = None; // (frame, history)
    let mut without_cluster: Option<(usize, u32)> = None;

    for (i, reg) in regs.iter().enumerate() {
        let Some(r) = reg.desc else { continue };
        let slot = if pmt.desc(r).has_cluster() {
            &mut with_cluster
        } else {
            &mut without_cluster
        };
        if slot.map_or(true, |(_, h)| reg.history < h) {
            *slot = Some((i, reg.history));
        }
    }

    let frame = match (with_cluster, without_cluster) {
        (None, None) => return None,
        (Some((f, _)), None) => f,
        (None, Some((f, _))) => f,
        (Some((fc, hc)), Some((fnc, hn))) => {
            // Overall minimum, first discovery winning ties. A no-cluster
            // winner is overridden when the disk cannot supply the
            // cluster its writeback would need.
            let no_cluster_colder = hn < hc || (hn == hc && fnc < fc);
            if no_cluster_colder && disk.has_space(1) {
                fnc
            } else {
                fc
            }
        }
    } as u32;

    let r = regs[frame as usize].desc.expect("victim register occupied");
    regs[frame as usize].history = 0;

    let mut d = pmt.desc(r);
    debug_assert!(d.valid() && d.frame() == frame);

    if d.dirty() {
        let mut buf: PageBuf = [0; PAGE_SIZE];
        frames.read_unit(frame, &mut buf);
        if d.has_cluster() {
            if !disk.write_to(&buf, d.cluster()) {
                return None;
            }
        } else {
            let cluster = disk.write(&buf)?;
            d.disk = cluster;
            d.set_adv(AdvancedBits::HAS_CLUSTER);
        }
        d.clear(BasicBits::DIRTY);
        vdebug!("replace", "writeback"; frame = frame, cluster = d.cluster());
    }

    d.clear_adv(AdvancedBits::REFERENCED);
    d.clear(BasicBits::VALID);
    d.block = crate::descriptor::NO_REF;
    pmt.put(r, d);

    regs[frame as usize].desc = None;
    vtrace!("replace", "evicted"; frame = frame);
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::testmem::{region, Aligned};
    use crate::descriptor::Descriptor;
    use crate::partition::MemPartition;

    struct Rig {
        _frame_mem: Box<[Aligned]>,
        _pmt_mem: Box<[Aligned]>,
        frames: Arena,
        pmt: PmtArena,
        disk: DiskManager,
        regs: Vec<RefRegister>,
    }

    fn rig(frame_count: u32, clusters: u32) -> Rig {
        let mut frame_mem = region(frame_count as usize);
        let mut pmt_mem = region(4);
        let frames = unsafe { Arena::new(frame_mem.as_mut_ptr() as *mut u8, frame_count, "frames") };
        let pmt = unsafe { PmtArena::new(pmt_mem.as_mut_ptr() as *mut u8, 4) };
        Rig {
            _frame_mem: frame_mem,
            _pmt_mem: pmt_mem,
            frames,
            pmt,
            disk: DiskManager::new(Box::new(MemPartition::new(clusters))),
            regs: vec![RefRegister::idle(); frame_count as usize],
        }
    }

    /// Make a resident in-use descriptor backed by `frame`.
    fn resident(rig: &mut Rig, slot: u32, entry: usize, frame: u32, history: u32) -> DescRef {
        let r = DescRef::new(slot, entry);
        let mut d = Descriptor::empty();
        d.set_adv(AdvancedBits::IN_USE);
        d.set(BasicBits::VALID | BasicBits::READ | BasicBits::WRITE);
        d.block = frame;
        rig.pmt.put(r, d);
        rig.regs[frame as usize] = RefRegister { history, desc: Some(r) };
        r
    }

    #[test]
    fn tick_shifts_and_consumes_referenced() {
        let mut rig = rig(2, 4);
        let slot = rig.pmt.alloc_pmt2().unwrap();
        let f = rig.frames.alloc().unwrap();
        let r = resident(&mut rig, slot, 0, f, 0);

        rig.pmt.update(r, |d| d.set_adv(AdvancedBits::REFERENCED));
        tick(&mut rig.regs, &mut rig.pmt);
        assert_eq!(rig.regs[f as usize].history, 1 << 31);
        assert!(!rig.pmt.desc(r).has_adv(AdvancedBits::REFERENCED));

        // One idle tick halves the history.
        tick(&mut rig.regs, &mut rig.pmt);
        assert_eq!(rig.regs[f as usize].history, 1 << 30);
    }

    #[test]
    fn coldest_page_is_evicted() {
        let mut rig = rig(2, 4);
        let slot = rig.pmt.alloc_pmt2().unwrap();
        let f0 = rig.frames.alloc().unwrap();
        let f1 = rig.frames.alloc().unwrap();
        let hot = resident(&mut rig, slot, 0, f0, 0xF000_0000);
        let cold = resident(&mut rig, slot, 1, f1, 0x1000_0000);

        let victim = select_victim(&mut rig.regs, &mut rig.pmt, &rig.frames, &mut rig.disk);
        assert_eq!(victim, Some(f1));
        assert!(!rig.pmt.desc(cold).valid());
        assert!(rig.pmt.desc(hot).valid());
        assert!(rig.regs[f1 as usize].desc.is_none());
    }

    #[test]
    fn dirty_victim_gets_cluster_on_writeback() {
        let mut rig = rig(1, 4);
        let slot = rig.pmt.alloc_pmt2().unwrap();
        let f = rig.frames.alloc().unwrap();
        let r = resident(&mut rig, slot, 0, f, 0);
        rig.pmt.update(r, |d| d.set(BasicBits::DIRTY));

        let free_before = rig.disk.free_clusters();
        assert_eq!(
            select_victim(&mut rig.regs, &mut rig.pmt, &rig.frames, &mut rig.disk),
            Some(f)
        );
        let d = rig.pmt.desc(r);
        assert!(d.has_cluster());
        assert!(!d.dirty());
        assert_eq!(rig.disk.free_clusters(), free_before - 1);
    }

    #[test]
    fn full_disk_prefers_cluster_owner() {
        let mut rig = rig(2, 1);
        let slot = rig.pmt.alloc_pmt2().unwrap();
        let f0 = rig.frames.alloc().unwrap();
        let f1 = rig.frames.alloc().unwrap();

        // f0: warmer (history 10) but already owns the only cluster.
        let buf = [0u8; PAGE_SIZE];
        let c = rig.disk.write(&buf).unwrap();
        let owner = resident(&mut rig, slot, 0, f0, 10);
        rig.pmt.update(owner, |d| {
            d.set_adv(AdvancedBits::HAS_CLUSTER);
            d.disk = c;
        });

        // f1: colder (history 3), dirty, no cluster — its writeback would
        // need a fresh cluster, and the disk has none left.
        let colder = resident(&mut rig, slot, 1, f1, 3);
        rig.pmt.update(colder, |d| d.set(BasicBits::DIRTY));

        let victim = select_victim(&mut rig.regs, &mut rig.pmt, &rig.frames, &mut rig.disk);
        // The no-cluster page was colder, but the cluster owner must win.
        assert_eq!(victim, Some(f0));
        assert!(rig.pmt.desc(colder).valid());
        assert!(!rig.pmt.desc(owner).valid());
    }

    #[test]
    fn nothing_resident_means_no_victim() {
        let mut rig = rig(2, 2);
        assert!(
            select_victim(&mut rig.regs, &mut rig.pmt, &rig.frames, &mut rig.disk).is_none()
        );
    }
}
