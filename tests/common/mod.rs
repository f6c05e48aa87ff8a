//! Shared fixture for the end-to-end suites: page-aligned backing
//! memory, a system over it, and a small deterministic generator for the
//! randomised runs.

// Each test binary compiles this module separately and uses a subset.
#![allow(dead_code)]

use vmpager::{MemPartition, System, PAGE_SIZE};

/// One page-aligned 1 KiB unit.
#[repr(align(1024))]
pub struct Unit(pub [u8; PAGE_SIZE]);

/// A system plus the regions backing it. The regions must outlive every
/// handle, so the fixture owns them.
pub struct Host {
    pub system: System,
    frame_mem: Box<[Unit]>,
    _pmt_mem: Box<[Unit]>,
    pub frame_pages: usize,
}

fn region(pages: usize) -> Box<[Unit]> {
    (0..pages).map(|_| Unit([0; PAGE_SIZE])).collect()
}

impl Host {
    pub fn new(frame_pages: usize, pmt_pages: usize, clusters: u32) -> Self {
        let mut frame_mem = region(frame_pages);
        let mut pmt_mem = region(pmt_pages);
        let system = unsafe {
            System::new(
                frame_mem.as_mut_ptr() as *mut u8,
                frame_pages,
                pmt_mem.as_mut_ptr() as *mut u8,
                pmt_pages,
                Box::new(MemPartition::new(clusters)),
            )
        };
        Host {
            system,
            frame_mem,
            _pmt_mem: pmt_mem,
            frame_pages,
        }
    }

    /// True if `pa` points into the frame region.
    pub fn in_frame_region(&self, pa: *const u8) -> bool {
        let base = self.frame_mem.as_ptr() as usize;
        let addr = pa as usize;
        addr >= base && addr < base + self.frame_pages * PAGE_SIZE
    }
}

/// xorshift32 — tiny deterministic generator for the fuzz runs.
pub struct XorShift(u32);

impl XorShift {
    pub fn new(seed: u32) -> Self {
        XorShift(if seed == 0 { 0x9E37_79B9 } else { seed })
    }

    pub fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    /// Uniform-ish value in `[0, bound)`.
    pub fn below(&mut self, bound: u32) -> u32 {
        self.next() % bound
    }
}
