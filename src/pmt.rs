//! Page Map Tables
//!
//! Typed views over the PMT arena. A slot is either:
//! - a **PMT1**: 256 × u32 slot indices of second-level tables
//!   ([`NO_SLOT`] where absent) — one per process or shared segment;
//! - a **PMT2**: 64 × 16-byte [`Descriptor`]s.
//!
//! Both shapes fill a slot exactly (256 × 4 B = 64 × 16 B = 1024 B).
//!
//! Descriptors are addressed crate-wide by [`DescRef`], a packed
//! `(slot, entry)` coordinate. They are copied in and out whole; nothing
//! outside this module holds references into the arena.
//!
//! ## Counter entries
//!
//! Every process-owned and cloning PMT2 has a [`Pmt2Counter`] in the
//! system's counter map, tracking how many of its descriptors are in use.
//! The table is garbage-collected when the counter reaches zero. Cloning
//! PMT2s additionally carry a per-descriptor reference count (how many
//! originating descriptors still point at each entry). Shared-segment
//! PMT2s are owned by the registry entry instead and never appear here.

use crate::arena::{Arena, NO_UNIT};
use crate::descriptor::Descriptor;
use crate::types::{Pid, PMT1_LEN, PMT2_LEN};

/// "no second-level table" sentinel in PMT1 entries.
pub const NO_SLOT: u32 = NO_UNIT;

// ============================================================================
// Descriptor coordinates
// ============================================================================

/// Packed coordinate of one descriptor: `slot * 64 + entry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescRef(u32);

impl DescRef {
    pub const NONE: DescRef = DescRef(u32::MAX);

    #[inline]
    pub fn new(slot: u32, entry: usize) -> Self {
        debug_assert!(entry < PMT2_LEN);
        DescRef(slot * PMT2_LEN as u32 + entry as u32)
    }

    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        DescRef(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    /// PMT-arena slot holding this descriptor's PMT2.
    #[inline]
    pub fn slot(self) -> u32 {
        debug_assert!(!self.is_none());
        self.0 / PMT2_LEN as u32
    }

    /// Index inside the PMT2.
    #[inline]
    pub fn entry(self) -> usize {
        debug_assert!(!self.is_none());
        (self.0 % PMT2_LEN as u32) as usize
    }
}

// ============================================================================
// Counter map
// ============================================================================

/// Liveness record for one allocated PMT2.
pub struct Pmt2Counter {
    /// PMT-arena slot of the table.
    pub slot: u32,
    /// Descriptors currently in use in it.
    pub counter: u16,
    /// Cloning PMT2s only: per-entry count of originating descriptors
    /// still pointing here.
    pub entry_refs: Option<Box<[u16; PMT2_LEN]>>,
}

impl Pmt2Counter {
    pub fn new(slot: u32) -> Self {
        Self { slot, counter: 0, entry_refs: None }
    }

    pub fn new_cloning(slot: u32) -> Self {
        Self {
            slot,
            counter: 0,
            entry_refs: Some(Box::new([0; PMT2_LEN])),
        }
    }
}

/// Counter-map key for a process-owned PMT2.
///
/// Cantor pairing of `(pid, pmt1_index)` is a bijection, so distinct
/// tables never collide; the low bit distinguishes the cloning key space.
#[inline]
pub fn process_key(pid: Pid, page1: usize) -> u64 {
    let a = pid as u64;
    let b = page1 as u64;
    (((a + b) * (a + b + 1)) / 2 + b) << 1
}

/// Counter-map key for a cloning PMT2, from a per-system sequence.
/// Odd by construction, disjoint from every process key. The same value
/// is stored in each participating descriptor's `disk` field.
#[inline]
pub fn cloning_key(seq: u32) -> u32 {
    (seq << 1) | 1
}

// ============================================================================
// Arena views
// ============================================================================

/// The PMT arena with typed slot accessors.
pub struct PmtArena {
    raw: Arena,
}

impl PmtArena {
    /// See [`Arena::new`] for the safety contract.
    pub unsafe fn new(base: *mut u8, slots: u32) -> Self {
        Self {
            raw: Arena::new(base, slots, "pmt"),
        }
    }

    #[inline]
    pub fn free_slots(&self) -> u32 {
        self.raw.free_count()
    }

    /// Allocate a slot and format it as an empty PMT1.
    pub fn alloc_pmt1(&mut self) -> Option<u32> {
        let slot = self.raw.alloc()?;
        for i in 0..PMT1_LEN {
            self.set_pmt1_entry(slot, i, NO_SLOT);
        }
        Some(slot)
    }

    /// Allocate a slot and format it as a PMT2 of empty descriptors.
    pub fn alloc_pmt2(&mut self) -> Option<u32> {
        let slot = self.raw.alloc()?;
        for e in 0..PMT2_LEN {
            self.put(DescRef::new(slot, e), Descriptor::empty());
        }
        Some(slot)
    }

    /// Return a PMT1 or PMT2 slot to the free list.
    pub fn free_slot(&mut self, slot: u32) {
        self.raw.free(slot);
    }

    /// Entry `idx` of the PMT1 in `slot`.
    #[inline]
    pub fn pmt1_entry(&self, slot: u32, idx: usize) -> u32 {
        debug_assert!(idx < PMT1_LEN);
        // SAFETY: in-bounds, 4-aligned offset inside the arena region.
        unsafe { *(self.raw.unit_ptr(slot) as *const u32).add(idx) }
    }

    #[inline]
    pub fn set_pmt1_entry(&mut self, slot: u32, idx: usize, val: u32) {
        debug_assert!(idx < PMT1_LEN);
        // SAFETY: as in pmt1_entry.
        unsafe { *(self.raw.unit_ptr(slot) as *mut u32).add(idx) = val }
    }

    /// Copy the descriptor at `r` out of the arena.
    #[inline]
    pub fn desc(&self, r: DescRef) -> Descriptor {
        debug_assert!(!r.is_none());
        // SAFETY: the slot is 1024-aligned, entries are 16-aligned, and
        // Descriptor is plain old data, so a copy out is always sound.
        unsafe { *(self.raw.unit_ptr(r.slot()) as *const Descriptor).add(r.entry()) }
    }

    /// Copy a descriptor into the arena at `r`.
    #[inline]
    pub fn put(&mut self, r: DescRef, d: Descriptor) {
        debug_assert!(!r.is_none());
        // SAFETY: as in desc().
        unsafe { *(self.raw.unit_ptr(r.slot()) as *mut Descriptor).add(r.entry()) = d }
    }

    /// Read-modify-write the descriptor at `r`.
    #[inline]
    pub fn update<F: FnOnce(&mut Descriptor)>(&mut self, r: DescRef, f: F) {
        let mut d = self.desc(r);
        f(&mut d);
        self.put(r, d);
    }
}
