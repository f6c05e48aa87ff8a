//! Page Descriptor
//!
//! The per-page record stored in second-level tables. Sixteen bytes, so a
//! 64-entry PMT2 fills one 1 KiB slot exactly:
//!
//! ```text
//! ┌───────┬───────┬───────┬─────────┬─────────┬─────────┐
//! │ basic │ advcd │ (pad) │  block  │  disk   │  next   │
//! │  u8   │  u8   │  2 B  │  u32    │  u32    │  u32    │
//! └───────┴───────┴───────┴─────────┴─────────┴─────────┘
//! ```
//!
//! `block` and `disk` are multi-role fields; their meaning is keyed on
//! the flag bits and guarded by the typed accessors below:
//!
//! | tag bits            | `block` holds             | `disk` holds      |
//! |---------------------|---------------------------|-------------------|
//! | `VALID`             | backing frame index       | —                 |
//! | `SHARED`            | shared descriptor coord   | —                 |
//! | `CLONED`            | cloning descriptor coord  | cloning-table key |
//! | `HAS_CLUSTER`       | —                         | cluster number    |
//!
//! At most one of `SHARED`/`CLONED` is ever set.

use bitflags::bitflags;

/// Sentinel for the `block`/`next` coordinate fields.
pub const NO_REF: u32 = u32::MAX;

bitflags! {
    /// Hardware-style permission and residency bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BasicBits: u8 {
        /// Page is resident; `block` is its frame
        const VALID   = 1 << 0;
        /// Resident copy differs from the cluster copy
        const DIRTY   = 1 << 1;
        /// Readable
        const READ    = 1 << 2;
        /// Writable
        const WRITE   = 1 << 3;
        /// Executable
        const EXECUTE = 1 << 4;
    }
}

bitflags! {
    /// Bookkeeping bits beyond what a plain MMU would carry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AdvancedBits: u8 {
        /// Descriptor belongs to a live segment
        const IN_USE        = 1 << 0;
        /// `disk` names a reserved cluster
        const HAS_CLUSTER   = 1 << 1;
        /// Indirects to a cloning descriptor; `disk` is the table key
        const CLONED        = 1 << 2;
        /// Touched since the last reference-register shift
        const REFERENCED    = 1 << 3;
        /// Indirects to a shared-segment descriptor
        const SHARED        = 1 << 4;
        /// Next write fault must diverge this page
        const COPY_ON_WRITE = 1 << 5;
    }
}

/// One page's metadata. Plain old data; lives inside PMT-arena slots and
/// is copied in and out whole.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    basic: u8,
    advanced: u8,
    _pad: [u8; 2],
    pub block: u32,
    pub disk: u32,
    pub next: u32,
}

const _: () = assert!(std::mem::size_of::<Descriptor>() == 16);

impl Descriptor {
    /// A descriptor no segment has claimed. A freshly formatted PMT2
    /// holds 64 of these.
    pub const fn empty() -> Self {
        Self {
            basic: 0,
            advanced: 0,
            _pad: [0; 2],
            block: NO_REF,
            disk: 0,
            next: NO_REF,
        }
    }

    #[inline]
    pub fn basic(&self) -> BasicBits {
        BasicBits::from_bits_retain(self.basic)
    }

    #[inline]
    pub fn advanced(&self) -> AdvancedBits {
        AdvancedBits::from_bits_retain(self.advanced)
    }

    #[inline]
    pub fn set(&mut self, bits: BasicBits) {
        self.basic |= bits.bits();
    }

    #[inline]
    pub fn clear(&mut self, bits: BasicBits) {
        self.basic &= !bits.bits();
    }

    #[inline]
    pub fn has(&self, bits: BasicBits) -> bool {
        self.basic().contains(bits)
    }

    #[inline]
    pub fn set_adv(&mut self, bits: AdvancedBits) {
        self.advanced |= bits.bits();
    }

    #[inline]
    pub fn clear_adv(&mut self, bits: AdvancedBits) {
        self.advanced &= !bits.bits();
    }

    #[inline]
    pub fn has_adv(&self, bits: AdvancedBits) -> bool {
        self.advanced().contains(bits)
    }

    // Shorthands for the bits the hot paths test constantly.

    #[inline]
    pub fn valid(&self) -> bool {
        self.has(BasicBits::VALID)
    }

    #[inline]
    pub fn dirty(&self) -> bool {
        self.has(BasicBits::DIRTY)
    }

    #[inline]
    pub fn in_use(&self) -> bool {
        self.has_adv(AdvancedBits::IN_USE)
    }

    #[inline]
    pub fn shared(&self) -> bool {
        self.has_adv(AdvancedBits::SHARED)
    }

    #[inline]
    pub fn cloned(&self) -> bool {
        self.has_adv(AdvancedBits::CLONED)
    }

    #[inline]
    pub fn has_cluster(&self) -> bool {
        self.has_adv(AdvancedBits::HAS_CLUSTER)
    }

    #[inline]
    pub fn redirects(&self) -> bool {
        self.shared() || self.cloned()
    }

    // ------------------------------------------------------------------
    // Multi-role field accessors. Each asserts the tag bits that give
    // the field its claimed meaning.
    // ------------------------------------------------------------------

    /// Backing frame index. Meaningful only while `VALID`.
    #[inline]
    pub fn frame(&self) -> u32 {
        debug_assert!(self.valid(), "frame() on a non-resident descriptor");
        self.block
    }

    /// Coordinate of the authoritative shared descriptor.
    #[inline]
    pub fn shared_ref(&self) -> u32 {
        debug_assert!(self.shared(), "shared_ref() without SHARED");
        self.block
    }

    /// Coordinate of the cloning descriptor.
    #[inline]
    pub fn cloning_ref(&self) -> u32 {
        debug_assert!(self.cloned(), "cloning_ref() without CLONED");
        self.block
    }

    /// Reserved cluster number. Meaningful only while `HAS_CLUSTER`.
    #[inline]
    pub fn cluster(&self) -> u32 {
        debug_assert!(self.has_cluster(), "cluster() without HAS_CLUSTER");
        self.disk
    }

    /// Counter-map key of the owning cloning PMT2.
    #[inline]
    pub fn cloning_key(&self) -> u32 {
        debug_assert!(self.cloned(), "cloning_key() without CLONED");
        self.disk
    }

    /// Grant the access rights implied by a segment's declared type.
    pub fn grant(&mut self, access: crate::types::AccessType) {
        use crate::types::AccessType;
        match access {
            AccessType::Read => self.set(BasicBits::READ),
            AccessType::Write => self.set(BasicBits::WRITE),
            AccessType::ReadWrite => self.set(BasicBits::READ | BasicBits::WRITE),
            AccessType::Execute => self.set(BasicBits::EXECUTE),
        }
    }

    /// True if this descriptor's rights cover an access of `ty`.
    pub fn allows(&self, ty: crate::types::AccessType) -> bool {
        use crate::types::AccessType;
        match ty {
            AccessType::Read => self.has(BasicBits::READ),
            AccessType::Write => self.has(BasicBits::WRITE),
            AccessType::ReadWrite => self.has(BasicBits::READ | BasicBits::WRITE),
            AccessType::Execute => self.has(BasicBits::EXECUTE),
        }
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::empty()
    }
}
