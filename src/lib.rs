//! User-Space Virtual Memory Manager
//!
//! Demand paging for a set of cooperating client processes over two
//! host-supplied memory regions and a cluster-addressed backing
//! partition. Each process gets an independent 24-bit address space in
//! 1 KiB pages, translated through per-process two-level tables.
//!
//! ## What the host does
//!
//! The host allocates the frame arena and the PMT arena (both
//! page-aligned), provides a [`Partition`], and drives a periodic clock
//! tick. Byte access is the host's job too: it calls
//! [`System::access`], resolves [`Status::PageFault`] via
//! [`Process::page_fault`], then reads or writes through
//! [`Process::physical_address`].
//!
//! ## Shape of the crate
//!
//! ```text
//! System ──────────── facade; one Mutex around all state
//!   ├─ arena            intrusive free lists over the two regions
//!   ├─ pmt              PMT1/PMT2 views, descriptor coordinates
//!   ├─ descriptor       16-byte bit-packed page descriptor
//!   ├─ disk             cluster allocator over the partition
//!   ├─ replace          reference histories, victim selection
//!   ├─ segment          create/load/delete, admission checks
//!   ├─ fault            fault resolution, copy-on-write, thrashing
//!   ├─ shared           named shared-segment registry
//!   └─ clone            copy-on-write process duplication
//! ```
//!
//! ## Example
//!
//! ```rust
//! use vmpager::{AccessType, MemPartition, Status, System, PAGE_SIZE};
//!
//! // A toy host: 16 frames, 16 PMT slots, 64 clusters.
//! #[repr(align(1024))]
//! struct Region([u8; 16 * PAGE_SIZE]);
//! let mut frames = Box::new(Region([0; 16 * PAGE_SIZE]));
//! let mut tables = Box::new(Region([0; 16 * PAGE_SIZE]));
//!
//! let system = unsafe {
//!     System::new(
//!         frames.0.as_mut_ptr(),
//!         16,
//!         tables.0.as_mut_ptr(),
//!         16,
//!         Box::new(MemPartition::new(64)),
//!     )
//! };
//!
//! let p = system.create_process().unwrap();
//! assert_eq!(p.create_segment(0x0400, 2, AccessType::ReadWrite), Status::Ok);
//! assert_eq!(system.access(p.id(), 0x0400, AccessType::Write), Status::PageFault);
//! assert_eq!(p.page_fault(0x0400), Status::Ok);
//! assert_eq!(system.access(p.id(), 0x0400, AccessType::Write), Status::Ok);
//! assert!(!p.physical_address(0x0400).is_null());
//! ```

pub mod klog;
pub mod sync;

pub mod partition;
pub mod types;

mod arena;
mod clone;
mod descriptor;
mod disk;
mod fault;
mod pmt;
mod process;
mod replace;
mod segment;
mod shared;
mod system;

pub use partition::{MemPartition, Partition, CLUSTER_SIZE};
pub use process::Process;
pub use system::System;
pub use types::{AccessType, Pid, Status, VirtualAddress, PAGE_SIZE, TICK_MS};
