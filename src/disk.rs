//! Disk Cluster Allocator
//!
//! Owns the partition's free-cluster list and every transfer to or from
//! it. The free list is a linked vector: `next[c]` holds the cluster
//! number that follows `c`, with [`NO_CLUSTER`] terminating the chain.
//! Freed clusters are pushed at the head so the next allocation reuses a
//! cluster the disk arm just visited.

use crate::partition::{Partition, CLUSTER_SIZE};
use crate::types::PageBuf;
use crate::{vdebug, vtrace, vwarn};

/// Free-list terminator / "no cluster" sentinel.
pub const NO_CLUSTER: u32 = u32::MAX;

/// Link value marking a cluster as handed out, so a second free of the
/// same cluster is caught instead of corrupting the list.
const ALLOCATED: u32 = u32::MAX - 1;

/// Cluster allocator plus transfer front-end for one partition.
pub struct DiskManager {
    part: Box<dyn Partition>,
    /// `next[c]` = cluster after `c` on the free list.
    next: Vec<u32>,
    head: u32,
    free: u32,
}

impl DiskManager {
    pub fn new(part: Box<dyn Partition>) -> Self {
        let clusters = part.cluster_count();
        let mut next = Vec::with_capacity(clusters as usize);
        for c in 0..clusters {
            next.push(if c + 1 < clusters { c + 1 } else { NO_CLUSTER });
        }
        vdebug!("disk", "init_ok"; clusters = clusters);
        Self {
            part,
            next,
            head: if clusters > 0 { 0 } else { NO_CLUSTER },
            free: clusters,
        }
    }

    /// Total clusters on the partition.
    pub fn cluster_count(&self) -> u32 {
        self.next.len() as u32
    }

    /// Clusters currently on the free list.
    pub fn free_clusters(&self) -> u32 {
        self.free
    }

    /// True if at least `n` clusters can still be allocated.
    #[inline]
    pub fn has_space(&self, n: usize) -> bool {
        self.free as usize >= n
    }

    fn pop_free(&mut self) -> Option<u32> {
        if self.head == NO_CLUSTER {
            return None;
        }
        let c = self.head;
        self.head = self.next[c as usize];
        self.next[c as usize] = ALLOCATED;
        self.free -= 1;
        Some(c)
    }

    /// Allocate a cluster and write `buf` to it. Returns the cluster
    /// number, or None when the disk is full or the device failed.
    pub fn write(&mut self, buf: &PageBuf) -> Option<u32> {
        let c = self.pop_free()?;
        if !self.part.write_cluster(c, buf) {
            vwarn!("disk", "write_failed"; cluster = c);
            self.push_free(c);
            return None;
        }
        Some(c)
    }

    /// Write `buf` to a cluster this page already owns.
    pub fn write_to(&mut self, buf: &PageBuf, cluster: u32) -> bool {
        let ok = self.part.write_cluster(cluster, buf);
        if !ok {
            vwarn!("disk", "rewrite_failed"; cluster = cluster);
        }
        ok
    }

    /// Allocate a cluster and fill it with a copy of `src`. Used by
    /// copy-on-write divergence when the shared page is not resident.
    pub fn write_from(&mut self, src: u32) -> Option<u32> {
        let mut buf: PageBuf = [0; CLUSTER_SIZE];
        if !self.part.read_cluster(src, &mut buf) {
            vwarn!("disk", "copy_read_failed"; cluster = src);
            return None;
        }
        let dst = self.write(&buf)?;
        vdebug!("disk", "cluster_copied"; src = src, dst = dst);
        Some(dst)
    }

    /// Read `cluster` into `buf`.
    pub fn read(&mut self, buf: &mut PageBuf, cluster: u32) -> bool {
        let ok = self.part.read_cluster(cluster, buf);
        if !ok {
            vwarn!("disk", "read_failed"; cluster = cluster);
        }
        ok
    }

    /// Return `cluster` to the head of the free list.
    pub fn free_cluster(&mut self, cluster: u32) {
        assert!(
            self.next[cluster as usize] == ALLOCATED,
            "double free of cluster {}",
            cluster
        );
        self.push_free(cluster);
        vtrace!("disk", "cluster_freed"; cluster = cluster);
    }

    fn push_free(&mut self, cluster: u32) {
        self.next[cluster as usize] = self.head;
        self.head = cluster;
        self.free += 1;
    }
}
