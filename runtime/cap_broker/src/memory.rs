//! Memory Pool - bounded allocator for driver-private state
//!
//! A bump allocator over a fixed capacity. Freed bytes are returned to the
//! capacity budget but addresses are never handed out twice, which keeps a
//! stale region from aliasing a fresh one.

use std::collections::BTreeMap;

use crate::{CapabilityError, Result};

/// Default pool capacity (1MB)
pub const DEFAULT_POOL_SIZE: usize = 1024 * 1024;

/// Allocation granularity
const MIN_ALIGN: usize = 16;

/// Base of the pool's address range
const POOL_BASE: usize = 0xffff_8880_0000_0000;

/// Allocated memory region
///
/// Move-only: freeing consumes the region.
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    addr: usize,
    size: usize,
}

impl MemoryRegion {
    /// Start address of the region
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Requested size in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

#[derive(Debug)]
pub(crate) struct MemoryPool {
    capacity: usize,
    in_use: usize,
    next: usize,
    live: BTreeMap<usize, usize>,
}

impl MemoryPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: 0,
            next: 0,
            live: BTreeMap::new(),
        }
    }

    pub(crate) fn allocate(&mut self, size: usize) -> Result<MemoryRegion> {
        let out_of_memory = || CapabilityError::OutOfMemory { requested: size };
        let footprint = align_up(size.max(1), MIN_ALIGN).ok_or_else(out_of_memory)?;
        match self.in_use.checked_add(footprint) {
            Some(total) if total <= self.capacity => {}
            _ => return Err(out_of_memory()),
        }

        let next = self.next.checked_add(footprint).ok_or_else(out_of_memory)?;
        let addr = POOL_BASE.checked_add(self.next).ok_or_else(out_of_memory)?;
        self.next = next;
        self.in_use += footprint;
        self.live.insert(addr, footprint);

        Ok(MemoryRegion { addr, size })
    }

    pub(crate) fn free(&mut self, region: MemoryRegion) {
        match self.live.remove(&region.addr) {
            Some(footprint) => self.in_use -= footprint,
            None => log::warn!("free of unknown region {:#x}", region.addr),
        }
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}
