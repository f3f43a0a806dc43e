//! A ring allocator over a single mapped staging buffer.
//!
//! Every worker thread owns one [`StagingAllocator`], so allocating never takes a lock. The allocator works by
//! linearly incrementing an offset on every allocation. When a request does not fit between the current
//! offset and the end of the buffer, it wraps around to offset zero and reports this in
//! [`StagingAllocation::wrapped`].
//!
//! No overlap detection is performed. The owner must make sure every region handed out before the wrap has
//! been consumed by the GPU before writing into the new region.
//!
//! # Example
//! ```
//! # use deimos::prelude::*;
//! # use anyhow::Result;
//! fn stage<M: StagingMemory>(staging: &mut StagingAllocator<M>, data: &[u8]) -> Result<StagingRegion> {
//!     let allocation = staging.allocate(data.len() as u64, 16)?;
//!     if allocation.wrapped {
//!         // Wait for all earlier uploads from this allocator to finish here.
//!     }
//!     staging.write(&allocation.region, data);
//!     Ok(allocation.region)
//! }
//! ```

use anyhow::Result;

use crate::device::StagingMemory;
use crate::util::align::align;
use crate::Error;

/// A byte range inside a staging buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StagingRegion {
    /// Offset into the staging buffer in bytes.
    pub offset: u64,
    /// Length of the region in bytes.
    pub size: u64,
}

impl StagingRegion {
    /// One past the last byte of this region.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Result of [`StagingAllocator::allocate()`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StagingAllocation {
    pub region: StagingRegion,
    /// True if the allocator wrapped back to the start of the buffer to serve this request.
    pub wrapped: bool,
}

/// Ring allocator over one persistently mapped staging buffer. See the [module documentation](self).
#[derive(Debug)]
pub struct StagingAllocator<M: StagingMemory> {
    memory: M,
    offset: u64,
}

impl<M: StagingMemory> StagingAllocator<M> {
    /// Create a new staging allocator that hands out ranges of `memory`.
    pub fn new(memory: M) -> Self {
        Self {
            memory,
            offset: 0,
        }
    }

    /// Total size of the staging buffer.
    pub fn capacity(&self) -> u64 {
        self.memory.size()
    }

    /// Offset the next allocation will start searching from.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The staging buffer regions are allocated from.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Allocate `size` bytes with the given alignment. Wraps to the start of the buffer if the request does not
    /// fit before its end.
    /// # Errors
    /// * Fails if `size` is larger than the whole staging buffer.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<StagingAllocation> {
        let capacity = self.capacity();
        if size > capacity {
            anyhow::bail!(Error::StagingOverflow {
                requested: size,
                capacity,
            });
        }

        let aligned = align(self.offset, alignment.max(1));
        let (offset, wrapped) = if aligned + size > capacity {
            (0, true)
        } else {
            (aligned, false)
        };
        self.offset = offset + size;

        Ok(StagingAllocation {
            region: StagingRegion {
                offset,
                size,
            },
            wrapped,
        })
    }

    /// Write `data` to the start of a region obtained from this allocator.
    /// # Panics
    /// Panics if `data` is larger than the region.
    pub fn write(&mut self, region: &StagingRegion, data: &[u8]) {
        assert!(data.len() as u64 <= region.size, "staging write exceeds its region");
        self.memory.write(region.offset, data);
    }
}
