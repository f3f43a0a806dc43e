use anyhow::Result;

use deimos::prelude::*;

mod framework;

struct HostMemory(Vec<u8>);

impl StagingMemory for HostMemory {
    fn size(&self) -> u64 {
        self.0.len() as u64
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        self.0[offset..offset + data.len()].copy_from_slice(data);
    }
}

#[test]
pub fn allocations_are_aligned_and_disjoint() -> Result<()> {
    let mut staging = StagingAllocator::new(HostMemory(vec![0; 256]));
    let a = staging.allocate(10, 16)?;
    let b = staging.allocate(20, 16)?;
    let c = staging.allocate(1, 64)?;
    assert!(!a.wrapped && !b.wrapped && !c.wrapped);
    assert_eq!(a.region.offset, 0);
    assert_eq!(b.region.offset, 16, "Second allocation should start at the next aligned offset.");
    assert_eq!(c.region.offset, 64);
    assert!(a.region.end() <= b.region.offset && b.region.end() <= c.region.offset);
    Ok(())
}

#[test]
pub fn allocation_wraps_when_tail_is_too_small() -> Result<()> {
    let mut staging = StagingAllocator::new(HostMemory(vec![0; 100]));
    staging.allocate(60, 4)?;
    let wrapped = staging.allocate(50, 4)?;
    assert!(wrapped.wrapped, "Request that does not fit the tail should wrap.");
    assert_eq!(wrapped.region.offset, 0);
    assert_eq!(staging.offset(), 50);

    let next = staging.allocate(48, 4)?;
    assert!(!next.wrapped, "Exact fit at the end should not wrap.");
    assert_eq!(next.region.offset, 52);
    Ok(())
}

#[test]
pub fn allocation_larger_than_capacity_fails() {
    let mut staging = StagingAllocator::new(HostMemory(vec![0; 32]));
    let err = staging.allocate(33, 1).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::StagingOverflow {
            requested: 33,
            capacity: 32
        })
    ));
    assert_eq!(staging.offset(), 0, "Failed allocation should not move the offset.");
}

#[test]
pub fn writes_land_in_their_region() -> Result<()> {
    let mut staging = StagingAllocator::new(HostMemory(vec![0; 16]));
    let first = staging.allocate(4, 4)?;
    let second = staging.allocate(4, 4)?;
    staging.write(&second.region, &[1, 2, 3, 4]);
    staging.write(&first.region, &[9, 9]);
    assert_eq!(&staging.memory().0[..8], &[9, 9, 0, 0, 1, 2, 3, 4]);
    Ok(())
}
