//! Utilities for aligning memory

use std::ops::{Add, Rem, Sub};

/// Align a size or offset up to a required alignment. Values that are already aligned are returned unchanged.
pub fn align<T>(value: T, alignment: T) -> T
where
    T: Add<T, Output = T> + Sub<T, Output = T> + Rem<T, Output = T> + PartialEq + Default + Copy, {
    let unaligned = value % alignment;
    if unaligned == T::default() {
        value
    } else {
        value + (alignment - unaligned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_values_are_unchanged() {
        assert_eq!(align(256u64, 256), 256);
        assert_eq!(align(0u64, 16), 0);
    }

    #[test]
    fn rounds_up() {
        assert_eq!(align(17u64, 16), 32);
        assert_eq!(align(1u32, 4), 4);
    }
}
