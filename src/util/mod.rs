//! Various utilities

pub mod align;
pub mod byte_size;
