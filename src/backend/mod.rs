//! Implementations of the [`Device`](crate::Device) trait.
//!
//! - [`vulkan`] drives a real GPU. Enabled by the default `vulkan` feature.
//! - [`headless`] keeps everything in host memory and validates recorded commands. Always available.

pub mod headless;
#[cfg(feature = "vulkan")]
pub mod vulkan;
