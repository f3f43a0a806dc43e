//! The allocator module exposes the staging allocator used by upload workers.
//! <br>
//! <br>
//! # Staging allocator
//! A ring allocator over one mapped staging buffer, used for transient upload payloads. For more information
//! check the [`staging`] module documentation.
//!
//! Device memory for destination buffers and images is allocated by the [`Device`](crate::Device)
//! implementation. The Vulkan backend uses `gpu-allocator`, see [`backend::vulkan`](crate::backend::vulkan).

pub mod staging;
