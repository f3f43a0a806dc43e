//! Asynchronous GPU asset streaming.
//!
//! Deimos streams models and textures to the GPU from a pool of background threads, so that the render loop never
//! blocks on disk, decoding or transfer work. Loading is split into three stages that overlap freely:
//! parsing on the calling thread, recording upload commands on worker threads and executing them on a dedicated
//! coordinator thread.
//!
//! To get started, import the prelude
//! ```
//! use deimos::prelude::*;
//! ```
//!
//! # Example
//!
//! Everything is generic over a [`Device`]. The [`headless`](backend::headless) device keeps all resources in host
//! memory and is handy for tests and tools. With the default `vulkan` feature,
//! [`VulkanDevice`](backend::vulkan::VulkanDevice) drives a real GPU.
//! ```
//! # use std::sync::Arc;
//! use deimos::prelude::*;
//! use deimos::backend::headless::HeadlessDevice;
//!
//! # fn main() -> anyhow::Result<()> {
//! let device = Arc::new(HeadlessDevice::new());
//! // Textures of all models end up in one bindless descriptor array.
//! let set = device.create_bindless_set(MAX_BINDLESS_COUNT);
//! let bindless = Arc::new(BindlessTable::new(device.clone(), set, MAX_BINDLESS_COUNT));
//!
//! let settings = LoaderBuilder::new()
//!     .workers(4)
//!     .staging_size(8 * 1024 * 1024) // 8 MiB staging memory per worker
//!     .build();
//! let mut loader = Loader::new(device, bindless, settings)?;
//! loader.start()?;
//! // let model = loader.load("assets/sponza.gltf")?;
//! // Draw with `model.descriptor_set()` right away, then
//! // model.sync()?;
//! loader.stop();
//! # Ok(())
//! # }
//! ```
//! For further information, check out the following modules
//! - [`loader`] for the streaming pipeline and the layout of uploaded models.
//! - [`scene`] for the scene description and the glTF importer.
//! - [`device`] for the interface a rendering backend implements.
//! - [`backend`] for the provided backends.
//! - [`sync`] for the queues and signals the pipeline is built from.
//! - [`allocator`] for the staging allocator.

#[macro_use]
extern crate derivative;
#[macro_use]
extern crate log;

pub mod prelude;
pub use crate::prelude::*;

pub mod allocator;
pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod loader;
pub mod scene;
pub mod sync;
pub mod util;
