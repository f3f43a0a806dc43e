pub use ash::vk;

pub use crate::error::{AssetError, Error};

pub use crate::config::{LoaderBuilder, LoaderSettings};

pub use crate::device::bindless::{BindlessTable, MAX_BINDLESS_COUNT};
pub use crate::device::{BufferDesc, CommandLevel, CommandRecorder, Device, ImageDesc, QueueType, StagingMemory};

pub use crate::allocator::staging::{StagingAllocation, StagingAllocator, StagingRegion};

pub use crate::loader::model::{Model, ModelBuffers};
pub use crate::loader::texture::{ColorSpace, Texture};
pub use crate::loader::Loader;

pub use crate::scene::gltf::GltfImporter;
pub use crate::scene::layout::Counts;
pub use crate::scene::{
    AlphaMode, ImportOptions, Indices, Light, LightKind, Material, Mesh, Node, Primitive, Scene, SceneImporter,
    TextureChannel, TextureSource,
};

pub use crate::sync::latch::Latch;
