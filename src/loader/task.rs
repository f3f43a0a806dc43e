//! Units of work exchanged between the parse stage, the coordinator and the workers.

use std::fmt;
use std::sync::Arc;

use crate::device::Device;
use crate::loader::model::Model;
use crate::loader::texture::Texture;
use crate::scene::layout::{ModelOffsets, SceneLayout};
use crate::scene::{Scene, TextureSource};
use crate::AssetError;

/// A parsed model waiting for the coordinator.
pub(crate) struct PendingModel<D: Device> {
    pub scene: Scene,
    pub layout: SceneLayout,
    pub model: Arc<Model<D>>,
}

/// A standalone texture waiting for the coordinator.
pub(crate) struct PendingTexture<D: Device> {
    pub texture: Arc<Texture<D>>,
    pub source: TextureSource,
}

/// A model accepted by the coordinator, shared by all of its tasks.
pub(crate) struct ModelUpload<D: Device> {
    pub scene: Scene,
    pub layout: SceneLayout,
    pub offsets: ModelOffsets,
    pub model: Arc<Model<D>>,
}

pub(crate) enum Task<D: Device> {
    /// Upload vertices and indices of one mesh.
    Mesh { upload: Arc<ModelUpload<D>>, mesh: usize },
    /// Upload one texture referenced by the materials of a model.
    ModelTexture { upload: Arc<ModelUpload<D>>, texture: usize },
    /// Upload one material. The index may be that of the implicit default material.
    Material { upload: Arc<ModelUpload<D>>, material: usize },
    /// Write the draw commands and instance records of one mesh. Dispatched once its mesh upload completed.
    Instance { upload: Arc<ModelUpload<D>>, mesh: usize },
    /// Upload a standalone texture.
    Texture { texture: Arc<Texture<D>>, source: TextureSource },
    Light { upload: Arc<ModelUpload<D>>, light: usize },
    LightInstance { upload: Arc<ModelUpload<D>>, instance: usize },
    /// Terminates the worker that receives it.
    Stop,
}

impl<D: Device> Task<D> {
    /// Fail the asset this task belongs to.
    pub fn fail(&self, error: AssetError) {
        match self {
            Task::Mesh { upload, .. }
            | Task::Material { upload, .. }
            | Task::Instance { upload, .. }
            | Task::Light { upload, .. }
            | Task::LightInstance { upload, .. } => upload.model.fail(error),
            Task::ModelTexture { upload, texture } => {
                if let Some(texture) = &upload.model.textures()[*texture] {
                    texture.fail(error);
                }
            }
            Task::Texture { texture, .. } => texture.fail(error),
            Task::Stop => {}
        }
    }

    /// The texture uploaded by a texture task.
    pub fn texture(&self) -> Option<Arc<Texture<D>>> {
        match self {
            Task::ModelTexture { upload, texture } => upload.model.textures()[*texture].clone(),
            Task::Texture { texture, .. } => Some(texture.clone()),
            _ => None,
        }
    }
}

impl<D: Device> fmt::Debug for Task<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Mesh { upload, mesh } => write!(f, "mesh {mesh} of {}", upload.model.name()),
            Task::ModelTexture { upload, texture } => write!(f, "texture {texture} of {}", upload.model.name()),
            Task::Material { upload, material } => write!(f, "material {material} of {}", upload.model.name()),
            Task::Instance { upload, mesh } => write!(f, "instances of mesh {mesh} of {}", upload.model.name()),
            Task::Texture { texture, .. } => write!(f, "texture {}", texture.name()),
            Task::Light { upload, light } => write!(f, "light {light} of {}", upload.model.name()),
            Task::LightInstance { upload, instance } => {
                write!(f, "light instance {instance} of {}", upload.model.name())
            }
            Task::Stop => write!(f, "stop"),
        }
    }
}

/// A processed task, handed back to the coordinator after its commands executed.
pub(crate) struct Completion<D: Device> {
    pub task: Task<D>,
    /// Image uploaded by a texture task, still owned by the transfer queue.
    pub image: Option<D::Image>,
    /// The task failed while recording and its asset was already signaled.
    pub failed: bool,
}

/// One recorded secondary command buffer. A task whose staging allocation wrapped is split over several
/// entries, only the last of which carries its completion.
pub(crate) struct Entry<D: Device> {
    pub commands: D::CommandBuffer,
    pub done: Option<Completion<D>>,
}

/// Entries pushed to the coordinator by one worker at once.
pub(crate) struct Batch<D: Device> {
    pub worker: usize,
    pub entries: Vec<Entry<D>>,
}
