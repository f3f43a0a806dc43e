//! The asynchronous streaming loader.
//!
//! A [`Loader`] runs one coordinator thread and a configurable number of worker threads next to the caller's
//! own threads. Loading an asset happens in three stages:
//!
//! 1. **Parse**, on the calling thread. [`Loader::load()`] imports and validates the scene, allocates every buffer
//!    of the model at its final size, reserves bindless slots for its textures and points them at placeholders.
//!    The returned [`Model`] can be bound and drawn right away.
//! 2. **Record**, on the workers. Every mesh, texture, material and light becomes a task. Workers copy the data
//!    into their private staging buffer and record the transfer into a secondary command buffer.
//! 3. **Execute**, on the coordinator. Recorded command buffers are executed in batches on the transfer queue.
//!    Textures are then handed to the graphics queue and bound, and the model is signaled once all of its
//!    parts landed.
//!
//! No queue in the pipeline grows. If the pending queues are full, `load()` fails with [`Error::QueueFull`] and
//! the caller decides when to retry.
//!
//! # Example
//! ```
//! # use std::sync::Arc;
//! # use deimos::prelude::*;
//! # use deimos::backend::headless::HeadlessDevice;
//! # fn main() -> anyhow::Result<()> {
//! let device = Arc::new(HeadlessDevice::new());
//! let set = device.create_bindless_set(64);
//! let bindless = Arc::new(BindlessTable::new(device.clone(), set, 64));
//! let mut loader = Loader::new(device, bindless, LoaderBuilder::new().workers(2).build())?;
//! loader.start()?;
//!
//! let scene = Scene {
//!     meshes: vec![Mesh {
//!         name: String::from("triangle"),
//!         primitives: vec![Primitive {
//!             positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
//!             ..Default::default()
//!         }],
//!     }],
//!     nodes: vec![Node::with_mesh(0, glam::Mat4::IDENTITY)],
//!     ..Default::default()
//! };
//! let model = loader.load_scene("triangle", scene)?;
//! model.sync()?;
//! assert_eq!(model.draw_count16(), 1);
//! loader.stop();
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{bail, Result};
use ash::vk;

use crate::config::LoaderSettings;
use crate::device::bindless::BindlessTable;
use crate::device::{CommandLevel, CommandRecorder, Device, ImageDesc, QueueType, StagingMemory};
use crate::loader::coordinator::Coordinator;
use crate::loader::model::{Model, ModelBuffers};
use crate::loader::pipeline::Pipeline;
use crate::loader::task::{PendingModel, PendingTexture};
use crate::loader::texture::{ColorSpace, Texture};
use crate::loader::worker::Worker;
use crate::scene::gltf::GltfImporter;
use crate::scene::layout::{Counts, SceneLayout};
use crate::scene::{ImportOptions, Scene, SceneImporter, TextureSource};
use crate::sync::queue::{ManyWritersSingleReaderQueue, SingleWriterManyReadersQueue};
use crate::sync::queue::QueueReader;
use crate::{AssetError, Error};

mod coordinator;
pub mod gpu;
pub mod model;
mod pipeline;
mod task;
pub mod texture;
mod worker;

const WHITE: [u8; 4] = [255, 255, 255, 255];
/// Tangent space normal pointing straight out of the surface.
const FLAT_NORMAL: [u8; 4] = [128, 128, 255, 255];

/// Images bound to texture slots whose real image is not there yet, or never will be.
pub(crate) struct Placeholders<D: Device> {
    pub white: D::Image,
    pub flat_normal: D::Image,
    pub white_slot: u32,
    pub normal_slot: u32,
}

impl<D: Device> Placeholders<D> {
    fn new(device: &D, bindless: &BindlessTable<D>) -> Result<Self> {
        let mut pool = device.create_command_pool(QueueType::Graphics)?;
        let mut staging = device.create_staging_buffer("deimos placeholder staging", 8)?;
        staging.write(0, &WHITE);
        staging.write(4, &FLAT_NORMAL);

        let image = |name: &str| {
            device.create_image(&ImageDesc {
                name,
                width: 1,
                height: 1,
                format: vk::Format::R8G8B8A8_UNORM,
                mip_levels: 1,
            })
        };
        let white = image("deimos white placeholder")?;
        let flat_normal = image("deimos flat normal placeholder")?;

        let mut recorder = device.begin_commands(&mut pool, CommandLevel::Primary)?;
        for (offset, image) in [(0, &white), (4, &flat_normal)] {
            recorder.prepare_image_upload(image);
            recorder.copy_buffer_to_image(&staging, offset, image, 0);
            recorder.finalize_image(image, false);
        }
        device.submit(&mut pool, recorder.finish()?)?;

        let slots = bindless.reserve(2)?;
        let (white_slot, normal_slot) = (slots[0], slots[1]);
        if let Err(err) = bindless.write(&[(white_slot, &white), (normal_slot, &flat_normal)]) {
            bindless.release(white_slot);
            bindless.release(normal_slot);
            return Err(err);
        }
        Ok(Self {
            white,
            flat_normal,
            white_slot,
            normal_slot,
        })
    }
}

/// Loader state that outlives a single start and stop cycle.
pub(crate) struct Shared<D: Device> {
    pub device: Arc<D>,
    pub bindless: Arc<BindlessTable<D>>,
    pub settings: LoaderSettings,
    batch_size: AtomicUsize,
    pub pending_models: ManyWritersSingleReaderQueue<PendingModel<D>>,
    pub pending_textures: ManyWritersSingleReaderQueue<PendingTexture<D>>,
    pub placeholders: Placeholders<D>,
}

impl<D: Device> Shared<D> {
    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    /// Fail every asset that was never accepted by the coordinator.
    pub fn fail_pending(&self) {
        for pending in self.pending_models.drain() {
            pending.model.fail(AssetError::Stopped);
        }
        for pending in self.pending_textures.drain() {
            pending.texture.fail(AssetError::Stopped);
        }
    }
}

struct Running<D: Device> {
    pipeline: Arc<Pipeline<D>>,
    coordinator: JoinHandle<()>,
}

/// Streams models and textures to the GPU. See the [module documentation](self).
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Loader<D: Device> {
    #[derivative(Debug = "ignore")]
    shared: Arc<Shared<D>>,
    #[derivative(Debug = "ignore")]
    importers: HashMap<String, Arc<dyn SceneImporter>>,
    #[derivative(Debug = "ignore")]
    running: Option<Running<D>>,
}

impl<D: Device> Loader<D> {
    /// Create a stopped loader. Uploads the placeholder textures and reserves their slots in `bindless`.
    /// # Errors
    /// * Fails if the placeholders cannot be created or `bindless` has fewer than two free slots.
    pub fn new(device: Arc<D>, bindless: Arc<BindlessTable<D>>, settings: LoaderSettings) -> Result<Self> {
        let settings = settings.normalized();
        let placeholders = Placeholders::new(&*device, &bindless)?;
        let shared = Shared {
            batch_size: AtomicUsize::new(settings.command_buffer_batch_size),
            pending_models: ManyWritersSingleReaderQueue::new(settings.pending_model_capacity),
            pending_textures: ManyWritersSingleReaderQueue::new(settings.pending_texture_capacity),
            device,
            bindless,
            settings,
            placeholders,
        };
        let importer: Arc<dyn SceneImporter> = Arc::new(GltfImporter::new());
        let importers = HashMap::from([(String::from("gltf"), importer.clone()), (String::from("glb"), importer)]);
        Ok(Self {
            shared: Arc::new(shared),
            importers,
            running: None,
        })
    }

    /// Register an importer for files with the given extension, replacing any earlier one.
    pub fn with_importer(mut self, extension: &str, importer: impl SceneImporter + 'static) -> Self {
        self.importers.insert(extension.to_ascii_lowercase(), Arc::new(importer));
        self
    }

    /// Spawn the coordinator and worker threads. Command pools and staging buffers are created before any
    /// thread starts, so their errors are returned from here.
    /// # Errors
    /// * Fails with [`Error::AlreadyRunning`] if the loader is running.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            bail!(Error::AlreadyRunning);
        }
        let settings = &self.shared.settings;
        let pipeline = Arc::new(Pipeline::new(self.shared.clone()));
        let (tasks, readers) = SingleWriterManyReadersQueue::new(settings.workers, settings.task_queue_capacity);
        let workers = readers
            .into_iter()
            .enumerate()
            .map(|(index, reader): (usize, QueueReader<_>)| Worker::new(index, pipeline.clone(), reader))
            .collect::<Result<Vec<_>>>()?;

        let mut coordinator = Coordinator::new(pipeline.clone(), tasks)?;
        for worker in workers {
            coordinator.add_worker(worker.spawn()?);
        }
        let coordinator = coordinator.spawn()?;
        info!("Loader started with {} workers", settings.workers);
        self.running = Some(Running {
            pipeline,
            coordinator,
        });
        Ok(())
    }

    /// Stop all loader threads. Blocks until in flight GPU work completed. Assets that did not finish streaming
    /// fail with [`AssetError::Stopped`]. Does nothing if the loader is not running.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.pipeline.stop.store(true, Ordering::Release);
        running.pipeline.wake.notify_one();
        if running.coordinator.join().is_err() {
            error!("Coordinator thread panicked");
        }
        // The coordinator fails pending assets when it exits, unless it panicked first.
        self.shared.fail_pending();
        info!("Loader stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    fn running(&self) -> Result<&Running<D>> {
        match &self.running {
            Some(running) => Ok(running),
            None => bail!(Error::NotRunning),
        }
    }

    /// Load a scene file, picking the importer by file extension. See [`Loader::load_with_options()`].
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Arc<Model<D>>> {
        self.load_with_options(path, &ImportOptions::default())
    }

    /// Import a scene file and stream it. Returns as soon as the scene is parsed.
    ///
    /// How `options` is applied is up to the importer. [`GltfImporter`] ignores [`ImportOptions::scale`], since
    /// glTF files are always in meters.
    /// # Errors
    /// * Fails with [`Error::NotRunning`] if the loader was not started.
    /// * Fails with [`Error::QueueFull`] if too many models wait for the coordinator.
    /// * Fails with [`Error::UnsupportedFormat`] if no importer is registered for the file extension.
    /// * Fails if the importer fails.
    /// * See [`Loader::load_scene()`]
    pub fn load_with_options(&self, path: impl AsRef<Path>, options: &ImportOptions) -> Result<Arc<Model<D>>> {
        let path = path.as_ref();
        self.running()?;
        if self.shared.pending_models.is_full() {
            bail!(Error::QueueFull("model"));
        }
        let extension = path
            .extension()
            .and_then(OsStr::to_str)
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let Some(importer) = self.importers.get(&extension) else {
            bail!(Error::UnsupportedFormat(extension));
        };
        let scene = importer.import(path, options)?;
        self.load_scene(path.display().to_string(), scene)
    }

    /// Stream an already parsed scene. Returns as soon as all buffers of the model exist.
    /// # Errors
    /// * Fails with [`Error::NotRunning`] if the loader was not started.
    /// * Fails with [`Error::QueueFull`] if too many models wait for the coordinator.
    /// * Fails with [`Error::InvalidScene`] if the scene does not validate.
    /// * Fails with [`Error::BindlessExhausted`] if its textures do not fit the bindless table.
    /// * Fails if buffers or the descriptor set cannot be created.
    pub fn load_scene(&self, name: impl Into<String>, scene: Scene) -> Result<Arc<Model<D>>> {
        let running = self.running()?;
        if self.shared.pending_models.is_full() {
            bail!(Error::QueueFull("model"));
        }
        let name = name.into();
        let layout = SceneLayout::new(&scene)?;
        let counts = Counts::of(&scene, &layout);
        let model = Arc::new(self.create_model(name, &scene, &layout, counts)?);

        self.shared
            .pending_models
            .push(PendingModel {
                scene,
                layout,
                model: model.clone(),
            })
            .map_err(|_| Error::QueueFull("model"))?;
        running.pipeline.wake.notify_one();
        debug!("Parsed model {} with {} vertices", model.name(), counts.vertices);
        Ok(model)
    }

    fn create_model(&self, name: String, scene: &Scene, layout: &SceneLayout, counts: Counts) -> Result<Model<D>> {
        let shared = &self.shared;
        let buffers = ModelBuffers::new(&*shared.device, &name, &counts)?;
        let descriptor_set = shared.device.create_descriptor_set(&buffers.bindings())?;

        let mut slots = shared.bindless.reserve(counts.textures as u32)?.into_iter();
        let textures = layout
            .textures
            .iter()
            .enumerate()
            .map(|(index, usage)| {
                let usage = (*usage)?;
                let format = if usage.color {
                    vk::Format::R8G8B8A8_SRGB
                } else {
                    vk::Format::R8G8B8A8_UNORM
                };
                let texture = Texture::new(format!("{name}/texture{index}"), slots.next()?, format, shared.bindless.clone());
                Some(Arc::new(texture))
            })
            .collect::<Vec<_>>();

        let placeholders = &shared.placeholders;
        let writes = textures
            .iter()
            .zip(&layout.textures)
            .filter_map(|(texture, usage)| {
                let placeholder = match usage {
                    Some(usage) if usage.normal && !usage.color => &placeholders.flat_normal,
                    _ => &placeholders.white,
                };
                Some((texture.as_ref()?.slot(), placeholder))
            })
            .collect::<Vec<_>>();
        shared.bindless.write(&writes)?;
        debug_assert_eq!(scene.textures.len(), textures.len());

        Ok(Model::new(name, counts, buffers, descriptor_set, textures))
    }

    /// Stream a standalone texture from an image file. See [`Loader::load_texture_source()`].
    pub fn load_texture(&self, path: impl AsRef<Path>, color_space: ColorSpace) -> Result<Arc<Texture<D>>> {
        let path = path.as_ref();
        self.load_texture_source(path.display().to_string(), TextureSource::File(path.to_owned()), color_space)
    }

    /// Stream a standalone texture. Its slot points at a white placeholder until the upload finished.
    /// Decoding happens on a worker, so a broken image is reported through [`Texture::sync()`].
    /// # Errors
    /// * Fails with [`Error::NotRunning`] if the loader was not started.
    /// * Fails with [`Error::QueueFull`] if too many textures wait for the coordinator.
    /// * Fails with [`Error::BindlessExhausted`] if the bindless table is full.
    pub fn load_texture_source(
        &self,
        name: impl Into<String>,
        source: TextureSource,
        color_space: ColorSpace,
    ) -> Result<Arc<Texture<D>>> {
        let running = self.running()?;
        let shared = &self.shared;
        if shared.pending_textures.is_full() {
            bail!(Error::QueueFull("texture"));
        }
        let slot = shared.bindless.reserve(1)?.pop().ok_or(Error::BindlessExhausted(1))?;
        let texture = Arc::new(Texture::new(name.into(), slot, color_space.format(), shared.bindless.clone()));
        shared.bindless.write(&[(slot, &shared.placeholders.white)])?;
        shared
            .pending_textures
            .push(PendingTexture {
                texture: texture.clone(),
                source,
            })
            .map_err(|_| Error::QueueFull("texture"))?;
        running.pipeline.wake.notify_one();
        Ok(texture)
    }

    /// Change how many command buffers a worker records before handing them to the coordinator. Applies to
    /// batches started after this call. Zero is raised to one.
    pub fn set_command_buffer_batch_size(&self, size: usize) {
        self.shared.batch_size.store(size.max(1), Ordering::Relaxed);
    }

    pub fn command_buffer_batch_size(&self) -> usize {
        self.shared.batch_size()
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.shared.settings
    }

    pub fn device(&self) -> &Arc<D> {
        &self.shared.device
    }

    pub fn bindless(&self) -> &Arc<BindlessTable<D>> {
        &self.shared.bindless
    }

    /// Bindless slot of the white placeholder. Bound by materials without a color or data texture.
    pub fn white_slot(&self) -> u32 {
        self.shared.placeholders.white_slot
    }

    /// Bindless slot of the flat normal placeholder. Bound by materials without a normal map.
    pub fn flat_normal_slot(&self) -> u32 {
        self.shared.placeholders.normal_slot
    }
}

impl<D: Device> Drop for Loader<D> {
    fn drop(&mut self) {
        self.stop();
        let placeholders = &self.shared.placeholders;
        self.shared.bindless.release(placeholders.white_slot);
        self.shared.bindless.release(placeholders.normal_slot);
    }
}
