//! Upload workers.
//!
//! Each worker owns a transfer command pool and a staging buffer, so recording never contends with other
//! workers. A worker pops tasks from its own ring, records every task into its own secondary command buffer and
//! collects the buffers into batches for the coordinator. Asset failures are reported through the asset's
//! status and never stop the worker.

use std::mem::size_of;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;

use crate::allocator::staging::{StagingAllocator, StagingRegion};
use crate::device::{mip_levels, CommandLevel, CommandRecorder, Device, ImageDesc, QueueType};
use crate::loader::gpu::{DrawIndexedIndirect, GpuLight, GpuMaterial, LightInstance, MeshInstance, Vertex};
use crate::loader::pipeline::Pipeline;
use crate::loader::task::{Batch, Completion, Entry, ModelUpload, Task};
use crate::loader::texture::Texture;
use crate::scene::geometry::{build_vertices, index_bytes, transform_direction, transform_position};
use crate::scene::layout::IndexWidth;
use crate::scene::{Material, TextureSource};
use crate::sync::queue::QueueReader;
use crate::sync::ring_buffer::QueueFull;
use crate::{AssetError, Error};

/// Alignment of every staging region. Satisfies the offset rules of buffer to image copies for four byte
/// texel formats.
const STAGING_ALIGNMENT: u64 = 16;

fn upload_error(error: impl Into<anyhow::Error>) -> AssetError {
    AssetError::Upload(format!("{:#}", error.into()))
}

/// Keeps [`Pipeline::live_workers`] accurate even if a worker panics.
struct Live<D: Device>(Arc<Pipeline<D>>);

impl<D: Device> Drop for Live<D> {
    fn drop(&mut self) {
        self.0.live_workers.fetch_sub(1, Ordering::AcqRel);
        self.0.wake.notify_one();
    }
}

pub(crate) struct Worker<D: Device> {
    index: usize,
    pipeline: Arc<Pipeline<D>>,
    tasks: QueueReader<Task<D>>,
    pool: D::CommandPool,
    staging: StagingAllocator<D::StagingBuffer>,
    recorder: Option<D::Recorder>,
    entries: Vec<Entry<D>>,
}

impl<D: Device> Worker<D> {
    /// Create the worker's command pool and staging buffer. Runs on the thread starting the loader, so
    /// failures are reported from [`Loader::start()`](crate::Loader::start).
    pub fn new(index: usize, pipeline: Arc<Pipeline<D>>, tasks: QueueReader<Task<D>>) -> Result<Self> {
        let shared = &pipeline.shared;
        let pool = shared.device.create_command_pool(QueueType::Transfer)?;
        let staging = shared
            .device
            .create_staging_buffer(&format!("deimos staging {index}"), shared.settings.staging_size)?;
        Ok(Self {
            index,
            pipeline,
            tasks,
            pool,
            staging: StagingAllocator::new(staging),
            recorder: None,
            entries: Vec::new(),
        })
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let pipeline = self.pipeline.clone();
        pipeline.live_workers.fetch_add(1, Ordering::AcqRel);
        std::thread::Builder::new()
            .name(format!("deimos-worker-{}", self.index))
            .spawn(move || self.run())
            .map_err(|err| {
                pipeline.live_workers.fetch_sub(1, Ordering::AcqRel);
                err.into()
            })
    }

    fn run(mut self) {
        let _live = Live(self.pipeline.clone());
        debug!("Worker {} started", self.index);
        loop {
            self.pipeline.tasks_available.wait_until(|| !self.tasks.is_empty());
            self.free_retired();
            while let Some(task) = self.tasks.pop() {
                if let Task::Stop = task {
                    self.exit();
                    return;
                }
                self.process(task);
                if self.entries.len() >= self.pipeline.shared.batch_size() {
                    self.flush();
                }
            }
            self.flush();
            // The ring drained, so the coordinator may be able to dispatch its backlog.
            self.pipeline.wake.notify_one();
        }
    }

    fn exit(&mut self) {
        self.flush();
        let link = &self.pipeline.links[self.index];
        link.drained.wait_until(|| link.in_flight.load(Ordering::Acquire) == 0);
        self.free_retired();
        debug!("Worker {} stopped", self.index);
    }

    fn free_retired(&mut self) {
        let retired = std::mem::take(&mut *self.pipeline.links[self.index].retired());
        if !retired.is_empty() {
            self.pipeline.shared.device.free_commands(&mut self.pool, retired);
        }
    }

    /// Hand all finished entries to the coordinator. Blocks while this worker is at its in flight limit.
    fn flush(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let pipeline = &self.pipeline;
        let link = &pipeline.links[self.index];
        let limit = pipeline.shared.settings.max_batches_in_flight;
        link.drained.wait_until(|| link.in_flight.load(Ordering::Acquire) < limit);
        link.in_flight.fetch_add(1, Ordering::AcqRel);

        let batch = Batch {
            worker: self.index,
            entries: std::mem::take(&mut self.entries),
        };
        debug!("Worker {} submitting a batch of {} command buffers", self.index, batch.entries.len());
        if let Err(QueueFull(batch)) = pipeline.completed.push(batch) {
            error!("Completed queue is full, dropping a batch of worker {}", self.index);
            for entry in &batch.entries {
                if let Some(done) = &entry.done {
                    done.task.fail(AssetError::Upload(String::from("completed queue is full")));
                }
            }
            link.batches_done(1, batch.entries.into_iter().map(|entry| entry.commands));
        }
        pipeline.wake.notify_one();
    }

    fn process(&mut self, task: Task<D>) {
        trace!("Worker {} recording {task:?}", self.index);
        let recorded = self
            .record(&task)
            .and_then(|image| Ok((self.finish_recording().map_err(upload_error)?, image)));
        match recorded {
            Ok((commands, image)) => self.entries.push(Entry {
                commands,
                done: Some(Completion {
                    task,
                    image,
                    failed: false,
                }),
            }),
            Err(error) => {
                task.fail(error);
                // Commands recorded before the failure may still read staging memory, so they are executed
                // like any other.
                match self.finish_recording() {
                    Ok(commands) => self.entries.push(Entry {
                        commands,
                        done: Some(Completion {
                            task,
                            image: None,
                            failed: true,
                        }),
                    }),
                    Err(err) => error!("Worker {} lost the commands of {task:?}: {err:#}", self.index),
                }
            }
        }
    }

    /// Record the commands of one task. Returns the image of texture tasks.
    fn record(&mut self, task: &Task<D>) -> Result<Option<D::Image>, AssetError> {
        match task {
            Task::Mesh {
                upload,
                mesh,
            } => self.upload_mesh(upload, *mesh).map(|_| None).map_err(upload_error),
            Task::ModelTexture {
                upload,
                texture,
            } => match &upload.model.textures()[*texture] {
                Some(target) => self.upload_image(target, &upload.scene.textures[*texture]).map(Some),
                None => Ok(None),
            },
            Task::Material {
                upload,
                material,
            } => self.upload_material(upload, *material).map(|_| None).map_err(upload_error),
            Task::Instance {
                upload,
                mesh,
            } => self.upload_instances(upload, *mesh).map(|_| None).map_err(upload_error),
            Task::Texture {
                texture,
                source,
            } => self.upload_image(texture, source).map(Some),
            Task::Light {
                upload,
                light,
            } => self.upload_light(upload, *light).map(|_| None).map_err(upload_error),
            Task::LightInstance {
                upload,
                instance,
            } => self.upload_light_instance(upload, *instance).map(|_| None).map_err(upload_error),
            Task::Stop => Ok(None),
        }
    }

    /// The command buffer being recorded, together with the staging buffer commands copy from.
    fn recording(&mut self) -> Result<(&mut D::Recorder, &D::StagingBuffer)> {
        let recorder = match self.recorder.take() {
            Some(recorder) => recorder,
            None => self.pipeline.shared.device.begin_commands(&mut self.pool, CommandLevel::Secondary)?,
        };
        Ok((self.recorder.insert(recorder), self.staging.memory()))
    }

    fn finish_recording(&mut self) -> Result<D::CommandBuffer> {
        let recorder = match self.recorder.take() {
            Some(recorder) => recorder,
            None => self.pipeline.shared.device.begin_commands(&mut self.pool, CommandLevel::Secondary)?,
        };
        recorder.finish()
    }

    /// Copy data into the staging buffer.
    fn stage(&mut self, data: &[u8]) -> Result<StagingRegion> {
        let allocation = self.staging.allocate(data.len() as u64, STAGING_ALIGNMENT)?;
        if allocation.wrapped {
            self.wait_for_staging()?;
        }
        self.staging.write(&allocation.region, data);
        Ok(allocation.region)
    }

    /// Called when the staging allocator wrapped. Everything recorded so far reads from regions that are about
    /// to be overwritten, so it is submitted and waited for first.
    fn wait_for_staging(&mut self) -> Result<()> {
        trace!("Worker {} staging buffer wrapped", self.index);
        if let Some(recorder) = self.recorder.take() {
            self.entries.push(Entry {
                commands: recorder.finish()?,
                done: None,
            });
        }
        self.flush();
        let link = &self.pipeline.links[self.index];
        link.drained.wait_until(|| link.in_flight.load(Ordering::Acquire) == 0);
        self.free_retired();
        Ok(())
    }

    /// Upload data to a buffer range, in chunks if it is larger than the staging buffer.
    fn upload_buffer(&mut self, dst: &D::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let chunk = (self.staging.capacity() as usize).max(1);
        for (i, part) in data.chunks(chunk).enumerate() {
            let region = self.stage(part)?;
            let dst_offset = offset + (i * chunk) as u64;
            let (recorder, staging) = self.recording()?;
            recorder.copy_buffer(staging, region.offset, dst, dst_offset, region.size);
            recorder.release_buffer(dst, dst_offset, region.size);
        }
        Ok(())
    }

    fn upload_mesh(&mut self, upload: &ModelUpload<D>, mesh: usize) -> Result<()> {
        let buffers = upload.model.buffers();
        let primitives = upload.scene.meshes[mesh].primitives.iter();
        for (primitive, offsets) in primitives.zip(&upload.offsets.meshes[mesh].primitives) {
            let vertices = build_vertices(primitive);
            let vertex_offset = offsets.vertex_offset as u64 * size_of::<Vertex>() as u64;
            self.upload_buffer(&buffers.vertices, vertex_offset, bytemuck::cast_slice(&vertices))?;

            let indices = index_bytes(primitive, offsets.width);
            let target = match offsets.width {
                IndexWidth::U16 => &buffers.indices16,
                IndexWidth::U32 => &buffers.indices32,
            };
            self.upload_buffer(target, offsets.first_index as u64 * offsets.width.byte_size(), &indices)?;
        }
        Ok(())
    }

    fn upload_material(&mut self, upload: &ModelUpload<D>, index: usize) -> Result<()> {
        let placeholders = &self.pipeline.shared.placeholders;
        let (white, flat_normal) = (placeholders.white_slot, placeholders.normal_slot);
        let default = Material::default();
        let material = upload.scene.materials.get(index).unwrap_or(&default);

        let textures = upload.model.textures();
        let slot_of = |texture: Option<usize>, fallback: u32| {
            texture
                .and_then(|texture| textures.get(texture)?.as_ref())
                .map_or(fallback, |texture| texture.slot())
        };
        let record = GpuMaterial::new(material, |t| slot_of(t, white), |t| slot_of(t, flat_normal));
        let offset = index as u64 * size_of::<GpuMaterial>() as u64;
        self.upload_buffer(&upload.model.buffers().materials, offset, bytemuck::bytes_of(&record))
    }

    /// Write the draw commands and instance records of every instance of a mesh. The slots of one mesh are
    /// contiguous per index width, so each width takes a single copy per buffer.
    fn upload_instances(&mut self, upload: &ModelUpload<D>, mesh: usize) -> Result<()> {
        let offsets = &upload.offsets.meshes[mesh];
        let instances = &upload.layout.mesh_instances[mesh];
        let buffers = upload.model.buffers();

        for width in [IndexWidth::U16, IndexWidth::U32] {
            let range = offsets.draws(width);
            if range.is_empty() {
                continue;
            }
            let mut draws = vec![DrawIndexedIndirect::default(); range.len()];
            let mut records = vec![MeshInstance::default(); range.len()];
            for (rank, &instance) in instances.iter().enumerate() {
                let node = &upload.layout.mesh_nodes[instance];
                for (index, primitive) in offsets.primitives.iter().enumerate() {
                    if primitive.width != width {
                        continue;
                    }
                    let slot = offsets.draw_slot(rank as u32, primitive);
                    let at = (slot - range.start) as usize;
                    draws[at] = DrawIndexedIndirect {
                        index_count: primitive.index_count,
                        instance_count: 1,
                        first_index: primitive.first_index,
                        vertex_offset: primitive.vertex_offset as i32,
                        first_instance: slot,
                    };
                    records[at] = MeshInstance {
                        transform: node.transform.to_cols_array_2d(),
                        material: primitive.material,
                        mesh: mesh as u32,
                        primitive: index as u32,
                        _pad: 0,
                    };
                }
            }

            let (draw_buffer, instance_buffer) = match width {
                IndexWidth::U16 => (&buffers.draws16, &buffers.instances16),
                IndexWidth::U32 => (&buffers.draws32, &buffers.instances32),
            };
            let first = range.start as u64;
            self.upload_buffer(
                instance_buffer,
                first * size_of::<MeshInstance>() as u64,
                bytemuck::cast_slice(&records),
            )?;
            self.upload_buffer(
                draw_buffer,
                first * size_of::<DrawIndexedIndirect>() as u64,
                bytemuck::cast_slice(&draws),
            )?;
        }
        Ok(())
    }

    fn upload_light(&mut self, upload: &ModelUpload<D>, index: usize) -> Result<()> {
        let record = GpuLight::from(&upload.scene.lights[index]);
        let offset = index as u64 * size_of::<GpuLight>() as u64;
        self.upload_buffer(&upload.model.buffers().lights, offset, bytemuck::bytes_of(&record))
    }

    fn upload_light_instance(&mut self, upload: &ModelUpload<D>, index: usize) -> Result<()> {
        let node = &upload.layout.light_nodes[index];
        let record = LightInstance {
            position: transform_position(&node.transform),
            direction: transform_direction(&node.transform),
            light: node.light as u32,
            _pad: [0; 3],
        };
        let offset = index as u64 * size_of::<LightInstance>() as u64;
        self.upload_buffer(&upload.model.buffers().light_instances, offset, bytemuck::bytes_of(&record))
    }

    /// Decode a texture and record the upload of its first mip level. The image stays owned by the transfer
    /// queue until the coordinator finalizes it.
    fn upload_image(&mut self, texture: &Texture<D>, source: &TextureSource) -> Result<D::Image, AssetError> {
        let decoded = source.decode().map_err(|err| AssetError::Decode(format!("{err:#}")))?;
        let size = decoded.pixels.len() as u64;
        let capacity = self.staging.capacity();
        if size > capacity {
            return Err(upload_error(Error::StagingOverflow {
                requested: size,
                capacity,
            }));
        }

        let shared = self.pipeline.shared.clone();
        let mip_levels = if shared.settings.generate_mipmaps {
            mip_levels(decoded.width, decoded.height)
        } else {
            1
        };
        let image = shared
            .device
            .create_image(&ImageDesc {
                name: texture.name(),
                width: decoded.width,
                height: decoded.height,
                format: texture.format(),
                mip_levels,
            })
            .map_err(upload_error)?;

        let region = self.stage(&decoded.pixels).map_err(upload_error)?;
        let (recorder, staging) = self.recording().map_err(upload_error)?;
        recorder.prepare_image_upload(&image);
        recorder.copy_buffer_to_image(staging, region.offset, &image, 0);
        recorder.release_image(&image);
        Ok(image)
    }
}
