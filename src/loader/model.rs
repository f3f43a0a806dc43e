//! Caller-visible handle of a streamed model.
//!
//! A [`Model`] is handed out by the parse stage with all of its buffers already allocated at their final size and
//! zero filled. Zeroed draw commands draw nothing, so a model can be rendered with
//! `vkCmdDrawIndexedIndirect` over the full capacity of its draw buffers from the moment it is returned. Draws
//! light up as their instance uploads complete.
//!
//! # Descriptor set
//! [`Model::descriptor_set()`] binds the buffers as storage buffers in this order:
//!
//! | binding | buffer | record |
//! |---|---|---|
//! | 0 | vertices | [`Vertex`](crate::loader::gpu::Vertex) |
//! | 1 | 16 bit indices | `u16` |
//! | 2 | 32 bit indices | `u32` |
//! | 3 | 16 bit draws | [`DrawIndexedIndirect`](crate::loader::gpu::DrawIndexedIndirect) |
//! | 4 | 32 bit draws | [`DrawIndexedIndirect`](crate::loader::gpu::DrawIndexedIndirect) |
//! | 5 | 16 bit instances | [`MeshInstance`](crate::loader::gpu::MeshInstance) |
//! | 6 | 32 bit instances | [`MeshInstance`](crate::loader::gpu::MeshInstance) |
//! | 7 | materials | [`GpuMaterial`](crate::loader::gpu::GpuMaterial) |
//! | 8 | lights | [`GpuLight`](crate::loader::gpu::GpuLight) |
//! | 9 | light instances | [`LightInstance`](crate::loader::gpu::LightInstance) |

use std::future::Future;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use ash::vk;

use crate::device::{BufferDesc, Device};
use crate::loader::gpu::{DrawIndexedIndirect, GpuLight, GpuMaterial, LightInstance, MeshInstance, Vertex};
use crate::loader::texture::Texture;
use crate::scene::layout::Counts;
use crate::sync::latch::Latch;
use crate::{AssetError, Error};

/// The device buffers of a model. All of them hold one more element than their count, so none is empty.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct ModelBuffers<D: Device> {
    #[derivative(Debug = "ignore")]
    pub vertices: D::Buffer,
    #[derivative(Debug = "ignore")]
    pub indices16: D::Buffer,
    #[derivative(Debug = "ignore")]
    pub indices32: D::Buffer,
    #[derivative(Debug = "ignore")]
    pub draws16: D::Buffer,
    #[derivative(Debug = "ignore")]
    pub draws32: D::Buffer,
    #[derivative(Debug = "ignore")]
    pub instances16: D::Buffer,
    #[derivative(Debug = "ignore")]
    pub instances32: D::Buffer,
    #[derivative(Debug = "ignore")]
    pub materials: D::Buffer,
    #[derivative(Debug = "ignore")]
    pub lights: D::Buffer,
    #[derivative(Debug = "ignore")]
    pub light_instances: D::Buffer,
}

impl<D: Device> ModelBuffers<D> {
    /// Allocate every buffer of a model at the size given by `counts`. All buffers are created and cleared in
    /// one call to the device.
    pub(crate) fn new(device: &D, name: &str, counts: &Counts) -> Result<Self> {
        use vk::BufferUsageFlags as Usage;
        let layout = [
            ("vertices", counts.vertices, size_of::<Vertex>(), Usage::VERTEX_BUFFER),
            ("indices16", counts.indices16, size_of::<u16>(), Usage::INDEX_BUFFER),
            ("indices32", counts.indices32, size_of::<u32>(), Usage::INDEX_BUFFER),
            ("draws16", counts.draws16, size_of::<DrawIndexedIndirect>(), Usage::INDIRECT_BUFFER),
            ("draws32", counts.draws32, size_of::<DrawIndexedIndirect>(), Usage::INDIRECT_BUFFER),
            ("instances16", counts.draws16, size_of::<MeshInstance>(), Usage::empty()),
            ("instances32", counts.draws32, size_of::<MeshInstance>(), Usage::empty()),
            ("materials", counts.materials, size_of::<GpuMaterial>(), Usage::empty()),
            ("lights", counts.lights, size_of::<GpuLight>(), Usage::empty()),
            ("light_instances", counts.light_instances, size_of::<LightInstance>(), Usage::empty()),
        ];
        let labels = layout.map(|(what, ..)| format!("{name}/{what}"));
        // One sentinel element per buffer, so no buffer is ever empty.
        let descs = layout
            .iter()
            .zip(&labels)
            .map(|((_, count, stride, usage), label)| BufferDesc {
                name: label,
                size: (count + 1) * *stride as u64,
                usage: *usage | Usage::STORAGE_BUFFER,
            })
            .collect::<Vec<_>>();
        let buffers: [D::Buffer; 10] = match device.create_buffers(&descs)?.try_into() {
            Ok(buffers) => buffers,
            Err(_) => bail!(Error::Uncategorized("device returned the wrong number of buffers")),
        };
        let [vertices, indices16, indices32, draws16, draws32, instances16, instances32, materials, lights, light_instances] =
            buffers;
        Ok(Self {
            vertices,
            indices16,
            indices32,
            draws16,
            draws32,
            instances16,
            instances32,
            materials,
            lights,
            light_instances,
        })
    }

    /// All buffers in descriptor binding order. See the [module documentation](self).
    pub fn bindings(&self) -> [&D::Buffer; 10] {
        [
            &self.vertices,
            &self.indices16,
            &self.indices32,
            &self.draws16,
            &self.draws32,
            &self.instances16,
            &self.instances32,
            &self.materials,
            &self.lights,
            &self.light_instances,
        ]
    }
}

/// A model streamed by the [`Loader`](crate::Loader). See the [module documentation](self).
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Model<D: Device> {
    name: String,
    counts: Counts,
    buffers: ModelBuffers<D>,
    #[derivative(Debug = "ignore")]
    descriptor_set: D::DescriptorSet,
    textures: Vec<Option<Arc<Texture<D>>>>,
    draws16: AtomicU64,
    draws32: AtomicU64,
    /// Upload parts that still have to complete.
    remaining: AtomicUsize,
    status: Latch,
}

impl<D: Device> Model<D> {
    pub(crate) fn new(
        name: String,
        counts: Counts,
        buffers: ModelBuffers<D>,
        descriptor_set: D::DescriptorSet,
        textures: Vec<Option<Arc<Texture<D>>>>,
    ) -> Self {
        let parts = counts.parts();
        let model = Self {
            name,
            counts,
            buffers,
            descriptor_set,
            textures,
            draws16: AtomicU64::new(0),
            draws32: AtomicU64::new(0),
            remaining: AtomicUsize::new(parts),
            status: Latch::new(),
        };
        if parts == 0 {
            model.status.signal(Ok(()));
        }
        model
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element counts the buffers were sized for.
    pub fn counts(&self) -> &Counts {
        &self.counts
    }

    pub fn buffers(&self) -> &ModelBuffers<D> {
        &self.buffers
    }

    /// Descriptor set binding all buffers of this model.
    pub fn descriptor_set(&self) -> &D::DescriptorSet {
        &self.descriptor_set
    }

    /// Textures of this model, indexed like the textures of the scene it was loaded from. Textures no material
    /// references were not loaded and are `None`.
    pub fn textures(&self) -> &[Option<Arc<Texture<D>>>] {
        &self.textures
    }

    /// Number of valid draw commands in the 16 bit draw buffer so far.
    pub fn draw_count16(&self) -> u64 {
        self.draws16.load(Ordering::Acquire)
    }

    /// Number of valid draw commands in the 32 bit draw buffer so far.
    pub fn draw_count32(&self) -> u64 {
        self.draws32.load(Ordering::Acquire)
    }

    /// Block until every mesh, material and light of this model is uploaded, or the upload failed.
    /// Textures complete independently, see [`Texture::sync()`].
    pub fn sync(&self) -> Result<(), AssetError> {
        self.status.wait()
    }

    /// Same as [`Model::sync()`], giving up after `timeout`. Returns `None` on timeout.
    pub fn sync_timeout(&self, timeout: Duration) -> Option<Result<(), AssetError>> {
        self.status.wait_timeout(timeout)
    }

    pub fn wait_async(&self) -> impl Future<Output = Result<(), AssetError>> + '_ {
        self.status.wait_async()
    }

    /// True once the model is fully drawable.
    pub fn is_ready(&self) -> bool {
        matches!(self.status.outcome(), Some(Ok(())))
    }

    pub fn outcome(&self) -> Option<Result<(), AssetError>> {
        self.status.outcome()
    }

    /// Account draws whose commands were written.
    pub(crate) fn commit_draws(&self, draws16: u64, draws32: u64) {
        self.draws16.fetch_add(draws16, Ordering::AcqRel);
        self.draws32.fetch_add(draws32, Ordering::AcqRel);
    }

    /// Mark one upload part as complete. Signals the model once the last part completed. Calls after that do
    /// nothing.
    pub(crate) fn part_done(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| remaining.checked_sub(1));
        if previous == Ok(1) && self.status.signal(Ok(())) {
            debug!(
                "Model {} ready with {} + {} draws",
                self.name,
                self.draw_count16(),
                self.draw_count32()
            );
        }
    }

    pub(crate) fn fail(&self, error: AssetError) {
        if self.status.signal(Err(error.clone())) {
            warn!("Model {} failed: {error}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessDevice;

    fn model(counts: Counts) -> Model<HeadlessDevice> {
        let device = HeadlessDevice::new();
        let buffers = ModelBuffers::new(&device, "test", &counts).unwrap();
        let set = device.create_descriptor_set(&buffers.bindings()).unwrap();
        Model::new("test".into(), counts, buffers, set, Vec::new())
    }

    #[test]
    fn signals_once_after_last_part() {
        let model = model(Counts {
            meshes: 2,
            materials: 1,
            ..Default::default()
        });
        model.part_done();
        model.part_done();
        assert!(!model.is_ready());
        model.part_done();
        assert!(model.is_ready());
        // Extra completions neither underflow nor change the outcome.
        model.part_done();
        model.fail(AssetError::Stopped);
        assert_eq!(model.outcome(), Some(Ok(())));
    }

    #[test]
    fn empty_model_is_ready_immediately() {
        let model = model(Counts::default());
        assert_eq!(model.sync(), Ok(()));
    }

    #[test]
    fn buffers_include_a_sentinel_element() {
        let model = model(Counts {
            vertices: 3,
            ..Default::default()
        });
        assert_eq!(model.buffers().vertices.size(), 4 * size_of::<Vertex>() as u64);
        assert_eq!(model.buffers().draws32.size(), size_of::<DrawIndexedIndirect>() as u64);
    }
}
