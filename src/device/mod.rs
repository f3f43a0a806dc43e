//! The device module defines the seam between the streaming pipeline and the graphics API.
//!
//! The loader never talks to a graphics API directly. Everything it needs from the GPU, creating resources,
//! recording transfer commands and submitting them, goes through the [`Device`] trait. Two implementations ship
//! with this crate:
//!
//! - [`VulkanDevice`](crate::backend::vulkan::VulkanDevice) built on `ash` and `gpu-allocator`.
//! - [`HeadlessDevice`](crate::backend::headless::HeadlessDevice), which keeps all resources in host memory and
//! executes recorded commands on submission. It validates what it executes, which makes it useful for tests.
//!
//! Uploads are recorded on the transfer queue and consumed on the graphics queue. Commands recorded through
//! [`CommandRecorder`] therefore come in release/acquire pairs for queue family ownership transfers.

use anyhow::Result;
use ash::vk;

pub mod bindless;

/// The queue a command pool records for. Values match the Vulkan queue flags they represent.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq, Hash)]
pub enum QueueType {
    #[default]
    Graphics = vk::QueueFlags::GRAPHICS.as_raw() as isize,
    Transfer = vk::QueueFlags::TRANSFER.as_raw() as isize,
}

/// Level of a command buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CommandLevel {
    /// Submitted directly to a queue.
    Primary,
    /// Recorded independently, possibly on another thread, and executed from a primary command buffer.
    Secondary,
}

/// Describes a device-local destination buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    /// Size in bytes. Must not be zero.
    pub size: u64,
    /// Usage the buffer is needed for. Transfer destination usage is always added.
    pub usage: vk::BufferUsageFlags,
}

/// Describes a sampled 2D image with a full mip chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub width: u32,
    pub height: u32,
    /// Texel format. The loader only uses four-byte RGBA formats.
    pub format: vk::Format,
    pub mip_levels: u32,
}

/// Number of mip levels in a full chain for an image of the given size.
pub fn mip_levels(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Host-visible memory used as the source of transfers.
pub trait StagingMemory {
    /// Size of the memory in bytes.
    fn size(&self) -> u64;
    /// Write `data` at `offset`. The range must be inside the memory.
    fn write(&mut self, offset: u64, data: &[u8]);
}

/// The graphics device abstraction used by the loader. See the [module documentation](self).
///
/// All methods may be called from any thread. Command pools are only ever used by the thread that created them.
pub trait Device: Send + Sync + Sized + 'static {
    /// A device-local buffer.
    type Buffer: Send + Sync + 'static;
    /// A sampled image with its view.
    type Image: Send + Sync + 'static;
    /// A persistently mapped host-visible buffer.
    type StagingBuffer: StagingMemory + Send + 'static;
    type CommandPool: Send + 'static;
    type Recorder: CommandRecorder<Self> + Send + 'static;
    /// A finished command buffer, ready for submission or execution from a primary command buffer.
    type CommandBuffer: Send + 'static;
    /// Descriptor set binding the buffers of one model.
    type DescriptorSet: Send + Sync + 'static;
    /// The descriptor set holding the bindless texture array.
    type BindlessSet: Send + Sync + 'static;

    /// Create a device-local buffer. Its contents are zero when this returns.
    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer>;

    /// Create several device-local buffers, all zeroed when this returns. Devices that clear buffers on the GPU
    /// should override this to clear all of them in a single submission.
    fn create_buffers(&self, descs: &[BufferDesc]) -> Result<Vec<Self::Buffer>> {
        descs.iter().map(|desc| self.create_buffer(desc)).collect()
    }

    /// Create a mapped staging buffer of `size` bytes.
    fn create_staging_buffer(&self, name: &str, size: u64) -> Result<Self::StagingBuffer>;

    /// Create an image. Its contents are undefined until uploaded.
    fn create_image(&self, desc: &ImageDesc) -> Result<Self::Image>;

    /// Create a command pool for a queue. The pool must only be used from one thread at a time.
    fn create_command_pool(&self, queue: QueueType) -> Result<Self::CommandPool>;

    /// Allocate a command buffer from the pool and begin recording.
    fn begin_commands(&self, pool: &mut Self::CommandPool, level: CommandLevel) -> Result<Self::Recorder>;

    /// Free command buffers that are no longer in use by the GPU.
    fn free_commands(&self, pool: &mut Self::CommandPool, commands: Vec<Self::CommandBuffer>);

    /// Record a primary command buffer from `pool` that executes all `secondaries` in order, submit it to the
    /// pool's queue and block until the GPU has finished executing it.
    fn execute_secondaries(&self, pool: &mut Self::CommandPool, secondaries: &[Self::CommandBuffer]) -> Result<()>;

    /// Submit a primary command buffer allocated from `pool` to the pool's queue, block until the GPU has finished
    /// executing it and free it.
    fn submit(&self, pool: &mut Self::CommandPool, command: Self::CommandBuffer) -> Result<()>;

    /// True if transfer and graphics queues belong to different queue families, so images need an
    /// ownership transfer before the graphics queue may use them.
    fn needs_ownership_transfer(&self) -> bool;

    /// Create a descriptor set that binds the given buffers as storage buffers, at bindings `0..buffers.len()`.
    fn create_descriptor_set(&self, buffers: &[&Self::Buffer]) -> Result<Self::DescriptorSet>;

    /// Point bindless texture array elements at images. Images must be in shader-readable state before they
    /// are sampled.
    fn write_bindless_textures(&self, set: &Self::BindlessSet, writes: &[(u32, &Self::Image)]) -> Result<()>;
}

/// Records commands into a command buffer. Obtained through [`Device::begin_commands()`].
pub trait CommandRecorder<D: Device> {
    /// Copy `size` bytes from a staging buffer into a buffer.
    fn copy_buffer(&mut self, src: &D::StagingBuffer, src_offset: u64, dst: &D::Buffer, dst_offset: u64, size: u64);

    /// Transition every mip level of a freshly created image so it can receive copies.
    fn prepare_image_upload(&mut self, image: &D::Image);

    /// Copy tightly packed texels from a staging buffer into one mip level of an image.
    fn copy_buffer_to_image(&mut self, src: &D::StagingBuffer, src_offset: u64, dst: &D::Image, mip_level: u32);

    /// Make transfer writes to a buffer range available to the graphics queue.
    fn release_buffer(&mut self, buffer: &D::Buffer, offset: u64, size: u64);

    /// Release ownership of an uploaded image from the transfer queue to the graphics queue.
    fn release_image(&mut self, image: &D::Image);

    /// Acquire ownership of an image released with [`CommandRecorder::release_image()`]. Recorded on the graphics queue.
    fn acquire_image(&mut self, image: &D::Image);

    /// Optionally generate the mip chain from level zero, then transition the image for shader reads.
    /// Recorded on the graphics queue.
    fn finalize_image(&mut self, image: &D::Image, generate_mips: bool);

    /// Finish recording.
    fn finish(self) -> Result<D::CommandBuffer>;
}

#[cfg(test)]
mod tests {
    use super::mip_levels;

    #[test]
    fn full_mip_chain() {
        assert_eq!(mip_levels(1, 1), 1);
        assert_eq!(mip_levels(2, 1), 2);
        assert_eq!(mip_levels(256, 256), 9);
        assert_eq!(mip_levels(300, 17), 9);
    }
}
