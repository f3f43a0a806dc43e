//! Buffers and images owned by a [`VulkanDevice`](super::VulkanDevice).

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use super::allocator::{Allocation, Allocator, MemoryType};
use crate::device::StagingMemory;

/// Queue families a resource may be accessed from. A single family means exclusive sharing.
#[derive(Debug, Clone)]
pub(super) struct Families(pub Vec<u32>);

impl Families {
    fn sharing_mode(&self) -> vk::SharingMode {
        if self.0.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        }
    }
}

/// A device-local buffer.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanBuffer {
    #[derivative(Debug = "ignore")]
    device: Arc<ash::Device>,
    #[derivative(Debug = "ignore")]
    memory: Allocation,
    handle: vk::Buffer,
    size: vk::DeviceSize,
}

// SAFETY: The allocation may hold a pointer to mapped memory. It points to device memory, which is not
// dropped or moved when sending this to a different thread, and all access through it requires `&mut self`.
unsafe impl Send for VulkanBuffer {}
unsafe impl Sync for VulkanBuffer {}

impl VulkanBuffer {
    pub(super) fn new(
        device: Arc<ash::Device>,
        allocator: &Allocator,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        families: &Families,
        location: MemoryType,
    ) -> Result<Self> {
        let mut info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(families.sharing_mode());
        if families.sharing_mode() == vk::SharingMode::CONCURRENT {
            info = info.queue_family_indices(&families.0);
        }
        let handle = unsafe { device.create_buffer(&info, None)? };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkBuffer {handle:p} (size = {size} bytes)");

        let requirements = unsafe { device.get_buffer_memory_requirements(handle) };
        let memory = match allocator.allocate(name, &requirements, location) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_buffer(handle, None) };
                return Err(err);
            }
        };
        unsafe { device.bind_buffer_memory(handle, memory.memory(), memory.offset())? };

        Ok(Self {
            device,
            memory,
            handle,
            size,
        })
    }

    /// Get unsafe access to the underlying `VkBuffer` handle.
    /// # Safety
    /// The caller must not destroy the buffer or use it after `self` is dropped.
    pub unsafe fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkBuffer {:p}", self.handle);
        unsafe { self.device.destroy_buffer(self.handle, None) };
    }
}

/// A persistently mapped host-visible buffer used as a transfer source.
#[derive(Debug)]
pub struct VulkanStagingBuffer {
    buffer: VulkanBuffer,
    pointer: std::ptr::NonNull<u8>,
}

// SAFETY: The pointer points to mapped device memory that lives as long as the buffer. It is only written
// through `&mut self`.
unsafe impl Send for VulkanStagingBuffer {}

impl VulkanStagingBuffer {
    /// Wrap a buffer allocated in host visible memory.
    pub(super) fn mapped(buffer: VulkanBuffer) -> Result<Self> {
        let Some(pointer) = buffer.memory.mapped_ptr() else {
            anyhow::bail!(crate::Error::Uncategorized("staging memory is not host visible"));
        };
        Ok(Self {
            buffer,
            pointer: pointer.cast(),
        })
    }

    /// # Safety
    /// See [`VulkanBuffer::handle()`].
    pub unsafe fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }
}

impl StagingMemory for VulkanStagingBuffer {
    fn size(&self) -> u64 {
        self.buffer.size
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        assert!(offset + data.len() as u64 <= self.buffer.size, "staging write out of bounds");
        // SAFETY: The range was checked against the size of the mapping above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.pointer.as_ptr().add(offset as usize), data.len());
        }
    }
}

/// A sampled 2D image with a view over all of its mip levels.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanImage {
    #[derivative(Debug = "ignore")]
    device: Arc<ash::Device>,
    #[derivative(Debug = "ignore")]
    _memory: Allocation,
    handle: vk::Image,
    view: vk::ImageView,
    format: vk::Format,
    extent: vk::Extent2D,
    mip_levels: u32,
}

// SAFETY: Same as for `VulkanBuffer`. Image memory is never mapped.
unsafe impl Send for VulkanImage {}
unsafe impl Sync for VulkanImage {}

impl VulkanImage {
    pub(super) fn new(
        device: Arc<ash::Device>,
        allocator: &Allocator,
        name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        mip_levels: u32,
    ) -> Result<Self> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let handle = unsafe { device.create_image(&info, None)? };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkImage {handle:p}");

        let requirements = unsafe { device.get_image_memory_requirements(handle) };
        let memory = match allocator.allocate(name, &requirements, MemoryType::GpuOnly) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_image(handle, None) };
                return Err(err);
            }
        };
        unsafe { device.bind_image_memory(handle, memory.memory(), memory.offset())? };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(whole_range(mip_levels));
        let view = match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(err) => {
                unsafe { device.destroy_image(handle, None) };
                return Err(err.into());
            }
        };

        Ok(Self {
            device,
            _memory: memory,
            handle,
            view,
            format,
            extent,
            mip_levels,
        })
    }

    /// # Safety
    /// The caller must not destroy the image or use it after `self` is dropped.
    pub unsafe fn handle(&self) -> vk::Image {
        self.handle
    }

    /// # Safety
    /// See [`VulkanImage::handle()`].
    pub unsafe fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Extent of one mip level.
    pub fn mip_extent(&self, level: u32) -> vk::Extent3D {
        vk::Extent3D {
            width: (self.extent.width >> level).max(1),
            height: (self.extent.height >> level).max(1),
            depth: 1,
        }
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }
}

impl Drop for VulkanImage {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkImage {:p}", self.handle);
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.handle, None);
        }
    }
}

/// Subresource range covering `levels` mip levels of a single layer color image.
pub(super) fn whole_range(levels: u32) -> vk::ImageSubresourceRange {
    mip_range(0, levels)
}

pub(super) fn mip_range(base: u32, count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: base,
        level_count: count,
        base_array_layer: 0,
        layer_count: 1,
    }
}
