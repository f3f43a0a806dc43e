//! Command pools and command recording for the Vulkan backend.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use super::resource::{mip_range, whole_range, VulkanBuffer, VulkanImage, VulkanStagingBuffer};
use super::VulkanDevice;
use crate::device::{CommandLevel, CommandRecorder, QueueType};

/// Queue family indices of the two queues the loader uses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) struct QueueFamilies {
    pub graphics: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    pub fn of(&self, queue: QueueType) -> u32 {
        match queue {
            QueueType::Graphics => self.graphics,
            QueueType::Transfer => self.transfer,
        }
    }

    pub fn distinct(&self) -> bool {
        self.graphics != self.transfer
    }
}

/// A `VkCommandPool`. Must only be used by one thread at a time.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanCommandPool {
    #[derivative(Debug = "ignore")]
    device: Arc<ash::Device>,
    handle: vk::CommandPool,
    queue: QueueType,
}

impl VulkanCommandPool {
    pub(super) fn new(device: Arc<ash::Device>, family: u32, queue: QueueType) -> Result<Self> {
        let info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let handle = unsafe { device.create_command_pool(&info, None)? };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkCommandPool {handle:p}");
        Ok(Self {
            device,
            handle,
            queue,
        })
    }

    pub fn queue(&self) -> QueueType {
        self.queue
    }

    /// # Safety
    /// The caller must not destroy the pool or use it from another thread.
    pub unsafe fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    pub(super) fn allocate(&mut self, level: vk::CommandBufferLevel) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.handle)
            .level(level)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        Ok(buffers[0])
    }

    pub(super) fn free(&mut self, handles: &[vk::CommandBuffer]) {
        if !handles.is_empty() {
            unsafe { self.device.free_command_buffers(self.handle, handles) };
        }
    }
}

impl Drop for VulkanCommandPool {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkCommandPool {:p}", self.handle);
        unsafe { self.device.destroy_command_pool(self.handle, None) };
    }
}

/// A finished `VkCommandBuffer`.
#[derive(Debug)]
pub struct VulkanCommandBuffer {
    pub(super) handle: vk::CommandBuffer,
    pub(super) queue: QueueType,
}

/// A `VkCommandBuffer` in the recording state.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanRecorder {
    #[derivative(Debug = "ignore")]
    device: Arc<ash::Device>,
    handle: vk::CommandBuffer,
    queue: QueueType,
    families: QueueFamilies,
}

impl VulkanRecorder {
    pub(super) fn begin(
        device: Arc<ash::Device>,
        pool: &mut VulkanCommandPool,
        level: CommandLevel,
        families: QueueFamilies,
    ) -> Result<Self> {
        let vk_level = match level {
            CommandLevel::Primary => vk::CommandBufferLevel::PRIMARY,
            CommandLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
        };
        let handle = pool.allocate(vk_level)?;
        // Secondaries only contain transfer commands, so they do not inherit any render pass state.
        let inheritance = vk::CommandBufferInheritanceInfo::builder();
        let mut info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if level == CommandLevel::Secondary {
            info = info.inheritance_info(&inheritance);
        }
        if let Err(err) = unsafe { device.begin_command_buffer(handle, &info) } {
            pool.free(&[handle]);
            return Err(err.into());
        }
        Ok(Self {
            device,
            handle,
            queue: pool.queue,
            families,
        })
    }

    fn image_barrier(
        &mut self,
        image: &VulkanImage,
        range: vk::ImageSubresourceRange,
        (src_stage, src_access, old_layout): (vk::PipelineStageFlags, vk::AccessFlags, vk::ImageLayout),
        (dst_stage, dst_access, new_layout): (vk::PipelineStageFlags, vk::AccessFlags, vk::ImageLayout),
        (src_family, dst_family): (u32, u32),
    ) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family)
            .image(unsafe { image.handle() })
            .subresource_range(range)
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.handle,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&barrier),
            );
        }
    }

    fn ownership_families(&self) -> (u32, u32) {
        if self.families.distinct() {
            (self.families.transfer, self.families.graphics)
        } else {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        }
    }
}

impl CommandRecorder<VulkanDevice> for VulkanRecorder {
    fn copy_buffer(&mut self, src: &VulkanStagingBuffer, src_offset: u64, dst: &VulkanBuffer, dst_offset: u64, size: u64) {
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe {
            self.device
                .cmd_copy_buffer(self.handle, src.handle(), dst.handle(), std::slice::from_ref(&region));
        }
    }

    fn prepare_image_upload(&mut self, image: &VulkanImage) {
        self.image_barrier(
            image,
            whole_range(image.mip_levels()),
            (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty(), vk::ImageLayout::UNDEFINED),
            (
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED),
        );
    }

    fn copy_buffer_to_image(&mut self, src: &VulkanStagingBuffer, src_offset: u64, dst: &VulkanImage, mip_level: u32) {
        let region = vk::BufferImageCopy {
            buffer_offset: src_offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: dst.mip_extent(mip_level),
        };
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                self.handle,
                src.handle(),
                dst.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );
        }
    }

    fn release_buffer(&mut self, buffer: &VulkanBuffer, offset: u64, size: u64) {
        // Buffers are created with concurrent sharing, so this only has to make the writes available.
        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::empty())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(unsafe { buffer.handle() })
            .offset(offset)
            .size(size)
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.handle,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                std::slice::from_ref(&barrier),
                &[],
            );
        }
    }

    fn release_image(&mut self, image: &VulkanImage) {
        let families = self.ownership_families();
        self.image_barrier(
            image,
            whole_range(image.mip_levels()),
            (
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
            (
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::AccessFlags::empty(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
            families,
        );
    }

    fn acquire_image(&mut self, image: &VulkanImage) {
        let families = self.ownership_families();
        self.image_barrier(
            image,
            whole_range(image.mip_levels()),
            (
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::AccessFlags::empty(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
            (
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
            families,
        );
    }

    fn finalize_image(&mut self, image: &VulkanImage, generate_mips: bool) {
        let levels = image.mip_levels();
        let transfer_write = (
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        let transfer_read = (
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        let shader_read = (
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        let ignored = (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED);

        if !generate_mips || levels == 1 {
            self.image_barrier(image, whole_range(levels), transfer_write, shader_read, ignored);
            return;
        }

        for level in 1..levels {
            self.image_barrier(image, mip_range(level - 1, 1), transfer_write, transfer_read, ignored);
            let src = image.mip_extent(level - 1);
            let dst = image.mip_extent(level);
            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                src_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: src.width as i32,
                        y: src.height as i32,
                        z: 1,
                    },
                ],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                dst_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: dst.width as i32,
                        y: dst.height as i32,
                        z: 1,
                    },
                ],
            };
            unsafe {
                self.device.cmd_blit_image(
                    self.handle,
                    image.handle(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(&blit),
                    vk::Filter::LINEAR,
                );
            }
            self.image_barrier(image, mip_range(level - 1, 1), transfer_read, shader_read, ignored);
        }
        self.image_barrier(image, mip_range(levels - 1, 1), transfer_write, shader_read, ignored);
    }

    fn finish(self) -> Result<VulkanCommandBuffer> {
        unsafe { self.device.end_command_buffer(self.handle)? };
        Ok(VulkanCommandBuffer {
            handle: self.handle,
            queue: self.queue,
        })
    }
}
