//! [`Device`] implementation on top of `ash` and `gpu-allocator`.
//!
//! The Vulkan instance, device and queues are owned by the application. [`VulkanDevice`] only borrows them for
//! the lifetime of the loader. Queues are shared through [`SharedQueue`], since `vkQueueSubmit` requires external
//! synchronization and the application keeps submitting its own frames on the graphics queue.
//!
//! Destination buffers use concurrent sharing between the graphics and transfer queue families, so no
//! ownership transfer is required for them. Images are exclusive and go through a release on the transfer queue
//! and an acquire on the graphics queue.
//!
//! The descriptor pool given to [`VulkanDevice::new()`] must allow freeing individual sets and must be created
//! with `UPDATE_AFTER_BIND` if it is used for [`VulkanDevice::create_bindless_set()`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::vk;

pub use allocator::{Allocation, Allocator, MemoryType};
pub use command::{VulkanCommandBuffer, VulkanCommandPool, VulkanRecorder};
pub use resource::{VulkanBuffer, VulkanImage, VulkanStagingBuffer};

use command::QueueFamilies;
use resource::Families;

use crate::device::{BufferDesc, CommandLevel, Device, ImageDesc, QueueType};
use crate::Error;

pub mod allocator;
pub mod command;
pub mod resource;

/// A `VkQueue` that is shared with the application. Lock the mutex around every submission.
#[derive(Debug, Clone)]
pub struct SharedQueue {
    pub handle: Arc<Mutex<vk::Queue>>,
    pub family_index: u32,
}

/// Everything [`VulkanDevice`] needs from the application.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanDeviceCreateInfo {
    #[derivative(Debug = "ignore")]
    pub instance: ash::Instance,
    #[derivative(Debug = "ignore")]
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub graphics: SharedQueue,
    /// The transfer queue. May be the same queue as the graphics queue.
    pub transfer: SharedQueue,
    /// Pool that per-model descriptor sets are allocated from.
    pub descriptor_pool: vk::DescriptorPool,
}

/// A descriptor set bound to the buffers of one model.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanDescriptorSet {
    #[derivative(Debug = "ignore")]
    device: Arc<ash::Device>,
    pool: vk::DescriptorPool,
    handle: vk::DescriptorSet,
    layout: vk::DescriptorSetLayout,
}

impl VulkanDescriptorSet {
    /// # Safety
    /// The caller must not free the set or use it after `self` is dropped.
    pub unsafe fn handle(&self) -> vk::DescriptorSet {
        self.handle
    }

    /// Layout of this set. Lives as long as the [`VulkanDevice`] that created it.
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for VulkanDescriptorSet {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.device.free_descriptor_sets(self.pool, &[self.handle]) } {
            error!("Failed to free descriptor set: {err}");
        }
    }
}

/// The bindless descriptor set holding a combined image sampler array.
#[derive(Debug)]
pub struct VulkanBindlessSet {
    pub set: vk::DescriptorSet,
    pub layout: vk::DescriptorSetLayout,
    pub binding: u32,
    pub sampler: vk::Sampler,
}

#[derive(Debug)]
struct Descriptors {
    pool: vk::DescriptorPool,
    /// One layout per number of storage buffer bindings.
    layouts: HashMap<u32, vk::DescriptorSetLayout>,
}

/// Vulkan implementation of [`Device`]. See the [module documentation](self).
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanDevice {
    #[derivative(Debug = "ignore")]
    device: Arc<ash::Device>,
    allocator: Allocator,
    graphics: SharedQueue,
    transfer: SharedQueue,
    families: QueueFamilies,
    descriptors: Mutex<Descriptors>,
    /// Used to zero-fill buffers at creation. Every creation call clears its buffers in one submission.
    one_shot: Mutex<VulkanCommandPool>,
    bindless_layouts: Mutex<Vec<vk::DescriptorSetLayout>>,
}

impl VulkanDevice {
    /// Create a device over application owned Vulkan objects.
    /// # Errors
    /// * Fails if the memory allocator or internal command pool cannot be created.
    pub fn new(info: VulkanDeviceCreateInfo) -> Result<Self> {
        let allocator = Allocator::new(&info.instance, &info.device, info.physical_device)?;
        let device = Arc::new(info.device);
        let families = QueueFamilies {
            graphics: info.graphics.family_index,
            transfer: info.transfer.family_index,
        };
        let one_shot = VulkanCommandPool::new(device.clone(), families.transfer, QueueType::Transfer)?;
        info!(
            "Created Vulkan streaming device (graphics family {}, transfer family {})",
            families.graphics, families.transfer
        );
        Ok(Self {
            device,
            allocator,
            graphics: info.graphics,
            transfer: info.transfer,
            families,
            descriptors: Mutex::new(Descriptors {
                pool: info.descriptor_pool,
                layouts: HashMap::new(),
            }),
            one_shot: Mutex::new(one_shot),
            bindless_layouts: Mutex::new(Vec::new()),
        })
    }

    /// The wrapped `ash` device.
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// The allocator used for all resources of this device.
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Create an update-after-bind descriptor set with one partially bound array of `capacity` combined image
    /// samplers at `binding`. Use it with a [`BindlessTable`](crate::device::bindless::BindlessTable).
    /// # Errors
    /// * Fails if the descriptor pool cannot fit the set.
    pub fn create_bindless_set(&self, binding: u32, capacity: u32, sampler: vk::Sampler) -> Result<VulkanBindlessSet> {
        let layout_binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(capacity)
            .stage_flags(vk::ShaderStageFlags::ALL)
            .build();
        let flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND];
        let mut binding_flags = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(std::slice::from_ref(&layout_binding))
            .push_next(&mut binding_flags);
        let layout = unsafe { self.device.create_descriptor_set_layout(&layout_info, None)? };
        self.bindless_layouts.lock().map_err(|_| Error::PoisonError)?.push(layout);

        let set = self.allocate_set(layout)?;
        Ok(VulkanBindlessSet {
            set,
            layout,
            binding,
            sampler,
        })
    }

    fn allocate_set(&self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let descriptors = self.descriptors.lock().map_err(|_| Error::PoisonError)?;
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(descriptors.pool)
            .set_layouts(std::slice::from_ref(&layout));
        let sets = unsafe { self.device.allocate_descriptor_sets(&info)? };
        Ok(sets[0])
    }

    fn storage_layout(&self, bindings: u32) -> Result<(vk::DescriptorPool, vk::DescriptorSetLayout)> {
        let mut descriptors = self.descriptors.lock().map_err(|_| Error::PoisonError)?;
        if let Some(layout) = descriptors.layouts.get(&bindings) {
            return Ok((descriptors.pool, *layout));
        }
        let layout_bindings = (0..bindings)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::ALL)
                    .build()
            })
            .collect::<Vec<_>>();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&layout_bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&info, None)? };
        descriptors.layouts.insert(bindings, layout);
        Ok((descriptors.pool, layout))
    }

    fn queue(&self, queue: QueueType) -> &SharedQueue {
        match queue {
            QueueType::Graphics => &self.graphics,
            QueueType::Transfer => &self.transfer,
        }
    }

    /// Submit command buffers to a queue and block until they finished executing.
    fn submit_and_wait(&self, queue: QueueType, commands: &[vk::CommandBuffer]) -> Result<()> {
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None)? };
        let submit = vk::SubmitInfo::builder().command_buffers(commands).build();
        let result = (|| -> Result<()> {
            {
                let handle = self.queue(queue).handle.lock().map_err(|_| Error::PoisonError)?;
                unsafe { self.device.queue_submit(*handle, std::slice::from_ref(&submit), fence)? };
            }
            unsafe { self.device.wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX)? };
            Ok(())
        })();
        unsafe { self.device.destroy_fence(fence, None) };
        result
    }

    fn new_buffer(&self, desc: &BufferDesc) -> Result<VulkanBuffer> {
        let families = if self.families.distinct() {
            Families(vec![self.families.graphics, self.families.transfer])
        } else {
            Families(vec![self.families.graphics])
        };
        VulkanBuffer::new(
            self.device.clone(),
            &self.allocator,
            desc.name,
            desc.size,
            desc.usage | vk::BufferUsageFlags::TRANSFER_DST,
            &families,
            MemoryType::GpuOnly,
        )
    }

    /// Clear all `buffers` with one submission on the transfer queue.
    fn zero_fill(&self, buffers: &[VulkanBuffer]) -> Result<()> {
        if buffers.is_empty() {
            return Ok(());
        }
        let mut pool = self.one_shot.lock().map_err(|_| Error::PoisonError)?;
        let handle = pool.allocate(vk::CommandBufferLevel::PRIMARY)?;
        let result = (|| -> Result<()> {
            let begin = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe {
                self.device.begin_command_buffer(handle, &begin)?;
                for buffer in buffers {
                    self.device.cmd_fill_buffer(handle, buffer.handle(), 0, vk::WHOLE_SIZE, 0);
                }
                self.device.end_command_buffer(handle)?;
            }
            self.submit_and_wait(QueueType::Transfer, &[handle])
        })();
        pool.free(&[handle]);
        result
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let descriptors = self.descriptors.get_mut().unwrap_or_else(|e| e.into_inner());
        let bindless = self.bindless_layouts.get_mut().unwrap_or_else(|e| e.into_inner());
        unsafe {
            for layout in descriptors.layouts.values().chain(bindless.iter()) {
                self.device.destroy_descriptor_set_layout(*layout, None);
            }
        }
    }
}

impl Device for VulkanDevice {
    type Buffer = VulkanBuffer;
    type Image = VulkanImage;
    type StagingBuffer = VulkanStagingBuffer;
    type CommandPool = VulkanCommandPool;
    type Recorder = VulkanRecorder;
    type CommandBuffer = VulkanCommandBuffer;
    type DescriptorSet = VulkanDescriptorSet;
    type BindlessSet = VulkanBindlessSet;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<VulkanBuffer> {
        let buffer = self.new_buffer(desc)?;
        self.zero_fill(std::slice::from_ref(&buffer))?;
        Ok(buffer)
    }

    fn create_buffers(&self, descs: &[BufferDesc]) -> Result<Vec<VulkanBuffer>> {
        let buffers = descs.iter().map(|desc| self.new_buffer(desc)).collect::<Result<Vec<_>>>()?;
        self.zero_fill(&buffers)?;
        Ok(buffers)
    }

    fn create_staging_buffer(&self, name: &str, size: u64) -> Result<VulkanStagingBuffer> {
        let buffer = VulkanBuffer::new(
            self.device.clone(),
            &self.allocator,
            name,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            &Families(vec![self.families.transfer]),
            MemoryType::CpuToGpu,
        )?;
        VulkanStagingBuffer::mapped(buffer)
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<VulkanImage> {
        VulkanImage::new(
            self.device.clone(),
            &self.allocator,
            desc.name,
            vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
            desc.format,
            desc.mip_levels,
        )
    }

    fn create_command_pool(&self, queue: QueueType) -> Result<VulkanCommandPool> {
        VulkanCommandPool::new(self.device.clone(), self.families.of(queue), queue)
    }

    fn begin_commands(&self, pool: &mut VulkanCommandPool, level: CommandLevel) -> Result<VulkanRecorder> {
        VulkanRecorder::begin(self.device.clone(), pool, level, self.families)
    }

    fn free_commands(&self, pool: &mut VulkanCommandPool, commands: Vec<VulkanCommandBuffer>) {
        let handles = commands.iter().map(|cmd| cmd.handle).collect::<Vec<_>>();
        pool.free(&handles);
    }

    fn execute_secondaries(&self, pool: &mut VulkanCommandPool, secondaries: &[VulkanCommandBuffer]) -> Result<()> {
        if secondaries.is_empty() {
            return Ok(());
        }
        let handles = secondaries.iter().map(|cmd| cmd.handle).collect::<Vec<_>>();
        let primary = pool.allocate(vk::CommandBufferLevel::PRIMARY)?;
        let result = (|| -> Result<()> {
            let begin = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe {
                self.device.begin_command_buffer(primary, &begin)?;
                self.device.cmd_execute_commands(primary, &handles);
                self.device.end_command_buffer(primary)?;
            }
            debug!("Submitting {} secondary command buffers on the {:?} queue", handles.len(), pool.queue());
            self.submit_and_wait(pool.queue(), &[primary])
        })();
        pool.free(&[primary]);
        result
    }

    fn submit(&self, pool: &mut VulkanCommandPool, command: VulkanCommandBuffer) -> Result<()> {
        if command.queue != pool.queue() {
            pool.free(&[command.handle]);
            return Err(Error::Uncategorized("command buffer submitted to a queue it was not recorded for").into());
        }
        let result = self.submit_and_wait(pool.queue(), &[command.handle]);
        pool.free(&[command.handle]);
        result
    }

    fn needs_ownership_transfer(&self) -> bool {
        self.families.distinct()
    }

    fn create_descriptor_set(&self, buffers: &[&VulkanBuffer]) -> Result<VulkanDescriptorSet> {
        let (pool, layout) = self.storage_layout(buffers.len() as u32)?;
        let handle = self.allocate_set(layout)?;
        let infos = buffers
            .iter()
            .map(|buffer| vk::DescriptorBufferInfo {
                buffer: unsafe { buffer.handle() },
                offset: 0,
                range: vk::WHOLE_SIZE,
            })
            .collect::<Vec<_>>();
        let writes = infos
            .iter()
            .enumerate()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(handle)
                    .dst_binding(binding as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
                    .build()
            })
            .collect::<Vec<_>>();
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
        Ok(VulkanDescriptorSet {
            device: self.device.clone(),
            pool,
            handle,
            layout,
        })
    }

    fn write_bindless_textures(&self, set: &VulkanBindlessSet, writes: &[(u32, &VulkanImage)]) -> Result<()> {
        let infos = writes
            .iter()
            .map(|(_, image)| vk::DescriptorImageInfo {
                sampler: set.sampler,
                image_view: unsafe { image.view() },
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .collect::<Vec<_>>();
        let vk_writes = writes
            .iter()
            .zip(infos.iter())
            .map(|((slot, _), info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set.set)
                    .dst_binding(set.binding)
                    .dst_array_element(*slot)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(info))
                    .build()
            })
            .collect::<Vec<_>>();
        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
        Ok(())
    }
}
