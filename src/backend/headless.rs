//! A [`Device`] that lives entirely in host memory.
//!
//! Buffers and images are plain byte vectors. Recorded commands are stored and only executed when their command
//! buffer is submitted, the same way a GPU consumes them. This means staging memory is read at submission time,
//! so overwriting a staging region before its upload was submitted shows up as corrupted data here too.
//!
//! Every executed command is validated: copy ranges must lie inside their resources, images must be prepared
//! before copies, ownership must be released before it is acquired and mip generation may only happen on the
//! graphics queue. Violations are reported as [`Error::InvalidCommand`] from the submission.
//!
//! # Example
//! ```
//! # use deimos::prelude::*;
//! # use deimos::backend::headless::HeadlessDevice;
//! # fn main() -> anyhow::Result<()> {
//! let device = HeadlessDevice::new();
//! let buffer = device.create_buffer(&BufferDesc {
//!     name: "example",
//!     size: 16,
//!     usage: ash::vk::BufferUsageFlags::STORAGE_BUFFER,
//! })?;
//! // Buffers start out zeroed.
//! assert_eq!(buffer.read(), vec![0; 16]);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, ensure, Result};
use ash::vk;

use crate::device::{BufferDesc, CommandLevel, CommandRecorder, Device, ImageDesc, QueueType, StagingMemory};
use crate::util::byte_size::ByteSize;
use crate::Error;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn invalid(message: String) -> anyhow::Error {
    Error::InvalidCommand(message).into()
}

/// Settings for a [`HeadlessDevice`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeadlessSettings {
    /// Emulate transfer and graphics queues from different queue families, which requires image ownership
    /// transfers. Defaults to true.
    pub distinct_transfer_queue: bool,
}

impl Default for HeadlessSettings {
    fn default() -> Self {
        Self {
            distinct_transfer_queue: true,
        }
    }
}

/// Submission counters of a [`HeadlessDevice`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct HeadlessStats {
    /// Primary command buffers submitted to the transfer queue.
    pub transfer_submissions: usize,
    /// Primary command buffers submitted to the graphics queue.
    pub graphics_submissions: usize,
    /// Secondary command buffers executed from a primary.
    pub secondary_buffers: usize,
    /// Individual commands executed.
    pub commands: usize,
    /// Calls creating device-local buffers. A GPU device clears the buffers of each call in one submission.
    pub buffer_batches: usize,
}

#[derive(Debug, Default)]
struct Counters {
    transfer_submissions: AtomicUsize,
    graphics_submissions: AtomicUsize,
    secondary_buffers: AtomicUsize,
    commands: AtomicUsize,
    buffer_batches: AtomicUsize,
}

/// Host memory implementation of [`Device`]. See the [module documentation](self).
#[derive(Debug, Default)]
pub struct HeadlessDevice {
    settings: HeadlessSettings,
    next_id: AtomicU64,
    counters: Counters,
    failures: AtomicUsize,
}

struct BufferInner {
    id: u64,
    name: String,
    data: Mutex<Vec<u8>>,
}

/// A device-local buffer in host memory. Cloning it creates another handle to the same buffer.
#[derive(Clone)]
pub struct HostBuffer {
    inner: Arc<BufferInner>,
}

impl HostBuffer {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> u64 {
        lock(&self.inner.data).len() as u64
    }

    /// Copy out the current contents.
    pub fn read(&self) -> Vec<u8> {
        lock(&self.inner.data).clone()
    }

    /// Copy out the current contents as an array of `T`. Trailing bytes that do not form a whole `T` are ignored.
    pub fn read_pod<T: bytemuck::Pod>(&self) -> Vec<T> {
        let data = lock(&self.inner.data);
        let whole = data.len() - data.len() % std::mem::size_of::<T>();
        bytemuck::pod_collect_to_vec(&data[..whole])
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

#[derive(Debug)]
struct ImageState {
    layout: vk::ImageLayout,
    owner: QueueType,
    released: bool,
    mips: Vec<Vec<u8>>,
}

struct ImageInner {
    id: u64,
    name: String,
    width: u32,
    height: u32,
    format: vk::Format,
    texel_size: u64,
    state: Mutex<ImageState>,
}

/// An image in host memory. Cloning it creates another handle to the same image.
#[derive(Clone)]
pub struct HostImage {
    inner: Arc<ImageInner>,
}

impl HostImage {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn format(&self) -> vk::Format {
        self.inner.format
    }

    pub fn mip_levels(&self) -> u32 {
        lock(&self.inner.state).mips.len() as u32
    }

    /// Layout of the image after the last executed command.
    pub fn layout(&self) -> vk::ImageLayout {
        lock(&self.inner.state).layout
    }

    /// Queue that currently owns the image.
    pub fn owner(&self) -> QueueType {
        lock(&self.inner.state).owner
    }

    /// Texels of a mip level. Empty if the level was never written.
    pub fn mip(&self, level: u32) -> Vec<u8> {
        lock(&self.inner.state).mips.get(level as usize).cloned().unwrap_or_default()
    }

    fn extent(&self, level: u32) -> (u32, u32) {
        ((self.inner.width >> level).max(1), (self.inner.height >> level).max(1))
    }

    fn mip_size(&self, level: u32) -> u64 {
        let (width, height) = self.extent(level);
        width as u64 * height as u64 * self.inner.texel_size
    }
}

impl fmt::Debug for HostImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostImage")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("format", &self.inner.format)
            .finish()
    }
}

/// Mapped staging memory in host memory.
#[derive(Clone)]
pub struct HostStagingBuffer {
    id: u64,
    data: Arc<Mutex<Vec<u8>>>,
}

impl StagingMemory for HostStagingBuffer {
    fn size(&self) -> u64 {
        lock(&self.data).len() as u64
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        lock(&self.data)[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl fmt::Debug for HostStagingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostStagingBuffer").field("id", &self.id).finish()
    }
}

#[derive(Debug)]
enum Command {
    CopyBuffer {
        src: HostStagingBuffer,
        src_offset: u64,
        dst: HostBuffer,
        dst_offset: u64,
        size: u64,
    },
    PrepareImage(HostImage),
    CopyBufferToImage {
        src: HostStagingBuffer,
        src_offset: u64,
        dst: HostImage,
        mip_level: u32,
    },
    ReleaseBuffer {
        buffer: HostBuffer,
        offset: u64,
        size: u64,
    },
    ReleaseImage(HostImage),
    AcquireImage(HostImage),
    FinalizeImage {
        image: HostImage,
        generate_mips: bool,
    },
}

/// Command pool of a [`HeadlessDevice`]. Tracks how many of its command buffers are alive.
#[derive(Debug)]
pub struct HostCommandPool {
    queue: QueueType,
    live: usize,
}

impl HostCommandPool {
    pub fn queue(&self) -> QueueType {
        self.queue
    }

    /// Number of command buffers allocated from this pool that were not freed yet.
    pub fn live_buffers(&self) -> usize {
        self.live
    }
}

/// A command buffer in the recording state.
#[derive(Debug)]
pub struct HostRecorder {
    queue: QueueType,
    level: CommandLevel,
    commands: Vec<Command>,
}

/// A finished command buffer.
#[derive(Debug)]
pub struct HostCommandBuffer {
    queue: QueueType,
    level: CommandLevel,
    commands: Vec<Command>,
}

/// Descriptor set binding the buffers of one model.
#[derive(Debug, Clone)]
pub struct HostDescriptorSet {
    buffers: Vec<HostBuffer>,
}

impl HostDescriptorSet {
    /// Buffer bound at a binding.
    pub fn binding(&self, binding: usize) -> Option<&HostBuffer> {
        self.buffers.get(binding)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// A bindless texture array. Cloning it creates another handle to the same array.
#[derive(Debug, Clone)]
pub struct HostBindlessSet {
    capacity: u32,
    slots: Arc<Mutex<HashMap<u32, HostImage>>>,
}

impl HostBindlessSet {
    /// Image currently referenced by an array element.
    pub fn image_at(&self, slot: u32) -> Option<HostImage> {
        lock(&self.slots).get(&slot).cloned()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl HeadlessDevice {
    /// Create a headless device with default settings.
    pub fn new() -> Self {
        Self::with_settings(HeadlessSettings::default())
    }

    pub fn with_settings(settings: HeadlessSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    /// Create an empty bindless texture array with `capacity` elements.
    pub fn create_bindless_set(&self, capacity: u32) -> HostBindlessSet {
        HostBindlessSet {
            capacity,
            slots: Arc::default(),
        }
    }

    /// Make the next `count` submissions fail with [`vk::Result::ERROR_DEVICE_LOST`] without executing anything.
    pub fn fail_next_submissions(&self, count: usize) {
        self.failures.store(count, Ordering::Release);
    }

    pub fn stats(&self) -> HeadlessStats {
        HeadlessStats {
            transfer_submissions: self.counters.transfer_submissions.load(Ordering::Acquire),
            graphics_submissions: self.counters.graphics_submissions.load(Ordering::Acquire),
            secondary_buffers: self.counters.secondary_buffers.load(Ordering::Acquire),
            commands: self.counters.commands.load(Ordering::Acquire),
            buffer_batches: self.counters.buffer_batches.load(Ordering::Acquire),
        }
    }

    fn host_buffer(&self, desc: &BufferDesc) -> Result<HostBuffer> {
        ensure!(desc.size > 0, "buffer `{}` has size zero", desc.name);
        Ok(HostBuffer {
            inner: Arc::new(BufferInner {
                id: self.next_id(),
                name: desc.name.to_owned(),
                data: Mutex::new(vec![0; desc.size as usize]),
            }),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |failures| failures.checked_sub(1))
            .is_ok()
    }

    fn count_submission(&self, queue: QueueType) {
        let counter = match queue {
            QueueType::Graphics => &self.counters.graphics_submissions,
            QueueType::Transfer => &self.counters.transfer_submissions,
        };
        counter.fetch_add(1, Ordering::AcqRel);
    }

    fn execute(&self, queue: QueueType, commands: &[Command]) -> Result<()> {
        for command in commands {
            self.execute_one(queue, command)?;
            self.counters.commands.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn execute_one(&self, queue: QueueType, command: &Command) -> Result<()> {
        match command {
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let staging = lock(&src.data);
                let mut target = lock(&dst.inner.data);
                if src_offset + size > staging.len() as u64 {
                    return Err(invalid(format!(
                        "copy of {size} bytes at staging offset {src_offset} exceeds staging size {}",
                        staging.len()
                    )));
                }
                if dst_offset + size > target.len() as u64 {
                    return Err(invalid(format!(
                        "copy of {size} bytes at offset {dst_offset} exceeds size {} of buffer `{}`",
                        target.len(),
                        dst.name()
                    )));
                }
                let (src_offset, dst_offset, size) = (*src_offset as usize, *dst_offset as usize, *size as usize);
                target[dst_offset..dst_offset + size].copy_from_slice(&staging[src_offset..src_offset + size]);
            }
            Command::PrepareImage(image) => {
                let mut state = lock(&image.inner.state);
                if state.layout != vk::ImageLayout::UNDEFINED {
                    return Err(invalid(format!("image `{}` was already prepared", image.name())));
                }
                state.layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
                state.owner = queue;
            }
            Command::CopyBufferToImage {
                src,
                src_offset,
                dst,
                mip_level,
            } => {
                let staging = lock(&src.data);
                let mut state = lock(&dst.inner.state);
                if state.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
                    return Err(invalid(format!(
                        "copy to image `{}` in layout {:?}",
                        dst.name(),
                        state.layout
                    )));
                }
                if *mip_level as usize >= state.mips.len() {
                    return Err(invalid(format!("image `{}` has no mip level {mip_level}", dst.name())));
                }
                let size = dst.mip_size(*mip_level);
                if src_offset + size > staging.len() as u64 {
                    return Err(invalid(format!(
                        "image copy of {size} bytes at staging offset {src_offset} exceeds staging size {}",
                        staging.len()
                    )));
                }
                let start = *src_offset as usize;
                state.mips[*mip_level as usize] = staging[start..start + size as usize].to_vec();
            }
            Command::ReleaseBuffer {
                buffer,
                offset,
                size,
            } => {
                if offset + size > buffer.size() {
                    return Err(invalid(format!(
                        "release of range {offset}..{} exceeds buffer `{}`",
                        offset + size,
                        buffer.name()
                    )));
                }
            }
            Command::ReleaseImage(image) => {
                let mut state = lock(&image.inner.state);
                if state.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL || state.owner != queue {
                    return Err(invalid(format!("image `{}` is not owned by the {queue:?} queue", image.name())));
                }
                state.released = true;
            }
            Command::AcquireImage(image) => {
                let mut state = lock(&image.inner.state);
                if !state.released {
                    return Err(invalid(format!("image `{}` acquired without a release", image.name())));
                }
                state.released = false;
                state.owner = queue;
            }
            Command::FinalizeImage {
                image,
                generate_mips,
            } => {
                let mut state = lock(&image.inner.state);
                if queue != QueueType::Graphics {
                    return Err(invalid(format!("image `{}` finalized on the {queue:?} queue", image.name())));
                }
                if self.settings.distinct_transfer_queue && state.owner != QueueType::Graphics {
                    return Err(invalid(format!(
                        "image `{}` finalized without acquiring ownership",
                        image.name()
                    )));
                }
                if state.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
                    return Err(invalid(format!(
                        "image `{}` finalized in layout {:?}",
                        image.name(),
                        state.layout
                    )));
                }
                if *generate_mips {
                    if state.mips[0].is_empty() {
                        return Err(invalid(format!("mips generated from empty level of `{}`", image.name())));
                    }
                    for level in 1..state.mips.len() as u32 {
                        let smaller = downsample(image, &state.mips[level as usize - 1], level);
                        state.mips[level as usize] = smaller;
                    }
                }
                state.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
            }
        }
        Ok(())
    }
}

/// Box filter one level down. Only four-byte formats are downsampled, anything else is left untouched.
fn downsample(image: &HostImage, source: &[u8], level: u32) -> Vec<u8> {
    let (width, height) = image.extent(level);
    let (src_width, src_height) = image.extent(level - 1);
    if image.inner.texel_size != 4 {
        return vec![0; (width * height) as usize * image.inner.texel_size as usize];
    }

    let texel = |x: u32, y: u32, channel: usize| -> u32 {
        let x = x.min(src_width - 1);
        let y = y.min(src_height - 1);
        source[((y * src_width + x) * 4) as usize + channel] as u32
    };
    let mut out = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            for channel in 0..4 {
                let sum = texel(2 * x, 2 * y, channel)
                    + texel(2 * x + 1, 2 * y, channel)
                    + texel(2 * x, 2 * y + 1, channel)
                    + texel(2 * x + 1, 2 * y + 1, channel);
                out.push(((sum + 2) / 4) as u8);
            }
        }
    }
    out
}

impl Device for HeadlessDevice {
    type Buffer = HostBuffer;
    type Image = HostImage;
    type StagingBuffer = HostStagingBuffer;
    type CommandPool = HostCommandPool;
    type Recorder = HostRecorder;
    type CommandBuffer = HostCommandBuffer;
    type DescriptorSet = HostDescriptorSet;
    type BindlessSet = HostBindlessSet;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<HostBuffer> {
        self.counters.buffer_batches.fetch_add(1, Ordering::AcqRel);
        self.host_buffer(desc)
    }

    fn create_buffers(&self, descs: &[BufferDesc]) -> Result<Vec<HostBuffer>> {
        self.counters.buffer_batches.fetch_add(1, Ordering::AcqRel);
        descs.iter().map(|desc| self.host_buffer(desc)).collect()
    }

    fn create_staging_buffer(&self, _name: &str, size: u64) -> Result<HostStagingBuffer> {
        ensure!(size > 0, "staging buffer has size zero");
        Ok(HostStagingBuffer {
            id: self.next_id(),
            data: Arc::new(Mutex::new(vec![0; size as usize])),
        })
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<HostImage> {
        ensure!(desc.width > 0 && desc.height > 0, "image `{}` has an empty extent", desc.name);
        ensure!(desc.mip_levels > 0, "image `{}` has no mip levels", desc.name);
        let Some(texel_size) = desc.format.byte_size() else {
            bail!(Error::Uncategorized("unsupported image format"));
        };
        Ok(HostImage {
            inner: Arc::new(ImageInner {
                id: self.next_id(),
                name: desc.name.to_owned(),
                width: desc.width,
                height: desc.height,
                format: desc.format,
                texel_size,
                state: Mutex::new(ImageState {
                    layout: vk::ImageLayout::UNDEFINED,
                    owner: QueueType::Transfer,
                    released: false,
                    mips: vec![Vec::new(); desc.mip_levels as usize],
                }),
            }),
        })
    }

    fn create_command_pool(&self, queue: QueueType) -> Result<HostCommandPool> {
        Ok(HostCommandPool {
            queue,
            live: 0,
        })
    }

    fn begin_commands(&self, pool: &mut HostCommandPool, level: CommandLevel) -> Result<HostRecorder> {
        pool.live += 1;
        Ok(HostRecorder {
            queue: pool.queue,
            level,
            commands: Vec::new(),
        })
    }

    fn free_commands(&self, pool: &mut HostCommandPool, commands: Vec<HostCommandBuffer>) {
        pool.live = pool.live.saturating_sub(commands.len());
    }

    fn execute_secondaries(&self, pool: &mut HostCommandPool, secondaries: &[HostCommandBuffer]) -> Result<()> {
        if self.take_failure() {
            return Err(Error::VkError(vk::Result::ERROR_DEVICE_LOST).into());
        }
        for secondary in secondaries {
            if secondary.level != CommandLevel::Secondary || secondary.queue != pool.queue {
                return Err(invalid(format!(
                    "{:?} {:?} command buffer executed from a {:?} primary",
                    secondary.queue, secondary.level, pool.queue
                )));
            }
        }
        self.count_submission(pool.queue);
        for secondary in secondaries {
            self.execute(pool.queue, &secondary.commands)?;
            self.counters.secondary_buffers.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn submit(&self, pool: &mut HostCommandPool, command: HostCommandBuffer) -> Result<()> {
        pool.live = pool.live.saturating_sub(1);
        if self.take_failure() {
            return Err(Error::VkError(vk::Result::ERROR_DEVICE_LOST).into());
        }
        if command.level != CommandLevel::Primary || command.queue != pool.queue {
            return Err(invalid(format!(
                "{:?} {:?} command buffer submitted to the {:?} queue",
                command.queue, command.level, pool.queue
            )));
        }
        self.count_submission(pool.queue);
        self.execute(pool.queue, &command.commands)
    }

    fn needs_ownership_transfer(&self) -> bool {
        self.settings.distinct_transfer_queue
    }

    fn create_descriptor_set(&self, buffers: &[&HostBuffer]) -> Result<HostDescriptorSet> {
        Ok(HostDescriptorSet {
            buffers: buffers.iter().map(|&buffer| buffer.clone()).collect(),
        })
    }

    fn write_bindless_textures(&self, set: &HostBindlessSet, writes: &[(u32, &HostImage)]) -> Result<()> {
        let mut slots = lock(&set.slots);
        for (slot, image) in writes {
            if *slot >= set.capacity {
                return Err(invalid(format!("bindless slot {slot} out of range")));
            }
            if image.layout() != vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
                return Err(invalid(format!("image `{}` bound before it is shader readable", image.name())));
            }
            slots.insert(*slot, (*image).clone());
        }
        Ok(())
    }
}

impl CommandRecorder<HeadlessDevice> for HostRecorder {
    fn copy_buffer(&mut self, src: &HostStagingBuffer, src_offset: u64, dst: &HostBuffer, dst_offset: u64, size: u64) {
        self.commands.push(Command::CopyBuffer {
            src: src.clone(),
            src_offset,
            dst: dst.clone(),
            dst_offset,
            size,
        });
    }

    fn prepare_image_upload(&mut self, image: &HostImage) {
        self.commands.push(Command::PrepareImage(image.clone()));
    }

    fn copy_buffer_to_image(&mut self, src: &HostStagingBuffer, src_offset: u64, dst: &HostImage, mip_level: u32) {
        self.commands.push(Command::CopyBufferToImage {
            src: src.clone(),
            src_offset,
            dst: dst.clone(),
            mip_level,
        });
    }

    fn release_buffer(&mut self, buffer: &HostBuffer, offset: u64, size: u64) {
        self.commands.push(Command::ReleaseBuffer {
            buffer: buffer.clone(),
            offset,
            size,
        });
    }

    fn release_image(&mut self, image: &HostImage) {
        self.commands.push(Command::ReleaseImage(image.clone()));
    }

    fn acquire_image(&mut self, image: &HostImage) {
        self.commands.push(Command::AcquireImage(image.clone()));
    }

    fn finalize_image(&mut self, image: &HostImage, generate_mips: bool) {
        self.commands.push(Command::FinalizeImage {
            image: image.clone(),
            generate_mips,
        });
    }

    fn finish(self) -> Result<HostCommandBuffer> {
        Ok(HostCommandBuffer {
            queue: self.queue,
            level: self.level,
            commands: self.commands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(device: &HeadlessDevice, size: u32, levels: u32) -> HostImage {
        device
            .create_image(&ImageDesc {
                name: "test",
                width: size,
                height: size,
                format: vk::Format::R8G8B8A8_UNORM,
                mip_levels: levels,
            })
            .unwrap()
    }

    #[test]
    fn copy_out_of_bounds_is_rejected() {
        let device = HeadlessDevice::new();
        let mut pool = device.create_command_pool(QueueType::Transfer).unwrap();
        let mut staging = device.create_staging_buffer("staging", 8).unwrap();
        staging.write(0, &[1; 8]);
        let buffer = device
            .create_buffer(&BufferDesc {
                name: "small",
                size: 4,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            })
            .unwrap();

        let mut cmd = device.begin_commands(&mut pool, CommandLevel::Primary).unwrap();
        cmd.copy_buffer(&staging, 0, &buffer, 0, 8);
        let result = device.submit(&mut pool, cmd.finish().unwrap());
        assert!(result.is_err());
        assert_eq!(buffer.read(), vec![0; 4]);
    }

    #[test]
    fn finalize_requires_acquire_with_distinct_queues() {
        let device = HeadlessDevice::new();
        let mut transfer = device.create_command_pool(QueueType::Transfer).unwrap();
        let mut graphics = device.create_command_pool(QueueType::Graphics).unwrap();
        let mut staging = device.create_staging_buffer("staging", 64).unwrap();
        staging.write(0, &[255; 64]);
        let image = image(&device, 4, 3);

        let mut cmd = device.begin_commands(&mut transfer, CommandLevel::Primary).unwrap();
        cmd.prepare_image_upload(&image);
        cmd.copy_buffer_to_image(&staging, 0, &image, 0);
        cmd.release_image(&image);
        device.submit(&mut transfer, cmd.finish().unwrap()).unwrap();

        let mut cmd = device.begin_commands(&mut graphics, CommandLevel::Primary).unwrap();
        cmd.finalize_image(&image, true);
        assert!(device.submit(&mut graphics, cmd.finish().unwrap()).is_err());

        let mut cmd = device.begin_commands(&mut graphics, CommandLevel::Primary).unwrap();
        cmd.acquire_image(&image);
        cmd.finalize_image(&image, true);
        device.submit(&mut graphics, cmd.finish().unwrap()).unwrap();
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(image.mip(1), vec![255; 16]);
        assert_eq!(image.mip(2), vec![255; 4]);
    }

    #[test]
    fn unfinished_images_cannot_be_bound() {
        let device = HeadlessDevice::new();
        let set = device.create_bindless_set(4);
        let image = image(&device, 1, 1);
        assert!(device.write_bindless_textures(&set, &[(0, &image)]).is_err());
        assert!(set.image_at(0).is_none());
    }

    #[test]
    fn injected_failures_skip_execution() {
        let device = HeadlessDevice::new();
        let mut pool = device.create_command_pool(QueueType::Transfer).unwrap();
        device.fail_next_submissions(1);
        let cmd = device.begin_commands(&mut pool, CommandLevel::Primary).unwrap();
        assert!(device.submit(&mut pool, cmd.finish().unwrap()).is_err());
        let cmd = device.begin_commands(&mut pool, CommandLevel::Primary).unwrap();
        assert!(device.submit(&mut pool, cmd.finish().unwrap()).is_ok());
        assert_eq!(device.stats().transfer_submissions, 1);
    }
}
