//! Device memory allocation through the [`gpu_allocator`] crate.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::vk;
use gpu_allocator::vulkan as vk_alloc;
use gpu_allocator::vulkan::AllocationScheme;

use crate::Error;

/// Where an allocation should live.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemoryType {
    /// GPU only accessible memory. Destination buffers and images live here.
    GpuOnly,
    /// Host visible memory that the GPU can read from. Used for staging buffers.
    CpuToGpu,
}

impl From<MemoryType> for gpu_allocator::MemoryLocation {
    fn from(value: MemoryType) -> Self {
        match value {
            MemoryType::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
            MemoryType::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
        }
    }
}

/// Wrapper around a `gpu_allocator` allocator. This is `Clone`, `Send` and `Sync`, since all internal state
/// is behind an `Arc<Mutex<T>>`.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct Allocator {
    #[derivative(Debug = "ignore")]
    alloc: Arc<Mutex<vk_alloc::Allocator>>,
}

/// Memory allocated from an [`Allocator`]. Freed when dropped.
#[derive(Debug)]
pub struct Allocation {
    allocator: Allocator,
    // Always Some(_) until dropped.
    allocation: Option<vk_alloc::Allocation>,
}

impl Allocator {
    /// Create a new allocator.
    /// # Errors
    /// * May fail if creating the internal `gpu_allocator` fails.
    pub fn new(instance: &ash::Instance, device: &ash::Device, physical_device: vk::PhysicalDevice) -> Result<Self> {
        Ok(Self {
            alloc: Arc::new(Mutex::new(vk_alloc::Allocator::new(&vk_alloc::AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
            })?)),
        })
    }

    /// Allocate memory satisfying `requirements`. The name is used for tracking and debug logging.
    /// # Errors
    /// * May fail if the device is out of memory.
    pub fn allocate(&self, name: &str, requirements: &vk::MemoryRequirements, ty: MemoryType) -> Result<Allocation> {
        let mut alloc = self.alloc.lock().map_err(|_| Error::PoisonError)?;
        let allocation = alloc
            .allocate(&vk_alloc::AllocationCreateDesc {
                name,
                requirements: *requirements,
                location: gpu_allocator::MemoryLocation::from(ty),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(Error::from)?;

        Ok(Allocation {
            allocator: self.clone(),
            allocation: Some(allocation),
        })
    }
}

impl Allocation {
    /// # Safety
    /// The memory must not be freed or bound outside of `offset()..offset() + size`.
    pub unsafe fn memory(&self) -> vk::DeviceMemory {
        self.allocation.as_ref().map(|a| a.memory()).unwrap_or_default()
    }

    pub fn offset(&self) -> vk::DeviceSize {
        self.allocation.as_ref().map(|a| a.offset()).unwrap_or_default()
    }

    /// Pointer to the start of the allocation if its memory is host visible.
    pub fn mapped_ptr(&self) -> Option<NonNull<c_void>> {
        self.allocation.as_ref().and_then(|a| a.mapped_ptr())
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        let Some(allocation) = self.allocation.take() else {
            return;
        };
        match self.allocator.alloc.lock() {
            Ok(mut alloc) => {
                if let Err(err) = alloc.free(allocation) {
                    error!("Failed to free device memory: {err}");
                }
            }
            Err(_) => error!("Allocator mutex poisoned, leaking device memory"),
        }
    }
}
