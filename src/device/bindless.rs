//! Slot allocation for a bindless texture array.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;

use crate::device::Device;
use crate::Error;

/// The maximum number of textures in a bindless table created with default settings.
pub static MAX_BINDLESS_COUNT: u32 = 4096;

#[derive(Debug)]
struct Slots {
    capacity: u32,
    next: u32,
    free: Vec<u32>,
}

/// Owns a bindless descriptor set and hands out slots in its texture array.
///
/// Every descriptor update goes through this table and is performed with its lock held, since the loader's
/// coordinator and the caller may both write to the same set.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct BindlessTable<D: Device> {
    #[derivative(Debug = "ignore")]
    device: Arc<D>,
    #[derivative(Debug = "ignore")]
    set: D::BindlessSet,
    slots: Mutex<Slots>,
}

impl<D: Device> BindlessTable<D> {
    /// Wrap a bindless descriptor set so that `capacity` array elements can be allocated from it.
    pub fn new(device: Arc<D>, set: D::BindlessSet, capacity: u32) -> Self {
        Self {
            device,
            set,
            slots: Mutex::new(Slots {
                capacity,
                next: 0,
                free: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `count` slots. Either all slots are reserved or none are.
    /// # Errors
    /// * Fails with [`Error::BindlessExhausted`] if fewer than `count` slots are available.
    pub fn reserve(&self, count: u32) -> Result<Vec<u32>> {
        let mut slots = self.lock();
        let fresh = slots.capacity - slots.next;
        if (slots.free.len() as u32).saturating_add(fresh) < count {
            return Err(Error::BindlessExhausted(count).into());
        }

        let mut reserved = Vec::with_capacity(count as usize);
        while reserved.len() < count as usize {
            match slots.free.pop() {
                Some(slot) => reserved.push(slot),
                None => {
                    reserved.push(slots.next);
                    slots.next += 1;
                }
            }
        }
        Ok(reserved)
    }

    /// Return a slot to the table. The descriptor keeps pointing at its last image until the slot is reused.
    pub fn release(&self, slot: u32) {
        let mut slots = self.lock();
        debug_assert!(slot < slots.next && !slots.free.contains(&slot), "double release of bindless slot {slot}");
        slots.free.push(slot);
    }

    /// Point slots at images.
    pub fn write(&self, writes: &[(u32, &D::Image)]) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let _slots = self.lock();
        self.device.write_bindless_textures(&self.set, writes)
    }

    /// Number of slots that can still be reserved.
    pub fn available(&self) -> u32 {
        let slots = self.lock();
        slots.free.len() as u32 + (slots.capacity - slots.next)
    }

    /// The wrapped descriptor set, to bind when rendering.
    pub fn descriptor_set(&self) -> &D::BindlessSet {
        &self.set
    }
}
