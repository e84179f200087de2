//! Fixed capacity pools of interchangeable tile buffers.
//!
//! A [`TileStorage`] owns a fixed number of [`Slot`]s, each able to hold the payload of
//! exactly one tile. The storage medium is irrelevant to the [`TileCache`](crate::cache::TileCache),
//! which only ever hands out and reclaims slots.
//! Producers write the payload through the shared buffer handles of the concrete storages
//! ([`CpuTileBuffers`] and [`GpuTileLayers`]), addressed by the slot index.

mod cpu_storage;
mod gpu_storage;

pub use cpu_storage::{CpuTileBuffers, CpuTileStorage};
pub use gpu_storage::{GpuTileLayers, GpuTileStorage, LayerWrite, TileFormat};

use derive_more::derive::Display;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One unit of storage capacity, able to hold the payload of a single tile.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Display)]
#[display("slot {index}")]
pub struct Slot {
    index: u32,
}

impl Slot {
    /// The index of the buffer or texture layer backing this slot.
    pub fn index(self) -> u32 {
        self.index
    }
}

/// The medium the slots of a storage live in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Display, Serialize, Deserialize)]
pub enum StorageMedium {
    Cpu,
    Gpu,
}

/// A fixed capacity pool of [`Slot`]s.
pub trait TileStorage: Send + 'static {
    /// Returns a free slot or `None` if all slots are in use.
    fn new_slot(&mut self) -> Option<Slot>;
    /// Returns the slot to the free pool.
    fn delete_slot(&mut self, slot: Slot);
    fn capacity(&self) -> u32;
    fn free_slot_count(&self) -> u32;
    fn medium(&self) -> StorageMedium;
}

/// The bookkeeping of free and allocated slot indices shared by all storages.
pub struct SlotPool {
    free: VecDeque<u32>,
    allocated: Vec<bool>,
}

impl SlotPool {
    pub fn new(capacity: u32) -> Self {
        Self {
            free: (0..capacity).collect(),
            allocated: vec![false; capacity as usize],
        }
    }

    pub fn allocate(&mut self) -> Option<Slot> {
        let index = self.free.pop_front()?;
        self.allocated[index as usize] = true;

        Some(Slot { index })
    }

    pub fn free(&mut self, slot: Slot) {
        let allocated = self
            .allocated
            .get_mut(slot.index as usize)
            .expect("Tried freeing a slot of another storage.");
        assert!(*allocated, "Tried freeing {slot}, which is not allocated.");

        *allocated = false;
        self.free.push_back(slot.index);
    }

    pub fn capacity(&self) -> u32 {
        self.allocated.len() as u32
    }

    pub fn free_count(&self) -> u32 {
        self.free.len() as u32
    }
}
