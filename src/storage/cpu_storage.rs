use crate::{
    config::{StorageConfig, TileCacheConfig},
    error::ConfigError,
    storage::{Slot, SlotPool, StorageMedium, TileStorage},
};
use ndarray::Array2;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// Shared access to the tile buffers of a [`CpuTileStorage`].
///
/// Producers keep a clone of this to read and write the payload of their slots,
/// while the storage itself is owned by the cache.
pub struct CpuTileBuffers<T> {
    buffers: Arc<[RwLock<Array2<T>>]>,
    tile_size: u32,
}

impl<T> Clone for CpuTileBuffers<T> {
    fn clone(&self) -> Self {
        Self {
            buffers: self.buffers.clone(),
            tile_size: self.tile_size,
        }
    }
}

impl<T> CpuTileBuffers<T> {
    /// The side length of each tile buffer, including borders.
    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn read(&self, slot: Slot) -> RwLockReadGuard<'_, Array2<T>> {
        self.buffers[slot.index() as usize].read()
    }

    pub fn write(&self, slot: Slot) -> RwLockWriteGuard<'_, Array2<T>> {
        self.buffers[slot.index() as usize].write()
    }
}

/// A storage of `capacity` square CPU arrays with `tile_size` elements per side.
pub struct CpuTileStorage<T> {
    pool: SlotPool,
    buffers: CpuTileBuffers<T>,
}

impl<T: Clone + Default> CpuTileStorage<T> {
    pub fn new(tile_size: u32, capacity: u32) -> Self {
        let buffers = (0..capacity)
            .map(|_| RwLock::new(Array2::default((tile_size as usize, tile_size as usize))))
            .collect();

        Self {
            pool: SlotPool::new(capacity),
            buffers: CpuTileBuffers { buffers, tile_size },
        }
    }

    pub fn from_config(config: &TileCacheConfig) -> Result<Self, ConfigError> {
        match config.storage {
            StorageConfig::Cpu { tile_size } => Ok(Self::new(tile_size, config.capacity)),
            StorageConfig::Gpu { .. } => Err(ConfigError::Invalid(format!(
                "cache {} is not configured for cpu storage",
                config.name
            ))),
        }
    }
}

impl<T> CpuTileStorage<T> {
    pub fn buffers(&self) -> CpuTileBuffers<T> {
        self.buffers.clone()
    }
}

impl<T: Send + Sync + 'static> TileStorage for CpuTileStorage<T> {
    fn new_slot(&mut self) -> Option<Slot> {
        self.pool.allocate()
    }

    fn delete_slot(&mut self, slot: Slot) {
        self.pool.free(slot);
    }

    fn capacity(&self) -> u32 {
        self.pool.capacity()
    }

    fn free_slot_count(&self) -> u32 {
        self.pool.free_count()
    }

    fn medium(&self) -> StorageMedium {
        StorageMedium::Cpu
    }
}
