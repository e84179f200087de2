use crate::{
    config::{StorageConfig, TileCacheConfig},
    error::ConfigError,
    storage::{Slot, SlotPool, StorageMedium, TileStorage},
};
use bevy::{
    asset::RenderAssetUsages,
    image::Image,
    prelude::default,
    render::render_resource::{Extent3d, TextureDimension, TextureFormat},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{mem, sync::Arc};

/// The texel format of the layers of a [`GpuTileStorage`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TileFormat {
    /// Four  channels  8 bit
    Rgba8,
    /// One   channel  16 bit
    R16,
    /// Two   channels 16 bit
    Rg16,
    /// One   channel  32 bit float
    R32F,
}

impl TileFormat {
    pub fn render_format(self) -> TextureFormat {
        match self {
            TileFormat::Rgba8 => TextureFormat::Rgba8Unorm,
            TileFormat::R16 => TextureFormat::R16Unorm,
            TileFormat::Rg16 => TextureFormat::Rg16Unorm,
            TileFormat::R32F => TextureFormat::R32Float,
        }
    }

    pub fn pixel_size(self) -> u32 {
        match self {
            TileFormat::Rgba8 => 4,
            TileFormat::R16 => 2,
            TileFormat::Rg16 => 4,
            TileFormat::R32F => 4,
        }
    }
}

/// A pending upload of the payload of one slot into its texture layer.
#[derive(Clone, Debug)]
pub struct LayerWrite {
    pub layer: u32,
    pub data: Vec<u8>,
}

/// Shared access to the layers of a [`GpuTileStorage`].
///
/// Producers queue the payload of their slots here. The renderer owns the array texture
/// and applies the queued writes once per frame.
#[derive(Clone)]
pub struct GpuTileLayers {
    tile_size: u32,
    layer_count: u32,
    format: TileFormat,
    writes: Arc<Mutex<Vec<LayerWrite>>>,
}

impl GpuTileLayers {
    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn format(&self) -> TileFormat {
        self.format
    }

    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    /// The size of a single layer in bytes.
    pub fn layer_size(&self) -> usize {
        (self.tile_size * self.tile_size * self.format.pixel_size()) as usize
    }

    /// Queues the payload of the slot for upload.
    pub fn write(&self, slot: Slot, data: Vec<u8>) {
        assert_eq!(
            data.len(),
            self.layer_size(),
            "Layer data does not match the tile size and format."
        );

        self.writes.lock().push(LayerWrite {
            layer: slot.index(),
            data,
        });
    }

    pub fn take_writes(&self) -> Vec<LayerWrite> {
        mem::take(&mut *self.writes.lock())
    }

    /// Creates the array texture backing the layers, with one layer per slot.
    pub fn create_image(&self) -> Image {
        Image::new_fill(
            Extent3d {
                width: self.tile_size,
                height: self.tile_size,
                depth_or_array_layers: self.layer_count,
            },
            TextureDimension::D2,
            &vec![0; self.format.pixel_size() as usize],
            self.format.render_format(),
            RenderAssetUsages::default(),
        )
    }

    /// Copies all queued writes into the array texture and returns how many were applied.
    pub fn apply_writes(&self, image: &mut Image) -> usize {
        let layer_size = self.layer_size();
        let writes = self.take_writes();

        for write in &writes {
            let start = write.layer as usize * layer_size;
            image.data[start..start + layer_size].copy_from_slice(&write.data);
        }

        writes.len()
    }
}

/// A storage of `capacity` layers of an array texture.
pub struct GpuTileStorage {
    pool: SlotPool,
    layers: GpuTileLayers,
}

impl GpuTileStorage {
    pub fn new(tile_size: u32, format: TileFormat, capacity: u32) -> Self {
        Self {
            pool: SlotPool::new(capacity),
            layers: GpuTileLayers {
                tile_size,
                layer_count: capacity,
                format,
                writes: default(),
            },
        }
    }

    pub fn from_config(config: &TileCacheConfig) -> Result<Self, ConfigError> {
        match config.storage {
            StorageConfig::Gpu { tile_size, format } => {
                Ok(Self::new(tile_size, format, config.capacity))
            }
            StorageConfig::Cpu { .. } => Err(ConfigError::Invalid(format!(
                "cache {} is not configured for gpu storage",
                config.name
            ))),
        }
    }

    pub fn layers(&self) -> GpuTileLayers {
        self.layers.clone()
    }
}

impl TileStorage for GpuTileStorage {
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
        StorageMedium::Gpu
    }
}
