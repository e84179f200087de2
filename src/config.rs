use crate::{
    cache::TileCache,
    error::ConfigError,
    storage::{CpuTileBuffers, CpuTileStorage, GpuTileLayers, GpuTileStorage, TileFormat},
    task::Scheduler,
};
use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, sync::Arc};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// The maximum count of tasks running at the same time.
    pub max_in_flight: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_in_flight: 64 }
    }
}

/// The medium and layout of the slots of a cache.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StorageConfig {
    Cpu { tile_size: u32 },
    Gpu { tile_size: u32, format: TileFormat },
}

/// The configuration of a single [`TileCache`] and its storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileCacheConfig {
    /// The label used in log messages.
    pub name: String,
    /// The count of slots of the storage.
    pub capacity: u32,
    pub storage: StorageConfig,
}

impl TileCacheConfig {
    pub fn from_ron(source: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let source = fs::read_to_string(path)?;
        Self::from_ron(&source)
    }

    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let source = ron::ser::to_string_pretty(self, default())?;
        fs::write(path, source)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid(format!(
                "cache {} needs at least one slot",
                self.name
            )));
        }

        if self.tile_size() == 0 {
            return Err(ConfigError::Invalid(format!(
                "the tiles of cache {} are empty",
                self.name
            )));
        }

        Ok(())
    }

    pub fn tile_size(&self) -> u32 {
        match self.storage {
            StorageConfig::Cpu { tile_size } | StorageConfig::Gpu { tile_size, .. } => tile_size,
        }
    }

    /// Creates a cache with a cpu storage and returns it together with the tile buffers.
    pub fn build_cpu<T: Clone + Default + Send + Sync + 'static>(
        &self,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Result<(Arc<TileCache>, CpuTileBuffers<T>), ConfigError> {
        self.validate()?;

        let storage = CpuTileStorage::<T>::from_config(self)?;
        let buffers = storage.buffers();

        Ok((TileCache::new(&self.name, storage, scheduler), buffers))
    }

    /// Creates a cache with a gpu storage and returns it together with the layers.
    pub fn build_gpu(
        &self,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Result<(Arc<TileCache>, GpuTileLayers), ConfigError> {
        self.validate()?;

        let storage = GpuTileStorage::from_config(self)?;
        let layers = storage.layers();

        Ok((TileCache::new(&self.name, storage, scheduler), layers))
    }
}

/// The configuration of the [`TileCachePlugin`](crate::TileCachePlugin).
#[derive(Resource, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileCachePluginConfig {
    pub scheduler: SchedulerConfig,
    /// The count of frames between two occupancy reports of the registered caches.
    /// Reports are disabled if this is zero.
    pub report_interval: u32,
}

impl Default for TileCachePluginConfig {
    fn default() -> Self {
        Self {
            scheduler: default(),
            report_interval: 600,
        }
    }
}

impl TileCachePluginConfig {
    pub fn from_ron(source: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(source)?)
    }
}
