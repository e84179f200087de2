//! This crate provides the tile production and caching core of a streaming terrain
//! for the Bevy Engine.
//!
//! # Background
//! A large terrain is subdivided into a quadtree, whose nodes (tiles) carry different kinds
//! of data, like elevation, normals or imagery.
//! Only a small fraction of these tiles can be kept in memory at once, so they have to be
//! produced on demand, depending on the positions of the viewers, and reclaimed once they
//! are no longer needed.
//!
//! ## How are tiles stored?
//! A [`TileStorage`](storage::TileStorage) is a fixed capacity pool of slots, each holding the
//! payload of a single tile, either in cpu memory or in a layer of a gpu array texture.
//! See the [`storage`] module for more information.
//!
//! ## How are tiles produced?
//! A [`TileProducer`](producer::TileProducer) knows how to compute one kind of tile.
//! It creates a [`Task`](task::Task) per tile, which is run asynchronously by a
//! [`Scheduler`](task::Scheduler) and may depend on tiles of other producers.
//! See the [`producer`] and [`task`] modules for more information.
//!
//! ## How are tiles cached?
//! The [`TileCache`](cache::TileCache) shares one storage among several producers.
//! It reference counts the tiles in use, keeps released tiles around in least-recently-unused
//! order until their slots are needed, and reuses the tasks of evicted tiles when they are
//! requested again.
//! See the [`cache`] module for more information.

pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod plugin;
pub mod producer;
pub mod storage;
pub mod task;

pub use crate::plugin::TileCachePlugin;

#[allow(missing_docs)]
pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        cache::{ProducerId, TileCache, TileHandle, TileId, TileInfo, TileKey},
        config::{SchedulerConfig, StorageConfig, TileCacheConfig, TileCachePluginConfig},
        diagnostics::{collect_caches, CacheReport},
        error::{ConfigError, TaskError},
        plugin::{TileCaches, TileLayerTextures, TileScheduler},
        producer::{ElevationProducer, NormalProducer, TileLayout, TileProducer},
        storage::{
            CpuTileBuffers, CpuTileStorage, GpuTileLayers, GpuTileStorage, Slot, StorageMedium,
            TileFormat, TileStorage,
        },
        task::{Deadline, Scheduler, Task, TaskPoolScheduler, TaskReason},
        TileCachePlugin,
    };
}
