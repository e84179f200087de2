//! Producers create the tasks that compute the payload of their tiles.
//!
//! Each producer is registered with exactly one [`TileCache`] under a [`ProducerId`].
//! The cache only knows producers through the [`TileProducer`] trait.
//! Producers may read tiles of other producers (see [`TileProducer::sources`]), even ones
//! stored in different caches, which forms a producer graph.

mod elevation;
mod normal;

pub use elevation::{ElevationProducer, HeightFunction};
pub use normal::NormalProducer;

use crate::{
    cache::{ProducerId, TileCache, TileHandle, TileId, TileInfo},
    storage::Slot,
    task::{Deadline, Task},
};
use bevy::math::DVec2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub trait TileProducer: Send + Sync + 'static {
    fn id(&self) -> ProducerId;

    /// The cache storing the tiles of this producer.
    fn cache(&self) -> &Arc<TileCache>;

    fn name(&self) -> &str;

    /// The side length of the produced tiles in pixels, including borders.
    fn tile_size(&self) -> u32;

    /// The count of pixels each tile overlaps with its neighbours on every side.
    fn border(&self) -> u32 {
        0
    }

    fn has_tile(&self, level: u32, tx: u32, ty: u32) -> bool {
        level < u32::BITS && tx < TileId::count(level) && ty < TileId::count(level)
    }

    /// Creates the task computing the tile into the slot.
    ///
    /// If `reuse` is passed, it is the task of this tile from before it was evicted.
    /// It has already been attached to the new slot and should be returned again.
    fn create_tile(
        &self,
        level: u32,
        tx: u32,
        ty: u32,
        slot: Slot,
        deadline: Deadline,
        reuse: Option<Arc<Task>>,
    ) -> Arc<Task>;

    /// The producers whose tiles are read by the tasks of this producer.
    fn sources(&self) -> Vec<Arc<dyn TileProducer>> {
        Vec::new()
    }

    fn get_tile(&self, level: u32, tx: u32, ty: u32, deadline: Deadline) -> Option<TileHandle> {
        self.cache().get_tile(self.id(), level, tx, ty, deadline)
    }

    /// Acquires the tile and schedules its task, if it is not done yet.
    fn request_tile(
        &self,
        level: u32,
        tx: u32,
        ty: u32,
        deadline: Deadline,
    ) -> Option<TileHandle> {
        let handle = self.get_tile(level, tx, ty, deadline)?;

        if !handle.is_ready() {
            if let Some(scheduler) = self.cache().scheduler() {
                scheduler.schedule(handle.task().clone(), deadline);
            }
        }

        Some(handle)
    }

    fn find_tile(&self, level: u32, tx: u32, ty: u32, include_cache: bool) -> Option<TileInfo> {
        self.cache()
            .find_tile(self.id(), level, tx, ty, include_cache)
    }

    fn prefetch_tile(&self, level: u32, tx: u32, ty: u32) -> Option<Arc<Task>> {
        self.cache().prefetch_tile(self.id(), level, tx, ty)
    }

    fn invalidate_tiles(&self) {
        self.cache().invalidate_tiles(self.id());
    }
}

/// The extent of the quadtree and the overlap of its tiles.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileLayout {
    /// The side length of the root tile in world units, centered at the origin.
    pub root_size: f64,
    /// The count of pixels each tile overlaps with its neighbours on every side.
    pub border: u32,
}

impl TileLayout {
    pub fn geometry(&self, tile_size: u32, tile: TileId) -> TileGeometry {
        let tile_world_size = self.root_size / TileId::count(tile.level) as f64;
        let step = tile_world_size / (tile_size - 2 * self.border) as f64;

        let corner = DVec2::new(tile.tx as f64, tile.ty as f64) * tile_world_size
            - DVec2::splat(self.root_size / 2.0);

        TileGeometry {
            origin: corner + DVec2::splat((0.5 - self.border as f64) * step),
            step,
        }
    }
}

/// Maps the pixels of one tile to world positions.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TileGeometry {
    /// The world position of the center of the pixel (0, 0).
    pub origin: DVec2,
    /// The world distance between neighbouring pixels.
    pub step: f64,
}

impl TileGeometry {
    pub fn position(&self, x: usize, y: usize) -> DVec2 {
        self.origin + DVec2::new(x as f64, y as f64) * self.step
    }

    /// The continuous pixel coordinate of the world position.
    pub fn texel(&self, position: DVec2) -> DVec2 {
        (position - self.origin) / self.step
    }
}
