use crate::{
    cache::{ProducerId, TileCache, TileId, TileKey},
    error::TaskError,
    producer::{TileLayout, TileProducer},
    storage::{CpuTileBuffers, Slot},
    task::{Deadline, Task},
};
use anyhow::{anyhow, Result};
use bevy::math::DVec2;
use ndarray::Array2;
use std::sync::{Arc, Weak};

/// Returns the height at a world position for the given level.
pub type HeightFunction = dyn Fn(DVec2, u32) -> f32 + Send + Sync;

/// Produces `f32` elevation tiles into a cpu storage.
///
/// In direct mode every tile is sampled from the base function.
/// In refined mode only the root is sampled from the base function, while deeper tiles
/// upsample their parent tile and add the residual of their level.
/// The parent is requested from the same cache, so refined tiles depend on the task of their parent.
pub struct ElevationProducer {
    this: Weak<Self>,
    id: ProducerId,
    name: String,
    cache: Arc<TileCache>,
    buffers: CpuTileBuffers<f32>,
    layout: TileLayout,
    base: Box<HeightFunction>,
    residual: Option<Box<HeightFunction>>,
}

impl ElevationProducer {
    pub fn direct(
        name: impl Into<String>,
        cache: Arc<TileCache>,
        buffers: CpuTileBuffers<f32>,
        layout: TileLayout,
        base: impl Fn(DVec2, u32) -> f32 + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::build(name.into(), cache, buffers, layout, Box::new(base), None)
    }

    pub fn refined(
        name: impl Into<String>,
        cache: Arc<TileCache>,
        buffers: CpuTileBuffers<f32>,
        layout: TileLayout,
        base: impl Fn(DVec2, u32) -> f32 + Send + Sync + 'static,
        residual: impl Fn(DVec2, u32) -> f32 + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::build(
            name.into(),
            cache,
            buffers,
            layout,
            Box::new(base),
            Some(Box::new(residual)),
        )
    }

    fn build(
        name: String,
        cache: Arc<TileCache>,
        buffers: CpuTileBuffers<f32>,
        layout: TileLayout,
        base: Box<HeightFunction>,
        residual: Option<Box<HeightFunction>>,
    ) -> Arc<Self> {
        assert!(
            buffers.tile_size() > 2 * layout.border,
            "The tiles of {name} are smaller than their borders."
        );

        Arc::new_cyclic(|this: &Weak<Self>| Self {
            this: this.clone(),
            id: cache.register_producer(this.clone()),
            name,
            cache,
            buffers,
            layout,
            base,
            residual,
        })
    }

    pub fn buffers(&self) -> &CpuTileBuffers<f32> {
        &self.buffers
    }

    pub fn layout(&self) -> TileLayout {
        self.layout
    }

    /// The parent a tile is upsampled from in refined mode.
    fn refined_parent(&self, tile: TileId) -> Option<TileId> {
        tile.parent().filter(|_| self.residual.is_some())
    }

    fn compute(&self, task: &Task, tile: TileId, slot: Slot) -> Result<()> {
        let size = self.buffers.tile_size() as usize;
        let geometry = self.layout.geometry(self.buffers.tile_size(), tile);

        let values = match (&self.residual, tile.parent()) {
            (Some(residual), Some(parent)) => {
                let Some(handle) = self.get_tile(parent.level, parent.tx, parent.ty, task.deadline())
                else {
                    return Err(TaskError::CacheSaturated {
                        tile: TileKey::new(self.id, parent),
                    }
                    .into());
                };

                // the parent may have been recreated since this task was created
                task.set_dependencies(vec![handle.task().clone()]);

                if !handle.is_ready() {
                    if let Some(scheduler) = self.cache.scheduler() {
                        scheduler.schedule(handle.task().clone(), task.deadline());
                    }

                    return Err(TaskError::DependencyNotReady {
                        task: task.label().to_string(),
                        dependency: handle.key(),
                    }
                    .into());
                }

                let parent_geometry = self.layout.geometry(self.buffers.tile_size(), parent);
                let parent_values = self.buffers.read(handle.slot());

                Array2::from_shape_fn((size, size), |(y, x)| {
                    let position = geometry.position(x, y);
                    let texel = parent_geometry.texel(position);

                    sample_bilinear(&parent_values, texel) + residual(position, tile.level)
                })
            }
            _ => Array2::from_shape_fn((size, size), |(y, x)| {
                (self.base)(geometry.position(x, y), tile.level)
            }),
        };

        self.buffers.write(slot).assign(&values);

        Ok(())
    }
}

impl TileProducer for ElevationProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn tile_size(&self) -> u32 {
        self.buffers.tile_size()
    }

    fn border(&self) -> u32 {
        self.layout.border
    }

    fn create_tile(
        &self,
        level: u32,
        tx: u32,
        ty: u32,
        slot: Slot,
        deadline: Deadline,
        reuse: Option<Arc<Task>>,
    ) -> Arc<Task> {
        let tile = TileId::new(level, tx, ty);

        let task = reuse.unwrap_or_else(|| {
            let this = self.this.clone();

            Task::new(format!("{} {tile}", self.name), slot, move |task, slot| {
                let producer = this
                    .upgrade()
                    .ok_or_else(|| anyhow!("The producer of {} was dropped.", task.label()))?;

                producer.compute(task, tile, slot)
            })
        });

        if let Some(parent) = self.refined_parent(tile) {
            // the handle is only needed to depend on the task of the parent
            if let Some(handle) = self.get_tile(parent.level, parent.tx, parent.ty, deadline) {
                task.set_dependencies(vec![handle.task().clone()]);
            }
        }

        task
    }
}

/// Samples the values at a continuous pixel coordinate, clamped to the edge pixels.
fn sample_bilinear(values: &Array2<f32>, texel: DVec2) -> f32 {
    let (height, width) = values.dim();
    let texel = texel.clamp(
        DVec2::ZERO,
        DVec2::new(width as f64 - 1.0, height as f64 - 1.0),
    );

    let (x0, y0) = (texel.x.floor() as usize, texel.y.floor() as usize);
    let (x1, y1) = ((x0 + 1).min(width - 1), (y0 + 1).min(height - 1));
    let (fx, fy) = ((texel.x - x0 as f64) as f32, (texel.y - y0 as f64) as f32);

    let top = values[[y0, x0]] * (1.0 - fx) + values[[y0, x1]] * fx;
    let bottom = values[[y1, x0]] * (1.0 - fx) + values[[y1, x1]] * fx;

    top * (1.0 - fy) + bottom * fy
}
