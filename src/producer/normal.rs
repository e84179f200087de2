use crate::{
    cache::{ProducerId, TileCache, TileId, TileKey},
    error::TaskError,
    producer::{ElevationProducer, TileProducer},
    storage::{GpuTileLayers, Slot, TileFormat},
    task::{Deadline, Task},
};
use anyhow::{anyhow, Result};
use bevy::math::Vec3;
use std::sync::{Arc, Weak};

/// Produces RGBA8 normal tiles into gpu layers, derived from the tiles of an [`ElevationProducer`].
///
/// The elevation tiles usually live in a different (cpu) cache than the normal tiles.
pub struct NormalProducer {
    this: Weak<Self>,
    id: ProducerId,
    name: String,
    cache: Arc<TileCache>,
    layers: GpuTileLayers,
    elevation: Arc<ElevationProducer>,
}

impl NormalProducer {
    pub fn new(
        name: impl Into<String>,
        cache: Arc<TileCache>,
        layers: GpuTileLayers,
        elevation: Arc<ElevationProducer>,
    ) -> Arc<Self> {
        assert_eq!(layers.format(), TileFormat::Rgba8);
        assert_eq!(
            layers.tile_size(),
            elevation.tile_size(),
            "Normal and elevation tiles have to be of the same size."
        );

        Arc::new_cyclic(|this: &Weak<Self>| Self {
            this: this.clone(),
            id: cache.register_producer(this.clone()),
            name: name.into(),
            cache,
            layers,
            elevation,
        })
    }

    pub fn layers(&self) -> &GpuTileLayers {
        &self.layers
    }

    fn compute(&self, task: &Task, tile: TileId, slot: Slot) -> Result<()> {
        let Some(handle) = self
            .elevation
            .get_tile(tile.level, tile.tx, tile.ty, task.deadline())
        else {
            return Err(TaskError::CacheSaturated {
                tile: TileKey::new(self.elevation.id(), tile),
            }
            .into());
        };

        task.set_dependencies(vec![handle.task().clone()]);

        if !handle.is_ready() {
            if let Some(scheduler) = self.elevation.cache().scheduler() {
                scheduler.schedule(handle.task().clone(), task.deadline());
            }

            return Err(TaskError::DependencyNotReady {
                task: task.label().to_string(),
                dependency: handle.key(),
            }
            .into());
        }

        let step = self
            .elevation
            .layout()
            .geometry(self.elevation.tile_size(), tile)
            .step as f32;

        let pixels = {
            let heights = self.elevation.buffers().read(handle.slot());
            let (height, width) = heights.dim();

            heights
                .indexed_iter()
                .map(|((y, x), _)| {
                    let (left, right) = (x.saturating_sub(1), (x + 1).min(width - 1));
                    let (top, bottom) = (y.saturating_sub(1), (y + 1).min(height - 1));

                    let dx = (heights[[y, right]] - heights[[y, left]])
                        / ((right - left).max(1) as f32 * step);
                    let dy = (heights[[bottom, x]] - heights[[top, x]])
                        / ((bottom - top).max(1) as f32 * step);

                    encode_normal(Vec3::new(-dx, 1.0, -dy).normalize())
                })
                .collect::<Vec<_>>()
        };

        self.layers
            .write(slot, bytemuck::cast_slice(&pixels).to_vec());

        Ok(())
    }
}

impl TileProducer for NormalProducer {
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
        self.layers.tile_size()
    }

    fn border(&self) -> u32 {
        self.elevation.border()
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

        if let Some(handle) = self.elevation.get_tile(level, tx, ty, deadline) {
            task.set_dependencies(vec![handle.task().clone()]);
        }

        task
    }

    fn sources(&self) -> Vec<Arc<dyn TileProducer>> {
        vec![self.elevation.clone() as Arc<dyn TileProducer>]
    }
}

/// Maps each component from [-1, 1] to [0, 255].
fn encode_normal(normal: Vec3) -> [u8; 4] {
    let [x, y, z] = ((normal * 0.5 + 0.5) * 255.0).round().to_array().map(|value| value as u8);

    [x, y, z, 255]
}
