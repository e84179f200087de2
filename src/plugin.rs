use crate::{
    cache::TileCache,
    config::TileCachePluginConfig,
    diagnostics::{collect_caches, CacheReport},
    producer::TileProducer,
    storage::GpuTileLayers,
    task::{Scheduler, TaskPoolScheduler},
};
use bevy::prelude::*;
use std::sync::Arc;

/// The scheduler running the tasks of all caches created for this app.
#[derive(Resource, Clone, Deref)]
pub struct TileScheduler(pub Arc<TaskPoolScheduler>);

impl TileScheduler {
    /// The scheduler as passed to new caches.
    pub fn shared(&self) -> Option<Arc<dyn Scheduler>> {
        Some(self.0.clone())
    }
}

/// The caches reported by [`log_tile_caches`].
#[derive(Resource, Default)]
pub struct TileCaches {
    caches: Vec<Arc<TileCache>>,
}

impl TileCaches {
    pub fn register(&mut self, cache: Arc<TileCache>) {
        if !self.caches.iter().any(|known| Arc::ptr_eq(known, &cache)) {
            self.caches.push(cache);
        }
    }

    /// Registers all caches of the producer graph.
    pub fn register_producer(&mut self, producer: &dyn TileProducer) {
        for cache in collect_caches(producer) {
            self.register(cache);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TileCache>> {
        self.caches.iter()
    }

    pub fn reports(&self) -> Vec<CacheReport> {
        self.caches.iter().map(|cache| cache.report()).collect()
    }
}

/// The array textures the layers of gpu caches are uploaded to.
#[derive(Resource, Default)]
pub struct TileLayerTextures {
    textures: Vec<(GpuTileLayers, Handle<Image>)>,
}

impl TileLayerTextures {
    /// Creates the array texture for the layers and returns its handle.
    pub fn register(&mut self, layers: GpuTileLayers, images: &mut Assets<Image>) -> Handle<Image> {
        let handle = images.add(layers.create_image());
        self.textures.push((layers, handle.clone()));
        handle
    }
}

/// Runs the tile tasks of the [`TileScheduler`] on the async compute task pool
/// and reports the occupancy of the [`TileCaches`].
#[derive(Default)]
pub struct TileCachePlugin {
    pub config: TileCachePluginConfig,
}

impl Plugin for TileCachePlugin {
    fn build(&self, app: &mut App) {
        let scheduler = TaskPoolScheduler::from_config(&self.config.scheduler);

        app.insert_resource(self.config.clone())
            .insert_resource(TileScheduler(Arc::new(scheduler)))
            .init_resource::<TileCaches>()
            .init_resource::<TileLayerTextures>()
            .add_systems(
                Last,
                (
                    update_tile_scheduler,
                    upload_tile_layers.after(update_tile_scheduler),
                    log_tile_caches.after(update_tile_scheduler),
                ),
            );
    }
}

pub fn update_tile_scheduler(scheduler: Res<TileScheduler>) {
    let finished = scheduler.update();

    if finished > 0 {
        debug!(
            "Finished {finished} tile tasks, {} running, {} pending.",
            scheduler.in_flight_count(),
            scheduler.pending_count()
        );
    }
}

pub fn upload_tile_layers(
    textures: Res<TileLayerTextures>,
    images: Option<ResMut<Assets<Image>>>,
) {
    let Some(mut images) = images else {
        return;
    };

    for (layers, handle) in &textures.textures {
        if let Some(image) = images.get_mut(handle) {
            layers.apply_writes(image);
        }
    }
}

pub fn log_tile_caches(
    config: Res<TileCachePluginConfig>,
    caches: Res<TileCaches>,
    mut frame: Local<u32>,
) {
    if config.report_interval == 0 {
        return;
    }

    *frame += 1;

    if *frame % config.report_interval == 0 {
        for report in caches.reports() {
            info!("{report}");
        }
    }
}
