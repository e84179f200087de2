use crate::{cache::TileCache, producer::TileProducer, storage::StorageMedium};
use derive_more::derive::Display;
use std::sync::Arc;

/// A snapshot of the occupancy of a [`TileCache`].
#[derive(Clone, Debug, PartialEq, Eq, Display)]
#[display(
    "{name} ({medium}): {used} used, {unused} unused, {free_slots}/{capacity} slots free, {deleted_tasks} preserved tasks"
)]
pub struct CacheReport {
    pub name: String,
    pub medium: StorageMedium,
    pub capacity: u32,
    pub used: usize,
    pub unused: usize,
    pub free_slots: u32,
    pub deleted_tasks: usize,
}

/// Returns every cache used by the producer or any of its sources, each one only once.
pub fn collect_caches(producer: &dyn TileProducer) -> Vec<Arc<TileCache>> {
    let mut caches = Vec::new();
    visit(producer, &mut caches);
    caches
}

fn visit(producer: &dyn TileProducer, caches: &mut Vec<Arc<TileCache>>) {
    let cache = producer.cache();

    if !caches.iter().any(|visited| Arc::ptr_eq(visited, cache)) {
        caches.push(cache.clone());
    }

    for source in producer.sources() {
        visit(source.as_ref(), caches);
    }
}
