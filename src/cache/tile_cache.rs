use crate::{
    cache::{lru::LruList, ProducerId, Tile, TileHandle, TileId, TileInfo, TileKey},
    diagnostics::CacheReport,
    producer::TileProducer,
    storage::{Slot, StorageMedium, TileStorage},
    task::{Deadline, Scheduler, Task, TaskReason},
};
use bevy::{
    log::{debug, info, warn},
    prelude::default,
    utils::HashMap,
};
use itertools::Itertools;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::{
    cell::RefCell,
    ptr, thread,
    sync::{Arc, Weak},
};

struct UnusedTile {
    tile: Tile,
    /// The position of the tile in the least-recently-unused order.
    position: usize,
}

/// Where a newly created tile is inserted.
#[derive(Copy, Clone, PartialEq, Eq)]
enum Insert {
    Used,
    Unused,
}

struct CacheState {
    storage: Box<dyn TileStorage>,
    producers: Vec<Weak<dyn TileProducer>>,
    used_tiles: HashMap<TileKey, Tile>,
    unused_tiles: HashMap<TileKey, UnusedTile>,
    unused_order: LruList<TileKey>,
    /// The tasks of evicted tiles, which can be reused as long as someone else keeps them alive.
    deleted_tasks: HashMap<TileKey, Weak<Task>>,
}

impl CacheState {
    fn producer(&self, producer: ProducerId) -> &Weak<dyn TileProducer> {
        self.producers
            .get(producer.index())
            .unwrap_or_else(|| panic!("Unknown producer {producer}."))
    }

    fn contains(&self, key: TileKey) -> bool {
        self.used_tiles.contains_key(&key) || self.unused_tiles.contains_key(&key)
    }

    fn find(&self, key: TileKey, include_cache: bool) -> Option<&Tile> {
        self.used_tiles.get(&key).or_else(|| {
            self.unused_tiles
                .get(&key)
                .filter(|_| include_cache)
                .map(|unused| &unused.tile)
        })
    }

    /// Adds a user to a present tile and returns its slot, task and previous user count.
    fn acquire(&mut self, key: TileKey) -> Option<(Slot, Arc<Task>, u32)> {
        if let Some(tile) = self.used_tiles.get_mut(&key) {
            let previous_users = tile.users;
            tile.users += 1;

            return Some((tile.slot, tile.task.clone(), previous_users));
        }

        let UnusedTile { mut tile, position } = self.unused_tiles.remove(&key)?;
        self.unused_order.remove(position);

        tile.users = 1;
        let acquired = (tile.slot, tile.task.clone(), 0);
        self.used_tiles.insert(key, tile);

        Some(acquired)
    }

    fn release(&mut self, key: TileKey) -> u32 {
        let users = {
            let tile = self
                .used_tiles
                .get_mut(&key)
                .unwrap_or_else(|| panic!("Tried releasing tile {key}, which is not in use."));

            tile.users -= 1;
            tile.users
        };

        if users == 0 {
            if let Some(tile) = self.used_tiles.remove(&key) {
                self.push_unused(tile);
            }
        }

        users
    }

    fn push_unused(&mut self, tile: Tile) {
        let position = self.unused_order.push_back(tile.key);
        self.unused_tiles
            .insert(tile.key, UnusedTile { tile, position });
    }

    /// Returns a free slot, evicting the least recently unused tile if the storage is exhausted.
    /// The evicted tile is returned as well, so that it can be dropped after the state is released.
    fn allocate_slot(&mut self) -> Option<(Slot, Option<Tile>)> {
        if let Some(slot) = self.storage.new_slot() {
            return Some((slot, None));
        }

        // a running task still writes into its slot
        let (position, key) = self
            .unused_order
            .iter()
            .find(|(_, key)| self.unused_tiles[key].tile.task.try_detach_slot())?;

        self.unused_order.remove(position);
        let UnusedTile { tile, .. } = self.unused_tiles.remove(&key)?;

        self.deleted_tasks.insert(key, Arc::downgrade(&tile.task));

        if self.deleted_tasks.len() > 2 * self.storage.capacity() as usize {
            self.purge_deleted_tasks();
        }

        Some((tile.slot, Some(tile)))
    }

    fn purge_deleted_tasks(&mut self) -> usize {
        let count = self.deleted_tasks.len();
        self.deleted_tasks.retain(|_, task| task.strong_count() > 0);
        count - self.deleted_tasks.len()
    }
}

/// A fixed capacity cache of tiles shared by one or more producers.
///
/// All operations are synchronous and never wait for the payload of a tile.
/// Computing the payload is the job of the [`Task`] created by the producer of the tile,
/// which is run by the [`Scheduler`] of the cache (if any).
///
/// Producers may request further tiles from the same cache while creating a tile,
/// which is why the cache is guarded by a re-entrant lock.
pub struct TileCache {
    name: String,
    scheduler: Option<Arc<dyn Scheduler>>,
    state: ReentrantMutex<RefCell<CacheState>>,
}

impl TileCache {
    pub fn new(
        name: impl Into<String>,
        storage: impl TileStorage,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Arc<Self> {
        let name = name.into();

        info!(
            "Created tile cache {name} with {} {} slots.",
            storage.capacity(),
            storage.medium()
        );

        Arc::new(Self {
            name,
            scheduler,
            state: ReentrantMutex::new(RefCell::new(CacheState {
                storage: Box::new(storage),
                producers: default(),
                used_tiles: default(),
                unused_tiles: default(),
                unused_order: default(),
                deleted_tasks: default(),
            })),
        })
    }

    fn lock(&self) -> ReentrantMutexGuard<'_, RefCell<CacheState>> {
        self.state.lock()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scheduler(&self) -> Option<&Arc<dyn Scheduler>> {
        self.scheduler.as_ref()
    }

    /// Registers a producer and returns the id its tiles are keyed by.
    pub fn register_producer(&self, producer: Weak<dyn TileProducer>) -> ProducerId {
        let guard = self.lock();
        let mut state = guard.borrow_mut();

        let id = ProducerId(state.producers.len() as u32);
        state.producers.push(producer);

        id
    }

    /// Looks up a tile without changing its user count.
    ///
    /// Unused tiles are only considered if `include_cache` is set.
    pub fn find_tile(
        &self,
        producer: ProducerId,
        level: u32,
        tx: u32,
        ty: u32,
        include_cache: bool,
    ) -> Option<TileInfo> {
        let key = TileKey::new(producer, TileId::new(level, tx, ty));

        let guard = self.lock();
        let state = guard.borrow();
        state.producer(producer);

        state.find(key, include_cache).map(Tile::info)
    }

    /// Acquires a tile, creating it if it is absent.
    ///
    /// Returns `None` if the tile is absent and no slot can be freed for it.
    /// The payload of the tile is valid once its task is done.
    /// The tile stays in use until the returned handle is dropped or put back.
    pub fn get_tile(
        self: &Arc<Self>,
        producer: ProducerId,
        level: u32,
        tx: u32,
        ty: u32,
        deadline: Deadline,
    ) -> Option<TileHandle> {
        let key = TileKey::new(producer, TileId::new(level, tx, ty));

        let guard = self.lock();

        let acquired = {
            let mut state = guard.borrow_mut();
            state.producer(producer);
            state.acquire(key)
        };

        let (slot, task, previous_users) = match acquired {
            Some(acquired) => acquired,
            None => self.insert_new_tile(key, deadline, Insert::Used)?,
        };

        self.log_occupancy(&guard);

        Some(TileHandle {
            cache: Arc::downgrade(self),
            key,
            slot,
            task,
            previous_users,
        })
    }

    /// Creates a tile as unused, without acquiring it.
    ///
    /// Returns the task of the new tile, so that it can be scheduled eagerly.
    /// Does nothing if the tile is present already or no slot can be freed for it.
    pub fn prefetch_tile(
        &self,
        producer: ProducerId,
        level: u32,
        tx: u32,
        ty: u32,
    ) -> Option<Arc<Task>> {
        let key = TileKey::new(producer, TileId::new(level, tx, ty));

        let guard = self.lock();

        {
            let state = guard.borrow();
            state.producer(producer);

            if state.contains(key) {
                return None;
            }
        }

        let (_, task, _) = self.insert_new_tile(key, Deadline::MAX, Insert::Unused)?;

        self.log_occupancy(&guard);

        Some(task)
    }

    /// Releases the tile of the handle and returns its remaining user count.
    /// Once no users remain, the tile can be evicted.
    pub fn put_tile(&self, mut handle: TileHandle) -> u32 {
        assert!(
            ptr::eq(handle.cache.as_ptr(), self),
            "Tried putting tile {} into cache {}, which it does not belong to.",
            handle.key,
            self.name
        );

        handle.cache = Weak::new();
        self.release(handle.key)
    }

    pub(crate) fn release(&self, key: TileKey) -> u32 {
        let guard = self.lock();
        let users = guard.borrow_mut().release(key);

        if users == 0 {
            debug!("{}: tile {key} is unused.", self.name);
        }

        users
    }

    /// Marks the tasks of all tiles of the producer as requiring recomputation.
    pub fn invalidate_tiles(&self, producer: ProducerId) {
        self.invalidate(|key| key.producer == producer);
    }

    /// Marks the task of one tile as requiring recomputation.
    pub fn invalidate_tile(&self, producer: ProducerId, level: u32, tx: u32, ty: u32) {
        let target = TileKey::new(producer, TileId::new(level, tx, ty));
        self.invalidate(|key| *key == target);
    }

    fn invalidate(&self, filter: impl Fn(&TileKey) -> bool) {
        let guard = self.lock();

        let (present, deleted) = {
            let state = guard.borrow();

            let present = state
                .used_tiles
                .values()
                .chain(state.unused_tiles.values().map(|unused| &unused.tile))
                .filter(|tile| filter(&tile.key))
                .map(|tile| tile.task.clone())
                .collect_vec();

            let deleted = state
                .deleted_tasks
                .iter()
                .filter(|(key, _)| filter(key))
                .filter_map(|(_, task)| task.upgrade())
                .collect_vec();

            (present, deleted)
        };

        debug!(
            "{}: invalidating {} present and {} deleted tiles.",
            self.name,
            present.len(),
            deleted.len()
        );

        for task in present {
            self.reschedule(task, TaskReason::DataChanged, 0);
        }

        // without a slot these can not run, they are rescheduled once their tile is requested again
        for task in deleted {
            task.set_is_done(false, 0, TaskReason::DataChanged);

            if let Some(scheduler) = &self.scheduler {
                scheduler.schedule_dependents(&task, 0);
            }
        }
    }

    /// Forgets the preserved task of an evicted tile, so that the tile is recreated from scratch.
    pub fn task_deleted(&self, key: TileKey) -> bool {
        let guard = self.lock();
        let removed = guard.borrow_mut().deleted_tasks.remove(&key).is_some();
        removed
    }

    /// Removes the entries of preserved tasks that are no longer alive.
    pub fn purge_deleted_tasks(&self) -> usize {
        let guard = self.lock();
        let purged = guard.borrow_mut().purge_deleted_tasks();
        purged
    }

    pub fn used_tile_count(&self) -> usize {
        self.lock().borrow().used_tiles.len()
    }

    pub fn unused_tile_count(&self) -> usize {
        self.lock().borrow().unused_tiles.len()
    }

    /// The count of preserved tasks of evicted tiles, that are still alive.
    pub fn deleted_task_count(&self) -> usize {
        self.lock()
            .borrow()
            .deleted_tasks
            .values()
            .filter(|task| task.strong_count() > 0)
            .count()
    }

    pub fn capacity(&self) -> u32 {
        self.lock().borrow().storage.capacity()
    }

    pub fn free_slot_count(&self) -> u32 {
        self.lock().borrow().storage.free_slot_count()
    }

    pub fn storage_medium(&self) -> StorageMedium {
        self.lock().borrow().storage.medium()
    }

    /// A snapshot of all used tiles, sorted by key.
    pub fn used_tiles(&self) -> Vec<TileInfo> {
        self.lock()
            .borrow()
            .used_tiles
            .values()
            .map(Tile::info)
            .sorted_by_key(|info| info.key)
            .collect()
    }

    /// A snapshot of all unused tiles, from the least to the most recently unused one.
    pub fn unused_tiles(&self) -> Vec<TileInfo> {
        let guard = self.lock();
        let state = guard.borrow();

        state
            .unused_order
            .iter()
            .map(|(_, key)| state.unused_tiles[&key].tile.info())
            .collect()
    }

    pub fn report(&self) -> CacheReport {
        let guard = self.lock();
        let state = guard.borrow();

        CacheReport {
            name: self.name.clone(),
            medium: state.storage.medium(),
            capacity: state.storage.capacity(),
            used: state.used_tiles.len(),
            unused: state.unused_tiles.len(),
            free_slots: state.storage.free_slot_count(),
            deleted_tasks: state
                .deleted_tasks
                .values()
                .filter(|task| task.strong_count() > 0)
                .count(),
        }
    }

    /// Creates an absent tile in a free or reclaimed slot.
    ///
    /// The state is not borrowed while the producer creates the task, since it may request
    /// further tiles from this cache.
    fn insert_new_tile(
        &self,
        key: TileKey,
        deadline: Deadline,
        insert: Insert,
    ) -> Option<(Slot, Arc<Task>, u32)> {
        let guard = self.lock();

        let (slot, evicted, reused, producer) = {
            let mut state = guard.borrow_mut();

            let Some(producer) = state.producer(key.producer).upgrade() else {
                warn!("{}: the producer of tile {key} was dropped.", self.name);
                return None;
            };

            let Some((slot, evicted)) = state.allocate_slot() else {
                warn!(
                    "{}: all {} slots are in use, tile {key} is not available.",
                    self.name,
                    state.storage.capacity()
                );
                return None;
            };

            let reused = state
                .deleted_tasks
                .remove(&key)
                .and_then(|task| task.upgrade());

            (slot, evicted, reused, producer)
        };

        if let Some(evicted) = evicted {
            debug!("{}: evicted tile {} from {}.", self.name, evicted.key, slot);
        }

        if let Some(task) = &reused {
            task.attach_slot(slot);
        }

        let TileId { level, tx, ty } = key.tile;
        let task = producer.create_tile(level, tx, ty, slot, deadline, reused.clone());

        let acquired = {
            let mut state = guard.borrow_mut();

            if state.contains(key) {
                // created while the producer was creating the task
                task.try_detach_slot();
                state.storage.delete_slot(slot);

                match insert {
                    Insert::Used => state.acquire(key),
                    Insert::Unused => None,
                }
            } else {
                let users = match insert {
                    Insert::Used => 1,
                    Insert::Unused => 0,
                };

                let tile = Tile {
                    key,
                    slot,
                    task: task.clone(),
                    users,
                };

                match insert {
                    Insert::Used => {
                        state.used_tiles.insert(key, tile);
                    }
                    Insert::Unused => state.push_unused(tile),
                }

                Some((slot, task.clone(), 0))
            }
        };

        // the payload in the slot belongs to another tile
        if reused.is_some_and(|reused| Arc::ptr_eq(&reused, &task)) {
            self.reschedule(task, TaskReason::DataNeeded, deadline);
        }

        acquired
    }

    fn reschedule(&self, task: Arc<Task>, reason: TaskReason, deadline: Deadline) {
        match &self.scheduler {
            Some(scheduler) => scheduler.reschedule(task, reason, deadline),
            None => task.set_is_done(false, deadline, reason),
        }
    }

    fn log_occupancy(&self, guard: &ReentrantMutexGuard<'_, RefCell<CacheState>>) {
        let state = guard.borrow();

        debug!(
            "{}: {} used, {} unused, {} slots.",
            self.name,
            state.used_tiles.len(),
            state.unused_tiles.len(),
            state.storage.capacity()
        );
    }
}

impl Drop for TileCache {
    fn drop(&mut self) {
        let state = self.state.get_mut().get_mut();

        if !thread::panicking() {
            assert!(
                state.used_tiles.is_empty(),
                "Tile cache {} was dropped with {} used tiles.",
                self.name,
                state.used_tiles.len()
            );
        }

        let unused = state.unused_tiles.len();

        for (_, UnusedTile { tile, .. }) in state.unused_tiles.drain() {
            tile.task.try_detach_slot();
            state.storage.delete_slot(tile.slot);
        }

        state.unused_order.clear();

        info!("Dropped tile cache {}, released {unused} slots.", self.name);
    }
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCache")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        storage::{CpuTileStorage, SlotPool},
        task::TaskId,
    };
    use parking_lot::Mutex;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Barrier,
    };

    type Work = dyn Fn(TileId) -> anyhow::Result<()> + Send + Sync;

    struct TestProducer {
        id: ProducerId,
        cache: Arc<TileCache>,
        created: AtomicU32,
        fetch_parent: bool,
        work: Arc<Work>,
    }

    impl TestProducer {
        fn new(cache: &Arc<TileCache>) -> Arc<Self> {
            Self::build(cache, false, Arc::new(|_: TileId| anyhow::Ok(())))
        }

        fn build(cache: &Arc<TileCache>, fetch_parent: bool, work: Arc<Work>) -> Arc<Self> {
            Arc::new_cyclic(|this: &Weak<Self>| Self {
                id: cache.register_producer(this.clone()),
                cache: cache.clone(),
                created: AtomicU32::new(0),
                fetch_parent,
                work,
            })
        }

        fn created(&self) -> u32 {
            self.created.load(Ordering::Relaxed)
        }
    }

    impl TileProducer for TestProducer {
        fn id(&self) -> ProducerId {
            self.id
        }

        fn cache(&self) -> &Arc<TileCache> {
            &self.cache
        }

        fn name(&self) -> &str {
            "test"
        }

        fn tile_size(&self) -> u32 {
            1
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
                self.created.fetch_add(1, Ordering::Relaxed);
                let work = self.work.clone();
                Task::new(format!("test {tile}"), slot, move |_, _| work(tile))
            });

            if let Some(parent) = tile.parent().filter(|_| self.fetch_parent) {
                if let Some(handle) = self.get_tile(parent.level, parent.tx, parent.ty, deadline) {
                    task.set_dependencies(vec![handle.task().clone()]);
                }
            }

            task
        }
    }

    #[derive(Default)]
    struct RecordingScheduler {
        rescheduled: Mutex<Vec<(TaskId, TaskReason, Deadline)>>,
    }

    impl Scheduler for RecordingScheduler {
        fn schedule(&self, _task: Arc<Task>, _deadline: Deadline) {}

        fn reschedule(&self, task: Arc<Task>, reason: TaskReason, deadline: Deadline) {
            task.set_is_done(false, deadline, reason);
            self.rescheduled.lock().push((task.id(), reason, deadline));
        }
    }

    struct CountingStorage {
        pool: SlotPool,
        released: Arc<AtomicU32>,
    }

    impl TileStorage for CountingStorage {
        fn new_slot(&mut self) -> Option<Slot> {
            self.pool.allocate()
        }

        fn delete_slot(&mut self, slot: Slot) {
            self.released.fetch_add(1, Ordering::Relaxed);
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

    fn cache(capacity: u32) -> Arc<TileCache> {
        TileCache::new("test", CpuTileStorage::<u8>::new(1, capacity), None)
    }

    fn present(cache: &TileCache, producer: ProducerId, level: u32) -> bool {
        cache.find_tile(producer, level, 0, 0, true).is_some()
    }

    #[test]
    fn evicts_released_tile_when_full() {
        let cache = cache(2);
        let producer = TestProducer::new(&cache);
        let id = producer.id();

        let t1 = cache.get_tile(id, 0, 0, 0, 0).unwrap();
        let t2 = cache.get_tile(id, 1, 0, 0, 0).unwrap();
        assert_eq!(t1.previous_users(), 0);
        assert_eq!(cache.free_slot_count(), 0);

        let slot = t1.slot();
        let task = t1.task().clone();
        assert_eq!(cache.put_tile(t1), 0);
        assert_eq!(cache.unused_tile_count(), 1);

        let t3 = cache.get_tile(id, 2, 0, 0, 0).unwrap();

        assert_eq!(t3.slot(), slot);
        assert!(!present(&cache, id, 0));
        assert_eq!(cache.used_tile_count(), 2);
        assert_eq!(cache.unused_tile_count(), 0);
        assert_eq!(cache.deleted_task_count(), 1);
        assert_eq!(task.slot(), None);

        drop((t2, t3));
    }

    #[test]
    fn counts_users() {
        let cache = cache(2);
        let producer = TestProducer::new(&cache);
        let id = producer.id();

        let first = cache.get_tile(id, 0, 0, 0, 0).unwrap();
        let second = cache.get_tile(id, 0, 0, 0, 0).unwrap();

        assert_eq!(second.previous_users(), 1);
        assert!(Arc::ptr_eq(first.task(), second.task()));
        assert_eq!(cache.find_tile(id, 0, 0, 0, false).unwrap().users, 2);
        assert_eq!(producer.created(), 1);

        drop(second);
        assert_eq!(cache.find_tile(id, 0, 0, 0, false).unwrap().users, 1);

        assert_eq!(cache.put_tile(first), 0);
        assert!(cache.find_tile(id, 0, 0, 0, false).is_none());
        assert_eq!(cache.find_tile(id, 0, 0, 0, true).unwrap().users, 0);
        assert_eq!(cache.used_tile_count(), 0);
        assert_eq!(cache.unused_tile_count(), 1);

        // reacquiring an unused tile is a hit
        let third = cache.get_tile(id, 0, 0, 0, 0).unwrap();
        assert_eq!(third.previous_users(), 0);
        assert_eq!(producer.created(), 1);
        assert_eq!(cache.unused_tile_count(), 0);
    }

    #[test]
    fn evicts_in_least_recently_unused_order() {
        let cache = cache(3);
        let producer = TestProducer::new(&cache);
        let id = producer.id();

        let a = cache.get_tile(id, 0, 0, 0, 0).unwrap();
        let b = cache.get_tile(id, 1, 0, 0, 0).unwrap();
        let c = cache.get_tile(id, 2, 0, 0, 0).unwrap();
        drop(a);
        drop(b);
        drop(c);

        let unused = cache.unused_tiles().iter().map(|info| info.key.tile.level).collect_vec();
        assert_eq!(unused, [0, 1, 2]);

        let _d = cache.get_tile(id, 3, 0, 0, 0).unwrap();
        assert!(!present(&cache, id, 0));
        assert!(present(&cache, id, 1) && present(&cache, id, 2));

        let _e = cache.get_tile(id, 4, 0, 0, 0).unwrap();
        assert!(!present(&cache, id, 1));
        assert!(present(&cache, id, 2));

        let _f = cache.get_tile(id, 5, 0, 0, 0).unwrap();
        assert!(!present(&cache, id, 2));
        assert_eq!(cache.used_tile_count(), 3);
    }

    #[test]
    fn reuses_task_of_evicted_tile() {
        let cache = cache(1);
        let producer = TestProducer::new(&cache);
        let id = producer.id();

        let a = cache.get_tile(id, 0, 0, 0, 0).unwrap();
        let task = a.task().clone();
        task.run().unwrap();
        assert!(a.is_ready());
        drop(a);

        let b = cache.get_tile(id, 1, 0, 0, 0).unwrap();
        drop(b);

        let a = cache.get_tile(id, 0, 0, 0, 3).unwrap();

        assert!(Arc::ptr_eq(a.task(), &task));
        assert!(!task.is_done());
        assert_eq!(task.reason(), Some(TaskReason::DataNeeded));
        assert_eq!(task.deadline(), 3);
        assert_eq!(task.slot(), Some(a.slot()));
        assert_eq!(producer.created(), 2);
        assert_eq!(cache.deleted_task_count(), 0);

        task.run().unwrap();
        assert!(a.is_ready());
    }

    #[test]
    fn reused_task_is_rescheduled() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let cache = TileCache::new(
            "test",
            CpuTileStorage::<u8>::new(1, 1),
            Some(scheduler.clone()),
        );
        let producer = TestProducer::new(&cache);
        let id = producer.id();

        let task = cache.get_tile(id, 0, 0, 0, 0).unwrap().task().clone();
        drop(cache.get_tile(id, 1, 0, 0, 0));
        assert!(scheduler.rescheduled.lock().is_empty());

        let handle = cache.get_tile(id, 0, 0, 0, 7).unwrap();

        assert!(Arc::ptr_eq(handle.task(), &task));
        assert_eq!(
            *scheduler.rescheduled.lock(),
            [(task.id(), TaskReason::DataNeeded, 7)]
        );
        assert_eq!(task.reason(), Some(TaskReason::DataNeeded));
    }

    #[test]
    fn forgets_dead_and_deleted_tasks() {
        let cache = cache(1);
        let producer = TestProducer::new(&cache);
        let id = producer.id();

        drop(cache.get_tile(id, 0, 0, 0, 0));
        drop(cache.get_tile(id, 1, 0, 0, 0));
        assert_eq!(cache.deleted_task_count(), 0);
        assert_eq!(cache.purge_deleted_tasks(), 1);

        let task = cache.get_tile(id, 0, 0, 0, 0).unwrap().task().clone();
        assert_eq!(producer.created(), 3);

        drop(cache.get_tile(id, 1, 0, 0, 0));
        assert_eq!(cache.deleted_task_count(), 1);
        assert!(cache.task_deleted(TileKey::new(id, TileId::new(0, 0, 0))));

        let handle = cache.get_tile(id, 0, 0, 0, 0).unwrap();
        assert!(!Arc::ptr_eq(handle.task(), &task));
        assert_eq!(producer.created(), 5);
    }

    #[test]
    fn saturated_cache_returns_none() {
        let cache = cache(2);
        let producer = TestProducer::new(&cache);
        let id = producer.id();

        let _a = cache.get_tile(id, 0, 0, 0, 0).unwrap();
        let _b = cache.get_tile(id, 1, 0, 0, 0).unwrap();

        assert!(cache.get_tile(id, 2, 0, 0, 0).is_none());
        assert!(cache.prefetch_tile(id, 2, 0, 0).is_none());
        assert_eq!(cache.used_tile_count(), 2);
        assert_eq!(producer.created(), 2);
    }

    #[test]
    fn prefetch_is_idempotent() {
        let cache = cache(2);
        let producer = TestProducer::new(&cache);
        let id = producer.id();

        let task = cache.prefetch_tile(id, 1, 1, 0).unwrap();
        assert!(cache.prefetch_tile(id, 1, 1, 0).is_none());
        assert_eq!(cache.unused_tile_count(), 1);
        assert_eq!(cache.used_tile_count(), 0);

        let handle = cache.get_tile(id, 1, 1, 0, 0).unwrap();
        assert!(Arc::ptr_eq(handle.task(), &task));
        assert_eq!(producer.created(), 1);

        // prefetching a used tile does nothing either
        assert!(cache.prefetch_tile(id, 1, 1, 0).is_none());
        assert_eq!(cache.unused_tile_count(), 0);
    }

    #[test]
    fn invalidation_keeps_tiles_in_place() {
        let cache = cache(4);
        let first = TestProducer::new(&cache);
        let second = TestProducer::new(&cache);
        assert_ne!(first.id(), second.id());

        let a = cache.get_tile(first.id(), 0, 0, 0, 0).unwrap();
        let b = cache.get_tile(second.id(), 0, 0, 0, 0).unwrap();
        a.task().run().unwrap();
        b.task().run().unwrap();

        cache.invalidate_tile(first.id(), 0, 0, 0);

        let info = cache.find_tile(first.id(), 0, 0, 0, false).unwrap();
        assert_eq!(info.users, 1);
        assert_eq!(info.slot, a.slot());
        assert!(!a.is_ready());
        assert_eq!(a.task().reason(), Some(TaskReason::DataChanged));
        assert!(b.is_ready());

        a.task().run().unwrap();
        drop(a);
        cache.invalidate_tiles(second.id());

        assert!(!b.is_ready());
        assert!(cache.find_tile(first.id(), 0, 0, 0, true).unwrap().task.is_done());
        assert_eq!(cache.unused_tile_count(), 1);
        assert_eq!(cache.used_tile_count(), 1);
    }

    #[test]
    fn invalidation_reaches_deleted_tasks() {
        let cache = cache(1);
        let producer = TestProducer::new(&cache);
        let id = producer.id();

        let task = cache.get_tile(id, 0, 0, 0, 0).unwrap().task().clone();
        task.run().unwrap();
        drop(cache.get_tile(id, 1, 0, 0, 0));

        cache.invalidate_tiles(id);

        assert!(!task.is_done());
        assert_eq!(task.reason(), Some(TaskReason::DataChanged));
        assert_eq!(task.slot(), None);
    }

    #[test]
    fn invalidation_reschedules_present_tiles() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let cache = TileCache::new(
            "test",
            CpuTileStorage::<u8>::new(1, 2),
            Some(scheduler.clone()),
        );
        let producer = TestProducer::new(&cache);
        let id = producer.id();

        let used = cache.get_tile(id, 0, 0, 0, 0).unwrap();
        let deleted = {
            let handle = cache.get_tile(id, 1, 0, 0, 0).unwrap();
            handle.task().run().unwrap();
            handle.task().clone()
        };
        let unused = cache.get_tile(id, 2, 0, 0, 0).unwrap().task().clone();
        used.task().run().unwrap();
        unused.run().unwrap();

        assert_eq!(deleted.slot(), None);
        assert!(scheduler.rescheduled.lock().is_empty());

        cache.invalidate_tile(id, 0, 0, 0);
        assert_eq!(
            *scheduler.rescheduled.lock(),
            [(used.task().id(), TaskReason::DataChanged, 0)]
        );
        assert!(unused.is_done());

        scheduler.rescheduled.lock().clear();
        cache.invalidate_tiles(id);

        let rescheduled = scheduler.rescheduled.lock().clone();
        assert!(rescheduled
            .iter()
            .all(|&(_, reason, deadline)| reason == TaskReason::DataChanged && deadline == 0));
        assert_eq!(
            rescheduled.iter().map(|&(task, ..)| task).sorted().collect_vec(),
            [used.task().id(), unused.id()].into_iter().sorted().collect_vec()
        );

        // the preserved task owns no slot, so it is only marked
        assert!(!deleted.is_done());
        assert_eq!(deleted.reason(), Some(TaskReason::DataChanged));
        assert_eq!(cache.used_tile_count(), 1);
        assert_eq!(cache.unused_tile_count(), 1);
    }

    #[test]
    fn invalidation_reaches_dependent_tiles() {
        let cache = cache(2);
        let producer = TestProducer::build(&cache, true, Arc::new(|_: TileId| anyhow::Ok(())));
        let id = producer.id();

        let child = cache.get_tile(id, 1, 0, 0, 0).unwrap();
        let parent = cache.find_tile(id, 0, 0, 0, true).unwrap().task;
        parent.run().unwrap();
        child.task().run().unwrap();

        cache.invalidate_tile(id, 0, 0, 0);

        assert_eq!(parent.reason(), Some(TaskReason::DataChanged));
        assert!(!child.is_ready());
        assert_eq!(child.task().reason(), Some(TaskReason::DependencyChanged));
    }

    #[test]
    fn running_tasks_are_not_evicted() {
        let started = Arc::new(Barrier::new(2));
        let finish = Arc::new(Barrier::new(2));

        let work: Arc<Work> = {
            let started = started.clone();
            let finish = finish.clone();

            Arc::new(move |tile: TileId| -> anyhow::Result<()> {
                if tile.level == 0 {
                    started.wait();
                    finish.wait();
                }
                Ok(())
            })
        };

        let cache = cache(2);
        let producer = TestProducer::build(&cache, false, work);
        let id = producer.id();

        let a = cache.get_tile(id, 0, 0, 0, 0).unwrap();
        let b = cache.get_tile(id, 1, 0, 0, 0).unwrap();
        let task = a.task().clone();
        drop(a);
        drop(b);

        let worker = thread::spawn(move || task.run());
        started.wait();

        let _c = cache.get_tile(id, 2, 0, 0, 0).unwrap();
        assert!(present(&cache, id, 0));
        assert!(!present(&cache, id, 1));

        finish.wait();
        worker.join().unwrap().unwrap();
        assert!(cache.find_tile(id, 0, 0, 0, true).unwrap().task.is_done());
    }

    #[test]
    fn producers_can_request_tiles_while_creating() {
        let cache = cache(4);
        let producer = TestProducer::build(&cache, true, Arc::new(|_: TileId| anyhow::Ok(())));
        let id = producer.id();

        let handle = producer.get_tile(2, 3, 1, 0).unwrap();

        assert_eq!(cache.used_tile_count(), 1);
        assert_eq!(cache.unused_tile_count(), 2);
        assert_eq!(handle.task().dependencies().len(), 1);
        assert!(cache.find_tile(id, 1, 1, 0, true).is_some());
        assert!(cache.find_tile(id, 0, 0, 0, true).is_some());
        assert!(!handle.task().is_ready());
    }

    #[test]
    fn dropping_the_cache_releases_unused_slots() {
        let released = Arc::new(AtomicU32::new(0));
        let storage = CountingStorage {
            pool: SlotPool::new(3),
            released: released.clone(),
        };

        let cache = TileCache::new("test", storage, None);
        let producer = TestProducer::new(&cache);
        let id = producer.id();

        drop(cache.get_tile(id, 0, 0, 0, 0));
        drop(cache.get_tile(id, 1, 0, 0, 0));
        assert_eq!(released.load(Ordering::Relaxed), 0);

        drop(producer);
        drop(cache);

        assert_eq!(released.load(Ordering::Relaxed), 2);
    }

    #[test]
    #[should_panic(expected = "used tiles")]
    fn dropping_the_cache_with_used_tiles_panics() {
        let cache = cache(1);
        let producer = TestProducer::new(&cache);
        let _handle = cache.get_tile(producer.id(), 0, 0, 0, 0).unwrap();

        drop(producer);
        drop(cache);
    }

    #[test]
    #[should_panic(expected = "Unknown producer")]
    fn unknown_producers_are_rejected() {
        let cache = cache(1);
        cache.find_tile(ProducerId(3), 0, 0, 0, true);
    }

    #[test]
    fn random_requests_keep_the_tile_sets_consistent() {
        let mut rng = StdRng::seed_from_u64(42);

        let capacity = 6;
        let cache = cache(capacity);
        let producer = TestProducer::new(&cache);
        let id = producer.id();

        let mut handles: Vec<TileHandle> = Vec::new();

        for _ in 0..2000 {
            let level = rng.random_range(0..10);

            match rng.random_range(0..10) {
                0..=3 => {
                    if let Some(handle) = cache.get_tile(id, level, 0, 0, 0) {
                        handles.push(handle);
                    } else {
                        assert_eq!(cache.used_tile_count(), capacity as usize);
                    }
                }
                4..=6 if !handles.is_empty() => {
                    let handle = handles.swap_remove(rng.random_range(0..handles.len()));
                    cache.put_tile(handle);
                }
                7 => {
                    cache.prefetch_tile(id, level, 0, 0);
                }
                8 => cache.invalidate_tile(id, level, 0, 0),
                _ => {
                    if let Some(info) = cache.find_tile(id, level, 0, 0, true) {
                        info.task.run().unwrap();
                    }
                }
            }

            let used = cache.used_tiles();
            let unused = cache.unused_tiles();

            for info in &used {
                let holders = handles.iter().filter(|handle| handle.key() == info.key).count();
                assert_eq!(info.users as usize, holders);
                assert!(info.users > 0);
            }

            for info in &unused {
                assert_eq!(info.users, 0);
                assert!(used.iter().all(|used| used.key != info.key));
            }

            let slots = used.iter().chain(&unused).map(|info| info.slot).unique().count();
            assert_eq!(slots, used.len() + unused.len());
            assert_eq!(
                slots as u32 + cache.free_slot_count(),
                cache.capacity()
            );
        }

        handles.clear();
        assert_eq!(cache.used_tile_count(), 0);
    }
}
