use crate::{cache::TileCache, storage::Slot, task::Task};
use derive_more::derive::{Display, From};
use std::sync::{Arc, Weak};

/// The small integer a [`TileCache`] assigns to each producer registered with it.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Display, From)]
#[display("{_0}")]
pub struct ProducerId(pub u32);

impl ProducerId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// The coordinate of a quadtree node, unique within one producer.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Display)]
#[display("{level}/{tx}/{ty}")]
pub struct TileId {
    /// The level of the node, where 0 is the root with the lowest resolution.
    pub level: u32,
    /// The x position of the node in tile sizes.
    pub tx: u32,
    /// The y position of the node in tile sizes.
    pub ty: u32,
}

impl TileId {
    pub fn new(level: u32, tx: u32, ty: u32) -> Self {
        Self { level, tx, ty }
    }

    /// The count of tiles in x and y direction on the given level.
    pub fn count(level: u32) -> u32 {
        1 << level
    }

    /// The node one level up containing this one, or `None` for the root.
    pub fn parent(self) -> Option<Self> {
        let level = self.level.checked_sub(1)?;

        Some(Self {
            level,
            tx: self.tx >> 1,
            ty: self.ty >> 1,
        })
    }

    pub fn children(self) -> [Self; 4] {
        [0, 1, 2, 3].map(|index| Self {
            level: self.level + 1,
            tx: (self.tx << 1) + index % 2,
            ty: (self.ty << 1) + index / 2,
        })
    }
}

/// The globally unique identifier of a tile inside a [`TileCache`].
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Display)]
#[display("{producer}:{tile}")]
pub struct TileKey {
    pub producer: ProducerId,
    pub tile: TileId,
}

impl TileKey {
    pub fn new(producer: ProducerId, tile: TileId) -> Self {
        Self { producer, tile }
    }
}

/// The internal representation of a present tile in a [`TileCache`].
pub(crate) struct Tile {
    pub(crate) key: TileKey,
    /// The slot holding the payload. It is owned by this tile until eviction.
    pub(crate) slot: Slot,
    /// The task computing the payload.
    pub(crate) task: Arc<Task>,
    /// The count of outstanding [`TileHandle`]s.
    pub(crate) users: u32,
}

impl Tile {
    pub(crate) fn info(&self) -> TileInfo {
        TileInfo {
            key: self.key,
            slot: self.slot,
            task: self.task.clone(),
            users: self.users,
        }
    }
}

/// A snapshot of a tile, returned by lookups that do not touch reference counts.
#[derive(Clone, Debug)]
pub struct TileInfo {
    pub key: TileKey,
    pub slot: Slot,
    pub task: Arc<Task>,
    pub users: u32,
}

/// A borrowed tile of a [`TileCache`].
///
/// The handle keeps the tile in the used set, so that its slot can not be evicted.
/// Dropping the handle releases the tile again, which makes it reclaimable once all
/// other handles are gone as well.
/// The handle does not keep the cache alive.
#[must_use = "dropping a tile handle releases the tile immediately"]
pub struct TileHandle {
    pub(crate) cache: Weak<TileCache>,
    pub(crate) key: TileKey,
    pub(crate) slot: Slot,
    pub(crate) task: Arc<Task>,
    pub(crate) previous_users: u32,
}

impl TileHandle {
    pub fn key(&self) -> TileKey {
        self.key
    }

    pub fn id(&self) -> TileId {
        self.key.tile
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// The count of users the tile had before this handle was acquired.
    pub fn previous_users(&self) -> u32 {
        self.previous_users
    }

    /// Whether the payload of the tile has been computed.
    pub fn is_ready(&self) -> bool {
        self.task.is_done()
    }
}

impl Drop for TileHandle {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.release(self.key);
        }
    }
}

impl std::fmt::Debug for TileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileHandle")
            .field("key", &self.key)
            .field("slot", &self.slot)
            .field("task", &self.task.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_and_children() {
        let tile = TileId::new(3, 5, 6);

        for child in tile.children() {
            assert_eq!(child.level, 4);
            assert_eq!(child.parent(), Some(tile));
        }

        assert_eq!(tile.parent(), Some(TileId::new(2, 2, 3)));
        assert_eq!(TileId::new(0, 0, 0).parent(), None);
        assert_eq!(TileId::count(3), 8);
    }

    #[test]
    fn keys_display_producer_and_coordinate() {
        let key = TileKey::new(ProducerId(2), TileId::new(1, 0, 1));

        assert_eq!(key.to_string(), "2:1/0/1");
    }
}
