//! The tile cache and the identifiers of the tiles it manages.
//!
//! A [`TileCache`] owns a [`TileStorage`](crate::storage::TileStorage) and shares it among
//! any number of [`TileProducer`](crate::producer::TileProducer)s.
//! Each tile is in exactly one of the following states:
//!
//! - **used**: at least one [`TileHandle`] to it exists, its slot can not be reclaimed
//! - **unused**: no handle exists, but the payload is kept until the slot is needed for another tile
//! - **absent**: the tile was evicted (or never created), its task may still be preserved so that
//!   a later request for the same tile can reuse it
//!
//! Unused tiles are evicted in least-recently-unused order.

mod lru;
mod tile;
mod tile_cache;

pub use tile::{ProducerId, TileHandle, TileId, TileInfo, TileKey};
pub use tile_cache::TileCache;

pub(crate) use tile::Tile;
