//! Tile request forwarding to the shard that holds an image open

mod tile;

pub use tile::{TileProxy, TileRequest, parse_tile_address, relay};
