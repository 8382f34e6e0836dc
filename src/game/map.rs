//! Grid Map Geometry
//!
//! Square-tile battle maps. Movement is 4-directional and distances are
//! Manhattan distances, matching how move and attack ranges are counted.

use std::collections::BTreeSet;
use serde::{Serialize, Deserialize};

/// A tile coordinate on the battle map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Position {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
}

impl Position {
    /// Create a position.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Manhattan distance to another tile. Saturates at `u32::MAX` for
    /// coordinates far off any map.
    #[inline]
    pub fn distance(self, other: Position) -> u32 {
        self.x.abs_diff(other.x).saturating_add(self.y.abs_diff(other.y))
    }

    /// True if `other` is one orthogonal step away.
    #[inline]
    pub fn is_adjacent(self, other: Position) -> bool {
        self.distance(other) == 1
    }
}

/// Battle map: dimensions plus impassable tiles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridMap {
    /// Map identifier (asset reference resolved by clients).
    pub id: String,
    /// Width in tiles.
    pub width: i32,
    /// Height in tiles.
    pub height: i32,
    /// Walls and other impassable tiles.
    pub blocked: BTreeSet<Position>,
}

impl GridMap {
    /// Create an open map with no blocked tiles.
    pub fn open(id: impl Into<String>, width: i32, height: i32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            blocked: BTreeSet::new(),
        }
    }

    /// Builder-style helper to add walls.
    pub fn with_blocked(mut self, tiles: impl IntoIterator<Item = Position>) -> Self {
        self.blocked.extend(tiles);
        self
    }

    /// Is the tile inside the map?
    #[inline]
    pub fn in_bounds(&self, pos: Position) -> bool {
        pos.x >= 0 && pos.y >= 0 && pos.x < self.width && pos.y < self.height
    }

    /// Is the tile inside the map and not a wall?
    #[inline]
    pub fn is_walkable(&self, pos: Position) -> bool {
        self.in_bounds(pos) && !self.blocked.contains(&pos)
    }
}
