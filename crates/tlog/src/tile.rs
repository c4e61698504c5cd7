// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Tile and entry-bundle coordinates for the static-CT tree layout.
//!
//! A hash tile at level `L`, index `K` holds the hashes of up to 256
//! consecutive nodes at tree height `8L`, i.e. the roots of the perfect
//! subtrees covering leaves `[(256K + j) * 256^L, (256K + j + 1) * 256^L)`.
//! Entry bundles mirror level-0 tiles but hold serialized log entries.
//! Partial tiles exist only on the right edge of the tree and are published
//! under a distinct `.p/<width>` path, per <https://c2sp.org/static-ct-api>.

/// Height of every tile: each tile spans 8 tree levels.
pub const TILE_HEIGHT: u8 = 8;

/// Number of entries in a full tile or entry bundle.
pub const TILE_WIDTH: u64 = 1 << TILE_HEIGHT;

/// Index path component grouping, to keep directory fan-out bounded.
const PATH_BASE: u64 = 1000;

/// A tile coordinate: hash tile level and index, or the entry-bundle level.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tile {
    level: TileLevel,
    index: u64,
    /// Number of populated entries, in `1..=TILE_WIDTH`.
    width: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TileLevel {
    /// A hash tile at the given tile level (tree height `8 * level`).
    Hash(u8),
    /// An entry bundle ("data tile").
    Entries,
}

impl Tile {
    /// Returns a new tile coordinate.
    ///
    /// # Panics
    ///
    /// Panics if `width` is zero or exceeds [`TILE_WIDTH`].
    pub fn new(level: TileLevel, index: u64, width: u16) -> Self {
        assert!(width >= 1 && u64::from(width) <= TILE_WIDTH, "invalid tile width {width}");
        Self { level, index, width }
    }

    pub fn level(&self) -> TileLevel {
        self.level
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn is_full(&self) -> bool {
        u64::from(self.width) == TILE_WIDTH
    }

    /// The object-store path for this tile, e.g. `tile/0/x001/234.p/5` or
    /// `tile/data/000`.
    pub fn path(&self) -> String {
        let level = match self.level {
            TileLevel::Hash(l) => l.to_string(),
            TileLevel::Entries => "data".to_string(),
        };
        let partial = if self.is_full() {
            String::new()
        } else {
            format!(".p/{}", self.width)
        };
        format!("tile/{level}/{}{partial}", coord_path(self.index))
    }
}

/// Encodes a tile index as a path fragment, three digits per component with
/// an `x` prefix on all but the last: `1234067 -> "x001/x234/067"`.
fn coord_path(n: u64) -> String {
    let mut n = n;
    let mut s = format!("{:03}", n % PATH_BASE);
    while n >= PATH_BASE {
        n /= PATH_BASE;
        s = format!("x{:03}/{s}", n % PATH_BASE);
    }
    s
}

/// The number of populated entries in tile `index` of a level-0 row (hash
/// tile or entry bundle) for a tree of `tree_size` leaves, or zero if the
/// tile is entirely beyond the tree.
pub fn tile_width(tree_size: u64, index: u64) -> u16 {
    let start = index * TILE_WIDTH;
    if tree_size <= start {
        0
    } else if tree_size >= start + TILE_WIDTH {
        TILE_WIDTH as u16
    } else {
        (tree_size - start) as u16
    }
}

/// Splits a leaf index into `(bundle index, index within the bundle)`.
pub fn split_leaf_index(leaf_index: u64) -> (u64, u64) {
    (leaf_index / TILE_WIDTH, leaf_index % TILE_WIDTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_paths() {
        for (level, index, width, want) in [
            (TileLevel::Hash(0), 0, 256, "tile/0/000"),
            (TileLevel::Hash(0), 1, 256, "tile/0/001"),
            (TileLevel::Hash(0), 1, 5, "tile/0/001.p/5"),
            (TileLevel::Hash(1), 0, 1, "tile/1/000.p/1"),
            (TileLevel::Hash(3), 999, 256, "tile/3/999"),
            (TileLevel::Hash(0), 1000, 256, "tile/0/x001/000"),
            (TileLevel::Hash(0), 1234067, 8, "tile/0/x001/x234/067.p/8"),
            (TileLevel::Entries, 0, 256, "tile/data/000"),
            (TileLevel::Entries, 2, 15, "tile/data/002.p/15"),
        ] {
            assert_eq!(Tile::new(level, index, width).path(), want);
        }
    }

    #[test]
    fn test_tile_width() {
        assert_eq!(tile_width(0, 0), 0);
        assert_eq!(tile_width(1, 0), 1);
        assert_eq!(tile_width(256, 0), 256);
        assert_eq!(tile_width(257, 0), 256);
        assert_eq!(tile_width(257, 1), 1);
        assert_eq!(tile_width(257, 2), 0);
        assert_eq!(tile_width(512 + 300, 2), 256);
    }

    #[test]
    fn test_split_leaf_index() {
        assert_eq!(split_leaf_index(0), (0, 0));
        assert_eq!(split_leaf_index(255), (0, 255));
        assert_eq!(split_leaf_index(256), (1, 0));
        assert_eq!(split_leaf_index(1000), (3, 232));
    }
}
