//! Pyramid geometry and per-tile coefficient state.
//!
//! Tile state records are created once when a slide opens and live for the
//! slide's lifetime; only their coefficient planes and planner scratch
//! flags change, and only under the cache mutex. Tiles are addressed by
//! stable flat indices so list structures never hold owning references.

use crate::block_pool::CoeffPlane;
use crate::format::SlideLayout;

/// Bit per 3x3-neighborhood position, matching the codeblock header
/// convention: top-left is the highest bit, bottom-right the lowest.
pub const ADJ_TILE_TOP_LEFT: u32 = 0x100;
pub const ADJ_TILE_TOP_CENTER: u32 = 0x80;
pub const ADJ_TILE_TOP_RIGHT: u32 = 0x40;
pub const ADJ_TILE_CENTER_LEFT: u32 = 0x20;
pub const ADJ_TILE_CENTER: u32 = 0x10;
pub const ADJ_TILE_CENTER_RIGHT: u32 = 0x08;
pub const ADJ_TILE_BOTTOM_LEFT: u32 = 0x04;
pub const ADJ_TILE_BOTTOM_CENTER: u32 = 0x02;
pub const ADJ_TILE_BOTTOM_RIGHT: u32 = 0x01;

/// All nine positions, center included.
pub const ADJ_TILE_ALL: u32 = 0x1FF;

/// Mask bit for the neighbor at `(dx, dy)`, each in `-1..=1`.
pub fn adjacency_bit(dx: i32, dy: i32) -> u32 {
    debug_assert!((-1..=1).contains(&dx) && (-1..=1).contains(&dy));
    let slot = (dy + 1) * 3 + (dx + 1);
    ADJ_TILE_TOP_LEFT >> slot
}

/// Coefficient planes of one color channel. The options are the single
/// source of truth for plane presence; there is no separate flag to drift.
#[derive(Default)]
pub struct ChannelPlanes {
    /// Low-pass plane, `tile_width * tile_height` coefficients.
    pub ll: Option<CoeffPlane>,
    /// High-pass triplet, `3 * tile_width * tile_height` coefficients.
    pub h: Option<CoeffPlane>,
}

/// Mutable per-tile engine state.
pub struct TileState {
    /// Whether the container stores any codeblock for this tile. A tile
    /// that does not exist never holds planes; neighbors read its
    /// contribution as dummy coefficients.
    pub exists: bool,
    /// Which neighborhood positions have not yet contributed to this
    /// tile's LL. Cleared when the LL plane is fully materialized; only
    /// meaningful while the top level is streaming in.
    pub ll_invalid_edges: u32,
    pub codeblock_index: u32,
    pub codeblock_chunk_index: u32,
    pub data_chunk_index: u32,
    /// Planner scratch: membership marker while closure lists are built.
    /// Always false outside `build_tile_lists`.
    pub(crate) cache_marked: bool,
    pub channels: [ChannelPlanes; 3],
}

impl TileState {
    pub fn has_ll(&self) -> bool {
        self.channels.iter().all(|c| c.ll.is_some())
    }

    pub fn has_h(&self) -> bool {
        self.channels.iter().all(|c| c.h.is_some())
    }

    /// Detach every plane this tile owns, for return to the pools.
    pub(crate) fn take_planes(&mut self) -> Vec<(CoeffPlane, bool)> {
        let mut planes = Vec::new();
        for channel in &mut self.channels {
            if let Some(ll) = channel.ll.take() {
                planes.push((ll, true));
            }
            if let Some(h) = channel.h.take() {
                planes.push((h, false));
            }
        }
        self.ll_invalid_edges = ADJ_TILE_ALL;
        planes
    }
}

/// All tile states of one slide, flat, indexed by [`Pyramid`] tile indices.
pub struct TileTable {
    tiles: Vec<TileState>,
}

impl TileTable {
    pub fn get(&self, index: u32) -> &TileState {
        &self.tiles[index as usize]
    }

    pub fn get_mut(&mut self, index: u32) -> &mut TileState {
        &mut self.tiles[index as usize]
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }
}

/// Immutable geometry of one pyramid level.
#[derive(Debug, Clone, PartialEq)]
pub struct Level {
    pub scale: u32,
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    pub downsample_factor: f64,
    pub origin_offset: f64,
    pub um_per_pixel_x: f64,
    pub um_per_pixel_y: f64,
    /// Flat index of this level's tile (0, 0).
    pub(crate) tile_base: u32,
}

impl Level {
    pub fn tile_count(&self) -> u32 {
        self.width_in_tiles * self.height_in_tiles
    }
}

/// Immutable pyramid geometry plus the flat tile index space.
pub struct Pyramid {
    levels: Vec<Level>,
    pub tile_width: u32,
    pub tile_height: u32,
}

impl Pyramid {
    /// Build geometry and the zero-initialized tile table from a parsed
    /// layout.
    pub fn from_layout(layout: &SlideLayout) -> (Pyramid, TileTable) {
        let mut levels = Vec::with_capacity(layout.levels.len());
        let mut tiles = Vec::new();
        for level in &layout.levels {
            levels.push(Level {
                scale: level.scale,
                width_in_tiles: level.width_in_tiles,
                height_in_tiles: level.height_in_tiles,
                downsample_factor: level.downsample_factor,
                origin_offset: level.origin_offset,
                um_per_pixel_x: level.um_per_pixel_x,
                um_per_pixel_y: level.um_per_pixel_y,
                tile_base: tiles.len() as u32,
            });
            for descriptor in &level.tiles {
                tiles.push(TileState {
                    exists: descriptor.exists,
                    ll_invalid_edges: ADJ_TILE_ALL,
                    codeblock_index: descriptor.codeblock_index,
                    codeblock_chunk_index: descriptor.codeblock_chunk_index,
                    data_chunk_index: descriptor.data_chunk_index,
                    cache_marked: false,
                    channels: Default::default(),
                });
            }
        }
        (
            Pyramid {
                levels,
                tile_width: layout.block_width,
                tile_height: layout.block_height,
            },
            TileTable { tiles },
        )
    }

    pub fn level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn max_scale(&self) -> u32 {
        self.level_count().saturating_sub(1)
    }

    pub fn level(&self, scale: u32) -> Option<&Level> {
        self.levels.get(scale as usize)
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Flat index of the tile at `(scale, tx, ty)`, if in bounds.
    pub fn tile_index(&self, scale: u32, tile_x: u32, tile_y: u32) -> Option<u32> {
        let level = self.level(scale)?;
        if tile_x >= level.width_in_tiles || tile_y >= level.height_in_tiles {
            return None;
        }
        Some(level.tile_base + tile_y * level.width_in_tiles + tile_x)
    }

    /// `(scale, tx, ty)` of a flat tile index.
    pub fn tile_coord(&self, index: u32) -> (u32, u32, u32) {
        for level in &self.levels {
            let count = level.tile_count();
            if index >= level.tile_base && index < level.tile_base + count {
                let local = index - level.tile_base;
                return (
                    level.scale,
                    local % level.width_in_tiles,
                    local / level.width_in_tiles,
                );
            }
        }
        unreachable!("tile index {} outside every level", index)
    }

    /// The parent tile one scale up, if any.
    pub fn parent_of(&self, index: u32) -> Option<u32> {
        let (scale, tx, ty) = self.tile_coord(index);
        if scale >= self.max_scale() {
            return None;
        }
        self.tile_index(scale + 1, tx / 2, ty / 2)
    }

    /// The four child positions one scale down; out-of-bounds children are
    /// `None`. Order: top-left, top-right, bottom-left, bottom-right.
    pub fn children_of(&self, index: u32) -> [Option<u32>; 4] {
        let (scale, tx, ty) = self.tile_coord(index);
        if scale == 0 {
            return [None; 4];
        }
        let child_scale = scale - 1;
        [
            self.tile_index(child_scale, tx * 2, ty * 2),
            self.tile_index(child_scale, tx * 2 + 1, ty * 2),
            self.tile_index(child_scale, tx * 2, ty * 2 + 1),
            self.tile_index(child_scale, tx * 2 + 1, ty * 2 + 1),
        ]
    }

    /// The neighbor at `(dx, dy)` on the same level, if in bounds.
    pub fn neighbor_of(&self, index: u32, dx: i32, dy: i32) -> Option<u32> {
        let (scale, tx, ty) = self.tile_coord(index);
        let nx = tx as i64 + dx as i64;
        let ny = ty as i64 + dy as i64;
        if nx < 0 || ny < 0 {
            return None;
        }
        self.tile_index(scale, nx as u32, ny as u32)
    }
}
