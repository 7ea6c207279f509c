//! Parser-facing data model for slide containers.
//!
//! The container header (the XML metadata tree and its seek-table) is
//! parsed by an external front-end; that front-end hands the engine a
//! [`SlideLayout`]: pyramid geometry, the read-only codeblock directory,
//! the chunk grouping, and the scanner properties. Everything in here is
//! immutable once a slide is open.

use serde::Serialize;

use crate::error::{IsyntaxError, IsyntaxResult};

/// Wavelet-transform padding accumulated per pyramid level by the scanner.
pub const PER_LEVEL_PADDING: u32 = 3;

/// Origin offset (in level pixels) that region reads must add to their
/// coordinates to compensate for the padding accumulated across levels.
///
/// The trailing `-1.5` is a calibration value carried over from the
/// reference pipeline; validate it against known-good output when wiring a
/// new container front-end.
pub fn level_origin_offset(per_level_padding: u32, level_count: u32, downsample: f64) -> f64 {
    let padding = ((per_level_padding as u64) << level_count) - per_level_padding as u64;
    padding as f64 / downsample - 1.5
}

/// Number of codeblocks one chunk stores per color channel.
///
/// A chunk covers up to three consecutive scales below its top scale: one H
/// codeblock at the top scale, a 2x2 grid one scale down, a 4x4 grid two
/// scales down. Chunks at the pyramid top additionally lead with one LL
/// codeblock.
pub fn chunk_codeblocks_per_color(levels_in_chunk: u32, has_ll: bool) -> u32 {
    let mut count = 0;
    for scale_in_chunk in 0..levels_in_chunk {
        count += 1 << (2 * scale_in_chunk);
    }
    if has_ll {
        count += 1;
    }
    count
}

/// H codeblock slot within a chunk for a tile at `scale_in_chunk` scales
/// below the chunk's top scale.
pub fn codeblock_slot_in_chunk(scale_in_chunk: u32, tile_x: u32, tile_y: u32) -> IsyntaxResult<u32> {
    match scale_in_chunk {
        0 => Ok(0),
        1 => Ok(1 + (tile_y % 2) * 2 + (tile_x % 2)),
        2 => Ok(5 + (tile_y % 4) * 4 + (tile_x % 4)),
        _ => Err(IsyntaxError::Fatal(format!(
            "tile is {} scales below its chunk top; chunks span at most 3 scales",
            scale_in_chunk
        ))),
    }
}

/// One entry of the codeblock seek-table: where the compressed payload
/// lives in the container.
#[derive(Debug, Clone, Copy)]
pub struct CodeblockEntry {
    pub offset: u64,
    pub size: u64,
}

/// A group of codeblocks at up to three adjacent scales sharing a file
/// locality region.
#[derive(Debug, Clone, Copy)]
pub struct DataChunk {
    /// Index of the chunk's first codeblock in the directory (color 0).
    pub top_codeblock_index: u32,
    /// Directory stride between the three color channels of this chunk.
    pub codeblock_count_per_color: u32,
    /// The chunk's top scale.
    pub scale: u32,
    /// How many scales the chunk covers (1..=3).
    pub level_count: u32,
}

/// Parser-provided per-tile wiring into the codeblock directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct TileDescriptor {
    /// Whether the container stores any codeblock for this tile.
    pub exists: bool,
    /// Directory index of the tile's LL codeblock (top-scale tiles only).
    pub codeblock_index: u32,
    /// Directory index of the first H codeblock of the tile's chunk.
    pub codeblock_chunk_index: u32,
    /// Index into [`SlideLayout::data_chunks`].
    pub data_chunk_index: u32,
}

/// Geometry and tile wiring of one pyramid level.
#[derive(Debug, Clone)]
pub struct LevelLayout {
    pub scale: u32,
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    /// Downsample factor relative to level 0 (1.0, 2.0, 4.0, ...).
    pub downsample_factor: f64,
    /// Origin offset in level pixels; see [`level_origin_offset`].
    pub origin_offset: f64,
    pub um_per_pixel_x: f64,
    pub um_per_pixel_y: f64,
    /// Row-major tile descriptors, `width_in_tiles * height_in_tiles` long.
    pub tiles: Vec<TileDescriptor>,
}

/// Byte range of an embedded image (label or macro JPEG).
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedImage {
    pub offset: u64,
    pub size: u64,
}

/// Scanner-reported slide properties.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SlideProperties {
    pub barcode: Option<String>,
    pub mpp_x: Option<f64>,
    pub mpp_y: Option<f64>,
    /// Level-0 pixel dimensions as reported by the container.
    pub width: u32,
    pub height: u32,
}

/// Everything the engine needs to serve reads from one container, as
/// produced by the (external) header parser.
#[derive(Debug, Clone)]
pub struct SlideLayout {
    pub block_width: u32,
    pub block_height: u32,
    pub compressor_version: i32,
    /// `< 100` for format v1 (`UFSImageBlockHeader`), `>= 100` for v2
    /// (`UFSImageClusterHeaderTemplate`). Both share this pipeline.
    pub data_model_major_version: i32,
    /// Levels ordered by scale ascending; index == scale.
    pub levels: Vec<LevelLayout>,
    pub codeblocks: Vec<CodeblockEntry>,
    pub data_chunks: Vec<DataChunk>,
    pub properties: SlideProperties,
    pub label_image: Option<EmbeddedImage>,
    pub macro_image: Option<EmbeddedImage>,
}

impl SlideLayout {
    /// Check internal consistency before the engine trusts the layout.
    pub fn validate(&self) -> IsyntaxResult<()> {
        if self.block_width == 0 || self.block_height == 0 {
            return Err(IsyntaxError::invalid("block dimensions must be non-zero"));
        }
        for (index, level) in self.levels.iter().enumerate() {
            if level.scale as usize != index {
                return Err(IsyntaxError::invalid(format!(
                    "level {} reports scale {}",
                    index, level.scale
                )));
            }
            let expected = level.width_in_tiles as usize * level.height_in_tiles as usize;
            if level.tiles.len() != expected {
                return Err(IsyntaxError::invalid(format!(
                    "level {} has {} tile descriptors for a {}x{} grid",
                    index,
                    level.tiles.len(),
                    level.width_in_tiles,
                    level.height_in_tiles
                )));
            }
            for tile in &level.tiles {
                if !tile.exists {
                    continue;
                }
                let chunk = self
                    .data_chunks
                    .get(tile.data_chunk_index as usize)
                    .ok_or_else(|| {
                        IsyntaxError::invalid(format!(
                            "tile references data chunk {} of {}",
                            tile.data_chunk_index,
                            self.data_chunks.len()
                        ))
                    })?;
                // The chunk occupies three color-major groups of
                // `codeblock_count_per_color` directory entries.
                let chunk_end = chunk.top_codeblock_index as u64
                    + 3 * chunk.codeblock_count_per_color as u64;
                if chunk_end > self.codeblocks.len() as u64 {
                    return Err(IsyntaxError::invalid(format!(
                        "data chunk runs past the codeblock directory ({} > {})",
                        chunk_end,
                        self.codeblocks.len()
                    )));
                }
                let offset_in_chunk = tile
                    .codeblock_chunk_index
                    .checked_sub(chunk.top_codeblock_index);
                match offset_in_chunk {
                    Some(offset) if offset < chunk.codeblock_count_per_color => {}
                    _ => {
                        return Err(IsyntaxError::invalid(format!(
                            "tile H slot base {} is outside its chunk at {}",
                            tile.codeblock_chunk_index, chunk.top_codeblock_index
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn max_scale(&self) -> u32 {
        self.level_count().saturating_sub(1)
    }
}
