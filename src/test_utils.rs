//! Shared test fixtures: synthetic pyramids served through the raw codec.
//!
//! The fixture writes a container image whose codeblocks are uncompressed
//! coefficient planes laid out with the real chunking rule (top chunks
//! carry LL + up to three scales of H, leaf chunks carry a single H), so
//! engine tests exercise the same directory arithmetic as production
//! containers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::SlideCache;
use crate::decoder::{CoeffDecoder, RawCoeffDecoder};
use crate::error::IsyntaxResult;
use crate::format::{
    chunk_codeblocks_per_color, CodeblockEntry, DataChunk, EmbeddedImage, LevelLayout,
    SlideLayout, SlideProperties, TileDescriptor,
};
use crate::io::{BlockSource, MemorySource};
use crate::slide::{ContainerFormat, OpenFlags, Slide};

pub(crate) struct FixtureSpec {
    /// Tile grids, scale 0 first.
    pub grids: Vec<(u32, u32)>,
    pub tile_size: u32,
    /// Tiles the container "does not store", as `(scale, tx, ty)`.
    pub missing: Vec<(u32, u32, u32)>,
    /// Origin offset applied to every level.
    pub origin_offset: f64,
    pub label_jpeg: Option<Vec<u8>>,
    /// Make every LL plane this constant and every H plane zero, so the
    /// whole image renders one flat color.
    pub constant_ll: Option<i16>,
    /// Cut the color-0 H codeblock of this tile short to provoke a
    /// decompression failure.
    pub truncate_h_for: Option<(u32, u32, u32)>,
}

impl Default for FixtureSpec {
    fn default() -> Self {
        Self {
            grids: vec![(4, 4), (2, 2), (1, 1), (1, 1)],
            tile_size: 16,
            missing: Vec::new(),
            origin_offset: 0.0,
            label_jpeg: None,
            constant_ll: None,
            truncate_h_for: None,
        }
    }
}

fn plane_seed(scale: u32, tile_x: u32, tile_y: u32, color: u32, kind: u32) -> u64 {
    ((scale as u64) << 40)
        ^ ((tile_x as u64) << 28)
        ^ ((tile_y as u64) << 16)
        ^ ((color as u64) << 8)
        ^ kind as u64
}

fn ll_plane(spec: &FixtureSpec, seed: u64, len: usize) -> Vec<i16> {
    match spec.constant_ll {
        Some(value) => vec![value; len],
        None => (0..len)
            .map(|i| 40 + ((seed.wrapping_mul(31).wrapping_add(i as u64 * 7) % 180) as i16))
            .collect(),
    }
}

fn h_plane(spec: &FixtureSpec, seed: u64, len: usize) -> Vec<i16> {
    if spec.constant_ll.is_some() {
        return vec![0; len];
    }
    (0..len)
        .map(|i| ((seed.wrapping_mul(13).wrapping_add(i as u64 * 5) % 21) as i16) - 10)
        .collect()
}

fn push_plane(data: &mut Vec<u8>, values: &[i16], truncate: bool) -> CodeblockEntry {
    let offset = data.len() as u64;
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let take = if truncate { bytes.len() / 2 } else { bytes.len() };
    data.extend_from_slice(&bytes[..take]);
    CodeblockEntry {
        offset,
        size: take as u64,
    }
}

/// Build the parsed layout plus the container bytes it refers to.
pub(crate) fn synthetic_layout(spec: &FixtureSpec) -> (SlideLayout, Vec<u8>) {
    let max_scale = (spec.grids.len() - 1) as u32;
    let ts = spec.tile_size;
    let plane_len = (ts * ts) as usize;

    // Chunk groups from the top down, each spanning up to three scales.
    let mut groups: Vec<(u32, u32)> = Vec::new();
    let mut scale = max_scale as i64;
    while scale >= 0 {
        let levels_in = (scale + 1).min(3) as u32;
        groups.push((scale as u32, levels_in));
        scale -= levels_in as i64;
    }

    let mut data: Vec<u8> = Vec::new();
    let mut codeblocks: Vec<CodeblockEntry> = Vec::new();
    let mut data_chunks: Vec<DataChunk> = Vec::new();
    // (top scale, cx, cy) -> (chunk index, first codeblock index, has_ll)
    let mut chunk_lookup: HashMap<(u32, u32, u32), (u32, u32, bool)> = HashMap::new();

    for &(top, levels_in) in &groups {
        let has_ll = top == max_scale;
        let count = chunk_codeblocks_per_color(levels_in, has_ll);
        let h_count = chunk_codeblocks_per_color(levels_in, false);
        let (grid_w, grid_h) = spec.grids[top as usize];
        for cy in 0..grid_h {
            for cx in 0..grid_w {
                let chunk_base = codeblocks.len() as u32;
                chunk_lookup.insert((top, cx, cy), (data_chunks.len() as u32, chunk_base, has_ll));
                data_chunks.push(DataChunk {
                    top_codeblock_index: chunk_base,
                    codeblock_count_per_color: count,
                    scale: top,
                    level_count: levels_in,
                });

                for color in 0..3u32 {
                    if has_ll {
                        let values =
                            ll_plane(spec, plane_seed(top, cx, cy, color, 0), plane_len);
                        codeblocks.push(push_plane(&mut data, &values, false));
                    }
                    for slot in 0..h_count {
                        let (s, tx, ty) = match slot {
                            0 => (top, cx, cy),
                            1..=4 => (top - 1, cx * 2 + (slot - 1) % 2, cy * 2 + (slot - 1) / 2),
                            _ => (top - 2, cx * 4 + (slot - 5) % 4, cy * 4 + (slot - 5) / 4),
                        };
                        let truncate =
                            color == 0 && spec.truncate_h_for == Some((s, tx, ty));
                        let values =
                            h_plane(spec, plane_seed(s, tx, ty, color, 1), plane_len * 3);
                        codeblocks.push(push_plane(&mut data, &values, truncate));
                    }
                }
            }
        }
    }

    let levels = spec
        .grids
        .iter()
        .enumerate()
        .map(|(s, &(grid_w, grid_h))| {
            let s = s as u32;
            let (top, _) = *groups
                .iter()
                .find(|&&(top, levels_in)| s <= top && s + levels_in > top)
                .expect("every scale belongs to a chunk group");
            let shift = top - s;
            let downsample = (1u64 << s) as f64;
            LevelLayout {
                scale: s,
                width_in_tiles: grid_w,
                height_in_tiles: grid_h,
                downsample_factor: downsample,
                origin_offset: spec.origin_offset,
                um_per_pixel_x: 0.25 * downsample,
                um_per_pixel_y: 0.25 * downsample,
                tiles: (0..grid_w * grid_h)
                    .map(|i| {
                        let tx = i % grid_w;
                        let ty = i / grid_w;
                        let (chunk_index, base, has_ll) =
                            chunk_lookup[&(top, tx >> shift, ty >> shift)];
                        TileDescriptor {
                            exists: !spec.missing.contains(&(s, tx, ty)),
                            codeblock_index: base,
                            codeblock_chunk_index: base + has_ll as u32,
                            data_chunk_index: chunk_index,
                        }
                    })
                    .collect(),
            }
        })
        .collect();

    let label_image = spec.label_jpeg.as_ref().map(|jpeg| {
        let offset = data.len() as u64;
        data.extend_from_slice(jpeg);
        EmbeddedImage {
            offset,
            size: jpeg.len() as u64,
        }
    });

    let layout = SlideLayout {
        block_width: ts,
        block_height: ts,
        compressor_version: 1,
        data_model_major_version: 5,
        levels,
        codeblocks,
        data_chunks,
        properties: SlideProperties {
            barcode: Some("FIXTURE-0001".to_string()),
            mpp_x: Some(0.25),
            mpp_y: Some(0.25),
            width: spec.grids[0].0 * ts,
            height: spec.grids[0].1 * ts,
        },
        label_image,
        macro_image: None,
    };
    (layout, data)
}

/// Slide over an in-memory container, with a cache already injected.
pub(crate) fn memory_slide(spec: &FixtureSpec) -> (Slide, SlideCache) {
    memory_slide_with_cache(spec, 1000)
}

pub(crate) fn memory_slide_with_cache(
    spec: &FixtureSpec,
    target_cache_size: usize,
) -> (Slide, SlideCache) {
    let (layout, data) = synthetic_layout(spec);
    let slide = Slide::from_parts(
        Box::new(MemorySource::new(data)),
        Box::new(RawCoeffDecoder),
        layout,
    )
    .unwrap();
    let cache = SlideCache::new("fixture", target_cache_size);
    cache.inject(&slide).unwrap();
    (slide, cache)
}

/// A block source that counts `read_at` calls, for zero-IO assertions.
pub(crate) struct CountingSource {
    inner: MemorySource,
    reads: Arc<AtomicU64>,
}

impl BlockSource for CountingSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.inner.read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }
}

/// Slide whose source reports how many reads the engine issued.
pub(crate) fn counting_slide(spec: &FixtureSpec) -> (Slide, SlideCache, Arc<AtomicU64>) {
    let (layout, data) = synthetic_layout(spec);
    let reads = Arc::new(AtomicU64::new(0));
    let source = CountingSource {
        inner: MemorySource::new(data),
        reads: Arc::clone(&reads),
    };
    let slide = Slide::from_parts(Box::new(source), Box::new(RawCoeffDecoder), layout).unwrap();
    let cache = SlideCache::new("counting", 1000);
    cache.inject(&slide).unwrap();
    (slide, cache, reads)
}

/// Container front-end serving a pre-parsed layout; honors the
/// barcode-only flag by dropping the pyramid.
pub(crate) struct TestContainer {
    layout: SlideLayout,
}

impl TestContainer {
    pub(crate) fn new(layout: SlideLayout) -> Self {
        Self { layout }
    }
}

impl ContainerFormat for TestContainer {
    fn parse(&self, _source: &dyn BlockSource, flags: OpenFlags) -> IsyntaxResult<SlideLayout> {
        let mut layout = self.layout.clone();
        if flags == OpenFlags::BarcodeOnly {
            layout.levels.clear();
            layout.codeblocks.clear();
            layout.data_chunks.clear();
        }
        Ok(layout)
    }

    fn coefficient_decoder(&self) -> Box<dyn CoeffDecoder> {
        Box::new(RawCoeffDecoder)
    }
}
