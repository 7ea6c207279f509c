//! Tile reconstruction: coefficient loading, inverse-transform execution,
//! and color conversion.
//!
//! `read_tile` resolves the dependency closure for the target, loads the
//! missing codeblocks, walks the idwt list top-down synthesizing LL planes
//! for the levels below, and finally converts the target's low-pass planes
//! to packed pixels. The whole call runs under the cache mutex; the final
//! bookkeeping (LRU splices and the trim) runs even when a phase failed,
//! so every plane allocated before the failure stays a consistent cache
//! entry.

use log::{debug, warn};

use crate::block_pool::{BlockPool, CoeffPlane};
use crate::cache::{trim_inner, CachePools, SlideCache, TileKey};
use crate::decoder::CoeffKind;
use crate::error::{IsyntaxError, IsyntaxResult};
use crate::format::codeblock_slot_in_chunk;
use crate::idwt::{IDWT_FIRST_VALID_PIXEL, IDWT_PAD_LEFT, IDWT_PAD_RIGHT};
use crate::planner::build_tile_lists;
use crate::slide::Slide;
use crate::tile::{adjacency_bit, TileState, TileTable};

/// Output pixel layouts. Both are 4 bytes per pixel with alpha last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba,
    Bgra,
}

fn release_planes(pool: &BlockPool, staged: Vec<CoeffPlane>) {
    for plane in staged {
        pool.free(plane);
    }
}

/// Load one kind of coefficient plane for all three color channels of a
/// tile. All-or-nothing: on failure every plane allocated here goes back
/// to its pool and the tile keeps its previous state.
fn load_plane(
    slide: &Slide,
    pools: &CachePools,
    state: &mut TileState,
    base_index: u32,
    count_per_color: u32,
    kind: CoeffKind,
) -> IsyntaxResult<()> {
    let pool = match kind {
        CoeffKind::Ll => &pools.ll,
        CoeffKind::H => &pools.h,
    };
    let mut staged: Vec<CoeffPlane> = Vec::with_capacity(3);
    for color in 0..3usize {
        let index = base_index as usize + color * count_per_color as usize;
        let entry = match slide.codeblock(index) {
            Ok(entry) => *entry,
            Err(e) => {
                release_planes(pool, staged);
                return Err(e);
            }
        };
        let mut plane = match pool.alloc() {
            Ok(plane) => plane,
            Err(e) => {
                release_planes(pool, staged);
                return Err(e);
            }
        };
        // Seven slack bytes so the bitstream decoder may over-read by up
        // to 56 bits without leaving the buffer.
        let mut payload = vec![0u8; entry.size as usize + 7];
        if let Err(e) = slide
            .source()
            .read_at(entry.offset, &mut payload[..entry.size as usize])
        {
            warn!(
                "codeblock read failed at offset {} ({} bytes): {}",
                entry.offset, entry.size, e
            );
            pool.free(plane);
            release_planes(pool, staged);
            return Err(IsyntaxError::Io(e));
        }
        if let Err(e) = slide.codec().decode(
            &payload,
            slide.tile_width(),
            slide.tile_height(),
            kind,
            slide.compressor_version(),
            &mut plane,
        ) {
            pool.free(plane);
            release_planes(pool, staged);
            return Err(e);
        }
        staged.push(plane);
    }

    for (color, plane) in staged.into_iter().enumerate() {
        match kind {
            CoeffKind::Ll => state.channels[color].ll = Some(plane),
            CoeffKind::H => state.channels[color].h = Some(plane),
        }
    }
    if kind == CoeffKind::Ll {
        state.ll_invalid_edges = 0;
    }
    Ok(())
}

/// Bring a tile's persisted coefficients into memory: H always, LL only at
/// the pyramid top where no parent can produce it.
fn load_tile_coefficients(
    slide: &Slide,
    pools: &CachePools,
    table: &mut TileTable,
    tile: u32,
) -> IsyntaxResult<()> {
    let (scale, tile_x, tile_y) = slide.pyramid().tile_coord(tile);
    let max_scale = slide.pyramid().max_scale();
    let state = table.get_mut(tile);
    if !state.exists {
        return Ok(());
    }
    let chunk = *slide.data_chunk(state.data_chunk_index)?;

    if scale == max_scale && !state.has_ll() {
        let base = state.codeblock_index;
        load_plane(
            slide,
            pools,
            state,
            base,
            chunk.codeblock_count_per_color,
            CoeffKind::Ll,
        )?;
    }

    if !state.has_h() {
        let scale_in_chunk = chunk.scale.checked_sub(scale).ok_or_else(|| {
            IsyntaxError::Fatal(format!(
                "tile at scale {} belongs to a chunk with top scale {}",
                scale, chunk.scale
            ))
        })?;
        let slot = codeblock_slot_in_chunk(scale_in_chunk, tile_x, tile_y)?;
        let base = state.codeblock_chunk_index + slot;
        load_plane(
            slide,
            pools,
            state,
            base,
            chunk.codeblock_count_per_color,
            CoeffKind::H,
        )?;
    }
    Ok(())
}

fn copy_rect(
    dst: &mut [i16],
    dst_stride: usize,
    dst_x: usize,
    dst_y: usize,
    src: &[i16],
    src_stride: usize,
    src_x: usize,
    src_y: usize,
    width: usize,
    height: usize,
) {
    for row in 0..height {
        let d0 = (dst_y + row) * dst_stride + dst_x;
        let s0 = (src_y + row) * src_stride + src_x;
        dst[d0..d0 + width].copy_from_slice(&src[s0..s0 + width]);
    }
}

/// Assemble the padded quadrant buffer for one channel of a tile: its own
/// subbands in the center, 4-coefficient strips from the 8 neighbors
/// around them. Neighbours that are out of bounds, absent from the
/// container, or flagged in `ll_invalid_edges` contribute the shared dummy
/// planes instead.
fn gather_quadrants(slide: &Slide, table: &TileTable, tile: u32, channel: usize) -> Vec<i16> {
    let tw = slide.tile_width() as usize;
    let th = slide.tile_height() as usize;
    debug_assert!(tw >= IDWT_PAD_LEFT && th >= IDWT_PAD_LEFT);
    let qw = tw + IDWT_PAD_LEFT + IDWT_PAD_RIGHT;
    let qh = th + IDWT_PAD_LEFT + IDWT_PAD_RIGHT;
    let full_w = 2 * qw;
    let full_h = 2 * qh;
    let mut buf = vec![0i16; full_w * full_h];

    let quadrant_len = tw * th;
    let center_edges = table.get(tile).ll_invalid_edges;

    for dy in -1..=1i32 {
        for dx in -1..=1i32 {
            let is_center = dx == 0 && dy == 0;
            let neighbor = if is_center {
                Some(tile)
            } else {
                slide.pyramid().neighbor_of(tile, dx, dy)
            };
            let (ll_src, h_src): (&[i16], &[i16]) = match neighbor {
                Some(n) => {
                    let ns = table.get(n);
                    let edge_blocked =
                        !is_center && (center_edges & adjacency_bit(dx, dy)) != 0;
                    let ll = if ns.exists && !edge_blocked {
                        ns.channels[channel]
                            .ll
                            .as_deref()
                            .unwrap_or_else(|| slide.ll_dummy())
                    } else {
                        slide.ll_dummy()
                    };
                    let h = if ns.exists {
                        ns.channels[channel]
                            .h
                            .as_deref()
                            .unwrap_or_else(|| slide.h_dummy())
                    } else {
                        slide.h_dummy()
                    };
                    (ll, h)
                }
                None => (slide.ll_dummy(), slide.h_dummy()),
            };

            let (dst_x, src_x, width) = match dx {
                -1 => (0, tw - IDWT_PAD_LEFT, IDWT_PAD_LEFT),
                0 => (IDWT_PAD_LEFT, 0, tw),
                _ => (IDWT_PAD_LEFT + tw, 0, IDWT_PAD_RIGHT),
            };
            let (dst_y, src_y, height) = match dy {
                -1 => (0, th - IDWT_PAD_LEFT, IDWT_PAD_LEFT),
                0 => (IDWT_PAD_LEFT, 0, th),
                _ => (IDWT_PAD_LEFT + th, 0, IDWT_PAD_RIGHT),
            };

            // Low-pass quadrant, then the three detail quadrants from the
            // packed H plane: horizontal, vertical, diagonal.
            copy_rect(
                &mut buf, full_w, dst_x, dst_y, ll_src, tw, src_x, src_y, width, height,
            );
            let quadrant_origin = [(qw, 0), (0, qh), (qw, qh)];
            for (subband, &(ox, oy)) in quadrant_origin.iter().enumerate() {
                copy_rect(
                    &mut buf,
                    full_w,
                    ox + dst_x,
                    oy + dst_y,
                    &h_src[subband * quadrant_len..(subband + 1) * quadrant_len],
                    tw,
                    src_x,
                    src_y,
                    width,
                    height,
                );
            }
        }
    }
    buf
}

/// Run the inverse transform for one tile and write the four output
/// quadrants into the LL planes of the children that still lack one.
fn synthesize_children(
    slide: &Slide,
    table: &mut TileTable,
    pools: &CachePools,
    tile: u32,
) -> IsyntaxResult<()> {
    let pyramid = slide.pyramid();
    let children = pyramid.children_of(tile);

    let mut pending: Vec<(usize, u32)> = Vec::new();
    for (slot, child) in children.iter().enumerate() {
        if let Some(child) = child {
            let state = table.get(*child);
            if state.exists && !state.has_ll() {
                pending.push((slot, *child));
            }
        }
    }
    if pending.is_empty() {
        return Ok(());
    }

    let tw = slide.tile_width() as usize;
    let th = slide.tile_height() as usize;
    let qw = tw + IDWT_PAD_LEFT + IDWT_PAD_RIGHT;
    let qh = th + IDWT_PAD_LEFT + IDWT_PAD_RIGHT;
    let full_w = 2 * qw;

    // All output planes are claimed before any synthesis so a pool failure
    // cannot leave a child half-written.
    let mut staged: Vec<Vec<CoeffPlane>> = Vec::with_capacity(pending.len());
    for _ in &pending {
        let mut planes: Vec<CoeffPlane> = Vec::with_capacity(3);
        let mut failure: Option<IsyntaxError> = None;
        for _ in 0..3 {
            match pools.ll.alloc() {
                Ok(plane) => planes.push(plane),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            release_planes(&pools.ll, planes);
            for set in staged {
                release_planes(&pools.ll, set);
            }
            return Err(e);
        }
        staged.push(planes);
    }

    for channel in 0..3usize {
        let mut buf = gather_quadrants(slide, table, tile, channel);
        slide.idwt().synthesize(&mut buf, qw, qh);
        for (index, &(slot, _)) in pending.iter().enumerate() {
            let (ox, oy) = [(0, 0), (tw, 0), (0, th), (tw, th)][slot];
            copy_rect(
                &mut staged[index][channel],
                tw,
                0,
                0,
                &buf,
                full_w,
                IDWT_FIRST_VALID_PIXEL + ox,
                IDWT_FIRST_VALID_PIXEL + oy,
                tw,
                th,
            );
        }
    }

    for ((_, child), planes) in pending.into_iter().zip(staged) {
        let state = table.get_mut(child);
        for (channel, plane) in planes.into_iter().enumerate() {
            state.channels[channel].ll = Some(plane);
        }
        state.ll_invalid_edges = 0;
    }
    Ok(())
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Convert the target tile's three low-pass planes through the lossless
/// inverse YCoCg-R transform into packed pixels, alpha 255.
fn render_target(slide: &Slide, table: &TileTable, tile: u32, out: &mut [u8], format: PixelFormat) {
    let tw = slide.tile_width() as usize;
    let th = slide.tile_height() as usize;
    let state = table.get(tile);
    let planes: [&[i16]; 3] = [0, 1, 2].map(|channel| {
        state.channels[channel]
            .ll
            .as_deref()
            .unwrap_or_else(|| slide.ll_dummy())
    });

    for i in 0..tw * th {
        let y = planes[0][i] as i32;
        let co = planes[1][i] as i32;
        let cg = planes[2][i] as i32;
        let t = y - (cg >> 1);
        let g = cg + t;
        let b = t - (co >> 1);
        let r = b + co;

        let o = i * 4;
        let pixel = match format {
            PixelFormat::Rgba => [clamp_u8(r), clamp_u8(g), clamp_u8(b), 255],
            PixelFormat::Bgra => [clamp_u8(b), clamp_u8(g), clamp_u8(r), 255],
        };
        out[o..o + 4].copy_from_slice(&pixel);
    }
}

/// The `read_tile` core. See `Slide::read_tile` for the public contract.
pub(crate) fn read_tile_impl(
    slide: &Slide,
    cache: &SlideCache,
    level: u32,
    tile_x: u32,
    tile_y: u32,
    out: &mut [u8],
    format: PixelFormat,
) -> IsyntaxResult<()> {
    let pyramid = slide.pyramid();
    if pyramid.level_count() == 0 {
        return Err(IsyntaxError::not_found("slide has no pyramid"));
    }
    let Some(target) = pyramid.tile_index(level, tile_x, tile_y) else {
        return Err(IsyntaxError::invalid(format!(
            "tile ({}, {}, {}) is out of range",
            level, tile_x, tile_y
        )));
    };
    let expected = slide.tile_width() as usize * slide.tile_height() as usize * 4;
    if out.len() != expected {
        return Err(IsyntaxError::invalid(format!(
            "tile buffer is {} bytes, expected {}",
            out.len(),
            expected
        )));
    }
    let binding = slide
        .binding()
        .ok_or_else(|| IsyntaxError::invalid("slide is not attached to a cache"))?;
    if binding.cache_id != cache.id {
        return Err(IsyntaxError::invalid(
            "slide is attached to a different cache",
        ));
    }
    let file = binding.file;

    let mut inner_guard = cache.inner.lock();
    let inner = &mut *inner_guard;
    let shared = slide.shared_tiles();
    let mut table_guard = shared.lock();
    let table = &mut *table_guard;

    // A tile the container does not store is served as opaque white and
    // leaves the cache untouched.
    if !table.get(target).exists {
        out.fill(0xFF);
        return Ok(());
    }

    let pools = inner
        .pools
        .as_ref()
        .ok_or_else(|| IsyntaxError::Fatal("cache pools missing after inject".into()))?;

    let lists = build_tile_lists(pyramid, table, target, true);
    debug!(
        "closure for ({}, {}, {}): {} idwt, {} coeff, {} children",
        level,
        tile_x,
        tile_y,
        lists.idwt.len(),
        lists.coeff.len(),
        lists.children.len()
    );

    let mut result = Ok(());
    for &tile in &lists.coeff {
        if let Err(e) = load_tile_coefficients(slide, pools, table, tile) {
            result = Err(e);
            break;
        }
    }
    if result.is_ok() {
        for &tile in &lists.idwt {
            if let Err(e) = load_tile_coefficients(slide, pools, table, tile) {
                result = Err(e);
                break;
            }
        }
    }
    if result.is_ok() {
        // Ancestors first; the target is the list head.
        for &tile in lists.idwt.iter().rev() {
            if tile == target {
                render_target(slide, table, tile, out, format);
            } else if let Err(e) = synthesize_children(slide, table, pools, tile) {
                result = Err(e);
                break;
            }
        }
    }

    // Bookkeeping runs on success and failure alike: everything touched is
    // bumped, then the cache is trimmed back to its target.
    let to_keys = |tiles: &[u32]| -> Vec<TileKey> {
        tiles.iter().map(|&tile| TileKey { file, tile }).collect()
    };
    inner.lru.splice_front(&to_keys(&lists.children));
    inner.lru.splice_front(&to_keys(&lists.coeff));
    inner.lru.splice_front(&to_keys(&lists.idwt));
    let target_size = inner.target_size;
    trim_inner(inner, target_size, Some((file, table)));

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::decoder::RawCoeffDecoder;
    use crate::io::MemorySource;
    use crate::test_utils::{
        counting_slide, memory_slide, memory_slide_with_cache, synthetic_layout, FixtureSpec,
    };

    fn tile_buf(slide: &Slide) -> Vec<u8> {
        vec![0u8; (slide.tile_width() * slide.tile_height() * 4) as usize]
    }

    fn head_tile(cache: &SlideCache) -> u32 {
        cache.inner.lock().lru.head_key().unwrap().tile
    }

    #[test]
    fn test_top_scale_read_uses_one_tile() {
        let (slide, cache) = memory_slide(&FixtureSpec::default());
        let mut buf = tile_buf(&slide);
        slide
            .read_tile(&cache, 3, 0, 0, &mut buf, PixelFormat::Rgba)
            .unwrap();

        assert_eq!(cache.len(), 1);
        let stats = cache.pool_stats().unwrap();
        assert_eq!(stats.ll_in_use, 3);
        assert_eq!(stats.h_in_use, 3);

        let target = slide.pyramid().tile_index(3, 0, 0).unwrap();
        assert_eq!(head_tile(&cache), target);
        let tiles = slide.lock_tiles();
        assert!(tiles.get(target).has_ll());
        assert!(tiles.get(target).has_h());
    }

    #[test]
    fn test_deep_read_materializes_closure() {
        let (slide, cache) = memory_slide(&FixtureSpec::default());
        let mut buf = tile_buf(&slide);
        slide
            .read_tile(&cache, 0, 0, 0, &mut buf, PixelFormat::Rgba)
            .unwrap();

        // 4 idwt tiles (one per level) + 6 corner neighbors.
        assert_eq!(cache.len(), 10);
        let target = slide.pyramid().tile_index(0, 0, 0).unwrap();
        assert_eq!(head_tile(&cache), target);

        let stats = cache.pool_stats().unwrap();
        // H for all 10 closure tiles; LL for the top tile from the file
        // plus 9 planes-of-three written by the three synthesis steps.
        assert_eq!(stats.h_in_use, 30);
        assert_eq!(stats.ll_in_use, 30);

        let (ll_allocated, h_allocated) = cache.pool_allocated().unwrap();
        assert_eq!(stats.ll_in_use + stats.ll_free, ll_allocated);
        assert_eq!(stats.h_in_use + stats.h_free, h_allocated);

        let tiles = slide.lock_tiles();
        assert!(tiles.get(target).has_ll());
        assert!(tiles.get(target).has_h());
    }

    #[test]
    fn test_repeat_read_is_identical_and_io_free() {
        let (slide, cache, reads) = counting_slide(&FixtureSpec::default());
        let mut first = tile_buf(&slide);
        slide
            .read_tile(&cache, 0, 0, 0, &mut first, PixelFormat::Rgba)
            .unwrap();
        let reads_after_first = reads.load(Ordering::Relaxed);
        assert!(reads_after_first > 0);

        let mut second = tile_buf(&slide);
        slide
            .read_tile(&cache, 0, 0, 0, &mut second, PixelFormat::Rgba)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(reads.load(Ordering::Relaxed), reads_after_first);
        assert_eq!(head_tile(&cache), slide.pyramid().tile_index(0, 0, 0).unwrap());
    }

    #[test]
    fn test_formats_differ_by_byte_swap() {
        let (slide, cache) = memory_slide(&FixtureSpec::default());
        let mut rgba = tile_buf(&slide);
        let mut bgra = tile_buf(&slide);
        slide
            .read_tile(&cache, 1, 0, 0, &mut rgba, PixelFormat::Rgba)
            .unwrap();
        slide
            .read_tile(&cache, 1, 0, 0, &mut bgra, PixelFormat::Bgra)
            .unwrap();

        for (r, b) in rgba.chunks_exact(4).zip(bgra.chunks_exact(4)) {
            assert_eq!(r[0], b[2]);
            assert_eq!(r[1], b[1]);
            assert_eq!(r[2], b[0]);
            assert_eq!(r[3], 255);
            assert_eq!(b[3], 255);
        }
    }

    #[test]
    fn test_trim_to_zero_returns_every_block() {
        let (slide, cache) = memory_slide(&FixtureSpec::default());
        let mut buf = tile_buf(&slide);
        slide
            .read_tile(&cache, 0, 1, 1, &mut buf, PixelFormat::Rgba)
            .unwrap();
        assert!(cache.len() > 0);

        cache.trim(0);
        assert_eq!(cache.len(), 0);
        let stats = cache.pool_stats().unwrap();
        assert_eq!(stats.ll_in_use, 0);
        assert_eq!(stats.h_in_use, 0);
        let (ll_allocated, h_allocated) = cache.pool_allocated().unwrap();
        assert_eq!(stats.ll_free, ll_allocated);
        assert_eq!(stats.h_free, h_allocated);
    }

    #[test]
    fn test_read_after_trim_reloads_identically() {
        let (slide, cache) = memory_slide(&FixtureSpec::default());
        let mut first = tile_buf(&slide);
        slide
            .read_tile(&cache, 3, 0, 0, &mut first, PixelFormat::Rgba)
            .unwrap();
        cache.trim(0);

        let mut second = tile_buf(&slide);
        slide
            .read_tile(&cache, 3, 0, 0, &mut second, PixelFormat::Rgba)
            .unwrap();
        assert_eq!(first, second);
        let stats = cache.pool_stats().unwrap();
        assert_eq!(stats.ll_in_use, 3);
        assert_eq!(stats.h_in_use, 3);
    }

    #[test]
    fn test_small_cache_evicts_least_recent() {
        let (slide, cache) = memory_slide_with_cache(&FixtureSpec::default(), 2);
        let mut buf = tile_buf(&slide);
        slide
            .read_tile(&cache, 0, 0, 0, &mut buf, PixelFormat::Rgba)
            .unwrap();
        // The post-read trim keeps the two freshest: the target and its
        // parent.
        assert_eq!(cache.len(), 2);

        slide
            .read_tile(&cache, 3, 0, 0, &mut buf, PixelFormat::Rgba)
            .unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(head_tile(&cache), slide.pyramid().tile_index(3, 0, 0).unwrap());

        let tiles = slide.lock_tiles();
        let level0_target = slide.pyramid().tile_index(0, 0, 0).unwrap();
        let evicted_parent = slide.pyramid().tile_index(1, 0, 0).unwrap();
        assert!(tiles.get(level0_target).has_h());
        assert!(!tiles.get(evicted_parent).has_h());
        assert!(!tiles.get(evicted_parent).has_ll());
        drop(tiles);

        // Two resident tiles with LL + H across three channels each.
        let stats = cache.pool_stats().unwrap();
        assert_eq!(stats.ll_in_use, 6);
        assert_eq!(stats.h_in_use, 6);
    }

    #[test]
    fn test_missing_tile_renders_white_without_caching() {
        let spec = FixtureSpec {
            missing: vec![(2, 0, 0)],
            ..FixtureSpec::default()
        };
        let (slide, cache) = memory_slide(&spec);
        let mut buf = tile_buf(&slide);
        buf.fill(0xAB);
        slide
            .read_tile(&cache, 2, 0, 0, &mut buf, PixelFormat::Rgba)
            .unwrap();

        assert!(buf.iter().all(|&b| b == 0xFF));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_argument_validation() {
        let (slide, cache) = memory_slide(&FixtureSpec::default());
        let mut buf = tile_buf(&slide);

        assert!(matches!(
            slide.read_tile(&cache, 9, 0, 0, &mut buf, PixelFormat::Rgba),
            Err(IsyntaxError::InvalidArgument(_))
        ));
        assert!(matches!(
            slide.read_tile(&cache, 0, 9, 0, &mut buf, PixelFormat::Rgba),
            Err(IsyntaxError::InvalidArgument(_))
        ));
        let mut short = vec![0u8; 16];
        assert!(matches!(
            slide.read_tile(&cache, 0, 0, 0, &mut short, PixelFormat::Rgba),
            Err(IsyntaxError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_read_requires_matching_cache() {
        let (layout, data) = synthetic_layout(&FixtureSpec::default());
        let loose = Slide::from_parts(
            Box::new(MemorySource::new(data)),
            Box::new(RawCoeffDecoder),
            layout,
        )
        .unwrap();
        let mut buf = tile_buf(&loose);

        // Never injected anywhere.
        let stranger = SlideCache::new("stranger", 10);
        assert!(matches!(
            loose.read_tile(&stranger, 0, 0, 0, &mut buf, PixelFormat::Rgba),
            Err(IsyntaxError::InvalidArgument(_))
        ));

        // Injected into one cache, read through another.
        let (slide, _own_cache) = memory_slide(&FixtureSpec::default());
        let other = SlideCache::new("other", 10);
        assert!(matches!(
            slide.read_tile(&other, 0, 0, 0, &mut buf, PixelFormat::Rgba),
            Err(IsyntaxError::InvalidArgument(_))
        ));

        // Injecting the same slide twice is rejected.
        assert!(matches!(
            other.inject(&slide),
            Err(IsyntaxError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_block_dimension_mismatch_on_inject() {
        let (slide_a, cache) = memory_slide(&FixtureSpec::default());
        let _ = slide_a;
        let spec_b = FixtureSpec {
            tile_size: 32,
            ..FixtureSpec::default()
        };
        let (layout, data) = synthetic_layout(&spec_b);
        let slide_b = Slide::from_parts(
            Box::new(MemorySource::new(data)),
            Box::new(RawCoeffDecoder),
            layout,
        )
        .unwrap();
        assert!(matches!(
            cache.inject(&slide_b),
            Err(IsyntaxError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_shared_cache_accepts_matching_slides() {
        let (slide_a, cache) = memory_slide(&FixtureSpec::default());
        let (layout, data) = synthetic_layout(&FixtureSpec::default());
        let slide_b = Slide::from_parts(
            Box::new(MemorySource::new(data)),
            Box::new(RawCoeffDecoder),
            layout,
        )
        .unwrap();
        cache.inject(&slide_b).unwrap();

        let mut buf = tile_buf(&slide_a);
        slide_a
            .read_tile(&cache, 3, 0, 0, &mut buf, PixelFormat::Rgba)
            .unwrap();
        slide_b
            .read_tile(&cache, 3, 0, 0, &mut buf, PixelFormat::Rgba)
            .unwrap();
        // One top tile per slide resident, in one shared LRU.
        assert_eq!(cache.len(), 2);
        let stats = cache.pool_stats().unwrap();
        assert_eq!(stats.ll_in_use, 6);
        assert_eq!(stats.h_in_use, 6);

        // Trimming through the public call reaches both slides' tables.
        cache.trim(0);
        assert_eq!(cache.pool_stats().unwrap().ll_in_use, 0);
        assert_eq!(cache.pool_stats().unwrap().h_in_use, 0);
    }

    #[test]
    fn test_decompress_failure_leaves_cache_consistent() {
        let spec = FixtureSpec {
            truncate_h_for: Some((0, 0, 0)),
            ..FixtureSpec::default()
        };
        let (slide, cache) = memory_slide(&spec);
        let mut buf = tile_buf(&slide);
        buf.fill(0xAB);

        let result = slide.read_tile(&cache, 0, 0, 0, &mut buf, PixelFormat::Rgba);
        assert!(matches!(result, Err(IsyntaxError::Decompress(_))));
        // No partial pixels.
        assert!(buf.iter().all(|&b| b == 0xAB));

        // The neighbors loaded before the failure stay resident and the
        // pools stay balanced.
        let stats = cache.pool_stats().unwrap();
        assert_eq!(stats.ll_in_use, 0);
        assert_eq!(stats.h_in_use, 18);
        let (ll_allocated, h_allocated) = cache.pool_allocated().unwrap();
        assert_eq!(stats.ll_in_use + stats.ll_free, ll_allocated);
        assert_eq!(stats.h_in_use + stats.h_free, h_allocated);

        // The broken codeblock fails the same way on retry.
        let again = slide.read_tile(&cache, 0, 0, 0, &mut buf, PixelFormat::Rgba);
        assert!(matches!(again, Err(IsyntaxError::Decompress(_))));

        // A clean trim returns everything.
        cache.trim(0);
        let stats = cache.pool_stats().unwrap();
        assert_eq!(stats.h_in_use, 0);
    }

    #[test]
    fn test_injected_idwt_kernel_drives_synthesis() {
        use crate::idwt::IdwtKernel;

        // A stand-in kernel whose output is a known constant, so every LL
        // plane produced below the top level is that constant.
        struct FlatKernel(i16);
        impl IdwtKernel for FlatKernel {
            fn synthesize(&self, buf: &mut [i16], _qw: usize, _qh: usize) {
                buf.fill(self.0);
            }
        }

        let (layout, data) = synthetic_layout(&FixtureSpec::default());
        let slide = Slide::from_parts(
            Box::new(MemorySource::new(data)),
            Box::new(RawCoeffDecoder),
            layout,
        )
        .unwrap()
        .with_idwt_kernel(Box::new(FlatKernel(100)));
        let cache = SlideCache::new("kernel", 100);
        cache.inject(&slide).unwrap();

        // Level 2 is one synthesis step below the top, so its LL comes
        // straight out of the stand-in kernel: Y = Co = Cg = 100 renders
        // as (100, 150, 0) through the inverse YCoCg-R.
        let mut buf = tile_buf(&slide);
        slide
            .read_tile(&cache, 2, 0, 0, &mut buf, PixelFormat::Rgba)
            .unwrap();
        for px in buf.chunks_exact(4) {
            assert_eq!(px, &[100, 150, 0, 255]);
        }
    }
}
