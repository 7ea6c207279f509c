//! Region reads: arbitrary pixel rectangles of one level, composed from
//! whole tiles and optionally resampled.
//!
//! The container reports a per-level origin offset that compensates for
//! the wavelet padding accumulated across levels. When the shifted origin
//! is fractional the planner reads a one-pixel-oversized region at the
//! floored origin and interpolates; otherwise tiles are composed directly.
//! Pixels no tile covers are opaque white, and the output buffer is only
//! written once the whole rectangle decoded.

use rayon::prelude::*;

use crate::cache::SlideCache;
use crate::error::{IsyntaxError, IsyntaxResult};
use crate::reconstruct::PixelFormat;
use crate::slide::Slide;

pub(crate) fn read_region_impl(
    slide: &Slide,
    cache: &SlideCache,
    level: u32,
    x: i64,
    y: i64,
    width: u32,
    height: u32,
    out: &mut [u8],
    format: PixelFormat,
) -> IsyntaxResult<()> {
    if slide.level_count() == 0 {
        return Err(IsyntaxError::not_found("slide has no pyramid"));
    }
    let Some(level_info) = slide.level(level) else {
        return Err(IsyntaxError::invalid(format!(
            "level {} of {}",
            level,
            slide.level_count()
        )));
    };
    if width == 0 || height == 0 {
        return Err(IsyntaxError::invalid(
            "region width and height must be positive",
        ));
    }
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| IsyntaxError::invalid("requested region is too large"))?;
    if out.len() != expected {
        return Err(IsyntaxError::invalid(format!(
            "region buffer is {} bytes, expected {}",
            out.len(),
            expected
        )));
    }

    let offset = level_info.origin_offset;
    let shifted_x = x as f64 + offset;
    let shifted_y = y as f64 + offset;

    if shifted_x.fract() == 0.0 && shifted_y.fract() == 0.0 {
        let mut scratch = vec![0u8; expected];
        compose(
            slide,
            cache,
            level,
            shifted_x as i64,
            shifted_y as i64,
            width,
            height,
            &mut scratch,
            format,
        )?;
        out.copy_from_slice(&scratch);
        return Ok(());
    }

    // Fractional origin: decode one extra pixel of margin, then resample.
    let fx = shifted_x - shifted_x.floor();
    let fy = shifted_y - shifted_y.floor();
    let src_w = width + 1;
    let src_h = height + 1;
    let mut scratch = vec![0u8; src_w as usize * src_h as usize * 4];
    compose(
        slide,
        cache,
        level,
        shifted_x.floor() as i64,
        shifted_y.floor() as i64,
        src_w,
        src_h,
        &mut scratch,
        format,
    )?;
    resample_bilinear(
        &scratch,
        src_w as usize,
        fx,
        fy,
        out,
        width as usize,
        height as usize,
    );
    Ok(())
}

/// Decompose `[x, x+width) x [y, y+height)` (level pixels) into whole
/// tiles, read each and copy its clipped sub-rectangle. Pixels outside the
/// tile grid stay opaque white.
#[allow(clippy::too_many_arguments)]
fn compose(
    slide: &Slide,
    cache: &SlideCache,
    level: u32,
    x: i64,
    y: i64,
    width: u32,
    height: u32,
    out: &mut [u8],
    format: PixelFormat,
) -> IsyntaxResult<()> {
    let level_info = slide
        .level(level)
        .ok_or_else(|| IsyntaxError::invalid("level out of range"))?;
    let tile_w = slide.tile_width() as i64;
    let tile_h = slide.tile_height() as i64;
    let grid_w = level_info.width_in_tiles as i64;
    let grid_h = level_info.height_in_tiles as i64;
    let out_w = width as usize;

    out.fill(0xFF);

    let x2 = x
        .checked_add(width as i64)
        .ok_or_else(|| IsyntaxError::invalid("x + width overflows"))?;
    let y2 = y
        .checked_add(height as i64)
        .ok_or_else(|| IsyntaxError::invalid("y + height overflows"))?;

    let col_start = x.div_euclid(tile_w);
    let col_end = (x2 - 1).div_euclid(tile_w) + 1;
    let row_start = y.div_euclid(tile_h);
    let row_end = (y2 - 1).div_euclid(tile_h) + 1;

    let mut tile_buf = vec![0u8; (tile_w * tile_h * 4) as usize];
    for row in row_start..row_end {
        for col in col_start..col_end {
            if col < 0 || row < 0 || col >= grid_w || row >= grid_h {
                continue;
            }

            slide.read_tile(cache, level, col as u32, row as u32, &mut tile_buf, format)?;

            let tile_x = col * tile_w;
            let tile_y = row * tile_h;

            // Intersection in level coordinates.
            let left = x.max(tile_x);
            let top = y.max(tile_y);
            let right = x2.min(tile_x + tile_w);
            let bottom = y2.min(tile_y + tile_h);
            if left >= right || top >= bottom {
                continue;
            }

            let copy_w = (right - left) as usize;
            let copy_h = (bottom - top) as usize;
            let src_x = (left - tile_x) as usize;
            let src_y = (top - tile_y) as usize;
            let dst_x = (left - x) as usize;
            let dst_y = (top - y) as usize;
            let tile_stride = tile_w as usize;

            for r in 0..copy_h {
                let s0 = ((src_y + r) * tile_stride + src_x) * 4;
                let d0 = ((dst_y + r) * out_w + dst_x) * 4;
                out[d0..d0 + copy_w * 4].copy_from_slice(&tile_buf[s0..s0 + copy_w * 4]);
            }
        }
    }
    Ok(())
}

/// Bilinear resample with constant sub-pixel weights `(fx, fy)`. The
/// source is one pixel wider and taller than the output.
fn resample_bilinear(
    src: &[u8],
    src_w: usize,
    fx: f64,
    fy: f64,
    out: &mut [u8],
    width: usize,
    height: usize,
) {
    debug_assert!(src.len() >= (width + 1) * (height + 1) * 4);
    let w00 = (1.0 - fx) * (1.0 - fy);
    let w10 = fx * (1.0 - fy);
    let w01 = (1.0 - fx) * fy;
    let w11 = fx * fy;

    out.par_chunks_mut(width * 4)
        .enumerate()
        .take(height)
        .for_each(|(row, dst)| {
            let top = row * src_w * 4;
            let bottom = (row + 1) * src_w * 4;
            for col in 0..width {
                for channel in 0..4 {
                    let p00 = src[top + col * 4 + channel] as f64;
                    let p10 = src[top + (col + 1) * 4 + channel] as f64;
                    let p01 = src[bottom + col * 4 + channel] as f64;
                    let p11 = src[bottom + (col + 1) * 4 + channel] as f64;
                    dst[col * 4 + channel] =
                        (p00 * w00 + p10 * w10 + p01 * w01 + p11 * w11 + 0.5) as u8;
                }
            }
        });
}
