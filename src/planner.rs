//! Dependency-closure construction for tile reads.
//!
//! A tile's pixels need its coefficients, a border of neighbor
//! coefficients for the inverse transform, and an LL plane that only the
//! parent tile's transform can produce. Resolving one read therefore walks
//! up the pyramid, collecting three disjoint work lists:
//!
//! - `idwt`: tiles whose inverse transform must run because its output
//!   feeds an LL plane further down. The target itself leads this list.
//! - `coeff`: same-level 8-neighbors of idwt tiles; they only need their
//!   H coefficients loaded so the transform can pad across tile seams.
//! - `children`: tiles that receive LL output as a side effect of a
//!   parent's transform; they need no work but must be cache-bumped or the
//!   just-produced planes would be first in line for eviction.
//!
//! Lists hold flat tile indices ordered target-first; every ancestor of an
//! entry appears later in its list, so executing `idwt` back-to-front runs
//! parents before children. The `cache_marked` scratch flag keeps the lists
//! disjoint and is cleared on every touched tile before this returns.

use crate::tile::{Pyramid, TileTable};

#[derive(Default)]
pub(crate) struct TileLists {
    pub(crate) idwt: Vec<u32>,
    pub(crate) coeff: Vec<u32>,
    pub(crate) children: Vec<u32>,
}

fn add_parent(pyramid: &Pyramid, table: &mut TileTable, tile: u32, idwt: &mut Vec<u32>) {
    let Some(parent) = pyramid.parent_of(tile) else {
        return;
    };
    let state = table.get_mut(parent);
    if state.exists && !state.cache_marked {
        state.cache_marked = true;
        idwt.push(parent);
    }
}

/// Build the closure for `target`. When `target_has_pixels` is set the
/// target's transform output becomes pixels rather than children LL, so its
/// children are not queued for a bump.
pub(crate) fn build_tile_lists(
    pyramid: &Pyramid,
    table: &mut TileTable,
    target: u32,
    target_has_pixels: bool,
) -> TileLists {
    debug_assert!(table.get(target).exists);

    let mut lists = TileLists::default();
    table.get_mut(target).cache_marked = true;
    lists.idwt.push(target);

    let (target_scale, _, _) = pyramid.tile_coord(target);
    for scale in target_scale..=pyramid.max_scale() {
        // Every idwt tile at this scale pulls its 8-neighbors in for
        // coefficient loading; the transform pads across their seams.
        let mut i = 0;
        while i < lists.idwt.len() {
            let tile = lists.idwt[i];
            i += 1;
            if pyramid.tile_coord(tile).0 != scale {
                continue;
            }
            for dy in -1..=1 {
                for dx in -1..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let Some(neighbor) = pyramid.neighbor_of(tile, dx, dy) else {
                        continue;
                    };
                    let state = table.get_mut(neighbor);
                    if state.cache_marked || !state.exists {
                        continue;
                    }
                    state.cache_marked = true;
                    lists.coeff.push(neighbor);
                }
            }
        }

        // Parents of everything collected at this scale must run their
        // transform so all these tiles get LL planes.
        let mut i = 0;
        while i < lists.idwt.len() {
            let tile = lists.idwt[i];
            i += 1;
            if pyramid.tile_coord(tile).0 == scale {
                add_parent(pyramid, table, tile, &mut lists.idwt);
            }
        }
        let mut i = 0;
        while i < lists.coeff.len() {
            let tile = lists.coeff[i];
            i += 1;
            if pyramid.tile_coord(tile).0 == scale {
                add_parent(pyramid, table, tile, &mut lists.idwt);
            }
        }
    }

    // Children of idwt tiles receive LL planes as a side effect and get a
    // cache bump so that output survives the post-read trim.
    for &tile in &lists.idwt {
        if target_has_pixels && tile == target {
            continue;
        }
        for child in pyramid.children_of(tile).into_iter().flatten() {
            let state = table.get(child);
            if state.cache_marked || !state.exists {
                continue;
            }
            lists.children.push(child);
        }
    }

    for &tile in lists.idwt.iter().chain(&lists.coeff) {
        table.get_mut(tile).cache_marked = false;
    }

    lists
}
