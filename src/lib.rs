//! isyntax_core - tile reconstruction engine for iSyntax whole-slide images.
//!
//! The crate turns persisted wavelet coefficient codeblocks into pixel
//! tiles:
//! - a pyramid/tile data model over the parsed codeblock directory
//! - a dependency-closure planner that finds the ancestor, neighbor and
//!   sibling tiles a read must materialize
//! - a shared coefficient cache (tile LRU + block-pool allocators)
//! - the inverse wavelet transform and YCoCg color stages
//! - a region planner that composes arbitrary rectangles from whole tiles
//!
//! The container header parser, the production codeblock decompressor and
//! the production per-channel synthesis primitive are external
//! collaborators behind the [`ContainerFormat`], [`BlockSource`],
//! [`CoeffDecoder`] and [`IdwtKernel`] seams; the crate ships reference
//! implementations for the latter two.
//!
//! ```no_run
//! use isyntax_core::{PixelFormat, Slide, SlideCache};
//! # fn open_slide() -> isyntax_core::IsyntaxResult<Slide> { unimplemented!() }
//! # fn main() -> isyntax_core::IsyntaxResult<()> {
//! isyntax_core::init();
//! let slide = open_slide()?;
//! let cache = SlideCache::new("viewer", 2000);
//! cache.inject(&slide)?;
//!
//! let size = (slide.tile_width() * slide.tile_height() * 4) as usize;
//! let mut pixels = vec![0u8; size];
//! slide.read_tile(&cache, 0, 0, 0, &mut pixels, PixelFormat::Rgba)?;
//! # Ok(())
//! # }
//! ```

mod block_pool;
mod cache;
mod decoder;
mod error;
mod format;
mod idwt;
mod io;
mod planner;
mod reconstruct;
mod region;
mod slide;
mod tile;
#[cfg(test)]
pub(crate) mod test_utils;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

pub use block_pool::{BlockPool, CoeffPlane};
pub use cache::{CachePoolStats, FileId, SlideCache, TileKey};
pub use decoder::{decode_jpeg_rgb, CoeffDecoder, CoeffKind, RawCoeffDecoder};
pub use error::{IsyntaxError, IsyntaxResult};
pub use format::{
    chunk_codeblocks_per_color, codeblock_slot_in_chunk, level_origin_offset, CodeblockEntry,
    DataChunk, EmbeddedImage, LevelLayout, SlideLayout, SlideProperties, TileDescriptor,
    PER_LEVEL_PADDING,
};
pub use idwt::{
    inverse_transform, IdwtKernel, LiftingIdwt, IDWT_FIRST_VALID_PIXEL, IDWT_PAD_LEFT,
    IDWT_PAD_RIGHT,
};
pub use io::{BlockSource, FileSource, MemorySource};
pub use reconstruct::PixelFormat;
pub use slide::{ContainerFormat, OpenFlags, Slide};
pub use tile::{
    adjacency_bit, Level, ADJ_TILE_ALL, ADJ_TILE_BOTTOM_CENTER, ADJ_TILE_BOTTOM_LEFT,
    ADJ_TILE_BOTTOM_RIGHT, ADJ_TILE_CENTER, ADJ_TILE_CENTER_LEFT, ADJ_TILE_CENTER_RIGHT,
    ADJ_TILE_TOP_CENTER, ADJ_TILE_TOP_LEFT, ADJ_TILE_TOP_RIGHT,
};

/// Process-wide facts probed once at [`init`].
#[derive(Debug, Clone, Copy)]
pub struct RuntimeInfo {
    pub logical_cores: usize,
    pub worker_threads: usize,
}

const INIT_UNSTARTED: u8 = 0;
const INIT_RUNNING: u8 = 1;
const INIT_READY: u8 = 2;

static INIT_STATE: AtomicU8 = AtomicU8::new(INIT_UNSTARTED);
static RUNTIME: OnceLock<RuntimeInfo> = OnceLock::new();

/// Global library initialization: probes CPU parallelism and sizes the
/// worker pool. Idempotent and safe to call from several threads at once;
/// the thread that wins the state transition does the work, the others
/// spin until it publishes readiness. Opening a slide calls this.
pub fn init() {
    match INIT_STATE.compare_exchange(
        INIT_UNSTARTED,
        INIT_RUNNING,
        Ordering::Acquire,
        Ordering::Acquire,
    ) {
        Ok(_) => {
            let logical_cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            let worker_threads = logical_cores.saturating_sub(1).max(1);
            // The embedding application may already own the global rayon
            // pool; its configuration wins.
            let _ = rayon::ThreadPoolBuilder::new()
                .num_threads(worker_threads)
                .build_global();
            let _ = RUNTIME.set(RuntimeInfo {
                logical_cores,
                worker_threads,
            });
            INIT_STATE.store(INIT_READY, Ordering::Release);
        }
        Err(state) => {
            if state == INIT_READY {
                return;
            }
            while INIT_STATE.load(Ordering::Acquire) != INIT_READY {
                std::hint::spin_loop();
            }
        }
    }
}

/// Runtime facts published by [`init`], if it ran.
pub fn runtime() -> Option<RuntimeInfo> {
    RUNTIME.get().copied()
}
