//! Shared coefficient cache: the tile LRU list and the two block pools.
//!
//! The cache memoizes partial coefficient state across requests. Its LRU
//! holds every tile that currently owns any coefficient plane, most
//! recently completed request first; trimming the tail returns planes to
//! the pools. One cache may serve several slides as long as their block
//! dimensions match, so the pools are sized once, at first injection.
//!
//! Lock order: the cache mutex is taken before any slide's tile table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::block_pool::BlockPool;
use crate::error::{IsyntaxError, IsyntaxResult};
use crate::slide::Slide;
use crate::tile::TileTable;

pub(crate) type SharedTileTable = Arc<Mutex<TileTable>>;

/// Identifies one injected slide within its cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub(crate) u32);

/// Cache-wide tile identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub file: FileId,
    pub tile: u32,
}

/// Recorded on a slide when it is injected into a cache.
pub(crate) struct CacheBinding {
    pub(crate) cache_id: u64,
    pub(crate) file: FileId,
}

struct LruNode {
    prev: Option<u32>,
    next: Option<u32>,
    key: TileKey,
}

/// Doubly linked LRU over tile keys, arena-backed so links are stable
/// indices rather than owning references.
pub(crate) struct TileLru {
    nodes: Vec<LruNode>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    index: HashMap<TileKey, u32>,
}

impl TileLru {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            index: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: TileKey) -> bool {
        self.index.contains_key(&key)
    }

    #[cfg(test)]
    pub(crate) fn head_key(&self) -> Option<TileKey> {
        self.head.map(|slot| self.nodes[slot as usize].key)
    }

    pub(crate) fn tail_key(&self) -> Option<TileKey> {
        self.tail.map(|slot| self.nodes[slot as usize].key)
    }

    fn unlink(&mut self, slot: u32) {
        let (prev, next) = {
            let node = &self.nodes[slot as usize];
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n as usize].prev = prev,
            None => self.tail = prev,
        }
    }

    fn link_front(&mut self, slot: u32) {
        let old_head = self.head;
        {
            let node = &mut self.nodes[slot as usize];
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.nodes[h as usize].prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    /// Move `key` to the front, inserting it if absent.
    pub(crate) fn touch(&mut self, key: TileKey) {
        if let Some(&slot) = self.index.get(&key) {
            if self.head == Some(slot) {
                return;
            }
            self.unlink(slot);
            self.link_front(slot);
            return;
        }
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize].key = key;
                slot
            }
            None => {
                self.nodes.push(LruNode {
                    prev: None,
                    next: None,
                    key,
                });
                (self.nodes.len() - 1) as u32
            }
        };
        self.index.insert(key, slot);
        self.link_front(slot);
    }

    /// Move a whole list to the front preserving its order: `keys[0]` ends
    /// up at the head.
    pub(crate) fn splice_front(&mut self, keys: &[TileKey]) {
        for &key in keys.iter().rev() {
            self.touch(key);
        }
    }

    pub(crate) fn remove(&mut self, key: TileKey) {
        if let Some(slot) = self.index.remove(&key) {
            self.unlink(slot);
            self.free.push(slot);
        }
    }

    /// Keys from most to least recently used, for assertions.
    #[cfg(test)]
    pub(crate) fn keys_front_to_back(&self) -> Vec<TileKey> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let node = &self.nodes[slot as usize];
            keys.push(node.key);
            cursor = node.next;
        }
        keys
    }
}

/// The two coefficient pools, sized from the injected block dimensions.
pub(crate) struct CachePools {
    pub(crate) ll: BlockPool,
    pub(crate) h: BlockPool,
    pub(crate) block_width: u32,
    pub(crate) block_height: u32,
}

/// Total coefficient budget split across the LL and H pools.
const POOL_BUDGET_BYTES: u64 = 32 * 1024 * 1024 * 1024;

/// Arena granularity for pool capacity accounting.
const POOL_CHUNK_BYTES: usize = 256 * 1024 * 1024;

impl CachePools {
    fn sized_for(block_width: u32, block_height: u32) -> Self {
        let ll_block_len = block_width as usize * block_height as usize;
        let ll_block_bytes = (ll_block_len * std::mem::size_of::<i16>()) as u64;
        let ll_capacity = ((POOL_BUDGET_BYTES / ll_block_bytes) / 4) as usize;
        let h_capacity = ll_capacity * 3;
        CachePools {
            ll: BlockPool::new(ll_block_len, ll_capacity, POOL_CHUNK_BYTES),
            h: BlockPool::new(ll_block_len * 3, h_capacity, POOL_CHUNK_BYTES),
            block_width,
            block_height,
        }
    }
}

pub(crate) struct CacheInner {
    pub(crate) lru: TileLru,
    pub(crate) pools: Option<CachePools>,
    pub(crate) target_size: usize,
    pub(crate) files: HashMap<FileId, SharedTileTable>,
    next_file_id: u32,
}

/// Pool usage snapshot, mostly for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePoolStats {
    pub ll_in_use: usize,
    pub ll_free: usize,
    pub h_in_use: usize,
    pub h_free: usize,
}

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Tile coefficient cache, shareable between slides with matching block
/// dimensions.
pub struct SlideCache {
    pub(crate) inner: Mutex<CacheInner>,
    pub(crate) id: u64,
    name: String,
}

impl SlideCache {
    /// `target_size` is the LRU length trimmed to after each tile read.
    /// The pools are sized later, at first [`SlideCache::inject`].
    pub fn new(name: &str, target_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                lru: TileLru::new(),
                pools: None,
                target_size,
                files: HashMap::new(),
                next_file_id: 0,
            }),
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target_size(&self) -> usize {
        self.inner.lock().target_size
    }

    /// Current LRU length in tiles.
    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach this cache's pools to a slide. The first injection sizes the
    /// pools from the slide's block dimensions; later injections require
    /// matching dimensions.
    pub fn inject(&self, slide: &Slide) -> IsyntaxResult<()> {
        let mut inner = self.inner.lock();
        if let Some(pools) = inner.pools.as_ref() {
            if pools.block_width != slide.tile_width()
                || pools.block_height != slide.tile_height()
            {
                return Err(IsyntaxError::invalid(format!(
                    "cache pools are sized for {}x{} blocks, slide has {}x{}",
                    pools.block_width,
                    pools.block_height,
                    slide.tile_width(),
                    slide.tile_height()
                )));
            }
        } else {
            inner.pools = Some(CachePools::sized_for(
                slide.tile_width(),
                slide.tile_height(),
            ));
            debug!(
                "cache {:?}: pools sized for {}x{} blocks",
                self.name,
                slide.tile_width(),
                slide.tile_height()
            );
        }

        let file = FileId(inner.next_file_id);
        slide.bind(self.id, file)?;
        inner.next_file_id += 1;
        inner.files.insert(file, slide.shared_tiles());
        Ok(())
    }

    /// Evict least recently used tiles until at most `to_size` remain.
    pub fn trim(&self, to_size: usize) {
        let mut inner = self.inner.lock();
        trim_inner(&mut inner, to_size, None);
    }

    pub fn pool_stats(&self) -> Option<CachePoolStats> {
        let inner = self.inner.lock();
        inner.pools.as_ref().map(|pools| CachePoolStats {
            ll_in_use: pools.ll.in_use(),
            ll_free: pools.ll.free_blocks(),
            h_in_use: pools.h.in_use(),
            h_free: pools.h.free_blocks(),
        })
    }

    /// Blocks ever materialized by each pool, for conservation checks.
    pub fn pool_allocated(&self) -> Option<(usize, usize)> {
        let inner = self.inner.lock();
        inner
            .pools
            .as_ref()
            .map(|pools| (pools.ll.allocated_blocks(), pools.h.allocated_blocks()))
    }
}

/// Evict from the tail until the LRU holds at most `to_size` tiles.
///
/// `current` is the tile table already locked by the caller, if any;
/// evictions for other slides briefly take their own table locks.
pub(crate) fn trim_inner(
    inner: &mut CacheInner,
    to_size: usize,
    mut current: Option<(FileId, &mut TileTable)>,
) {
    while inner.lru.len() > to_size {
        let Some(key) = inner.lru.tail_key() else {
            break;
        };
        inner.lru.remove(key);
        let Some(pools) = inner.pools.as_ref() else {
            continue;
        };
        match current.as_mut() {
            Some((file, table)) if *file == key.file => {
                release_tile_planes(table, key.tile, pools);
            }
            _ => {
                if let Some(shared) = inner.files.get(&key.file) {
                    let mut table = shared.lock();
                    release_tile_planes(&mut table, key.tile, pools);
                }
            }
        }
    }
}

fn release_tile_planes(table: &mut TileTable, tile: u32, pools: &CachePools) {
    for (plane, is_ll) in table.get_mut(tile).take_planes() {
        if is_ll {
            pools.ll.free(plane);
        } else {
            pools.h.free(plane);
        }
    }
}
