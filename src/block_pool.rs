//! Fixed-block-size pool allocator for coefficient planes.
//!
//! LL and H planes churn constantly as the tile cache evicts and reloads;
//! routing them through a dedicated pool keeps steady-state allocation on a
//! free list and bounds the resident footprint to a configured cap.
//! Capacity is accounted in chunk-sized arenas; blocks inside the active
//! chunk are materialized lazily, so a small cache does not commit a full
//! arena up front.

use parking_lot::Mutex;

use crate::error::{IsyntaxError, IsyntaxResult};

/// A coefficient plane issued by a pool. Owned by exactly one tile until it
/// is returned with [`BlockPool::free`].
pub type CoeffPlane = Box<[i16]>;

struct PoolInner {
    free: Vec<CoeffPlane>,
    /// Blocks ever materialized, whether free or handed out.
    allocated: usize,
    in_use: usize,
}

/// Pool of equally sized coefficient blocks.
pub struct BlockPool {
    inner: Mutex<PoolInner>,
    /// Plane length in i16 coefficients.
    block_len: usize,
    blocks_per_chunk: usize,
    max_chunks: usize,
}

impl BlockPool {
    /// `block_len` is the plane length in i16 coefficients; `max_blocks`
    /// caps the pool; `chunk_bytes` is the arena granularity used for the
    /// capacity accounting.
    pub fn new(block_len: usize, max_blocks: usize, chunk_bytes: usize) -> Self {
        let block_bytes = block_len * std::mem::size_of::<i16>();
        let blocks_per_chunk = (chunk_bytes / block_bytes).max(1);
        let total_bytes = max_blocks * block_bytes;
        let max_chunks = total_bytes.div_ceil(chunk_bytes).max(1);
        Self {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                allocated: 0,
                in_use: 0,
            }),
            block_len,
            blocks_per_chunk,
            max_chunks,
        }
    }

    /// Pull a block from the free list, materializing a new one while the
    /// chunk cap allows. The returned plane contents are unspecified.
    pub fn alloc(&self) -> IsyntaxResult<CoeffPlane> {
        let mut inner = self.inner.lock();
        if let Some(block) = inner.free.pop() {
            inner.in_use += 1;
            return Ok(block);
        }
        let used_chunks = inner.allocated.div_ceil(self.blocks_per_chunk);
        let at_chunk_boundary = inner.allocated % self.blocks_per_chunk == 0;
        if at_chunk_boundary && used_chunks >= self.max_chunks {
            return Err(IsyntaxError::OutOfMemory(format!(
                "coefficient pool exhausted ({} blocks in {} chunks)",
                inner.allocated, used_chunks
            )));
        }
        inner.allocated += 1;
        inner.in_use += 1;
        Ok(vec![0i16; self.block_len].into_boxed_slice())
    }

    /// Return a block to the free list. The plane must have been issued by
    /// this pool.
    pub fn free(&self, block: CoeffPlane) {
        debug_assert_eq!(block.len(), self.block_len);
        let mut inner = self.inner.lock();
        debug_assert!(inner.in_use > 0);
        inner.in_use = inner.in_use.saturating_sub(1);
        inner.free.push(block);
    }

    /// Plane length in i16 coefficients.
    pub fn block_len(&self) -> usize {
        self.block_len
    }

    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    pub fn free_blocks(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Blocks ever materialized by this pool.
    pub fn allocated_blocks(&self) -> usize {
        self.inner.lock().allocated
    }

    /// Hard cap in blocks, rounded up to whole chunks.
    pub fn capacity(&self) -> usize {
        self.max_chunks * self.blocks_per_chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_recycles() {
        let pool = BlockPool::new(16, 8, 16 * 2 * 4);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.allocated_blocks(), 2);

        pool.free(a);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.free_blocks(), 1);

        // Recycled, not re-materialized.
        let c = pool.alloc().unwrap();
        assert_eq!(pool.allocated_blocks(), 2);
        pool.free(b);
        pool.free(c);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.free_blocks(), 2);
    }

    #[test]
    fn test_cap_is_enforced() {
        // 4 blocks per chunk, 1 chunk total.
        let pool = BlockPool::new(16, 4, 16 * 2 * 4);
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.alloc().unwrap());
        }
        assert!(matches!(
            pool.alloc(),
            Err(IsyntaxError::OutOfMemory(_))
        ));

        // Freeing makes room again without growing.
        pool.free(held.pop().unwrap());
        assert!(pool.alloc().is_ok());
    }

    #[test]
    fn test_capacity_rounds_to_chunks() {
        // 3 blocks requested, 2 blocks per chunk: 2 chunks, 4 block cap.
        let pool = BlockPool::new(8, 3, 8 * 2 * 2);
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn test_conservation() {
        let pool = BlockPool::new(4, 16, 4 * 2 * 4);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        pool.free(b);
        assert_eq!(
            pool.in_use() + pool.free_blocks(),
            pool.allocated_blocks()
        );
        pool.free(a);
        pool.free(c);
        assert_eq!(
            pool.in_use() + pool.free_blocks(),
            pool.allocated_blocks()
        );
    }
}
