//! BufCache: sharded buffer cache over a block device

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::MutexGuard;

use blockdev::{BlockId, BlockIo};

use crate::clock::TickClock;
use crate::error::Result;
use crate::pool::{Frame, Outcome, Pool};
use crate::stats::CacheStats;

/// Default number of slots in the pool
pub const SLOT_COUNT: usize = 30;

/// Default number of buckets the slot directory is sharded over
pub const BUCKET_COUNT: usize = 13;

/// Fixed-capacity buffer cache sharing one in-memory copy per disk block
///
/// Callers borrow blocks through [`BlockGuard`]s, which hold the slot's
/// exclusive lock for their whole lifetime; dropping the guard releases the
/// block. A block stays resident while any guard or [`PinHandle`] references
/// it, and becomes an eviction candidate once unreferenced.
pub struct BufCache<D: BlockIo> {
    /// Slot arena and bucket directory
    pool: Pool,

    /// Physical transfer bridge
    disk: D,

    /// Hit/miss/eviction counters
    stats: CacheStats,

    /// Recency clock, driven by the embedding application
    clock: Arc<TickClock>,
}

impl<D: BlockIo> BufCache<D> {
    /// Create a cache with the default geometry (30 slots, 13 buckets)
    pub fn new(disk: D) -> Self {
        Self::with_geometry(disk, SLOT_COUNT, BUCKET_COUNT)
    }

    /// Create a cache with an explicit slot and bucket count
    pub fn with_geometry(disk: D, slots: usize, buckets: usize) -> Self {
        Self::with_clock(disk, slots, buckets, Arc::new(TickClock::new()))
    }

    /// Create a cache driven by a shared tick clock
    ///
    /// The clock is the recency source for eviction ranking; advance it from
    /// a timer so "idle since" means something.
    pub fn with_clock(disk: D, slots: usize, buckets: usize, clock: Arc<TickClock>) -> Self {
        Self {
            pool: Pool::new(slots, buckets, Arc::clone(&clock)),
            disk,
            stats: CacheStats::new(),
            clock,
        }
    }

    /// Get the slot for `id` exclusively locked, without touching the device
    ///
    /// The contents are only meaningful if the block was already resident;
    /// use [`BufCache::read`] for a populated view. Blocks until any current
    /// holder of the slot releases it. Fails with
    /// [`Error::Exhausted`](crate::Error::Exhausted) when every slot in the
    /// pool is referenced.
    pub fn get(&self, id: BlockId) -> Result<BlockGuard<'_, D>> {
        let (idx, frame, outcome) = self.pool.acquire(id)?;
        match outcome {
            Outcome::Hit => self.stats.record_hit(),
            Outcome::Raced => {
                self.stats.record_miss();
                self.stats.record_race();
            }
            Outcome::Evicted => {
                self.stats.record_miss();
                self.stats.record_eviction();
            }
        }

        Ok(BlockGuard {
            cache: self,
            idx,
            frame: Some(frame),
        })
    }

    /// Get the block for `id` with its on-media contents, exclusively locked
    ///
    /// Performs the physical read only when the cached copy is not valid.
    pub fn read(&self, id: BlockId) -> Result<BlockGuard<'_, D>> {
        let mut guard = self.get(id)?;
        if !self.pool.slot(guard.idx).is_valid() {
            self.disk.read_block(id, &mut guard.frame_mut().data[..])?;
            self.pool.slot(guard.idx).set_valid();
        }
        Ok(guard)
    }

    /// Keep `guard`'s block resident past the guard's lifetime
    ///
    /// The returned handle holds one reference on the slot without holding
    /// its exclusive lock, so the block survives eviction across several
    /// independent get/release cycles. Hand the handle back to
    /// [`BufCache::unpin`] on the same cache when done.
    pub fn pin(&self, guard: &BlockGuard<'_, D>) -> PinHandle {
        self.pool.pin(guard.idx);
        PinHandle {
            idx: guard.idx,
            id: guard.id(),
        }
    }

    /// Drop the reference held by a [`PinHandle`]
    pub fn unpin(&self, pin: PinHandle) {
        self.pool.unpin(pin.idx);
    }

    /// Number of slots in the pool
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// The device this cache reads through to
    pub fn disk(&self) -> &D {
        &self.disk
    }

    /// The recency clock this cache ranks eviction candidates by
    pub fn clock(&self) -> &Arc<TickClock> {
        &self.clock
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }
}

/// Exclusive access to one cached block
///
/// Dereferences to the block bytes. Dropping the guard releases the slot's
/// exclusive lock first and then drops the reference, so a waiter can take
/// over the slot immediately. Do not touch the block after the guard is
/// gone; re-acquire it instead.
pub struct BlockGuard<'a, D: BlockIo> {
    cache: &'a BufCache<D>,
    idx: usize,
    frame: Option<MutexGuard<'a, Frame>>,
}

impl<'a, D: BlockIo> BlockGuard<'a, D> {
    /// Identity of the block this guard holds
    pub fn id(&self) -> BlockId {
        self.cache.pool.slot(self.idx).id()
    }

    /// Write the current contents through to the device
    ///
    /// The contents and validity of the cached copy are untouched; this is a
    /// plain synchronous write of whatever the guard holds right now.
    pub fn flush(&self) -> Result<()> {
        self.cache.disk.write_block(self.id(), &self.frame().data[..])?;
        Ok(())
    }

    /// Release the block (explicit spelling of dropping the guard)
    pub fn release(self) {}

    fn frame(&self) -> &Frame {
        match &self.frame {
            Some(frame) => frame,
            // Only `drop` takes the frame, and it never reenters here.
            None => unreachable!(),
        }
    }

    fn frame_mut(&mut self) -> &mut Frame {
        match &mut self.frame {
            Some(frame) => frame,
            None => unreachable!(),
        }
    }
}

impl<'a, D: BlockIo> Deref for BlockGuard<'a, D> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.frame().data[..]
    }
}

impl<'a, D: BlockIo> DerefMut for BlockGuard<'a, D> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.frame_mut().data[..]
    }
}

impl<'a, D: BlockIo> Drop for BlockGuard<'a, D> {
    fn drop(&mut self) {
        // Exclusive lock goes first so waiters can run before the reference
        // count is dropped under the bucket lock.
        self.frame.take();
        self.cache.pool.release(self.idx);
    }
}

/// One reference on a resident block, held without its exclusive lock
///
/// Issued by [`BufCache::pin`]; return it to the same cache's
/// [`BufCache::unpin`]. While any handle for a block exists, that block is
/// never an eviction victim.
#[must_use = "a pin keeps its block resident until handed back to unpin"]
#[derive(Debug)]
pub struct PinHandle {
    idx: usize,
    id: BlockId,
}

impl PinHandle {
    /// Identity of the pinned block
    pub fn id(&self) -> BlockId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockdev::{MemDisk, BLOCK_SIZE};

    /// Device 1 with `blocks` blocks, block `b` filled with the byte `b`.
    fn patterned_disk(blocks: u32) -> MemDisk {
        let disk = MemDisk::new();
        disk.add_device(1, blocks);
        for no in 0..blocks {
            let block = vec![no as u8; BLOCK_SIZE];
            disk.write_block(BlockId::new(1, no), &block).unwrap();
        }
        disk
    }

    #[test]
    fn test_read_through() {
        let disk = patterned_disk(8);
        let want = disk.snapshot(BlockId::new(1, 3)).unwrap();
        let cache = BufCache::with_geometry(disk, 4, 2);

        let guard = cache.read(BlockId::new(1, 3)).unwrap();
        assert_eq!(&guard[..], &want[..]);
        assert_eq!(guard.id(), BlockId::new(1, 3));
        drop(guard);

        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().hits(), 0);
    }

    #[test]
    fn test_second_read_is_a_hit() {
        let cache = BufCache::with_geometry(patterned_disk(8), 4, 2);

        cache.read(BlockId::new(1, 3)).unwrap().release();
        cache.read(BlockId::new(1, 3)).unwrap().release();

        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().hit_ratio(), 0.5);
    }

    #[test]
    fn test_write_through() {
        let disk = patterned_disk(8);
        let cache = BufCache::with_geometry(disk, 4, 2);
        let id = BlockId::new(1, 5);

        let mut guard = cache.read(id).unwrap();
        guard[..4].copy_from_slice(b"edit");
        guard.flush().unwrap();
        drop(guard);

        // Observe the medium directly, bypassing the cache.
        let on_disk = cache.disk().snapshot(id).unwrap();
        assert_eq!(&on_disk[..4], b"edit");
        assert_eq!(on_disk[4], 5);
    }

    #[test]
    fn test_get_skips_the_device() {
        let cache = BufCache::with_geometry(patterned_disk(8), 4, 2);
        let id = BlockId::new(1, 2);

        // A fresh get hands out the slot unpopulated.
        let mut guard = cache.get(id).unwrap();
        assert_eq!(&guard[..], &[0u8; BLOCK_SIZE][..]);

        // Whole-block overwrite + flush never needs the physical read.
        guard.copy_from_slice(&[0xeeu8; BLOCK_SIZE]);
        guard.flush().unwrap();
        drop(guard);

        // The copy was never marked valid, so a read re-fetches from the
        // medium and sees the flushed bytes.
        let guard = cache.read(id).unwrap();
        assert_eq!(&guard[..], &[0xeeu8; BLOCK_SIZE][..]);
    }

    #[test]
    fn test_eviction_order_release_sequence() {
        // Two slots, one bucket, frozen clock: both releases stamp the same
        // tick, and the scan recycles the first-released block.
        let cache = BufCache::with_geometry(patterned_disk(64), 2, 1);

        cache.read(BlockId::new(1, 10)).unwrap().release();
        cache.read(BlockId::new(1, 20)).unwrap().release();
        cache.read(BlockId::new(1, 30)).unwrap().release();
        assert_eq!(cache.stats().misses(), 3);

        // (1,20) survived, (1,10) was recycled.
        cache.read(BlockId::new(1, 20)).unwrap().release();
        assert_eq!(cache.stats().hits(), 1);
        cache.read(BlockId::new(1, 10)).unwrap().release();
        assert_eq!(cache.stats().misses(), 4);
    }

    #[test]
    fn test_eviction_order_advancing_clock() {
        // With distinct stamps the scan recycles the greatest stamp, i.e.
        // the block that became idle last.
        let cache = BufCache::with_geometry(patterned_disk(64), 2, 1);

        cache.read(BlockId::new(1, 10)).unwrap().release();
        cache.read(BlockId::new(1, 20)).unwrap().release();

        // Re-idle (1,10) at a later tick than (1,20).
        cache.read(BlockId::new(1, 20)).unwrap().release();
        cache.clock().advance();
        cache.read(BlockId::new(1, 10)).unwrap().release();

        cache.read(BlockId::new(1, 30)).unwrap().release();

        // (1,20) survived, (1,10) was recycled.
        cache.read(BlockId::new(1, 20)).unwrap().release();
        cache.read(BlockId::new(1, 10)).unwrap().release();
        assert_eq!(cache.stats().hits(), 3);
        assert_eq!(cache.stats().misses(), 4);
    }

    #[test]
    fn test_pin_keeps_block_resident() {
        let cache = BufCache::with_geometry(patterned_disk(64), 2, 1);
        let id = BlockId::new(1, 10);

        let guard = cache.read(id).unwrap();
        let pin = cache.pin(&guard);
        assert_eq!(pin.id(), id);
        drop(guard);

        // Churn everything else through the remaining slot.
        for no in 20..28 {
            cache.clock().advance();
            cache.read(BlockId::new(1, no)).unwrap().release();
        }

        // Still resident and still valid: no physical re-read.
        let misses = cache.stats().misses();
        cache.read(id).unwrap().release();
        assert_eq!(cache.stats().misses(), misses);

        cache.unpin(pin);
    }

    #[test]
    fn test_exhausted_when_everything_referenced() {
        let cache = BufCache::with_geometry(patterned_disk(8), 2, 1);

        let g1 = cache.read(BlockId::new(1, 1)).unwrap();
        let g2 = cache.read(BlockId::new(1, 2)).unwrap();

        let result = cache.read(BlockId::new(1, 3));
        assert!(matches!(result, Err(crate::Error::Exhausted)));

        drop(g1);
        drop(g2);
        assert!(cache.read(BlockId::new(1, 3)).is_ok());
    }

    #[test]
    fn test_exhausted_by_pins_alone() {
        let cache = BufCache::with_geometry(patterned_disk(8), 2, 1);

        let g1 = cache.read(BlockId::new(1, 1)).unwrap();
        let p1 = cache.pin(&g1);
        drop(g1);
        let g2 = cache.read(BlockId::new(1, 2)).unwrap();
        let p2 = cache.pin(&g2);
        drop(g2);

        // No guard is held, yet the pool is pinned full.
        let result = cache.read(BlockId::new(1, 3));
        assert!(matches!(result, Err(crate::Error::Exhausted)));

        cache.unpin(p1);
        cache.unpin(p2);
        assert!(cache.read(BlockId::new(1, 3)).is_ok());
    }

    #[test]
    fn test_concurrent_readers_same_block_share_one_slot() {
        let cache = BufCache::with_geometry(patterned_disk(8), 8, 4);
        let id = BlockId::new(1, 6);
        let threads = 8;

        std::thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    let guard = cache.read(id).unwrap();
                    assert_eq!(&guard[..], &[6u8; BLOCK_SIZE][..]);
                });
            }
        });

        // Exactly one slot was ever assigned this identity, no matter how
        // the racing misses interleaved.
        assert_eq!(cache.pool().slots_with_id(id).len(), 1);
        assert_eq!(cache.stats().evictions(), 1);
        assert_eq!(
            cache.stats().hits() + cache.stats().races(),
            threads as u64 - 1
        );
    }

    #[test]
    fn test_raced_miss_shares_slot_and_leaves_stale_victim() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Barrier;

        let cache = BufCache::with_geometry(patterned_disk(8), 2, 1);
        let id = BlockId::new(1, 6);

        // Park the losing caller after it has unlinked a victim, cache the
        // block from this thread, then let the loser hit its duplicate
        // re-scan.
        let rendezvous = Arc::new(Barrier::new(2));
        let armed = Arc::new(AtomicBool::new(true));
        {
            let rendezvous = Arc::clone(&rendezvous);
            let armed = Arc::clone(&armed);
            cache.pool().set_migration_gate(Arc::new(move || {
                if armed.swap(false, Ordering::SeqCst) {
                    rendezvous.wait();
                    rendezvous.wait();
                }
            }));
        }

        std::thread::scope(|s| {
            let loser = s.spawn(|| {
                let guard = cache.read(id).unwrap();
                assert_eq!(&guard[..], &[6u8; BLOCK_SIZE][..]);
            });

            rendezvous.wait();
            let winner = cache.read(id).unwrap();
            rendezvous.wait();

            // The loser adopts the winner's slot: second reference taken,
            // then it blocks on the frame lock we still hold.
            let idx = cache.pool().slots_with_id(id)[0];
            while cache.pool().slot(idx).refcnt() < 2 {
                std::thread::yield_now();
            }

            // The loser's unlinked victim went back in at the head of the
            // chain, old identity, zero references, counted exactly once.
            let census = cache.pool().census();
            assert_eq!(census.iter().map(|c| c.len()).sum::<usize>(), 2);
            let stale = census[0][0];
            assert_ne!(stale, idx);
            assert_eq!(cache.pool().slot(stale).refcnt(), 0);
            assert_eq!(cache.pool().slot(stale).id(), BlockId::new(0, 0));

            drop(winner);
            loser.join().unwrap();
        });

        assert_eq!(cache.pool().slots_with_id(id).len(), 1);
        assert_eq!(cache.stats().misses(), 2);
        assert_eq!(cache.stats().evictions(), 1);
        assert_eq!(cache.stats().races(), 1);
        assert_eq!(cache.stats().hits(), 0);
    }

    #[test]
    fn test_file_backed_round_trip() {
        use blockdev::DiskImage;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk.img");
        let id = BlockId::new(1, 3);

        {
            let disk = DiskImage::create(&path, 1, 8).unwrap();
            let cache = BufCache::with_geometry(disk, 4, 2);

            let mut guard = cache.get(id).unwrap();
            guard.copy_from_slice(&[0x42u8; BLOCK_SIZE]);
            guard.flush().unwrap();
            drop(guard);

            cache.disk().sync().unwrap();
        }

        // A fresh cache over the reopened image reads the flushed bytes
        // back off the medium.
        let disk = DiskImage::open(&path, 1).unwrap();
        let cache = BufCache::with_geometry(disk, 4, 2);

        let guard = cache.read(id).unwrap();
        assert_eq!(&guard[..], &[0x42u8; BLOCK_SIZE][..]);
        drop(guard);
        assert_eq!(cache.stats().misses(), 1);

        // Untouched blocks come back zeroed.
        let guard = cache.read(BlockId::new(1, 0)).unwrap();
        assert_eq!(&guard[..], &[0u8; BLOCK_SIZE][..]);
    }

    #[test]
    fn test_concurrent_churn_keeps_invariants() {
        // Working set larger than the pool, plus a clock thread, to keep the
        // slow path and migrations busy.
        let cache = BufCache::with_geometry(patterned_disk(16), 6, 3);
        let rounds = 300u32;

        std::thread::scope(|s| {
            for t in 0..4u32 {
                let cache = &cache;
                s.spawn(move || {
                    for i in 0..rounds {
                        let no = (t * 7 + i) % 16;
                        let guard = cache.read(BlockId::new(1, no)).unwrap();
                        assert_eq!(&guard[..], &[no as u8; BLOCK_SIZE][..]);
                        if i % 32 == 0 {
                            cache.clock().advance();
                        }
                    }
                });
            }
        });

        // Quiescent: every slot in exactly one bucket, pool-wide.
        let census = cache.pool().census();
        let mut members: Vec<usize> = census.into_iter().flatten().collect();
        members.sort_unstable();
        assert_eq!(members, (0..6).collect::<Vec<_>>());

        assert_eq!(
            cache.stats().hits() + cache.stats().misses(),
            4 * rounds as u64
        );
    }

    #[test]
    fn test_concurrent_writers_serialize_per_block() {
        let cache = BufCache::with_geometry(patterned_disk(4), 4, 2);
        let id = BlockId::new(1, 0);
        let per_thread = 100u64;

        // Each writer increments the first byte; exclusive slot access makes
        // the read-modify-write atomic per guard.
        std::thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    for _ in 0..per_thread {
                        let mut guard = cache.read(id).unwrap();
                        guard[0] = guard[0].wrapping_add(1);
                    }
                });
            }
        });

        let guard = cache.read(id).unwrap();
        assert_eq!(guard[0], (3 * per_thread) as u8);
    }
}
