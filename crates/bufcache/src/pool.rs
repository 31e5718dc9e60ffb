//! Slot pool and sharded bucket table
//!
//! The pool is a fixed arena of slots; buckets hold indices into it. Slot
//! metadata (identity, validity, reference count, recency stamp) is only
//! written while holding the owning bucket's lock, so the fields are plain
//! relaxed atomics and the bucket locks carry the ordering. Block contents
//! live behind a per-slot blocking mutex that is always acquired after every
//! bucket lock has been dropped.
//!
//! Lock order on the allocation slow path: at most one "best so far" bucket
//! lock is carried between scan iterations (buckets are visited in index
//! order, so concurrent scans cannot cycle), and the pool-wide migration
//! lock is taken before the target bucket's lock, never the other way.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use parking_lot::{Mutex, MutexGuard};

use blockdev::{BlockId, BLOCK_SIZE};

use crate::clock::TickClock;
use crate::error::{Error, Result};

/// Block contents guarded by the slot's exclusive lock
pub(crate) struct Frame {
    /// Raw block bytes
    pub(crate) data: Box<[u8; BLOCK_SIZE]>,
}

/// One cache slot: identity and bookkeeping plus exclusively-locked contents
pub(crate) struct Slot {
    dev: AtomicU32,
    no: AtomicU32,
    valid: AtomicBool,
    refcnt: AtomicU32,
    stamp: AtomicU64,
    frame: Mutex<Frame>,
}

impl Slot {
    fn new(stamp: u64) -> Self {
        Self {
            dev: AtomicU32::new(0),
            no: AtomicU32::new(0),
            valid: AtomicBool::new(false),
            refcnt: AtomicU32::new(0),
            stamp: AtomicU64::new(stamp),
            frame: Mutex::new(Frame {
                data: Box::new([0u8; BLOCK_SIZE]),
            }),
        }
    }

    fn matches(&self, id: BlockId) -> bool {
        self.dev.load(Ordering::Relaxed) == id.dev && self.no.load(Ordering::Relaxed) == id.no
    }

    /// Current identity; stable only while `refcnt > 0`
    pub(crate) fn id(&self) -> BlockId {
        BlockId::new(self.dev.load(Ordering::Relaxed), self.no.load(Ordering::Relaxed))
    }

    /// Whether the contents reflect the on-media block
    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    /// Mark the contents as reflecting the on-media block
    ///
    /// Written while holding the frame lock after a physical read.
    pub(crate) fn set_valid(&self) {
        self.valid.store(true, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Relaxed)
    }
}

/// One shard of the slot directory: a short-hold lock over a chain of
/// slot indices, front of the vector being the head of the chain
struct Bucket {
    chain: Mutex<Vec<usize>>,
}

/// How an acquisition was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Found in the target bucket on the fast path
    Hit,
    /// Missed, but a concurrent caller cached the block during the scan
    Raced,
    /// Missed; a victim slot was recycled for this identity
    Evicted,
}

/// Fixed-capacity pool of slots sharded across hashed buckets
pub(crate) struct Pool {
    slots: Box<[Slot]>,
    buckets: Box<[Bucket]>,
    /// Taken before the target bucket's lock while splicing a migrated
    /// victim, so concurrent migrations into one bucket serialize
    migrate: Mutex<()>,
    hasher: RandomState,
    clock: Arc<TickClock>,
    /// Rendezvous hook invoked on the slow path after the victim is
    /// unlinked and every lock has been dropped, so tests can interleave a
    /// concurrent caller into that exact window
    #[cfg(test)]
    migration_gate: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl Pool {
    /// Create a pool of `slots` slots sharded over `buckets` buckets
    ///
    /// Every slot starts in bucket 0; the first lookups migrate them out to
    /// their hashed homes. Steady state is unaffected by the skewed start.
    pub(crate) fn new(slots: usize, buckets: usize, clock: Arc<TickClock>) -> Self {
        assert!(slots > 0, "Pool needs at least one slot");
        assert!(buckets > 0, "Pool needs at least one bucket");

        let stamp = clock.now();
        let slots: Box<[Slot]> = (0..slots).map(|_| Slot::new(stamp)).collect();
        let buckets: Box<[Bucket]> = (0..buckets)
            .map(|i| Bucket {
                chain: Mutex::new(if i == 0 {
                    (0..slots.len()).collect()
                } else {
                    Vec::new()
                }),
            })
            .collect();

        Self {
            slots,
            buckets,
            migrate: Mutex::new(()),
            hasher: RandomState::new(),
            clock,
            #[cfg(test)]
            migration_gate: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_migration_gate(&self, gate: Arc<dyn Fn() + Send + Sync>) {
        *self.migration_gate.lock() = Some(gate);
    }

    /// Number of slots in the pool
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }

    pub(crate) fn bucket_of(&self, id: BlockId) -> usize {
        use std::hash::BuildHasher;
        self.hasher.hash_one((id.dev, id.no)) as usize % self.buckets.len()
    }

    /// Get-or-create the slot for `id`, returning it exclusively locked
    ///
    /// Fast path: scan the hashed bucket under its lock; on a match, bump the
    /// reference count, drop the bucket lock, then block on the slot's frame
    /// lock.
    ///
    /// Slow path: scan every bucket for the unreferenced slot with the
    /// greatest recency stamp (ties go to the latest candidate scanned),
    /// carrying the best candidate's bucket lock from iteration to iteration.
    /// The victim is unlinked from its bucket, then spliced onto the head of
    /// the target bucket under the migration lock, and only then is the
    /// target chain re-scanned for a duplicate inserted by a concurrent
    /// caller. A duplicate wins and the migrated victim simply stays where it
    /// landed, still carrying its old identity, until some later scan picks
    /// it off. With no victim and no duplicate the pool is exhausted: every
    /// slot is referenced, which is an unrecoverable caller bug.
    pub(crate) fn acquire(&self, id: BlockId) -> Result<(usize, MutexGuard<'_, Frame>, Outcome)> {
        let target = self.bucket_of(id);

        // Fast path: already cached in its home bucket.
        {
            let chain = self.buckets[target].chain.lock();
            let hit = chain.iter().copied().find(|&idx| self.slots[idx].matches(id));
            if let Some(idx) = hit {
                self.slots[idx].refcnt.fetch_add(1, Ordering::Relaxed);
                drop(chain);
                let frame = self.slots[idx].frame.lock();
                return Ok((idx, frame, Outcome::Hit));
            }
        }

        // Global victim scan. `best` keeps the winning bucket's lock alive
        // across iterations; replacing it unlocks the previous winner.
        let mut best: Option<(usize, usize, MutexGuard<'_, Vec<usize>>)> = None;
        let mut best_stamp: u64 = 0;
        for bucket in self.buckets.iter() {
            let guard = bucket.chain.lock();
            let mut local: Option<(usize, usize)> = None;
            for (pos, &idx) in guard.iter().enumerate() {
                let slot = &self.slots[idx];
                if slot.refcnt.load(Ordering::Relaxed) == 0
                    && slot.stamp.load(Ordering::Relaxed) >= best_stamp
                {
                    best_stamp = slot.stamp.load(Ordering::Relaxed);
                    local = Some((idx, pos));
                }
            }
            if let Some((idx, pos)) = local {
                best = Some((idx, pos, guard));
            }
        }

        // Unlink the victim and let go of its bucket before taking the
        // migration lock.
        let victim = match best {
            Some((idx, pos, mut guard)) => {
                let removed = guard.remove(pos);
                debug_assert_eq!(removed, idx);
                Some(idx)
            }
            None => None,
        };

        // Nothing is locked here and the victim is invisible to every other
        // caller; a concurrent miss for the same block can slip in.
        #[cfg(test)]
        {
            let gate = self.migration_gate.lock().clone();
            if let Some(gate) = gate {
                gate();
            }
        }

        let migrate = self.migrate.lock();
        let mut chain = self.buckets[target].chain.lock();

        // Splice the victim in at the head, old identity and all, before
        // checking for a duplicate.
        if let Some(idx) = victim {
            chain.insert(0, idx);
        }

        // A concurrent caller may have cached `id` while we scanned.
        let dup = chain.iter().copied().find(|&idx| self.slots[idx].matches(id));
        if let Some(idx) = dup {
            self.slots[idx].refcnt.fetch_add(1, Ordering::Relaxed);
            drop(chain);
            drop(migrate);
            let frame = self.slots[idx].frame.lock();
            return Ok((idx, frame, Outcome::Raced));
        }

        let idx = victim.ok_or(Error::Exhausted)?;

        let slot = &self.slots[idx];
        slot.dev.store(id.dev, Ordering::Relaxed);
        slot.no.store(id.no, Ordering::Relaxed);
        slot.valid.store(false, Ordering::Relaxed);
        slot.refcnt.store(1, Ordering::Relaxed);

        drop(chain);
        drop(migrate);
        let frame = slot.frame.lock();
        Ok((idx, frame, Outcome::Evicted))
    }

    /// Drop one reference to a slot
    ///
    /// The caller must have dropped the slot's frame lock first. When the
    /// count reaches zero the slot is stamped with the current tick, marking
    /// the instant it became idle.
    pub(crate) fn release(&self, idx: usize) {
        let slot = &self.slots[idx];
        let bucket = self.bucket_of(slot.id());
        let _chain = self.buckets[bucket].chain.lock();

        let prev = slot.refcnt.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "release on an unreferenced slot");
        if prev == 1 {
            slot.stamp.store(self.clock.now(), Ordering::Relaxed);
        }
    }

    /// Add a reference without touching the frame lock
    pub(crate) fn pin(&self, idx: usize) {
        let slot = &self.slots[idx];
        let bucket = self.bucket_of(slot.id());
        let _chain = self.buckets[bucket].chain.lock();
        slot.refcnt.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a reference taken by [`Pool::pin`]
    ///
    /// Unlike [`Pool::release`] this does not restamp the slot when the
    /// count reaches zero; the stamp from the last release stands.
    pub(crate) fn unpin(&self, idx: usize) {
        let slot = &self.slots[idx];
        let bucket = self.bucket_of(slot.id());
        let _chain = self.buckets[bucket].chain.lock();

        let prev = slot.refcnt.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "unpin on an unreferenced slot");
    }

    /// Per-bucket chains as plain index vectors, for invariant checks
    #[cfg(test)]
    pub(crate) fn census(&self) -> Vec<Vec<usize>> {
        self.buckets.iter().map(|b| b.chain.lock().clone()).collect()
    }

    /// Indices of every slot currently carrying `id`
    #[cfg(test)]
    pub(crate) fn slots_with_id(&self, id: BlockId) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.slots[i].matches(id))
            .collect()
    }
}
