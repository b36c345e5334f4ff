//! Chunk residency: which field holds a page for each loaded chunk.
//!
//! Each field has its own chunk pool with one page per resident chunk. A
//! chunk lives in at most one field at a time. Every page that leaves a
//! chunk, for whatever reason, is reported as a [`PageReleased`] event so the
//! owner can drop the chunk's patch pages as well.

use rustc_hash::FxHashMap;

use crate::field_pool::Field;
use crate::pool::{PageLayout, PhysicalPageId, PhysicalPagePool};

/// Chunk position in chunk units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkCoord {
    /// East-west position.
    pub x: i32,
    /// Vertical position.
    pub y: i32,
    /// North-south position.
    pub z: i32,
}

impl ChunkCoord {
    /// Chunk at `(x, y, z)`.
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Chebyshev distance in the XZ plane, as used for field radii.
    pub fn horizontal_distance(self, other: ChunkCoord) -> u32 {
        self.x.abs_diff(other.x).max(self.z.abs_diff(other.z))
    }
}

/// Why a chunk lost its page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReleaseReason {
    /// The chunk was unloaded.
    Unloaded,
    /// The chunk moved to the other field.
    FieldTransition,
    /// The pool needed the page for another chunk.
    Evicted,
}

/// A chunk page returned to its field's pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageReleased {
    /// Field whose pool got the page back.
    pub field: Field,
    /// Chunk that held the page.
    pub chunk: ChunkCoord,
    /// The released chunk page; its slot is the chunk's former chunk slot.
    pub physical_page_id: PhysicalPageId,
    /// Why the page was released.
    pub reason: ReleaseReason,
}

/// Per-field residency counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResidencyStats {
    /// Chunks that received a new page.
    pub activations: u64,
    /// Activations of a chunk that already had a page in the field.
    pub reuses: u64,
    /// Activations that found no free or evictable page.
    pub failed_activations: u64,
    /// Pages taken from another chunk.
    pub evictions: u64,
    /// Pages released by unload.
    pub unload_releases: u64,
    /// Pages released because the chunk changed field.
    pub transition_releases: u64,
}

#[derive(Clone, Copy, Debug)]
struct Residency {
    field: Field,
    page: PhysicalPageId,
}

#[derive(Debug)]
struct FieldResidency {
    pool: PhysicalPagePool,
    /// Chunk owning each slot.
    owners: Vec<Option<ChunkCoord>>,
    stats: ResidencyStats,
}

impl FieldResidency {
    fn new(capacity: u32) -> Self {
        // Chunk pages own no texels, so the layout is nominal.
        let pool = PhysicalPagePool::new(PageLayout {
            capacity,
            tiles_per_axis: 1,
        });
        let capacity = pool.capacity() as usize;
        Self {
            pool,
            owners: vec![None; capacity],
            stats: ResidencyStats::default(),
        }
    }
}

/// Tracks chunk → (field, page) for both fields.
#[derive(Debug)]
pub struct ChunkResidencyManager {
    fields: [FieldResidency; 2],
    chunks: FxHashMap<ChunkCoord, Residency>,
    events: Vec<PageReleased>,
}

impl ChunkResidencyManager {
    /// Creates a manager with room for `near_chunks` and `far_chunks` resident chunks.
    pub fn new(near_chunks: u32, far_chunks: u32) -> Self {
        Self {
            fields: [FieldResidency::new(near_chunks), FieldResidency::new(far_chunks)],
            chunks: FxHashMap::default(),
            events: Vec::new(),
        }
    }

    /// Chunk pages available in `field`.
    pub fn capacity(&self, field: Field) -> u32 {
        self.fields[field.index()].pool.capacity()
    }

    /// Chunks currently holding a page in `field`.
    pub fn resident_count(&self, field: Field) -> u32 {
        self.fields[field.index()].pool.allocated_count()
    }

    /// Counters of `field`.
    pub fn stats(&self, field: Field) -> &ResidencyStats {
        &self.fields[field.index()].stats
    }

    /// Field and page currently held by `chunk`.
    pub fn page_for(&self, chunk: ChunkCoord) -> Option<(Field, PhysicalPageId)> {
        self.chunks.get(&chunk).map(|r| (r.field, r.page))
    }

    /// Chunk holding `page` in `field`.
    pub fn chunk_at(&self, field: Field, page: PhysicalPageId) -> Option<ChunkCoord> {
        self.fields[field.index()]
            .owners
            .get(page.slot() as usize)
            .copied()
            .flatten()
    }

    /// Iterates resident chunks of `field` in slot order.
    pub fn resident_chunks(&self, field: Field) -> impl Iterator<Item = (ChunkCoord, PhysicalPageId)> + '_ {
        self.fields[field.index()]
            .owners
            .iter()
            .enumerate()
            .filter_map(|(slot, owner)| {
                let chunk = (*owner)?;
                PhysicalPageId::new(slot as u32 + 1).map(|page| (chunk, page))
            })
    }

    /// Gives `chunk` a page in `field`, reusing its current one if it already
    /// lives there. A chunk resident in the other field is released from it
    /// first. Evicts the least recently activated unpinned chunk when the pool
    /// is full. Returns `None` if every page of the field is pinned.
    pub fn try_activate_chunk(&mut self, field: Field, chunk: ChunkCoord) -> Option<PhysicalPageId> {
        if let Some(current) = self.chunks.get(&chunk).copied() {
            if current.field == field {
                let state = &mut self.fields[field.index()];
                state.pool.touch(current.page);
                state.stats.reuses += 1;
                return Some(current.page);
            }
            self.release(chunk, ReleaseReason::FieldTransition);
        }

        let page = match self.fields[field.index()].pool.try_allocate() {
            Some(page) => page,
            None => {
                let Some(victim) = self.fields[field.index()].pool.try_get_eviction_candidate() else {
                    self.fields[field.index()].stats.failed_activations += 1;
                    tracing::debug!(?field, ?chunk, "no chunk page available");
                    return None;
                };
                self.evict(field, victim);
                self.fields[field.index()].pool.try_allocate()?
            }
        };

        let state = &mut self.fields[field.index()];
        state.owners[page.slot() as usize] = Some(chunk);
        state.stats.activations += 1;
        self.chunks.insert(chunk, Residency { field, page });
        Some(page)
    }

    /// Releases whatever page `chunk` holds. Returns `false` if it held none.
    pub fn on_chunk_unloaded(&mut self, chunk: ChunkCoord) -> bool {
        self.release(chunk, ReleaseReason::Unloaded)
    }

    /// Protects `chunk`'s page from eviction. No-op if not resident.
    pub fn pin_chunk(&mut self, chunk: ChunkCoord) {
        if let Some(r) = self.chunks.get(&chunk) {
            self.fields[r.field.index()].pool.pin(r.page);
        }
    }

    /// Drops one pin of `chunk`'s page. No-op if not resident.
    pub fn unpin_chunk(&mut self, chunk: ChunkCoord) {
        if let Some(r) = self.chunks.get(&chunk) {
            self.fields[r.field.index()].pool.unpin(r.page);
        }
    }

    /// Removes and yields every pending release event, oldest first.
    pub fn drain_events(&mut self) -> impl Iterator<Item = PageReleased> + '_ {
        self.events.drain(..)
    }

    /// Pending release events.
    pub fn events(&self) -> &[PageReleased] {
        &self.events
    }

    fn release(&mut self, chunk: ChunkCoord, reason: ReleaseReason) -> bool {
        let Some(Residency { field, page }) = self.chunks.remove(&chunk) else {
            return false;
        };
        let state = &mut self.fields[field.index()];
        state.owners[page.slot() as usize] = None;
        state.pool.free(page);
        match reason {
            ReleaseReason::Unloaded => state.stats.unload_releases += 1,
            ReleaseReason::FieldTransition => state.stats.transition_releases += 1,
            ReleaseReason::Evicted => state.stats.evictions += 1,
        }
        self.events.push(PageReleased {
            field,
            chunk,
            physical_page_id: page,
            reason,
        });
        true
    }

    fn evict(&mut self, field: Field, victim: PhysicalPageId) {
        match self.chunk_at(field, victim) {
            Some(owner) => {
                tracing::trace!(?field, chunk = ?owner, page = victim.get(), "evicting chunk page");
                self.release(owner, ReleaseReason::Evicted);
            }
            None => {
                self.fields[field.index()].pool.free(victim);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
