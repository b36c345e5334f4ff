//! Feedback request processor: turns last frame's GPU page requests into
//! allocations, evictions, page-table updates and capture/relight work.
//!
//! One call to [`FeedbackRequestProcessor::process`] runs three stages in
//! order:
//!
//! 1. **Intake**: at most `max_requests` requests are examined; requests
//!    naming a chunk slot or virtual page outside the table are dropped.
//! 2. **Allocation**: mapped pages are touched; unmapped pages get a physical
//!    page while the allocation budget lasts, evicting the LRU unpinned page
//!    when the pool is full. Everything else is deferred to a later frame.
//! 3. **Emission**: one capture and one relight item per new page, then the
//!    round-robin relight refresh of already populated pages.
//!
//! Feedback is at least one frame stale, so nothing here is an error: bad
//! indices are ignored and exhaustion just leaves pages unmapped, which makes
//! the GPU request them again.

use rustc_hash::FxHashMap;

use crate::field_pool::{AtlasBackend, Field, PhysicalFieldPool};
use crate::gpu_types::{CaptureWork, PageRequest, RelightWork};
use crate::packing::{EntryFlags, PageTableEntry, pack_occupancy_clamped};
use crate::page_table::{PageTableMirror, PageTableWriter};
use crate::planner::PhysicalPoolPlan;
use crate::pool::PhysicalPageId;
use crate::virtual_space::{VirtualPageKey, VirtualSpaceAllocator};

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Per-call work bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeedbackBudget {
    /// Requests examined per call; the rest are left for later.
    pub max_requests: usize,
    /// New physical pages bound per call.
    pub max_new_allocations: usize,
    /// Relight-only refresh items emitted per call.
    pub max_recapture: usize,
}

impl Default for FeedbackBudget {
    fn default() -> Self {
        Self {
            max_requests: 4096,
            max_new_allocations: 256,
            max_recapture: 128,
        }
    }
}

/// Caller-owned round-robin refresh state.
#[derive(Debug)]
pub struct RecaptureInput<'a> {
    /// Candidate pages; non-resident or still-capturing entries are skipped.
    pub pages: &'a [VirtualPageKey],
    /// Next index into `pages`, advanced across calls.
    pub cursor: &'a mut usize,
}

/// Everything one `process` call consumes.
#[derive(Debug)]
pub struct FeedbackInput<'a> {
    /// Requests read back from the GPU, oldest first.
    pub requests: &'a [PageRequest],
    /// Work bounds.
    pub budget: FeedbackBudget,
    /// Optional relight refresh.
    pub recapture: Option<RecaptureInput<'a>>,
}

/// Output queues consumed by the capture and relight passes.
#[derive(Debug, Default)]
pub struct WorkQueues {
    /// Pages to capture.
    pub capture: Vec<CaptureWork>,
    /// Pages to relight.
    pub relight: Vec<RelightWork>,
}

impl WorkQueues {
    /// Empties both queues, keeping their allocations.
    pub fn clear(&mut self) {
        self.capture.clear();
        self.relight.clear();
    }

    /// Returns `true` if both queues are empty.
    pub fn is_empty(&self) -> bool {
        self.capture.is_empty() && self.relight.is_empty()
    }
}

/// What one `process` call did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Capture items appended.
    pub capture_count: usize,
    /// Relight items appended (allocation and refresh).
    pub relight_count: usize,
    /// Requests examined.
    pub examined: usize,
    /// Requests for already mapped pages.
    pub coalesced: usize,
    /// New pages bound.
    pub allocated: usize,
    /// Pages evicted to make room.
    pub evicted: usize,
    /// Unmapped requests left for a later call.
    pub deferred: usize,
    /// Requests with out-of-range indices.
    pub rejected: usize,
    /// Relight-only refresh items.
    pub recaptured: usize,
}

/// Running totals over every `process` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeedbackStats {
    /// Calls to `process`.
    pub calls: u64,
    /// Requests examined.
    pub examined: u64,
    /// Requests for already mapped pages.
    pub coalesced: u64,
    /// New pages bound.
    pub allocated: u64,
    /// Pages evicted.
    pub evicted: u64,
    /// Requests deferred.
    pub deferred: u64,
    /// Requests rejected.
    pub rejected: u64,
    /// Capture items emitted.
    pub captured: u64,
    /// Relight items emitted, refreshes included.
    pub relit: u64,
    /// Relight-only refresh items emitted.
    pub recaptured: u64,
    /// Completions ignored because the page moved on.
    pub stale_completions: u64,
}

impl FeedbackStats {
    fn record(&mut self, outcome: &ProcessOutcome) {
        self.calls += 1;
        self.examined += outcome.examined as u64;
        self.coalesced += outcome.coalesced as u64;
        self.allocated += outcome.allocated as u64;
        self.evicted += outcome.evicted as u64;
        self.deferred += outcome.deferred as u64;
        self.rejected += outcome.rejected as u64;
        self.captured += outcome.capture_count as u64;
        self.relit += outcome.relight_count as u64;
        self.recaptured += outcome.recaptured as u64;
    }
}

/// Per-chunk-slot page counts feeding the occupancy word.
#[derive(Clone, Copy, Debug, Default)]
struct SlotCounters {
    resident: u32,
    pending: u32,
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// Owns one field's virtual↔physical maps and page-table mirror.
#[derive(Debug)]
pub struct FeedbackRequestProcessor {
    pool: PhysicalFieldPool,
    virtual_space: VirtualSpaceAllocator,
    table: PageTableMirror,
    virtual_to_physical: FxHashMap<VirtualPageKey, PhysicalPageId>,
    /// Indexed by physical slot (`id - 1`).
    physical_to_virtual: Vec<Option<VirtualPageKey>>,
    slot_counters: Vec<SlotCounters>,
    stats: FeedbackStats,
    intake_scratch: Vec<VirtualPageKey>,
    new_pages: Vec<(VirtualPageKey, PhysicalPageId)>,
}

impl FeedbackRequestProcessor {
    /// Creates a processor over `pool` for `chunk_slot_count` chunk slots.
    pub fn new(pool: PhysicalFieldPool, chunk_slot_count: u32) -> Self {
        Self::with_virtual_space(pool, chunk_slot_count, VirtualSpaceAllocator::default())
    }

    /// Creates a processor with a custom virtual grid.
    pub fn with_virtual_space(
        pool: PhysicalFieldPool,
        chunk_slot_count: u32,
        virtual_space: VirtualSpaceAllocator,
    ) -> Self {
        let capacity = pool.pool().capacity() as usize;
        Self {
            pool,
            virtual_space,
            table: PageTableMirror::new(chunk_slot_count),
            virtual_to_physical: FxHashMap::default(),
            physical_to_virtual: vec![None; capacity],
            slot_counters: vec![SlotCounters::default(); chunk_slot_count as usize],
            stats: FeedbackStats::default(),
            intake_scratch: Vec::new(),
            new_pages: Vec::new(),
        }
    }

    /// Field served by this processor.
    pub fn field(&self) -> Field {
        self.pool.field()
    }

    /// The underlying field pool.
    pub fn field_pool(&self) -> &PhysicalFieldPool {
        &self.pool
    }

    /// Mutable access to the field pool, for resource lifecycle calls.
    pub fn field_pool_mut(&mut self) -> &mut PhysicalFieldPool {
        &mut self.pool
    }

    /// Running totals.
    pub fn stats(&self) -> &FeedbackStats {
        &self.stats
    }

    /// Number of chunk slots.
    pub fn chunk_slot_count(&self) -> u32 {
        self.table.chunk_slot_count()
    }

    /// Number of mapped virtual pages.
    pub fn mapped_count(&self) -> usize {
        self.virtual_to_physical.len()
    }

    /// Physical page bound to `key`.
    pub fn lookup(&self, key: VirtualPageKey) -> Option<PhysicalPageId> {
        self.virtual_to_physical.get(&key).copied()
    }

    /// Virtual page bound to `id`.
    pub fn virtual_page_of(&self, id: PhysicalPageId) -> Option<VirtualPageKey> {
        self.physical_to_virtual
            .get(id.slot() as usize)
            .copied()
            .flatten()
    }

    /// Current page-table entry of `key`.
    pub fn entry(&self, key: VirtualPageKey) -> PageTableEntry {
        self.table.get(key)
    }

    /// Mapped pages in physical slot order (stable across calls).
    pub fn resident_pages(&self) -> impl Iterator<Item = VirtualPageKey> + '_ {
        self.physical_to_virtual.iter().flatten().copied()
    }

    /// Packed occupancy word of a chunk slot, or `None` if out of range.
    pub fn occupancy(&self, chunk_slot: u32) -> Option<u32> {
        let counters = self.slot_counters.get(chunk_slot as usize)?;
        Some(pack_occupancy_clamped(
            i64::from(counters.resident),
            i64::from(counters.pending),
            i64::from(self.field().occupancy_code()),
        ))
    }

    /// Runs one intake → allocation → emission step.
    pub fn process(
        &mut self,
        input: FeedbackInput<'_>,
        writer: &mut dyn PageTableWriter,
        work: &mut WorkQueues,
    ) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();

        let mut keys = std::mem::take(&mut self.intake_scratch);
        keys.clear();
        self.intake(input.requests, input.budget.max_requests, &mut keys, &mut outcome);

        let mut new_pages = std::mem::take(&mut self.new_pages);
        new_pages.clear();
        self.allocate(&keys, input.budget.max_new_allocations, writer, &mut new_pages, &mut outcome);

        self.emit(&new_pages, work, &mut outcome);
        if let Some(recapture) = input.recapture {
            self.refresh(recapture, input.budget.max_recapture, work, &mut outcome);
        }

        self.intake_scratch = keys;
        self.new_pages = new_pages;
        self.stats.record(&outcome);

        if outcome.examined > 0 || outcome.recaptured > 0 {
            tracing::debug!(
                field = ?self.field(),
                examined = outcome.examined,
                coalesced = outcome.coalesced,
                allocated = outcome.allocated,
                evicted = outcome.evicted,
                deferred = outcome.deferred,
                rejected = outcome.rejected,
                recaptured = outcome.recaptured,
                "processed page feedback"
            );
        }
        outcome
    }

    fn intake(
        &self,
        requests: &[PageRequest],
        max_requests: usize,
        keys: &mut Vec<VirtualPageKey>,
        outcome: &mut ProcessOutcome,
    ) {
        for request in requests.iter().take(max_requests) {
            outcome.examined += 1;
            let key = VirtualPageKey::new(request.chunk_slot, request.virtual_page_index);
            if self.accepts(key) {
                keys.push(key);
            } else {
                outcome.rejected += 1;
            }
        }
    }

    fn allocate(
        &mut self,
        keys: &[VirtualPageKey],
        max_new_allocations: usize,
        writer: &mut dyn PageTableWriter,
        new_pages: &mut Vec<(VirtualPageKey, PhysicalPageId)>,
        outcome: &mut ProcessOutcome,
    ) {
        for &key in keys {
            if let Some(&id) = self.virtual_to_physical.get(&key) {
                self.pool.pool_mut().touch(id);
                outcome.coalesced += 1;
                continue;
            }
            if outcome.allocated >= max_new_allocations {
                outcome.deferred += 1;
                continue;
            }
            match self.allocate_page(key, writer) {
                Some((id, evicted)) => {
                    outcome.allocated += 1;
                    outcome.evicted += usize::from(evicted);
                    new_pages.push((key, id));
                }
                None => outcome.deferred += 1,
            }
        }
    }

    /// Queues capture and relight work for pages still bound as allocated.
    /// Pages evicted later in the same call get no work.
    fn emit(
        &self,
        new_pages: &[(VirtualPageKey, PhysicalPageId)],
        work: &mut WorkQueues,
        outcome: &mut ProcessOutcome,
    ) {
        for &(key, id) in new_pages {
            if self.virtual_to_physical.get(&key) != Some(&id) {
                continue;
            }
            work.capture.push(CaptureWork {
                physical_page_id: id.get(),
                chunk_slot: key.chunk_slot,
                patch_id: key.page_index,
                virtual_page_index: key.page_index,
            });
            work.relight.push(RelightWork {
                physical_page_id: id.get(),
                chunk_slot: key.chunk_slot,
                patch_id: key.page_index,
                virtual_page_index: key.page_index,
            });
            outcome.capture_count += 1;
            outcome.relight_count += 1;
        }
    }

    fn refresh(
        &self,
        recapture: RecaptureInput<'_>,
        max_recapture: usize,
        work: &mut WorkQueues,
        outcome: &mut ProcessOutcome,
    ) {
        let len = recapture.pages.len();
        if len == 0 {
            *recapture.cursor = 0;
            return;
        }
        let mut scanned = 0;
        while scanned < len && outcome.recaptured < max_recapture {
            let index = *recapture.cursor % len;
            *recapture.cursor = (index + 1) % len;
            scanned += 1;

            let key = recapture.pages[index];
            let Some(&id) = self.virtual_to_physical.get(&key) else {
                continue;
            };
            if self.table.get(key).flags().needs_capture {
                continue;
            }
            work.relight.push(RelightWork {
                physical_page_id: id.get(),
                chunk_slot: key.chunk_slot,
                patch_id: key.page_index,
                virtual_page_index: key.page_index,
            });
            outcome.recaptured += 1;
            outcome.relight_count += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Clears `NeedsCapture` for finished capture items. Returns how many applied.
    pub fn complete_capture(&mut self, done: &[CaptureWork], writer: &mut dyn PageTableWriter) -> usize {
        let mut applied = 0;
        for w in done {
            let key = VirtualPageKey::new(w.chunk_slot, w.virtual_page_index);
            if self.complete(key, w.physical_page_id, |flags| flags.needs_capture = false, writer) {
                applied += 1;
            }
        }
        applied
    }

    /// Clears `NeedsRelight` for finished relight items. Returns how many applied.
    pub fn complete_relight(&mut self, done: &[RelightWork], writer: &mut dyn PageTableWriter) -> usize {
        let mut applied = 0;
        for w in done {
            let key = VirtualPageKey::new(w.chunk_slot, w.virtual_page_index);
            if self.complete(key, w.physical_page_id, |flags| flags.needs_relight = false, writer) {
                applied += 1;
            }
        }
        applied
    }

    fn complete(
        &mut self,
        key: VirtualPageKey,
        physical_page_id: u32,
        clear: impl FnOnce(&mut EntryFlags),
        writer: &mut dyn PageTableWriter,
    ) -> bool {
        let current = self.virtual_to_physical.get(&key).copied();
        if current.is_none() || current != PhysicalPageId::new(physical_page_id) {
            self.stats.stale_completions += 1;
            tracing::trace!(?key, physical_page_id, "ignoring stale completion");
            return false;
        }
        let entry = self.table.get(key);
        let before = entry.flags();
        let mut after = before;
        clear(&mut after);
        if after == before {
            return true;
        }
        let was_pending = before.needs_capture || before.needs_relight;
        let is_pending = after.needs_capture || after.needs_relight;
        if was_pending && !is_pending {
            let counters = self.counters_mut(key.chunk_slot);
            counters.pending = counters.pending.saturating_sub(1);
        }
        self.table.set(key, entry.with_flags(after), writer);
        true
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    /// Frees the page bound to `key` and zeroes its entry. Returns `false` if unmapped.
    pub fn release_virtual_page(&mut self, key: VirtualPageKey, writer: &mut dyn PageTableWriter) -> bool {
        match self.virtual_to_physical.get(&key).copied() {
            Some(id) => {
                self.release_physical(id, writer);
                true
            }
            None => false,
        }
    }

    /// Frees every page bound to `chunk_slot`. Returns the number released.
    pub fn release_chunk_slot(&mut self, chunk_slot: u32, writer: &mut dyn PageTableWriter) -> usize {
        let ids: Vec<PhysicalPageId> = self
            .physical_to_virtual
            .iter()
            .enumerate()
            .filter(|(_, key)| key.is_some_and(|k| k.chunk_slot == chunk_slot))
            .filter_map(|(slot, _)| PhysicalPageId::new(slot as u32 + 1))
            .collect();
        for &id in &ids {
            self.release_physical(id, writer);
        }
        if !ids.is_empty() {
            tracing::debug!(field = ?self.field(), chunk_slot, pages = ids.len(), "released chunk slot");
        }
        ids.len()
    }

    /// Pins the page bound to `key` so it cannot be evicted. No-op if unmapped.
    pub fn pin(&mut self, key: VirtualPageKey) {
        if let Some(&id) = self.virtual_to_physical.get(&key) {
            self.pool.pool_mut().pin(id);
        }
    }

    /// Drops one pin of the page bound to `key`. No-op if unmapped.
    pub fn unpin(&mut self, key: VirtualPageKey) {
        if let Some(&id) = self.virtual_to_physical.get(&key) {
            self.pool.pool_mut().unpin(id);
        }
    }

    /// Applies a new pool plan. When it changes, every mapping is released
    /// (entries zeroed) before the pool is rebuilt. Returns `true` if rebuilt.
    pub fn reconfigure(
        &mut self,
        plan: PhysicalPoolPlan,
        backend: &mut dyn AtlasBackend,
        writer: &mut dyn PageTableWriter,
    ) -> bool {
        if *self.pool.plan() == plan {
            return false;
        }
        let mapped: Vec<PhysicalPageId> = self.virtual_to_physical.values().copied().collect();
        for id in mapped {
            self.release_physical(id, writer);
        }
        self.pool.reconfigure(plan, backend);
        self.physical_to_virtual = vec![None; self.pool.pool().capacity() as usize];
        true
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn accepts(&self, key: VirtualPageKey) -> bool {
        key.chunk_slot < self.table.chunk_slot_count()
            && self.virtual_space.contains_index(key.page_index)
    }

    /// Binds a fresh page to `key`, evicting first if the pool is full.
    /// Returns the page and whether an eviction happened.
    fn allocate_page(
        &mut self,
        key: VirtualPageKey,
        writer: &mut dyn PageTableWriter,
    ) -> Option<(PhysicalPageId, bool)> {
        let (id, evicted) = match self.pool.pool_mut().try_allocate() {
            Some(id) => (id, false),
            None => {
                let victim = self.pool.pool().try_get_eviction_candidate()?;
                tracing::trace!(field = ?self.field(), victim = victim.get(), "evicting page");
                self.release_physical(victim, writer);
                (self.pool.pool_mut().try_allocate()?, true)
            }
        };

        self.virtual_to_physical.insert(key, id);
        self.physical_to_virtual[id.slot() as usize] = Some(key);
        let counters = self.counters_mut(key.chunk_slot);
        counters.resident += 1;
        counters.pending += 1;

        // Fresh pages always carry an id the entry can encode.
        let entry = PageTableEntry::pack_clamped(i64::from(id.get()), EntryFlags::FRESH);
        self.table.set(key, entry, writer);
        Some((id, evicted))
    }

    /// Unbinds and frees a physical page, zeroing its old entry first.
    fn release_physical(&mut self, id: PhysicalPageId, writer: &mut dyn PageTableWriter) {
        if let Some(key) = self
            .physical_to_virtual
            .get_mut(id.slot() as usize)
            .and_then(Option::take)
        {
            self.virtual_to_physical.remove(&key);
            let flags = self.table.get(key).flags();
            let counters = self.counters_mut(key.chunk_slot);
            counters.resident = counters.resident.saturating_sub(1);
            if flags.needs_capture || flags.needs_relight {
                counters.pending = counters.pending.saturating_sub(1);
            }
            self.table.set(key, PageTableEntry::EMPTY, writer);
        }
        self.pool.pool_mut().free(id);
    }

    fn counters_mut(&mut self, chunk_slot: u32) -> &mut SlotCounters {
        &mut self.slot_counters[chunk_slot as usize]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_pool::tests::{RecordingBackend, plan_with_capacity};
    use crate::packing::{ChunkOccupancy, is_ready_for_sampling};
    use crate::page_table::StagedPageTableWriter;

    fn processor(capacity: u32) -> FeedbackRequestProcessor {
        let pool = PhysicalFieldPool::new(Field::Near, plan_with_capacity(capacity));
        FeedbackRequestProcessor::new(pool, 4)
    }

    fn budget(max_new_allocations: usize) -> FeedbackBudget {
        FeedbackBudget {
            max_requests: 1024,
            max_new_allocations,
            max_recapture: 0,
        }
    }

    fn run(
        proc: &mut FeedbackRequestProcessor,
        requests: &[PageRequest],
        max_new: usize,
        writer: &mut StagedPageTableWriter,
        work: &mut WorkQueues,
    ) -> ProcessOutcome {
        proc.process(
            FeedbackInput {
                requests,
                budget: budget(max_new),
                recapture: None,
            },
            writer,
            work,
        )
    }

    fn key(slot: u32, page: u32) -> VirtualPageKey {
        VirtualPageKey::new(slot, page)
    }

    #[test]
    fn test_unmapped_request_allocates_and_emits_work() {
        let mut proc = processor(8);
        let mut writer = StagedPageTableWriter::new();
        let mut work = WorkQueues::default();

        let outcome = run(&mut proc, &[PageRequest::new(1, 42)], 8, &mut writer, &mut work);

        assert_eq!(outcome.capture_count, 1);
        assert_eq!(outcome.relight_count, 1);
        assert_eq!(outcome.allocated, 1);
        let id = proc.lookup(key(1, 42)).unwrap();
        assert_eq!(proc.virtual_page_of(id), Some(key(1, 42)));
        assert_eq!(
            work.capture,
            vec![CaptureWork {
                physical_page_id: id.get(),
                chunk_slot: 1,
                patch_id: 42,
                virtual_page_index: 42,
            }]
        );
        assert_eq!(work.relight.len(), 1);

        let writes = writer.take();
        assert_eq!(writes.len(), 1);
        let entry = writes[0].entry;
        assert_eq!(entry.physical_id(), id.get());
        assert_eq!(entry.flags(), EntryFlags::FRESH);
        assert!(!is_ready_for_sampling(entry));
    }

    #[test]
    fn test_repeat_request_only_touches() {
        let mut proc = processor(2);
        let mut writer = StagedPageTableWriter::new();
        let mut work = WorkQueues::default();
        run(&mut proc, &[PageRequest::new(0, 1), PageRequest::new(0, 2)], 8, &mut writer, &mut work);
        let first = proc.lookup(key(0, 1)).unwrap();
        assert_eq!(proc.field_pool().pool().try_get_eviction_candidate(), Some(first));
        writer.take();
        work.clear();

        let outcome = run(&mut proc, &[PageRequest::new(0, 1)], 8, &mut writer, &mut work);
        assert_eq!(outcome.coalesced, 1);
        assert_eq!(outcome.capture_count + outcome.relight_count, 0);
        assert!(work.is_empty());
        assert!(writer.is_empty());
        // Recency refreshed: the other page is now the eviction candidate.
        assert_eq!(
            proc.field_pool().pool().try_get_eviction_candidate(),
            proc.lookup(key(0, 2))
        );
    }

    #[test]
    fn test_full_pool_evicts_least_recently_used() {
        let mut proc = processor(4);
        let mut writer = StagedPageTableWriter::new();
        let mut work = WorkQueues::default();
        let requests: Vec<_> = (0..6).map(|p| PageRequest::new(0, p)).collect();

        let outcome = run(&mut proc, &requests, 16, &mut writer, &mut work);

        assert_eq!(outcome.allocated, 6);
        assert_eq!(outcome.evicted, 2);
        assert_eq!(proc.mapped_count(), 4);
        for page in 0..2 {
            assert!(proc.lookup(key(0, page)).is_none());
            assert_eq!(proc.entry(key(0, page)), PageTableEntry::EMPTY);
        }
        for page in 2..6 {
            let id = proc.lookup(key(0, page)).unwrap();
            assert_eq!(proc.virtual_page_of(id), Some(key(0, page)));
        }
        // Each victim's entry is zeroed before its page is handed out again.
        let writes = writer.take();
        let victim_zero = writes
            .iter()
            .position(|w| w.virtual_page_index == 0 && w.entry == PageTableEntry::EMPTY)
            .unwrap();
        let reuse = writes.iter().position(|w| w.virtual_page_index == 4).unwrap();
        assert!(victim_zero < reuse);

        // Pages evicted within the call get no work: one writer per tile.
        assert_eq!(outcome.capture_count, 4);
        assert_eq!(outcome.relight_count, 4);
        assert_eq!(work.capture.len(), 4);
        assert_eq!(work.relight.len(), 4);
        for item in &work.capture {
            let id = proc.lookup(key(item.chunk_slot, item.virtual_page_index));
            assert_eq!(id.map(PhysicalPageId::get), Some(item.physical_page_id));
        }
        for item in &work.relight {
            let id = proc.lookup(key(item.chunk_slot, item.virtual_page_index));
            assert_eq!(id.map(PhysicalPageId::get), Some(item.physical_page_id));
        }
        let mut tiles: Vec<u32> = work.capture.iter().map(|w| w.physical_page_id).collect();
        tiles.sort_unstable();
        tiles.dedup();
        assert_eq!(tiles.len(), 4);
    }

    #[test]
    fn test_allocation_budget_converges_over_calls() {
        let mut proc = processor(32);
        let mut writer = StagedPageTableWriter::new();
        let mut work = WorkQueues::default();
        let requests: Vec<_> = (0..10).map(|p| PageRequest::new(2, p)).collect();

        let mut calls = 0;
        while proc.mapped_count() < 10 {
            let outcome = run(&mut proc, &requests, 3, &mut writer, &mut work);
            assert!(outcome.allocated <= 3);
            calls += 1;
            assert!(calls <= 4, "should converge once 3·calls ≥ 10");
        }
        assert_eq!(calls, 4);
        assert_eq!(work.capture.len(), 10);
        let outcome = run(&mut proc, &requests, 3, &mut writer, &mut work);
        assert_eq!(outcome.coalesced, 10);
        assert_eq!(outcome.deferred, 0);
    }

    #[test]
    fn test_request_cap_defers_tail() {
        let mut proc = processor(8);
        let mut writer = StagedPageTableWriter::new();
        let mut work = WorkQueues::default();
        let requests: Vec<_> = (0..5).map(|p| PageRequest::new(0, p)).collect();
        let outcome = proc.process(
            FeedbackInput {
                requests: &requests,
                budget: FeedbackBudget {
                    max_requests: 2,
                    max_new_allocations: 8,
                    max_recapture: 0,
                },
                recapture: None,
            },
            &mut writer,
            &mut work,
        );
        assert_eq!(outcome.examined, 2);
        assert_eq!(proc.mapped_count(), 2);
    }

    #[test]
    fn test_out_of_range_requests_rejected() {
        let mut proc = processor(8);
        let mut writer = StagedPageTableWriter::new();
        let mut work = WorkQueues::default();
        let requests = [
            PageRequest::new(4, 0),
            PageRequest::new(0, 16_384),
            PageRequest::new(u32::MAX, u32::MAX),
            PageRequest::new(3, 16_383),
        ];
        let outcome = run(&mut proc, &requests, 8, &mut writer, &mut work);
        assert_eq!(outcome.rejected, 3);
        assert_eq!(outcome.allocated, 1);
        assert!(proc.lookup(key(3, 16_383)).is_some());
    }

    #[test]
    fn test_all_pinned_defers_allocation() {
        let mut proc = processor(2);
        let mut writer = StagedPageTableWriter::new();
        let mut work = WorkQueues::default();
        run(&mut proc, &[PageRequest::new(0, 0), PageRequest::new(0, 1)], 8, &mut writer, &mut work);
        proc.pin(key(0, 0));
        proc.pin(key(0, 1));

        let outcome = run(&mut proc, &[PageRequest::new(0, 2)], 8, &mut writer, &mut work);
        assert_eq!(outcome.allocated, 0);
        assert_eq!(outcome.deferred, 1);
        assert!(proc.lookup(key(0, 0)).is_some());

        proc.unpin(key(0, 1));
        let outcome = run(&mut proc, &[PageRequest::new(0, 2)], 8, &mut writer, &mut work);
        assert_eq!(outcome.evicted, 1);
        assert!(proc.lookup(key(0, 1)).is_none());
        assert!(proc.lookup(key(0, 0)).is_some());
    }

    #[test]
    fn test_completion_marks_ready() {
        let mut proc = processor(4);
        let mut writer = StagedPageTableWriter::new();
        let mut work = WorkQueues::default();
        run(&mut proc, &[PageRequest::new(1, 7)], 8, &mut writer, &mut work);
        let occ = ChunkOccupancy::unpack(proc.occupancy(1).unwrap());
        assert_eq!((occ.resident_pages, occ.pending_pages, occ.field_code), (1, 1, 1));

        assert_eq!(proc.complete_capture(&work.capture, &mut writer), 1);
        assert!(!is_ready_for_sampling(proc.entry(key(1, 7))));
        assert_eq!(proc.complete_relight(&work.relight, &mut writer), 1);
        assert!(is_ready_for_sampling(proc.entry(key(1, 7))));

        let occ = ChunkOccupancy::unpack(proc.occupancy(1).unwrap());
        assert_eq!((occ.resident_pages, occ.pending_pages), (1, 0));
    }

    #[test]
    fn test_stale_completion_ignored() {
        let mut proc = processor(1);
        let mut writer = StagedPageTableWriter::new();
        let mut work = WorkQueues::default();
        run(&mut proc, &[PageRequest::new(0, 0)], 8, &mut writer, &mut work);
        let stale = work.capture.clone();
        work.clear();
        // Page 0 is evicted for page 1; the old capture now targets page 1's tile.
        run(&mut proc, &[PageRequest::new(0, 1)], 8, &mut writer, &mut work);

        assert_eq!(proc.complete_capture(&stale, &mut writer), 0);
        assert_eq!(proc.stats().stale_completions, 1);
        assert!(proc.entry(key(0, 1)).flags().needs_capture);
    }

    #[test]
    fn test_recapture_round_robin() {
        let mut proc = processor(8);
        let mut writer = StagedPageTableWriter::new();
        let mut work = WorkQueues::default();
        let requests: Vec<_> = (0..3).map(|p| PageRequest::new(0, p)).collect();
        run(&mut proc, &requests, 8, &mut writer, &mut work);
        proc.complete_capture(&work.capture, &mut writer);
        proc.complete_relight(&work.relight, &mut writer);
        work.clear();

        let pages: Vec<_> = proc.resident_pages().collect();
        let mut cursor = 0;
        let mut refreshed = Vec::new();
        for _ in 0..3 {
            let outcome = proc.process(
                FeedbackInput {
                    requests: &[],
                    budget: FeedbackBudget {
                        max_requests: 0,
                        max_new_allocations: 0,
                        max_recapture: 2,
                    },
                    recapture: Some(RecaptureInput {
                        pages: &pages,
                        cursor: &mut cursor,
                    }),
                },
                &mut writer,
                &mut work,
            );
            assert_eq!(outcome.recaptured, 2);
            assert_eq!(outcome.capture_count, 0);
            refreshed.extend(work.relight.drain(..).map(|w| w.virtual_page_index));
        }
        assert_eq!(refreshed, vec![0, 1, 2, 0, 1, 2]);
        // Refresh leaves entries sample-ready.
        assert!(is_ready_for_sampling(proc.entry(key(0, 0))));
    }

    #[test]
    fn test_recapture_skips_pages_awaiting_capture() {
        let mut proc = processor(8);
        let mut writer = StagedPageTableWriter::new();
        let mut work = WorkQueues::default();
        run(&mut proc, &[PageRequest::new(0, 0)], 8, &mut writer, &mut work);
        work.clear();
        let pages = [key(0, 0), key(0, 5)];
        let mut cursor = 0;
        let outcome = proc.process(
            FeedbackInput {
                requests: &[],
                budget: FeedbackBudget {
                    max_recapture: 4,
                    ..FeedbackBudget::default()
                },
                recapture: Some(RecaptureInput {
                    pages: &pages,
                    cursor: &mut cursor,
                }),
            },
            &mut writer,
            &mut work,
        );
        assert_eq!(outcome.recaptured, 0);
        assert!(work.relight.is_empty());
    }

    #[test]
    fn test_release_chunk_slot_zeroes_entries() {
        let mut proc = processor(8);
        let mut writer = StagedPageTableWriter::new();
        let mut work = WorkQueues::default();
        let requests = [
            PageRequest::new(0, 1),
            PageRequest::new(1, 1),
            PageRequest::new(1, 2),
        ];
        run(&mut proc, &requests, 8, &mut writer, &mut work);
        writer.take();

        assert_eq!(proc.release_chunk_slot(1, &mut writer), 2);
        assert_eq!(proc.mapped_count(), 1);
        assert!(writer.writes().iter().all(|w| w.chunk_slot == 1 && w.entry == PageTableEntry::EMPTY));
        assert_eq!(proc.field_pool().pool().allocated_count(), 1);
        let occ = ChunkOccupancy::unpack(proc.occupancy(1).unwrap());
        assert_eq!((occ.resident_pages, occ.pending_pages), (0, 0));
        assert!(!proc.release_virtual_page(key(1, 1), &mut writer));
        assert!(proc.release_virtual_page(key(0, 1), &mut writer));
        assert_eq!(proc.table.stored_count(), 0);
    }

    #[test]
    fn test_stats_accumulate_over_calls() {
        let mut proc = processor(8);
        let mut writer = StagedPageTableWriter::new();
        let mut work = WorkQueues::default();
        let requests: Vec<_> = (0..3).map(|p| PageRequest::new(0, p)).collect();
        run(&mut proc, &requests, 8, &mut writer, &mut work);
        proc.complete_capture(&work.capture, &mut writer);
        proc.complete_relight(&work.relight, &mut writer);
        work.clear();

        let pages: Vec<_> = proc.resident_pages().collect();
        let mut cursor = 0;
        proc.process(
            FeedbackInput {
                requests: &requests,
                budget: FeedbackBudget {
                    max_recapture: 2,
                    ..FeedbackBudget::default()
                },
                recapture: Some(RecaptureInput {
                    pages: &pages,
                    cursor: &mut cursor,
                }),
            },
            &mut writer,
            &mut work,
        );

        let stats = proc.stats();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.examined, 6);
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.coalesced, 3);
        assert_eq!(stats.captured, 3);
        assert_eq!(stats.recaptured, 2);
        assert_eq!(stats.relit, 5);
    }

    #[test]
    fn test_reconfigure_releases_everything() {
        let mut proc = processor(4);
        let mut backend = RecordingBackend::default();
        let mut writer = StagedPageTableWriter::new();
        let mut work = WorkQueues::default();
        run(&mut proc, &[PageRequest::new(0, 3)], 8, &mut writer, &mut work);
        writer.take();

        assert!(!proc.reconfigure(plan_with_capacity(4), &mut backend, &mut writer));
        assert!(proc.reconfigure(plan_with_capacity(16), &mut backend, &mut writer));
        assert_eq!(proc.mapped_count(), 0);
        assert_eq!(proc.entry(key(0, 3)), PageTableEntry::EMPTY);
        assert_eq!(writer.len(), 1);
        assert_eq!(proc.field_pool().pool().capacity(), 16);

        let requests: Vec<_> = (0..16).map(|p| PageRequest::new(0, p)).collect();
        let outcome = run(&mut proc, &requests, 16, &mut writer, &mut work);
        assert_eq!(outcome.evicted, 0);
    }
}
