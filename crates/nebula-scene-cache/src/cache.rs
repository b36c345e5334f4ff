//! [`VirtualSceneCache`]: both fields, chunk residency and patch registries
//! wired together for a renderer's frame loop.
//!
//! A chunk's slot in its field's page table is its residency page slot, so a
//! chunk that loses its residency page (unload, field transition, eviction)
//! loses every patch page of that slot in the same step.

use nebula_config::{FieldConfig, SceneCacheConfig};
use rustc_hash::FxHashMap;

use crate::error::{PlanError, RegistryError};
use crate::feedback::{
    FeedbackBudget, FeedbackInput, FeedbackRequestProcessor, ProcessOutcome, RecaptureInput,
    WorkQueues,
};
use crate::field_pool::{AtlasBackend, Field, PhysicalFieldPool};
use crate::gpu_types::{CaptureWork, PageRequest, PatchGeometry, PatchMetadata, RelightWork};
use crate::page_table::{PageTableWrite, StagedPageTableWriter};
use crate::patch::{PatchId, PatchKey};
use crate::planner::{PhysicalPoolPlan, PoolPlanRequest, plan_physical_pool};
use crate::registry::PatchRegistry;
use crate::residency::{ChunkCoord, ChunkResidencyManager, PageReleased};
use crate::sizing::FieldChunkBudget;
use crate::virtual_space::{VirtualPageCoord, VirtualPageKey, VirtualSpaceAllocator};

/// Round-robin refresh state of one field.
#[derive(Debug, Default)]
struct RecaptureState {
    pages: Vec<VirtualPageKey>,
    cursor: usize,
}

/// Chunk and page budgets of one field, derived from configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldLayout {
    /// Chunk budget (and chunk slot count).
    pub chunks: FieldChunkBudget,
    /// Physical pool plan for patch pages.
    pub plan: PhysicalPoolPlan,
}

impl FieldLayout {
    /// Plans the near field as a square and the far field as a ring around it.
    ///
    /// # Errors
    ///
    /// Returns a [`PlanError`] when the field's settings cannot form a pool.
    pub fn plan(field: Field, config: &SceneCacheConfig) -> Result<Self, PlanError> {
        let chunks = match field {
            Field::Near => FieldChunkBudget::square(config.near.radius_chunks),
            Field::Far => FieldChunkBudget::annulus(config.near.radius_chunks, config.far.radius_chunks),
        };
        let field_config: &FieldConfig = match field {
            Field::Near => &config.near,
            Field::Far => &config.far,
        };
        let plan = plan_physical_pool(PoolPlanRequest::new(
            field_config.texels_per_voxel_edge,
            chunks.total_pages(field_config.patch_pages_per_chunk),
            config.max_atlas_count,
        ))?;
        Ok(Self { chunks, plan })
    }
}

/// Paging state for both fields.
#[derive(Debug)]
pub struct VirtualSceneCache {
    config: SceneCacheConfig,
    layouts: [FieldLayout; 2],
    processors: [FeedbackRequestProcessor; 2],
    writers: [StagedPageTableWriter; 2],
    recapture: [RecaptureState; 2],
    residency: ChunkResidencyManager,
    registries: FxHashMap<ChunkCoord, PatchRegistry>,
    virtual_space: VirtualSpaceAllocator,
    released: Vec<PageReleased>,
}

impl VirtualSceneCache {
    /// Plans both fields from `config`.
    ///
    /// # Errors
    ///
    /// Returns a [`PlanError`] if either field's pool cannot be planned.
    pub fn from_config(config: &SceneCacheConfig) -> Result<Self, PlanError> {
        let near = FieldLayout::plan(Field::Near, config)?;
        let far = FieldLayout::plan(Field::Far, config)?;
        let processor = |field: Field, layout: &FieldLayout| {
            FeedbackRequestProcessor::new(
                PhysicalFieldPool::new(field, layout.plan),
                layout.chunks.total_chunks(),
            )
        };
        tracing::info!(
            near_chunks = near.chunks.total_chunks(),
            far_chunks = far.chunks.total_chunks(),
            near_pages = near.plan.capacity_pages,
            far_pages = far.plan.capacity_pages,
            "virtual scene cache created"
        );
        Ok(Self {
            config: config.clone(),
            processors: [processor(Field::Near, &near), processor(Field::Far, &far)],
            residency: ChunkResidencyManager::new(
                near.chunks.total_chunks(),
                far.chunks.total_chunks(),
            ),
            layouts: [near, far],
            writers: Default::default(),
            recapture: Default::default(),
            registries: FxHashMap::default(),
            virtual_space: VirtualSpaceAllocator::default(),
            released: Vec::new(),
        })
    }

    /// Configuration the cache was built from.
    pub fn config(&self) -> &SceneCacheConfig {
        &self.config
    }

    /// Budgets and plan of `field`.
    pub fn layout(&self, field: Field) -> &FieldLayout {
        &self.layouts[field.index()]
    }

    /// Feedback processor of `field`.
    pub fn processor(&self, field: Field) -> &FeedbackRequestProcessor {
        &self.processors[field.index()]
    }

    /// Chunk residency of both fields.
    pub fn residency(&self) -> &ChunkResidencyManager {
        &self.residency
    }

    /// Per-call budget taken from configuration.
    pub fn budget(&self) -> FeedbackBudget {
        FeedbackBudget {
            max_requests: self.config.max_requests_per_frame as usize,
            max_new_allocations: self.config.max_new_allocations_per_frame as usize,
            max_recapture: self.config.max_recapture_per_frame as usize,
        }
    }

    /// Creates the atlases of both fields if they do not exist yet.
    pub fn ensure_resources(&mut self, backend: &mut dyn AtlasBackend) {
        for processor in &mut self.processors {
            processor.field_pool_mut().ensure_resources(backend);
        }
    }

    /// Destroys the atlases of both fields.
    pub fn release_resources(&mut self, backend: &mut dyn AtlasBackend) {
        for processor in &mut self.processors {
            processor.field_pool_mut().release_resources(backend);
        }
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    /// Field a chunk belongs in for a camera in `camera`, or `None` beyond the far radius.
    pub fn field_for(&self, camera: ChunkCoord, chunk: ChunkCoord) -> Option<Field> {
        let distance = camera.horizontal_distance(chunk);
        if distance <= self.config.near.radius_chunks {
            Some(Field::Near)
        } else if distance <= self.config.far.radius_chunks {
            Some(Field::Far)
        } else {
            None
        }
    }

    /// Makes `chunk` resident in `field` and returns its chunk slot, or `None`
    /// if every chunk page of the field is pinned.
    pub fn activate_chunk(&mut self, field: Field, chunk: ChunkCoord) -> Option<u32> {
        let page = self.residency.try_activate_chunk(field, chunk);
        self.apply_releases();
        page.map(|p| p.slot())
    }

    /// Field and chunk slot of a resident chunk.
    pub fn chunk_slot(&self, chunk: ChunkCoord) -> Option<(Field, u32)> {
        self.residency
            .page_for(chunk)
            .map(|(field, page)| (field, page.slot()))
    }

    /// Releases `chunk`'s residency and patch pages. Its registry is kept so
    /// patch ids survive a reload.
    pub fn unload_chunk(&mut self, chunk: ChunkCoord) -> bool {
        let released = self.residency.on_chunk_unloaded(chunk);
        self.apply_releases();
        released
    }

    /// Unloads `chunk` and drops its registry.
    pub fn forget_chunk(&mut self, chunk: ChunkCoord) {
        self.unload_chunk(chunk);
        self.registries.remove(&chunk);
    }

    /// Pins `chunk`'s residency page.
    pub fn pin_chunk(&mut self, chunk: ChunkCoord) {
        self.residency.pin_chunk(chunk);
    }

    /// Drops one pin of `chunk`'s residency page.
    pub fn unpin_chunk(&mut self, chunk: ChunkCoord) {
        self.residency.unpin_chunk(chunk);
    }

    /// Removes and returns every chunk page released since the last call.
    pub fn take_released_pages(&mut self) -> Vec<PageReleased> {
        std::mem::take(&mut self.released)
    }

    fn apply_releases(&mut self) {
        for event in self.residency.drain_events() {
            let i = event.field.index();
            self.processors[i].release_chunk_slot(event.physical_page_id.slot(), &mut self.writers[i]);
            self.released.push(event);
        }
    }

    // -----------------------------------------------------------------------
    // Patches
    // -----------------------------------------------------------------------

    /// Starts a remesh generation for `chunk` and returns it. Patches not
    /// referenced for longer than the configured reap age are unbound, and
    /// their pages released, first.
    pub fn begin_remesh(&mut self, chunk: ChunkCoord) -> u64 {
        let registry = self.registries.entry(chunk).or_default();
        let generation = registry.begin_generation();
        let max_age = u64::from(self.config.patch_reap_age_generations);
        if max_age == 0 {
            return generation;
        }
        let reaped = registry.reap_stale(max_age);
        if let Some((field, page)) = self.residency.page_for(chunk) {
            let i = field.index();
            for (id, _) in &reaped {
                let key = VirtualPageKey::new(page.slot(), id.get());
                self.processors[i].release_virtual_page(key, &mut self.writers[i]);
            }
        }
        generation
    }

    /// Binds `key` in `chunk`'s registry and returns its id and virtual page.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Full`] when the chunk has no id left.
    pub fn register_patch(
        &mut self,
        chunk: ChunkCoord,
        key: PatchKey,
    ) -> Result<(PatchId, VirtualPageCoord), RegistryError> {
        let registry = self.registries.entry(chunk).or_default();
        let id = registry.get_or_create(key)?;
        let page = self
            .virtual_space
            .try_allocate(id)
            .ok_or(RegistryError::Full {
                capacity: registry.capacity(),
            })?;
        Ok((id, page))
    }

    /// Registry of `chunk`, if any patch was ever registered for it.
    pub fn registry(&self, chunk: ChunkCoord) -> Option<&PatchRegistry> {
        self.registries.get(&chunk)
    }

    /// GPU metadata for a patch of a resident chunk.
    pub fn patch_metadata(
        &self,
        chunk: ChunkCoord,
        patch_id: PatchId,
        geometry: &PatchGeometry,
    ) -> Option<PatchMetadata> {
        let (_, slot) = self.chunk_slot(chunk)?;
        let page = self.virtual_space.try_allocate(patch_id)?;
        Some(PatchMetadata::new(geometry, patch_id, page, slot))
    }

    /// Pins the page of a resident patch.
    pub fn pin_patch(&mut self, chunk: ChunkCoord, patch_id: PatchId) {
        if let Some((field, slot)) = self.chunk_slot(chunk) {
            self.processors[field.index()].pin(VirtualPageKey::new(slot, patch_id.get()));
        }
    }

    /// Drops one pin of a resident patch's page.
    pub fn unpin_patch(&mut self, chunk: ChunkCoord, patch_id: PatchId) {
        if let Some((field, slot)) = self.chunk_slot(chunk) {
            self.processors[field.index()].unpin(VirtualPageKey::new(slot, patch_id.get()));
        }
    }

    // -----------------------------------------------------------------------
    // Frame loop
    // -----------------------------------------------------------------------

    /// Runs one feedback step for `field` with the configured budgets,
    /// including the round-robin relight refresh.
    pub fn process_feedback(
        &mut self,
        field: Field,
        requests: &[PageRequest],
        work: &mut WorkQueues,
    ) -> ProcessOutcome {
        let budget = self.budget();
        let i = field.index();
        let state = &mut self.recapture[i];
        state.pages.clear();
        state.pages.extend(self.processors[i].resident_pages());
        self.processors[i].process(
            FeedbackInput {
                requests,
                budget,
                recapture: Some(RecaptureInput {
                    pages: &state.pages,
                    cursor: &mut state.cursor,
                }),
            },
            &mut self.writers[i],
            work,
        )
    }

    /// Applies finished capture work of `field`.
    pub fn complete_capture(&mut self, field: Field, done: &[CaptureWork]) -> usize {
        let i = field.index();
        self.processors[i].complete_capture(done, &mut self.writers[i])
    }

    /// Applies finished relight work of `field`.
    pub fn complete_relight(&mut self, field: Field, done: &[RelightWork]) -> usize {
        let i = field.index();
        self.processors[i].complete_relight(done, &mut self.writers[i])
    }

    /// Removes and returns the page-table writes staged for `field`.
    pub fn take_page_table_writes(&mut self, field: Field) -> Vec<PageTableWrite> {
        self.writers[field.index()].take()
    }

    /// Packed occupancy word of a chunk slot of `field`.
    pub fn occupancy(&self, field: Field, chunk_slot: u32) -> Option<u32> {
        self.processors[field.index()].occupancy(chunk_slot)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
