//! Sparse paged GPU scene cache: virtual patch pages, physical atlas pools,
//! page-table packing and the feedback-driven allocation loop for the near and
//! far lighting fields.

mod cache;
mod error;
pub mod feedback;
mod field_pool;
pub mod gpu_types;
pub mod packing;
mod page_table;
mod patch;
pub mod planner;
pub mod pool;
mod registry;
pub mod residency;
pub mod sizing;
pub mod virtual_space;

pub use cache::{FieldLayout, VirtualSceneCache};
pub use error::{PlanError, RegistryError};
pub use feedback::{
    FeedbackBudget, FeedbackInput, FeedbackRequestProcessor, FeedbackStats, ProcessOutcome,
    RecaptureInput, WorkQueues,
};
pub use field_pool::{AtlasBackend, Field, PhysicalFieldPool};
pub use gpu_types::{
    CaptureWork, PATCH_FLAG_MESH_CARD, PageRequest, PatchGeometry, PatchMetadata, RelightWork,
};
pub use packing::{BitField, ChunkOccupancy, EntryFlags, PageTableEntry, is_ready_for_sampling};
pub use page_table::{PageTableMirror, PageTableWrite, PageTableWriter, StagedPageTableWriter};
pub use patch::{FaceDirection, PatchId, PatchKey};
pub use planner::{PhysicalPoolPlan, PoolPlanRequest, plan_physical_pool};
pub use pool::{PageLayout, PhysicalPageId, PhysicalPageLocation, PhysicalPagePool};
pub use registry::PatchRegistry;
pub use residency::{ChunkCoord, ChunkResidencyManager, PageReleased, ReleaseReason, ResidencyStats};
pub use sizing::FieldChunkBudget;
pub use virtual_space::{VirtualPageCoord, VirtualPageKey, VirtualSpaceAllocator};
