//! Physical pool planner: turns texel density and a page budget into a
//! concrete atlas layout.

use crate::error::PlanError;
use crate::packing::MAX_ENTRY_PHYSICAL_ID;

/// Edge length of every physical atlas texture, in texels.
pub const ATLAS_SIZE_TEXELS: u32 = 4096;
/// Edge length of one patch, in voxels.
pub const PATCH_SIZE_VOXELS: u32 = 4;

/// Inputs to [`plan_physical_pool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolPlanRequest {
    /// Texels along one voxel edge.
    pub texels_per_voxel_edge: u32,
    /// Pages the field would like to hold.
    pub requested_pages: u32,
    /// Atlas edge the tile size must divide.
    pub atlas_size_texels: u32,
    /// Maximum number of atlas textures the field may allocate.
    pub max_atlas_count: u32,
}

impl PoolPlanRequest {
    /// Request against the standard [`ATLAS_SIZE_TEXELS`] atlas.
    pub fn new(texels_per_voxel_edge: u32, requested_pages: u32, max_atlas_count: u32) -> Self {
        Self {
            texels_per_voxel_edge,
            requested_pages,
            atlas_size_texels: ATLAS_SIZE_TEXELS,
            max_atlas_count,
        }
    }
}

/// Immutable sizing decision for one field's physical pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalPoolPlan {
    /// Tile edge in texels.
    pub tile_size: u32,
    /// Atlas edge in texels.
    pub atlas_size: u32,
    /// Tiles along one atlas axis.
    pub tiles_per_axis: u32,
    /// Atlas textures to allocate.
    pub atlas_count: u32,
    /// Pages the caller asked for.
    pub requested_pages: u32,
    /// Pages the pool will actually manage.
    pub capacity_pages: u32,
    /// `true` if the atlas budget cut capacity below the request.
    pub clamped: bool,
}

impl PhysicalPoolPlan {
    /// Tiles in one atlas.
    pub fn tiles_per_atlas(&self) -> u32 {
        self.tiles_per_axis * self.tiles_per_axis
    }

    /// Bytes of texel storage, given the per-texel size of the atlas format.
    pub fn texel_bytes(&self, bytes_per_texel: u64) -> u64 {
        u64::from(self.atlas_size)
            * u64::from(self.atlas_size)
            * u64::from(self.atlas_count)
            * bytes_per_texel
    }
}

/// Builds a pool plan, failing fast on structurally invalid inputs.
///
/// # Errors
///
/// Returns a [`PlanError`] if the tile size is zero or does not divide the
/// atlas, if no pages or atlases are allowed, or if the resulting capacity
/// does not fit the page-table id field.
pub fn plan_physical_pool(request: PoolPlanRequest) -> Result<PhysicalPoolPlan, PlanError> {
    if request.texels_per_voxel_edge == 0 {
        return Err(PlanError::ZeroTexelDensity);
    }
    if request.requested_pages == 0 {
        return Err(PlanError::ZeroRequestedPages);
    }
    if request.max_atlas_count == 0 {
        return Err(PlanError::ZeroAtlasBudget);
    }

    let tile_size = request
        .texels_per_voxel_edge
        .saturating_mul(PATCH_SIZE_VOXELS);
    let atlas_size = request.atlas_size_texels;
    if atlas_size == 0 || tile_size > atlas_size || !atlas_size.is_multiple_of(tile_size) {
        return Err(PlanError::TileSizeNotDivisor {
            tile_size,
            atlas_size,
        });
    }

    let tiles_per_axis = atlas_size / tile_size;
    let tiles_per_atlas = u64::from(tiles_per_axis) * u64::from(tiles_per_axis);
    let needed_atlases = u64::from(request.requested_pages).div_ceil(tiles_per_atlas);
    let clamped = needed_atlases > u64::from(request.max_atlas_count);
    let atlas_count = needed_atlases.min(u64::from(request.max_atlas_count));
    let layout_pages = atlas_count * tiles_per_atlas;
    let capacity = if clamped {
        layout_pages
    } else {
        layout_pages.min(u64::from(request.requested_pages))
    };

    if capacity > u64::from(MAX_ENTRY_PHYSICAL_ID) {
        return Err(PlanError::CapacityExceedsPageIdRange {
            capacity,
            max: MAX_ENTRY_PHYSICAL_ID,
        });
    }

    let plan = PhysicalPoolPlan {
        tile_size,
        atlas_size,
        tiles_per_axis,
        atlas_count: atlas_count as u32,
        requested_pages: request.requested_pages,
        capacity_pages: capacity as u32,
        clamped,
    };
    if plan.clamped {
        tracing::warn!(
            requested = plan.requested_pages,
            capacity = plan.capacity_pages,
            atlases = plan.atlas_count,
            "physical pool clamped by atlas budget"
        );
    }
    Ok(plan)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
