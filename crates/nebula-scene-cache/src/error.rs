//! Error types for pool planning and patch registration.

use thiserror::Error;

/// Structurally invalid pool configuration. Raised at plan construction, never at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// Texel density of zero yields a zero-sized tile.
    #[error("texels per voxel edge must be non-zero")]
    ZeroTexelDensity,

    /// The tile size does not tile the atlas exactly.
    #[error("tile size {tile_size} does not evenly divide atlas size {atlas_size}")]
    TileSizeNotDivisor {
        /// Tile edge in texels.
        tile_size: u32,
        /// Atlas edge in texels.
        atlas_size: u32,
    },

    /// A pool must hold at least one page.
    #[error("requested page count must be non-zero")]
    ZeroRequestedPages,

    /// A pool must be allowed at least one atlas.
    #[error("maximum atlas count must be non-zero")]
    ZeroAtlasBudget,

    /// More pages than a page-table entry can address.
    #[error("pool capacity {capacity} exceeds the addressable page id range (max {max})")]
    CapacityExceedsPageIdRange {
        /// Planned capacity.
        capacity: u64,
        /// Largest encodable physical page id.
        max: u32,
    },
}

/// Errors raised by [`PatchRegistry`](crate::PatchRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Every id of the registry is bound.
    #[error("patch registry is full (max {capacity} patches)")]
    Full {
        /// Maximum number of ids.
        capacity: u32,
    },
}
