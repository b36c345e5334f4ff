//! Per-chunk virtual page grid.
//!
//! Every chunk owns a fixed `W × W` grid of virtual pages. A patch's page is a
//! pure function of its [`PatchId`], so the virtual address never has to be
//! stored or synchronized.

use crate::patch::PatchId;

/// Width (and height) of the per-chunk virtual page grid.
pub const VIRTUAL_PAGES_PER_AXIS: u32 = 128;
/// Virtual pages per chunk (`VIRTUAL_PAGES_PER_AXIS²`).
pub const VIRTUAL_PAGES_PER_CHUNK: u32 = VIRTUAL_PAGES_PER_AXIS * VIRTUAL_PAGES_PER_AXIS;

/// Position of a virtual page inside its chunk's grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VirtualPageCoord {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
}

/// Globally unique virtual page address within one field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualPageKey {
    /// Chunk slot the page belongs to.
    pub chunk_slot: u32,
    /// Row-major index inside the chunk's grid.
    pub page_index: u32,
}

impl VirtualPageKey {
    /// Creates a key.
    pub fn new(chunk_slot: u32, page_index: u32) -> Self {
        Self {
            chunk_slot,
            page_index,
        }
    }
}

/// Maps patch ids onto a fixed-width virtual grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtualSpaceAllocator {
    width: u32,
}

impl VirtualSpaceAllocator {
    /// Creates an allocator for a `width × width` grid. `width` must be non-zero.
    pub fn new(width: u32) -> Self {
        debug_assert!(width > 0, "virtual grid width must be non-zero");
        Self { width: width.max(1) }
    }

    /// Grid width.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Number of addressable pages (`width²`).
    pub fn capacity(&self) -> u32 {
        self.width.saturating_mul(self.width)
    }

    /// Returns the page for `patch_id`, or `None` if the id is outside the grid.
    pub fn try_allocate(&self, patch_id: PatchId) -> Option<VirtualPageCoord> {
        self.coord_of_index(patch_id.get())
    }

    /// Decodes a row-major page index, rejecting indices outside the grid.
    pub fn coord_of_index(&self, index: u32) -> Option<VirtualPageCoord> {
        if index >= self.capacity() {
            return None;
        }
        Some(VirtualPageCoord {
            x: index % self.width,
            y: index / self.width,
        })
    }

    /// Row-major index of a coordinate, or `None` if it lies outside the grid.
    pub fn index_of(&self, coord: VirtualPageCoord) -> Option<u32> {
        if coord.x >= self.width || coord.y >= self.width {
            return None;
        }
        Some(coord.y * self.width + coord.x)
    }

    /// Returns `true` if `index` addresses a page of this grid.
    pub fn contains_index(&self, index: u32) -> bool {
        index < self.capacity()
    }
}

impl Default for VirtualSpaceAllocator {
    fn default() -> Self {
        Self::new(VIRTUAL_PAGES_PER_AXIS)
    }
}
