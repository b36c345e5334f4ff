//! Chunk-count budgets for square and annulus regions around the camera.
//!
//! A square budget of radius `R` covers the `(2R+1)²` column of chunks around
//! the camera chunk plus an edge margin of `2·(2R+1)` chunks, enough to absorb
//! a one-chunk camera move along either axis before eviction kicks in.

/// Page budget for one field's region, in chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldChunkBudget {
    /// Coverage radius the budget was derived from (outer radius for annuli).
    pub radius_chunks: u32,
    /// Chunks covered by the region itself.
    pub covered_chunks: u32,
    /// Extra chunks reserved along the region's edge.
    pub edge_margin_chunks: u32,
}

impl FieldChunkBudget {
    /// Side length of a square region of the given radius.
    pub fn side(radius_chunks: u32) -> u32 {
        radius_chunks.saturating_mul(2).saturating_add(1)
    }

    /// Budget of the full square of `radius_chunks` around the camera.
    pub fn square(radius_chunks: u32) -> Self {
        let side = Self::side(radius_chunks);
        Self {
            radius_chunks,
            covered_chunks: side.saturating_mul(side),
            edge_margin_chunks: side.saturating_mul(2),
        }
    }

    /// Budget of the ring between `near_radius` and `far_radius`.
    ///
    /// The margin is the far square's margin: the ring's outer edge is the one
    /// that moves across the chunk boundary. A far radius not larger than the
    /// near radius yields an empty ring plus margin.
    pub fn annulus(near_radius: u32, far_radius: u32) -> Self {
        let far = Self::square(far_radius);
        let near = Self::square(near_radius);
        Self {
            radius_chunks: far_radius,
            covered_chunks: far.covered_chunks.saturating_sub(near.covered_chunks),
            edge_margin_chunks: far.edge_margin_chunks,
        }
    }

    /// Covered chunks plus the edge margin.
    pub fn total_chunks(&self) -> u32 {
        self.covered_chunks.saturating_add(self.edge_margin_chunks)
    }

    /// Pages needed when every budgeted chunk holds `pages_per_chunk` pages.
    pub fn total_pages(&self, pages_per_chunk: u32) -> u32 {
        self.total_chunks().saturating_mul(pages_per_chunk)
    }
}
