//! One physical pool per field, together with its plan and atlas textures.

use crate::planner::PhysicalPoolPlan;
use crate::pool::PhysicalPagePool;

/// Independently budgeted paging domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    /// High texel density, small radius around the camera.
    Near,
    /// Low texel density, the ring beyond the near field.
    Far,
}

impl Field {
    /// Both fields, near first.
    pub const ALL: [Field; 2] = [Field::Near, Field::Far];

    /// Dense index for per-field arrays.
    pub fn index(self) -> usize {
        match self {
            Field::Near => 0,
            Field::Far => 1,
        }
    }

    /// Code stored in occupancy words (0 is reserved for "no field").
    pub fn occupancy_code(self) -> u32 {
        self.index() as u32 + 1
    }

    /// The other field.
    pub fn other(self) -> Field {
        match self {
            Field::Near => Field::Far,
            Field::Far => Field::Near,
        }
    }
}

/// Creates and destroys the atlas textures backing a field's pool.
///
/// Implemented by the renderer; the cache never touches GPU objects itself.
pub trait AtlasBackend {
    /// Allocates `plan.atlas_count` atlases of `plan.atlas_size` texels for `field`.
    fn create_atlases(&mut self, field: Field, plan: &PhysicalPoolPlan);
    /// Releases every atlas previously created for `field`.
    fn destroy_atlases(&mut self, field: Field);
}

/// A field's page pool plus the lifecycle of its GPU resources.
#[derive(Debug)]
pub struct PhysicalFieldPool {
    field: Field,
    plan: PhysicalPoolPlan,
    pool: PhysicalPagePool,
    resources_created: bool,
}

impl PhysicalFieldPool {
    /// Creates the pool for `field`. Atlases are created lazily by
    /// [`ensure_resources`](Self::ensure_resources).
    pub fn new(field: Field, plan: PhysicalPoolPlan) -> Self {
        tracing::info!(
            ?field,
            tile_size = plan.tile_size,
            atlases = plan.atlas_count,
            capacity = plan.capacity_pages,
            "physical field pool planned"
        );
        Self {
            field,
            plan,
            pool: PhysicalPagePool::from_plan(&plan),
            resources_created: false,
        }
    }

    /// Field this pool serves.
    pub fn field(&self) -> Field {
        self.field
    }

    /// Current plan.
    pub fn plan(&self) -> &PhysicalPoolPlan {
        &self.plan
    }

    /// Shared access to the page pool.
    pub fn pool(&self) -> &PhysicalPagePool {
        &self.pool
    }

    /// Mutable access to the page pool.
    pub fn pool_mut(&mut self) -> &mut PhysicalPagePool {
        &mut self.pool
    }

    /// Returns `true` once the atlases exist.
    pub fn has_resources(&self) -> bool {
        self.resources_created
    }

    /// Creates the atlases if they do not exist yet. Returns `true` if created now.
    pub fn ensure_resources(&mut self, backend: &mut dyn AtlasBackend) -> bool {
        if self.resources_created {
            return false;
        }
        backend.create_atlases(self.field, &self.plan);
        self.resources_created = true;
        tracing::info!(field = ?self.field, atlases = self.plan.atlas_count, "atlases created");
        true
    }

    /// Swaps in a new plan. When it differs from the current one, every page is
    /// released and the atlases are rebuilt (if they existed). Returns `true`
    /// if the pool was rebuilt, which invalidates every outstanding page id.
    pub fn reconfigure(&mut self, plan: PhysicalPoolPlan, backend: &mut dyn AtlasBackend) -> bool {
        if plan == self.plan {
            return false;
        }
        let had_resources = self.release_resources(backend);
        self.plan = plan;
        self.pool = PhysicalPagePool::from_plan(&plan);
        if had_resources {
            self.ensure_resources(backend);
        }
        tracing::info!(
            field = ?self.field,
            capacity = plan.capacity_pages,
            "physical field pool rebuilt"
        );
        true
    }

    /// Destroys the atlases if they exist. Returns `true` if they did.
    pub fn release_resources(&mut self, backend: &mut dyn AtlasBackend) -> bool {
        if !self.resources_created {
            return false;
        }
        backend.destroy_atlases(self.field);
        self.resources_created = false;
        true
    }
}
