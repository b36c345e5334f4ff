//! Fixed-capacity physical page allocator with LRU ordering and pinning.
//!
//! All bookkeeping lives in parallel arrays indexed by slot (`id - 1`): a
//! LIFO free stack, a doubly-linked recency list threaded through
//! `prev`/`next`, and a pin count per slot. Nothing is heap-allocated after
//! construction.

use std::num::NonZeroU32;

use crate::planner::PhysicalPoolPlan;

/// List terminator for the recency links.
const NIL: u32 = u32::MAX;

/// 1-based id of a physical page. Id 0 is reserved for "no page".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalPageId(NonZeroU32);

impl PhysicalPageId {
    /// Wraps a raw id; `None` for 0.
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Raw 1-based value, as stored in page-table entries.
    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Zero-based slot index.
    pub fn slot(self) -> u32 {
        self.0.get() - 1
    }

    fn from_slot(slot: u32) -> Self {
        // `slot < capacity <= u32::MAX - 1`, so `slot + 1` is never zero.
        Self(NonZeroU32::MIN.saturating_add(slot))
    }
}

/// Where a physical page lives inside the atlas set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalPageLocation {
    /// Atlas texture index.
    pub atlas: u32,
    /// Tile column inside the atlas.
    pub tile_x: u32,
    /// Tile row inside the atlas.
    pub tile_y: u32,
}

/// Layout constants needed to decode page ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageLayout {
    /// Managed pages.
    pub capacity: u32,
    /// Tiles along one atlas axis.
    pub tiles_per_axis: u32,
}

impl PageLayout {
    /// Layout of a planned pool.
    pub fn from_plan(plan: &PhysicalPoolPlan) -> Self {
        Self {
            capacity: plan.capacity_pages,
            tiles_per_axis: plan.tiles_per_axis,
        }
    }

    /// Tiles in one atlas.
    pub fn tiles_per_atlas(&self) -> u32 {
        self.tiles_per_axis.saturating_mul(self.tiles_per_axis)
    }

    /// Decodes an id into atlas/tile coordinates. `None` if outside capacity.
    pub fn locate(&self, id: PhysicalPageId) -> Option<PhysicalPageLocation> {
        let slot = id.slot();
        if slot >= self.capacity || self.tiles_per_axis == 0 {
            return None;
        }
        let per_atlas = self.tiles_per_atlas();
        let within = slot % per_atlas;
        Some(PhysicalPageLocation {
            atlas: slot / per_atlas,
            tile_x: within % self.tiles_per_axis,
            tile_y: within / self.tiles_per_axis,
        })
    }

    /// Inverse of [`locate`](Self::locate).
    pub fn id_at(&self, location: PhysicalPageLocation) -> Option<PhysicalPageId> {
        if location.tile_x >= self.tiles_per_axis || location.tile_y >= self.tiles_per_axis {
            return None;
        }
        let slot = u64::from(location.atlas) * u64::from(self.tiles_per_atlas())
            + u64::from(location.tile_y) * u64::from(self.tiles_per_axis)
            + u64::from(location.tile_x);
        if slot >= u64::from(self.capacity) {
            return None;
        }
        Some(PhysicalPageId::from_slot(slot as u32))
    }
}

/// Fixed-capacity allocator over physical pages.
#[derive(Debug)]
pub struct PhysicalPagePool {
    layout: PageLayout,
    allocated: Vec<bool>,
    free: Vec<u32>,
    prev: Vec<u32>,
    next: Vec<u32>,
    pins: Vec<u32>,
    /// Most recently used slot.
    head: u32,
    /// Least recently used slot.
    tail: u32,
    allocated_count: u32,
}

impl PhysicalPagePool {
    /// Creates a pool with every page free. Ids are handed out lowest first.
    pub fn new(layout: PageLayout) -> Self {
        let capacity = layout.capacity.min(NIL - 1);
        let layout = PageLayout { capacity, ..layout };
        let n = capacity as usize;
        Self {
            layout,
            allocated: vec![false; n],
            free: (0..capacity).rev().collect(),
            prev: vec![NIL; n],
            next: vec![NIL; n],
            pins: vec![0; n],
            head: NIL,
            tail: NIL,
            allocated_count: 0,
        }
    }

    /// Creates a pool sized and laid out by `plan`.
    pub fn from_plan(plan: &PhysicalPoolPlan) -> Self {
        Self::new(PageLayout::from_plan(plan))
    }

    /// Layout used to decode ids.
    pub fn layout(&self) -> PageLayout {
        self.layout
    }

    /// Managed page count.
    pub fn capacity(&self) -> u32 {
        self.layout.capacity
    }

    /// Pages currently allocated.
    pub fn allocated_count(&self) -> u32 {
        self.allocated_count
    }

    /// Pages currently free.
    pub fn free_count(&self) -> u32 {
        self.free.len() as u32
    }

    /// Returns `true` if no page is free.
    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Returns `true` if `id` is inside capacity and allocated.
    pub fn is_allocated(&self, id: PhysicalPageId) -> bool {
        self.allocated_slot(id).is_some()
    }

    /// Pops a free page and makes it most recently used. `None` when full.
    pub fn try_allocate(&mut self) -> Option<PhysicalPageId> {
        let slot = self.free.pop()?;
        self.allocated[slot as usize] = true;
        self.pins[slot as usize] = 0;
        self.push_front(slot);
        self.allocated_count += 1;
        Some(PhysicalPageId::from_slot(slot))
    }

    /// Marks an allocated page most recently used. No-op for stale ids.
    pub fn touch(&mut self, id: PhysicalPageId) {
        let Some(slot) = self.allocated_slot(id) else {
            return;
        };
        if self.head == slot {
            return;
        }
        self.unlink(slot);
        self.push_front(slot);
    }

    /// Increments the pin count. No-op for stale ids.
    pub fn pin(&mut self, id: PhysicalPageId) {
        if let Some(slot) = self.allocated_slot(id) {
            let pins = &mut self.pins[slot as usize];
            *pins = pins.saturating_add(1);
        }
    }

    /// Decrements the pin count, saturating at zero. No-op for stale ids.
    pub fn unpin(&mut self, id: PhysicalPageId) {
        if let Some(slot) = self.allocated_slot(id) {
            let pins = &mut self.pins[slot as usize];
            *pins = pins.saturating_sub(1);
        }
    }

    /// Current pin count (0 for stale ids).
    pub fn pin_count(&self, id: PhysicalPageId) -> u32 {
        self.allocated_slot(id)
            .map_or(0, |slot| self.pins[slot as usize])
    }

    /// Returns an allocated page to the free stack, regardless of pins.
    /// Returns `false` for stale ids.
    pub fn free(&mut self, id: PhysicalPageId) -> bool {
        let Some(slot) = self.allocated_slot(id) else {
            return false;
        };
        self.unlink(slot);
        self.allocated[slot as usize] = false;
        self.pins[slot as usize] = 0;
        self.free.push(slot);
        self.allocated_count -= 1;
        true
    }

    /// Least recently used unpinned page, or `None` if every allocated page is pinned.
    pub fn try_get_eviction_candidate(&self) -> Option<PhysicalPageId> {
        let mut slot = self.tail;
        while slot != NIL {
            if self.pins[slot as usize] == 0 {
                return Some(PhysicalPageId::from_slot(slot));
            }
            slot = self.prev[slot as usize];
        }
        None
    }

    /// Iterates allocated pages from least to most recently used.
    pub fn iter_lru(&self) -> impl Iterator<Item = PhysicalPageId> + '_ {
        let mut slot = self.tail;
        std::iter::from_fn(move || {
            if slot == NIL {
                return None;
            }
            let id = PhysicalPageId::from_slot(slot);
            slot = self.prev[slot as usize];
            Some(id)
        })
    }

    fn allocated_slot(&self, id: PhysicalPageId) -> Option<u32> {
        let slot = id.slot();
        (slot < self.layout.capacity && self.allocated[slot as usize]).then_some(slot)
    }

    fn push_front(&mut self, slot: u32) {
        self.prev[slot as usize] = NIL;
        self.next[slot as usize] = self.head;
        if self.head != NIL {
            self.prev[self.head as usize] = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }

    fn unlink(&mut self, slot: u32) {
        let prev = self.prev[slot as usize];
        let next = self.next[slot as usize];
        if prev == NIL {
            self.head = next;
        } else {
            self.next[prev as usize] = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.prev[next as usize] = prev;
        }
        self.prev[slot as usize] = NIL;
        self.next[slot as usize] = NIL;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
