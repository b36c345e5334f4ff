//! Patch registry: binds semantic [`PatchKey`]s to stable [`PatchId`]s.
//!
//! Ids are handed out lazily, on first reference, and stay bound to their key
//! across any number of remesh generations. A key that disappears for a few
//! generations gets its old id back when it returns. The only way an id is
//! ever detached from its key is an explicit [`PatchRegistry::reap_stale`];
//! the caller must release the reaped patches' pages before binding new keys.

use rustc_hash::FxHashMap;

use crate::error::RegistryError;
use crate::patch::{PatchId, PatchKey};
use crate::virtual_space::VIRTUAL_PAGES_PER_CHUNK;

/// Per-id bookkeeping.
#[derive(Clone, Copy, Debug)]
struct Binding {
    key: PatchKey,
    /// Generation in which the key was last referenced.
    last_seen: u64,
}

/// Maps patch keys of one chunk to dense ids in `0..capacity`.
#[derive(Debug)]
pub struct PatchRegistry {
    ids: FxHashMap<PatchKey, PatchId>,
    /// Dense array where `index == PatchId`; `None` for reaped ids.
    bindings: Vec<Option<Binding>>,
    /// Reaped ids available for reuse (LIFO).
    free: Vec<PatchId>,
    generation: u64,
    capacity: u32,
}

impl PatchRegistry {
    /// Creates a registry covering the full per-chunk virtual grid.
    pub fn new() -> Self {
        Self::with_capacity(VIRTUAL_PAGES_PER_CHUNK)
    }

    /// Creates a registry with a smaller id range. Clamped to the virtual grid.
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            ids: FxHashMap::default(),
            bindings: Vec::new(),
            free: Vec::new(),
            generation: 0,
            capacity: capacity.min(VIRTUAL_PAGES_PER_CHUNK),
        }
    }

    /// Marks the start of a remesh pass. Ids referenced from here on are "active".
    pub fn begin_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Current generation counter (0 before the first `begin_generation`).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the id bound to `key`, binding the next free id on first sight.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Full`] when every id in range is bound.
    pub fn get_or_create(&mut self, key: PatchKey) -> Result<PatchId, RegistryError> {
        if let Some(&id) = self.ids.get(&key) {
            if let Some(binding) = self.bindings[id.index()].as_mut() {
                binding.last_seen = self.generation;
            }
            return Ok(id);
        }

        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let next = self.bindings.len() as u32;
                if next >= self.capacity {
                    return Err(RegistryError::Full {
                        capacity: self.capacity,
                    });
                }
                self.bindings.push(None);
                PatchId::new(next).ok_or(RegistryError::Full {
                    capacity: self.capacity,
                })?
            }
        };

        self.bindings[id.index()] = Some(Binding {
            key,
            last_seen: self.generation,
        });
        self.ids.insert(key, id);
        Ok(id)
    }

    /// Looks up an id without binding or marking it active.
    pub fn get(&self, key: &PatchKey) -> Option<PatchId> {
        self.ids.get(key).copied()
    }

    /// Returns the key bound to `id`.
    pub fn key_of(&self, id: PatchId) -> Option<PatchKey> {
        self.bindings.get(id.index()).copied().flatten().map(|b| b.key)
    }

    /// Returns `true` if `id` was referenced in the current generation.
    pub fn is_active(&self, id: PatchId) -> bool {
        matches!(
            self.bindings.get(id.index()),
            Some(Some(b)) if b.last_seen == self.generation
        )
    }

    /// Iterates over ids referenced in the current generation.
    pub fn active_ids(&self) -> impl Iterator<Item = PatchId> + '_ {
        let generation = self.generation;
        self.bindings
            .iter()
            .enumerate()
            .filter_map(move |(index, binding)| match binding {
                Some(b) if b.last_seen == generation => PatchId::new(index as u32),
                _ => None,
            })
    }

    /// Unbinds every id whose key went unreferenced for more than `max_age`
    /// generations, returning the reaped pairs. Reaped ids are reused by
    /// later `get_or_create` calls.
    pub fn reap_stale(&mut self, max_age: u64) -> Vec<(PatchId, PatchKey)> {
        let mut reaped = Vec::new();
        for (index, slot) in self.bindings.iter_mut().enumerate() {
            let Some(binding) = *slot else {
                continue;
            };
            if self.generation.saturating_sub(binding.last_seen) <= max_age {
                continue;
            }
            let Some(id) = PatchId::new(index as u32) else {
                continue;
            };
            *slot = None;
            self.ids.remove(&binding.key);
            self.free.push(id);
            reaped.push((id, binding.key));
        }
        if !reaped.is_empty() {
            tracing::debug!(
                count = reaped.len(),
                generation = self.generation,
                "reaped stale patch ids"
            );
        }
        reaped
    }

    /// Number of bound ids.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` if no id is bound.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Maximum number of simultaneously bound ids.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl Default for PatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
