//! CPU mirror of a field's page table and the writer seam towards GPU upload.

use bytemuck::{Pod, Zeroable};
use rustc_hash::FxHashMap;

use crate::packing::PageTableEntry;
use crate::virtual_space::{VIRTUAL_PAGES_PER_CHUNK, VirtualPageKey};

/// Stages page-table updates for upload. The cache never uploads directly.
pub trait PageTableWriter {
    /// Stages the mip-0 entry of one virtual page.
    fn write_mip0(&mut self, chunk_slot: u32, virtual_page_index: u32, entry: PageTableEntry);
}

/// One staged page-table update (12 bytes), ready for a scatter-upload pass.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PageTableWrite {
    /// Chunk slot of the page.
    pub chunk_slot: u32,
    /// Virtual page index inside the chunk.
    pub virtual_page_index: u32,
    /// New packed entry.
    pub entry: PageTableEntry,
}

static_assertions::assert_eq_size!(PageTableWrite, [u8; 12]);

/// [`PageTableWriter`] that collects writes in submission order.
#[derive(Debug, Default)]
pub struct StagedPageTableWriter {
    writes: Vec<PageTableWrite>,
}

impl StagedPageTableWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Staged writes, oldest first.
    pub fn writes(&self) -> &[PageTableWrite] {
        &self.writes
    }

    /// Removes and returns every staged write.
    pub fn take(&mut self) -> Vec<PageTableWrite> {
        std::mem::take(&mut self.writes)
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Returns `true` if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

impl PageTableWriter for StagedPageTableWriter {
    fn write_mip0(&mut self, chunk_slot: u32, virtual_page_index: u32, entry: PageTableEntry) {
        self.writes.push(PageTableWrite {
            chunk_slot,
            virtual_page_index,
            entry,
        });
    }
}

/// CPU copy of one field's page table.
///
/// Only non-empty entries are stored, so memory follows the number of mapped
/// pages rather than the number of chunk slots.
#[derive(Debug)]
pub struct PageTableMirror {
    chunk_slot_count: u32,
    entries: FxHashMap<VirtualPageKey, PageTableEntry>,
}

impl PageTableMirror {
    /// Creates a mirror for `chunk_slot_count` slots, all entries empty.
    pub fn new(chunk_slot_count: u32) -> Self {
        Self {
            chunk_slot_count,
            entries: FxHashMap::default(),
        }
    }

    /// Number of chunk slots covered.
    pub fn chunk_slot_count(&self) -> u32 {
        self.chunk_slot_count
    }

    /// Returns `true` if `key` addresses an entry of this table.
    pub fn contains(&self, key: VirtualPageKey) -> bool {
        key.chunk_slot < self.chunk_slot_count && key.page_index < VIRTUAL_PAGES_PER_CHUNK
    }

    /// Current entry (empty for out-of-range keys).
    pub fn get(&self, key: VirtualPageKey) -> PageTableEntry {
        self.entries.get(&key).copied().unwrap_or(PageTableEntry::EMPTY)
    }

    /// Number of non-empty entries held.
    pub fn stored_count(&self) -> usize {
        self.entries.len()
    }

    /// Stores `entry` and forwards it to `writer`.
    ///
    /// Out-of-range keys are ignored, as is zeroing an entry that is already
    /// empty.
    pub fn set(&mut self, key: VirtualPageKey, entry: PageTableEntry, writer: &mut dyn PageTableWriter) {
        if !self.contains(key) {
            return;
        }
        if entry == PageTableEntry::EMPTY {
            if self.entries.remove(&key).is_none() {
                return;
            }
        } else {
            self.entries.insert(key, entry);
        }
        writer.write_mip0(key.chunk_slot, key.page_index, entry);
    }
}
