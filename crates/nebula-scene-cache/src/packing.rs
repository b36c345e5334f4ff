//! Bit-packed 32-bit words shared with the shaders: page-table entries and
//! per-chunk occupancy words.
//!
//! Every field is described by a [`BitField`] so the layout lives in one place.
//! Field ranges never overlap; the unit tests below check that directly.

// ---------------------------------------------------------------------------
// BitField
// ---------------------------------------------------------------------------

/// A contiguous run of `width` bits starting at bit `shift` of a `u32` word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitField {
    /// Index of the lowest bit.
    pub shift: u32,
    /// Number of bits (1..=32).
    pub width: u32,
}

impl BitField {
    /// Creates a field descriptor. Evaluated at compile time for the layouts below.
    pub const fn new(shift: u32, width: u32) -> Self {
        assert!(width > 0 && shift + width <= 32, "bit field exceeds 32 bits");
        Self { shift, width }
    }

    /// Largest value the field can hold.
    pub const fn max_value(self) -> u32 {
        if self.width == 32 {
            u32::MAX
        } else {
            (1u32 << self.width) - 1
        }
    }

    /// Mask of the field's bits in word position.
    pub const fn mask(self) -> u32 {
        self.max_value() << self.shift
    }

    /// Packs `value` into word position, or `None` if it does not fit.
    pub const fn pack(self, value: u32) -> Option<u32> {
        if value > self.max_value() {
            None
        } else {
            Some(value << self.shift)
        }
    }

    /// Packs `value`, saturating negative inputs to 0 and overflowing inputs to
    /// [`max_value`](Self::max_value).
    pub fn pack_clamped(self, value: i64) -> u32 {
        let clamped = value.clamp(0, i64::from(self.max_value())) as u32;
        clamped << self.shift
    }

    /// Extracts the field from a packed word.
    pub const fn unpack(self, word: u32) -> u32 {
        (word >> self.shift) & self.max_value()
    }

    /// Returns `true` if the two fields share any bit.
    pub const fn overlaps(self, other: BitField) -> bool {
        self.mask() & other.mask() != 0
    }
}

// ---------------------------------------------------------------------------
// Page-table entry
// ---------------------------------------------------------------------------

/// Physical page id, 1-based, 0 = no page.
pub const ENTRY_PHYSICAL_ID: BitField = BitField::new(0, 26);
/// Set once the virtual page has a physical page bound.
pub const ENTRY_RESIDENT: BitField = BitField::new(26, 1);
/// The bound page has not been captured yet.
pub const ENTRY_NEEDS_CAPTURE: BitField = BitField::new(27, 1);
/// The bound page has not been relit since capture.
pub const ENTRY_NEEDS_RELIGHT: BitField = BitField::new(28, 1);

/// Highest physical page id representable in a page-table entry.
pub const MAX_ENTRY_PHYSICAL_ID: u32 = ENTRY_PHYSICAL_ID.max_value();

/// Flag bits of a [`PageTableEntry`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct EntryFlags {
    /// A physical page is bound.
    pub resident: bool,
    /// Capture work is outstanding.
    pub needs_capture: bool,
    /// Relight work is outstanding.
    pub needs_relight: bool,
}

impl EntryFlags {
    /// Flags written when a page is freshly allocated.
    pub const FRESH: Self = Self {
        resident: true,
        needs_capture: true,
        needs_relight: true,
    };

    /// Flags of a fully populated page.
    pub const READY: Self = Self {
        resident: true,
        needs_capture: false,
        needs_relight: false,
    };

    fn bits(self) -> u32 {
        ENTRY_RESIDENT.pack_clamped(i64::from(self.resident))
            | ENTRY_NEEDS_CAPTURE.pack_clamped(i64::from(self.needs_capture))
            | ENTRY_NEEDS_RELIGHT.pack_clamped(i64::from(self.needs_relight))
    }
}

/// One packed 32-bit page-table word, exactly as the shaders read it.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PageTableEntry(pub u32);

static_assertions::assert_eq_size!(PageTableEntry, u32);

impl PageTableEntry {
    /// The zeroed entry: no page, no flags.
    pub const EMPTY: Self = Self(0);

    /// Packs an entry. Returns `None` if `physical_id` exceeds the id field.
    pub fn pack(physical_id: u32, flags: EntryFlags) -> Option<Self> {
        Some(Self(ENTRY_PHYSICAL_ID.pack(physical_id)? | flags.bits()))
    }

    /// Packs an entry, saturating `physical_id` into the id field.
    pub fn pack_clamped(physical_id: i64, flags: EntryFlags) -> Self {
        Self(ENTRY_PHYSICAL_ID.pack_clamped(physical_id) | flags.bits())
    }

    /// Physical page id (0 = none).
    pub fn physical_id(self) -> u32 {
        ENTRY_PHYSICAL_ID.unpack(self.0)
    }

    /// Unpacked flag bits.
    pub fn flags(self) -> EntryFlags {
        EntryFlags {
            resident: ENTRY_RESIDENT.unpack(self.0) != 0,
            needs_capture: ENTRY_NEEDS_CAPTURE.unpack(self.0) != 0,
            needs_relight: ENTRY_NEEDS_RELIGHT.unpack(self.0) != 0,
        }
    }

    /// Returns a copy with the flags replaced and the id kept.
    pub fn with_flags(self, flags: EntryFlags) -> Self {
        let id_bits = self.0 & ENTRY_PHYSICAL_ID.mask();
        Self(id_bits | flags.bits())
    }

    /// Returns the raw word.
    pub fn bits(self) -> u32 {
        self.0
    }
}

/// A page may be sampled only once it is resident and all population work is done.
pub fn is_ready_for_sampling(entry: PageTableEntry) -> bool {
    let flags = entry.flags();
    flags.resident && !flags.needs_capture && !flags.needs_relight && entry.physical_id() != 0
}

// ---------------------------------------------------------------------------
// Occupancy word
// ---------------------------------------------------------------------------

/// Number of resident (bound) virtual pages in the chunk.
pub const OCCUPANCY_RESIDENT: BitField = BitField::new(0, 15);
/// Number of bound pages still waiting for capture or relight.
pub const OCCUPANCY_PENDING: BitField = BitField::new(15, 15);
/// Field code: 0 none, 1 near, 2 far.
pub const OCCUPANCY_FIELD: BitField = BitField::new(30, 2);

/// Unpacked per-chunk occupancy summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkOccupancy {
    /// Resident page count.
    pub resident_pages: u32,
    /// Pending (not yet sample-ready) page count.
    pub pending_pages: u32,
    /// Field code (0 none, 1 near, 2 far).
    pub field_code: u32,
}

impl ChunkOccupancy {
    /// Packs into a word, or `None` if any field is out of range.
    pub fn pack(self) -> Option<u32> {
        Some(
            OCCUPANCY_RESIDENT.pack(self.resident_pages)?
                | OCCUPANCY_PENDING.pack(self.pending_pages)?
                | OCCUPANCY_FIELD.pack(self.field_code)?,
        )
    }

    /// Unpacks a word.
    pub fn unpack(word: u32) -> Self {
        Self {
            resident_pages: OCCUPANCY_RESIDENT.unpack(word),
            pending_pages: OCCUPANCY_PENDING.unpack(word),
            field_code: OCCUPANCY_FIELD.unpack(word),
        }
    }
}

/// Packs an occupancy word from unchecked counts, saturating each field.
pub fn pack_occupancy_clamped(resident_pages: i64, pending_pages: i64, field_code: i64) -> u32 {
    OCCUPANCY_RESIDENT.pack_clamped(resident_pages)
        | OCCUPANCY_PENDING.pack_clamped(pending_pages)
        | OCCUPANCY_FIELD.pack_clamped(field_code)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ENTRY_FIELDS: [BitField; 4] = [
        ENTRY_PHYSICAL_ID,
        ENTRY_RESIDENT,
        ENTRY_NEEDS_CAPTURE,
        ENTRY_NEEDS_RELIGHT,
    ];
    const OCCUPANCY_FIELDS: [BitField; 3] = [OCCUPANCY_RESIDENT, OCCUPANCY_PENDING, OCCUPANCY_FIELD];

    fn assert_disjoint(fields: &[BitField]) {
        for (i, a) in fields.iter().enumerate() {
            for b in &fields[i + 1..] {
                assert!(!a.overlaps(*b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn test_fields_do_not_overlap() {
        assert_disjoint(&ENTRY_FIELDS);
        assert_disjoint(&OCCUPANCY_FIELDS);
    }

    #[test]
    fn test_all_ones_do_not_leak_across_fields() {
        let mut expected = 0u32;
        let mut packed = 0u32;
        for field in OCCUPANCY_FIELDS {
            expected += field.max_value() << field.shift;
            packed |= field.pack(field.max_value()).unwrap();
        }
        assert_eq!(packed, expected);
        assert_eq!(
            ChunkOccupancy {
                resident_pages: OCCUPANCY_RESIDENT.max_value(),
                pending_pages: OCCUPANCY_PENDING.max_value(),
                field_code: OCCUPANCY_FIELD.max_value(),
            }
            .pack(),
            Some(expected)
        );

        let entry = PageTableEntry::pack(MAX_ENTRY_PHYSICAL_ID, EntryFlags::FRESH).unwrap();
        let expected_entry: u32 = ENTRY_FIELDS
            .iter()
            .map(|f| f.max_value() << f.shift)
            .sum();
        assert_eq!(entry.bits(), expected_entry);
    }

    #[test]
    fn test_entry_roundtrip() {
        let flag_sets = [
            EntryFlags::default(),
            EntryFlags::FRESH,
            EntryFlags::READY,
            EntryFlags {
                resident: true,
                needs_capture: false,
                needs_relight: true,
            },
        ];
        for id in [0, 1, 2, 4095, 65_536, MAX_ENTRY_PHYSICAL_ID] {
            for flags in flag_sets {
                let entry = PageTableEntry::pack(id, flags).unwrap();
                assert_eq!(entry.physical_id(), id);
                assert_eq!(entry.flags(), flags);
            }
        }
    }

    #[test]
    fn test_entry_pack_rejects_oversized_id() {
        assert!(PageTableEntry::pack(MAX_ENTRY_PHYSICAL_ID + 1, EntryFlags::READY).is_none());
    }

    #[test]
    fn test_clamped_entry_stays_in_range() {
        for id in [i64::MIN, -1, 0, 7, i64::from(MAX_ENTRY_PHYSICAL_ID) + 1, i64::MAX] {
            let entry = PageTableEntry::pack_clamped(id, EntryFlags::default());
            assert!(entry.physical_id() <= MAX_ENTRY_PHYSICAL_ID);
            assert_eq!(entry.flags(), EntryFlags::default());
        }
        assert_eq!(PageTableEntry::pack_clamped(-5, EntryFlags::READY).physical_id(), 0);
        assert_eq!(
            PageTableEntry::pack_clamped(i64::MAX, EntryFlags::READY).physical_id(),
            MAX_ENTRY_PHYSICAL_ID
        );
    }

    #[test]
    fn test_occupancy_roundtrip() {
        for resident in [0, 1, 300, OCCUPANCY_RESIDENT.max_value()] {
            for pending in [0, 17, OCCUPANCY_PENDING.max_value()] {
                for field_code in 0..=3 {
                    let occ = ChunkOccupancy {
                        resident_pages: resident,
                        pending_pages: pending,
                        field_code,
                    };
                    assert_eq!(ChunkOccupancy::unpack(occ.pack().unwrap()), occ);
                }
            }
        }
    }

    #[test]
    fn test_clamped_occupancy_saturates() {
        let inputs = [i64::MIN, -1, 0, 1, 40_000, i64::MAX];
        for &r in &inputs {
            for &p in &inputs {
                for &f in &inputs {
                    let occ = ChunkOccupancy::unpack(pack_occupancy_clamped(r, p, f));
                    assert!(occ.resident_pages <= OCCUPANCY_RESIDENT.max_value());
                    assert!(occ.pending_pages <= OCCUPANCY_PENDING.max_value());
                    assert!(occ.field_code <= OCCUPANCY_FIELD.max_value());
                }
            }
        }
        let occ = ChunkOccupancy::unpack(pack_occupancy_clamped(-3, 40_000, 9));
        assert_eq!(occ.resident_pages, 0);
        assert_eq!(occ.pending_pages, OCCUPANCY_PENDING.max_value());
        assert_eq!(occ.field_code, 3);
    }

    #[test]
    fn test_ready_for_sampling() {
        let ready = PageTableEntry::pack(5, EntryFlags::READY).unwrap();
        assert!(is_ready_for_sampling(ready));
        assert!(!is_ready_for_sampling(PageTableEntry::pack(5, EntryFlags::FRESH).unwrap()));
        assert!(!is_ready_for_sampling(PageTableEntry::pack(0, EntryFlags::READY).unwrap()));
        assert!(!is_ready_for_sampling(PageTableEntry::EMPTY));
        let relight_pending = ready.with_flags(EntryFlags {
            needs_relight: true,
            ..EntryFlags::READY
        });
        assert!(!is_ready_for_sampling(relight_pending));
        assert_eq!(relight_pending.physical_id(), 5);
    }
}
