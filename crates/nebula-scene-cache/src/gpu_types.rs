//! Plain-old-data records exchanged with the GPU stages.
//!
//! All layouts are std430-compatible and checked with `static_assertions`.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::patch::PatchId;
use crate::virtual_space::VirtualPageCoord;

/// A "page V was needed" message written by the sampling shaders (16 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PageRequest {
    /// Chunk slot of the sampled chunk.
    pub chunk_slot: u32,
    /// Row-major virtual page index inside the chunk.
    pub virtual_page_index: u32,
    /// Requested mip. Only page existence is tracked, so every mip maps to mip 0.
    pub mip: u32,
    /// Reserved request flags, ignored by the processor.
    pub flags: u32,
}

static_assertions::assert_eq_size!(PageRequest, [u8; 16]);

impl PageRequest {
    /// Mip-0 request with no flags.
    pub fn new(chunk_slot: u32, virtual_page_index: u32) -> Self {
        Self {
            chunk_slot,
            virtual_page_index,
            mip: 0,
            flags: 0,
        }
    }
}

/// One page to be painted by the capture pass (16 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CaptureWork {
    /// Destination physical page (1-based).
    pub physical_page_id: u32,
    /// Owning chunk slot.
    pub chunk_slot: u32,
    /// Patch to capture.
    pub patch_id: u32,
    /// Virtual page the result belongs to.
    pub virtual_page_index: u32,
}

static_assertions::assert_eq_size!(CaptureWork, [u8; 16]);

/// One page to be relit by the relight pass (16 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RelightWork {
    /// Destination physical page (1-based).
    pub physical_page_id: u32,
    /// Owning chunk slot.
    pub chunk_slot: u32,
    /// Patch to relight.
    pub patch_id: u32,
    /// Virtual page the result belongs to.
    pub virtual_page_index: u32,
}

static_assertions::assert_eq_size!(RelightWork, [u8; 16]);

/// Flag bit in [`PatchMetadata::normal_flags`] `w`: the patch is a mesh card.
pub const PATCH_FLAG_MESH_CARD: u32 = 1 << 0;

/// World-space frame of a patch, as known after meshing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PatchGeometry {
    /// Corner of the patch.
    pub origin: Vec3,
    /// Full-length U edge.
    pub u_axis: Vec3,
    /// Full-length V edge.
    pub v_axis: Vec3,
    /// Outward unit normal.
    pub normal: Vec3,
    /// `PATCH_FLAG_*` bits.
    pub flags: u32,
}

/// Per-patch record read by the capture shaders (96 bytes, 16-byte stride).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PatchMetadata {
    /// xyz = origin, w = 1.
    pub origin: [f32; 4],
    /// xyz = U edge, w = 0.
    pub u_axis: [f32; 4],
    /// xyz = V edge, w = 0.
    pub v_axis: [f32; 4],
    /// xyz = normal, w = flag bits reinterpreted as `f32`.
    pub normal_flags: [f32; 4],
    /// First virtual page column covered by the patch.
    pub virtual_base_page_x: u32,
    /// First virtual page row covered by the patch.
    pub virtual_base_page_y: u32,
    /// Virtual pages covered along U.
    pub virtual_size_pages_x: u32,
    /// Virtual pages covered along V.
    pub virtual_size_pages_y: u32,
    /// Owning chunk slot.
    pub chunk_slot: u32,
    /// Patch id within the chunk.
    pub patch_id: u32,
    /// Reserved, zero.
    pub _reserved: [u32; 2],
}

static_assertions::assert_eq_size!(PatchMetadata, [u8; 96]);
static_assertions::const_assert_eq!(std::mem::size_of::<PatchMetadata>() % 16, 0);

impl PatchMetadata {
    /// Packs a patch that occupies exactly one virtual page.
    pub fn new(
        geometry: &PatchGeometry,
        patch_id: PatchId,
        page: VirtualPageCoord,
        chunk_slot: u32,
    ) -> Self {
        Self {
            origin: geometry.origin.extend(1.0).to_array(),
            u_axis: geometry.u_axis.extend(0.0).to_array(),
            v_axis: geometry.v_axis.extend(0.0).to_array(),
            normal_flags: geometry
                .normal
                .extend(f32::from_bits(geometry.flags))
                .to_array(),
            virtual_base_page_x: page.x,
            virtual_base_page_y: page.y,
            virtual_size_pages_x: 1,
            virtual_size_pages_y: 1,
            chunk_slot,
            patch_id: patch_id.get(),
            _reserved: [0; 2],
        }
    }

    /// Flag bits stored in `normal_flags.w`.
    pub fn flags(&self) -> u32 {
        self.normal_flags[3].to_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_packs_geometry() {
        let geometry = PatchGeometry {
            origin: Vec3::new(1.0, 2.0, 3.0),
            u_axis: Vec3::X * 4.0,
            v_axis: Vec3::Z * 4.0,
            normal: Vec3::Y,
            flags: PATCH_FLAG_MESH_CARD,
        };
        let id = PatchId::new(130).unwrap();
        let meta = PatchMetadata::new(&geometry, id, VirtualPageCoord { x: 2, y: 1 }, 7);
        assert_eq!(meta.origin, [1.0, 2.0, 3.0, 1.0]);
        assert_eq!(meta.u_axis, [4.0, 0.0, 0.0, 0.0]);
        assert_eq!(meta.flags(), PATCH_FLAG_MESH_CARD);
        assert_eq!((meta.virtual_base_page_x, meta.virtual_base_page_y), (2, 1));
        assert_eq!(meta.chunk_slot, 7);
        assert_eq!(meta.patch_id, 130);
        assert_eq!(bytemuck::bytes_of(&meta).len(), 96);
    }

    #[test]
    fn test_request_bytes_layout() {
        let req = PageRequest::new(3, 9);
        let words: &[u32] = bytemuck::cast_slice(bytemuck::bytes_of(&req));
        assert_eq!(words, &[3, 9, 0, 0]);
    }
}
