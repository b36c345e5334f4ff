//! Patch identity: semantic [`PatchKey`] descriptors and their compact [`PatchId`].

use crate::virtual_space::VIRTUAL_PAGES_PER_CHUNK;

/// One of the six axis-aligned directions a voxel face can point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum FaceDirection {
    /// +X direction.
    PosX = 0,
    /// −X direction.
    NegX = 1,
    /// +Y direction.
    PosY = 2,
    /// −Y direction.
    NegY = 3,
    /// +Z direction.
    PosZ = 4,
    /// −Z direction.
    NegZ = 5,
}

impl FaceDirection {
    /// All six directions in discriminant order.
    pub const ALL: [FaceDirection; 6] = [
        Self::PosX,
        Self::NegX,
        Self::PosY,
        Self::NegY,
        Self::PosZ,
        Self::NegZ,
    ];

    /// Decodes a discriminant, returning `None` for values above 5.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Unit normal of the face.
    pub fn normal(self) -> glam::Vec3 {
        match self {
            Self::PosX => glam::Vec3::X,
            Self::NegX => glam::Vec3::NEG_X,
            Self::PosY => glam::Vec3::Y,
            Self::NegY => glam::Vec3::NEG_Y,
            Self::PosZ => glam::Vec3::Z,
            Self::NegZ => glam::Vec3::NEG_Z,
        }
    }
}

/// Immutable semantic descriptor of one surface patch. Used only as a lookup key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PatchKey {
    /// A quad of voxel faces inside one chunk.
    VoxelFace {
        /// Direction the faces point.
        face: FaceDirection,
        /// Voxel layer along the face normal.
        plane: u8,
        /// Patch column within the plane.
        patch_u: u8,
        /// Patch row within the plane.
        patch_v: u8,
    },
    /// One card of a mesh instance.
    MeshCard {
        /// Stable id of the mesh instance, durable across remeshes.
        instance_id: u64,
        /// Card index within the instance.
        card_index: u32,
    },
}

impl PatchKey {
    /// Shorthand for a voxel-face key.
    pub fn voxel_face(face: FaceDirection, plane: u8, patch_u: u8, patch_v: u8) -> Self {
        Self::VoxelFace {
            face,
            plane,
            patch_u,
            patch_v,
        }
    }

    /// Shorthand for a mesh-card key.
    pub fn mesh_card(instance_id: u64, card_index: u32) -> Self {
        Self::MeshCard {
            instance_id,
            card_index,
        }
    }

    /// Returns `true` for mesh-card patches.
    pub fn is_mesh_card(&self) -> bool {
        matches!(self, Self::MeshCard { .. })
    }
}

/// Compact per-chunk patch identifier in `0..VIRTUAL_PAGES_PER_CHUNK`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchId(u16);

impl PatchId {
    /// Wraps a raw value, rejecting anything outside the per-chunk capacity.
    pub fn new(raw: u32) -> Option<Self> {
        if raw < VIRTUAL_PAGES_PER_CHUNK {
            Some(Self(raw as u16))
        } else {
            None
        }
    }

    /// Raw value.
    pub fn get(self) -> u32 {
        u32::from(self.0)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}
