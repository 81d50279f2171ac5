//! Volume metadata and decoded voxel buffers

use serde::{Deserialize, Serialize};

use crate::core::types::{UVec3, Vec3};
use crate::core::{Error, Result};
use crate::math::Aabb;
use super::brick::{BrickPayload, TexelFormat};

/// Stable identity of a loaded volume (one channel of one dataset)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(pub u32);

/// Stored bits per voxel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitDepth {
    #[default]
    U8,
    U16,
}

impl BitDepth {
    pub fn bytes(self) -> u64 {
        match self {
            BitDepth::U8 => 1,
            BitDepth::U16 => 2,
        }
    }

    pub fn texel_format(self) -> TexelFormat {
        match self {
            BitDepth::U8 => TexelFormat::R8,
            BitDepth::U16 => TexelFormat::R16,
        }
    }
}

/// Geometry and storage layout of one volume resolution level
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    /// Voxel counts along x, y, z
    pub dims: UVec3,
    /// World size of one voxel
    pub spacing: Vec3,
    /// World position of the volume's min corner
    pub origin: Vec3,
    pub bit_depth: BitDepth,
    /// Channel count of the dataset this volume belongs to
    pub channels: u32,
}

impl VolumeDescriptor {
    pub fn new(dims: UVec3, spacing: Vec3, bit_depth: BitDepth) -> Self {
        Self {
            dims,
            spacing,
            origin: Vec3::ZERO,
            bit_depth,
            channels: 1,
        }
    }

    pub fn with_origin(mut self, origin: Vec3) -> Self {
        self.origin = origin;
        self
    }

    /// True for empty grids or non-positive spacing
    pub fn is_degenerate(&self) -> bool {
        self.dims.min_element() == 0
            || !(self.spacing.min_element() > 0.0)
    }

    pub fn voxel_count(&self) -> u64 {
        self.dims.x as u64 * self.dims.y as u64 * self.dims.z as u64
    }

    /// Uncompressed size of the voxel grid
    pub fn byte_size(&self) -> u64 {
        self.voxel_count() * self.bit_depth.bytes()
    }

    /// World-space extent of the grid
    pub fn world_bounds(&self) -> Aabb {
        Aabb::new(self.origin, self.origin + self.dims.as_vec3() * self.spacing)
    }

    /// Continuous voxel coordinate of a world point (voxel centers at i + 0.5)
    pub fn world_to_voxel(&self, p: Vec3) -> Vec3 {
        (p - self.origin) / self.spacing
    }
}

/// Raw voxel storage
#[derive(Clone, Debug, PartialEq)]
pub enum VoxelData {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

impl VoxelData {
    pub fn len(&self) -> usize {
        match self {
            VoxelData::U8(v) => v.len(),
            VoxelData::U16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bit_depth(&self) -> BitDepth {
        match self {
            VoxelData::U8(_) => BitDepth::U8,
            VoxelData::U16(_) => BitDepth::U16,
        }
    }

    #[inline]
    fn get(&self, index: usize) -> u16 {
        match self {
            VoxelData::U8(v) => v[index] as u16,
            VoxelData::U16(v) => v[index],
        }
    }
}

/// A decoded volume handed over by a format reader
#[derive(Clone, Debug)]
pub struct VolumeData {
    desc: VolumeDescriptor,
    voxels: VoxelData,
    max_value: u16,
}

impl VolumeData {
    /// Wrap a voxel buffer, validating its length against the descriptor
    pub fn new(desc: VolumeDescriptor, voxels: VoxelData) -> Result<Self> {
        if voxels.bit_depth() != desc.bit_depth {
            return Err(Error::Descriptor(format!(
                "voxel buffer is {:?} but descriptor says {:?}",
                voxels.bit_depth(),
                desc.bit_depth
            )));
        }
        if voxels.len() as u64 != desc.voxel_count() {
            return Err(Error::Descriptor(format!(
                "voxel buffer has {} entries, expected {}",
                voxels.len(),
                desc.voxel_count()
            )));
        }
        let max_value = match &voxels {
            VoxelData::U8(v) => v.iter().copied().max().unwrap_or(0) as u16,
            VoxelData::U16(v) => v.iter().copied().max().unwrap_or(0),
        };
        Ok(Self { desc, voxels, max_value })
    }

    /// Build a volume by evaluating `f` at every voxel
    pub fn from_fn(desc: VolumeDescriptor, mut f: impl FnMut(UVec3) -> u16) -> Result<Self> {
        let mut values = Vec::with_capacity(desc.voxel_count() as usize);
        for z in 0..desc.dims.z {
            for y in 0..desc.dims.y {
                for x in 0..desc.dims.x {
                    values.push(f(UVec3::new(x, y, z)));
                }
            }
        }
        let voxels = match desc.bit_depth {
            BitDepth::U8 => VoxelData::U8(values.into_iter().map(|v| v.min(255) as u8).collect()),
            BitDepth::U16 => VoxelData::U16(values),
        };
        Self::new(desc, voxels)
    }

    pub fn descriptor(&self) -> &VolumeDescriptor {
        &self.desc
    }

    pub fn voxels(&self) -> &VoxelData {
        &self.voxels
    }

    /// Largest stored value, used to normalize intensities
    pub fn max_value(&self) -> u16 {
        self.max_value
    }

    #[inline]
    fn index(&self, x: u32, y: u32, z: u32) -> usize {
        let d = self.desc.dims;
        (z as usize * d.y as usize + y as usize) * d.x as usize + x as usize
    }

    pub fn value(&self, x: u32, y: u32, z: u32) -> u16 {
        self.voxels.get(self.index(x, y, z))
    }

    /// Copy a sub-block into a texture payload (x fastest)
    pub fn extract(&self, offset: UVec3, size: UVec3) -> BrickPayload {
        let format = self.desc.bit_depth.texel_format();
        let mut bytes = Vec::with_capacity((size.x * size.y * size.z) as usize * format.bytes_per_texel());
        for z in offset.z..offset.z + size.z {
            for y in offset.y..offset.y + size.y {
                let row = self.index(offset.x, y, z);
                match &self.voxels {
                    VoxelData::U8(v) => bytes.extend_from_slice(&v[row..row + size.x as usize]),
                    VoxelData::U16(v) => {
                        for value in &v[row..row + size.x as usize] {
                            bytes.extend_from_slice(&value.to_le_bytes());
                        }
                    }
                }
            }
        }
        BrickPayload { dims: size, format, bytes }
    }

    /// True when every voxel of the sub-block is zero
    pub fn is_block_empty(&self, offset: UVec3, size: UVec3) -> bool {
        for z in offset.z..offset.z + size.z {
            for y in offset.y..offset.y + size.y {
                let row = self.index(offset.x, y, z);
                let nonzero = match &self.voxels {
                    VoxelData::U8(v) => v[row..row + size.x as usize].iter().any(|&b| b != 0),
                    VoxelData::U16(v) => v[row..row + size.x as usize].iter().any(|&b| b != 0),
                };
                if nonzero {
                    return false;
                }
            }
        }
        true
    }
}
