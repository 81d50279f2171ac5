//! Bricks: the unit of GPU residency and streaming

use serde::{Deserialize, Serialize};

use crate::core::types::UVec3;
use crate::math::Aabb;
use super::descriptor::VolumeId;

/// Index of a brick inside its catalog, stable for the catalog's lifetime
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BrickId(pub u32);

impl BrickId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Globally unique brick identity across volumes and pyramid levels
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrickKey {
    pub volume: VolumeId,
    pub level: u32,
    pub brick: BrickId,
}

impl BrickKey {
    pub fn new(volume: VolumeId, level: u32, brick: BrickId) -> Self {
        Self { volume, level, brick }
    }
}

/// Render pass a brick is drawn in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PassMode {
    Color,
    Shading,
    Shadow,
    Mask,
}

impl PassMode {
    pub const ALL: [PassMode; 4] = [PassMode::Color, PassMode::Shading, PassMode::Shadow, PassMode::Mask];

    #[inline]
    fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Small bitset of [`PassMode`]s
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PassSet(u8);

impl PassSet {
    pub const EMPTY: PassSet = PassSet(0);

    pub fn contains(self, pass: PassMode) -> bool {
        self.0 & pass.bit() != 0
    }

    /// Returns false if the pass was already present
    pub fn insert(&mut self, pass: PassMode) -> bool {
        let had = self.contains(pass);
        self.0 |= pass.bit();
        !had
    }

    pub fn remove(&mut self, pass: PassMode) {
        self.0 &= !pass.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = PassMode> {
        PassMode::ALL.into_iter().filter(move |p| self.contains(*p))
    }
}

impl FromIterator<PassMode> for PassSet {
    fn from_iter<I: IntoIterator<Item = PassMode>>(iter: I) -> Self {
        let mut set = PassSet::EMPTY;
        for pass in iter {
            set.insert(pass);
        }
        set
    }
}

/// Texture component uploaded for a brick
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Component {
    Data,
    Mask,
    Label,
    Gradient,
}

/// Texel layout of an uploaded brick component
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TexelFormat {
    #[default]
    R8,
    R16,
}

impl TexelFormat {
    pub fn bytes_per_texel(self) -> usize {
        match self {
            TexelFormat::R8 => 1,
            TexelFormat::R16 => 2,
        }
    }
}

/// Decoded texels of one brick component, x fastest, little endian
#[derive(Clone, Debug, PartialEq)]
pub struct BrickPayload {
    pub dims: UVec3,
    pub format: TexelFormat,
    pub bytes: Vec<u8>,
}

impl BrickPayload {
    /// Expected byte length for the given dimensions and format
    pub fn expected_len(dims: UVec3, format: TexelFormat) -> usize {
        dims.x as usize * dims.y as usize * dims.z as usize * format.bytes_per_texel()
    }

    pub fn byte_len(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Texel value at brick-local coordinates
    pub fn texel(&self, x: u32, y: u32, z: u32) -> u16 {
        let i = (z as usize * self.dims.y as usize + y as usize) * self.dims.x as usize + x as usize;
        match self.format {
            TexelFormat::R8 => self.bytes[i] as u16,
            TexelFormat::R16 => u16::from_le_bytes([self.bytes[2 * i], self.bytes[2 * i + 1]]),
        }
    }
}

/// One rectangular sub-block of a volume
///
/// Geometry is fixed at catalog build time; only `distance` and `priority`
/// change afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Brick {
    id: BrickId,
    /// Voxel offset of the brick inside its volume level
    offset: UVec3,
    /// Voxel extent, including the one-voxel overlap with neighbours
    size: UVec3,
    /// Sampling range inside the brick texture, normalized 0..1
    tbox: Aabb,
    /// World region this brick is responsible for; neighbours abut exactly
    bbox: Aabb,
    /// World region covered by all of the brick's voxels
    dbox: Aabb,
    #[serde(skip)]
    distance: f32,
    #[serde(skip)]
    priority: u8,
}

impl Brick {
    pub fn new(id: BrickId, offset: UVec3, size: UVec3, tbox: Aabb, bbox: Aabb, dbox: Aabb) -> Self {
        Self {
            id,
            offset,
            size,
            tbox,
            bbox,
            dbox,
            distance: 0.0,
            priority: 0,
        }
    }

    pub fn id(&self) -> BrickId {
        self.id
    }

    pub fn offset(&self) -> UVec3 {
        self.offset
    }

    pub fn size(&self) -> UVec3 {
        self.size
    }

    pub fn tbox(&self) -> &Aabb {
        &self.tbox
    }

    pub fn bbox(&self) -> &Aabb {
        &self.bbox
    }

    pub fn dbox(&self) -> &Aabb {
        &self.dbox
    }

    /// Distance computed by the last sort
    pub fn distance(&self) -> f32 {
        self.distance
    }

    pub(crate) fn set_distance(&mut self, distance: f32) {
        self.distance = distance;
    }

    /// 0 = must draw, anything else = skip
    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    /// Texel count of one component
    pub fn voxel_count(&self) -> u64 {
        self.size.x as u64 * self.size.y as u64 * self.size.z as u64
    }
}
