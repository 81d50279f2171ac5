//! Volume data model: descriptors, bricks, catalogs, readers and layers

pub mod descriptor;
pub mod brick;
pub mod catalog;
pub mod source;
pub mod pyramid;
#[allow(clippy::module_inception)]
pub mod volume;
pub mod layer;

pub use descriptor::{BitDepth, VolumeData, VolumeDescriptor, VolumeId, VoxelData};
pub use brick::{Brick, BrickId, BrickKey, BrickPayload, Component, PassMode, PassSet, TexelFormat};
pub use catalog::{BrickCatalog, BrickLayout, UpdateOrder, brick_count_1d, view_distance};
pub use source::{BrickEncoding, BrickSourcePath, FileLocation, MemoryReader, PyramidReader, VolumeReader};
pub use pyramid::{PyramidBuilder, PyramidDescriptor, PyramidVolume, select_level};
pub use volume::{BrickStore, Volume};
pub use layer::{AnnotationLayer, Layer, LayerGroup, LayerKind, MeshLayer};
