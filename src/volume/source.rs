//! Format-reader collaborator contracts
//!
//! Readers translate a file layout into voxel buffers or, for brick pyramids,
//! into brick geometry plus byte ranges. The core never parses file bytes itself.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};
use super::brick::{Brick, BrickId};
use super::descriptor::{VolumeData, VolumeDescriptor};

/// How the bytes of a brick range are encoded
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrickEncoding {
    #[default]
    Raw,
    /// lz4 block with the decompressed size prepended
    Lz4,
}

/// Where a brick's bytes live
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrickSourcePath {
    File(PathBuf),
    Url(String),
}

impl BrickSourcePath {
    pub fn is_url(&self) -> bool {
        matches!(self, BrickSourcePath::Url(_))
    }
}

/// Byte range of one brick for one frame and channel
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileLocation {
    pub source: BrickSourcePath,
    pub offset: u64,
    pub size: u64,
    pub encoding: BrickEncoding,
}

/// Reader that decodes whole volumes
pub trait VolumeReader: Send + Sync {
    fn time_count(&self) -> u32;

    fn channel_count(&self) -> u32;

    /// Decode one channel of one time point
    fn convert(&self, time: u32, channel: u32, compute_max: bool) -> Result<VolumeData>;
}

/// Reader for multi-resolution brick pyramids
pub trait PyramidReader: Send + Sync {
    fn level_count(&self) -> u32;

    fn time_count(&self) -> u32;

    fn channel_count(&self) -> u32;

    fn level_descriptor(&self, level: u32) -> Result<VolumeDescriptor>;

    /// Brick geometry of one level
    fn build_bricks(&self, level: u32) -> Result<Vec<Brick>>;

    fn brick_file_location(&self, frame: u32, channel: u32, brick: BrickId, level: u32) -> Result<FileLocation>;
}

/// Reader over volumes already decoded in memory
#[derive(Clone, Default)]
pub struct MemoryReader {
    /// Indexed by time, then channel
    frames: Vec<Vec<Arc<VolumeData>>>,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a time point holding one volume per channel
    pub fn push_frame(&mut self, channels: Vec<VolumeData>) {
        self.frames.push(channels.into_iter().map(Arc::new).collect());
    }

    /// Shared handle to a stored volume
    pub fn volume(&self, time: u32, channel: u32) -> Result<Arc<VolumeData>> {
        self.frames
            .get(time as usize)
            .and_then(|f| f.get(channel as usize))
            .cloned()
            .ok_or_else(|| Error::Descriptor(format!("no volume for time {} channel {}", time, channel)))
    }
}

impl VolumeReader for MemoryReader {
    fn time_count(&self) -> u32 {
        self.frames.len() as u32
    }

    fn channel_count(&self) -> u32 {
        self.frames.first().map_or(0, |f| f.len() as u32)
    }

    fn convert(&self, time: u32, channel: u32, _compute_max: bool) -> Result<VolumeData> {
        self.volume(time, channel).map(|v| (*v).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{UVec3, Vec3};
    use crate::volume::descriptor::BitDepth;

    #[test]
    fn test_memory_reader() {
        let desc = VolumeDescriptor::new(UVec3::splat(2), Vec3::ONE, BitDepth::U8);
        let mut reader = MemoryReader::new();
        reader.push_frame(vec![
            VolumeData::from_fn(desc, |_| 1).unwrap(),
            VolumeData::from_fn(desc, |_| 2).unwrap(),
        ]);
        assert_eq!(reader.time_count(), 1);
        assert_eq!(reader.channel_count(), 2);
        assert_eq!(reader.convert(0, 1, true).unwrap().max_value(), 2);
        assert!(reader.convert(1, 0, true).is_err());
    }

    #[test]
    fn test_url_detection() {
        assert!(BrickSourcePath::Url("http://host/b0".into()).is_url());
        assert!(!BrickSourcePath::File("b0.raw".into()).is_url());
    }
}
