//! Brick pyramid descriptor: multi-resolution bricked volumes on disk
//!
//! A pyramid is a JSON descriptor listing, per resolution level, the brick
//! geometry and the byte range of every (frame, channel, brick) triple. Brick
//! bytes live in companion files next to the descriptor.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::types::{UVec3, Vec3};
use crate::core::{Error, Result};
use crate::math::Aabb;
use super::brick::{Brick, BrickId};
use super::catalog::{BrickCatalog, BrickLayout};
use super::descriptor::{BitDepth, VolumeData, VolumeDescriptor, VolumeId};
use super::source::{BrickEncoding, BrickSourcePath, FileLocation, PyramidReader};

const DESCRIPTOR_VERSION: u32 = 1;

/// On-disk descriptor
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PyramidDescriptor {
    pub version: u32,
    pub time_count: u32,
    pub channel_count: u32,
    /// Finest level first
    pub levels: Vec<LevelRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LevelRecord {
    pub dims: [u32; 3],
    pub spacing: [f32; 3],
    pub bit_depth: BitDepth,
    pub bricks: Vec<BrickRecord>,
    pub files: Vec<FileRecord>,
}

/// Brick geometry; boxes are normalized to the level's extent
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrickRecord {
    pub id: u32,
    pub offset: [u32; 3],
    pub size: [u32; 3],
    pub tbox: [[f32; 3]; 2],
    pub bbox: [[f32; 3]; 2],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileRecord {
    pub frame: u32,
    pub channel: u32,
    pub brick: u32,
    /// Path relative to the descriptor, or an absolute URL
    pub path: String,
    pub offset: u64,
    pub size: u64,
    #[serde(default)]
    pub encoding: BrickEncoding,
}

impl LevelRecord {
    fn descriptor(&self, channels: u32) -> VolumeDescriptor {
        let mut desc = VolumeDescriptor::new(
            UVec3::from_array(self.dims),
            Vec3::from_array(self.spacing),
            self.bit_depth,
        );
        desc.channels = channels;
        desc
    }
}

/// A pyramid opened from its descriptor
pub struct PyramidVolume {
    base_dir: PathBuf,
    desc: PyramidDescriptor,
    /// (level, frame, channel, brick) -> index into that level's file list
    index: HashMap<(u32, u32, u32, u32), usize>,
}

impl PyramidVolume {
    /// Read and validate a descriptor
    ///
    /// Any inconsistency is a load failure for the whole dataset.
    pub fn open(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let desc: PyramidDescriptor = serde_json::from_str(&json)
            .map_err(|e| Error::Descriptor(format!("{}: {}", path.display(), e)))?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_descriptor(base_dir, desc)
    }

    pub fn from_descriptor(base_dir: PathBuf, desc: PyramidDescriptor) -> Result<Self> {
        if desc.version != DESCRIPTOR_VERSION {
            return Err(Error::Descriptor(format!("unsupported descriptor version {}", desc.version)));
        }
        if desc.levels.is_empty() {
            return Err(Error::Descriptor("pyramid has no levels".into()));
        }

        let mut index = HashMap::new();
        for (lv, level) in desc.levels.iter().enumerate() {
            let dims = UVec3::from_array(level.dims);
            if dims.min_element() == 0 {
                return Err(Error::Descriptor(format!("level {} has zero-sized dims", lv)));
            }
            for (i, brick) in level.bricks.iter().enumerate() {
                if brick.id as usize != i {
                    return Err(Error::Descriptor(format!("level {} brick {} listed out of order", lv, brick.id)));
                }
                let end = UVec3::from_array(brick.offset) + UVec3::from_array(brick.size);
                if end.cmpgt(dims).any() || UVec3::from_array(brick.size).min_element() == 0 {
                    return Err(Error::Descriptor(format!("level {} brick {} exceeds the level extent", lv, brick.id)));
                }
            }
            for (i, file) in level.files.iter().enumerate() {
                if file.brick as usize >= level.bricks.len()
                    || file.frame >= desc.time_count
                    || file.channel >= desc.channel_count
                {
                    return Err(Error::Descriptor(format!(
                        "level {} file entry {} references frame {} channel {} brick {} out of range",
                        lv, i, file.frame, file.channel, file.brick
                    )));
                }
                index.insert((lv as u32, file.frame, file.channel, file.brick), i);
            }
        }

        log::info!(
            "Opened pyramid with {} levels, {} frames, {} channels",
            desc.levels.len(), desc.time_count, desc.channel_count
        );
        Ok(Self { base_dir, desc, index })
    }

    pub fn descriptor(&self) -> &PyramidDescriptor {
        &self.desc
    }

    fn level(&self, level: u32) -> Result<&LevelRecord> {
        self.desc
            .levels
            .get(level as usize)
            .ok_or_else(|| Error::Descriptor(format!("level {} out of range", level)))
    }

    /// Catalog for one level, ready for sorting
    pub fn catalog(&self, volume: VolumeId, level: u32) -> Result<BrickCatalog> {
        let desc = self.level_descriptor(level)?;
        Ok(BrickCatalog::from_bricks(volume, level, desc, self.build_bricks(level)?))
    }

    /// Y spacing per level, finest first
    pub fn level_spacings(&self) -> Vec<f32> {
        self.desc.levels.iter().map(|l| l.spacing[1]).collect()
    }
}

impl PyramidReader for PyramidVolume {
    fn level_count(&self) -> u32 {
        self.desc.levels.len() as u32
    }

    fn time_count(&self) -> u32 {
        self.desc.time_count
    }

    fn channel_count(&self) -> u32 {
        self.desc.channel_count
    }

    fn level_descriptor(&self, level: u32) -> Result<VolumeDescriptor> {
        Ok(self.level(level)?.descriptor(self.desc.channel_count))
    }

    fn build_bricks(&self, level: u32) -> Result<Vec<Brick>> {
        let record = self.level(level)?;
        let bounds = record.descriptor(self.desc.channel_count).world_bounds();
        let dims = UVec3::from_array(record.dims).as_vec3();
        Ok(record
            .bricks
            .iter()
            .map(|b| {
                let offset = UVec3::from_array(b.offset);
                let size = UVec3::from_array(b.size);
                let norm = |c: [f32; 3]| bounds.lerp(Vec3::from_array(c));
                Brick::new(
                    BrickId(b.id),
                    offset,
                    size,
                    Aabb::new(Vec3::from_array(b.tbox[0]), Vec3::from_array(b.tbox[1])),
                    Aabb::new(norm(b.bbox[0]), norm(b.bbox[1])),
                    Aabb::new(
                        bounds.lerp(offset.as_vec3() / dims),
                        bounds.lerp((offset + size).as_vec3() / dims),
                    ),
                )
            })
            .collect())
    }

    fn brick_file_location(&self, frame: u32, channel: u32, brick: BrickId, level: u32) -> Result<FileLocation> {
        let record = self.level(level)?;
        let i = self
            .index
            .get(&(level, frame, channel, brick.0))
            .copied()
            .ok_or_else(|| Error::Descriptor(format!(
                "no file range for level {} frame {} channel {} brick {}",
                level, frame, channel, brick.0
            )))?;
        let file = &record.files[i];
        let source = if file.path.contains("://") {
            BrickSourcePath::Url(file.path.clone())
        } else {
            BrickSourcePath::File(self.base_dir.join(&file.path))
        };
        Ok(FileLocation {
            source,
            offset: file.offset,
            size: file.size,
            encoding: file.encoding,
        })
    }
}

/// Writes bricked pyramids from decoded volumes
pub struct PyramidBuilder {
    pub levels: u32,
    pub layout: BrickLayout,
    pub encoding: BrickEncoding,
}

impl PyramidBuilder {
    pub fn new(levels: u32, layout: BrickLayout, encoding: BrickEncoding) -> Self {
        Self { levels: levels.max(1), layout, encoding }
    }

    /// Write `frames[t][c]` into `dir` and return the descriptor path
    pub fn write(&self, dir: &Path, name: &str, frames: &[Vec<VolumeData>]) -> Result<PathBuf> {
        let first = frames
            .first()
            .and_then(|f| f.first())
            .ok_or_else(|| Error::Descriptor("pyramid needs at least one volume".into()))?;
        let base = *first.descriptor();
        let channel_count = frames[0].len() as u32;
        if frames.iter().any(|f| f.len() as u32 != channel_count) {
            return Err(Error::Descriptor("every frame needs the same channel count".into()));
        }
        std::fs::create_dir_all(dir)?;

        let mut levels = Vec::with_capacity(self.levels as usize);
        let mut current: Vec<Vec<VolumeData>> = frames.to_vec();
        for lv in 0..self.levels {
            if lv > 0 {
                current = current
                    .iter()
                    .map(|f| f.iter().map(downsample).collect::<Result<Vec<_>>>())
                    .collect::<Result<Vec<_>>>()?;
            }
            let desc = *current[0][0].descriptor();
            let catalog = BrickCatalog::build(VolumeId(0), lv, &desc, &self.layout);
            let bounds = desc.world_bounds();
            let bricks = catalog
                .bricks()
                .iter()
                .map(|b| {
                    let norm = |p: Vec3| ((p - bounds.min) / bounds.size()).to_array();
                    BrickRecord {
                        id: b.id().0,
                        offset: b.offset().to_array(),
                        size: b.size().to_array(),
                        tbox: [b.tbox().min.to_array(), b.tbox().max.to_array()],
                        bbox: [norm(b.bbox().min), norm(b.bbox().max)],
                    }
                })
                .collect();

            let mut files = Vec::new();
            for (t, frame) in current.iter().enumerate() {
                for (c, volume) in frame.iter().enumerate() {
                    let file_name = format!("{}_l{}_t{}_c{}.bin", name, lv, t, c);
                    let mut out = File::create(dir.join(&file_name))?;
                    let mut offset = 0u64;
                    for brick in catalog.bricks() {
                        let payload = volume.extract(brick.offset(), brick.size());
                        let bytes = match self.encoding {
                            BrickEncoding::Raw => payload.bytes,
                            BrickEncoding::Lz4 => lz4_flex::compress_prepend_size(&payload.bytes),
                        };
                        out.write_all(&bytes)?;
                        files.push(FileRecord {
                            frame: t as u32,
                            channel: c as u32,
                            brick: brick.id().0,
                            path: file_name.clone(),
                            offset,
                            size: bytes.len() as u64,
                            encoding: self.encoding,
                        });
                        offset += bytes.len() as u64;
                    }
                }
            }

            levels.push(LevelRecord {
                dims: desc.dims.to_array(),
                spacing: desc.spacing.to_array(),
                bit_depth: desc.bit_depth,
                bricks,
                files,
            });
        }

        let descriptor = PyramidDescriptor {
            version: DESCRIPTOR_VERSION,
            time_count: frames.len() as u32,
            channel_count,
            levels,
        };
        let path = dir.join(format!("{}.json", name));
        std::fs::write(&path, serde_json::to_string_pretty(&descriptor)?)?;
        log::info!(
            "Wrote {}-level pyramid for {:?} voxels to {}",
            self.levels, base.dims, path.display()
        );
        Ok(path)
    }
}

/// Halve a volume with a 2x2x2 max filter, doubling its spacing
fn downsample(volume: &VolumeData) -> Result<VolumeData> {
    let src = volume.descriptor();
    let dims = (src.dims + UVec3::ONE) / 2;
    let mut desc = *src;
    desc.dims = dims.max(UVec3::ONE);
    desc.spacing = src.world_bounds().size() / desc.dims.as_vec3();
    let data = VolumeData::from_fn(desc, |p| {
        let lo = p * 2;
        let hi = (lo + UVec3::ONE).min(src.dims - UVec3::ONE);
        let mut max = 0u16;
        for z in lo.z..=hi.z {
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    max = max.max(volume.value(x, y, z));
                }
            }
        }
        max
    })?;
    Ok(data)
}

/// Pick a pyramid level for the current zoom
///
/// Returns the coarsest level whose voxels are still no larger than
/// `res_scale` screen pixels, shifted by `offset` and clamped to the pyramid.
/// A `res_scale` of zero always selects the finest level.
pub fn select_level(level_spacings: &[f32], pixel_world_size: f32, res_scale: f32, offset: i32) -> u32 {
    if level_spacings.is_empty() {
        return 0;
    }
    let last = level_spacings.len() as i32 - 1;
    if res_scale <= 0.0 {
        return offset.clamp(0, last) as u32;
    }
    let limit = pixel_world_size * res_scale;
    let mut level = 0;
    for (i, &spacing) in level_spacings.iter().enumerate().rev() {
        if spacing <= limit {
            level = i as i32;
            break;
        }
    }
    (level + offset).clamp(0, last) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(dims: UVec3) -> VolumeData {
        let desc = VolumeDescriptor::new(dims, Vec3::ONE, BitDepth::U16);
        VolumeData::from_fn(desc, |p| (p.x * 7 + p.y * 3 + p.z) as u16).unwrap()
    }

    #[test]
    fn test_write_and_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BrickLayout { max_brick_size: 8, ..Default::default() };
        let builder = PyramidBuilder::new(2, layout, BrickEncoding::Lz4);
        let path = builder.write(dir.path(), "stack", &[vec![volume(UVec3::new(12, 9, 5))]]).unwrap();

        let pyramid = PyramidVolume::open(&path).unwrap();
        assert_eq!(pyramid.level_count(), 2);
        assert_eq!(pyramid.level_descriptor(1).unwrap().dims, UVec3::new(6, 5, 3));

        let bricks = pyramid.build_bricks(0).unwrap();
        let catalog = BrickCatalog::build(
            VolumeId(0), 0, &pyramid.level_descriptor(0).unwrap(), &layout);
        assert_eq!(bricks.len(), catalog.len());
        for (a, b) in bricks.iter().zip(catalog.bricks()) {
            assert_eq!(a.offset(), b.offset());
            assert!((a.bbox().min - b.bbox().min).length() < 1e-4);
            assert!((a.bbox().max - b.bbox().max).length() < 1e-4);
        }

        let loc = pyramid.brick_file_location(0, 0, BrickId(1), 0).unwrap();
        assert_eq!(loc.encoding, BrickEncoding::Lz4);
        assert!(matches!(loc.source, BrickSourcePath::File(ref p) if p.starts_with(dir.path())));
        assert!(pyramid.brick_file_location(0, 0, BrickId(99), 0).is_err());
        assert!(pyramid.brick_file_location(0, 1, BrickId(0), 0).is_err());
    }

    #[test]
    fn test_malformed_descriptor_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ \"version\": 1, \"levels\": ").unwrap();
        assert!(matches!(PyramidVolume::open(&path), Err(Error::Descriptor(_))));

        let desc = PyramidDescriptor {
            version: 1,
            time_count: 1,
            channel_count: 1,
            levels: vec![LevelRecord {
                dims: [4, 4, 4],
                spacing: [1.0; 3],
                bit_depth: BitDepth::U8,
                bricks: vec![BrickRecord {
                    id: 0,
                    offset: [2, 0, 0],
                    size: [4, 4, 4],
                    tbox: [[0.0; 3], [1.0; 3]],
                    bbox: [[0.0; 3], [1.0; 3]],
                }],
                files: vec![],
            }],
        };
        assert!(PyramidVolume::from_descriptor(PathBuf::new(), desc).is_err());
    }

    #[test]
    fn test_url_paths_are_kept_as_urls() {
        let desc = PyramidDescriptor {
            version: 1,
            time_count: 1,
            channel_count: 1,
            levels: vec![LevelRecord {
                dims: [4, 4, 4],
                spacing: [1.0; 3],
                bit_depth: BitDepth::U8,
                bricks: vec![BrickRecord {
                    id: 0,
                    offset: [0; 3],
                    size: [4; 3],
                    tbox: [[0.0; 3], [1.0; 3]],
                    bbox: [[0.0; 3], [1.0; 3]],
                }],
                files: vec![FileRecord {
                    frame: 0,
                    channel: 0,
                    brick: 0,
                    path: "https://example.org/b0".into(),
                    offset: 0,
                    size: 64,
                    encoding: BrickEncoding::Raw,
                }],
            }],
        };
        let pyramid = PyramidVolume::from_descriptor(PathBuf::from("/data"), desc).unwrap();
        let loc = pyramid.brick_file_location(0, 0, BrickId(0), 0).unwrap();
        assert!(loc.source.is_url());
    }

    #[test]
    fn test_downsample_keeps_maximum() {
        let desc = VolumeDescriptor::new(UVec3::new(4, 4, 1), Vec3::ONE, BitDepth::U8);
        let vol = VolumeData::from_fn(desc, |p| if p == UVec3::new(3, 1, 0) { 200 } else { 1 }).unwrap();
        let half = downsample(&vol).unwrap();
        assert_eq!(half.descriptor().dims, UVec3::new(2, 2, 1));
        assert_eq!(half.value(1, 0, 0), 200);
        assert_eq!(half.value(0, 1, 0), 1);
        assert_eq!(half.descriptor().world_bounds().size(), Vec3::new(4.0, 4.0, 1.0));
    }

    #[test]
    fn test_select_level() {
        let spacings = [1.0, 2.0, 4.0, 8.0];
        assert_eq!(select_level(&spacings, 0.5, 1.0, 0), 0);
        assert_eq!(select_level(&spacings, 4.5, 1.0, 0), 2);
        assert_eq!(select_level(&spacings, 4.5, 2.0, 0), 3);
        assert_eq!(select_level(&spacings, 4.5, 1.0, -1), 1);
        assert_eq!(select_level(&spacings, 100.0, 1.0, 3), 3);
        assert_eq!(select_level(&spacings, 100.0, 0.0, 0), 0);
    }
}
