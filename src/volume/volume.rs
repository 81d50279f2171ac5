//! Runtime volume: catalog, voxel storage and display state of one channel

use std::sync::Arc;

use crate::core::types::Vec3;
use crate::core::{Error, Result};
use crate::math::{Aabb, ClipPlanes};
use crate::render::backend::{BrickDraw, Filter, TextureHandle};
use crate::render::transfer::{MaskMode, RenderMode, ShadingParams, ShadowParams, TransferFunction};
use super::brick::{Brick, BrickId, BrickKey, BrickPayload, Component};
use super::catalog::{BrickCatalog, BrickLayout};
use super::descriptor::{VolumeData, VolumeDescriptor, VolumeId};
use super::source::{FileLocation, PyramidReader};

/// Where brick voxels come from
#[derive(Clone)]
pub enum BrickStore {
    /// Whole volume decoded in main memory
    Memory {
        data: Arc<VolumeData>,
        mask: Option<Arc<VolumeData>>,
        label: Option<Arc<VolumeData>>,
    },
    /// Bricks streamed from a multi-resolution pyramid
    Pyramid {
        reader: Arc<dyn PyramidReader>,
        frame: u32,
        channel: u32,
    },
}

impl std::fmt::Debug for BrickStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrickStore::Memory { mask, label, .. } => f
                .debug_struct("Memory")
                .field("mask", &mask.is_some())
                .field("label", &label.is_some())
                .finish(),
            BrickStore::Pyramid { frame, channel, .. } => f
                .debug_struct("Pyramid")
                .field("frame", frame)
                .field("channel", channel)
                .finish(),
        }
    }
}

/// One channel of a dataset as the renderer sees it
#[derive(Debug)]
pub struct Volume {
    id: VolumeId,
    name: String,
    store: BrickStore,
    catalog: BrickCatalog,
    layout: BrickLayout,
    skip_empty: bool,
    max_value: f32,
    pub transfer: TransferFunction,
    pub mode: RenderMode,
    pub shading: Option<ShadingParams>,
    pub shadow: Option<ShadowParams>,
    pub mask_mode: MaskMode,
    pub mask_color: Vec3,
    pub filter: Filter,
    pub clip: ClipPlanes,
    /// Multiplier on the view's sample rate
    pub sample_rate: f32,
    /// Relative weight when volumes split an interactive brick quota
    pub quota_share: f32,
    pub display: bool,
}

impl Volume {
    /// Volume over an in-memory buffer
    ///
    /// With `skip_empty`, all-zero bricks get priority 1 and are never drawn.
    pub fn from_data(id: VolumeId, name: impl Into<String>, data: Arc<VolumeData>, layout: &BrickLayout, skip_empty: bool) -> Self {
        let mut catalog = BrickCatalog::build(id, 0, data.descriptor(), layout);
        if skip_empty {
            catalog.assign_priorities(&data);
        }
        let max_value = f32::from(data.max_value().max(1));
        Self::with_store(
            id,
            name.into(),
            BrickStore::Memory { data, mask: None, label: None },
            catalog,
            *layout,
            skip_empty,
            max_value,
        )
    }

    /// Volume streamed from a pyramid at the given level
    pub fn from_pyramid(id: VolumeId, name: impl Into<String>, reader: Arc<dyn PyramidReader>, frame: u32, channel: u32, level: u32) -> Result<Self> {
        if frame >= reader.time_count() || channel >= reader.channel_count() {
            return Err(Error::Descriptor(format!(
                "frame {} channel {} outside pyramid ({} frames, {} channels)",
                frame,
                channel,
                reader.time_count(),
                reader.channel_count()
            )));
        }
        let catalog = pyramid_catalog(reader.as_ref(), id, level)?;
        let max_value = match catalog.descriptor().bit_depth {
            super::descriptor::BitDepth::U8 => 255.0,
            super::descriptor::BitDepth::U16 => 65535.0,
        };
        Ok(Self::with_store(
            id,
            name.into(),
            BrickStore::Pyramid { reader, frame, channel },
            catalog,
            BrickLayout::default(),
            false,
            max_value,
        ))
    }

    fn with_store(
        id: VolumeId,
        name: String,
        store: BrickStore,
        catalog: BrickCatalog,
        layout: BrickLayout,
        skip_empty: bool,
        max_value: f32,
    ) -> Self {
        Self {
            id,
            name,
            store,
            catalog,
            layout,
            skip_empty,
            max_value,
            transfer: TransferFunction::default(),
            mode: RenderMode::Over,
            shading: None,
            shadow: None,
            mask_mode: MaskMode::Off,
            mask_color: Vec3::new(0.0, 1.0, 0.0),
            filter: Filter::Linear,
            clip: ClipPlanes::none(),
            sample_rate: 1.0,
            quota_share: 1.0,
            display: true,
        }
    }

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &BrickStore {
        &self.store
    }

    pub fn catalog(&self) -> &BrickCatalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut BrickCatalog {
        &mut self.catalog
    }

    pub fn descriptor(&self) -> &VolumeDescriptor {
        self.catalog.descriptor()
    }

    pub fn level(&self) -> u32 {
        self.catalog.level()
    }

    pub fn level_count(&self) -> u32 {
        match &self.store {
            BrickStore::Memory { .. } => 1,
            BrickStore::Pyramid { reader, .. } => reader.level_count(),
        }
    }

    /// Y spacing of every level, finest first
    pub fn level_spacings(&self) -> Result<Vec<f32>> {
        match &self.store {
            BrickStore::Memory { data, .. } => Ok(vec![data.descriptor().spacing.y]),
            BrickStore::Pyramid { reader, .. } => (0..reader.level_count())
                .map(|l| reader.level_descriptor(l).map(|d| d.spacing.y))
                .collect(),
        }
    }

    pub fn is_streamed(&self) -> bool {
        matches!(self.store, BrickStore::Pyramid { .. })
    }

    pub fn skip_empty(&self) -> bool {
        self.skip_empty
    }

    /// Value mapped to full intensity
    pub fn max_value(&self) -> f32 {
        self.max_value
    }

    pub fn set_max_value(&mut self, max_value: f32) {
        self.max_value = max_value.max(1.0);
    }

    pub fn bounds(&self) -> Aabb {
        self.catalog.descriptor().world_bounds()
    }

    /// Uncompressed bytes of the current level
    pub fn data_size(&self) -> u64 {
        self.catalog.descriptor().byte_size()
    }

    pub fn key(&self, brick: BrickId) -> BrickKey {
        BrickKey::new(self.id, self.catalog.level(), brick)
    }

    /// Attach a selection mask with the same dimensions as the data
    pub fn set_mask(&mut self, mask: Arc<VolumeData>) -> Result<()> {
        self.attach(mask, Component::Mask)
    }

    /// Attach a label volume with the same dimensions as the data
    pub fn set_label(&mut self, label: Arc<VolumeData>) -> Result<()> {
        self.attach(label, Component::Label)
    }

    fn attach(&mut self, volume: Arc<VolumeData>, comp: Component) -> Result<()> {
        let BrickStore::Memory { data, mask, label } = &mut self.store else {
            return Err(Error::Streaming(format!("{:?} component needs an in-memory volume", comp)));
        };
        if volume.descriptor().dims != data.descriptor().dims {
            return Err(Error::Descriptor(format!(
                "{:?} dims {:?} do not match data {:?}",
                comp,
                volume.descriptor().dims,
                data.descriptor().dims
            )));
        }
        match comp {
            Component::Mask => *mask = Some(volume),
            _ => *label = Some(volume),
        }
        Ok(())
    }

    pub fn has_component(&self, comp: Component) -> bool {
        match (&self.store, comp) {
            (_, Component::Data) => true,
            (BrickStore::Memory { mask, .. }, Component::Mask) => mask.is_some(),
            (BrickStore::Memory { label, .. }, Component::Label) => label.is_some(),
            _ => false,
        }
    }

    /// Move a streamed volume to another pyramid level
    ///
    /// Returns true when the catalog was rebuilt.
    pub fn switch_level(&mut self, level: u32) -> Result<bool> {
        if level == self.catalog.level() {
            return Ok(false);
        }
        let BrickStore::Pyramid { reader, .. } = &self.store else {
            return Ok(false);
        };
        if level >= reader.level_count() {
            return Err(Error::Descriptor(format!("level {} out of range", level)));
        }
        self.catalog = pyramid_catalog(reader.as_ref(), self.id, level)?;
        log::debug!("Volume {:?} switched to level {} ({} bricks)", self.id, level, self.catalog.len());
        Ok(true)
    }

    /// Rebuild the catalog of an in-memory volume with a new layout
    pub fn rebrick(&mut self, layout: &BrickLayout) {
        if let BrickStore::Memory { data, .. } = &self.store {
            let mut catalog = BrickCatalog::build(self.id, 0, data.descriptor(), layout);
            if self.skip_empty {
                catalog.assign_priorities(data);
            }
            self.catalog = catalog;
            self.layout = *layout;
        }
    }

    pub fn layout(&self) -> &BrickLayout {
        &self.layout
    }

    /// Texture payload for one brick component
    ///
    /// `Ok(None)` means the bytes must be streamed from
    /// [`file_location`](Self::file_location).
    pub fn fetch(&self, brick: BrickId, comp: Component) -> Result<Option<BrickPayload>> {
        let b = self.brick(brick)?;
        match &self.store {
            BrickStore::Memory { data, mask, label } => {
                let source = match comp {
                    Component::Data => Some(data),
                    Component::Mask => mask.as_ref(),
                    Component::Label => label.as_ref(),
                    Component::Gradient => None,
                };
                let source = source.ok_or_else(|| {
                    Error::Streaming(format!("volume {:?} has no {:?} component", self.id, comp))
                })?;
                Ok(Some(source.extract(b.offset(), b.size())))
            }
            BrickStore::Pyramid { .. } if comp == Component::Data => Ok(None),
            BrickStore::Pyramid { .. } => Err(Error::Streaming(format!(
                "streamed volume {:?} has no {:?} component",
                self.id, comp
            ))),
        }
    }

    /// File range of a streamed brick at the current level
    pub fn file_location(&self, brick: BrickId) -> Result<Option<FileLocation>> {
        match &self.store {
            BrickStore::Memory { .. } => Ok(None),
            BrickStore::Pyramid { reader, frame, channel } => reader
                .brick_file_location(*frame, *channel, brick, self.catalog.level())
                .map(Some),
        }
    }

    fn brick(&self, id: BrickId) -> Result<&Brick> {
        self.catalog
            .get(id)
            .ok_or_else(|| Error::Streaming(format!("brick {:?} not in volume {:?}", id, self.id)))
    }

    /// Placement and shading inputs for drawing one resident brick
    pub fn brick_draw(&self, brick: &Brick, data: TextureHandle, mask: Option<TextureHandle>) -> BrickDraw {
        let desc = self.catalog.descriptor();
        BrickDraw {
            data,
            mask,
            dims: brick.size(),
            voxel_origin: desc.origin + brick.offset().as_vec3() * desc.spacing,
            spacing: desc.spacing,
            region: *brick.bbox(),
            max_value: self.max_value,
            filter: self.filter,
            transfer: self.transfer,
            mask_color: self.mask_color,
        }
    }
}

fn pyramid_catalog(reader: &dyn PyramidReader, id: VolumeId, level: u32) -> Result<BrickCatalog> {
    let desc = reader.level_descriptor(level)?;
    let bricks = reader.build_bricks(level)?;
    Ok(BrickCatalog::from_bricks(id, level, desc, bricks))
}
