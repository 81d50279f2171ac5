//! Rendering backend abstraction
//!
//! Renderers talk to the device only through [`RenderBackend`]. Two
//! implementations exist: the CPU [`SoftwareBackend`](super::software::SoftwareBackend)
//! and the wgpu compute [`WgpuBackend`](super::gpu::WgpuBackend).

use serde::{Deserialize, Serialize};

use crate::core::Result;
use crate::core::types::{Mat4, UVec3, Vec3};
use crate::math::{Aabb, ClipPlanes};
use crate::volume::{BrickPayload, PassMode, TexelFormat};
use super::adjust::ColorAdjust;
use super::transfer::{FogParams, MaskMode, RenderMode, ShadingParams, ShadowParams, TransferFunction};

/// Brick texture owned by a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u64);

/// Offscreen color buffer owned by a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetHandle(pub u64);

/// Texture sampling filter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

/// Storage precision of an offscreen buffer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetFormat {
    Rgba8,
    Rgba16F,
    #[default]
    Rgba32F,
}

/// Pixel size of a render target
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn aspect(&self) -> f32 {
        self.width.max(1) as f32 / self.height.max(1) as f32
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// How a source buffer or slab result is combined with the destination
///
/// Colors are premultiplied by alpha.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlendMode {
    /// Source in front: `dst = src + (1 - src.a) * dst`
    Over,
    /// Source behind: `dst = dst + (1 - dst.a) * src`
    #[default]
    Under,
    /// Component-wise maximum
    Max,
    /// `dst.rgb *= src.rgb + (1 - src.a)`, alpha kept
    Multiply,
    /// Overwrite
    Replace,
    /// Component-wise sum, clamped to 1
    Add,
}

impl BlendMode {
    #[inline]
    pub fn apply(self, src: [f32; 4], dst: [f32; 4]) -> [f32; 4] {
        match self {
            BlendMode::Over => {
                let k = 1.0 - src[3];
                std::array::from_fn(|i| src[i] + k * dst[i])
            }
            BlendMode::Under => {
                let k = 1.0 - dst[3];
                std::array::from_fn(|i| dst[i] + k * src[i])
            }
            BlendMode::Max => std::array::from_fn(|i| src[i].max(dst[i])),
            BlendMode::Multiply => {
                let k = 1.0 - src[3];
                [dst[0] * (src[0] + k), dst[1] * (src[1] + k), dst[2] * (src[2] + k), dst[3]]
            }
            BlendMode::Replace => src,
            BlendMode::Add => std::array::from_fn(|i| (src[i] + dst[i]).min(1.0)),
        }
    }

    pub(crate) fn index(self) -> u32 {
        match self {
            BlendMode::Over => 0,
            BlendMode::Under => 1,
            BlendMode::Max => 2,
            BlendMode::Multiply => 3,
            BlendMode::Replace => 4,
            BlendMode::Add => 5,
        }
    }
}

/// Depth written where nothing was hit
pub const FAR_DEPTH: f32 = f32::MAX;

/// Depth interval a peeling pass may sample
///
/// Depth targets store ray distance in the red channel, `f32::MAX` where
/// nothing was hit. Samples at or in front of `near` and at or behind `far`
/// are skipped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeelWindow {
    pub near: Option<TargetHandle>,
    pub far: Option<TargetHandle>,
}

/// One brick's textures and placement for a draw call
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BrickDraw {
    pub data: TextureHandle,
    /// Mask or label component for the mask pass
    pub mask: Option<TextureHandle>,
    pub dims: UVec3,
    /// World position of the min corner of texel (0, 0, 0)
    pub voxel_origin: Vec3,
    pub spacing: Vec3,
    /// World region this brick is responsible for
    pub region: Aabb,
    /// Stored value mapped to intensity 1
    pub max_value: f32,
    pub filter: Filter,
    pub transfer: TransferFunction,
    pub mask_color: Vec3,
}

/// Uniform state for a draw call
#[derive(Clone, Debug, PartialEq)]
pub struct DrawParams {
    pub view_proj: Mat4,
    pub inv_view_proj: Mat4,
    /// World distance between samples
    pub step: f32,
    /// Step at which transfer-function opacities are defined
    pub base_step: f32,
    pub pass: PassMode,
    pub mode: RenderMode,
    pub mask_mode: MaskMode,
    pub shading: Option<ShadingParams>,
    /// Direction towards the light
    pub light_dir: Vec3,
    pub fog: Option<FogParams>,
    pub clip: ClipPlanes,
    pub peel: Option<PeelWindow>,
    pub blend: BlendMode,
}

/// Device operations needed by the renderers and the frame composer
pub trait RenderBackend {
    fn name(&self) -> &str;

    /// Largest 3D texture edge the device accepts
    fn max_texture_size(&self) -> u32;

    fn create_texture(&mut self, dims: UVec3, format: TexelFormat, filter: Filter) -> Result<TextureHandle>;

    fn upload_texture(&mut self, texture: TextureHandle, payload: &BrickPayload) -> Result<()>;

    fn destroy_texture(&mut self, texture: TextureHandle);

    fn create_target(&mut self, viewport: Viewport, format: TargetFormat) -> Result<TargetHandle>;

    /// Reallocate a target; its contents become undefined
    fn resize_target(&mut self, target: TargetHandle, viewport: Viewport) -> Result<()>;

    fn destroy_target(&mut self, target: TargetHandle);

    fn clear_target(&mut self, target: TargetHandle, color: [f32; 4]) -> Result<()>;

    /// Vertical gradient from `top` to `bottom`
    fn fill_gradient(&mut self, target: TargetHandle, top: [f32; 4], bottom: [f32; 4]) -> Result<()>;

    /// Overwrite a target with host pixels, row-major from the top
    fn write_target(&mut self, target: TargetHandle, pixels: &[[f32; 4]]) -> Result<()>;

    /// Ray-march a slab of bricks and blend the result into `target`
    ///
    /// All bricks are sampled on one shared grid of ray distances, so several
    /// bricks passed together are interleaved sample by sample.
    fn draw_bricks(&mut self, target: TargetHandle, bricks: &[BrickDraw], params: &DrawParams) -> Result<()>;

    /// World-space line segments blended over `target`
    fn draw_lines(&mut self, target: TargetHandle, lines: &[(Vec3, Vec3)], color: [f32; 4], view_proj: &Mat4) -> Result<()>;

    fn blend_target(&mut self, src: TargetHandle, dst: TargetHandle, mode: BlendMode) -> Result<()>;

    /// Darken `dst` where the depth in `depth` is occluded by nearer neighbours
    fn apply_shadow(&mut self, depth: TargetHandle, dst: TargetHandle, params: &ShadowParams) -> Result<()>;

    /// Color-adjust `source` into the window image
    fn present(&mut self, source: TargetHandle, adjust: &ColorAdjust) -> Result<()>;

    /// Solid rectangle on the window image, clipped to its bounds
    fn fill_window_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: [u8; 4]) -> Result<()>;

    fn read_target(&mut self, target: TargetHandle) -> Result<Vec<[f32; 4]>>;

    /// The last presented image
    fn read_window(&mut self) -> Result<(Viewport, Vec<[u8; 4]>)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_over_and_under_agree_on_order() {
        let front = [0.5, 0.0, 0.0, 0.5];
        let back = [0.0, 0.0, 0.8, 0.8];
        let over = BlendMode::Over.apply(front, BlendMode::Over.apply(back, [0.0; 4]));
        let under = BlendMode::Under.apply(back, BlendMode::Under.apply(front, [0.0; 4]));
        for i in 0..4 {
            assert!((over[i] - under[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_multiply_keeps_uncovered_pixels() {
        let dst = [0.6, 0.4, 0.2, 1.0];
        assert_eq!(BlendMode::Multiply.apply([0.0; 4], dst), dst);
        let shaded = BlendMode::Multiply.apply([0.5, 0.5, 0.5, 1.0], dst);
        assert_eq!(shaded, [0.3, 0.2, 0.1, 1.0]);
    }

    #[test]
    fn test_max_blend() {
        assert_eq!(
            BlendMode::Max.apply([0.1, 0.9, 0.2, 0.5], [0.3, 0.1, 0.2, 0.7]),
            [0.3, 0.9, 0.2, 0.7]
        );
    }

    #[test]
    fn test_viewport() {
        let vp = Viewport::new(40, 20);
        assert_eq!(vp.pixel_count(), 800);
        assert_eq!(vp.aspect(), 2.0);
        assert!(Viewport::new(0, 5).is_empty());
    }
}
