//! Volume rendering: backends, renderers, compositing targets and overlays

pub mod backend;
pub mod software;
pub mod gpu;
pub mod program;
pub mod target;
pub mod transfer;
pub mod adjust;
pub mod mesh;
pub mod config;
pub mod view;
pub mod volume_renderer;
pub mod multi_volume;
pub mod overlay;

pub use backend::{
    BlendMode, BrickDraw, DrawParams, Filter, PeelWindow, RenderBackend, TargetFormat, TargetHandle, TextureHandle,
    Viewport, FAR_DEPTH,
};
pub use software::SoftwareBackend;
pub use gpu::WgpuBackend;
pub use program::{ProgramCache, ShaderKey};
pub use target::{RenderTargetKind, RenderTargetPool, TargetGuard};
pub use transfer::{Colormap, FogParams, MaskMode, RenderMode, ShadingParams, ShadowParams, TransferFunction};
pub use adjust::ColorAdjust;
pub use mesh::{BoxMesh, MeshImage, MeshSource};
pub use config::{GradientBackground, MixMethod, RenderConfig};
pub use view::FrameView;
pub use volume_renderer::{BrickResidency, PassTarget, VolumeRenderer};
pub use multi_volume::{MultiVolumeRenderer, Slab, SlabBrick};
pub use overlay::{Hud, OverlayKind, Overlays, Polyline};
