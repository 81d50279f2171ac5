//! Volstream - out-of-core brick streaming and volume rendering
//!
//! Volumes are split into bricks, kept resident on the GPU under a memory
//! budget and drawn progressively across host idle ticks.

pub mod core;
pub mod math;
pub mod volume;
pub mod streaming;
pub mod render;
pub mod canvas;
pub mod settings;

pub use canvas::{CanvasState, RenderCanvas, RendererContext};
pub use settings::Settings;
