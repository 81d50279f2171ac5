//! Render canvases and the context they share

pub mod context;
pub mod frame;
pub mod render_canvas;

pub use context::RendererContext;
pub use frame::{FramePlan, PlanSpec};
pub use render_canvas::{CanvasState, RenderCanvas};
