//! wgpu compute backend

mod backend;
mod context;
mod kernels;

pub use backend::WgpuBackend;
pub use context::GpuContext;
