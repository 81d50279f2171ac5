//! Pool of named offscreen render targets
//!
//! Targets are keyed by [`RenderTargetKind`] and reused across frames. A
//! viewport change only marks them stale; the next [`RenderTargetPool::acquire`]
//! reallocates. A target held by a [`TargetGuard`] is never resized or
//! destroyed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::core::{Error, Result};
use super::backend::{RenderBackend, TargetFormat, TargetHandle, Viewport};

/// Role of an offscreen buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RenderTargetKind {
    /// Per-channel accumulation
    Channel,
    /// Fully composited frame
    Final,
    /// Color of one depth-peeling layer
    PeelLayer(u32),
    /// Ray depth at which a peeling layer ended
    PeelDepth(u32),
    /// Mesh surface color of one depth-peeling layer
    MeshLayer(u32),
    /// First-hit depth for the shadow pass
    Shadow,
    Temporary,
    VrLeft,
    VrRight,
}

struct PoolEntry {
    handle: TargetHandle,
    format: TargetFormat,
    viewport: Viewport,
    guards: Arc<AtomicU32>,
}

impl PoolEntry {
    fn is_protected(&self) -> bool {
        self.guards.load(Ordering::Acquire) > 0
    }
}

/// Keeps a target from being resized or destroyed while alive
#[derive(Debug)]
pub struct TargetGuard {
    kind: RenderTargetKind,
    handle: TargetHandle,
    count: Arc<AtomicU32>,
}

impl TargetGuard {
    pub fn kind(&self) -> RenderTargetKind {
        self.kind
    }

    pub fn handle(&self) -> TargetHandle {
        self.handle
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
pub struct RenderTargetPool {
    entries: HashMap<RenderTargetKind, PoolEntry>,
    viewport: Viewport,
}

impl RenderTargetPool {
    pub fn new(viewport: Viewport) -> Self {
        Self { entries: HashMap::new(), viewport }
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Change the size every target should have; returns true when it changed
    pub fn set_viewport(&mut self, viewport: Viewport) -> bool {
        if viewport == self.viewport {
            return false;
        }
        log::debug!("Render targets marked for resize {:?} -> {:?}", self.viewport, viewport);
        self.viewport = viewport;
        true
    }

    /// Handle for `kind`, allocated or resized to the pool's viewport and `format`
    pub fn acquire(&mut self, backend: &mut dyn RenderBackend, kind: RenderTargetKind, format: TargetFormat) -> Result<TargetHandle> {
        let viewport = self.viewport;
        if let Some(entry) = self.entries.get_mut(&kind) {
            if entry.viewport == viewport && entry.format == format {
                return Ok(entry.handle);
            }
            if entry.is_protected() {
                return Err(Error::Render(format!("render target {:?} is in use and cannot be reallocated", kind)));
            }
            if entry.format == format {
                backend.resize_target(entry.handle, viewport)?;
                entry.viewport = viewport;
                return Ok(entry.handle);
            }
            backend.destroy_target(entry.handle);
            self.entries.remove(&kind);
        }
        let handle = backend.create_target(viewport, format)?;
        self.entries.insert(kind, PoolEntry { handle, format, viewport, guards: Arc::new(AtomicU32::new(0)) });
        Ok(handle)
    }

    /// Guard an allocated target for the rest of a frame
    pub fn protect(&self, kind: RenderTargetKind) -> Option<TargetGuard> {
        let entry = self.entries.get(&kind)?;
        entry.guards.fetch_add(1, Ordering::AcqRel);
        Some(TargetGuard { kind, handle: entry.handle, count: entry.guards.clone() })
    }

    pub fn is_protected(&self, kind: RenderTargetKind) -> bool {
        self.entries.get(&kind).is_some_and(PoolEntry::is_protected)
    }

    pub fn handle(&self, kind: RenderTargetKind) -> Option<TargetHandle> {
        self.entries.get(&kind).map(|e| e.handle)
    }

    /// True when the target exists at the current viewport size
    pub fn is_current(&self, kind: RenderTargetKind) -> bool {
        self.entries.get(&kind).is_some_and(|e| e.viewport == self.viewport)
    }

    /// Destroy one target unless it is guarded
    pub fn release(&mut self, backend: &mut dyn RenderBackend, kind: RenderTargetKind) -> bool {
        match self.entries.get(&kind) {
            Some(entry) if !entry.is_protected() => {
                backend.destroy_target(entry.handle);
                self.entries.remove(&kind);
                true
            }
            _ => false,
        }
    }

    /// Destroy every unguarded target, returning how many were destroyed
    pub fn clear(&mut self, backend: &mut dyn RenderBackend) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            if entry.is_protected() {
                true
            } else {
                backend.destroy_target(entry.handle);
                false
            }
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::software::SoftwareBackend;

    #[test]
    fn test_acquire_reuses_target() {
        let mut backend = SoftwareBackend::new();
        let mut pool = RenderTargetPool::new(Viewport::new(8, 8));
        let a = pool.acquire(&mut backend, RenderTargetKind::Final, TargetFormat::Rgba32F).unwrap();
        let b = pool.acquire(&mut backend, RenderTargetKind::Final, TargetFormat::Rgba32F).unwrap();
        assert_eq!(a, b);
        let peel = pool.acquire(&mut backend, RenderTargetKind::PeelLayer(1), TargetFormat::Rgba32F).unwrap();
        assert_ne!(a, peel);
        assert_eq!(backend.target_count(), 2);
    }

    #[test]
    fn test_resize_is_lazy() {
        let mut backend = SoftwareBackend::new();
        let mut pool = RenderTargetPool::new(Viewport::new(4, 4));
        let h = pool.acquire(&mut backend, RenderTargetKind::Channel, TargetFormat::Rgba32F).unwrap();
        assert!(pool.set_viewport(Viewport::new(6, 2)));
        assert!(!pool.is_current(RenderTargetKind::Channel));
        assert_eq!(backend.read_target(h).unwrap().len(), 16);

        let h2 = pool.acquire(&mut backend, RenderTargetKind::Channel, TargetFormat::Rgba32F).unwrap();
        assert_eq!(h, h2);
        assert_eq!(backend.read_target(h).unwrap().len(), 12);
    }

    #[test]
    fn test_guard_blocks_resize_and_release() {
        let mut backend = SoftwareBackend::new();
        let mut pool = RenderTargetPool::new(Viewport::new(4, 4));
        pool.acquire(&mut backend, RenderTargetKind::Final, TargetFormat::Rgba32F).unwrap();
        let guard = pool.protect(RenderTargetKind::Final).unwrap();
        pool.set_viewport(Viewport::new(8, 8));
        assert!(pool.acquire(&mut backend, RenderTargetKind::Final, TargetFormat::Rgba32F).is_err());
        assert!(!pool.release(&mut backend, RenderTargetKind::Final));

        drop(guard);
        assert!(!pool.is_protected(RenderTargetKind::Final));
        assert!(pool.acquire(&mut backend, RenderTargetKind::Final, TargetFormat::Rgba32F).is_ok());
        assert!(pool.release(&mut backend, RenderTargetKind::Final));
        assert_eq!(backend.target_count(), 0);
    }

    #[test]
    fn test_format_change_recreates() {
        let mut backend = SoftwareBackend::new();
        let mut pool = RenderTargetPool::new(Viewport::new(2, 2));
        let a = pool.acquire(&mut backend, RenderTargetKind::Temporary, TargetFormat::Rgba32F).unwrap();
        let b = pool.acquire(&mut backend, RenderTargetKind::Temporary, TargetFormat::Rgba8).unwrap();
        assert_ne!(a, b);
        assert_eq!(backend.target_count(), 1);
        pool.clear(&mut backend);
        assert!(pool.is_empty());
    }
}
