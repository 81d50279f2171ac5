//! Scene overlays and heads-up display
//!
//! Overlays are world-space line sets drawn around the volume composite in a
//! fixed order. HUD elements are drawn on the presented window image.

use serde::{Deserialize, Serialize};

use crate::core::Result;
use crate::core::types::Vec3;
use crate::math::Aabb;
use super::backend::{RenderBackend, TargetHandle, Viewport};
use super::transfer::Colormap;
use super::view::FrameView;

/// Overlay slots in draw order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OverlayKind {
    ClipBackFaces,
    Volumes,
    ClipFrontFaces,
    Bounds,
    Annotations,
    Highlights,
    Traces,
    Rulers,
}

impl OverlayKind {
    pub const ORDER: [OverlayKind; 8] = [
        OverlayKind::ClipBackFaces,
        OverlayKind::Volumes,
        OverlayKind::ClipFrontFaces,
        OverlayKind::Bounds,
        OverlayKind::Annotations,
        OverlayKind::Highlights,
        OverlayKind::Traces,
        OverlayKind::Rulers,
    ];
}

/// Open polyline in world space
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Polyline {
    pub points: Vec<Vec3>,
    pub color: [f32; 4],
}

impl Polyline {
    pub fn segments(&self) -> Vec<(Vec3, Vec3)> {
        self.points.windows(2).map(|w| (w[0], w[1])).collect()
    }
}

/// Overlay content owned by a canvas
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Overlays {
    /// Clipping box drawn as face outlines
    pub clip_box: Option<Aabb>,
    pub clip_color: [f32; 4],
    pub bounds_color: [f32; 4],
    /// Half-size of an annotation cross in world units
    pub mark_size: f32,
    pub highlights: Vec<(Aabb, [f32; 4])>,
    pub traces: Vec<Polyline>,
    pub rulers: Vec<Polyline>,
}

impl Default for Overlays {
    fn default() -> Self {
        Self {
            clip_box: None,
            clip_color: [1.0, 1.0, 0.0, 0.6],
            bounds_color: [0.8, 0.8, 0.8, 1.0],
            mark_size: 0.02,
            highlights: Vec::new(),
            traces: Vec::new(),
            rulers: Vec::new(),
        }
    }
}

/// Scene-derived inputs for one overlay draw
#[derive(Clone, Debug, Default)]
pub struct OverlayScene {
    pub volume_bounds: Vec<Aabb>,
    pub show_bounds: bool,
    /// Annotation points with their colors
    pub annotations: Vec<(Vec3, Vec3)>,
}

impl Overlays {
    /// Draw one overlay slot; [`OverlayKind::Volumes`] is the caller's job
    pub fn draw(&self, backend: &mut dyn RenderBackend, target: TargetHandle, kind: OverlayKind, view: &FrameView, scene: &OverlayScene) -> Result<()> {
        let vp = &view.view_proj;
        match kind {
            OverlayKind::Volumes => Ok(()),
            OverlayKind::ClipBackFaces | OverlayKind::ClipFrontFaces => {
                let Some(clip) = &self.clip_box else { return Ok(()) };
                let (back, front) = clip_faces(clip, view);
                let lines = if kind == OverlayKind::ClipBackFaces { back } else { front };
                draw_if_any(backend, target, &lines, self.clip_color, vp)
            }
            OverlayKind::Bounds => {
                if !scene.show_bounds {
                    return Ok(());
                }
                let lines: Vec<_> = scene.volume_bounds.iter().flat_map(box_edges).collect();
                draw_if_any(backend, target, &lines, self.bounds_color, vp)
            }
            OverlayKind::Annotations => {
                for &(p, color) in &scene.annotations {
                    let lines = cross(p, self.mark_size);
                    backend.draw_lines(target, &lines, [color.x, color.y, color.z, 1.0], vp)?;
                }
                Ok(())
            }
            OverlayKind::Highlights => {
                for (bbox, color) in &self.highlights {
                    backend.draw_lines(target, &box_edges(bbox), *color, vp)?;
                }
                Ok(())
            }
            OverlayKind::Traces => draw_polylines(backend, target, &self.traces, vp),
            OverlayKind::Rulers => draw_polylines(backend, target, &self.rulers, vp),
        }
    }
}

fn draw_if_any(backend: &mut dyn RenderBackend, target: TargetHandle, lines: &[(Vec3, Vec3)], color: [f32; 4], vp: &crate::core::types::Mat4) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    backend.draw_lines(target, lines, color, vp)
}

fn draw_polylines(backend: &mut dyn RenderBackend, target: TargetHandle, lines: &[Polyline], vp: &crate::core::types::Mat4) -> Result<()> {
    for line in lines {
        draw_if_any(backend, target, &line.segments(), line.color, vp)?;
    }
    Ok(())
}

/// The twelve edges of a box
pub fn box_edges(b: &Aabb) -> Vec<(Vec3, Vec3)> {
    let c = b.corners();
    // corners() orders bits as x, y, z
    const EDGES: [(usize, usize); 12] = [
        (0, 1), (2, 3), (4, 5), (6, 7),
        (0, 2), (1, 3), (4, 6), (5, 7),
        (0, 4), (1, 5), (2, 6), (3, 7),
    ];
    EDGES.iter().map(|&(a, z)| (c[a], c[z])).collect()
}

/// Face outlines of a clipping box split into (back, front) by facing
pub fn clip_faces(b: &Aabb, view: &FrameView) -> (Vec<(Vec3, Vec3)>, Vec<(Vec3, Vec3)>) {
    let (lo, hi) = (b.min, b.max);
    let mut back = Vec::new();
    let mut front = Vec::new();
    for axis in 0..3 {
        for (side, normal_sign) in [(lo, -1.0f32), (hi, 1.0)] {
            let mut normal = Vec3::ZERO;
            normal[axis] = normal_sign;
            let (u, v) = ((axis + 1) % 3, (axis + 2) % 3);
            let mut quad = [Vec3::ZERO; 4];
            for (i, (su, sv)) in [(0, 0), (1, 0), (1, 1), (0, 1)].into_iter().enumerate() {
                let mut p = Vec3::ZERO;
                p[axis] = side[axis];
                p[u] = if su == 0 { lo[u] } else { hi[u] };
                p[v] = if sv == 0 { lo[v] } else { hi[v] };
                quad[i] = p;
            }
            let center = (quad[0] + quad[2]) * 0.5;
            let to_eye = if view.orthographic { -view.view_ray.direction } else { view.view_ray.origin - center };
            let edges = (0..4).map(|i| (quad[i], quad[(i + 1) % 4]));
            if normal.dot(to_eye) > 0.0 {
                front.extend(edges);
            } else {
                back.extend(edges);
            }
        }
    }
    (back, front)
}

fn cross(p: Vec3, size: f32) -> [(Vec3, Vec3); 3] {
    [
        (p - Vec3::X * size, p + Vec3::X * size),
        (p - Vec3::Y * size, p + Vec3::Y * size),
        (p - Vec3::Z * size, p + Vec3::Z * size),
    ]
}

/// Heads-up display elements drawn on the window image
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hud {
    pub legend: bool,
    /// World length of the scale bar; `None` hides it
    pub scale_bar: Option<f32>,
    pub colormap_key: Option<Colormap>,
    pub fps: bool,
}

impl Default for Hud {
    fn default() -> Self {
        Self { legend: true, scale_bar: None, colormap_key: None, fps: false }
    }
}

const MARGIN: u32 = 4;
const SWATCH: u32 = 8;

fn rgba8(c: Vec3) -> [u8; 4] {
    let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    [q(c.x), q(c.y), q(c.z), 255]
}

impl Hud {
    /// Draw every enabled element
    ///
    /// `legend` holds one color per displayed volume, `pixel_size` is the
    /// world size of one pixel at the focus distance.
    pub fn draw(&self, backend: &mut dyn RenderBackend, viewport: Viewport, legend: &[Vec3], pixel_size: f32, fps: f32) -> Result<()> {
        if viewport.is_empty() {
            return Ok(());
        }
        if self.legend {
            for (i, color) in legend.iter().enumerate() {
                let y = MARGIN + i as u32 * (SWATCH + 2);
                backend.fill_window_rect(MARGIN, y, SWATCH, SWATCH, rgba8(*color))?;
            }
        }
        if let Some(length) = self.scale_bar {
            let px = (length / pixel_size.max(f32::EPSILON)).round() as u32;
            let px = px.min(viewport.width.saturating_sub(2 * MARGIN));
            if px > 0 {
                let x = viewport.width.saturating_sub(MARGIN + px);
                let y = viewport.height.saturating_sub(MARGIN + 2);
                backend.fill_window_rect(x, y, px, 2, [255, 255, 255, 255])?;
            }
        }
        if let Some(map) = self.colormap_key {
            let rows = viewport.height.saturating_sub(3 * MARGIN + 8).min(64);
            let x = viewport.width.saturating_sub(MARGIN + SWATCH);
            for r in 0..rows {
                let t = 1.0 - r as f32 / rows.max(2).saturating_sub(1) as f32;
                backend.fill_window_rect(x, MARGIN + r, SWATCH, 1, rgba8(map.sample(t)))?;
            }
        }
        if self.fps {
            let width = (fps.max(0.0).round() as u32).min(120);
            backend.fill_window_rect(MARGIN, viewport.height.saturating_sub(MARGIN + 6), width.max(1), 2, [0, 255, 0, 255])?;
        }
        Ok(())
    }
}
