//! Per-frame view state shared by the renderers

use crate::core::Camera;
use crate::core::types::{Mat4, Vec3};
use crate::math::{Aabb, Ray, test_against_view};
use crate::volume::UpdateOrder;
use super::backend::{BlendMode, Viewport};
use super::transfer::FogParams;

/// Camera matrices and frame-wide settings for one frame
#[derive(Clone, Debug, PartialEq)]
pub struct FrameView {
    pub camera: Camera,
    pub viewport: Viewport,
    pub view_proj: Mat4,
    pub inv_view_proj: Mat4,
    /// Eye ray along the view direction, used for brick ordering
    pub view_ray: Ray,
    pub orthographic: bool,
    pub order: UpdateOrder,
    /// Samples per voxel after adaptive scaling
    pub sample_rate: f32,
    pub light_dir: Vec3,
    pub fog: Option<FogParams>,
    pub interactive: bool,
}

impl FrameView {
    /// View for `camera` with its aspect matched to `viewport`
    pub fn new(camera: &Camera, viewport: Viewport, order: UpdateOrder) -> Self {
        let mut camera = *camera;
        camera.aspect = viewport.aspect();
        let view_proj = camera.view_projection();
        Self {
            camera,
            viewport,
            view_proj,
            inv_view_proj: view_proj.inverse(),
            view_ray: camera.view_ray(),
            orthographic: camera.is_orthographic(),
            order,
            sample_rate: 1.0,
            light_dir: Vec3::Z,
            fog: None,
            interactive: false,
        }
    }

    /// Blend operator matching the brick order
    pub fn blend(&self) -> BlendMode {
        match self.order {
            UpdateOrder::FrontToBack => BlendMode::Under,
            UpdateOrder::BackToFront => BlendMode::Over,
        }
    }

    /// False when the box lies entirely outside the view frustum
    pub fn sees(&self, bbox: &Aabb) -> bool {
        test_against_view(&self.view_proj, bbox)
    }

    /// Depth cue spanning the scene bounds along the view
    ///
    /// Distances are measured from the near plane, like the ray-march parameter.
    pub fn fog_for(&self, bounds: &Aabb, intensity: f32) -> Option<FogParams> {
        if intensity <= 0.0 || bounds.is_degenerate() {
            return None;
        }
        let (start, end) = self.depth_range(bounds);
        let near = self.camera.near;
        Some(FogParams {
            intensity,
            start: (start - near).max(0.0),
            end: (end - near).max(0.0),
        })
    }

    /// Nearest and farthest corner of `bbox` along the view
    pub fn depth_range(&self, bbox: &Aabb) -> (f32, f32) {
        bbox.corners().iter().fold((f32::MAX, f32::MIN), |(lo, hi), &c| {
            let d = if self.orthographic {
                self.view_ray.depth_of(c)
            } else {
                c.distance(self.view_ray.origin)
            };
            (lo.min(d), hi.max(d))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aspect_follows_viewport() {
        let view = FrameView::new(&Camera::default(), Viewport::new(200, 100), UpdateOrder::FrontToBack);
        assert_eq!(view.camera.aspect, 2.0);
        assert_eq!(view.blend(), BlendMode::Under);
        let back = FrameView::new(&Camera::default(), Viewport::new(1, 1), UpdateOrder::BackToFront);
        assert_eq!(back.blend(), BlendMode::Over);
    }

    #[test]
    fn test_fog_spans_bounds() {
        let camera = Camera::orthographic(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y, 1.0);
        let view = FrameView::new(&camera, Viewport::new(4, 4), UpdateOrder::FrontToBack);
        let bounds = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let fog = view.fog_for(&bounds, 0.5).unwrap();
        assert!((fog.start - (4.0 - camera.near)).abs() < 1e-4);
        assert!((fog.end - (6.0 - camera.near)).abs() < 1e-4);
        assert!(view.fog_for(&bounds, 0.0).is_none());
    }

    #[test]
    fn test_frustum_visibility() {
        let view = FrameView::new(&Camera::default(), Viewport::new(4, 4), UpdateOrder::FrontToBack);
        assert!(view.sees(&Aabb::new(Vec3::splat(-0.1), Vec3::splat(0.1))));
        assert!(!view.sees(&Aabb::new(Vec3::new(100.0, 0.0, 0.0), Vec3::new(101.0, 1.0, 1.0))));
    }
}
