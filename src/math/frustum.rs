//! Planes and view-volume tests

use serde::{Deserialize, Serialize};

use crate::core::types::{Mat4, Vec3, Vec4};
use super::aabb::Aabb;

/// A plane defined by normal and distance from origin
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    pub fn new(normal: Vec3, distance: f32) -> Self {
        Self { normal, distance }
    }

    /// Plane through `point` facing along `normal`
    pub fn from_point_normal(point: Vec3, normal: Vec3) -> Self {
        let n = normal.normalize_or_zero();
        Self { normal: n, distance: -n.dot(point) }
    }

    /// Signed distance from point to plane (positive = in front)
    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }

    /// Packed as (nx, ny, nz, d) for shader uniforms
    pub fn to_vec4(&self) -> Vec4 {
        self.normal.extend(self.distance)
    }
}

/// Returns false when all 8 corners of `bbox` lie beyond the same clip-space face
///
/// Works in homogeneous clip space, so boxes straddling the eye are kept.
pub fn test_against_view(view_proj: &Mat4, bbox: &Aabb) -> bool {
    let mut outside = [true; 6];
    for corner in bbox.corners() {
        let c = *view_proj * corner.extend(1.0);
        outside[0] &= c.x > c.w;
        outside[1] &= c.x < -c.w;
        outside[2] &= c.y > c.w;
        outside[3] &= c.y < -c.w;
        outside[4] &= c.z > c.w;
        outside[5] &= c.z < 0.0;
    }
    !outside.iter().any(|&o| o)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_proj() -> Mat4 {
        let proj = Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        proj * view
    }

    #[test]
    fn test_plane_distance() {
        let plane = Plane::new(Vec3::Y, 0.0);
        assert_eq!(plane.distance_to_point(Vec3::new(0.0, 5.0, 0.0)), 5.0);
        assert_eq!(plane.distance_to_point(Vec3::new(0.0, -3.0, 0.0)), -3.0);
        let shifted = Plane::from_point_normal(Vec3::new(0.0, 2.0, 0.0), Vec3::Y);
        assert_eq!(shifted.distance_to_point(Vec3::new(0.0, 5.0, 0.0)), 3.0);
    }

    #[test]
    fn test_view_test_rejects_offscreen_box() {
        let vp = view_proj();
        let visible = Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5));
        let offscreen = Aabb::new(Vec3::new(2.0, -0.5, -0.5), Vec3::new(3.0, 0.5, 0.5));
        let straddling = Aabb::new(Vec3::new(0.5, -0.5, -0.5), Vec3::new(3.0, 0.5, 0.5));
        assert!(test_against_view(&vp, &visible));
        assert!(!test_against_view(&vp, &offscreen));
        assert!(test_against_view(&vp, &straddling));
    }
}
