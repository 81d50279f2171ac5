//! Axis-aligned bounding box

use serde::{Deserialize, Serialize};

use crate::core::types::Vec3;

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Get center point
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get size (max - min)
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Length of the main diagonal
    pub fn diagonal(&self) -> f32 {
        self.size().length()
    }

    /// True when any extent is zero, negative or NaN
    pub fn is_degenerate(&self) -> bool {
        let s = self.size();
        !(s.x > 0.0 && s.y > 0.0 && s.z > 0.0)
    }

    /// Check if point is inside AABB (closed on both ends)
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.x >= self.min.x && p.x <= self.max.x &&
        p.y >= self.min.y && p.y <= self.max.y &&
        p.z >= self.min.z && p.z <= self.max.z
    }

    /// Check if two AABBs intersect
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x && self.max.x >= other.min.x &&
        self.min.y <= other.max.y && self.max.y >= other.min.y &&
        self.min.z <= other.max.z && self.max.z >= other.min.z
    }

    /// Expand AABB to include point
    pub fn expand(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Return merged AABB containing both
    pub fn merged(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// The 8 corners; bit 0 selects x max, bit 1 y max, bit 2 z max
    pub fn corners(&self) -> [Vec3; 8] {
        std::array::from_fn(|i| {
            Vec3::new(
                if i & 1 != 0 { self.max.x } else { self.min.x },
                if i & 2 != 0 { self.max.y } else { self.min.y },
                if i & 4 != 0 { self.max.z } else { self.min.z },
            )
        })
    }

    /// Shrink every face towards the center by `amount`
    pub fn inset(&self, amount: f32) -> Aabb {
        let half = self.size() * 0.5;
        let d = Vec3::splat(amount).min(half);
        Aabb::new(self.min + d, self.max - d)
    }

    /// Distance from a point to the box surface, 0 inside
    pub fn distance_to_point(&self, p: Vec3) -> f32 {
        let d = (self.min - p).max(p - self.max).max(Vec3::ZERO);
        d.length()
    }

    /// Gap between two boxes, 0 when they touch or overlap
    pub fn distance(&self, other: &Aabb) -> f32 {
        let d = (self.min - other.max).max(other.min - self.max).max(Vec3::ZERO);
        d.length()
    }

    /// Map a point from normalized 0..1 box coordinates into this box
    pub fn lerp(&self, t: Vec3) -> Vec3 {
        self.min + self.size() * t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_and_accessors() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert_eq!(aabb.center(), Vec3::splat(0.5));
        assert_eq!(aabb.size(), Vec3::ONE);
        assert!((aabb.diagonal() - 3.0_f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate() {
        assert!(Aabb::new(Vec3::ZERO, Vec3::new(1.0, 0.0, 1.0)).is_degenerate());
        assert!(Aabb::default().is_degenerate());
        assert!(!Aabb::new(Vec3::ZERO, Vec3::ONE).is_degenerate());
    }

    #[test]
    fn test_intersects() {
        let a = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let b = Aabb::new(Vec3::splat(0.5), Vec3::splat(1.5));
        let c = Aabb::new(Vec3::splat(2.0), Vec3::splat(3.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_corners_cover_box() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::new(1.0, 2.0, 3.0));
        let corners = aabb.corners();
        assert_eq!(corners[0], Vec3::ZERO);
        assert_eq!(corners[7], Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(corners[5], Vec3::new(1.0, 0.0, 3.0));
    }

    #[test]
    fn test_inset_clamps_to_center() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let shrunk = aabb.inset(0.1);
        assert!((shrunk.min - Vec3::splat(0.1)).length() < 1e-6);
        let collapsed = aabb.inset(4.0);
        assert_eq!(collapsed.min, collapsed.max);
    }

    #[test]
    fn test_distances() {
        let a = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let b = Aabb::new(Vec3::new(3.0, 0.0, 0.0), Vec3::new(4.0, 1.0, 1.0));
        assert_eq!(a.distance(&b), 2.0);
        assert_eq!(a.distance_to_point(Vec3::splat(0.5)), 0.0);
        assert_eq!(a.distance_to_point(Vec3::new(0.5, 0.5, 3.0)), 2.0);
    }
}
