//! World-space clipping planes

use serde::{Deserialize, Serialize};

use crate::core::types::{Vec3, Vec4};
use super::aabb::Aabb;
use super::frustum::Plane;

/// Up to six half-spaces; a point is kept when it is in front of every plane
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipPlanes {
    planes: Vec<Plane>,
}

impl ClipPlanes {
    pub const MAX: usize = 6;

    /// No clipping
    pub fn none() -> Self {
        Self::default()
    }

    /// Six planes bounding an axis-aligned box, normals pointing inward
    pub fn from_box(bounds: &Aabb) -> Self {
        let planes = vec![
            Plane::from_point_normal(bounds.min, Vec3::X),
            Plane::from_point_normal(bounds.max, -Vec3::X),
            Plane::from_point_normal(bounds.min, Vec3::Y),
            Plane::from_point_normal(bounds.max, -Vec3::Y),
            Plane::from_point_normal(bounds.min, Vec3::Z),
            Plane::from_point_normal(bounds.max, -Vec3::Z),
        ];
        Self { planes }
    }

    /// Add a plane; planes past the sixth are ignored
    pub fn push(&mut self, plane: Plane) -> bool {
        if self.planes.len() >= Self::MAX {
            log::warn!("Ignoring clip plane beyond the {} supported", Self::MAX);
            return false;
        }
        self.planes.push(plane);
        true
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    /// True when the point survives every plane
    pub fn contains(&self, point: Vec3) -> bool {
        self.planes.iter().all(|p| p.distance_to_point(point) >= 0.0)
    }

    /// True when the whole box lies behind at least one plane
    pub fn rejects(&self, bbox: &Aabb) -> bool {
        self.planes.iter().any(|plane| {
            bbox.corners()
                .iter()
                .all(|&c| plane.distance_to_point(c) < 0.0)
        })
    }

    /// Fixed-size uniform layout; unused slots never clip
    pub fn to_uniform(&self) -> [Vec4; 6] {
        let mut out = [Vec4::new(0.0, 0.0, 0.0, 1.0); 6];
        for (slot, plane) in out.iter_mut().zip(&self.planes) {
            *slot = plane.to_vec4();
        }
        out
    }
}
