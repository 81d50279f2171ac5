//! Mathematical utilities and data structures

pub mod aabb;
pub mod ray;
pub mod frustum;
pub mod clip;

pub use aabb::Aabb;
pub use ray::Ray;
pub use frustum::{Plane, test_against_view};
pub use clip::ClipPlanes;
