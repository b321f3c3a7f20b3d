pub mod aabb;
pub mod bvh;
pub mod collider;
pub mod ray;

pub use aabb::*;
pub use bvh::*;
pub use collider::*;
pub use ray::*;
