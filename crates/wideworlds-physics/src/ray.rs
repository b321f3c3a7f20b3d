use crate::aabb::Aabb;
use glam::{Mat4, Vec3};

/// A ray with unnormalized direction allowed; reported distances are in
/// multiples of the direction length.
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Vec3,
    pub dir: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, dir: Vec3) -> Self {
        Self { origin, dir }
    }

    pub fn down(origin: Vec3) -> Self {
        Self {
            origin,
            dir: Vec3::NEG_Y,
        }
    }

    pub fn transformed(&self, mat: &Mat4) -> Ray {
        Ray {
            origin: mat.transform_point3(self.origin),
            dir: mat.transform_vector3(self.dir),
        }
    }

    /// Slab test. Returns the entry distance (clamped to 0 when the
    /// origin is inside).
    pub fn intersect_aabb(&self, aabb: &Aabb) -> Option<f32> {
        let inv = self.dir.recip();
        let t1 = (aabb.min - self.origin) * inv;
        let t2 = (aabb.max - self.origin) * inv;
        let tmin = t1.min(t2);
        let tmax = t1.max(t2);
        let near = tmin.x.max(tmin.y).max(tmin.z);
        let far = tmax.x.min(tmax.y).min(tmax.z);
        if far >= near && far >= 0.0 {
            Some(near.max(0.0))
        } else {
            None
        }
    }

    /// Moeller-Trumbore, double-sided.
    pub fn intersect_triangle(&self, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
        const EPS: f32 = 1e-7;
        let ab = b - a;
        let ac = c - a;
        let p = self.dir.cross(ac);
        let det = ab.dot(p);
        if det.abs() < EPS {
            return None;
        }
        let inv_det = 1.0 / det;
        let s = self.origin - a;
        let u = s.dot(p) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }
        let q = s.cross(ab);
        let v = self.dir.dot(q) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }
        let t = ac.dot(q) * inv_det;
        if t >= 0.0 {
            Some(t)
        } else {
            None
        }
    }
}

/// Triangle/box separating-axis test: the three box axes, the triangle
/// plane, and the nine edge cross products.
pub fn triangle_intersects_aabb(aabb: &Aabb, a: Vec3, b: Vec3, c: Vec3) -> bool {
    let center = aabb.center();
    let h = aabb.half_extents();
    let v0 = a - center;
    let v1 = b - center;
    let v2 = c - center;

    let e0 = v1 - v0;
    let e1 = v2 - v1;
    let e2 = v0 - v2;

    // Box axes: the triangle's AABB against the box.
    for axis in 0..3 {
        let (min, max) = min_max(v0[axis], v1[axis], v2[axis]);
        if min > h[axis] || max < -h[axis] {
            return false;
        }
    }

    // Triangle plane.
    let normal = e0.cross(e1);
    let d = normal.dot(v0);
    let r = h.x * normal.x.abs() + h.y * normal.y.abs() + h.z * normal.z.abs();
    if d.abs() > r {
        return false;
    }

    // Edge cross products.
    for edge in [e0, e1, e2] {
        for axis in 0..3 {
            let mut dir = Vec3::ZERO;
            dir[axis] = 1.0;
            let sep = edge.cross(dir);
            if sep.length_squared() < 1e-12 {
                continue;
            }
            let p0 = sep.dot(v0);
            let p1 = sep.dot(v1);
            let p2 = sep.dot(v2);
            let (min, max) = min_max(p0, p1, p2);
            let r = h.x * sep.x.abs() + h.y * sep.y.abs() + h.z * sep.z.abs();
            if min > r || max < -r {
                return false;
            }
        }
    }

    true
}

fn min_max(a: f32, b: f32, c: f32) -> (f32, f32) {
    (a.min(b).min(c), a.max(b).max(c))
}
