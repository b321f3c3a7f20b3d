use crate::aabb::Aabb;
use crate::ray::{triangle_intersects_aabb, Ray};
use glam::Vec3;

const LEAF_SIZE: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct Triangle {
    pub a: Vec3,
    pub b: Vec3,
    pub c: Vec3,
}

impl Triangle {
    pub fn new(a: Vec3, b: Vec3, c: Vec3) -> Self {
        Self { a, b, c }
    }

    fn bounds(&self) -> Aabb {
        Aabb::from_points([self.a, self.b, self.c])
    }

    fn centroid(&self) -> Vec3 {
        (self.a + self.b + self.c) / 3.0
    }
}

/// Internal node when `count == 0` (children at `left_first` and
/// `left_first + 1`), leaf otherwise (`count` triangles starting at
/// `left_first` in the index array).
#[derive(Debug, Clone, Copy)]
struct BvhNode {
    aabb: Aabb,
    left_first: u32,
    count: u32,
}

/// Bounding-volume hierarchy over a triangle soup, supporting box-overlap
/// and nearest-hit ray queries.
#[derive(Debug, Clone)]
pub struct Bvh {
    nodes: Vec<BvhNode>,
    indices: Vec<u32>,
    triangles: Vec<Triangle>,
}

impl Bvh {
    /// Build over the given triangles. Returns `None` for an empty soup;
    /// callers use that as their "no collision geometry" sentinel.
    pub fn build(triangles: Vec<Triangle>) -> Option<Bvh> {
        if triangles.is_empty() {
            return None;
        }
        let mut bvh = Bvh {
            nodes: Vec::with_capacity(triangles.len() * 2),
            indices: (0..triangles.len() as u32).collect(),
            triangles,
        };
        let count = bvh.indices.len() as u32;
        bvh.nodes.push(BvhNode {
            aabb: Aabb::empty(),
            left_first: 0,
            count,
        });
        bvh.update_node_bounds(0);
        bvh.subdivide(0);
        Some(bvh)
    }

    pub fn bounds(&self) -> Aabb {
        self.nodes[0].aabb
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    fn update_node_bounds(&mut self, node_idx: usize) {
        let node = self.nodes[node_idx];
        let mut aabb = Aabb::empty();
        for i in node.left_first..node.left_first + node.count {
            aabb = aabb.union(&self.triangles[self.indices[i as usize] as usize].bounds());
        }
        self.nodes[node_idx].aabb = aabb;
    }

    fn subdivide(&mut self, node_idx: usize) {
        let node = self.nodes[node_idx];
        if (node.count as usize) <= LEAF_SIZE {
            return;
        }

        // Median split on the longest centroid axis.
        let mut centroid_bounds = Aabb::empty();
        for i in node.left_first..node.left_first + node.count {
            centroid_bounds.grow(self.triangles[self.indices[i as usize] as usize].centroid());
        }
        let extent = centroid_bounds.max - centroid_bounds.min;
        let axis = if extent.x > extent.y && extent.x > extent.z {
            0
        } else if extent.y > extent.z {
            1
        } else {
            2
        };
        if extent[axis] < 1e-6 {
            return;
        }
        let split = centroid_bounds.center()[axis];

        let mut i = node.left_first as usize;
        let mut j = (node.left_first + node.count) as usize;
        while i < j {
            if self.triangles[self.indices[i] as usize].centroid()[axis] < split {
                i += 1;
            } else {
                j -= 1;
                self.indices.swap(i, j);
            }
        }

        let left_count = i as u32 - node.left_first;
        if left_count == 0 || left_count == node.count {
            return;
        }

        let left = self.nodes.len() as u32;
        self.nodes.push(BvhNode {
            aabb: Aabb::empty(),
            left_first: node.left_first,
            count: left_count,
        });
        self.nodes.push(BvhNode {
            aabb: Aabb::empty(),
            left_first: i as u32,
            count: node.count - left_count,
        });
        self.nodes[node_idx].left_first = left;
        self.nodes[node_idx].count = 0;

        self.update_node_bounds(left as usize);
        self.update_node_bounds(left as usize + 1);
        self.subdivide(left as usize);
        self.subdivide(left as usize + 1);
    }

    /// Whether any triangle overlaps the box.
    pub fn intersects_box(&self, aabb: &Aabb) -> bool {
        let mut stack = vec![0usize];
        while let Some(node_idx) = stack.pop() {
            let node = self.nodes[node_idx];
            if !node.aabb.intersects(aabb) {
                continue;
            }
            if node.count > 0 {
                for i in node.left_first..node.left_first + node.count {
                    let tri = &self.triangles[self.indices[i as usize] as usize];
                    if triangle_intersects_aabb(aabb, tri.a, tri.b, tri.c) {
                        return true;
                    }
                }
            } else {
                stack.push(node.left_first as usize);
                stack.push(node.left_first as usize + 1);
            }
        }
        false
    }

    /// Nearest hit along the ray within `max_dist`, if any.
    pub fn raycast(&self, ray: &Ray, max_dist: f32) -> Option<f32> {
        let mut nearest: Option<f32> = None;
        let mut stack = vec![0usize];
        while let Some(node_idx) = stack.pop() {
            let node = self.nodes[node_idx];
            match ray.intersect_aabb(&node.aabb) {
                Some(t) if t <= nearest.unwrap_or(max_dist) => {}
                _ => continue,
            }
            if node.count > 0 {
                for i in node.left_first..node.left_first + node.count {
                    let tri = &self.triangles[self.indices[i as usize] as usize];
                    if let Some(t) = ray.intersect_triangle(tri.a, tri.b, tri.c) {
                        if t <= max_dist && t < nearest.unwrap_or(f32::INFINITY) {
                            nearest = Some(t);
                        }
                    }
                }
            } else {
                stack.push(node.left_first as usize);
                stack.push(node.left_first as usize + 1);
            }
        }
        nearest
    }
}

/// A quad split into two triangles, a convenience for tests and simple
/// geometry.
pub fn quad(a: Vec3, b: Vec3, c: Vec3, d: Vec3) -> [Triangle; 2] {
    [Triangle::new(a, b, c), Triangle::new(a, c, d)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floor_bvh(y: f32, half: f32) -> Bvh {
        let tris = quad(
            Vec3::new(-half, y, -half),
            Vec3::new(half, y, -half),
            Vec3::new(half, y, half),
            Vec3::new(-half, y, half),
        );
        Bvh::build(tris.to_vec()).unwrap()
    }

    #[test]
    fn test_empty_build_is_none() {
        assert!(Bvh::build(Vec::new()).is_none());
    }

    #[test]
    fn test_raycast_floor() {
        let bvh = floor_bvh(0.0, 10.0);
        let hit = bvh.raycast(&Ray::down(Vec3::new(1.0, 2.0, 1.0)), 5.0);
        assert!((hit.unwrap() - 2.0).abs() < 1e-5);
        assert!(bvh.raycast(&Ray::down(Vec3::new(1.0, 2.0, 1.0)), 1.0).is_none());
        assert!(bvh.raycast(&Ray::down(Vec3::new(50.0, 2.0, 1.0)), 5.0).is_none());
    }

    #[test]
    fn test_box_overlap() {
        let bvh = floor_bvh(0.0, 10.0);
        let touching = Aabb::new(Vec3::new(-1.0, -0.5, -1.0), Vec3::new(1.0, 0.5, 1.0));
        let above = Aabb::new(Vec3::new(-1.0, 0.5, -1.0), Vec3::new(1.0, 1.5, 1.0));
        assert!(bvh.intersects_box(&touching));
        assert!(!bvh.intersects_box(&above));
    }

    #[test]
    fn test_many_triangles_nearest() {
        // Stacked floors; the ray must report the closest one.
        let mut tris = Vec::new();
        for level in 0..20 {
            tris.extend(quad(
                Vec3::new(-5.0, level as f32, -5.0),
                Vec3::new(5.0, level as f32, -5.0),
                Vec3::new(5.0, level as f32, 5.0),
                Vec3::new(-5.0, level as f32, 5.0),
            ));
        }
        let bvh = Bvh::build(tris).unwrap();
        let hit = bvh.raycast(&Ray::down(Vec3::new(0.0, 25.0, 0.0)), 100.0);
        assert!((hit.unwrap() - 6.0).abs() < 1e-4);
    }
}
