use glam::Vec3;
use wideworlds_physics::Aabb;

/// A named run of indices inside a geometry, in index units (multiples
/// of three).
#[derive(Debug, Clone, PartialEq)]
pub struct FaceGroup {
    pub name: String,
    pub start: usize,
    pub count: usize,
}

/// CPU-side triangle geometry. The rendering backend consumes this
/// through its own handles; the runtime only needs positions, indices
/// and named face groups.
#[derive(Debug, Clone, Default)]
pub struct Geometry {
    pub positions: Vec<Vec3>,
    pub indices: Vec<u32>,
    pub groups: Vec<FaceGroup>,
}

impl Geometry {
    pub fn new(positions: Vec<Vec3>, indices: Vec<u32>) -> Self {
        Self {
            positions,
            indices,
            groups: Vec::new(),
        }
    }

    pub fn with_groups(positions: Vec<Vec3>, indices: Vec<u32>, groups: Vec<FaceGroup>) -> Self {
        Self {
            positions,
            indices,
            groups,
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn triangles(&self) -> impl Iterator<Item = [Vec3; 3]> + '_ {
        self.indices.chunks_exact(3).map(move |tri| {
            [
                self.positions[tri[0] as usize],
                self.positions[tri[1] as usize],
                self.positions[tri[2] as usize],
            ]
        })
    }

    pub fn group(&self, name: &str) -> Option<&FaceGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Triangles restricted to one named face group.
    pub fn group_triangles<'a>(&'a self, name: &str) -> impl Iterator<Item = [Vec3; 3]> + 'a {
        let range = self
            .group(name)
            .map(|g| g.start..g.start + g.count)
            .unwrap_or(0..0);
        self.indices[range].chunks_exact(3).map(move |tri| {
            [
                self.positions[tri[0] as usize],
                self.positions[tri[1] as usize],
                self.positions[tri[2] as usize],
            ]
        })
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(self.positions.iter().copied())
    }
}

/// An axis-aligned unit box centered on the origin, scaled to the given
/// half extents. Stand-in geometry for tests and placeholder models.
pub fn box_geometry(half: Vec3) -> Geometry {
    let p = |x: f32, y: f32, z: f32| Vec3::new(x * half.x, y * half.y, z * half.z);
    let positions = vec![
        p(-1.0, -1.0, -1.0),
        p(1.0, -1.0, -1.0),
        p(1.0, 1.0, -1.0),
        p(-1.0, 1.0, -1.0),
        p(-1.0, -1.0, 1.0),
        p(1.0, -1.0, 1.0),
        p(1.0, 1.0, 1.0),
        p(-1.0, 1.0, 1.0),
    ];
    let indices = vec![
        0, 1, 2, 0, 2, 3, // back
        5, 4, 7, 5, 7, 6, // front
        4, 0, 3, 4, 3, 7, // left
        1, 5, 6, 1, 6, 2, // right
        3, 2, 6, 3, 6, 7, // top
        4, 5, 1, 4, 1, 0, // bottom
    ];
    Geometry::new(positions, indices)
}
