use crate::page::{PageError, TerrainPageData};
use glam::Vec3;
use wideworlds_scene::{FaceGroup, Geometry};
use wideworlds_types::PAGE_POINT_SPACING;

const SPACING: f32 = PAGE_POINT_SPACING as f32;

/// Wireframe-and-points overlay built over the shared vertex grid; shown
/// by the terrain editor, never collided against.
#[derive(Debug, Clone, Default)]
pub struct OverlayGeometry {
    pub positions: Vec<Vec3>,
    pub segments: Vec<[u32; 2]>,
}

fn local(i: usize, diameter: usize) -> f32 {
    (i as f32 - diameter as f32 / 2.0) * SPACING
}

/// Build the textured terrain mesh for one page. Every quad gets four
/// independent vertices so its texture coordinates stay in [0, 1];
/// quads whose texel is a hole are skipped.
pub fn build_terrain_mesh(data: &TerrainPageData, diameter: usize) -> Result<Geometry, PageError> {
    data.validate(diameter)?;
    let mut positions = Vec::new();
    let mut indices = Vec::new();

    for z in 0..diameter - 1 {
        for x in 0..diameter - 1 {
            if !data.texel_at(x, z, diameter).is_enabled() {
                continue;
            }
            let base = positions.len() as u32;
            positions.push(Vec3::new(local(x, diameter), data.height_at(x, z, diameter), local(z, diameter)));
            positions.push(Vec3::new(local(x + 1, diameter), data.height_at(x + 1, z, diameter), local(z, diameter)));
            positions.push(Vec3::new(local(x + 1, diameter), data.height_at(x + 1, z + 1, diameter), local(z + 1, diameter)));
            positions.push(Vec3::new(local(x, diameter), data.height_at(x, z + 1, diameter), local(z + 1, diameter)));
            indices.extend([base, base + 2, base + 1, base, base + 3, base + 2]);
        }
    }

    let count = indices.len();
    Ok(Geometry::with_groups(
        positions,
        indices,
        vec![FaceGroup {
            name: "surface".into(),
            start: 0,
            count,
        }],
    ))
}

/// Build the edit overlay: one shared vertex per grid point, a segment
/// per grid edge.
pub fn build_terrain_overlay(
    data: &TerrainPageData,
    diameter: usize,
) -> Result<OverlayGeometry, PageError> {
    data.validate(diameter)?;
    let mut overlay = OverlayGeometry::default();
    for z in 0..diameter {
        for x in 0..diameter {
            overlay.positions.push(Vec3::new(
                local(x, diameter),
                data.height_at(x, z, diameter),
                local(z, diameter),
            ));
        }
    }
    let idx = |x: usize, z: usize| (z * diameter + x) as u32;
    for z in 0..diameter {
        for x in 0..diameter {
            if x + 1 < diameter {
                overlay.segments.push([idx(x, z), idx(x + 1, z)]);
            }
            if z + 1 < diameter {
                overlay.segments.push([idx(x, z), idx(x, z + 1)]);
            }
        }
    }
    Ok(overlay)
}

/// Build one water page: a single plane with top and bottom face groups
/// sharing one vertex array. The node's Y carries the animated level.
pub fn build_water_mesh(diameter: usize) -> Geometry {
    let half = diameter as f32 * SPACING / 2.0;
    let positions = vec![
        Vec3::new(-half, 0.0, -half),
        Vec3::new(half, 0.0, -half),
        Vec3::new(half, 0.0, half),
        Vec3::new(-half, 0.0, half),
    ];
    let indices = vec![
        0, 2, 1, 0, 3, 2, // top, facing up
        0, 1, 2, 0, 2, 3, // bottom, facing down
    ];
    Geometry::with_groups(
        positions,
        indices,
        vec![
            FaceGroup {
                name: "top".into(),
                start: 0,
                count: 6,
            },
            FaceGroup {
                name: "bottom".into(),
                start: 6,
                count: 6,
            },
        ],
    )
}

/// Build the strip closing the seams toward the east (+x) and south (+z)
/// neighbors, using their first row or column of elevations. Called
/// again whenever a neighbor arrives; the page node replaces its
/// previous strip object.
pub fn stitch_page_edges(
    center: &TerrainPageData,
    east: Option<&TerrainPageData>,
    south: Option<&TerrainPageData>,
    southeast: Option<&TerrainPageData>,
    diameter: usize,
) -> Result<Geometry, PageError> {
    center.validate(diameter)?;
    let d = diameter;
    let far = local(d, d); // one spacing past the page's own last column
    let mut positions = Vec::new();
    let mut indices = Vec::new();

    let mut quad = |a: Vec3, b: Vec3, c: Vec3, e: Vec3| {
        let base = positions.len() as u32;
        positions.extend([a, b, c, e]);
        indices.extend([base, base + 2, base + 1, base, base + 3, base + 2]);
    };

    if let Some(east) = east {
        east.validate(d)?;
        for z in 0..d - 1 {
            if !center.texel_at(d - 1, z, d).is_enabled() {
                continue;
            }
            quad(
                Vec3::new(local(d - 1, d), center.height_at(d - 1, z, d), local(z, d)),
                Vec3::new(far, east.height_at(0, z, d), local(z, d)),
                Vec3::new(far, east.height_at(0, z + 1, d), local(z + 1, d)),
                Vec3::new(local(d - 1, d), center.height_at(d - 1, z + 1, d), local(z + 1, d)),
            );
        }
    }

    if let Some(south) = south {
        south.validate(d)?;
        for x in 0..d - 1 {
            if !center.texel_at(x, d - 1, d).is_enabled() {
                continue;
            }
            quad(
                Vec3::new(local(x, d), center.height_at(x, d - 1, d), local(d - 1, d)),
                Vec3::new(local(x + 1, d), center.height_at(x + 1, d - 1, d), local(d - 1, d)),
                Vec3::new(local(x + 1, d), south.height_at(x + 1, 0, d), far),
                Vec3::new(local(x, d), south.height_at(x, 0, d), far),
            );
        }
    }

    if let (Some(east), Some(south), Some(southeast)) = (east, south, southeast) {
        southeast.validate(d)?;
        if center.texel_at(d - 1, d - 1, d).is_enabled() {
            quad(
                Vec3::new(local(d - 1, d), center.height_at(d - 1, d - 1, d), local(d - 1, d)),
                Vec3::new(far, east.height_at(0, d - 1, d), local(d - 1, d)),
                Vec3::new(far, southeast.height_at(0, 0, d), far),
                Vec3::new(local(d - 1, d), south.height_at(d - 1, 0, d), far),
            );
        }
    }

    let count = indices.len();
    Ok(Geometry::with_groups(
        positions,
        indices,
        vec![FaceGroup {
            name: "edges".into(),
            start: 0,
            count,
        }],
    ))
}
