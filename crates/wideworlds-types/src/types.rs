use glam::DVec3;
use serde::{Deserialize, Serialize};

/// World-data length unit: 100 units per meter.
pub const UNITS_PER_METER: f64 = 100.0;
/// Default chunk side, in meters.
pub const DEFAULT_CHUNK_SIDE: f32 = 20.0;
/// Default terrain/water page diameter, in points per side.
pub const DEFAULT_PAGE_DIAMETER: usize = 128;
/// Distance between two adjacent page points, in meters.
pub const PAGE_POINT_SPACING: f64 = 10.0;

/// A prop chunk index (x, z). Chunks tile the world in squares of
/// `side` meters centered on `(cx * side, cz * side)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkPos {
    pub cx: i32,
    pub cz: i32,
}

impl ChunkPos {
    pub fn new(cx: i32, cz: i32) -> Self {
        Self { cx, cz }
    }

    /// Chunk holding the given world position: `cx = round(x / side)`.
    pub fn from_world(x: f64, z: f64, side: f32) -> Self {
        Self {
            cx: (x / side as f64).round() as i32,
            cz: (z / side as f64).round() as i32,
        }
    }

    /// World-space anchor of this chunk (its center point).
    pub fn anchor(&self, side: f32) -> DVec3 {
        DVec3::new(self.cx as f64 * side as f64, 0.0, self.cz as f64 * side as f64)
    }
}

impl std::fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.cx, self.cz)
    }
}

/// A terrain/water page index (x, z). Pages are squares of
/// `diameter * PAGE_POINT_SPACING` meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PagePos {
    pub px: i32,
    pub pz: i32,
}

impl PagePos {
    pub fn new(px: i32, pz: i32) -> Self {
        Self { px, pz }
    }

    /// Page holding the given world position: `px = round(x / (10 * diameter))`.
    pub fn from_world(x: f64, z: f64, diameter: usize) -> Self {
        let side = PAGE_POINT_SPACING * diameter as f64;
        Self {
            px: (x / side).round() as i32,
            pz: (z / side).round() as i32,
        }
    }

    /// World-space anchor of this page (its center point).
    pub fn anchor(&self, diameter: usize) -> DVec3 {
        let side = PAGE_POINT_SPACING * diameter as f64;
        DVec3::new(self.px as f64 * side, 0.0, self.pz as f64 * side)
    }
}

impl std::fmt::Display for PagePos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.px, self.pz)
    }
}

/// A world prop. Positions are world-absolute meters; rotations are radians.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prop {
    pub id: u32,
    #[serde(rename = "worldId")]
    pub world_id: u32,
    #[serde(rename = "userId")]
    pub user_id: u32,
    pub date: u64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    pub name: String,
    pub description: String,
    pub action: String,
}

impl Prop {
    pub fn position(&self) -> DVec3 {
        DVec3::new(self.x, self.y, self.z)
    }

    /// The one chunk this prop belongs to, derived from its (x, z).
    pub fn chunk_pos(&self, side: f32) -> ChunkPos {
        ChunkPos::from_world(self.x, self.z, side)
    }
}

/// A partial prop update for the batched PUT endpoint. Absent fields are
/// left untouched server-side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropUpdate {
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yaw: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roll: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// One terrain texture entry.
/// Low 6 bits: texture id (0..=62). Bits 6-7: rotation quadrant.
/// Bit 15 set means the point is enabled; unset means a hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerrainTexel(pub u16);

impl TerrainTexel {
    pub const ENABLED: u16 = 0x8000;

    pub fn new(texture_id: u8, rotation: u8) -> Self {
        Self(Self::ENABLED | ((rotation as u16 & 0x3) << 6) | (texture_id as u16 & 0x3F))
    }

    pub fn hole() -> Self {
        Self(0)
    }

    pub fn is_enabled(self) -> bool {
        self.0 & Self::ENABLED != 0
    }

    pub fn texture_id(self) -> u8 {
        (self.0 & 0x3F) as u8
    }

    /// Rotation quadrant, 0..=3 (0°, 90°, 180°, 270°).
    pub fn rotation(self) -> u8 {
        ((self.0 >> 6) & 0x3) as u8
    }

    pub fn rotation_radians(self) -> f32 {
        self.rotation() as f32 * std::f32::consts::FRAC_PI_2
    }
}

/// Convert a stored Renderware-North yaw (degrees) into the runtime's
/// GL-South yaw (radians). `(180 - yaw) mod 360` degrees, negated, is
/// congruent to `-((yaw + 180) mod 360)`.
pub fn aw_yaw_deg_to_rad(yaw_deg: f32) -> f32 {
    -((yaw_deg + 180.0).rem_euclid(360.0)).to_radians()
}

pub fn units_to_meters(units: f64) -> f64 {
    units / UNITS_PER_METER
}

pub fn meters_to_units(meters: f64) -> f64 {
    meters * UNITS_PER_METER
}
