use serde::{Deserialize, Serialize};

/// An RGB color, components in [0, 1].
pub type Color = [f32; 3];

/// The remote world document: everything the runtime needs to set up the
/// environment before streaming content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorldDescriptor {
    pub id: u32,
    pub name: String,
    pub sky_colors: SkyColors,
    pub ambient_color: Color,
    pub directional_color: Color,
    /// Stored in world-data convention; the runtime negates all three axes.
    pub directional_position: [f32; 3],
    pub fog: FogSettings,
    pub water: WaterSettings,
    pub terrain: TerrainSettings,
    pub entry_point: EntryPoint,
    /// Base URL for models, avatars and sequence archives.
    pub path_base: String,
}

/// Skybox face colors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkyColors {
    pub top: Color,
    pub north: Color,
    pub east: Color,
    pub south: Color,
    pub west: Color,
    pub bottom: Color,
}

impl Default for SkyColors {
    fn default() -> Self {
        let sky = [0.35, 0.61, 0.89];
        Self {
            top: sky,
            north: sky,
            east: sky,
            south: sky,
            west: sky,
            bottom: [0.15, 0.15, 0.15],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FogSettings {
    pub enabled: bool,
    pub color: Color,
    pub near: f32,
    pub far: f32,
}

impl Default for FogSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            color: [0.8, 0.8, 0.8],
            near: 0.0,
            far: 120.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WaterSettings {
    pub enabled: bool,
    /// Rest level of the water surface, meters.
    pub level: f32,
    pub color: Color,
    pub texture: String,
    /// Wave angular speed, radians per second.
    pub speed: f32,
    /// Peak-to-trough surface travel, meters.
    pub surface_move: f32,
    pub under_ambient: Color,
    pub under_fog: FogSettings,
}

impl Default for WaterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: 0.0,
            color: [0.2, 0.35, 0.6],
            texture: String::new(),
            speed: 1.0,
            surface_move: 0.0,
            under_ambient: [0.1, 0.2, 0.3],
            under_fog: FogSettings {
                enabled: true,
                color: [0.1, 0.25, 0.4],
                near: 0.0,
                far: 30.0,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TerrainSettings {
    pub enabled: bool,
    /// Vertical offset applied to every terrain page, meters.
    pub offset: f32,
}

/// Where a user lands when entering the world. Position in meters, yaw in
/// world-data degrees (Renderware North).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntryPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_defaults_from_sparse_json() {
        let doc: WorldDescriptor =
            serde_json::from_str(r#"{"id": 3, "name": "lemuria", "pathBase": "https://assets.example/lemuria"}"#)
                .unwrap();
        assert_eq!(doc.id, 3);
        assert_eq!(doc.name, "lemuria");
        assert!(!doc.water.enabled);
        assert!(!doc.terrain.enabled);
        assert_eq!(doc.entry_point.yaw, 0.0);
    }

    #[test]
    fn test_descriptor_water_block() {
        let doc: WorldDescriptor = serde_json::from_str(
            r#"{"id": 1, "water": {"enabled": true, "level": 2.5, "surfaceMove": 0.4}}"#,
        )
        .unwrap();
        assert!(doc.water.enabled);
        assert_eq!(doc.water.level, 2.5);
        assert_eq!(doc.water.surface_move, 0.4);
    }
}
