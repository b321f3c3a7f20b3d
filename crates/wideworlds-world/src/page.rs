use serde::{Deserialize, Serialize};
use thiserror::Error;
use wideworlds_types::TerrainTexel;

#[derive(Debug, Error)]
pub enum PageError {
    #[error("Bad page payload length: expected {expected}, got {actual}")]
    BadLength { expected: usize, actual: usize },
}

/// One terrain page payload: an elevation value and a texture entry per
/// point, row-major over `diameter * diameter` points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerrainPageData {
    #[serde(rename = "elevationData")]
    pub elevation: Vec<i16>,
    #[serde(rename = "textureData")]
    pub texture: Vec<u16>,
}

impl TerrainPageData {
    /// A flat, fully-enabled page. Used for tests and missing pages.
    pub fn flat(diameter: usize) -> Self {
        Self {
            elevation: vec![0; diameter * diameter],
            texture: vec![TerrainTexel::new(0, 0).0; diameter * diameter],
        }
    }

    pub fn validate(&self, diameter: usize) -> Result<(), PageError> {
        let expected = diameter * diameter;
        if self.elevation.len() != expected {
            return Err(PageError::BadLength {
                expected,
                actual: self.elevation.len(),
            });
        }
        if self.texture.len() != expected {
            return Err(PageError::BadLength {
                expected,
                actual: self.texture.len(),
            });
        }
        Ok(())
    }

    pub fn elevation_at(&self, x: usize, z: usize, diameter: usize) -> i16 {
        self.elevation[z * diameter + x]
    }

    /// Point elevation in meters (values are stored in world-data units).
    pub fn height_at(&self, x: usize, z: usize, diameter: usize) -> f32 {
        self.elevation_at(x, z, diameter) as f32 / 100.0
    }

    pub fn texel_at(&self, x: usize, z: usize, diameter: usize) -> TerrainTexel {
        TerrainTexel(self.texture[z * diameter + x])
    }
}

/// One water page payload, elevation only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterPageData {
    #[serde(rename = "elevationData")]
    pub elevation: Vec<i16>,
}

impl WaterPageData {
    pub fn validate(&self, diameter: usize) -> Result<(), PageError> {
        let expected = diameter * diameter;
        if self.elevation.len() != expected {
            return Err(PageError::BadLength {
                expected,
                actual: self.elevation.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_lengths() {
        let good = TerrainPageData::flat(4);
        assert!(good.validate(4).is_ok());
        let bad = TerrainPageData {
            elevation: vec![0; 15],
            texture: vec![0; 16],
        };
        assert!(matches!(
            bad.validate(4),
            Err(PageError::BadLength {
                expected: 16,
                actual: 15
            })
        ));
    }

    #[test]
    fn test_height_scaling() {
        let mut page = TerrainPageData::flat(4);
        page.elevation[0] = 250;
        assert!((page.height_at(0, 0, 4) - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_payload_json_shape() {
        let page: TerrainPageData = serde_json::from_str(
            r#"{"elevationData": [0, 100, 0, -50], "textureData": [32768, 32768, 32768, 32768]}"#,
        )
        .unwrap();
        assert!(page.validate(2).is_ok());
        assert!(page.texel_at(1, 1, 2).is_enabled());
        assert_eq!(page.elevation_at(1, 1, 2), -50);
    }
}
