use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub username: String,
    pub cache_dir: String,
    pub controls: ControlsConfig,
    pub graphics: GraphicsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub key_bindings: KeyBindings,
    /// Meters per second.
    pub walk_speed: f32,
    pub run_speed: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyBindings {
    pub forward: String,
    pub backward: String,
    pub left: String,
    pub right: String,
    pub move_up: String,
    pub move_down: String,
    pub look_up: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Meters.
    pub rendering_distance: f32,
    pub props_loading_distance: f32,
    pub idle_props_loading: IdleLoadingConfig,
    pub background_scenery: BackgroundSceneryConfig,
    pub debug_user_collider: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleLoadingConfig {
    /// Meters.
    pub distance: f32,
    /// Seconds of standing still before idle loading kicks in.
    pub downtime: f32,
    /// Chunks per second.
    pub speed: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundSceneryConfig {
    pub enabled: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".into(),
            username: String::new(),
            cache_dir: "cache".into(),
            controls: ControlsConfig::default(),
            graphics: GraphicsConfig::default(),
        }
    }
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            key_bindings: KeyBindings::default(),
            walk_speed: 3.0,
            run_speed: 9.0,
        }
    }
}

impl Default for KeyBindings {
    fn default() -> Self {
        Self {
            forward: "KeyW".into(),
            backward: "KeyS".into(),
            left: "KeyA".into(),
            right: "KeyD".into(),
            move_up: "KeyQ".into(),
            move_down: "KeyE".into(),
            look_up: "PageUp".into(),
        }
    }
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            rendering_distance: 200.0,
            props_loading_distance: 120.0,
            idle_props_loading: IdleLoadingConfig::default(),
            background_scenery: BackgroundSceneryConfig::default(),
            debug_user_collider: false,
        }
    }
}

impl Default for IdleLoadingConfig {
    fn default() -> Self {
        Self {
            distance: 400.0,
            downtime: 3.0,
            speed: 10.0,
        }
    }
}

impl Default for BackgroundSceneryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: ClientConfig = toml::from_str(&contents)?;
            Ok(config)
        } else {
            tracing::info!("No config file found at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_partial_toml() {
        let config: ClientConfig = toml::from_str(
            "server_url = \"https://worlds.example\"\n\
             [graphics]\n\
             props_loading_distance = 60.0\n",
        )
        .unwrap();
        assert_eq!(config.server_url, "https://worlds.example");
        assert_eq!(config.graphics.props_loading_distance, 60.0);
        assert_eq!(config.graphics.rendering_distance, 200.0);
        assert_eq!(config.controls.walk_speed, 3.0);
        assert_eq!(config.controls.key_bindings.forward, "KeyW");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        let mut config = ClientConfig::default();
        config.controls.run_speed = 12.5;
        config.save(&path).unwrap();
        let back = ClientConfig::load(&path).unwrap();
        assert_eq!(back.controls.run_speed, 12.5);
    }
}
