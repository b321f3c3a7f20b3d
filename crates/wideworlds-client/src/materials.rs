use std::collections::HashMap;
use tracing::debug;

/// Seconds between animated-texture frame advances.
pub const TEXTURE_ANIMATION_PERIOD: f64 = 0.2;

/// One tracked material. Texture handles belong to the rendering
/// backend; the registry owns their lifetime and frame counters.
#[derive(Debug)]
pub struct MaterialEntry {
    pub texture: String,
    pub frame_count: usize,
    pub current_frame: usize,
}

/// Per-world material registry. Animated textures advance together on
/// the shared period; everything is disposed once at unload.
#[derive(Debug, Default)]
pub struct MaterialRegistry {
    materials: HashMap<String, MaterialEntry>,
    last_advance: f64,
}

impl MaterialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, texture: impl Into<String>, frame_count: usize) {
        let name = name.into();
        self.materials.insert(
            name,
            MaterialEntry {
                texture: texture.into(),
                frame_count: frame_count.max(1),
                current_frame: 0,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&MaterialEntry> {
        self.materials.get(name)
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    /// Advance animated textures when the period elapsed. Returns true
    /// when frames moved (the backend re-uploads then).
    pub fn advance(&mut self, now: f64) -> bool {
        if now - self.last_advance < TEXTURE_ANIMATION_PERIOD {
            return false;
        }
        self.last_advance = now;
        let mut moved = false;
        for entry in self.materials.values_mut() {
            if entry.frame_count > 1 {
                entry.current_frame = (entry.current_frame + 1) % entry.frame_count;
                moved = true;
            }
        }
        moved
    }

    /// Release every texture and material at world unload.
    pub fn dispose(&mut self) {
        debug!(count = self.materials.len(), "disposing materials");
        self.materials.clear();
        self.last_advance = 0.0;
    }
}
