use glam::Vec3;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;
use wideworlds_protocol::sequence_name_hash;
use wideworlds_scene::{box_geometry, AxisAlignment, Geometry};

/// A resolved prop model: geometry plus the loader metadata the runtime
/// needs (collision participation, billboard alignment, instancing key).
#[derive(Debug, Clone)]
pub struct Model {
    pub geometry: Arc<Geometry>,
    pub solid: bool,
    pub axis_alignment: AxisAlignment,
    /// Distinguishes customized variants of the same asset in the
    /// background scenery pools.
    pub variant_hash: u16,
}

/// Resolves an asset name into a model. The RWX pipeline is an external
/// collaborator behind this seam; the registry only memoizes.
pub trait ModelProvider {
    fn resolve(&mut self, name: &str) -> Option<Model>;
}

/// Placeholder provider: every known-looking asset becomes a solid unit
/// box. Keeps the runtime usable without the model pipeline.
pub struct BoxModelProvider {
    geometry: Arc<Geometry>,
}

impl BoxModelProvider {
    pub fn new() -> Self {
        Self {
            geometry: Arc::new(box_geometry(Vec3::splat(0.5))),
        }
    }
}

impl Default for BoxModelProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelProvider for BoxModelProvider {
    fn resolve(&mut self, name: &str) -> Option<Model> {
        if name.is_empty() {
            return None;
        }
        Some(Model {
            geometry: self.geometry.clone(),
            solid: true,
            axis_alignment: AxisAlignment::None,
            variant_hash: sequence_name_hash(name),
        })
    }
}

/// Per-world memoizing front of the model provider. Cleared at unload,
/// which also cancels any chunk materialization still walking it.
pub struct ModelRegistry {
    provider: Box<dyn ModelProvider>,
    cache: HashMap<String, Option<Arc<Model>>>,
}

impl ModelRegistry {
    pub fn new(provider: Box<dyn ModelProvider>) -> Self {
        Self {
            provider,
            cache: HashMap::new(),
        }
    }

    pub fn resolve(&mut self, name: &str) -> Option<Arc<Model>> {
        if let Some(cached) = self.cache.get(name) {
            return cached.clone();
        }
        let model = self.provider.resolve(name).map(Arc::new);
        if model.is_none() {
            trace!(name, "model unresolved");
        }
        self.cache.insert(name.to_string(), model.clone());
        model
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}
