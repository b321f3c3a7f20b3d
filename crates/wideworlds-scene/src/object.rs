use crate::geometry::Geometry;
use glam::{Mat4, Quat, Vec3};
use std::sync::Arc;

/// Handle to an object owned by the scene graph. Handles never dangle
/// into freed memory; a stale id simply fails lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

/// Handle to a scene node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// World-data axis alignment of a prop. Anything other than `None`
/// makes the object a dynamic child that re-orients every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AxisAlignment {
    #[default]
    None,
    ZOriented,
}

/// Metadata the runtime attaches to objects at load time.
#[derive(Debug, Clone, Default)]
pub struct ObjectMeta {
    /// Solid objects participate in collision bounds.
    pub solid: bool,
    pub axis_alignment: AxisAlignment,
    /// Joint tag for avatar parts, from the model metadata.
    pub joint_tag: Option<u16>,
    /// Owning prop, when the object materializes one.
    pub prop_id: Option<u32>,
}

/// One object in the graph: a transform, optional geometry, metadata and
/// child links. Props are flat; avatars carry joint-tagged children.
#[derive(Debug, Clone)]
pub struct Object3d {
    pub name: String,
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub geometry: Option<Arc<Geometry>>,
    pub meta: ObjectMeta,
    pub(crate) parent: Option<ObjectId>,
    pub(crate) children: Vec<ObjectId>,
}

impl Object3d {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            geometry: None,
            meta: ObjectMeta::default(),
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn with_geometry(mut self, geometry: Arc<Geometry>) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn with_meta(mut self, meta: ObjectMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn local_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    pub fn parent(&self) -> Option<ObjectId> {
        self.parent
    }

    pub fn children(&self) -> &[ObjectId] {
        &self.children
    }
}
