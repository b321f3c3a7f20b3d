use crate::object::{NodeId, Object3d, ObjectId};
use glam::{Mat4, Quat, Vec3};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;
use wideworlds_physics::{Bvh, Ray, Triangle};

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("Unknown node id: {0}")]
    UnknownNode(u32),
    #[error("Unknown object id: {0}")]
    UnknownObject(u32),
    #[error("Level {level} is not valid for this node")]
    WrongLevel { level: usize },
}

pub type SceneResult<T> = Result<T, SceneError>;

/// Collision bounds of a node. `Null` records that a build ran and no
/// triangles survived, which is distinct from "not yet built".
#[derive(Debug, Clone, Default)]
pub enum BoundsState {
    #[default]
    NotBuilt,
    Null,
    Ready(Arc<Bvh>),
}

/// Node sets that crossed the LOD boundary during `update_lods`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LodTransitions {
    pub visible: Vec<NodeId>,
    pub turned_invisible: Vec<NodeId>,
}

/// Picks the collision triangles out of one object, in object-local
/// space. Returning `None` falls back to the object's full geometry.
pub type PreSelector<'a> = &'a dyn Fn(&Object3d) -> Option<Vec<Triangle>>;

#[derive(Debug)]
struct Node {
    position: Vec3,
    lod: bool,
    visible: bool,
    levels: [Vec<ObjectId>; 2],
    dynamic: Vec<ObjectId>,
    bounds: BoundsState,
    bounds_offset: Vec3,
}

/// The scene graph facade. All access goes through integer handles; no
/// node or object references ever escape.
#[derive(Default)]
pub struct SceneGraph {
    nodes: HashMap<u32, Node>,
    objects: HashMap<u32, Object3d>,
    next_node: u32,
    next_object: u32,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node at the given position. LOD nodes carry two levels:
    /// 0 = full detail, 1 = hidden. `hide` spawns the node detached.
    pub fn spawn_node(&mut self, x: f32, y: f32, z: f32, lod: bool, hide: bool) -> NodeId {
        let id = self.next_node;
        self.next_node += 1;
        self.nodes.insert(
            id,
            Node {
                position: Vec3::new(x, y, z),
                lod,
                visible: !hide,
                levels: [Vec::new(), Vec::new()],
                dynamic: Vec::new(),
                bounds: BoundsState::NotBuilt,
                bounds_offset: Vec3::ZERO,
            },
        );
        NodeId(id)
    }

    pub fn remove_node(&mut self, id: NodeId) -> SceneResult<()> {
        let node = self.nodes.remove(&id.0).ok_or(SceneError::UnknownNode(id.0))?;
        for level in node.levels {
            for obj in level {
                self.free_object(obj);
            }
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn set_node_position(&mut self, id: NodeId, x: f32, y: f32, z: f32) -> SceneResult<()> {
        let node = self.node_mut(id)?;
        node.position = Vec3::new(x, y, z);
        Ok(())
    }

    pub fn node_position(&self, id: NodeId) -> SceneResult<Vec3> {
        Ok(self.node(id)?.position)
    }

    pub fn is_visible(&self, id: NodeId) -> SceneResult<bool> {
        Ok(self.node(id)?.visible)
    }

    /// Register a standalone object; it joins the scene once appended to
    /// a node or attached under another object.
    pub fn add_object(&mut self, object: Object3d) -> ObjectId {
        let id = self.next_object;
        self.next_object += 1;
        self.objects.insert(id, object);
        ObjectId(id)
    }

    pub fn attach_child(&mut self, parent: ObjectId, child: ObjectId) -> SceneResult<()> {
        if !self.objects.contains_key(&child.0) {
            return Err(SceneError::UnknownObject(child.0));
        }
        let parent_obj = self
            .objects
            .get_mut(&parent.0)
            .ok_or(SceneError::UnknownObject(parent.0))?;
        parent_obj.children.push(child);
        if let Some(c) = self.objects.get_mut(&child.0) {
            c.parent = Some(parent);
        }
        Ok(())
    }

    pub fn object(&self, id: ObjectId) -> Option<&Object3d> {
        self.objects.get(&id.0)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut Object3d> {
        self.objects.get_mut(&id.0)
    }

    /// Append an object to a node's level group. Level 1 only exists on
    /// LOD nodes.
    pub fn append(
        &mut self,
        id: NodeId,
        obj: ObjectId,
        level: usize,
        dynamic: bool,
    ) -> SceneResult<()> {
        if !self.objects.contains_key(&obj.0) {
            return Err(SceneError::UnknownObject(obj.0));
        }
        let node = self.node_mut(id)?;
        if level >= 2 || (level == 1 && !node.lod) {
            return Err(SceneError::WrongLevel { level });
        }
        node.levels[level].push(obj);
        if dynamic {
            node.dynamic.push(obj);
        }
        Ok(())
    }

    /// Detach one object from a node and free it with its descendants.
    pub fn remove_object(&mut self, id: NodeId, obj: ObjectId) -> SceneResult<()> {
        let node = self.node_mut(id)?;
        for level in &mut node.levels {
            level.retain(|&o| o != obj);
        }
        node.dynamic.retain(|&o| o != obj);
        self.free_object(obj);
        Ok(())
    }

    /// Remove and free every object under the node, keeping the node.
    pub fn wipe(&mut self, id: NodeId) -> SceneResult<()> {
        let node = self.node_mut(id)?;
        let objects: Vec<ObjectId> = node.levels.iter().flatten().copied().collect();
        node.levels = [Vec::new(), Vec::new()];
        node.dynamic.clear();
        for obj in objects {
            self.free_object(obj);
        }
        Ok(())
    }

    /// Find an object by name under a level, searching descendants.
    pub fn get_by_name(&self, id: NodeId, name: &str, level: usize) -> SceneResult<Option<ObjectId>> {
        let node = self.node(id)?;
        if level >= 2 {
            return Err(SceneError::WrongLevel { level });
        }
        for &root in &node.levels[level] {
            if let Some(found) = self.find_named(root, name) {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    pub fn belongs_to(&self, id: NodeId, obj: ObjectId) -> bool {
        let Some(node) = self.nodes.get(&id.0) else {
            return false;
        };
        node.levels
            .iter()
            .flatten()
            .any(|&root| root == obj || self.is_descendant(root, obj))
    }

    pub fn set_dynamic(&mut self, id: NodeId, obj: ObjectId) -> SceneResult<()> {
        let node = self.node_mut(id)?;
        if !node.dynamic.contains(&obj) {
            node.dynamic.push(obj);
        }
        Ok(())
    }

    pub fn unset_dynamic(&mut self, id: NodeId, obj: ObjectId) -> SceneResult<()> {
        let node = self.node_mut(id)?;
        node.dynamic.retain(|&o| o != obj);
        Ok(())
    }

    pub fn dynamic_objects(&self, id: NodeId) -> SceneResult<&[ObjectId]> {
        Ok(&self.node(id)?.dynamic)
    }

    /// Re-orient every dynamic child of every visible node to face the
    /// camera around the vertical axis.
    pub fn update_dynamic(&mut self, camera: Vec3) {
        let targets: Vec<(Vec3, ObjectId)> = self
            .nodes
            .values()
            .filter(|n| n.visible)
            .flat_map(|n| n.dynamic.iter().map(move |&obj| (n.position, obj)))
            .collect();
        for (node_pos, obj) in targets {
            if let Some(object) = self.objects.get_mut(&obj.0) {
                let world = node_pos + object.translation;
                let to_camera = camera - world;
                if to_camera.x.abs() > 1e-6 || to_camera.z.abs() > 1e-6 {
                    let yaw = to_camera.x.atan2(to_camera.z);
                    object.rotation = Quat::from_rotation_y(yaw);
                }
            }
        }
    }

    /// Rebuild the node's collision bounds from its level-0 content:
    /// flatten descendants, keep objects passing `filter`, take triangles
    /// from `pre_selector` (or the full geometry), all in node-local
    /// space. Builds the `Null` sentinel when nothing survives.
    pub fn update_bounds(
        &mut self,
        id: NodeId,
        filter: &dyn Fn(&Object3d) -> bool,
        pre_selector: Option<PreSelector<'_>>,
        offset: Vec3,
    ) -> SceneResult<()> {
        let roots = self.node(id)?.levels[0].clone();
        let mut triangles = Vec::new();
        for root in roots {
            self.collect_triangles(root, Mat4::IDENTITY, filter, pre_selector, &mut triangles);
        }
        let count = triangles.len();
        let node = self.node_mut(id)?;
        node.bounds = match Bvh::build(triangles) {
            Some(bvh) => BoundsState::Ready(Arc::new(bvh)),
            None => BoundsState::Null,
        };
        node.bounds_offset = offset;
        trace!(node = id.0, triangles = count, "rebuilt node bounds");
        Ok(())
    }

    pub fn bounds_ready(&self, id: NodeId) -> bool {
        self.nodes
            .get(&id.0)
            .map(|n| !matches!(n.bounds, BoundsState::NotBuilt))
            .unwrap_or(false)
    }

    pub fn bounds_tree(&self, id: NodeId) -> Option<Arc<Bvh>> {
        match self.nodes.get(&id.0).map(|n| &n.bounds) {
            Some(BoundsState::Ready(bvh)) => Some(bvh.clone()),
            _ => None,
        }
    }

    pub fn bounds_offset(&self, id: NodeId) -> SceneResult<Vec3> {
        Ok(self.node(id)?.bounds_offset)
    }

    pub fn world_matrix(&self, id: NodeId) -> SceneResult<Mat4> {
        Ok(Mat4::from_translation(self.node(id)?.position))
    }

    /// World transform of an object appended (directly or transitively)
    /// under a node.
    pub fn object_world_matrix(&self, id: NodeId, obj: ObjectId) -> SceneResult<Mat4> {
        let node_mat = self.world_matrix(id)?;
        let mut chain = Mat4::IDENTITY;
        let mut current = Some(obj);
        while let Some(cur) = current {
            let object = self
                .objects
                .get(&cur.0)
                .ok_or(SceneError::UnknownObject(cur.0))?;
            chain = object.local_matrix() * chain;
            current = object.parent;
        }
        Ok(node_mat * chain)
    }

    /// Cast a ray from the camera against the node's level-0 content.
    /// Direction defaults to straight up (the underwater probe).
    pub fn intersect_from_camera(
        &self,
        id: NodeId,
        camera: Vec3,
        dir: Option<Vec3>,
        recursive: bool,
    ) -> SceneResult<Option<f32>> {
        let node = self.node(id)?;
        let ray = Ray::new(camera, dir.unwrap_or(Vec3::Y));
        let node_mat = Mat4::from_translation(node.position);
        let mut nearest: Option<f32> = None;
        for &root in &node.levels[0] {
            self.intersect_object(root, node_mat, &ray, recursive, &mut nearest);
        }
        Ok(nearest)
    }

    /// Flip LOD nodes across the hiding-distance boundary and report
    /// which ones changed state.
    pub fn update_lods(
        &mut self,
        candidates: &[NodeId],
        camera: Vec3,
        hiding_distance: f32,
    ) -> LodTransitions {
        let mut transitions = LodTransitions::default();
        for &id in candidates {
            let Some(node) = self.nodes.get_mut(&id.0) else {
                continue;
            };
            if !node.lod {
                continue;
            }
            let want = node.position.distance(camera) < hiding_distance;
            if want != node.visible {
                node.visible = want;
                if want {
                    transitions.visible.push(id);
                } else {
                    transitions.turned_invisible.push(id);
                }
            }
        }
        transitions
    }

    fn node(&self, id: NodeId) -> SceneResult<&Node> {
        self.nodes.get(&id.0).ok_or(SceneError::UnknownNode(id.0))
    }

    fn node_mut(&mut self, id: NodeId) -> SceneResult<&mut Node> {
        self.nodes
            .get_mut(&id.0)
            .ok_or(SceneError::UnknownNode(id.0))
    }

    fn free_object(&mut self, id: ObjectId) {
        if let Some(object) = self.objects.remove(&id.0) {
            for child in object.children {
                self.free_object(child);
            }
        }
    }

    fn find_named(&self, root: ObjectId, name: &str) -> Option<ObjectId> {
        let object = self.objects.get(&root.0)?;
        if object.name == name {
            return Some(root);
        }
        for &child in &object.children {
            if let Some(found) = self.find_named(child, name) {
                return Some(found);
            }
        }
        None
    }

    fn is_descendant(&self, root: ObjectId, target: ObjectId) -> bool {
        let Some(object) = self.objects.get(&root.0) else {
            return false;
        };
        object
            .children
            .iter()
            .any(|&c| c == target || self.is_descendant(c, target))
    }

    fn collect_triangles(
        &self,
        id: ObjectId,
        parent_mat: Mat4,
        filter: &dyn Fn(&Object3d) -> bool,
        pre_selector: Option<PreSelector<'_>>,
        out: &mut Vec<Triangle>,
    ) {
        let Some(object) = self.objects.get(&id.0) else {
            return;
        };
        let mat = parent_mat * object.local_matrix();
        if filter(object) {
            let selected = pre_selector.and_then(|sel| sel(object));
            match selected {
                Some(tris) => {
                    out.extend(tris.into_iter().map(|t| {
                        Triangle::new(
                            mat.transform_point3(t.a),
                            mat.transform_point3(t.b),
                            mat.transform_point3(t.c),
                        )
                    }));
                }
                None => {
                    if let Some(geometry) = &object.geometry {
                        out.extend(geometry.triangles().map(|[a, b, c]| {
                            Triangle::new(
                                mat.transform_point3(a),
                                mat.transform_point3(b),
                                mat.transform_point3(c),
                            )
                        }));
                    }
                }
            }
        }
        for &child in &object.children {
            self.collect_triangles(child, mat, filter, pre_selector, out);
        }
    }

    fn intersect_object(
        &self,
        id: ObjectId,
        parent_mat: Mat4,
        ray: &Ray,
        recursive: bool,
        nearest: &mut Option<f32>,
    ) {
        let Some(object) = self.objects.get(&id.0) else {
            return;
        };
        let mat = parent_mat * object.local_matrix();
        if let Some(geometry) = &object.geometry {
            for [a, b, c] in geometry.triangles() {
                let hit = ray.intersect_triangle(
                    mat.transform_point3(a),
                    mat.transform_point3(b),
                    mat.transform_point3(c),
                );
                if let Some(t) = hit {
                    if t < nearest.unwrap_or(f32::INFINITY) {
                        *nearest = Some(t);
                    }
                }
            }
        }
        if recursive {
            for &child in &object.children {
                self.intersect_object(child, mat, ray, recursive, nearest);
            }
        }
    }
}
