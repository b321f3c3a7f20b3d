use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use wideworlds_protocol::sequence_name_hash;
use wideworlds_scene::{ObjectId, SceneGraph};

/// Crossfade window between two different animations on one node.
pub const TRANSITION_WINDOW: f64 = 0.15;
/// Explicit-animation rollback tolerance: remote progress older than the
/// local one by at most this much keeps the local playback.
pub const ROLLBACK_TOLERANCE: f32 = 0.25;
/// Joint tag of the root (location-carrying) joint.
pub const ROOT_JOINT: u16 = 1;

/// Sequence file flavor; it fixes the frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceMode {
    Binary,
    Text,
}

impl SequenceMode {
    pub fn fps(self) -> f32 {
        match self {
            SequenceMode::Binary => 30.0,
            SequenceMode::Text => 1000.0,
        }
    }
}

/// One keyframe: absolute joint rotations, plus the root location when
/// the sequence translates.
#[derive(Debug, Clone, Default)]
pub struct SequenceFrame {
    pub joints: HashMap<u16, Quat>,
    pub location: Option<Vec3>,
}

/// A parsed animation sequence. Parsing itself happens in an external
/// collaborator; this is its output shape.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub mode: SequenceMode,
    pub frames: Vec<SequenceFrame>,
}

impl Sequence {
    pub fn duration(&self) -> f32 {
        self.frames.len() as f32 / self.mode.fps()
    }
}

/// One avatar entry of the world's avatar dictionary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarDef {
    pub name: String,
    /// Model file of the avatar body.
    pub geometry: String,
    /// Implicit animation name -> sequence file name.
    pub implicit: HashMap<String, String>,
    /// Explicit animation name -> sequence file name.
    pub explicit: HashMap<String, String>,
}

/// Resolution state of a sequence key: requested but not yet fetched,
/// fetched and parsed, or known missing.
#[derive(Debug, Clone)]
enum SequenceSlot {
    Pending,
    Ready(Arc<Sequence>),
    Missing,
}

#[derive(Debug)]
struct JointView {
    object: ObjectId,
    original_rotation: Quat,
    original_translation: Vec3,
}

#[derive(Debug, Default)]
struct AvatarView {
    joints: HashMap<u16, JointView>,
}

#[derive(Debug)]
struct LastFrame {
    pose: HashMap<u16, Quat>,
    hash: u16,
    at: f64,
}

/// Sequence cache, joint lookup and pose blending for avatar nodes.
/// Sequence fetches run elsewhere; the manager queues requests and gets
/// results installed back, memoized per 16-bit key with an in-flight
/// sentinel so duplicate loads coalesce.
pub struct AnimationManager {
    avatars: Vec<AvatarDef>,
    sequences: HashMap<u16, SequenceSlot>,
    sequence_files: HashMap<u16, String>,
    pending: Vec<u16>,
    views: HashMap<ObjectId, AvatarView>,
    last_frames: HashMap<ObjectId, LastFrame>,
    explicit_progress: HashMap<ObjectId, f32>,
}

impl AnimationManager {
    pub fn new() -> Self {
        Self {
            avatars: Vec::new(),
            sequences: HashMap::new(),
            sequence_files: HashMap::new(),
            pending: Vec::new(),
            views: HashMap::new(),
            last_frames: HashMap::new(),
            explicit_progress: HashMap::new(),
        }
    }

    /// Register the world's avatar dictionary and learn every sequence
    /// file behind its 16-bit name hash.
    pub fn load_avatars(&mut self, avatars: Vec<AvatarDef>) {
        for avatar in &avatars {
            for file in avatar.implicit.values().chain(avatar.explicit.values()) {
                self.sequence_files
                    .insert(sequence_name_hash(file), file.clone());
            }
        }
        self.avatars = avatars;
    }

    pub fn avatar(&self, avatar_id: u16) -> Option<&AvatarDef> {
        self.avatars.get(avatar_id as usize)
    }

    /// Sequence keys waiting on a fetch. The runtime drains this and
    /// spawns the loads.
    pub fn take_pending_requests(&mut self) -> Vec<(u16, String)> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .filter_map(|hash| {
                self.sequence_files
                    .get(&hash)
                    .map(|file| (hash, file.clone()))
            })
            .collect()
    }

    /// Install a fetch result. A `None` marks the sequence missing for
    /// the rest of the world session.
    pub fn install_sequence(&mut self, hash: u16, sequence: Option<Sequence>) {
        match sequence {
            Some(seq) => {
                self.sequences.insert(hash, SequenceSlot::Ready(Arc::new(seq)));
            }
            None => {
                warn!(hash, "sequence marked missing");
                self.sequences.insert(hash, SequenceSlot::Missing);
            }
        }
    }

    /// Resolve the implicit animation for an avatar, walking the
    /// fallback chain: walk -> run -> fly, run -> walk -> fly,
    /// fly -> walk -> run.
    pub fn animate_implicit(
        &mut self,
        scene: &mut SceneGraph,
        group: ObjectId,
        avatar_id: u16,
        anim_name: &str,
        elapsed: f64,
        speed: f32,
        now: f64,
    ) {
        let hash = self.resolve_implicit(avatar_id, anim_name);
        self.animate(scene, group, hash, elapsed, speed, true, now);
    }

    /// Resolve an explicit animation; no fallback.
    pub fn animate_explicit(
        &mut self,
        scene: &mut SceneGraph,
        group: ObjectId,
        avatar_id: u16,
        anim_name: &str,
        elapsed: f64,
        now: f64,
    ) {
        let hash = self
            .avatar(avatar_id)
            .and_then(|a| a.explicit.get(anim_name))
            .map(|file| sequence_name_hash(file));
        self.animate(scene, group, hash, elapsed, 1.0, false, now);
    }

    /// Implicit animation keyed by a node start time.
    pub fn animate_entity_imp(
        &mut self,
        scene: &mut SceneGraph,
        group: ObjectId,
        avatar_id: u16,
        anim_name: &str,
        start_time: f64,
        now: f64,
        speed: f32,
    ) {
        self.animate_implicit(scene, group, avatar_id, anim_name, now - start_time, speed, now);
    }

    /// Explicit animation driven by remote progress, tolerating small
    /// rollbacks: a remote value older than the local one by at most the
    /// tolerance keeps local playback, anything else resyncs.
    pub fn animate_entity_exp(
        &mut self,
        scene: &mut SceneGraph,
        group: ObjectId,
        avatar_id: u16,
        anim_name: &str,
        progress: f32,
        now: f64,
    ) {
        let local = self.explicit_progress.get(&group).copied().unwrap_or(0.0);
        let effective = if progress < local && local - progress <= ROLLBACK_TOLERANCE {
            local
        } else {
            progress
        };
        self.explicit_progress.insert(group, effective);
        self.animate_explicit(scene, group, avatar_id, anim_name, effective as f64, now);
    }

    pub fn local_explicit_progress(&self, group: ObjectId) -> Option<f32> {
        self.explicit_progress.get(&group).copied()
    }

    /// Drop all per-node state and the sequence cache; called on world
    /// unload.
    pub fn clear(&mut self) {
        self.avatars.clear();
        self.sequences.clear();
        self.sequence_files.clear();
        self.pending.clear();
        self.views.clear();
        self.last_frames.clear();
        self.explicit_progress.clear();
    }

    /// Forget per-node state for a removed node.
    pub fn forget_node(&mut self, group: ObjectId) {
        self.views.remove(&group);
        self.last_frames.remove(&group);
        self.explicit_progress.remove(&group);
    }

    fn resolve_implicit(&self, avatar_id: u16, anim_name: &str) -> Option<u16> {
        let avatar = self.avatar(avatar_id)?;
        let chain: &[&str] = match anim_name {
            "walk" => &["walk", "run", "fly"],
            "run" => &["run", "walk", "fly"],
            "fly" => &["fly", "walk", "run"],
            other => return avatar.implicit.get(other).map(|f| sequence_name_hash(f)),
        };
        chain
            .iter()
            .find_map(|name| avatar.implicit.get(*name))
            .map(|file| sequence_name_hash(file))
    }

    fn sequence(&mut self, hash: u16) -> Option<Arc<Sequence>> {
        match self.sequences.get(&hash) {
            Some(SequenceSlot::Ready(seq)) => Some(seq.clone()),
            Some(SequenceSlot::Pending) | Some(SequenceSlot::Missing) => None,
            None => {
                // First request: mark in flight so duplicates coalesce.
                self.sequences.insert(hash, SequenceSlot::Pending);
                self.pending.push(hash);
                debug!(hash, "sequence fetch queued");
                None
            }
        }
    }

    fn is_missing(&self, hash: Option<u16>) -> bool {
        match hash {
            None => true,
            Some(h) => matches!(self.sequences.get(&h), Some(SequenceSlot::Missing)),
        }
    }

    /// Core pose application for one node.
    fn animate(
        &mut self,
        scene: &mut SceneGraph,
        group: ObjectId,
        hash: Option<u16>,
        elapsed: f64,
        speed: f32,
        translate: bool,
        now: f64,
    ) {
        self.ensure_view(scene, group);

        if self.is_missing(hash) {
            self.reset_pose(scene, group);
            return;
        }
        let Some(hash) = hash else {
            return;
        };
        let Some(sequence) = self.sequence(hash) else {
            return;
        };
        if sequence.frames.is_empty() {
            self.reset_pose(scene, group);
            return;
        }

        let fps = sequence.mode.fps();
        let duration = sequence.duration();
        let target_time = ((elapsed as f32 * speed) % duration + duration) % duration;
        let frame_pos = target_time * fps;
        let frames = sequence.frames.len();
        let i0 = (frame_pos.floor() as usize) % frames;
        let i1 = (i0 + 1) % frames;
        let frac = frame_pos - frame_pos.floor();

        // Crossfade from the stored pose when the animation changed
        // recently enough.
        let crossfade = self
            .last_frames
            .get(&group)
            .filter(|last| last.hash != hash && now - last.at <= TRANSITION_WINDOW)
            .map(|last| {
                let progress = ((now - last.at) / TRANSITION_WINDOW) as f32;
                (last.pose.clone(), progress)
            });

        let target_frame = &sequence.frames[i1];
        let base_frame = &sequence.frames[i0];
        let mut applied_pose: HashMap<u16, Quat> = HashMap::new();

        let view = match self.views.get(&group) {
            Some(view) => view,
            None => return,
        };
        for (&tag, joint) in &view.joints {
            let target = match (base_frame.joints.get(&tag), target_frame.joints.get(&tag)) {
                (Some(&a), Some(&b)) => match &crossfade {
                    Some((last_pose, progress)) => {
                        let from = last_pose.get(&tag).copied().unwrap_or(a);
                        from.slerp(b, *progress)
                    }
                    None => a.slerp(b, frac),
                },
                _ => joint.original_rotation,
            };
            applied_pose.insert(tag, target);
            if let Some(object) = scene.object_mut(joint.object) {
                object.rotation = target;
            }
            if translate && tag == ROOT_JOINT {
                if let (Some(a), Some(b)) = (base_frame.location, target_frame.location) {
                    let location = a.lerp(b, frac);
                    if let Some(object) = scene.object_mut(joint.object) {
                        object.translation = joint.original_translation + location;
                    }
                }
            }
        }

        self.last_frames.insert(
            group,
            LastFrame {
                pose: applied_pose,
                hash,
                at: now,
            },
        );
    }

    /// Lazily collect the node's joint-tagged descendants and remember
    /// their rest pose.
    fn ensure_view(&mut self, scene: &SceneGraph, group: ObjectId) {
        if self.views.contains_key(&group) {
            return;
        }
        let mut view = AvatarView::default();
        collect_joints(scene, group, &mut view);
        self.views.insert(group, view);
    }

    fn reset_pose(&mut self, scene: &mut SceneGraph, group: ObjectId) {
        let Some(view) = self.views.get(&group) else {
            return;
        };
        for joint in view.joints.values() {
            if let Some(object) = scene.object_mut(joint.object) {
                object.rotation = joint.original_rotation;
                object.translation = joint.original_translation;
            }
        }
        self.last_frames.remove(&group);
    }
}

impl Default for AnimationManager {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_joints(scene: &SceneGraph, id: ObjectId, view: &mut AvatarView) {
    let Some(object) = scene.object(id) else {
        return;
    };
    if let Some(tag) = object.meta.joint_tag {
        view.joints.insert(
            tag,
            JointView {
                object: id,
                original_rotation: object.rotation,
                original_translation: object.translation,
            },
        );
    }
    for &child in object.children() {
        collect_joints(scene, child, view);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wideworlds_scene::{Object3d, ObjectMeta};

    /// Avatar body: a group object with a root joint (tag 1) and a head
    /// joint (tag 2).
    fn build_avatar(scene: &mut SceneGraph) -> (ObjectId, ObjectId, ObjectId) {
        let group = scene.add_object(Object3d::new("avatar"));
        let root = scene.add_object(Object3d::new("root").with_meta(ObjectMeta {
            joint_tag: Some(ROOT_JOINT),
            ..ObjectMeta::default()
        }));
        let head = scene.add_object(Object3d::new("head").with_meta(ObjectMeta {
            joint_tag: Some(2),
            ..ObjectMeta::default()
        }));
        scene.attach_child(group, root).unwrap();
        scene.attach_child(root, head).unwrap();
        (group, root, head)
    }

    fn spin_sequence(half_turn: bool) -> Sequence {
        let angle = if half_turn {
            std::f32::consts::PI
        } else {
            std::f32::consts::FRAC_PI_2
        };
        let mut f0 = SequenceFrame::default();
        f0.joints.insert(2, Quat::IDENTITY);
        f0.joints.insert(ROOT_JOINT, Quat::IDENTITY);
        f0.location = Some(Vec3::ZERO);
        let mut f1 = SequenceFrame::default();
        f1.joints.insert(2, Quat::from_rotation_y(angle));
        f1.joints.insert(ROOT_JOINT, Quat::IDENTITY);
        f1.location = Some(Vec3::new(0.0, 0.0, 1.0));
        Sequence {
            mode: SequenceMode::Binary,
            frames: vec![f0, f1],
        }
    }

    fn avatar_defs(implicit: &[(&str, &str)]) -> Vec<AvatarDef> {
        vec![AvatarDef {
            name: "default".into(),
            geometry: "avatar.rwx".into(),
            implicit: implicit
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            explicit: [("dance".to_string(), "dance.zip".to_string())]
                .into_iter()
                .collect(),
        }]
    }

    #[test]
    fn test_first_touch_queues_fetch_once() {
        let mut scene = SceneGraph::new();
        let (group, _, _) = build_avatar(&mut scene);
        let mut manager = AnimationManager::new();
        manager.load_avatars(avatar_defs(&[("walk", "walk.zip")]));

        manager.animate_implicit(&mut scene, group, 0, "walk", 0.0, 1.0, 0.0);
        manager.animate_implicit(&mut scene, group, 0, "walk", 0.1, 1.0, 0.1);
        let pending = manager.take_pending_requests();
        assert_eq!(pending, vec![(sequence_name_hash("walk.zip"), "walk.zip".into())]);
        assert!(manager.take_pending_requests().is_empty());
    }

    #[test]
    fn test_animate_applies_joint_rotation() {
        let mut scene = SceneGraph::new();
        let (group, _, head) = build_avatar(&mut scene);
        let mut manager = AnimationManager::new();
        manager.load_avatars(avatar_defs(&[("walk", "walk.zip")]));
        let hash = sequence_name_hash("walk.zip");

        manager.animate_implicit(&mut scene, group, 0, "walk", 0.0, 1.0, 0.0);
        manager.install_sequence(hash, Some(spin_sequence(false)));

        // Two binary frames: duration 1/15 s. Halfway through the first
        // bracket the head is a quarter of the way to the end pose.
        let quarter = 1.0 / 60.0;
        manager.animate_implicit(&mut scene, group, 0, "walk", quarter, 1.0, quarter);
        let rot = scene.object(head).unwrap().rotation;
        let expected = Quat::IDENTITY.slerp(Quat::from_rotation_y(std::f32::consts::FRAC_PI_2), 0.5);
        assert!(rot.angle_between(expected) < 1e-3);
    }

    #[test]
    fn test_root_translation_applied() {
        let mut scene = SceneGraph::new();
        let (group, root, _) = build_avatar(&mut scene);
        let mut manager = AnimationManager::new();
        manager.load_avatars(avatar_defs(&[("walk", "walk.zip")]));
        let hash = sequence_name_hash("walk.zip");
        manager.animate_implicit(&mut scene, group, 0, "walk", 0.0, 1.0, 0.0);
        manager.install_sequence(hash, Some(spin_sequence(false)));

        let quarter = 1.0 / 60.0;
        manager.animate_implicit(&mut scene, group, 0, "walk", quarter, 1.0, quarter);
        let z = scene.object(root).unwrap().translation.z;
        assert!((z - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_walk_falls_back_to_run() {
        let mut scene = SceneGraph::new();
        let (group, _, head) = build_avatar(&mut scene);
        let mut manager = AnimationManager::new();
        manager.load_avatars(avatar_defs(&[("run", "run.zip")]));
        let run_hash = sequence_name_hash("run.zip");
        manager.install_sequence(run_hash, Some(spin_sequence(true)));

        let quarter = 1.0 / 60.0;
        manager.animate_implicit(&mut scene, group, 0, "walk", quarter, 1.0, quarter);
        let rot = scene.object(head).unwrap().rotation;
        assert!(rot.angle_between(Quat::IDENTITY) > 0.1);
    }

    #[test]
    fn test_fly_with_nothing_resets_pose() {
        let mut scene = SceneGraph::new();
        let (group, _, head) = build_avatar(&mut scene);
        scene.object_mut(head).unwrap().rotation = Quat::from_rotation_y(1.0);
        let rest = scene.object(head).unwrap().rotation;
        let mut manager = AnimationManager::new();
        manager.load_avatars(avatar_defs(&[]));

        // Bend the head, then ask for an unavailable implicit animation.
        manager.animate_implicit(&mut scene, group, 0, "fly", 0.0, 1.0, 0.0);
        scene.object_mut(head).unwrap().rotation = Quat::from_rotation_y(2.5);
        manager.animate_implicit(&mut scene, group, 0, "fly", 0.1, 1.0, 0.1);
        let rot = scene.object(head).unwrap().rotation;
        assert!(rot.angle_between(rest) < 1e-4);
    }

    #[test]
    fn test_explicit_has_no_fallback() {
        let mut scene = SceneGraph::new();
        let (group, _, head) = build_avatar(&mut scene);
        let mut manager = AnimationManager::new();
        // Implicit walk exists, but the explicit request must not reach it.
        manager.load_avatars(avatar_defs(&[("walk", "walk.zip")]));
        manager.install_sequence(sequence_name_hash("walk.zip"), Some(spin_sequence(true)));

        manager.animate_explicit(&mut scene, group, 0, "wave", 0.05, 0.05);
        let rot = scene.object(head).unwrap().rotation;
        assert!(rot.angle_between(Quat::IDENTITY) < 1e-4);
    }

    #[test]
    fn test_explicit_rollback_tolerance() {
        let mut scene = SceneGraph::new();
        let (group, _, _) = build_avatar(&mut scene);
        let mut manager = AnimationManager::new();
        manager.load_avatars(avatar_defs(&[]));
        manager.install_sequence(sequence_name_hash("dance.zip"), Some(spin_sequence(false)));

        manager.animate_entity_exp(&mut scene, group, 0, "dance", 0.5, 0.0);
        // A slightly older remote progress keeps the local one.
        manager.animate_entity_exp(&mut scene, group, 0, "dance", 0.4, 0.1);
        assert_eq!(manager.local_explicit_progress(group), Some(0.5));
        // Beyond the tolerance the local progress resyncs.
        manager.animate_entity_exp(&mut scene, group, 0, "dance", 0.1, 0.2);
        assert_eq!(manager.local_explicit_progress(group), Some(0.1));
    }

    #[test]
    fn test_avatar_dictionary_json_shape() {
        let defs: Vec<AvatarDef> = serde_json::from_str(
            r#"[{"name": "squirrel", "geometry": "squirrel.rwx",
                 "implicit": {"walk": "qwalk.zip", "idle": "qidle.zip"},
                 "explicit": {"wave": "qwave.zip"}}]"#,
        )
        .unwrap();
        let mut manager = AnimationManager::new();
        manager.load_avatars(defs);
        let avatar = manager.avatar(0).unwrap();
        assert_eq!(avatar.name, "squirrel");
        assert_eq!(avatar.implicit["walk"], "qwalk.zip");
        assert!(manager.avatar(1).is_none());
    }

    #[test]
    fn test_crossfade_between_animations() {
        let mut scene = SceneGraph::new();
        let (group, _, head) = build_avatar(&mut scene);
        let mut manager = AnimationManager::new();
        manager.load_avatars(avatar_defs(&[("walk", "walk.zip"), ("run", "run.zip")]));
        manager.install_sequence(sequence_name_hash("walk.zip"), Some(spin_sequence(false)));
        manager.install_sequence(sequence_name_hash("run.zip"), Some(spin_sequence(true)));

        manager.animate_implicit(&mut scene, group, 0, "walk", 0.01, 1.0, 0.01);
        let walk_rot = scene.object(head).unwrap().rotation;

        // Switch to run 50 ms later: inside the crossfade window, so the
        // pose blends from the stored walk frame rather than snapping.
        manager.animate_implicit(&mut scene, group, 0, "run", 0.01, 1.0, 0.06);
        let blended = scene.object(head).unwrap().rotation;
        let run_end = Quat::from_rotation_y(std::f32::consts::PI);
        assert!(blended.angle_between(walk_rot) > 1e-3);
        assert!(blended.angle_between(run_end) > 1e-3);
    }
}
