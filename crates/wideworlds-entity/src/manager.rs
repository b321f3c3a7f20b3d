use glam::{EulerRot, Quat, Vec3};
use std::collections::{HashMap, VecDeque};
use tracing::trace;
use wideworlds_protocol::{entity_type, update_type, EntityState};
use wideworlds_scene::{NodeId, Object3d, ObjectId, SceneGraph};

/// Interpolation horizon used until two update samples exist.
pub const DEFAULT_UPDATE_TIME: f32 = 0.2;
/// Sample instants retained by the update-time sampler.
const SAMPLER_DEPTH: usize = 5;

/// Entity data-block layout: avatar id, animation hash, signed speed in
/// cm/s, explicit progress in milliseconds.
pub const BLOCK_AVATAR: usize = 0;
pub const BLOCK_ANIM_HASH: usize = 1;
pub const BLOCK_SPEED: usize = 2;
pub const BLOCK_PROGRESS: usize = 3;

/// The three animation callbacks the runtime injects, as one trait: no
/// scene references cross the boundary, only handles and block integers.
pub trait EntityAnimator {
    fn set_avatar(&mut self, scene: &mut SceneGraph, entity: ObjectId, avatar_id: u16);
    fn animate_implicit(
        &mut self,
        scene: &mut SceneGraph,
        entity: ObjectId,
        anim_hash: u16,
        speed: f32,
    );
    fn animate_explicit(
        &mut self,
        scene: &mut SceneGraph,
        entity: ObjectId,
        anim_hash: u16,
        progress: f32,
    );
}

/// Sliding sampler over the last few update instants; the reported mean
/// is over the consecutive gaps.
#[derive(Debug, Default)]
pub struct UpdateTimeSampler {
    samples: VecDeque<f64>,
}

impl UpdateTimeSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, now: f64) {
        self.samples.push_back(now);
        if self.samples.len() > SAMPLER_DEPTH {
            self.samples.pop_front();
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn average(&self) -> f32 {
        if self.samples.len() < 2 {
            return DEFAULT_UPDATE_TIME;
        }
        let gaps = self.samples.len() - 1;
        let total = self.samples.back().unwrap() - self.samples.front().unwrap();
        (total / gaps as f64) as f32
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[derive(Debug)]
struct EntityView {
    object: ObjectId,
    progress: f32,
    position: Vec3,
    rotation: Quat,
    start_time: f64,
}

/// Reconstructs smooth remote-entity motion from the low-rate state
/// stream: two snapshot buffers flipped on `update`, interpolation
/// toward the read side on every `step`.
pub struct EntityManager {
    buffers: [HashMap<u32, EntityState>; 2],
    write: usize,
    local_user_id: u32,
    root: NodeId,
    sampler: UpdateTimeSampler,
    views: HashMap<u32, EntityView>,
    reset_progress: bool,
    elapsed: f64,
}

impl EntityManager {
    /// Spawns the entities root node; remote users hang under it as
    /// `user#<id>` children.
    pub fn new(scene: &mut SceneGraph, local_user_id: u32) -> Self {
        let root = scene.spawn_node(0.0, 0.0, 0.0, false, false);
        Self {
            buffers: [HashMap::new(), HashMap::new()],
            write: 0,
            local_user_id,
            root,
            sampler: UpdateTimeSampler::new(),
            views: HashMap::new(),
            reset_progress: false,
            elapsed: 0.0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn local_user_id(&self) -> u32 {
        self.local_user_id
    }

    pub fn entity_count(&self) -> usize {
        self.views.len()
    }

    /// Apply one batch from the state channel: fill the write side with
    /// the user-type entities still present, flip, and sample the
    /// inter-update time. Readers never observe the half-written side.
    pub fn update(&mut self, states: &[EntityState], now: f64) {
        let write = &mut self.buffers[self.write];
        write.clear();
        for state in states {
            if state.entity_type != entity_type::USER {
                continue;
            }
            if state.update_type == update_type::LEAVING {
                continue;
            }
            write.insert(state.entity_id, *state);
        }
        self.write = 1 - self.write;
        self.sampler.sample(now);
        self.reset_progress = true;
    }

    fn read_buffer(&self) -> &HashMap<u32, EntityState> {
        &self.buffers[1 - self.write]
    }

    /// Advance every tracked entity by `delta` seconds toward its read
    /// target, spawning newcomers and removing the departed.
    pub fn step(&mut self, scene: &mut SceneGraph, delta: f32, animator: &mut dyn EntityAnimator) {
        self.elapsed += delta as f64;
        if self.reset_progress {
            for view in self.views.values_mut() {
                view.progress = 0.0;
            }
            self.reset_progress = false;
        }

        let avg = self.sampler.average().max(1e-4);
        let read: Vec<EntityState> = self.read_buffer().values().copied().collect();

        let departed: Vec<u32> = self
            .views
            .keys()
            .copied()
            .filter(|id| !self.read_buffer().contains_key(id))
            .collect();

        for state in read {
            if state.entity_id == self.local_user_id {
                continue;
            }
            self.step_entity(scene, &state, delta, avg, animator);
        }

        for id in departed {
            if let Some(view) = self.views.remove(&id) {
                trace!(entity = id, "removing departed entity");
                let _ = scene.remove_object(self.root, view.object);
            }
        }
    }

    fn step_entity(
        &mut self,
        scene: &mut SceneGraph,
        state: &EntityState,
        delta: f32,
        avg: f32,
        animator: &mut dyn EntityAnimator,
    ) {
        let target_pos = Vec3::new(state.x, state.y, state.z);
        let target_rot = Quat::from_euler(EulerRot::YXZ, state.yaw, state.pitch, state.roll);

        let object = match self.views.get_mut(&state.entity_id) {
            None => {
                // Newcomer: snap to the target pose.
                let object = scene.add_object(Object3d::new(format!("user#{}", state.entity_id)));
                if let Some(o) = scene.object_mut(object) {
                    o.translation = target_pos;
                    o.rotation = target_rot;
                }
                let _ = scene.append(self.root, object, 0, false);
                self.views.insert(
                    state.entity_id,
                    EntityView {
                        object,
                        progress: 1.0,
                        position: target_pos,
                        rotation: target_rot,
                        start_time: self.elapsed,
                    },
                );
                object
            }
            Some(view) => {
                let prev = view.progress;
                let progress = (prev + delta / avg).min(1.0);
                if progress >= 1.0 {
                    view.position = target_pos;
                    view.rotation = target_rot;
                } else {
                    // Close the remaining distance so the pose lands on
                    // the target exactly when progress does, regardless
                    // of frame cadence.
                    let weight = (progress - prev) / (1.0 - prev);
                    view.position = view.position.lerp(target_pos, weight);
                    view.rotation = view.rotation.slerp(target_rot, weight);
                }
                view.progress = progress;
                let (position, rotation, object) = (view.position, view.rotation, view.object);
                if let Some(o) = scene.object_mut(object) {
                    o.translation = position;
                    o.rotation = rotation;
                }
                object
            }
        };

        animator.set_avatar(scene, object, state.data_block[BLOCK_AVATAR]);
        let speed = state.data_block[BLOCK_SPEED] as i16 as f32 / 100.0;
        let progress = state.data_block[BLOCK_PROGRESS] as i16 as f32 / 1000.0;
        let hash = state.data_block[BLOCK_ANIM_HASH];
        if progress > 0.0 {
            animator.animate_explicit(scene, object, hash, progress);
        } else {
            animator.animate_implicit(scene, object, hash, speed);
        }
    }

    pub fn entity_object(&self, id: u32) -> Option<ObjectId> {
        self.views.get(&id).map(|v| v.object)
    }

    pub fn entity_start_time(&self, id: u32) -> Option<f64> {
        self.views.get(&id).map(|v| v.start_time)
    }

    /// Snapshot of every tracked entity: id, scene object, start time.
    pub fn view_objects(&self) -> Vec<(u32, ObjectId, f64)> {
        self.views
            .iter()
            .map(|(&id, v)| (id, v.object, v.start_time))
            .collect()
    }

    pub fn average_update_time(&self) -> f32 {
        self.sampler.average()
    }

    /// Drop every tracked entity and both snapshot buffers.
    pub fn clear(&mut self, scene: &mut SceneGraph) {
        for view in self.views.values() {
            let _ = scene.remove_object(self.root, view.object);
        }
        self.views.clear();
        self.buffers = [HashMap::new(), HashMap::new()];
        self.write = 0;
        self.sampler.clear();
        self.reset_progress = false;
    }
}
