use crate::commands::{parse_command, Command};
use crate::config::ClientConfig;
use crate::io::{Completion, IoRequest, PropBatch};
use crate::materials::MaterialRegistry;
use crate::models::{ModelProvider, ModelRegistry};
use glam::{DVec3, EulerRot, Quat, Vec3};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wideworlds_entity::{AnimationManager, EntityAnimator, EntityManager};
use wideworlds_events::UserFeed;
use wideworlds_physics::{ColliderProbe, TreeProbe, UserCollider};
use wideworlds_protocol::{sequence_name_hash, unpack_entity_states, WorldUpdate};
use wideworlds_scene::{
    AxisAlignment, NodeId, Object3d, ObjectId, ObjectMeta, SceneGraph,
};
use wideworlds_scenery::{BackgroundScenery, PoolKey, SceneryUpdater};
use wideworlds_types::{
    aw_yaw_deg_to_rad, ChunkPos, Color, FogSettings, PagePos, Prop, PropUpdate, SkyColors,
    WorldDescriptor, DEFAULT_CHUNK_SIDE, DEFAULT_PAGE_DIAMETER,
};
use wideworlds_world::{
    build_terrain_mesh, build_water_mesh, stitch_page_edges, TerrainPageData,
};

/// Seconds between scenery updater commits.
pub const SCENERY_COMMIT_INTERVAL: f64 = 5.0;
/// Below this squared displacement per frame the user counts as still.
const STATIONARY_EPSILON: f64 = 1e-6;

#[derive(Debug)]
struct PropView {
    prop: Prop,
    object: ObjectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Loading,
    Loaded,
}

struct ChunkEntry {
    node: NodeId,
    state: ChunkState,
    props: HashMap<u32, PropView>,
}

struct PageEntry {
    node: NodeId,
    data: TerrainPageData,
    edges: Option<ObjectId>,
}

struct WaterPageEntry {
    node: NodeId,
}

#[derive(Debug, Default)]
struct IdleState {
    active: bool,
    angle: f32,
    radius: f32,
    last_step: f64,
}

/// The local user as the runtime tracks it.
#[derive(Debug, Clone)]
pub struct UserState {
    pub position: DVec3,
    /// Radians, GL-South convention.
    pub yaw: f32,
    pub pitch: f32,
    pub walk_speed: f32,
    pub run_speed: f32,
}

/// Environment the rendering backend reads every frame.
#[derive(Debug, Clone)]
pub struct Environment {
    pub sky: SkyColors,
    pub ambient: Color,
    pub fog: FogSettings,
    pub directional_color: Color,
    pub directional_position: [f32; 3],
    pub underwater: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchKind {
    Create,
    Update,
    Delete,
}

struct PendingBatch {
    kind: BatchKind,
    /// Scene state before the optimistic change: `Some` restores the
    /// prop, `None` removes it (creates).
    prior: HashMap<u32, Option<Prop>>,
}

/// The client-side world runtime: owns the scene graph and every
/// per-world registry, advances them once per frame, and talks to the
/// I/O task through its request/completion channels.
pub struct WorldRuntime {
    pub scene: SceneGraph,
    scenery: BackgroundScenery,
    scenery_updater: SceneryUpdater,
    entities: EntityManager,
    animation: AnimationManager,
    models: ModelRegistry,
    materials: MaterialRegistry,
    feed: UserFeed,
    config: ClientConfig,
    world: WorldDescriptor,
    environment: Environment,

    io_tx: mpsc::UnboundedSender<IoRequest>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    generation: u64,

    chunks: HashMap<ChunkPos, ChunkEntry>,
    prop_locations: HashMap<u32, ChunkPos>,
    pages: HashMap<PagePos, PageEntry>,
    water_pages: HashMap<PagePos, WaterPageEntry>,
    chunk_side: f32,
    page_diameter: usize,
    disc_pattern: Vec<(i32, i32)>,

    user: UserState,
    current_chunk: Option<ChunkPos>,
    collider: UserCollider,
    last_probe: ColliderProbe,
    movement_direction: Option<Vec3>,

    idle: IdleState,
    stationary_since: Option<f64>,
    last_position: DVec3,

    page_load_running: bool,
    water_load_running: bool,

    anim_names: HashMap<u16, String>,
    entity_avatars: HashMap<ObjectId, u16>,

    pending_batches: HashMap<u64, PendingBatch>,
    next_batch_id: u64,
    next_seed_id: u32,

    elapsed: f64,
    last_scenery_commit: f64,
}

impl WorldRuntime {
    pub fn new(
        config: ClientConfig,
        world: WorldDescriptor,
        local_user_id: u32,
        model_provider: Box<dyn ModelProvider>,
        io_tx: mpsc::UnboundedSender<IoRequest>,
        completion_rx: mpsc::UnboundedReceiver<Completion>,
    ) -> Self {
        let mut scene = SceneGraph::new();
        let entities = EntityManager::new(&mut scene, local_user_id);

        let entry = &world.entry_point;
        let user = UserState {
            position: DVec3::new(entry.x, entry.y, entry.z),
            yaw: aw_yaw_deg_to_rad(entry.yaw),
            pitch: 0.0,
            walk_speed: config.controls.walk_speed,
            run_speed: config.controls.run_speed,
        };

        let environment = Environment {
            sky: world.sky_colors.clone(),
            ambient: world.ambient_color,
            fog: world.fog.clone(),
            directional_color: world.directional_color,
            // World documents store the light in data convention; the
            // runtime negates all three axes.
            directional_position: [
                -world.directional_position[0],
                -world.directional_position[1],
                -world.directional_position[2],
            ],
            underwater: false,
        };

        let chunk_side = DEFAULT_CHUNK_SIDE;
        let disc_pattern =
            build_disc_pattern(config.graphics.props_loading_distance, chunk_side);

        info!(world = %world.name, "world runtime ready");

        Self {
            scene,
            scenery: BackgroundScenery::new(),
            scenery_updater: SceneryUpdater::new(),
            entities,
            animation: AnimationManager::new(),
            models: ModelRegistry::new(model_provider),
            materials: MaterialRegistry::new(),
            feed: UserFeed::new(),
            config,
            world,
            environment,
            io_tx,
            completion_rx,
            generation: 0,
            chunks: HashMap::new(),
            prop_locations: HashMap::new(),
            pages: HashMap::new(),
            water_pages: HashMap::new(),
            chunk_side,
            page_diameter: DEFAULT_PAGE_DIAMETER,
            disc_pattern,
            user,
            current_chunk: None,
            collider: UserCollider::new(),
            last_probe: ColliderProbe::default(),
            movement_direction: None,
            idle: IdleState::default(),
            stationary_since: None,
            last_position: DVec3::ZERO,
            page_load_running: false,
            water_load_running: false,
            anim_names: HashMap::new(),
            entity_avatars: HashMap::new(),
            pending_batches: HashMap::new(),
            next_batch_id: 1,
            next_seed_id: 0x4000_0000,
            elapsed: 0.0,
            last_scenery_commit: 0.0,
        }
    }

    pub fn user(&self) -> &UserState {
        &self.user
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn feed_mut(&mut self) -> &mut UserFeed {
        &mut self.feed
    }

    pub fn scenery(&self) -> &BackgroundScenery {
        &self.scenery
    }

    pub fn last_probe(&self) -> ColliderProbe {
        self.last_probe
    }

    pub fn loaded_chunk_count(&self) -> usize {
        self.chunks
            .values()
            .filter(|c| c.state == ChunkState::Loaded)
            .count()
    }

    pub fn chunk_node(&self, pos: ChunkPos) -> Option<NodeId> {
        self.chunks.get(&pos).map(|c| c.node)
    }

    /// Node the remote users hang under.
    pub fn entities_root(&self) -> NodeId {
        self.entities.root()
    }

    /// The horizontal direction the user is moving in, fed to the
    /// collider's forward ray.
    pub fn set_movement_direction(&mut self, direction: Option<Vec3>) {
        self.movement_direction = direction;
    }

    /// Register the world's avatar dictionary and fit the collider box
    /// to the local avatar's body.
    pub fn set_avatars(&mut self, avatars: Vec<wideworlds_entity::AvatarDef>) {
        for avatar in &avatars {
            for name in avatar.implicit.keys().chain(avatar.explicit.keys()) {
                self.anim_names
                    .insert(sequence_name_hash(name), name.clone());
            }
        }
        if let Some(model) = avatars
            .first()
            .and_then(|avatar| self.models.resolve(&avatar.geometry))
        {
            self.collider
                .adjust_to_object(&model.geometry.bounds(), true);
        }
        self.animation.load_avatars(avatars);
    }

    /// One frame. The order is load-bearing: completions, texture
    /// animation, water, scenery commit, chunk transition or idle
    /// loading, collider, page loads, entity step.
    pub fn update(&mut self, position: DVec3, delta: f32) {
        let moved = (position - self.last_position).length_squared() > STATIONARY_EPSILON;
        self.last_position = position;
        self.user.position = position;
        self.elapsed += delta as f64;

        self.drain_completions();

        // a. Animated textures on their shared period.
        self.materials.advance(self.elapsed);

        // b. Water level and the underwater probe.
        self.step_water();

        // c. Scenery commit on cooldown.
        if self.elapsed - self.last_scenery_commit > SCENERY_COMMIT_INTERVAL {
            self.scenery_updater.commit(&mut self.scenery);
            self.last_scenery_commit = self.elapsed;
        }

        // d/e. Chunk transition, or idle loading while standing still.
        let chunk = ChunkPos::from_world(position.x, position.z, self.chunk_side);
        if self.current_chunk != Some(chunk) {
            self.current_chunk = Some(chunk);
            self.reset_idle();
            self.run_chunk_loading(chunk);
            self.run_lod_transitions();
        } else {
            if moved {
                self.stationary_since = None;
                self.reset_idle();
            } else if self.stationary_since.is_none() {
                self.stationary_since = Some(self.elapsed);
            }
            self.run_idle_loading();
        }

        // f. Collider against the current chunk and terrain page.
        self.update_collider();

        // g. Terrain and water page neighborhoods.
        self.run_page_loading(position);

        // Remote entities last, so they interpolate against this frame's
        // snapshot state.
        self.step_entities(delta);
        self.scene.update_dynamic(position.as_vec3());
    }

    /// Binary payload from the state channel. Malformed payloads are
    /// dropped and logged.
    pub fn ingest_entity_states(&mut self, payload: &[u8]) {
        match unpack_entity_states(payload) {
            Ok(states) => self.entities.update(&states, self.elapsed),
            Err(e) => warn!(error = %e, "dropping malformed entity state payload"),
        }
    }

    /// One message from the world-update channel. Scene mutations finish
    /// before the touched chunk bounds rebuild.
    pub fn apply_world_update(&mut self, update: WorldUpdate) {
        let mut touched: Vec<ChunkPos> = Vec::new();
        match update {
            WorldUpdate::Create(props) => {
                for prop in props {
                    let chunk = prop.chunk_pos(self.chunk_side);
                    if self.is_chunk_loaded(chunk) {
                        self.add_prop_object(chunk, prop);
                        touched.push(chunk);
                    }
                }
            }
            WorldUpdate::Update(props) => {
                for prop in props {
                    let Some(old_chunk) = self.prop_locations.get(&prop.id).copied() else {
                        continue;
                    };
                    self.remove_prop_object(prop.id);
                    touched.push(old_chunk);
                    let new_chunk = prop.chunk_pos(self.chunk_side);
                    if self.is_chunk_loaded(new_chunk) {
                        self.add_prop_object(new_chunk, prop);
                        touched.push(new_chunk);
                    }
                }
            }
            WorldUpdate::Delete(ids) => {
                for id in ids {
                    if let Some(chunk) = self.prop_locations.get(&id).copied() {
                        self.remove_prop_object(id);
                        touched.push(chunk);
                    }
                }
            }
        }
        touched.sort_unstable_by_key(|p| (p.cx, p.cz));
        touched.dedup();
        for chunk in touched {
            self.rebuild_chunk_bounds(chunk);
        }
    }

    /// Chat input entry point. Returns true when the line was consumed
    /// as a command (or a command error).
    pub fn handle_chat_input(&mut self, input: &str) -> bool {
        match parse_command(input) {
            None => false,
            Some(Err(code)) => {
                self.feed.error(code);
                true
            }
            Some(Ok(command)) => {
                self.execute_command(command);
                true
            }
        }
    }

    /// Optimistic prop creation; the server's ternary verdict arrives
    /// through the completion queue.
    pub fn create_props(&mut self, props: Vec<Prop>) {
        let mut prior = HashMap::new();
        let mut touched = Vec::new();
        for prop in &props {
            let chunk = prop.chunk_pos(self.chunk_side);
            prior.insert(prop.id, None);
            if self.is_chunk_loaded(chunk) {
                self.add_prop_object(chunk, prop.clone());
                touched.push(chunk);
            }
        }
        for chunk in touched {
            self.rebuild_chunk_bounds(chunk);
        }
        self.send_batch(BatchKind::Create, prior, PropBatch::Create(props));
    }

    /// Optimistic prop update from full replacement records.
    pub fn update_props(&mut self, props: Vec<Prop>) {
        let mut prior = HashMap::new();
        let mut updates = Vec::new();
        for prop in &props {
            let existing = self
                .prop_locations
                .get(&prop.id)
                .and_then(|chunk| self.chunks.get(chunk))
                .and_then(|entry| entry.props.get(&prop.id))
                .map(|view| view.prop.clone());
            prior.insert(prop.id, existing);
            updates.push(PropUpdate {
                id: prop.id,
                x: Some(prop.x),
                y: Some(prop.y),
                z: Some(prop.z),
                yaw: Some(prop.yaw),
                pitch: Some(prop.pitch),
                roll: Some(prop.roll),
                name: Some(prop.name.clone()),
                description: Some(prop.description.clone()),
                action: Some(prop.action.clone()),
            });
        }
        self.apply_world_update(WorldUpdate::Update(props));
        self.send_batch(BatchKind::Update, prior, PropBatch::Update(updates));
    }

    /// Optimistic prop deletion.
    pub fn delete_props(&mut self, ids: Vec<u32>) {
        let mut prior = HashMap::new();
        for &id in &ids {
            let existing = self
                .prop_locations
                .get(&id)
                .and_then(|chunk| self.chunks.get(chunk))
                .and_then(|entry| entry.props.get(&id))
                .map(|view| view.prop.clone());
            prior.insert(id, existing);
        }
        self.apply_world_update(WorldUpdate::Delete(ids.clone()));
        self.send_batch(BatchKind::Delete, prior, PropBatch::Delete(ids));
    }

    /// Teleport the user; yaw is in world-data degrees when given.
    pub fn teleport(&mut self, x: f64, y: f64, z: f64, yaw_deg: Option<f32>) {
        self.user.position = DVec3::new(x, y, z);
        if let Some(yaw) = yaw_deg {
            self.user.yaw = aw_yaw_deg_to_rad(yaw);
        }
    }

    /// Collision readiness at a position. The chunk map and the page map
    /// are consulted separately, each with its own key.
    pub fn is_position_collision_ready(&self, position: DVec3) -> bool {
        let chunk = ChunkPos::from_world(position.x, position.z, self.chunk_side);
        let chunk_ready = self
            .chunks
            .get(&chunk)
            .map(|entry| self.scene.bounds_ready(entry.node))
            .unwrap_or(false);
        if !chunk_ready {
            return false;
        }
        if !self.world.terrain.enabled {
            return true;
        }
        let page = PagePos::from_world(position.x, position.z, self.page_diameter);
        self.pages
            .get(&page)
            .map(|entry| self.scene.bounds_ready(entry.node))
            .unwrap_or(false)
    }

    /// Tear the world down: every handle, registry and buffer goes.
    /// In-flight loads die on the generation check.
    pub fn unload(&mut self) {
        self.generation += 1;
        for (_, entry) in self.chunks.drain() {
            let _ = self.scene.remove_node(entry.node);
        }
        for (_, entry) in self.pages.drain() {
            let _ = self.scene.remove_node(entry.node);
        }
        for (_, entry) in self.water_pages.drain() {
            let _ = self.scene.remove_node(entry.node);
        }
        self.prop_locations.clear();
        self.scenery.clear();
        self.scenery_updater.clear();
        self.entities.clear(&mut self.scene);
        self.animation.clear();
        self.models.clear();
        self.materials.dispose();
        self.anim_names.clear();
        self.entity_avatars.clear();
        self.pending_batches.clear();
        self.reset_idle();
        self.stationary_since = None;
        self.current_chunk = None;
        self.page_load_running = false;
        self.water_load_running = false;
        self.environment.underwater = false;
        info!("world unloaded");
    }

    /// Queue one chunk for loading. Present chunks (loaded or loading)
    /// return immediately.
    pub fn load_chunk(&mut self, pos: ChunkPos, hide: bool, lazy: bool) {
        if self.chunks.contains_key(&pos) {
            return;
        }
        let anchor = pos.anchor(self.chunk_side);
        let node = self
            .scene
            .spawn_node(anchor.x as f32, 0.0, anchor.z as f32, true, hide);
        self.chunks.insert(
            pos,
            ChunkEntry {
                node,
                state: ChunkState::Loading,
                props: HashMap::new(),
            },
        );
        let _ = self.io_tx.send(IoRequest::FetchChunk {
            generation: self.generation,
            pos,
            hide,
            lazy,
        });
    }

    fn is_chunk_loaded(&self, pos: ChunkPos) -> bool {
        self.chunks
            .get(&pos)
            .map(|c| c.state == ChunkState::Loaded)
            .unwrap_or(false)
    }

    fn drain_completions(&mut self) {
        while let Ok(completion) = self.completion_rx.try_recv() {
            match completion {
                Completion::ChunkLoaded {
                    generation,
                    pos,
                    hide: _,
                    props,
                } => {
                    if generation != self.generation {
                        continue;
                    }
                    self.materialize_chunk(pos, props);
                }
                Completion::ChunkFailed {
                    generation,
                    pos,
                    error,
                } => {
                    if generation != self.generation {
                        continue;
                    }
                    warn!(%pos, error = %error, "chunk load failed");
                    self.feed.warning(format!("Could not load chunk {}", pos));
                    if let Some(entry) = self.chunks.remove(&pos) {
                        let _ = self.scene.remove_node(entry.node);
                    }
                }
                Completion::TerrainPageLoaded {
                    generation,
                    pos,
                    data,
                } => {
                    self.page_load_running = false;
                    if generation != self.generation {
                        continue;
                    }
                    self.install_terrain_page(pos, data);
                }
                Completion::WaterPageLoaded {
                    generation, pos, ..
                } => {
                    self.water_load_running = false;
                    if generation != self.generation {
                        continue;
                    }
                    self.install_water_page(pos);
                }
                Completion::PageFailed {
                    generation,
                    pos,
                    error,
                } => {
                    self.page_load_running = false;
                    self.water_load_running = false;
                    if generation != self.generation {
                        continue;
                    }
                    warn!(%pos, error = %error, "page load failed");
                    self.feed.warning(format!("Could not load page {}", pos));
                }
                Completion::SequenceLoaded { hash, sequence } => {
                    self.animation.install_sequence(hash, sequence);
                }
                Completion::BatchDone { batch_id, status } => {
                    self.reconcile_batch(batch_id, Some(status));
                }
                Completion::BatchFailed { batch_id, error } => {
                    warn!(batch_id, error = %error, "prop batch failed");
                    self.reconcile_batch(batch_id, None);
                }
            }
        }
    }

    fn materialize_chunk(&mut self, pos: ChunkPos, props: Vec<Prop>) {
        let Some(entry) = self.chunks.get(&pos) else {
            // The chunk left the map while its fetch was in flight.
            return;
        };
        let visible = self.scene.is_visible(entry.node).unwrap_or(false);
        if visible {
            // Full-detail props are about to appear; hide the instanced
            // stand-ins for this chunk.
            self.scenery.mask(pos);
        }
        for prop in props {
            self.add_prop_object(pos, prop);
        }
        self.rebuild_chunk_bounds(pos);
        if let Some(entry) = self.chunks.get_mut(&pos) {
            entry.state = ChunkState::Loaded;
        }
        debug!(%pos, "chunk materialized");
    }

    /// Materialize one prop into its chunk node, register it with the
    /// background scenery, and index it. Scene failures abort this prop
    /// only.
    fn add_prop_object(&mut self, chunk: ChunkPos, prop: Prop) {
        let Some(entry) = self.chunks.get(&chunk) else {
            return;
        };
        let node = entry.node;
        let Some(model) = self.models.resolve(&prop.name) else {
            debug!(name = %prop.name, "prop model unresolved, skipping");
            return;
        };

        let anchor = chunk.anchor(self.chunk_side);
        let local = (prop.position() - anchor).as_vec3();
        let dynamic = model.axis_alignment != AxisAlignment::None;

        let object = self.scene.add_object(
            Object3d::new(prop.name.clone())
                .with_geometry(model.geometry.clone())
                .with_meta(ObjectMeta {
                    solid: model.solid,
                    axis_alignment: model.axis_alignment,
                    joint_tag: None,
                    prop_id: Some(prop.id),
                }),
        );
        if let Some(o) = self.scene.object_mut(object) {
            o.translation = local;
            o.rotation = Quat::from_euler(EulerRot::YXZ, prop.yaw, prop.pitch, prop.roll);
        }
        if let Err(e) = self.scene.append(node, object, 0, dynamic) {
            warn!(prop = prop.id, error = %e, "prop attach failed");
            return;
        }

        if self.config.graphics.background_scenery.enabled {
            if let Ok(matrix) = self.scene.object_world_matrix(node, object) {
                self.scenery_updater.stage_set(
                    prop.id,
                    chunk,
                    PoolKey::new(prop.name.clone(), model.variant_hash),
                    matrix,
                );
            }
        }

        self.prop_locations.insert(prop.id, chunk);
        if let Some(entry) = self.chunks.get_mut(&chunk) {
            entry.props.insert(prop.id, PropView { prop, object });
        }
    }

    fn remove_prop_object(&mut self, id: u32) -> Option<Prop> {
        let chunk = self.prop_locations.remove(&id)?;
        let entry = self.chunks.get_mut(&chunk)?;
        let view = entry.props.remove(&id)?;
        let node = entry.node;
        let _ = self.scene.remove_object(node, view.object);
        self.scenery_updater.stage_unset(id);
        Some(view.prop)
    }

    fn rebuild_chunk_bounds(&mut self, pos: ChunkPos) {
        if let Some(entry) = self.chunks.get(&pos) {
            let node = entry.node;
            let _ = self
                .scene
                .update_bounds(node, &|o| o.meta.solid, None, Vec3::ZERO);
        }
    }

    fn run_chunk_loading(&mut self, center: ChunkPos) {
        let pattern = self.disc_pattern.clone();
        for (dx, dz) in pattern {
            self.load_chunk(ChunkPos::new(center.cx + dx, center.cz + dz), false, true);
        }
    }

    fn run_lod_transitions(&mut self) {
        let camera = self.user.position.as_vec3();
        let by_node: HashMap<NodeId, ChunkPos> = self
            .chunks
            .iter()
            .map(|(pos, entry)| (entry.node, *pos))
            .collect();
        let candidates: Vec<NodeId> = by_node.keys().copied().collect();
        let transitions = self.scene.update_lods(
            &candidates,
            camera,
            self.config.graphics.rendering_distance,
        );
        // Chunks entering full detail hide their instanced stand-ins;
        // chunks dropping out of range show them again.
        for node in transitions.visible {
            if let Some(pos) = by_node.get(&node) {
                self.scenery.mask(*pos);
            }
        }
        for node in transitions.turned_invisible {
            if let Some(pos) = by_node.get(&node) {
                self.scenery.unmask(*pos);
            }
        }
    }

    fn reset_idle(&mut self) {
        self.idle = IdleState::default();
    }

    fn run_idle_loading(&mut self) {
        let idle_config = &self.config.graphics.idle_props_loading;
        if idle_config.speed <= 0.0 {
            return;
        }
        let Some(since) = self.stationary_since else {
            return;
        };
        if self.elapsed - since < idle_config.downtime as f64 {
            return;
        }
        let cooldown = 1.0 / idle_config.speed as f64;
        if self.elapsed - self.idle.last_step < cooldown {
            return;
        }
        self.idle.last_step = self.elapsed;

        if !self.idle.active {
            self.idle.active = true;
            self.idle.radius = self.chunk_side;
            self.idle.angle = 0.0;
        }
        if self.idle.radius > idle_config.distance {
            return;
        }

        let (sin, cos) = self.idle.angle.sin_cos();
        let x = self.user.position.x + (self.idle.radius * cos) as f64;
        let z = self.user.position.z + (self.idle.radius * sin) as f64;
        let pos = ChunkPos::from_world(x, z, self.chunk_side);
        if !self.chunks.contains_key(&pos) {
            debug!(%pos, "idle spiral load");
            self.load_chunk(pos, true, true);
        }

        let circumference_steps =
            ((std::f32::consts::TAU * self.idle.radius) / self.chunk_side).floor();
        self.idle.angle += std::f32::consts::TAU / circumference_steps.max(1.0);
        if self.idle.angle > std::f32::consts::TAU {
            self.idle.angle = 0.0;
            self.idle.radius += self.chunk_side;
        }
    }

    fn update_collider(&mut self) {
        let position = self.user.position.as_vec3();
        self.collider.put_collider_box(
            position.x,
            position.y,
            position.z,
            self.movement_direction,
        );

        let mut nodes: Vec<NodeId> = Vec::new();
        if let Some(chunk) = self.current_chunk {
            for dz in -1..=1 {
                for dx in -1..=1 {
                    let neighbor = ChunkPos::new(chunk.cx + dx, chunk.cz + dz);
                    if let Some(entry) = self.chunks.get(&neighbor) {
                        nodes.push(entry.node);
                    }
                }
            }
        }
        let page = PagePos::from_world(
            self.user.position.x,
            self.user.position.z,
            self.page_diameter,
        );
        if let Some(entry) = self.pages.get(&page) {
            nodes.push(entry.node);
        }

        let mut probes = Vec::new();
        for node in nodes {
            // Nodes without both a tree and a matrix are skipped.
            let Some(bvh) = self.scene.bounds_tree(node) else {
                continue;
            };
            let Ok(world) = self.scene.world_matrix(node) else {
                continue;
            };
            let offset = self.scene.bounds_offset(node).unwrap_or(Vec3::ZERO);
            probes.push((bvh, world, offset));
        }
        // The movement layer reads the probe next frame and applies the
        // correction itself.
        self.last_probe = self.collider.probe(probes.iter().map(|(bvh, world, offset)| {
            TreeProbe {
                bvh: bvh.as_ref(),
                world: *world,
                offset: *offset,
            }
        }));
    }

    fn run_page_loading(&mut self, position: DVec3) {
        let page = PagePos::from_world(position.x, position.z, self.page_diameter);
        if self.world.terrain.enabled && !self.page_load_running {
            if let Some(next) = self.next_missing_page(page, false) {
                self.page_load_running = true;
                let _ = self.io_tx.send(IoRequest::FetchTerrainPage {
                    generation: self.generation,
                    pos: next,
                });
            }
        }
        if self.world.water.enabled && !self.water_load_running {
            if let Some(next) = self.next_missing_page(page, true) {
                self.water_load_running = true;
                let _ = self.io_tx.send(IoRequest::FetchWaterPage {
                    generation: self.generation,
                    pos: next,
                });
            }
        }
    }

    fn next_missing_page(&self, center: PagePos, water: bool) -> Option<PagePos> {
        // Center first, then the ring.
        const OFFSETS: [(i32, i32); 9] = [
            (0, 0),
            (1, 0),
            (-1, 0),
            (0, 1),
            (0, -1),
            (1, 1),
            (1, -1),
            (-1, 1),
            (-1, -1),
        ];
        OFFSETS
            .iter()
            .map(|(dx, dz)| PagePos::new(center.px + dx, center.pz + dz))
            .find(|pos| {
                if water {
                    !self.water_pages.contains_key(pos)
                } else {
                    !self.pages.contains_key(pos)
                }
            })
    }

    fn install_terrain_page(&mut self, pos: PagePos, data: TerrainPageData) {
        let mesh = match build_terrain_mesh(&data, self.page_diameter) {
            Ok(mesh) => mesh,
            Err(e) => {
                warn!(%pos, error = %e, "terrain page rejected");
                return;
            }
        };
        let anchor = pos.anchor(self.page_diameter);
        let node = self.scene.spawn_node(
            anchor.x as f32,
            self.world.terrain.offset,
            anchor.z as f32,
            false,
            false,
        );
        let surface = self
            .scene
            .add_object(Object3d::new("terrain").with_geometry(std::sync::Arc::new(mesh)));
        if self.scene.append(node, surface, 0, false).is_err() {
            return;
        }
        self.pages.insert(
            pos,
            PageEntry {
                node,
                data,
                edges: None,
            },
        );
        self.rebuild_page_bounds(pos);

        // Stitch this page and every loaded neighbor it borders.
        for stitch_pos in [
            pos,
            PagePos::new(pos.px - 1, pos.pz),
            PagePos::new(pos.px, pos.pz - 1),
            PagePos::new(pos.px - 1, pos.pz - 1),
        ] {
            self.restitch_page(stitch_pos);
        }
        debug!(%pos, "terrain page installed");
    }

    fn restitch_page(&mut self, pos: PagePos) {
        let Some(entry) = self.pages.get(&pos) else {
            return;
        };
        let node = entry.node;
        let old_edges = entry.edges;
        let east = self.pages.get(&PagePos::new(pos.px + 1, pos.pz));
        let south = self.pages.get(&PagePos::new(pos.px, pos.pz + 1));
        let southeast = self.pages.get(&PagePos::new(pos.px + 1, pos.pz + 1));
        let strip = match stitch_page_edges(
            &self.pages[&pos].data,
            east.map(|p| &p.data),
            south.map(|p| &p.data),
            southeast.map(|p| &p.data),
            self.page_diameter,
        ) {
            Ok(strip) => strip,
            Err(e) => {
                warn!(%pos, error = %e, "page stitch failed");
                return;
            }
        };
        if let Some(old) = old_edges {
            let _ = self.scene.remove_object(node, old);
        }
        let edges = self
            .scene
            .add_object(Object3d::new("terrain-edges").with_geometry(std::sync::Arc::new(strip)));
        if self.scene.append(node, edges, 0, false).is_err() {
            return;
        }
        if let Some(entry) = self.pages.get_mut(&pos) {
            entry.edges = Some(edges);
        }
        self.rebuild_page_bounds(pos);
    }

    fn rebuild_page_bounds(&mut self, pos: PagePos) {
        let Some(entry) = self.pages.get(&pos) else {
            return;
        };
        let node = entry.node;
        // Page meshes go through the specialized selector: only the
        // textured surface groups collide.
        let selector = |object: &Object3d| -> Option<Vec<wideworlds_physics::Triangle>> {
            object.geometry.as_ref().map(|geometry| {
                geometry
                    .triangles()
                    .map(|[a, b, c]| wideworlds_physics::Triangle::new(a, b, c))
                    .collect()
            })
        };
        let _ = self
            .scene
            .update_bounds(node, &|_| true, Some(&selector), Vec3::ZERO);
    }

    fn install_water_page(&mut self, pos: PagePos) {
        let mesh = build_water_mesh(self.page_diameter);
        let anchor = pos.anchor(self.page_diameter);
        let node = self.scene.spawn_node(
            anchor.x as f32,
            self.world.water.level,
            anchor.z as f32,
            false,
            false,
        );
        let object = self
            .scene
            .add_object(Object3d::new("water").with_geometry(std::sync::Arc::new(mesh)));
        if self.scene.append(node, object, 0, false).is_err() {
            return;
        }
        self.materials
            .register(format!("water#{}", pos), self.world.water.texture.clone(), 4);
        self.water_pages.insert(pos, WaterPageEntry { node });
        debug!(%pos, "water page installed");
    }

    fn step_water(&mut self) {
        if !self.world.water.enabled {
            return;
        }
        let water = &self.world.water;
        let level = water.level
            + (self.elapsed as f32 * water.speed).sin() * 0.5 * water.surface_move;
        for entry in self.water_pages.values() {
            if let Ok(pos) = self.scene.node_position(entry.node) {
                let _ = self.scene.set_node_position(entry.node, pos.x, level, pos.z);
            }
        }

        // Probe straight up from the camera: inside the water volume the
        // surface is overhead.
        let page = PagePos::from_world(
            self.user.position.x,
            self.user.position.z,
            self.page_diameter,
        );
        let underwater = self
            .water_pages
            .get(&page)
            .and_then(|entry| {
                self.scene
                    .intersect_from_camera(entry.node, self.user.position.as_vec3(), None, true)
                    .ok()
                    .flatten()
            })
            .is_some();
        if underwater != self.environment.underwater {
            self.environment.underwater = underwater;
            if underwater {
                self.environment.ambient = water.under_ambient;
                self.environment.fog = water.under_fog.clone();
            } else {
                self.environment.ambient = self.world.ambient_color;
                self.environment.fog = self.world.fog.clone();
            }
        }
    }

    fn step_entities(&mut self, delta: f32) {
        let start_times: HashMap<ObjectId, f64> = self
            .entities
            .view_objects()
            .into_iter()
            .map(|(_, object, start)| (object, start))
            .collect();
        let mut animator = RuntimeAnimator {
            animation: &mut self.animation,
            anim_names: &self.anim_names,
            avatars: &mut self.entity_avatars,
            start_times: &start_times,
            now: self.elapsed,
        };
        self.entities.step(&mut self.scene, delta, &mut animator);

        for (hash, file) in self.animation.take_pending_requests() {
            let _ = self.io_tx.send(IoRequest::FetchSequence { hash, file });
        }
    }

    fn send_batch(&mut self, kind: BatchKind, prior: HashMap<u32, Option<Prop>>, batch: PropBatch) {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        self.pending_batches
            .insert(batch_id, PendingBatch { kind, prior });
        let _ = self.io_tx.send(IoRequest::PropBatch { batch_id, batch });
    }

    /// Apply the server's per-id verdicts: `true` keeps the optimistic
    /// change, `false` and `null` restore the previous scene state and
    /// surface an informational message. `None` status rolls the whole
    /// batch back.
    fn reconcile_batch(&mut self, batch_id: u64, status: Option<wideworlds_protocol::BatchStatus>) {
        let Some(pending) = self.pending_batches.remove(&batch_id) else {
            return;
        };
        let mut touched = Vec::new();
        for (id, previous) in pending.prior {
            let verdict = status.as_ref().and_then(|s| s.get(&id).copied()).flatten();
            if verdict == Some(true) {
                continue;
            }
            let reason = match verdict {
                Some(false) => "not authorized",
                _ => "not found",
            };
            let action = match pending.kind {
                BatchKind::Create => "created",
                BatchKind::Update => "updated",
                BatchKind::Delete => "deleted",
            };
            self.feed
                .info(format!("Prop {} could not be {}: {}", id, action, reason));

            // Restore the pre-batch scene state.
            if let Some(prop) = self.remove_prop_object(id) {
                touched.push(prop.chunk_pos(self.chunk_side));
            }
            if let Some(prop) = previous {
                let chunk = prop.chunk_pos(self.chunk_side);
                if self.is_chunk_loaded(chunk) {
                    self.add_prop_object(chunk, prop);
                    touched.push(chunk);
                }
            }
        }
        touched.sort_unstable_by_key(|p| (p.cx, p.cz));
        touched.dedup();
        for chunk in touched {
            self.rebuild_chunk_bounds(chunk);
        }
    }

    fn execute_command(&mut self, command: Command) {
        match command {
            Command::LandingZone => {
                let entry = self.world.entry_point.clone();
                self.teleport(entry.x, entry.y, entry.z, Some(entry.yaw));
                self.feed.info("You have been teleported to the landing zone");
            }
            Command::GroundZero => {
                self.teleport(0.0, 0.0, 0.0, None);
                self.feed.info("You have been teleported to ground zero");
            }
            Command::Teleport { x, y, z, yaw_deg } => {
                let y = y.unwrap_or(self.user.position.y);
                self.teleport(x, y, z, yaw_deg);
                let message = match yaw_deg {
                    Some(yaw) => format!(
                        "You have been teleported to: {}X, {}Y, {}Z, {}°",
                        x, y, z, yaw
                    ),
                    None => format!("You have been teleported to: {}X, {}Y, {}Z", x, y, z),
                };
                self.feed.info(message);
            }
            Command::Seed { model } => {
                let name = model.unwrap_or_else(|| "unknown.rwx".to_string());
                let id = self.next_seed_id;
                self.next_seed_id += 1;
                let position = self.user.position;
                self.create_props(vec![Prop {
                    id,
                    world_id: self.world.id,
                    user_id: self.entities.local_user_id(),
                    date: 0,
                    x: position.x,
                    y: position.y,
                    z: position.z,
                    yaw: self.user.yaw,
                    pitch: 0.0,
                    roll: 0.0,
                    name: name.clone(),
                    description: String::new(),
                    action: String::new(),
                }]);
                self.feed.info(format!("Seeded {}", name));
            }
            Command::GetPos => {
                let p = self.user.position;
                self.feed.info(format!(
                    "Current position: {:.2}X, {:.2}Y, {:.2}Z",
                    p.x, p.y, p.z
                ));
            }
            Command::WorldData => {
                self.feed.info(format!(
                    "World {} (id {}): terrain {}, water {}",
                    self.world.name,
                    self.world.id,
                    if self.world.terrain.enabled { "on" } else { "off" },
                    if self.world.water.enabled { "on" } else { "off" },
                ));
            }
            Command::Walk(speed) => {
                self.user.walk_speed = speed;
                self.feed.info(format!("Walk speed set to {} m/s", speed));
            }
            Command::Run(speed) => {
                self.user.run_speed = speed;
                self.feed.info(format!("Run speed set to {} m/s", speed));
            }
            Command::ResetWalk => {
                self.user.walk_speed = self.config.controls.walk_speed;
                self.feed.info("Walk speed reset");
            }
            Command::ResetRun => {
                self.user.run_speed = self.config.controls.run_speed;
                self.feed.info("Run speed reset");
            }
        }
    }
}

/// Chunk offsets within the loading distance, nearest first.
fn build_disc_pattern(loading_distance: f32, chunk_side: f32) -> Vec<(i32, i32)> {
    let radius = (loading_distance / chunk_side).ceil() as i32;
    let max_sq = (loading_distance / chunk_side) * (loading_distance / chunk_side);
    let mut offsets = Vec::new();
    for dx in -radius..=radius {
        for dz in -radius..=radius {
            let dist_sq = (dx * dx + dz * dz) as f32;
            if dist_sq <= max_sq {
                offsets.push((dx, dz));
            }
        }
    }
    offsets.sort_by_key(|(dx, dz)| dx * dx + dz * dz);
    offsets
}

/// Bridges the entity manager's animation callbacks onto the animation
/// manager, resolving wire hashes back to animation names.
struct RuntimeAnimator<'a> {
    animation: &'a mut AnimationManager,
    anim_names: &'a HashMap<u16, String>,
    avatars: &'a mut HashMap<ObjectId, u16>,
    start_times: &'a HashMap<ObjectId, f64>,
    now: f64,
}

impl EntityAnimator for RuntimeAnimator<'_> {
    fn set_avatar(&mut self, _scene: &mut SceneGraph, entity: ObjectId, avatar_id: u16) {
        self.avatars.insert(entity, avatar_id);
    }

    fn animate_implicit(
        &mut self,
        scene: &mut SceneGraph,
        entity: ObjectId,
        anim_hash: u16,
        speed: f32,
    ) {
        let Some(&avatar) = self.avatars.get(&entity) else {
            return;
        };
        let Some(name) = self.anim_names.get(&anim_hash).cloned() else {
            return;
        };
        let start = self.start_times.get(&entity).copied().unwrap_or(self.now);
        self.animation
            .animate_entity_imp(scene, entity, avatar, &name, start, self.now, speed);
    }

    fn animate_explicit(
        &mut self,
        scene: &mut SceneGraph,
        entity: ObjectId,
        anim_hash: u16,
        progress: f32,
    ) {
        let Some(&avatar) = self.avatars.get(&entity) else {
            return;
        };
        let Some(name) = self.anim_names.get(&anim_hash).cloned() else {
            return;
        };
        self.animation
            .animate_entity_exp(scene, entity, avatar, &name, progress, self.now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BoxModelProvider;
    use glam::Mat4;
    use wideworlds_events::codes;
    use wideworlds_protocol::BatchStatus;
    use wideworlds_world::WaterPageData;

    fn test_config() -> ClientConfig {
        let mut config = ClientConfig::default();
        // Keep the disc pattern down to the current chunk so tests can
        // account for every fetch.
        config.graphics.props_loading_distance = 0.0;
        config.graphics.idle_props_loading.downtime = 0.5;
        config.graphics.idle_props_loading.speed = 10.0;
        config.graphics.idle_props_loading.distance = 60.0;
        config
    }

    struct Harness {
        runtime: WorldRuntime,
        io_rx: mpsc::UnboundedReceiver<IoRequest>,
        completion_tx: mpsc::UnboundedSender<Completion>,
    }

    fn harness_with(config: ClientConfig, world: WorldDescriptor) -> Harness {
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let runtime = WorldRuntime::new(
            config,
            world,
            1,
            Box::new(BoxModelProvider::new()),
            io_tx,
            completion_rx,
        );
        Harness {
            runtime,
            io_rx,
            completion_tx,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config(), WorldDescriptor::default())
    }

    impl Harness {
        fn drain_requests(&mut self) -> Vec<IoRequest> {
            let mut out = Vec::new();
            while let Ok(request) = self.io_rx.try_recv() {
                out.push(request);
            }
            out
        }

        /// Answer every pending chunk fetch from the given table,
        /// dropping other request kinds. Returns the served count.
        fn serve_chunks(&mut self, table: &HashMap<ChunkPos, Vec<Prop>>) -> usize {
            let mut served = 0;
            for request in self.drain_requests() {
                if let IoRequest::FetchChunk {
                    generation,
                    pos,
                    hide,
                    ..
                } = request
                {
                    served += 1;
                    let _ = self.completion_tx.send(Completion::ChunkLoaded {
                        generation,
                        pos,
                        hide,
                        props: table.get(&pos).cloned().unwrap_or_default(),
                    });
                }
            }
            served
        }
    }

    fn prop(id: u32, x: f64, z: f64) -> Prop {
        Prop {
            id,
            world_id: 0,
            user_id: 1,
            date: 100 + id as u64,
            x,
            y: 0.0,
            z,
            yaw: 0.0,
            pitch: 0.0,
            roll: 0.0,
            name: "tree07.rwx".into(),
            description: String::new(),
            action: String::new(),
        }
    }

    fn pool_key() -> PoolKey {
        PoolKey::new("tree07.rwx", sequence_name_hash("tree07.rwx"))
    }

    #[test]
    fn test_teleport_chat_scenario() {
        let mut h = harness();
        assert!(h.runtime.handle_chat_input("/tp 10 0 -5 90"));
        let messages = h.runtime.feed_mut().drain();
        assert!(messages
            .iter()
            .any(|m| m.text == "You have been teleported to: 10X, 0Y, -5Z, 90°"));
        let user = h.runtime.user();
        assert_eq!(user.position, DVec3::new(10.0, 0.0, -5.0));
        assert!((user.yaw - (-4.712_389)).abs() < 1e-3);
    }

    #[test]
    fn test_invalid_command_feeds_error() {
        let mut h = harness();
        assert!(h.runtime.handle_chat_input("/wiggle"));
        let messages = h.runtime.feed_mut().drain();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].code, Some(codes::ERR_INVALID_COMMAND));
        // The double-slash escape is plain chat.
        assert!(!h.runtime.handle_chat_input("//wiggle"));
    }

    #[test]
    fn test_chunk_load_idempotent() {
        let mut h = harness();
        let pos = ChunkPos::new(0, 0);
        h.runtime.load_chunk(pos, false, true);
        h.runtime.load_chunk(pos, false, true);
        let table = HashMap::from([(pos, vec![prop(1, 0.0, 0.0)])]);
        assert_eq!(h.serve_chunks(&table), 1);

        // The crossing on the first frame must not refetch it either.
        h.runtime.update(DVec3::ZERO, 0.016);
        assert_eq!(h.serve_chunks(&table), 0);
        assert_eq!(h.runtime.loaded_chunk_count(), 1);
        let node = h.runtime.chunk_node(pos).unwrap();
        assert!(h.runtime.scene.bounds_tree(node).is_some());
    }

    #[test]
    fn test_prop_delete_zeroes_scenery_slot() {
        let mut h = harness();
        let pos = ChunkPos::new(0, 0);
        h.runtime.update(DVec3::ZERO, 0.016);
        let table = HashMap::from([(pos, vec![prop(7, 1.0, 1.0), prop(8, 2.0, 2.0)])]);
        h.serve_chunks(&table);
        h.runtime.update(DVec3::ZERO, 6.0);

        let pool = h.runtime.scenery().pool(&pool_key()).unwrap();
        let slot = pool.slot_of(7).unwrap();

        h.runtime.apply_world_update(WorldUpdate::Delete(vec![7]));
        h.runtime.update(DVec3::ZERO, 6.0);

        let pool = h.runtime.scenery().pool(&pool_key()).unwrap();
        assert_eq!(pool.slot_of(7), None);
        assert_eq!(pool.matrix(slot), Mat4::ZERO);
        assert!(pool.free_slots().contains(&slot));
        assert!(pool.slot_of(8).is_some());
    }

    #[test]
    fn test_lod_transition_unmasks_scenery() {
        let mut config = test_config();
        config.graphics.rendering_distance = 50.0;
        let mut h = harness_with(config, WorldDescriptor::default());
        let pos = ChunkPos::new(0, 0);
        h.runtime.update(DVec3::ZERO, 0.016);
        h.serve_chunks(&HashMap::from([(pos, vec![prop(7, 1.0, 1.0)])]));
        h.runtime.update(DVec3::ZERO, 6.0);

        // Full detail is on screen: the instanced stand-in is masked.
        let pool = h.runtime.scenery().pool(&pool_key()).unwrap();
        let slot = pool.slot_of(7).unwrap();
        assert_eq!(pool.matrix(slot), Mat4::ZERO);

        // Walking out of range hides the chunk and unmasks the pool.
        h.runtime.update(DVec3::new(500.0, 0.0, 0.0), 0.016);
        let pool = h.runtime.scenery().pool(&pool_key()).unwrap();
        assert_ne!(pool.matrix(slot), Mat4::ZERO);
    }

    #[test]
    fn test_idle_spiral_loads_hidden_chunks() {
        let mut h = harness();
        let pos = DVec3::new(0.5, 0.0, 0.5);
        for _ in 0..10 {
            h.runtime.update(pos, 0.2);
        }
        let hidden_loads: Vec<ChunkPos> = h
            .drain_requests()
            .into_iter()
            .filter_map(|r| match r {
                IoRequest::FetchChunk { pos, hide: true, .. } => Some(pos),
                _ => None,
            })
            .collect();
        assert!(!hidden_loads.is_empty());
        assert!(hidden_loads.iter().all(|p| *p != ChunkPos::new(0, 0)));
    }

    #[test]
    fn test_collision_ready_consults_both_maps() {
        let mut world = WorldDescriptor::default();
        world.terrain.enabled = true;
        let mut h = harness_with(test_config(), world);
        let origin = DVec3::ZERO;
        assert!(!h.runtime.is_position_collision_ready(origin));

        h.runtime.update(origin, 0.016);
        let requests = h.drain_requests();
        let mut page_request = None;
        for request in requests {
            match request {
                IoRequest::FetchChunk {
                    generation,
                    pos,
                    hide,
                    ..
                } => {
                    let _ = h.completion_tx.send(Completion::ChunkLoaded {
                        generation,
                        pos,
                        hide,
                        props: vec![prop(1, 0.0, 0.0)],
                    });
                }
                IoRequest::FetchTerrainPage { generation, pos } => {
                    page_request = Some((generation, pos));
                }
                _ => {}
            }
        }
        h.runtime.update(origin, 0.016);
        // Chunk bounds are ready, the page map still is not.
        assert!(!h.runtime.is_position_collision_ready(origin));

        let (generation, pos) = page_request.unwrap();
        let _ = h.completion_tx.send(Completion::TerrainPageLoaded {
            generation,
            pos,
            data: TerrainPageData::flat(DEFAULT_PAGE_DIAMETER),
        });
        h.runtime.update(origin, 0.016);
        assert!(h.runtime.is_position_collision_ready(origin));

        // Page ready, chunk missing: still not ready.
        assert!(!h
            .runtime
            .is_position_collision_ready(DVec3::new(500.0, 0.0, 0.0)));
    }

    #[test]
    fn test_unauthorized_create_reverts() {
        let mut h = harness();
        h.runtime.update(DVec3::ZERO, 0.016);
        h.serve_chunks(&HashMap::from([(ChunkPos::new(0, 0), Vec::new())]));
        h.runtime.update(DVec3::ZERO, 0.016);

        h.runtime.create_props(vec![prop(42, 1.0, 1.0)]);
        let node = h.runtime.chunk_node(ChunkPos::new(0, 0)).unwrap();
        assert!(h
            .runtime
            .scene
            .get_by_name(node, "tree07.rwx", 0)
            .unwrap()
            .is_some());

        let batch_id = h
            .drain_requests()
            .iter()
            .find_map(|r| match r {
                IoRequest::PropBatch { batch_id, .. } => Some(*batch_id),
                _ => None,
            })
            .unwrap();
        let status: BatchStatus = HashMap::from([(42u32, Some(false))]);
        let _ = h
            .completion_tx
            .send(Completion::BatchDone { batch_id, status });
        h.runtime.update(DVec3::ZERO, 0.016);

        assert!(h
            .runtime
            .scene
            .get_by_name(node, "tree07.rwx", 0)
            .unwrap()
            .is_none());
        let messages = h.runtime.feed_mut().drain();
        assert!(messages.iter().any(|m| m.text.contains("not authorized")));
    }

    #[test]
    fn test_delete_not_found_restores_prop() {
        let mut h = harness();
        h.runtime.update(DVec3::ZERO, 0.016);
        h.serve_chunks(&HashMap::from([(
            ChunkPos::new(0, 0),
            vec![prop(7, 1.0, 1.0)],
        )]));
        h.runtime.update(DVec3::ZERO, 0.016);

        h.runtime.delete_props(vec![7]);
        let node = h.runtime.chunk_node(ChunkPos::new(0, 0)).unwrap();
        assert!(h
            .runtime
            .scene
            .get_by_name(node, "tree07.rwx", 0)
            .unwrap()
            .is_none());

        let batch_id = h
            .drain_requests()
            .iter()
            .find_map(|r| match r {
                IoRequest::PropBatch { batch_id, .. } => Some(*batch_id),
                _ => None,
            })
            .unwrap();
        let status: BatchStatus = HashMap::from([(7u32, None)]);
        let _ = h
            .completion_tx
            .send(Completion::BatchDone { batch_id, status });
        h.runtime.update(DVec3::ZERO, 0.016);

        assert!(h
            .runtime
            .scene
            .get_by_name(node, "tree07.rwx", 0)
            .unwrap()
            .is_some());
        let messages = h.runtime.feed_mut().drain();
        assert!(messages.iter().any(|m| m.text.contains("not found")));
    }

    #[test]
    fn test_prop_update_moves_between_chunks() {
        let mut h = harness();
        let a = ChunkPos::new(0, 0);
        let b = ChunkPos::new(1, 0);
        h.runtime.load_chunk(a, false, true);
        h.runtime.load_chunk(b, false, true);
        h.serve_chunks(&HashMap::from([(a, vec![prop(5, 1.0, 1.0)]), (b, Vec::new())]));
        h.runtime.update(DVec3::ZERO, 0.016);

        let mut moved = prop(5, 20.0, 0.0);
        moved.date = 200;
        h.runtime.apply_world_update(WorldUpdate::Update(vec![moved]));

        let node_a = h.runtime.chunk_node(a).unwrap();
        let node_b = h.runtime.chunk_node(b).unwrap();
        assert!(h
            .runtime
            .scene
            .get_by_name(node_a, "tree07.rwx", 0)
            .unwrap()
            .is_none());
        assert!(h
            .runtime
            .scene
            .get_by_name(node_b, "tree07.rwx", 0)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_underwater_environment_switch() {
        let mut world = WorldDescriptor::default();
        world.water.enabled = true;
        world.water.level = 5.0;
        let mut h = harness_with(test_config(), world);
        let below = DVec3::new(0.0, 1.0, 0.0);

        h.runtime.update(below, 0.016);
        for request in h.drain_requests() {
            if let IoRequest::FetchWaterPage { generation, pos } = request {
                let _ = h.completion_tx.send(Completion::WaterPageLoaded {
                    generation,
                    pos,
                    data: WaterPageData {
                        elevation: vec![0; DEFAULT_PAGE_DIAMETER * DEFAULT_PAGE_DIAMETER],
                    },
                });
            }
        }
        h.runtime.update(below, 0.016);
        assert!(h.runtime.environment().underwater);

        h.runtime.update(DVec3::new(0.0, 10.0, 0.0), 0.016);
        assert!(!h.runtime.environment().underwater);
    }

    #[test]
    fn test_unload_drops_everything_and_cancels_loads() {
        let mut h = harness();
        h.runtime.update(DVec3::ZERO, 0.016);
        let stale: Vec<(u64, ChunkPos)> = h
            .drain_requests()
            .iter()
            .filter_map(|r| match r {
                IoRequest::FetchChunk { generation, pos, .. } => Some((*generation, *pos)),
                _ => None,
            })
            .collect();
        h.runtime.unload();
        assert_eq!(h.runtime.loaded_chunk_count(), 0);
        assert_eq!(h.runtime.scenery().pool_count(), 0);

        // A fetch racing the unload dies on the generation check.
        for (generation, pos) in stale {
            let _ = h.completion_tx.send(Completion::ChunkLoaded {
                generation,
                pos,
                hide: false,
                props: vec![prop(1, 0.0, 0.0)],
            });
        }
        h.runtime.update(DVec3::new(100.0, 0.0, 100.0), 0.016);
        assert_eq!(h.runtime.loaded_chunk_count(), 0);
    }

    #[test]
    fn test_entity_states_flow_into_scene() {
        let mut h = harness();
        let mut state = wideworlds_protocol::EntityState::default();
        state.entity_id = 9;
        state.x = 3.0;
        let payload = wideworlds_protocol::pack_entity_states(&[
            wideworlds_protocol::serialize_entity_state(&state),
        ])
        .unwrap();
        h.runtime.ingest_entity_states(&payload);
        h.runtime.update(DVec3::ZERO, 0.016);
        assert!(h
            .runtime
            .scene
            .get_by_name(h.runtime.entities_root(), "user#9", 0)
            .unwrap()
            .is_some());

        // Garbage is dropped without touching the scene.
        h.runtime.ingest_entity_states(&[0u8; 13]);
        h.runtime.update(DVec3::ZERO, 0.016);
    }
}
