use crate::config::KeyBindings;
use crate::runtime::UserState;
use glam::{DVec3, Vec3};
use std::collections::HashSet;
use wideworlds_physics::ColliderProbe;

/// Turns key events into per-frame displacement for the local user,
/// honoring the configured bindings and the walk/run speeds.
#[derive(Debug)]
pub struct MovementController {
    bindings: KeyBindings,
    pressed: HashSet<String>,
    running: bool,
}

impl MovementController {
    pub fn new(bindings: KeyBindings) -> Self {
        Self {
            bindings,
            pressed: HashSet::new(),
            running: false,
        }
    }

    pub fn key_down(&mut self, code: &str) {
        self.pressed.insert(code.to_string());
    }

    pub fn key_up(&mut self, code: &str) {
        self.pressed.remove(code);
    }

    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    fn axis(&self, positive: &str, negative: &str) -> f32 {
        let mut value = 0.0;
        if self.pressed.contains(positive) {
            value += 1.0;
        }
        if self.pressed.contains(negative) {
            value -= 1.0;
        }
        value
    }

    /// Current movement direction in world space, from the pressed keys
    /// and the user's yaw. `None` while idle.
    pub fn direction(&self, yaw: f32) -> Option<Vec3> {
        let ahead = self.axis(&self.bindings.forward, &self.bindings.backward);
        let side = self.axis(&self.bindings.right, &self.bindings.left);
        let vertical = self.axis(&self.bindings.move_up, &self.bindings.move_down);
        if ahead == 0.0 && side == 0.0 && vertical == 0.0 {
            return None;
        }
        // GL-South yaw: looking down -Z at yaw 0.
        let (sin, cos) = yaw.sin_cos();
        let forward = Vec3::new(-sin, 0.0, -cos);
        let right = Vec3::new(cos, 0.0, -sin);
        let direction = forward * ahead + right * side + Vec3::Y * vertical;
        Some(direction.normalize())
    }

    /// Advance the user position by one frame, applying the collider's
    /// verdict from the previous frame: a top collision blocks the
    /// horizontal move, a step correction snaps the user up onto low
    /// obstacles.
    pub fn integrate(&self, user: &UserState, probe: ColliderProbe, delta: f32) -> DVec3 {
        let mut position = user.position;
        if let Some(direction) = self.direction(user.yaw) {
            if !probe.top_collision {
                let speed = if self.running {
                    user.run_speed
                } else {
                    user.walk_speed
                };
                position += (direction * speed * delta).as_dvec3();
            }
        }
        let correction = probe.forward_correction.or(probe.height_correction);
        if let Some(correction) = correction {
            position.y += correction as f64;
        }
        position
    }
}
