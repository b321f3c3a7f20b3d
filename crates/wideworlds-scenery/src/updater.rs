use crate::pool::{BackgroundScenery, PoolKey};
use glam::Mat4;
use tracing::debug;
use wideworlds_types::ChunkPos;

/// One staged scenery mutation.
#[derive(Debug, Clone)]
pub enum SceneryOp {
    Set {
        prop_id: u32,
        mask_key: ChunkPos,
        key: PoolKey,
        matrix: Mat4,
    },
    Unset {
        prop_id: u32,
    },
}

/// Double-buffers scenery mutations so the drawn pools never show a
/// half-loaded chunk: everything staged between two commits lands
/// atomically when `commit` drains the read side and flips.
#[derive(Debug, Default)]
pub struct SceneryUpdater {
    queues: [Vec<SceneryOp>; 2],
    write: usize,
}

impl SceneryUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage_set(&mut self, prop_id: u32, mask_key: ChunkPos, key: PoolKey, matrix: Mat4) {
        self.queues[self.write].push(SceneryOp::Set {
            prop_id,
            mask_key,
            key,
            matrix,
        });
    }

    pub fn stage_unset(&mut self, prop_id: u32) {
        self.queues[self.write].push(SceneryOp::Unset { prop_id });
    }

    pub fn pending(&self) -> usize {
        self.queues[self.write].len()
    }

    /// Flip buffers and apply everything staged before the flip.
    /// Returns the number of operations applied.
    pub fn commit(&mut self, scenery: &mut BackgroundScenery) -> usize {
        let read = self.write;
        self.write = 1 - self.write;
        let ops = std::mem::take(&mut self.queues[read]);
        let applied = ops.len();
        for op in ops {
            match op {
                SceneryOp::Set {
                    prop_id,
                    mask_key,
                    key,
                    matrix,
                } => scenery.set(prop_id, mask_key, key, matrix),
                SceneryOp::Unset { prop_id } => scenery.unset(prop_id),
            }
        }
        if applied > 0 {
            debug!(applied, "scenery updater commit");
        }
        applied
    }

    pub fn clear(&mut self) {
        self.queues = [Vec::new(), Vec::new()];
        self.write = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn mat(x: f32) -> Mat4 {
        Mat4::from_translation(Vec3::new(x, 0.0, 0.0))
    }

    #[test]
    fn test_nothing_applies_before_commit() {
        let mut scenery = BackgroundScenery::new();
        let mut updater = SceneryUpdater::new();
        updater.stage_set(1, ChunkPos::new(0, 0), PoolKey::new("a.rwx", 1), mat(1.0));
        assert_eq!(updater.pending(), 1);
        assert!(!scenery.contains(1));

        assert_eq!(updater.commit(&mut scenery), 1);
        assert!(scenery.contains(1));
        assert_eq!(updater.pending(), 0);
    }

    #[test]
    fn test_commit_drains_once() {
        let mut scenery = BackgroundScenery::new();
        let mut updater = SceneryUpdater::new();
        updater.stage_set(1, ChunkPos::new(0, 0), PoolKey::new("a.rwx", 1), mat(1.0));
        updater.commit(&mut scenery);
        assert_eq!(updater.commit(&mut scenery), 0);
    }

    #[test]
    fn test_set_then_unset_in_one_batch() {
        let mut scenery = BackgroundScenery::new();
        let mut updater = SceneryUpdater::new();
        let key = PoolKey::new("a.rwx", 1);
        updater.stage_set(1, ChunkPos::new(0, 0), key.clone(), mat(1.0));
        updater.stage_unset(1);
        updater.commit(&mut scenery);
        assert!(!scenery.contains(1));
        // The slot allocated by the set is back on the free list.
        assert_eq!(scenery.pool(&key).unwrap().free_slots().len(), 1);
    }

    #[test]
    fn test_stage_while_committed_batch_waits() {
        let mut scenery = BackgroundScenery::new();
        let mut updater = SceneryUpdater::new();
        let key = PoolKey::new("a.rwx", 1);
        updater.stage_set(1, ChunkPos::new(0, 0), key.clone(), mat(1.0));
        updater.commit(&mut scenery);
        updater.stage_set(2, ChunkPos::new(0, 0), key.clone(), mat(2.0));
        assert!(scenery.contains(1));
        assert!(!scenery.contains(2));
        updater.commit(&mut scenery);
        assert!(scenery.contains(2));
    }
}
