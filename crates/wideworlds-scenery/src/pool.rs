use glam::Mat4;
use std::collections::{HashMap, HashSet};
use tracing::trace;
use wideworlds_types::ChunkPos;

/// Starting slot count of a fresh pool.
const INITIAL_CAPACITY: usize = 16;
/// Pools join the drawn scene once they hold at least this many
/// instances, and leave it only when drained empty.
pub const MIN_ATTACH_COUNT: usize = 4;

/// Pools are shared by every prop using the same asset under the same
/// variant hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub name: String,
    pub hash: u16,
}

impl PoolKey {
    pub fn new(name: impl Into<String>, hash: u16) -> Self {
        Self {
            name: name.into(),
            hash,
        }
    }
}

/// One instanced mesh pool: a growing matrix array plus slot accounting.
/// `matrices` is what the renderer reads (zero = invisible sentinel);
/// `backing` retains the real transforms across mask cycles.
#[derive(Debug)]
pub struct InstancedPool {
    capacity: usize,
    matrices: Vec<Mat4>,
    backing: Vec<Mat4>,
    entries: HashMap<u32, usize>,
    free: Vec<usize>,
    next_slot: usize,
    attached: bool,
}

impl InstancedPool {
    fn new() -> Self {
        Self {
            capacity: INITIAL_CAPACITY,
            matrices: vec![Mat4::ZERO; INITIAL_CAPACITY],
            backing: vec![Mat4::ZERO; INITIAL_CAPACITY],
            entries: HashMap::new(),
            free: Vec::new(),
            next_slot: 0,
            attached: false,
        }
    }

    pub fn instance_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_of(&self, prop_id: u32) -> Option<usize> {
        self.entries.get(&prop_id).copied()
    }

    pub fn matrix(&self, slot: usize) -> Mat4 {
        self.matrices[slot]
    }

    pub fn matrices(&self) -> &[Mat4] {
        &self.matrices
    }

    pub fn free_slots(&self) -> &[usize] {
        &self.free
    }

    fn allocate(&mut self, prop_id: u32) -> usize {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                if self.next_slot == self.capacity {
                    // Double, copying live and backing arrays; the old
                    // allocations drop after the copy.
                    self.capacity *= 2;
                    self.matrices.resize(self.capacity, Mat4::ZERO);
                    self.backing.resize(self.capacity, Mat4::ZERO);
                    trace!(capacity = self.capacity, "instanced pool grown");
                }
                let slot = self.next_slot;
                self.next_slot += 1;
                slot
            }
        };
        self.entries.insert(prop_id, slot);
        slot
    }

    fn release(&mut self, prop_id: u32) -> Option<usize> {
        let slot = self.entries.remove(&prop_id)?;
        self.matrices[slot] = Mat4::ZERO;
        self.backing[slot] = Mat4::ZERO;
        self.free.push(slot);
        slot.into()
    }

    fn update_attachment(&mut self) {
        if !self.attached && self.entries.len() >= MIN_ATTACH_COUNT {
            self.attached = true;
        } else if self.attached && self.entries.is_empty() {
            self.attached = false;
        }
    }
}

/// The background scenery engine: one pool per `(asset, hash)` pair, an
/// index from chunk mask keys to the prop ids bound under them, and the
/// reverse map.
#[derive(Debug, Default)]
pub struct BackgroundScenery {
    pools: HashMap<PoolKey, InstancedPool>,
    mask_index: HashMap<ChunkPos, HashMap<PoolKey, HashSet<u32>>>,
    prop_index: HashMap<u32, (ChunkPos, PoolKey)>,
    masked: HashSet<ChunkPos>,
}

impl BackgroundScenery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a prop instance into its pool under the given mask key.
    /// Re-setting an existing id updates its transform in place (moving
    /// it across pools releases the old slot first).
    pub fn set(&mut self, prop_id: u32, mask_key: ChunkPos, key: PoolKey, matrix: Mat4) {
        let previous = self.prop_index.get(&prop_id).cloned();
        if let Some((_, old_key)) = &previous {
            if *old_key != key {
                self.unset(prop_id);
            }
        }

        let pool = self.pools.entry(key.clone()).or_insert_with(InstancedPool::new);
        let slot = match pool.entries.get(&prop_id) {
            Some(&slot) => slot,
            None => pool.allocate(prop_id),
        };
        pool.backing[slot] = matrix;
        pool.matrices[slot] = if self.masked.contains(&mask_key) {
            Mat4::ZERO
        } else {
            matrix
        };
        pool.update_attachment();

        if let Some((old_mask, old_key)) = previous {
            if old_key == key && old_mask != mask_key {
                self.remove_from_mask_index(prop_id, old_mask);
            }
        }
        self.mask_index
            .entry(mask_key)
            .or_default()
            .entry(key.clone())
            .or_default()
            .insert(prop_id);
        self.prop_index.insert(prop_id, (mask_key, key));
    }

    /// Release a prop instance: zero its matrix, return the slot to the
    /// free list, drop it from both indexes.
    pub fn unset(&mut self, prop_id: u32) {
        let Some((mask_key, key)) = self.prop_index.remove(&prop_id) else {
            return;
        };
        self.remove_from_mask_index(prop_id, mask_key);
        if let Some(pool) = self.pools.get_mut(&key) {
            pool.release(prop_id);
            pool.update_attachment();
        }
    }

    /// Hide every instance bound under the key by zeroing its live
    /// matrix. Idempotent.
    pub fn mask(&mut self, key: ChunkPos) {
        self.masked.insert(key);
        let Some(per_pool) = self.mask_index.get(&key) else {
            return;
        };
        for (pool_key, ids) in per_pool {
            if let Some(pool) = self.pools.get_mut(pool_key) {
                for id in ids {
                    if let Some(&slot) = pool.entries.get(id) {
                        pool.matrices[slot] = Mat4::ZERO;
                    }
                }
            }
        }
    }

    /// Restore every instance bound under the key from the backing
    /// store.
    pub fn unmask(&mut self, key: ChunkPos) {
        self.masked.remove(&key);
        let Some(per_pool) = self.mask_index.get(&key) else {
            return;
        };
        for (pool_key, ids) in per_pool {
            if let Some(pool) = self.pools.get_mut(pool_key) {
                for id in ids {
                    if let Some(&slot) = pool.entries.get(id) {
                        pool.matrices[slot] = pool.backing[slot];
                    }
                }
            }
        }
    }

    pub fn pool(&self, key: &PoolKey) -> Option<&InstancedPool> {
        self.pools.get(key)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn contains(&self, prop_id: u32) -> bool {
        self.prop_index.contains_key(&prop_id)
    }

    /// Drop every pool and index; used at world unload.
    pub fn clear(&mut self) {
        self.pools.clear();
        self.mask_index.clear();
        self.prop_index.clear();
        self.masked.clear();
    }

    fn remove_from_mask_index(&mut self, prop_id: u32, mask_key: ChunkPos) {
        if let Some(per_pool) = self.mask_index.get_mut(&mask_key) {
            for ids in per_pool.values_mut() {
                ids.remove(&prop_id);
            }
            per_pool.retain(|_, ids| !ids.is_empty());
            if per_pool.is_empty() {
                self.mask_index.remove(&mask_key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn mat(x: f32) -> Mat4 {
        Mat4::from_translation(Vec3::new(x, 0.0, 0.0))
    }

    fn key() -> PoolKey {
        PoolKey::new("tree07.rwx", 0xBEEF)
    }

    #[test]
    fn test_set_and_unset_slot_reuse() {
        let mut scenery = BackgroundScenery::new();
        let chunk = ChunkPos::new(0, 0);
        scenery.set(1, chunk, key(), mat(1.0));
        scenery.set(2, chunk, key(), mat(2.0));
        let pool = scenery.pool(&key()).unwrap();
        let slot1 = pool.slot_of(1).unwrap();
        assert_eq!(pool.instance_count(), 2);

        scenery.unset(1);
        let pool = scenery.pool(&key()).unwrap();
        assert_eq!(pool.instance_count(), 1);
        assert_eq!(pool.matrix(slot1), Mat4::ZERO);
        assert_eq!(pool.free_slots(), &[slot1]);

        // The freed slot is handed back out.
        scenery.set(3, chunk, key(), mat(3.0));
        let pool = scenery.pool(&key()).unwrap();
        assert_eq!(pool.slot_of(3), Some(slot1));
        assert!(pool.free_slots().is_empty());
    }

    #[test]
    fn test_mask_idempotent_and_unmask_restores() {
        let mut scenery = BackgroundScenery::new();
        let chunk = ChunkPos::new(2, -1);
        for id in 0..5u32 {
            scenery.set(id, chunk, key(), mat(id as f32));
        }
        let before: Vec<Mat4> = scenery.pool(&key()).unwrap().matrices().to_vec();

        scenery.mask(chunk);
        let masked_once: Vec<Mat4> = scenery.pool(&key()).unwrap().matrices().to_vec();
        assert!(masked_once.iter().take(5).all(|m| *m == Mat4::ZERO));
        scenery.mask(chunk);
        assert_eq!(
            scenery.pool(&key()).unwrap().matrices(),
            masked_once.as_slice()
        );

        scenery.unmask(chunk);
        scenery.mask(chunk);
        scenery.unmask(chunk);
        assert_eq!(scenery.pool(&key()).unwrap().matrices(), before.as_slice());
    }

    #[test]
    fn test_set_under_masked_key_stays_hidden() {
        let mut scenery = BackgroundScenery::new();
        let chunk = ChunkPos::new(0, 0);
        scenery.mask(chunk);
        scenery.set(7, chunk, key(), mat(7.0));
        let pool = scenery.pool(&key()).unwrap();
        let slot = pool.slot_of(7).unwrap();
        assert_eq!(pool.matrix(slot), Mat4::ZERO);
        scenery.unmask(chunk);
        let pool = scenery.pool(&key()).unwrap();
        assert_eq!(pool.matrix(slot), mat(7.0));
    }

    #[test]
    fn test_pool_growth_preserves_instances() {
        let mut scenery = BackgroundScenery::new();
        let chunk = ChunkPos::new(0, 0);
        for id in 0..40u32 {
            scenery.set(id, chunk, key(), mat(id as f32));
        }
        let pool = scenery.pool(&key()).unwrap();
        assert!(pool.capacity() >= 40);
        for id in 0..40u32 {
            let slot = pool.slot_of(id).unwrap();
            assert_eq!(pool.matrix(slot), mat(id as f32));
        }
    }

    #[test]
    fn test_attach_hysteresis() {
        let mut scenery = BackgroundScenery::new();
        let chunk = ChunkPos::new(0, 0);
        for id in 0..MIN_ATTACH_COUNT as u32 - 1 {
            scenery.set(id, chunk, key(), mat(1.0));
        }
        assert!(!scenery.pool(&key()).unwrap().is_attached());
        scenery.set(99, chunk, key(), mat(1.0));
        assert!(scenery.pool(&key()).unwrap().is_attached());
        // Dropping below the threshold does not detach; only empty does.
        scenery.unset(99);
        assert!(scenery.pool(&key()).unwrap().is_attached());
        for id in 0..MIN_ATTACH_COUNT as u32 - 1 {
            scenery.unset(id);
        }
        assert!(!scenery.pool(&key()).unwrap().is_attached());
    }

    #[test]
    fn test_props_span_mask_keys_independently() {
        let mut scenery = BackgroundScenery::new();
        let a = ChunkPos::new(0, 0);
        let b = ChunkPos::new(1, 0);
        scenery.set(1, a, key(), mat(1.0));
        scenery.set(2, b, key(), mat(2.0));
        scenery.mask(a);
        let pool = scenery.pool(&key()).unwrap();
        assert_eq!(pool.matrix(pool.slot_of(1).unwrap()), Mat4::ZERO);
        assert_eq!(pool.matrix(pool.slot_of(2).unwrap()), mat(2.0));
    }
}
