use crate::region_file::{RegionFile, REGION_SIDE};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;
use wideworlds_protocol::{deserialize_props, serialize_props, CodecError};
use wideworlds_types::Prop;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Corrupt cache payload: {0}")]
    Codec(#[from] CodecError),
    #[error("Cache record count mismatch: directory says {expected}, payload holds {actual}")]
    CountMismatch { expected: u32, actual: usize },
}

pub type CacheResult<T> = Result<T, CacheError>;

/// One cached chunk: its props and the second-resolution write time.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub props: Vec<Prop>,
    pub timestamp: u32,
}

/// Persistent local store of prop chunks keyed by `(world, cx, cz)`.
/// Each world gets a directory of region files; payloads are
/// deflate-compressed prop wire records. The network stays authoritative
/// for the current prop set; this store only answers "already seen".
pub struct ChunkCache {
    root: PathBuf,
    regions: HashMap<(u32, i32, i32), RegionFile>,
}

impl ChunkCache {
    pub fn open(root: PathBuf) -> CacheResult<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            regions: HashMap::new(),
        })
    }

    pub fn get(&mut self, world: u32, cx: i32, cz: i32) -> CacheResult<Option<ChunkRecord>> {
        let (rx, rz, lx, lz) = Self::chunk_to_region(cx, cz);
        let Some(region) = self.get_or_open(world, rx, rz, false)? else {
            return Ok(None);
        };
        let Some(stored) = region.read_chunk(lx, lz)? else {
            return Ok(None);
        };
        let props = deserialize_props(&stored.payload)?;
        if props.len() != stored.prop_count as usize {
            return Err(CacheError::CountMismatch {
                expected: stored.prop_count,
                actual: props.len(),
            });
        }
        Ok(Some(ChunkRecord {
            props,
            timestamp: stored.written_at,
        }))
    }

    /// Store a chunk's props, overwriting any previous record.
    pub fn put(&mut self, world: u32, cx: i32, cz: i32, props: &[Prop]) -> CacheResult<()> {
        let (rx, rz, lx, lz) = Self::chunk_to_region(cx, cz);
        let region = self
            .get_or_open(world, rx, rz, true)?
            .expect("create requested");
        region.write_chunk(lx, lz, &serialize_props(props), props.len() as u32)?;
        Ok(())
    }

    /// Drop a chunk record, used on decode failure or invalidation.
    pub fn delete(&mut self, world: u32, cx: i32, cz: i32) -> CacheResult<()> {
        let (rx, rz, lx, lz) = Self::chunk_to_region(cx, cz);
        if let Some(region) = self.get_or_open(world, rx, rz, false)? {
            region.delete_chunk(lx, lz)?;
        }
        Ok(())
    }

    /// Every chunk coordinate this store holds for the world.
    pub fn available_coordinates(&mut self, world: u32) -> CacheResult<Vec<(i32, i32)>> {
        let dir = self.world_dir(world);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some((rx, rz)) = Self::parse_region_name(&name.to_string_lossy()) else {
                continue;
            };
            let Some(region) = self.get_or_open(world, rx, rz, false)? else {
                continue;
            };
            for (lx, lz) in region.occupied() {
                out.push((rx * REGION_SIDE + lx as i32, rz * REGION_SIDE + lz as i32));
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    fn world_dir(&self, world: u32) -> PathBuf {
        self.root.join(format!("w{}", world))
    }

    fn get_or_open(
        &mut self,
        world: u32,
        rx: i32,
        rz: i32,
        create: bool,
    ) -> CacheResult<Option<&mut RegionFile>> {
        let key = (world, rx, rz);
        if !self.regions.contains_key(&key) {
            let dir = self.world_dir(world);
            let path = dir.join(format!("r.{}.{}.wwr", rx, rz));
            if !path.exists() && !create {
                return Ok(None);
            }
            if create {
                fs::create_dir_all(&dir)?;
            }
            let region = RegionFile::open(&path)?;
            self.regions.insert(key, region);
        }
        Ok(self.regions.get_mut(&key))
    }

    fn chunk_to_region(cx: i32, cz: i32) -> (i32, i32, usize, usize) {
        let rx = cx >> 5;
        let rz = cz >> 5;
        let lx = (cx & 31) as usize;
        let lz = (cz & 31) as usize;
        (rx, rz, lx, lz)
    }

    fn parse_region_name(name: &str) -> Option<(i32, i32)> {
        let rest = name.strip_prefix("r.")?.strip_suffix(".wwr")?;
        let (rx, rz) = rest.split_once('.')?;
        match (rx.parse(), rz.parse()) {
            (Ok(rx), Ok(rz)) => Some((rx, rz)),
            _ => {
                warn!(name, "ignoring malformed region file name");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_prop(id: u32, x: f64) -> Prop {
        Prop {
            id,
            world_id: 1,
            user_id: 2,
            date: 1000 + id as u64,
            x,
            y: 0.0,
            z: -3.5,
            yaw: 0.0,
            pitch: 0.0,
            roll: 0.0,
            name: "bench3.rwx".into(),
            description: String::new(),
            action: String::new(),
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ChunkCache::open(dir.path().to_path_buf()).unwrap();
        let props = vec![sample_prop(1, 5.0), sample_prop(2, 6.0)];
        cache.put(3, 0, 0, &props).unwrap();
        let record = cache.get(3, 0, 0).unwrap().unwrap();
        assert_eq!(record.props, props);
        assert!(record.timestamp > 0);
    }

    #[test]
    fn test_get_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ChunkCache::open(dir.path().to_path_buf()).unwrap();
        assert!(cache.get(3, 10, -4).unwrap().is_none());
        // A read must not create world directories on disk.
        assert!(!dir.path().join("w3").exists());
    }

    #[test]
    fn test_delete_then_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ChunkCache::open(dir.path().to_path_buf()).unwrap();
        cache.put(1, -2, 7, &[sample_prop(1, 0.0)]).unwrap();
        cache.delete(1, -2, 7).unwrap();
        assert!(cache.get(1, -2, 7).unwrap().is_none());
    }

    #[test]
    fn test_worlds_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ChunkCache::open(dir.path().to_path_buf()).unwrap();
        cache.put(1, 0, 0, &[sample_prop(1, 0.0)]).unwrap();
        assert!(cache.get(2, 0, 0).unwrap().is_none());
    }

    #[test]
    fn test_available_coordinates() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ChunkCache::open(dir.path().to_path_buf()).unwrap();
        cache.put(1, 0, 0, &[sample_prop(1, 0.0)]).unwrap();
        cache.put(1, -1, 33, &[sample_prop(2, 0.0)]).unwrap();
        cache.put(1, 5, -40, &[sample_prop(3, 0.0)]).unwrap();
        let coords = cache.available_coordinates(1).unwrap();
        assert_eq!(coords, vec![(-1, 33), (0, 0), (5, -40)]);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let props = vec![sample_prop(9, 1.25)];
        {
            let mut cache = ChunkCache::open(dir.path().to_path_buf()).unwrap();
            cache.put(4, 100, 100, &props).unwrap();
        }
        let mut cache = ChunkCache::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(cache.get(4, 100, 100).unwrap().unwrap().props, props);
    }

    #[test]
    fn test_corrupt_payload_reports_codec_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ChunkCache::open(dir.path().to_path_buf()).unwrap();
        cache.put(1, 0, 0, &[sample_prop(1, 0.0)]).unwrap();
        // Overwrite the region payload with garbage through the region
        // layer directly.
        {
            let path = dir.path().join("w1").join("r.0.0.wwr");
            let mut region = RegionFile::open(&path).unwrap();
            region.write_chunk(0, 0, b"not prop records", 1).unwrap();
        }
        let mut cache = ChunkCache::open(dir.path().to_path_buf()).unwrap();
        assert!(matches!(
            cache.get(1, 0, 0),
            Err(CacheError::Codec(_))
        ));
        // The runtime's policy: drop the bad entry and refetch.
        cache.delete(1, 0, 0).unwrap();
        assert!(cache.get(1, 0, 0).unwrap().is_none());
    }

    #[test]
    fn test_record_count_cross_checked() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ChunkCache::open(dir.path().to_path_buf()).unwrap();
        cache.put(1, 0, 0, &[sample_prop(1, 0.0)]).unwrap();
        // Rewrite the record claiming a count its payload cannot hold.
        {
            let path = dir.path().join("w1").join("r.0.0.wwr");
            let mut region = RegionFile::open(&path).unwrap();
            let payload = wideworlds_protocol::serialize_props(&[sample_prop(2, 1.0)]);
            region.write_chunk(0, 0, &payload, 3).unwrap();
        }
        let mut cache = ChunkCache::open(dir.path().to_path_buf()).unwrap();
        assert!(matches!(
            cache.get(1, 0, 0),
            Err(CacheError::CountMismatch {
                expected: 3,
                actual: 1
            })
        ));
        cache.delete(1, 0, 0).unwrap();
        assert!(cache.get(1, 0, 0).unwrap().is_none());
    }
}
