use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Chunks per region file side.
pub const REGION_SIDE: i32 = 32;

const ENTRY_COUNT: usize = (REGION_SIDE * REGION_SIDE) as usize;
const MAGIC: [u8; 4] = *b"WWRC";
const FORMAT_VERSION: u16 = 1;
const SECTOR_BYTES: u64 = 4096;
/// Magic, version, reserved tail.
const HEADER_BYTES: u64 = 16;
const ENTRY_BYTES: u64 = 16;
/// Payload sectors begin past the directory, sector-aligned.
const DATA_START: u64 = {
    let directory_end = HEADER_BYTES + ENTRY_COUNT as u64 * ENTRY_BYTES;
    (directory_end + SECTOR_BYTES - 1) / SECTOR_BYTES * SECTOR_BYTES
};

/// One directory slot, all fields little-endian on disk:
/// start sector, reserved sector span, prop record count, write time.
/// A zero start sector means vacant (sector 0 holds the directory).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DirEntry {
    start_sector: u32,
    reserved_sectors: u32,
    prop_count: u32,
    written_at: u32,
}

impl DirEntry {
    fn is_vacant(&self) -> bool {
        self.start_sector == 0
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let word = |i: usize| {
            u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
        };
        Self {
            start_sector: word(0),
            reserved_sectors: word(1),
            prop_count: word(2),
            written_at: word(3),
        }
    }

    fn to_bytes(self) -> [u8; ENTRY_BYTES as usize] {
        let mut out = [0u8; ENTRY_BYTES as usize];
        out[0..4].copy_from_slice(&self.start_sector.to_le_bytes());
        out[4..8].copy_from_slice(&self.reserved_sectors.to_le_bytes());
        out[8..12].copy_from_slice(&self.prop_count.to_le_bytes());
        out[12..16].copy_from_slice(&self.written_at.to_le_bytes());
        out
    }
}

/// One chunk record as it comes off disk: the inflated prop payload and
/// the directory bookkeeping the cache wants back.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub payload: Vec<u8>,
    pub prop_count: u32,
    pub written_at: u32,
}

/// A single region file: 32x32 chunk prop records behind a directory of
/// fixed slots. Payloads are deflate-compressed and sector-aligned; a
/// rewrite stays in place while it fits its reserved span and moves to
/// the end of the file once it outgrows it.
pub struct RegionFile {
    file: File,
    directory: Vec<DirEntry>,
    end_sector: u32,
}

impl RegionFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let fresh = !path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut directory = vec![DirEntry::default(); ENTRY_COUNT];
        if fresh {
            let mut header = [0u8; HEADER_BYTES as usize];
            header[..4].copy_from_slice(&MAGIC);
            header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
            file.write_all(&header)?;
            file.write_all(&vec![0u8; ENTRY_COUNT * ENTRY_BYTES as usize])?;
            file.flush()?;
        } else {
            let mut header = [0u8; HEADER_BYTES as usize];
            file.read_exact(&mut header)?;
            if header[..4] != MAGIC {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "not a chunk region file",
                ));
            }
            let version = u16::from_le_bytes([header[4], header[5]]);
            if version != FORMAT_VERSION {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsupported region format version {}", version),
                ));
            }
            let mut raw = vec![0u8; ENTRY_COUNT * ENTRY_BYTES as usize];
            file.read_exact(&mut raw)?;
            for (entry, bytes) in directory
                .iter_mut()
                .zip(raw.chunks_exact(ENTRY_BYTES as usize))
            {
                *entry = DirEntry::from_bytes(bytes);
            }
        }

        let end_sector = directory
            .iter()
            .map(|e| e.start_sector + e.reserved_sectors)
            .max()
            .unwrap_or(0)
            .max((DATA_START / SECTOR_BYTES) as u32);

        Ok(Self {
            file,
            directory,
            end_sector,
        })
    }

    fn slot(local_x: usize, local_z: usize) -> usize {
        local_z * REGION_SIDE as usize + local_x
    }

    pub fn read_chunk(&mut self, local_x: usize, local_z: usize) -> io::Result<Option<StoredChunk>> {
        let entry = self.directory[Self::slot(local_x, local_z)];
        if entry.is_vacant() {
            return Ok(None);
        }

        self.file
            .seek(SeekFrom::Start(entry.start_sector as u64 * SECTOR_BYTES))?;
        let mut len_bytes = [0u8; 4];
        self.file.read_exact(&mut len_bytes)?;
        let compressed_len = u32::from_le_bytes(len_bytes) as u64;
        if compressed_len + 4 > entry.reserved_sectors as u64 * SECTOR_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk record overruns its reserved span",
            ));
        }

        let mut compressed = vec![0u8; compressed_len as usize];
        self.file.read_exact(&mut compressed)?;
        let mut payload = Vec::new();
        DeflateDecoder::new(&compressed[..]).read_to_end(&mut payload)?;

        Ok(Some(StoredChunk {
            payload,
            prop_count: entry.prop_count,
            written_at: entry.written_at,
        }))
    }

    pub fn write_chunk(
        &mut self,
        local_x: usize,
        local_z: usize,
        payload: &[u8],
        prop_count: u32,
    ) -> io::Result<()> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload)?;
        let compressed = encoder.finish()?;
        let needed = sectors_for(4 + compressed.len() as u64);

        let slot = Self::slot(local_x, local_z);
        let old = self.directory[slot];
        // An outgrown record moves to the end of the file; its old span
        // is left behind until the entry is rewritten smaller.
        let (start, reserved) = if !old.is_vacant() && needed <= old.reserved_sectors {
            (old.start_sector, old.reserved_sectors)
        } else {
            let start = self.end_sector;
            self.end_sector += needed;
            (start, needed)
        };

        self.file
            .seek(SeekFrom::Start(start as u64 * SECTOR_BYTES))?;
        self.file
            .write_all(&(compressed.len() as u32).to_le_bytes())?;
        self.file.write_all(&compressed)?;
        let padding = reserved as u64 * SECTOR_BYTES - 4 - compressed.len() as u64;
        if padding > 0 {
            self.file.write_all(&vec![0u8; padding as usize])?;
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        self.directory[slot] = DirEntry {
            start_sector: start,
            reserved_sectors: reserved,
            prop_count,
            written_at: now,
        };
        self.write_entry(slot)?;
        self.file.flush()?;

        Ok(())
    }

    /// Clear a chunk entry. The payload sectors stay on disk but become
    /// unreferenced.
    pub fn delete_chunk(&mut self, local_x: usize, local_z: usize) -> io::Result<()> {
        let slot = Self::slot(local_x, local_z);
        if self.directory[slot].is_vacant() {
            return Ok(());
        }
        self.directory[slot] = DirEntry::default();
        self.write_entry(slot)?;
        self.file.flush()?;
        Ok(())
    }

    /// Local coordinates of every present chunk.
    pub fn occupied(&self) -> Vec<(usize, usize)> {
        self.directory
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.is_vacant())
            .map(|(slot, _)| (slot % REGION_SIDE as usize, slot / REGION_SIDE as usize))
            .collect()
    }

    fn write_entry(&mut self, slot: usize) -> io::Result<()> {
        self.file
            .seek(SeekFrom::Start(HEADER_BYTES + slot as u64 * ENTRY_BYTES))?;
        self.file.write_all(&self.directory[slot].to_bytes())
    }
}

fn sectors_for(bytes: u64) -> u32 {
    ((bytes + SECTOR_BYTES - 1) / SECTOR_BYTES) as u32
}
