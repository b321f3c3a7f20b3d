use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Endianness cue written in native byte order at the head of every
/// binary record. A reader seeing the byte-swapped value swaps all
/// multi-byte fields on the fly.
pub const ENDIAN_CUE: u32 = 0x1122_3344;

/// Size of one serialized entity state.
pub const ENTITY_STATE_BYTES: usize = 56;
/// Size of the packed-stream header (cue + count).
pub const PACK_HEADER_BYTES: usize = 8;
// Field bytes end at offset 52; the trailing pad keeps records 8-byte
// aligned and the record size fixed.
const ENTITY_STATE_PAD: usize = 4;

pub mod entity_type {
    pub const USER: u16 = 1;
}

pub mod update_type {
    pub const JOINING: u16 = 1;
    pub const LEAVING: u16 = 2;
    pub const MOVING: u16 = 3;
    pub const TELEPORTING: u16 = 4;
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unknown endianness cue: {0:#010x}")]
    UnknownEndianness(u32),
    #[error("Bad entity state size: {0} bytes")]
    BadStateSize(usize),
    #[error("Not enough data")]
    NotEnoughData,
    #[error("Forwarded state does not match sender {field}")]
    ForwardMismatch { field: &'static str },
    #[error("Invalid UTF-8 in {0}")]
    InvalidString(&'static str),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// One remote-entity state sample. Position in meters, angles in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityState {
    pub entity_type: u16,
    pub update_type: u16,
    pub entity_id: u32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    /// avatar id, animation hash, speed/progress and friends.
    pub data_block: [u16; 8],
}

impl Default for EntityState {
    fn default() -> Self {
        Self {
            entity_type: entity_type::USER,
            update_type: update_type::MOVING,
            entity_id: 0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            yaw: 0.0,
            pitch: 0.0,
            roll: 0.0,
            data_block: [0; 8],
        }
    }
}

/// Read the cue and report whether subsequent fields must be swapped.
pub fn read_cue(buf: &mut &[u8]) -> CodecResult<bool> {
    if buf.remaining() < 4 {
        return Err(CodecError::NotEnoughData);
    }
    let cue = buf.get_u32_ne();
    if cue == ENDIAN_CUE {
        Ok(false)
    } else if cue == ENDIAN_CUE.swap_bytes() {
        Ok(true)
    } else {
        Err(CodecError::UnknownEndianness(cue))
    }
}

pub(crate) fn ensure(buf: &&[u8], n: usize) -> CodecResult<()> {
    if buf.remaining() < n {
        return Err(CodecError::NotEnoughData);
    }
    Ok(())
}

pub(crate) fn get_u16(buf: &mut &[u8], swap: bool) -> u16 {
    let v = buf.get_u16_ne();
    if swap { v.swap_bytes() } else { v }
}

pub(crate) fn get_u32(buf: &mut &[u8], swap: bool) -> u32 {
    let v = buf.get_u32_ne();
    if swap { v.swap_bytes() } else { v }
}

pub(crate) fn get_u64(buf: &mut &[u8], swap: bool) -> u64 {
    let v = buf.get_u64_ne();
    if swap { v.swap_bytes() } else { v }
}

pub(crate) fn get_f32(buf: &mut &[u8], swap: bool) -> f32 {
    f32::from_bits(get_u32(buf, swap))
}

pub(crate) fn get_f64(buf: &mut &[u8], swap: bool) -> f64 {
    f64::from_bits(get_u64(buf, swap))
}

/// Write one entity state in native byte order.
pub fn write_entity_state(buf: &mut BytesMut, s: &EntityState) {
    buf.put_u32_ne(ENDIAN_CUE);
    buf.put_u16_ne(s.entity_type);
    buf.put_u16_ne(s.update_type);
    buf.put_u32_ne(s.entity_id);
    buf.put_f32_ne(s.x);
    buf.put_f32_ne(s.y);
    buf.put_f32_ne(s.z);
    buf.put_f32_ne(s.yaw);
    buf.put_f32_ne(s.pitch);
    buf.put_f32_ne(s.roll);
    for block in s.data_block {
        buf.put_u16_ne(block);
    }
    buf.put_bytes(0, ENTITY_STATE_PAD);
}

pub fn serialize_entity_state(s: &EntityState) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(ENTITY_STATE_BYTES);
    write_entity_state(&mut buf, s);
    buf.to_vec()
}

/// Read one entity state, honoring the record's own cue.
pub fn read_entity_state(buf: &mut &[u8]) -> CodecResult<EntityState> {
    ensure(buf, ENTITY_STATE_BYTES)?;
    let swap = read_cue(buf)?;
    let entity_type = get_u16(buf, swap);
    let update_type = get_u16(buf, swap);
    let entity_id = get_u32(buf, swap);
    let x = get_f32(buf, swap);
    let y = get_f32(buf, swap);
    let z = get_f32(buf, swap);
    let yaw = get_f32(buf, swap);
    let pitch = get_f32(buf, swap);
    let roll = get_f32(buf, swap);
    let mut data_block = [0u16; 8];
    for block in &mut data_block {
        *block = get_u16(buf, swap);
    }
    buf.advance(ENTITY_STATE_PAD);
    Ok(EntityState {
        entity_type,
        update_type,
        entity_id,
        x,
        y,
        z,
        yaw,
        pitch,
        roll,
        data_block,
    })
}

pub fn deserialize_entity_state(bytes: &[u8]) -> CodecResult<EntityState> {
    if bytes.len() != ENTITY_STATE_BYTES {
        return Err(CodecError::BadStateSize(bytes.len()));
    }
    let mut slice = bytes;
    read_entity_state(&mut slice)
}

/// Pack already-serialized states into one stream:
/// `cue | count | count x state`. The header count is a record count,
/// not a byte count.
pub fn pack_entity_states<B: AsRef<[u8]>>(states: &[B]) -> CodecResult<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(PACK_HEADER_BYTES + states.len() * ENTITY_STATE_BYTES);
    buf.put_u32_ne(ENDIAN_CUE);
    buf.put_u32_ne(states.len() as u32);
    for state in states {
        let bytes = state.as_ref();
        if bytes.len() != ENTITY_STATE_BYTES {
            return Err(CodecError::BadStateSize(bytes.len()));
        }
        buf.put_slice(bytes);
    }
    Ok(buf.to_vec())
}

/// Unpack a packed stream into parsed states. The payload length must be
/// exactly `count` records.
pub fn unpack_entity_states(bytes: &[u8]) -> CodecResult<Vec<EntityState>> {
    let mut slice = bytes;
    let swap = read_cue(&mut slice)?;
    ensure(&slice, 4)?;
    let count = get_u32(&mut slice, swap) as usize;
    if slice.remaining() != count * ENTITY_STATE_BYTES {
        return Err(CodecError::BadStateSize(slice.remaining()));
    }
    let mut states = Vec::with_capacity(count);
    for _ in 0..count {
        states.push(read_entity_state(&mut slice)?);
    }
    Ok(states)
}

/// Validate a state a client asks the server to broadcast on its behalf:
/// the payload must be exactly one record and its identity fields must
/// match the sender. Returns the original bytes untouched.
pub fn forward_entity_state<'a>(
    expected_type: u16,
    expected_id: u32,
    bytes: &'a [u8],
) -> CodecResult<&'a [u8]> {
    if bytes.len() != ENTITY_STATE_BYTES {
        return Err(CodecError::BadStateSize(bytes.len()));
    }
    let mut slice = bytes;
    let swap = read_cue(&mut slice)?;
    let entity_type = get_u16(&mut slice, swap);
    let _update_type = get_u16(&mut slice, swap);
    let entity_id = get_u32(&mut slice, swap);
    if entity_type != expected_type {
        return Err(CodecError::ForwardMismatch { field: "entity type" });
    }
    if entity_id != expected_id {
        return Err(CodecError::ForwardMismatch { field: "entity id" });
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> EntityState {
        EntityState {
            entity_type: entity_type::USER,
            update_type: update_type::MOVING,
            entity_id: 42,
            x: 10.5,
            y: -0.25,
            z: 1337.0,
            yaw: 1.5708,
            pitch: -0.1,
            roll: 0.0,
            data_block: [3, 0xCAFE, 150, 0, 0, 0, 0, 7],
        }
    }

    fn assert_states_close(a: &EntityState, b: &EntityState) {
        assert_eq!(a.entity_type, b.entity_type);
        assert_eq!(a.update_type, b.update_type);
        assert_eq!(a.entity_id, b.entity_id);
        assert!((a.x - b.x).abs() < 0.001);
        assert!((a.y - b.y).abs() < 0.001);
        assert!((a.z - b.z).abs() < 0.001);
        assert!((a.yaw - b.yaw).abs() < 0.001);
        assert!((a.pitch - b.pitch).abs() < 0.001);
        assert!((a.roll - b.roll).abs() < 0.001);
        assert_eq!(a.data_block, b.data_block);
    }

    #[test]
    fn test_entity_state_roundtrip() {
        let state = sample_state();
        let bytes = serialize_entity_state(&state);
        assert_eq!(bytes.len(), ENTITY_STATE_BYTES);
        let back = deserialize_entity_state(&bytes).unwrap();
        assert_states_close(&state, &back);
    }

    /// Byte-swap every multi-byte field in a serialized state, simulating
    /// a sender with opposite endianness.
    fn swap_serialized(bytes: &[u8]) -> Vec<u8> {
        let widths = [
            4, 2, 2, 4, // cue, type, update, id
            4, 4, 4, 4, 4, 4, // x y z yaw pitch roll
            2, 2, 2, 2, 2, 2, 2, 2, // data blocks
            1, 1, 1, 1, // pad
        ];
        let mut out = Vec::with_capacity(bytes.len());
        let mut off = 0;
        for w in widths {
            out.extend(bytes[off..off + w].iter().rev());
            off += w;
        }
        out
    }

    #[test]
    fn test_entity_state_swapped_endianness() {
        let state = sample_state();
        let swapped = swap_serialized(&serialize_entity_state(&state));
        let back = deserialize_entity_state(&swapped).unwrap();
        assert_states_close(&state, &back);
    }

    #[test]
    fn test_unknown_cue_fails() {
        let mut bytes = serialize_entity_state(&sample_state());
        bytes[0] = 0xAA;
        bytes[1] = 0xBB;
        bytes[2] = 0xCC;
        bytes[3] = 0xDD;
        assert!(matches!(
            deserialize_entity_state(&bytes),
            Err(CodecError::UnknownEndianness(_))
        ));
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let states = vec![
            sample_state(),
            EntityState {
                entity_id: 43,
                x: -5.0,
                ..sample_state()
            },
        ];
        let raw: Vec<Vec<u8>> = states.iter().map(serialize_entity_state).collect();
        let packed = pack_entity_states(&raw).unwrap();
        assert_eq!(packed.len(), PACK_HEADER_BYTES + 2 * ENTITY_STATE_BYTES);
        let back = unpack_entity_states(&packed).unwrap();
        assert_eq!(back.len(), 2);
        assert_states_close(&states[0], &back[0]);
        assert_states_close(&states[1], &back[1]);
    }

    #[test]
    fn test_pack_rejects_wrong_size() {
        let short = vec![0u8; ENTITY_STATE_BYTES - 1];
        assert!(matches!(
            pack_entity_states(&[short]),
            Err(CodecError::BadStateSize(_))
        ));
    }

    #[test]
    fn test_unpack_rejects_corrupted_length() {
        let raw = vec![serialize_entity_state(&sample_state())];
        let mut packed = pack_entity_states(&raw).unwrap();
        packed.push(0);
        assert!(matches!(
            unpack_entity_states(&packed),
            Err(CodecError::BadStateSize(_))
        ));
    }

    #[test]
    fn test_forward_accepts_matching_identity() {
        let bytes = serialize_entity_state(&sample_state());
        let out = forward_entity_state(entity_type::USER, 42, &bytes).unwrap();
        assert_eq!(out, &bytes[..]);
    }

    #[test]
    fn test_forward_rejects_spoofed_id() {
        let bytes = serialize_entity_state(&sample_state());
        assert!(matches!(
            forward_entity_state(entity_type::USER, 7, &bytes),
            Err(CodecError::ForwardMismatch { field: "entity id" })
        ));
        assert!(matches!(
            forward_entity_state(99, 42, &bytes),
            Err(CodecError::ForwardMismatch { field: "entity type" })
        ));
    }

    #[test]
    fn test_forward_rejects_bad_length() {
        assert!(matches!(
            forward_entity_state(entity_type::USER, 42, &[0u8; 10]),
            Err(CodecError::BadStateSize(10))
        ));
    }
}
