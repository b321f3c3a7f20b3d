use crate::codec::{ensure, get_f32, get_f64, get_u16, get_u32, get_u64, read_cue, CodecError, CodecResult, ENDIAN_CUE};
use bytes::{Buf, BufMut, BytesMut};
use wideworlds_types::Prop;

/// Fixed-width head of a prop record: cue, three u32 ids, date, f64
/// position, f32 rotation, three string lengths.
const PROP_HEAD_BYTES: usize = 4 + 3 * 4 + 8 + 3 * 8 + 3 * 4 + 3 * 2;

/// Write one prop record in native byte order. Strings are u16
/// length-prefixed UTF-8, lengths grouped before the bytes.
pub fn write_prop(buf: &mut BytesMut, prop: &Prop) {
    buf.put_u32_ne(ENDIAN_CUE);
    buf.put_u32_ne(prop.id);
    buf.put_u32_ne(prop.world_id);
    buf.put_u32_ne(prop.user_id);
    buf.put_u64_ne(prop.date);
    buf.put_f64_ne(prop.x);
    buf.put_f64_ne(prop.y);
    buf.put_f64_ne(prop.z);
    buf.put_f32_ne(prop.yaw);
    buf.put_f32_ne(prop.pitch);
    buf.put_f32_ne(prop.roll);
    buf.put_u16_ne(prop.name.len() as u16);
    buf.put_u16_ne(prop.description.len() as u16);
    buf.put_u16_ne(prop.action.len() as u16);
    buf.put_slice(prop.name.as_bytes());
    buf.put_slice(prop.description.as_bytes());
    buf.put_slice(prop.action.as_bytes());
}

pub fn serialize_prop(prop: &Prop) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_prop(&mut buf, prop);
    buf.to_vec()
}

fn read_prop_string(buf: &mut &[u8], len: usize, field: &'static str) -> CodecResult<String> {
    ensure(buf, len)?;
    let bytes = &buf[..len];
    let s = std::str::from_utf8(bytes)
        .map_err(|_| CodecError::InvalidString(field))?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

/// Read one prop record, advancing the slice past it.
pub fn read_prop(buf: &mut &[u8]) -> CodecResult<Prop> {
    ensure(buf, PROP_HEAD_BYTES)?;
    let swap = read_cue(buf)?;
    let id = get_u32(buf, swap);
    let world_id = get_u32(buf, swap);
    let user_id = get_u32(buf, swap);
    let date = get_u64(buf, swap);
    let x = get_f64(buf, swap);
    let y = get_f64(buf, swap);
    let z = get_f64(buf, swap);
    let yaw = get_f32(buf, swap);
    let pitch = get_f32(buf, swap);
    let roll = get_f32(buf, swap);
    let name_len = get_u16(buf, swap) as usize;
    let description_len = get_u16(buf, swap) as usize;
    let action_len = get_u16(buf, swap) as usize;
    let name = read_prop_string(buf, name_len, "name")?;
    let description = read_prop_string(buf, description_len, "description")?;
    let action = read_prop_string(buf, action_len, "action")?;
    Ok(Prop {
        id,
        world_id,
        user_id,
        date,
        x,
        y,
        z,
        yaw,
        pitch,
        roll,
        name,
        description,
        action,
    })
}

pub fn deserialize_prop(bytes: &[u8]) -> CodecResult<Prop> {
    let mut slice = bytes;
    read_prop(&mut slice)
}

/// Serialize a chunk's props back to back, the cache payload format.
pub fn serialize_props(props: &[Prop]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for prop in props {
        write_prop(&mut buf, prop);
    }
    buf.to_vec()
}

/// Parse back-to-back prop records until the buffer is exhausted.
pub fn deserialize_props(bytes: &[u8]) -> CodecResult<Vec<Prop>> {
    let mut slice = bytes;
    let mut props = Vec::new();
    while !slice.is_empty() {
        props.push(read_prop(&mut slice)?);
    }
    Ok(props)
}
