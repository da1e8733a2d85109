//! PTP container framing (`spec.md` §3, §4.1).
//!
//! Every decoder here is a total function: it returns `None` on any buffer
//! truncation, negative offset, or malformed shape, and never panics. This
//! is the layer the bounds-safety property (`spec.md` §8 property 2)
//! is checked against.

use byteorder::{LittleEndian, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

/// Size in bytes of the fixed container header (length, type, code, txid).
pub const HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum ContainerType {
    Command = 1,
    Data = 2,
    Response = 3,
    Event = 4,
}

/// A decoded container header, with parameters still attached (commands,
/// responses and events carry up to five `u32` parameters inline; data
/// containers carry none and the remaining bytes are the payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub kind: ContainerType,
    pub code: u16,
    pub transaction_id: u32,
    pub params: Vec<u32>,
}

/// Read a `u16` at `offset` in little-endian order, or `None` if it would
/// read past the end of `buf`.
fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read a `u32` at `offset` in little-endian order, or `None` if it would
/// read past the end of `buf`.
fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl Container {
    /// Decode a full container (header + up to 5 trailing `u32` parameters)
    /// from `buf`. `buf` must contain exactly the bytes of one container;
    /// `length` is validated against `buf.len()`.
    pub fn decode(buf: &[u8]) -> Option<Container> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let length = read_u32(buf, 0)? as usize;
        if length != buf.len() {
            return None;
        }
        let kind = ContainerType::from_u16(read_u16(buf, 4)?)?;
        let code = read_u16(buf, 6)?;
        let transaction_id = read_u32(buf, 8)?;

        let payload = &buf[HEADER_SIZE..];
        let params = match kind {
            ContainerType::Data => Vec::new(),
            _ => {
                if payload.len() % 4 != 0 || payload.len() > 5 * 4 {
                    return None;
                }
                let mut params = Vec::with_capacity(payload.len() / 4);
                for chunk in payload.chunks_exact(4) {
                    params.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                }
                params
            }
        };

        Some(Container {
            kind,
            code,
            transaction_id,
            params,
        })
    }

    /// Decode just the 12-byte fixed header, returning the declared total
    /// container length (including the header) and the container without
    /// its trailing data/parameters. Used by [`crate::link::Link`] to learn
    /// how many more bytes to read before the rest of the container can be
    /// parsed.
    pub fn decode_header(buf: &[u8]) -> Option<(usize, ContainerType, u16, u32)> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let length = read_u32(buf, 0)? as usize;
        let kind = ContainerType::from_u16(read_u16(buf, 4)?)?;
        let code = read_u16(buf, 6)?;
        let transaction_id = read_u32(buf, 8)?;
        Some((length, kind, code, transaction_id))
    }

    /// Encode a command/response/event container (params inline, no
    /// separate data payload). The encoded length equals
    /// `HEADER_SIZE + 4 * params.len()`, per `spec.md` §3's length
    /// invariant.
    pub fn encode(kind: ContainerType, code: u16, transaction_id: u32, params: &[u32]) -> Vec<u8> {
        let len = HEADER_SIZE + 4 * params.len();
        let mut out = Vec::with_capacity(len);
        out.write_u32::<LittleEndian>(len as u32).ok();
        out.write_u16::<LittleEndian>(kind as u16).ok();
        out.write_u16::<LittleEndian>(code).ok();
        out.write_u32::<LittleEndian>(transaction_id).ok();
        for p in params {
            out.write_u32::<LittleEndian>(*p).ok();
        }
        out
    }

    /// Encode the 12-byte header of a data container whose payload is
    /// `payload_len` bytes long; the declared length covers the whole
    /// container (`spec.md` §3).
    pub fn encode_data_header(code: u16, transaction_id: u32, payload_len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.write_u32::<LittleEndian>((HEADER_SIZE + payload_len) as u32).ok();
        out.write_u16::<LittleEndian>(ContainerType::Data as u16).ok();
        out.write_u16::<LittleEndian>(code).ok();
        out.write_u32::<LittleEndian>(transaction_id).ok();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_open_session_command() {
        // spec.md S2: PTPContainer{length=16, type=1, code=0x1002, txid=1, params=[1]}
        let bytes = Container::encode(ContainerType::Command, 0x1002, 1, &[1]);
        assert_eq!(
            bytes,
            vec![0x10, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02, 0x10, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
        let decoded = Container::decode(&bytes).unwrap();
        assert_eq!(decoded.kind, ContainerType::Command);
        assert_eq!(decoded.code, 0x1002);
        assert_eq!(decoded.transaction_id, 1);
        assert_eq!(decoded.params, vec![1]);
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(Container::decode(&[0u8; 4]).is_none());
        assert!(Container::decode_header(&[0u8; 11]).is_none());
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut bytes = Container::encode(ContainerType::Command, 0x1001, 0, &[]);
        bytes[0] = 0xFF;
        assert!(Container::decode(&bytes).is_none());
    }

    #[test]
    fn rejects_unknown_container_type() {
        let mut bytes = Container::encode(ContainerType::Command, 0x1001, 0, &[]);
        bytes[4] = 0x09;
        bytes[5] = 0x00;
        assert!(Container::decode(&bytes).is_none());
    }

    #[test]
    fn rejects_odd_trailing_param_bytes() {
        let mut bytes = Container::encode(ContainerType::Command, 0x1001, 0, &[1]);
        // grow the declared length by 2 bytes without adding a full param
        bytes.extend_from_slice(&[0, 0]);
        bytes[0..4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        assert!(Container::decode(&bytes).is_none());
    }
}
