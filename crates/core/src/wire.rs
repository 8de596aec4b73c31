//! Fixed-layout message framing.
//!
//! Every message between processes travels in one frame:
//!
//! ```text
//! | size(4 BE) | type(1) | from_version(2 BE) | to_version(2 BE) |
//! | from_entity(16) | to_entity(16) | nonce(8 BE) | payload |
//! ```
//!
//! `size` counts every byte after the size field itself. Entities pack as
//! `space(4 BE) subspace(2 BE) prefix(1) mask(8 BE) number(1)`.

use thiserror::Error;

use crate::{EntityId, Nonce, RegionId, SpaceId};

pub const ENTITY_SIZE: usize = 16;
pub const HEADER_SIZE: usize = 1 + 2 + 2 + ENTITY_SIZE * 2 + 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame truncated at {0} bytes")]
    Truncated(usize),

    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    #[error("unknown status code {0}")]
    UnknownStatus(u16),
}

/// Message discriminator. Values are stable across releases.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ReqGet = 0x01,
    ReqPut = 0x02,
    ReqDel = 0x03,
    ReqCondPut = 0x04,
    ReqAtomic = 0x05,
    ReqSearchStart = 0x06,
    ReqSearchNext = 0x07,
    RespGet = 0x11,
    RespPut = 0x12,
    RespDel = 0x13,
    RespCondPut = 0x14,
    RespAtomic = 0x15,
    RespSearchItem = 0x16,
    RespSearchDone = 0x17,
    ChainPut = 0x20,
    ChainDel = 0x21,
    ChainSubspace = 0x22,
    ChainPending = 0x23,
    ChainAck = 0x24,
    XferMore = 0x30,
    XferData = 0x31,
    XferDone = 0x32,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        use MessageType::*;

        let t = match value {
            0x01 => ReqGet,
            0x02 => ReqPut,
            0x03 => ReqDel,
            0x04 => ReqCondPut,
            0x05 => ReqAtomic,
            0x06 => ReqSearchStart,
            0x07 => ReqSearchNext,
            0x11 => RespGet,
            0x12 => RespPut,
            0x13 => RespDel,
            0x14 => RespCondPut,
            0x15 => RespAtomic,
            0x16 => RespSearchItem,
            0x17 => RespSearchDone,
            0x20 => ChainPut,
            0x21 => ChainDel,
            0x22 => ChainSubspace,
            0x23 => ChainPending,
            0x24 => ChainAck,
            0x30 => XferMore,
            0x31 => XferData,
            0x32 => XferDone,
            other => return Err(WireError::UnknownType(other)),
        };

        Ok(t)
    }
}

/// Client-visible termination status. Integers are stable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    Success = 8448,
    NotFound = 8449,
    SearchDone = 8450,
    CmpFail = 8451,
    ReadOnly = 8452,
    UnknownSpace = 8512,
    ServerError = 8514,
    Overflow = 8516,
    Reconfigure = 8517,
    Timeout = 8519,
    WrongArity = 8522,
}

impl TryFrom<u16> for Status {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, WireError> {
        use Status::*;

        let s = match value {
            8448 => Success,
            8449 => NotFound,
            8450 => SearchDone,
            8451 => CmpFail,
            8452 => ReadOnly,
            8512 => UnknownSpace,
            8514 => ServerError,
            8516 => Overflow,
            8517 => Reconfigure,
            8519 => Timeout,
            8522 => WrongArity,
            other => return Err(WireError::UnknownStatus(other)),
        };

        Ok(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub from_version: u16,
    pub to_version: u16,
    pub from: EntityId,
    pub to: EntityId,
    pub nonce: Nonce,
    pub payload: Vec<u8>,
}

pub fn pack_entity(entity: &EntityId, out: &mut Vec<u8>) {
    out.extend_from_slice(&entity.region.space.0.to_be_bytes());
    out.extend_from_slice(&entity.region.subspace.to_be_bytes());
    out.push(entity.region.prefix);
    out.extend_from_slice(&entity.region.mask.to_be_bytes());
    out.push(entity.number);
}

pub fn unpack_entity(buf: &[u8]) -> Result<EntityId, WireError> {
    if buf.len() < ENTITY_SIZE {
        return Err(WireError::Truncated(buf.len()));
    }

    let space = SpaceId(u32::from_be_bytes(buf[0..4].try_into().unwrap()));
    let subspace = u16::from_be_bytes(buf[4..6].try_into().unwrap());
    let prefix = buf[6];
    let mask = u64::from_be_bytes(buf[7..15].try_into().unwrap());

    Ok(EntityId {
        region: RegionId::new(space, subspace, prefix, mask),
        number: buf[15],
    })
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let size = HEADER_SIZE + self.payload.len();
        let mut out = Vec::with_capacity(4 + size);
        out.extend_from_slice(&(size as u32).to_be_bytes());
        out.push(self.msg_type as u8);
        out.extend_from_slice(&self.from_version.to_be_bytes());
        out.extend_from_slice(&self.to_version.to_be_bytes());
        pack_entity(&self.from, &mut out);
        pack_entity(&self.to, &mut out);
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Frame, WireError> {
        if buf.len() < 4 + HEADER_SIZE {
            return Err(WireError::Truncated(buf.len()));
        }

        let size = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;

        if buf.len() < 4 + size || size < HEADER_SIZE {
            return Err(WireError::Truncated(buf.len()));
        }

        let msg_type = MessageType::try_from(buf[4])?;
        let from_version = u16::from_be_bytes(buf[5..7].try_into().unwrap());
        let to_version = u16::from_be_bytes(buf[7..9].try_into().unwrap());
        let from = unpack_entity(&buf[9..])?;
        let to = unpack_entity(&buf[9 + ENTITY_SIZE..])?;
        let nonce_at = 9 + ENTITY_SIZE * 2;
        let nonce = u64::from_be_bytes(buf[nonce_at..nonce_at + 8].try_into().unwrap());
        let payload = buf[4 + HEADER_SIZE..4 + size].to_vec();

        Ok(Frame {
            msg_type,
            from_version,
            to_version,
            from,
            to,
            nonce,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame {
            msg_type: MessageType::ChainPut,
            from_version: 3,
            to_version: 3,
            from: EntityId::new(RegionId::new(SpaceId(9), 1, 8, 0xab00_0000_0000_0000), 2),
            to: EntityId::new(RegionId::new(SpaceId(9), 1, 8, 0xab00_0000_0000_0000), 3),
            nonce: 0xdead_beef,
            payload: b"payload".to_vec(),
        }
    }

    #[test]
    fn frames_roundtrip() {
        let frame = sample();
        let bytes = frame.encode();
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn size_field_counts_everything_after_itself() {
        let bytes = sample().encode();
        let size = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert_eq!(size, bytes.len() - 4);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let bytes = sample().encode();
        assert!(matches!(
            Frame::decode(&bytes[..bytes.len() - 1]),
            Err(WireError::Truncated(_))
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = sample().encode();
        bytes[4] = 0x7f;
        assert_eq!(Frame::decode(&bytes), Err(WireError::UnknownType(0x7f)));
    }

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(Status::Success as u16, 8448);
        assert_eq!(Status::Reconfigure as u16, 8517);
        assert_eq!(Status::try_from(8516).unwrap(), Status::Overflow);
        assert!(Status::try_from(9999).is_err());
    }
}
