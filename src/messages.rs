//! Router control messages.
//!
//! Binary, self-delimiting, all integers little-endian. Every frame opens
//! with a 4-byte common header (type, flags); 64-bit fields sit at 8-byte
//! offsets. A STORE frame carries the serialized bundle immediately after
//! its header; the bundle needs no length prefix because bundles are
//! self-delimiting.

use crate::eid::Eid;
use crate::{Error, Result};

pub const MSG_TYPE_STORE: u16 = 1;
pub const MSG_TYPE_EGRESS_ACK: u16 = 2;
pub const MSG_TYPE_IRELSTART: u16 = 3;
pub const MSG_TYPE_IRELSTOP: u16 = 4;
pub const MSG_TYPE_STORAGE_ACK: u16 = 5;
pub const MSG_TYPE_EGRESS: u16 = 6;
/// In-process only; breaks the router's receive loop.
pub const MSG_TYPE_SHUTDOWN: u16 = 7;

pub const COMMON_HDR_SIZE: usize = 4;
pub const TO_STORAGE_HDR_SIZE: usize = 16;
pub const EGRESS_ACK_HDR_SIZE: usize = 40;
pub const IRELEASE_HDR_SIZE: usize = 24;
pub const STORAGE_ACK_HDR_SIZE: usize = 40;
pub const TO_EGRESS_HDR_SIZE: usize = 40;

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(buf[at..at + 2].try_into().expect("slice length"))
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().expect("slice length"))
}

fn write_common(msg_type: u16, buf: &mut [u8]) {
    buf[0..2].copy_from_slice(&msg_type.to_le_bytes());
    buf[2..4].fill(0); // flags, reserved
}

fn read_eid(buf: &[u8], at: usize) -> Eid {
    Eid::new(read_u64(buf, at), read_u64(buf, at + 8))
}

fn write_eid(eid: Eid, buf: &mut [u8], at: usize) {
    buf[at..at + 8].copy_from_slice(&eid.node_id.to_le_bytes());
    buf[at + 8..at + 16].copy_from_slice(&eid.service_id.to_le_bytes());
}

/// Frame type of an encoded message, without decoding the rest.
pub fn frame_type(frame: &[u8]) -> Result<u16> {
    if frame.len() < COMMON_HDR_SIZE {
        return Err(Error::Corrupt("frame shorter than common header"));
    }
    Ok(read_u16(frame, 0))
}

/// STORE: ingress hands a bundle to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToStorageHdr {
    pub ingress_unique_id: u64,
}

impl ToStorageHdr {
    pub fn to_bytes(&self) -> [u8; TO_STORAGE_HDR_SIZE] {
        let mut buf = [0u8; TO_STORAGE_HDR_SIZE];
        write_common(MSG_TYPE_STORE, &mut buf);
        buf[8..16].copy_from_slice(&self.ingress_unique_id.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < TO_STORAGE_HDR_SIZE || read_u16(buf, 0) != MSG_TYPE_STORE {
            return Err(Error::Corrupt("malformed ToStorageHdr"));
        }
        Ok(Self {
            ingress_unique_id: read_u64(buf, 8),
        })
    }
}

/// EGRESS_ACK: egress confirms (or rejects waiting for custody) a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EgressAckHdr {
    pub final_dest_eid: Eid,
    pub custody_id: u64,
    pub delete_now: bool,
}

impl EgressAckHdr {
    pub fn to_bytes(&self) -> [u8; EGRESS_ACK_HDR_SIZE] {
        let mut buf = [0u8; EGRESS_ACK_HDR_SIZE];
        write_common(MSG_TYPE_EGRESS_ACK, &mut buf);
        write_eid(self.final_dest_eid, &mut buf, 8);
        buf[24..32].copy_from_slice(&self.custody_id.to_le_bytes());
        buf[32] = u8::from(self.delete_now);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != EGRESS_ACK_HDR_SIZE || read_u16(buf, 0) != MSG_TYPE_EGRESS_ACK {
            return Err(Error::Corrupt("malformed EgressAckHdr"));
        }
        Ok(Self {
            final_dest_eid: read_eid(buf, 8),
            custody_id: read_u64(buf, 24),
            delete_now: buf[32] != 0,
        })
    }
}

/// IRELSTART / IRELSTOP: toggle a destination's release state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IreleaseHdr {
    pub start: bool,
    pub final_dest_eid: Eid,
}

impl IreleaseHdr {
    pub fn to_bytes(&self) -> [u8; IRELEASE_HDR_SIZE] {
        let mut buf = [0u8; IRELEASE_HDR_SIZE];
        write_common(
            if self.start {
                MSG_TYPE_IRELSTART
            } else {
                MSG_TYPE_IRELSTOP
            },
            &mut buf,
        );
        write_eid(self.final_dest_eid, &mut buf, 8);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != IRELEASE_HDR_SIZE {
            return Err(Error::Corrupt("malformed IreleaseHdr"));
        }
        let start = match read_u16(buf, 0) {
            MSG_TYPE_IRELSTART => true,
            MSG_TYPE_IRELSTOP => false,
            _ => return Err(Error::Corrupt("malformed IreleaseHdr")),
        };
        Ok(Self {
            start,
            final_dest_eid: read_eid(buf, 8),
        })
    }
}

/// STORAGE_ACK: storage's reply to a STORE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageAckHdr {
    pub final_dest_eid: Eid,
    pub ingress_unique_id: u64,
    pub error: u8,
}

impl StorageAckHdr {
    pub fn to_bytes(&self) -> [u8; STORAGE_ACK_HDR_SIZE] {
        let mut buf = [0u8; STORAGE_ACK_HDR_SIZE];
        write_common(MSG_TYPE_STORAGE_ACK, &mut buf);
        write_eid(self.final_dest_eid, &mut buf, 8);
        buf[24..32].copy_from_slice(&self.ingress_unique_id.to_le_bytes());
        buf[32] = self.error;
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != STORAGE_ACK_HDR_SIZE || read_u16(buf, 0) != MSG_TYPE_STORAGE_ACK {
            return Err(Error::Corrupt("malformed StorageAckHdr"));
        }
        Ok(Self {
            final_dest_eid: read_eid(buf, 8),
            ingress_unique_id: read_u64(buf, 24),
            error: buf[32],
        })
    }
}

/// EGRESS: a released bundle on its way out, bundle bytes trailing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToEgressHdr {
    pub final_dest_eid: Eid,
    pub has_custody: bool,
    pub is_cut_through_from_ingress: bool,
    pub custody_id: u64,
}

impl ToEgressHdr {
    pub fn to_bytes(&self) -> [u8; TO_EGRESS_HDR_SIZE] {
        let mut buf = [0u8; TO_EGRESS_HDR_SIZE];
        write_common(MSG_TYPE_EGRESS, &mut buf);
        write_eid(self.final_dest_eid, &mut buf, 8);
        buf[24] = u8::from(self.has_custody);
        buf[25] = u8::from(self.is_cut_through_from_ingress);
        buf[32..40].copy_from_slice(&self.custody_id.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < TO_EGRESS_HDR_SIZE || read_u16(buf, 0) != MSG_TYPE_EGRESS {
            return Err(Error::Corrupt("malformed ToEgressHdr"));
        }
        Ok(Self {
            final_dest_eid: read_eid(buf, 8),
            has_custody: buf[24] != 0,
            is_cut_through_from_ingress: buf[25] != 0,
            custody_id: read_u64(buf, 32),
        })
    }
}
