//! Minimal primary-block codec.
//!
//! The engine stores bundles as opaque bytes; the full codec lives
//! elsewhere. What lives here is the one surface both the ingress path and
//! the restore scan need: pulling routing metadata (destination, priority,
//! expiration, custody) out of the primary block at the front of a bundle,
//! for BPv6 (SDNV, compressed-header encoding) and BPv7 (CBOR). Write and
//! restore must agree on these fields, so there is exactly one parser.
//!
//! The serializers exist for admin-record bundles the node originates
//! (aggregate custody signals) and for test fixtures.

use crate::codec::{cbor, sdnv};
use crate::eid::Eid;
use crate::{Error, Result};

pub const BPV6_VERSION: u8 = 6;
pub const BPV7_VERSION: u8 = 7;

pub const BPV6_FLAG_IS_FRAGMENT: u64 = 1 << 0;
pub const BPV6_FLAG_ADMIN_RECORD: u64 = 1 << 1;
pub const BPV6_FLAG_NO_FRAGMENT: u64 = 1 << 2;
pub const BPV6_FLAG_CUSTODY_REQUESTED: u64 = 1 << 3;
pub const BPV6_FLAG_SINGLETON: u64 = 1 << 4;

/// Custody transfer is honored only for singleton, non-fragmentable
/// bundles that ask for it.
pub const BPV6_REQUIRED_CUSTODY_FLAGS: u64 =
    BPV6_FLAG_SINGLETON | BPV6_FLAG_NO_FRAGMENT | BPV6_FLAG_CUSTODY_REQUESTED;

const BPV6_PRIORITY_SHIFT: u64 = 7;
const BPV6_BLOCK_TYPE_PAYLOAD: u8 = 1;
const BPV6_BLOCK_FLAG_LAST_BLOCK: u64 = 1 << 3;

const BPV7_BLOCK_TYPE_PAYLOAD: u64 = 1;
const EID_SCHEME_DTN: u64 = 1;
const EID_SCHEME_IPN: u64 = 2;

/// Number of priority classes (bulk, normal, expedited).
pub const NUM_PRIORITIES: usize = 3;

/// The primary-block fields the storage engine acts on.
///
/// `creation` and `lifetime` stay in the protocol's native unit: seconds
/// for BPv6, milliseconds since the BPv7 epoch for BPv7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryFields {
    pub version: u8,
    pub flags: u64,
    pub dest: Eid,
    pub src: Eid,
    pub report_to: Eid,
    pub custodian: Eid,
    pub creation: u64,
    pub sequence: u64,
    pub lifetime: u64,
}

impl PrimaryFields {
    /// Catalog priority index, 0 = bulk .. 2 = expedited.
    ///
    /// BPv6 carries a two-bit priority field in bits 7-8 of the processing
    /// flags (the reserved value 3 is treated as expedited). BPv7 has no
    /// priority field recognized by this node and defaults to normal.
    pub fn priority_index(&self) -> usize {
        match self.version {
            BPV6_VERSION => (((self.flags >> BPV6_PRIORITY_SHIFT) & 3) as usize).min(2),
            _ => 1,
        }
    }

    /// Absolute expiration in seconds: creation + lifetime.
    pub fn abs_expiration(&self) -> u64 {
        match self.version {
            BPV6_VERSION => self.creation.saturating_add(self.lifetime),
            _ => self.creation.saturating_add(self.lifetime) / 1000,
        }
    }

    pub fn custody_requested(&self) -> bool {
        self.version == BPV6_VERSION
            && self.flags & BPV6_REQUIRED_CUSTODY_FLAGS == BPV6_REQUIRED_CUSTODY_FLAGS
    }

    /// (creation, sequence) pair identifying the transmission request.
    pub fn creation_timestamp(&self) -> (u64, u64) {
        (self.creation, self.sequence)
    }
}

/// Sets the BPv6 priority bits for a flags word.
pub fn bpv6_flags_with_priority(priority: u8) -> u64 {
    u64::from(priority & 3) << BPV6_PRIORITY_SHIFT
}

/// Parses the primary block at the front of a serialized bundle.
///
/// BPv6 bundles open with the version octet 0x06; anything else is decoded
/// as a BPv7 bundle (a CBOR array whose first block is the primary).
pub fn parse_primary(bundle: &[u8]) -> Result<PrimaryFields> {
    match bundle.first() {
        None => Err(Error::Corrupt("empty bundle")),
        Some(&BPV6_VERSION) => parse_primary_v6(bundle),
        Some(_) => parse_primary_v7(bundle),
    }
}

fn parse_primary_v6(bundle: &[u8]) -> Result<PrimaryFields> {
    let mut pos = 1; // version octet already matched
    let mut next = || -> Result<u64> {
        let (value, used) = sdnv::decode(&bundle[pos..])?;
        pos += used;
        Ok(value)
    };

    let flags = next()?;
    let _block_length = next()?;
    let dest = Eid::new(next()?, next()?);
    let src = Eid::new(next()?, next()?);
    let report_to = Eid::new(next()?, next()?);
    let custodian = Eid::new(next()?, next()?);
    let creation = next()?;
    let sequence = next()?;
    let lifetime = next()?;
    let dictionary_length = next()?;
    if dictionary_length != 0 {
        return Err(Error::Unsupported("bpv6 dictionary eids"));
    }

    Ok(PrimaryFields {
        version: BPV6_VERSION,
        flags,
        dest,
        src,
        report_to,
        custodian,
        creation,
        sequence,
        lifetime,
    })
}

fn parse_eid_v7(reader: &mut cbor::Reader<'_>) -> Result<Eid> {
    match reader.read_array()? {
        cbor::ArrayLen::Definite(2) => {}
        _ => return Err(Error::Corrupt("bpv7 eid must be a 2-array")),
    }
    match reader.read_uint()? {
        EID_SCHEME_IPN => {
            match reader.read_array()? {
                cbor::ArrayLen::Definite(2) => {}
                _ => return Err(Error::Corrupt("ipn ssp must be a 2-array")),
            }
            Ok(Eid::new(reader.read_uint()?, reader.read_uint()?))
        }
        EID_SCHEME_DTN => {
            // dtn:none and friends carry no numeric identity.
            reader.skip_item()?;
            Ok(Eid::new(0, 0))
        }
        _ => Err(Error::Unsupported("unknown eid scheme")),
    }
}

fn parse_primary_v7(bundle: &[u8]) -> Result<PrimaryFields> {
    let mut reader = cbor::Reader::new(bundle);
    reader.read_array()?; // outer bundle array
    match reader.read_array()? {
        cbor::ArrayLen::Definite(8..=11) => {}
        cbor::ArrayLen::Definite(_) => {
            return Err(Error::Corrupt("bpv7 primary block has wrong arity"))
        }
        cbor::ArrayLen::Indefinite => {
            return Err(Error::Corrupt("bpv7 primary block must be definite"))
        }
    }
    if reader.read_uint()? != u64::from(BPV7_VERSION) {
        return Err(Error::Corrupt("bpv7 version mismatch"));
    }
    let flags = reader.read_uint()?;
    let _crc_type = reader.read_uint()?;
    let dest = parse_eid_v7(&mut reader)?;
    let src = parse_eid_v7(&mut reader)?;
    let report_to = parse_eid_v7(&mut reader)?;
    match reader.read_array()? {
        cbor::ArrayLen::Definite(2) => {}
        _ => return Err(Error::Corrupt("bpv7 creation timestamp must be a 2-array")),
    }
    let creation = reader.read_uint()?;
    let sequence = reader.read_uint()?;
    let lifetime = reader.read_uint()?;

    Ok(PrimaryFields {
        version: BPV7_VERSION,
        flags,
        dest,
        src,
        report_to,
        custodian: Eid::new(0, 0),
        creation,
        sequence,
        lifetime,
    })
}

fn serialize_primary_v6(primary: &PrimaryFields, out: &mut Vec<u8>) {
    out.push(BPV6_VERSION);
    sdnv::encode(primary.flags, out);

    let mut body = Vec::with_capacity(64);
    sdnv::encode(primary.dest.node_id, &mut body);
    sdnv::encode(primary.dest.service_id, &mut body);
    sdnv::encode(primary.src.node_id, &mut body);
    sdnv::encode(primary.src.service_id, &mut body);
    sdnv::encode(primary.report_to.node_id, &mut body);
    sdnv::encode(primary.report_to.service_id, &mut body);
    sdnv::encode(primary.custodian.node_id, &mut body);
    sdnv::encode(primary.custodian.service_id, &mut body);
    sdnv::encode(primary.creation, &mut body);
    sdnv::encode(primary.sequence, &mut body);
    sdnv::encode(primary.lifetime, &mut body);
    sdnv::encode(0, &mut body); // dictionary length: compressed-header eids

    sdnv::encode(body.len() as u64, out);
    out.extend_from_slice(&body);
}

fn serialize_eid_v7(eid: Eid, out: &mut Vec<u8>) {
    cbor::write_array(2, out);
    cbor::write_uint(EID_SCHEME_IPN, out);
    cbor::write_array(2, out);
    cbor::write_uint(eid.node_id, out);
    cbor::write_uint(eid.service_id, out);
}

fn serialize_primary_v7(primary: &PrimaryFields, out: &mut Vec<u8>) {
    cbor::write_array(8, out); // no fragment fields, no crc
    cbor::write_uint(u64::from(BPV7_VERSION), out);
    cbor::write_uint(primary.flags, out);
    cbor::write_uint(0, out); // crc type: none
    serialize_eid_v7(primary.dest, out);
    serialize_eid_v7(primary.src, out);
    serialize_eid_v7(primary.report_to, out);
    cbor::write_array(2, out);
    cbor::write_uint(primary.creation, out);
    cbor::write_uint(primary.sequence, out);
    cbor::write_uint(primary.lifetime, out);
}

/// Serializes a whole single-payload bundle for the given primary.
///
/// Used for admin-record bundles the node itself originates, and by tests.
pub fn build_bundle(primary: &PrimaryFields, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 64);
    match primary.version {
        BPV6_VERSION => {
            serialize_primary_v6(primary, &mut out);
            out.push(BPV6_BLOCK_TYPE_PAYLOAD);
            sdnv::encode(BPV6_BLOCK_FLAG_LAST_BLOCK, &mut out);
            sdnv::encode(payload.len() as u64, &mut out);
            out.extend_from_slice(payload);
        }
        _ => {
            out.push(cbor::INDEFINITE_ARRAY_START);
            serialize_primary_v7(primary, &mut out);
            cbor::write_array(5, &mut out);
            cbor::write_uint(BPV7_BLOCK_TYPE_PAYLOAD, &mut out);
            cbor::write_uint(1, &mut out); // payload block number is always 1
            cbor::write_uint(0, &mut out); // block processing flags
            cbor::write_uint(0, &mut out); // crc type
            cbor::write_byte_string(payload, &mut out);
            out.push(cbor::BREAK);
        }
    }
    out
}
