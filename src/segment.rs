//! Segment geometry and the 16-byte reserved header at the front of every
//! on-disk segment.
//!
//! A segment id encodes its disk as `id % num_disks` and its intra-disk
//! offset as `(id / num_disks) * SEGMENT_SIZE`. That striping is what gives
//! the disk workers their parallelism, so it is fixed here rather than left
//! to callers.

use crate::{Error, Result};

/// Fixed size of one disk segment in bytes.
pub const SEGMENT_SIZE: usize = 4096;

/// Reserved bytes at the front of every segment:
/// bytes 0..8 bundle size (LE u64), 8..12 next segment id (LE u32),
/// 12..16 padding.
pub const SEGMENT_RESERVED_SPACE: usize = 16;

/// Bundle payload bytes carried per segment.
pub const PAYLOAD_PER_SEGMENT: usize = SEGMENT_SIZE - SEGMENT_RESERVED_SPACE;

pub type SegmentId = u32;

/// Terminator / "none" sentinel for segment ids.
pub const SEGMENT_ID_NONE: SegmentId = u32::MAX;

/// `bundle_size` value on every non-head segment, and on a destroyed head.
pub const BUNDLE_SIZE_NON_HEAD: u64 = u64::MAX;

/// Number of segments needed to store `bundle_size` bytes.
pub fn segments_required(bundle_size: u64) -> u64 {
    bundle_size / PAYLOAD_PER_SEGMENT as u64
        + u64::from(bundle_size % PAYLOAD_PER_SEGMENT as u64 != 0)
}

/// Payload length of the tail segment of a `bundle_size`-byte bundle.
pub fn tail_payload_len(bundle_size: u64) -> usize {
    let rem = (bundle_size % PAYLOAD_PER_SEGMENT as u64) as usize;
    if rem == 0 {
        PAYLOAD_PER_SEGMENT
    } else {
        rem
    }
}

/// Parsed reserved header of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub bundle_size: u64,
    pub next_segment: SegmentId,
}

impl SegmentHeader {
    pub fn head(bundle_size: u64, next_segment: SegmentId) -> Self {
        Self {
            bundle_size,
            next_segment,
        }
    }

    pub fn non_head(next_segment: SegmentId) -> Self {
        Self {
            bundle_size: BUNDLE_SIZE_NON_HEAD,
            next_segment,
        }
    }

    pub fn is_tail(&self) -> bool {
        self.next_segment == SEGMENT_ID_NONE
    }

    pub fn write_to(&self, segment: &mut [u8]) -> Result<()> {
        if segment.len() < SEGMENT_RESERVED_SPACE {
            return Err(Error::Corrupt("segment buffer too small for header"));
        }
        segment[0..8].copy_from_slice(&self.bundle_size.to_le_bytes());
        segment[8..12].copy_from_slice(&self.next_segment.to_le_bytes());
        segment[12..16].fill(0);
        Ok(())
    }

    pub fn read_from(segment: &[u8]) -> Result<Self> {
        if segment.len() < SEGMENT_RESERVED_SPACE {
            return Err(Error::Corrupt("segment buffer too small for header"));
        }
        let bundle_size = u64::from_le_bytes(segment[0..8].try_into().expect("slice length"));
        let next_segment = u32::from_le_bytes(segment[8..12].try_into().expect("slice length"));
        Ok(Self {
            bundle_size,
            next_segment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut buf = [0u8; SEGMENT_SIZE];
        let header = SegmentHeader::head(123_456, 789);
        header.write_to(&mut buf).unwrap();
        assert_eq!(SegmentHeader::read_from(&buf).unwrap(), header);

        let tail = SegmentHeader::non_head(SEGMENT_ID_NONE);
        tail.write_to(&mut buf).unwrap();
        let parsed = SegmentHeader::read_from(&buf).unwrap();
        assert_eq!(parsed.bundle_size, BUNDLE_SIZE_NON_HEAD);
        assert!(parsed.is_tail());
    }

    #[test]
    fn header_layout_is_little_endian() {
        let mut buf = [0u8; SEGMENT_RESERVED_SPACE];
        SegmentHeader::head(0x0102, 0x0304).write_to(&mut buf).unwrap();
        assert_eq!(&buf[0..8], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[8..12], &[0x04, 0x03, 0, 0]);
        assert_eq!(&buf[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn segment_arithmetic() {
        let payload = PAYLOAD_PER_SEGMENT as u64;
        assert_eq!(segments_required(0), 0);
        assert_eq!(segments_required(1), 1);
        assert_eq!(segments_required(payload), 1);
        assert_eq!(segments_required(payload + 1), 2);
        assert_eq!(segments_required(1000 * payload), 1000);

        assert_eq!(tail_payload_len(payload), PAYLOAD_PER_SEGMENT);
        assert_eq!(tail_payload_len(payload + 1), 1);
        assert_eq!(tail_payload_len(payload - 2), PAYLOAD_PER_SEGMENT - 2);
    }
}
