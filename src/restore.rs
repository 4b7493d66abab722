//! Journal-free restart recovery.
//!
//! The disk image is the only source of truth: every segment's reserved
//! header says whether it heads a bundle and where the chain continues.
//! Scanning candidate head ids in increasing order reproduces write order,
//! because the allocator hands out ids lowest-first.
//!
//! The scan is strict. A chain that cycles, ends early, runs past its
//! bundle size, or collides with an already-claimed segment aborts the
//! whole restore; the engine refuses to start on a disk image it cannot
//! fully explain.

use std::fs::File;

use memmap2::Mmap;

use crate::allocator::SegmentAllocator;
use crate::catalog::{BundleCatalog, CatalogEntry};
use crate::codec::primary::parse_primary;
use crate::config::StorageConfig;
use crate::custody::CustodyIdAllocator;
use crate::segment::{
    segments_required, SegmentHeader, SegmentId, BUNDLE_SIZE_NON_HEAD, SEGMENT_ID_NONE,
    SEGMENT_RESERVED_SPACE, SEGMENT_SIZE,
};
use crate::{Error, Result};

/// What a completed scan recovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub bundles: u64,
    pub bytes: u64,
    pub segments: u64,
}

pub struct RestoreScanner<'a> {
    config: &'a StorageConfig,
    allocator: &'a SegmentAllocator,
}

impl<'a> RestoreScanner<'a> {
    pub fn new(config: &'a StorageConfig, allocator: &'a SegmentAllocator) -> Self {
        Self { config, allocator }
    }

    /// Rebuilds the allocator and catalog from the segment files.
    ///
    /// Restored bundles enter their FIFOs in head-id order and receive
    /// fresh custody ids keyed by their source node; hop-local custody ids
    /// do not survive a restart.
    pub fn scan(
        &self,
        catalog: &mut BundleCatalog,
        custody_ids: &mut CustodyIdAllocator,
    ) -> Result<RestoreStats> {
        let num_disks = self.config.num_disks() as u32;
        let segments_per_disk = self.config.segments_per_disk();
        let disk_len = u64::from(segments_per_disk) * SEGMENT_SIZE as u64;
        let total_segments = self.config.total_segments();

        let mut maps = Vec::with_capacity(num_disks as usize);
        for disk in &self.config.disks {
            let file = File::open(&disk.file_path).map_err(|err| {
                log::error!("cannot open {} for restore: {err}", disk.file_path.display());
                Error::RestoreInconsistency("segment file missing")
            })?;
            if file.metadata()?.len() != disk_len {
                log::error!(
                    "segment file {} has unexpected size",
                    disk.file_path.display()
                );
                return Err(Error::RestoreInconsistency("segment file has wrong size"));
            }
            // The engine has not started; nothing writes while we scan.
            let map = unsafe { Mmap::map(&file)? };
            maps.push(map);
        }
        let segment_bytes = |segment_id: SegmentId| -> &[u8] {
            let disk = (segment_id % num_disks) as usize;
            let offset = (segment_id / num_disks) as usize * SEGMENT_SIZE;
            &maps[disk][offset..offset + SEGMENT_SIZE]
        };

        let mut stats = RestoreStats::default();
        for head in 0..total_segments {
            if !self.allocator.is_free(head)? {
                continue; // claimed mid-chain by an earlier bundle
            }
            let head_header = SegmentHeader::read_from(segment_bytes(head))?;
            if head_header.bundle_size == BUNDLE_SIZE_NON_HEAD {
                continue; // destroyed head, or a stray non-head segment
            }
            if head_header.bundle_size == 0 {
                continue; // never written
            }

            let bundle_size = head_header.bundle_size;
            let primary = parse_primary(&segment_bytes(head)[SEGMENT_RESERVED_SPACE..])
                .map_err(|err| {
                    log::error!("head segment {head} carries no parsable primary block: {err}");
                    Error::RestoreInconsistency("unparsable primary block on head segment")
                })?;

            let total_required = segments_required(bundle_size);
            let mut chain: Vec<SegmentId> = Vec::with_capacity(total_required as usize);
            let mut segment = head;
            for logical in 0..total_required {
                if segment >= total_segments {
                    log::error!("chain of head {head} references invalid segment {segment}");
                    return Err(Error::RestoreInconsistency("chain id out of range"));
                }
                if !self.allocator.is_free(segment)? {
                    log::error!("chain of head {head} reclaims segment {segment}");
                    return Err(Error::RestoreInconsistency("segment claimed twice"));
                }
                let header = SegmentHeader::read_from(segment_bytes(segment))?;
                if logical > 0 && header.bundle_size != BUNDLE_SIZE_NON_HEAD {
                    log::error!("segment {segment} inside chain of head {head} looks like a head");
                    return Err(Error::RestoreInconsistency("head marker inside a chain"));
                }
                self.allocator.alloc_specific(segment)?;
                chain.push(segment);

                let is_tail = logical + 1 == total_required;
                match (is_tail, header.next_segment) {
                    (true, SEGMENT_ID_NONE) => {}
                    (true, _) => {
                        log::error!("chain of head {head} continues past its bundle size");
                        return Err(Error::RestoreInconsistency(
                            "chain longer than bundle size requires",
                        ));
                    }
                    (false, SEGMENT_ID_NONE) => {
                        log::error!("chain of head {head} ends before its bundle size");
                        return Err(Error::RestoreInconsistency(
                            "chain shorter than bundle size requires",
                        ));
                    }
                    (false, next) => segment = next,
                }
            }

            let custody_id =
                custody_ids.next_custody_id_for_next_hop_cteb(primary.src.node_id);
            log::debug!(
                "restored bundle head={head} dest={} segs={} custody_id={custody_id}",
                primary.dest,
                chain.len()
            );
            catalog.insert(CatalogEntry {
                bundle_size,
                chain,
                dest: primary.dest,
                src: primary.src,
                priority_index: primary.priority_index(),
                abs_expiration: primary.abs_expiration(),
                custody_id,
                has_custody: primary.custody_requested(),
                creation_timestamp: primary.creation_timestamp(),
            });
            stats.bundles += 1;
            stats.bytes += bundle_size;
            stats.segments += total_required;
        }

        Ok(stats)
    }
}
