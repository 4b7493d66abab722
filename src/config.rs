use std::path::PathBuf;
use std::time::Duration;

use crate::segment::SEGMENT_SIZE;
use crate::{Error, Result};

/// One storage disk: a backing file and the number of segments it holds.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    pub file_path: PathBuf,
    pub segments_per_disk: u32,
}

/// Which disk-worker backend drives the segment files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageImplementation {
    /// One blocking I/O thread per disk.
    #[default]
    ThreadPerDisk,
    /// A single reactor thread serving every disk's ring in turn.
    SingleThreadedReactor,
}

/// Engine construction parameters. The caller builds this directly;
/// loading it from a file is someone else's job.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub disks: Vec<DiskConfig>,
    pub implementation: StorageImplementation,
    pub try_to_restore_from_disk: bool,
    pub auto_delete_files_on_exit: bool,
    /// Pre-sized file budget across all disks; 0 derives it from the disks.
    pub total_storage_capacity_bytes: u64,
    /// Read-ahead depth of one read session, in segments.
    pub read_cache_segments_per_session: usize,
    /// Released-but-unacked bundles allowed per destination.
    pub max_outstanding_bundles_per_dest: usize,
    /// Bundles larger than this stay in the catalog instead of releasing.
    pub max_bundle_size_to_read: u64,
    /// Aggregate custody signal emission cadence.
    pub acs_send_period: Duration,
    /// Fill count past which ACS emission is forced ahead of the cadence.
    pub acs_fill_threshold: usize,
}

impl StorageConfig {
    pub fn new(disks: Vec<DiskConfig>) -> Self {
        Self {
            disks,
            implementation: StorageImplementation::default(),
            try_to_restore_from_disk: false,
            auto_delete_files_on_exit: false,
            total_storage_capacity_bytes: 0,
            read_cache_segments_per_session: 32,
            max_outstanding_bundles_per_dest: 5,
            max_bundle_size_to_read: u64::MAX,
            acs_send_period: Duration::from_secs(1),
            acs_fill_threshold: 100,
        }
    }

    pub fn num_disks(&self) -> usize {
        self.disks.len()
    }

    /// Segments per disk; identical across disks by construction.
    pub fn segments_per_disk(&self) -> u32 {
        self.disks.first().map_or(0, |d| d.segments_per_disk)
    }

    /// Total addressable segment ids, `num_disks * segments_per_disk`.
    pub fn total_segments(&self) -> u32 {
        self.segments_per_disk() * self.disks.len() as u32
    }

    pub fn validate(&self) -> Result<()> {
        if self.disks.is_empty() {
            return Err(Error::InvalidConfig("at least one storage disk required"));
        }
        let segments = self.segments_per_disk();
        if segments == 0 {
            return Err(Error::InvalidConfig("segments_per_disk must be nonzero"));
        }
        // Striping by `id % num_disks` needs every disk the same size.
        if self.disks.iter().any(|d| d.segments_per_disk != segments) {
            return Err(Error::InvalidConfig(
                "all disks must share the same segments_per_disk",
            ));
        }
        if self.read_cache_segments_per_session == 0 {
            return Err(Error::InvalidConfig(
                "read_cache_segments_per_session must be nonzero",
            ));
        }
        if self.total_storage_capacity_bytes != 0 {
            let derived =
                self.total_segments() as u64 * SEGMENT_SIZE as u64;
            if self.total_storage_capacity_bytes != derived {
                return Err(Error::InvalidConfig(
                    "total_storage_capacity_bytes disagrees with disk layout",
                ));
            }
        }
        Ok(())
    }
}
