//! Pre-sized segment files, one per storage disk.
//!
//! The store is pure block I/O: byte-exact reads and writes of whole
//! segments at 64-bit offsets. Which disk a segment lives on is fixed by
//! the striping rule (`id % num_disks`), so callers address segments by id
//! alone. A short read or write is fatal to the engine; the store does not
//! retry corrupt disks.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use crate::config::StorageConfig;
use crate::segment::{SegmentId, SEGMENT_SIZE};
use crate::{Error, Result};

#[derive(Debug)]
struct DiskFile {
    file: File,
    path: PathBuf,
}

#[derive(Debug)]
pub struct SegmentStore {
    disks: Vec<DiskFile>,
    segments_per_disk: u32,
    auto_delete_on_exit: bool,
}

impl SegmentStore {
    /// Opens the configured disk files.
    ///
    /// `reuse_existing` keeps the current contents for a restore scan;
    /// otherwise each file is truncated and pre-sized to exactly
    /// `segments_per_disk * SEGMENT_SIZE` bytes.
    pub fn open(config: &StorageConfig, reuse_existing: bool) -> Result<Self> {
        config.validate()?;
        let segments_per_disk = config.segments_per_disk();
        let disk_len = u64::from(segments_per_disk) * SEGMENT_SIZE as u64;

        let mut disks = Vec::with_capacity(config.disks.len());
        for disk in &config.disks {
            if let Some(parent) = disk.file_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = if reuse_existing {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&disk.file_path)?;
                let actual = file.metadata()?.len();
                if actual != disk_len {
                    log::error!(
                        "segment file {} has size {actual}, expected {disk_len}",
                        disk.file_path.display()
                    );
                    return Err(Error::RestoreInconsistency("segment file has wrong size"));
                }
                file
            } else {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&disk.file_path)?;
                preallocate(&file, disk_len)?;
                file
            };
            disks.push(DiskFile {
                file,
                path: disk.file_path.clone(),
            });
        }

        Ok(Self {
            disks,
            segments_per_disk,
            auto_delete_on_exit: config.auto_delete_files_on_exit,
        })
    }

    pub fn num_disks(&self) -> u32 {
        self.disks.len() as u32
    }

    pub fn segments_per_disk(&self) -> u32 {
        self.segments_per_disk
    }

    pub fn total_segments(&self) -> u32 {
        self.segments_per_disk * self.num_disks()
    }

    /// Disk index a segment id is striped onto.
    pub fn disk_of(&self, segment_id: SegmentId) -> u32 {
        segment_id % self.num_disks()
    }

    fn offset_of(&self, segment_id: SegmentId) -> u64 {
        u64::from(segment_id / self.num_disks()) * SEGMENT_SIZE as u64
    }

    pub fn read_segment(&self, segment_id: SegmentId, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), SEGMENT_SIZE);
        let disk = &self.disks[self.disk_of(segment_id) as usize];
        read_exact_at(&disk.file, buf, self.offset_of(segment_id)).map_err(|err| {
            log::error!(
                "short read of segment {segment_id} from {}: {err}",
                disk.path.display()
            );
            Error::DiskIo("segment read failed")
        })
    }

    pub fn write_segment(&self, segment_id: SegmentId, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), SEGMENT_SIZE);
        let disk = &self.disks[self.disk_of(segment_id) as usize];
        write_all_at(&disk.file, buf, self.offset_of(segment_id)).map_err(|err| {
            log::error!(
                "short write of segment {segment_id} to {}: {err}",
                disk.path.display()
            );
            Error::DiskIo("segment write failed")
        })
    }
}

impl Drop for SegmentStore {
    fn drop(&mut self) {
        if !self.auto_delete_on_exit {
            return;
        }
        for disk in &self.disks {
            if let Err(err) = std::fs::remove_file(&disk.path) {
                log::warn!("could not delete {}: {err}", disk.path.display());
            } else {
                log::info!("deleted {}", disk.path.display());
            }
        }
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, len: u64) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t) };
    if rc != 0 {
        // Filesystems without fallocate support still honor set_len.
        file.set_len(len)?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn preallocate(file: &File, len: u64) -> Result<()> {
    file.set_len(len)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskConfig;
    use tempfile::TempDir;

    fn config(dir: &TempDir, disks: u32, segments: u32, auto_delete: bool) -> StorageConfig {
        let disks = (0..disks)
            .map(|i| DiskConfig {
                file_path: dir.path().join(format!("map{i}.bin")),
                segments_per_disk: segments,
            })
            .collect();
        let mut config = StorageConfig::new(disks);
        config.auto_delete_files_on_exit = auto_delete;
        config
    }

    #[test]
    fn creates_files_at_exact_size() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, 2, 8, false);
        let store = SegmentStore::open(&config, false).unwrap();
        drop(store);
        for disk in &config.disks {
            let len = std::fs::metadata(&disk.file_path).unwrap().len();
            assert_eq!(len, 8 * SEGMENT_SIZE as u64);
        }
    }

    #[test]
    fn segment_round_trip_across_disks() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::open(&config(&dir, 3, 4, true), false).unwrap();

        let mut expected = Vec::new();
        for id in 0..store.total_segments() {
            let mut buf = vec![0u8; SEGMENT_SIZE];
            buf.iter_mut()
                .enumerate()
                .for_each(|(i, b)| *b = (id as usize + i) as u8);
            store.write_segment(id, &buf).unwrap();
            expected.push(buf);
        }
        for id in 0..store.total_segments() {
            let mut buf = vec![0u8; SEGMENT_SIZE];
            store.read_segment(id, &mut buf).unwrap();
            assert_eq!(buf, expected[id as usize]);
        }
    }

    #[test]
    fn auto_delete_removes_files() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, 2, 4, true);
        let store = SegmentStore::open(&config, false).unwrap();
        drop(store);
        for disk in &config.disks {
            assert!(!disk.file_path.exists());
        }
    }

    #[test]
    fn reuse_rejects_wrong_size() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, 1, 4, false);
        std::fs::write(&config.disks[0].file_path, b"stub").unwrap();
        assert!(SegmentStore::open(&config, true).is_err());
    }
}
