//! The bundle storage manager: the write path (segment allocation, striped
//! pipelined writes, catalog commit), the release path (PopTop, read-ahead
//! streaming, removal), and restart recovery.
//!
//! All catalog-touching methods are called from one thread (the router);
//! only the allocator and the disk rings are shared with the workers.
//!
//! Lifecycle of a stored bundle: *created* by [`push`] (chain reserved, not
//! yet indexed), *committed* when [`push_segment`] enqueues the tail (the
//! catalog entry appears), *selected* by [`pop_top`] (entry moves into the
//! read session), *released* by streaming to egress, then either *returned*
//! ([`return_top`]), parked for acknowledgement ([`mark_released`]), or
//! dissolved back into free segments ([`remove_read_bundle_from_disk`] /
//! [`remove_by_custody_id`]).
//!
//! [`push`]: BundleStorageManager::push
//! [`push_segment`]: BundleStorageManager::push_segment
//! [`pop_top`]: BundleStorageManager::pop_top
//! [`return_top`]: BundleStorageManager::return_top
//! [`mark_released`]: BundleStorageManager::mark_released
//! [`remove_read_bundle_from_disk`]: BundleStorageManager::remove_read_bundle_from_disk
//! [`remove_by_custody_id`]: BundleStorageManager::remove_by_custody_id

use std::sync::Arc;

use crate::allocator::SegmentAllocator;
use crate::catalog::{BundleCatalog, CatalogEntry};
use crate::codec::primary::PrimaryFields;
use crate::config::StorageConfig;
use crate::custody::CustodyIdAllocator;
use crate::diskio::{DiskIo, SegmentOp};
use crate::eid::Eid;
use crate::restore::{RestoreScanner, RestoreStats};
use crate::segment::{
    segments_required, tail_payload_len, SegmentHeader, SegmentId, BUNDLE_SIZE_NON_HEAD,
    PAYLOAD_PER_SEGMENT, SEGMENT_ID_NONE, SEGMENT_RESERVED_SPACE,
};
use crate::session::{ReadSession, WriteSession};
use crate::store::SegmentStore;
use crate::{Error, Result};

pub struct BundleStorageManager {
    config: StorageConfig,
    store: Arc<SegmentStore>,
    allocator: Arc<SegmentAllocator>,
    io: Option<DiskIo>,
    catalog: BundleCatalog,
    custody_ids: CustodyIdAllocator,
    restore_stats: RestoreStats,
    restored_from_disk: bool,
}

impl BundleStorageManager {
    /// Opens (or creates) the segment files and, when configured, rebuilds
    /// the allocator and catalog from the disk image. Workers are not
    /// running until [`start`](Self::start).
    pub fn new(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let restore = config.try_to_restore_from_disk;
        let store = Arc::new(SegmentStore::open(&config, restore)?);
        let allocator = Arc::new(SegmentAllocator::new(store.total_segments()));

        let mut catalog = BundleCatalog::new();
        let mut custody_ids = CustodyIdAllocator::new();
        let mut restore_stats = RestoreStats::default();
        if restore {
            restore_stats = RestoreScanner::new(&config, &allocator).scan(
                &mut catalog,
                &mut custody_ids,
            )?;
            log::info!(
                "restored {} bundles / {} bytes / {} segments from disk",
                restore_stats.bundles,
                restore_stats.bytes,
                restore_stats.segments
            );
        }

        Ok(Self {
            config,
            store,
            allocator,
            io: None,
            catalog,
            custody_ids,
            restore_stats,
            restored_from_disk: restore,
        })
    }

    /// Spawns the disk workers. Idempotent.
    pub fn start(&mut self) -> Result<()> {
        if self.io.is_none() {
            self.io = Some(DiskIo::start(
                Arc::clone(&self.store),
                self.config.implementation,
            )?);
        }
        Ok(())
    }

    /// Stops the workers, draining pending descriptors first.
    pub fn stop(&mut self) {
        if let Some(mut io) = self.io.take() {
            io.stop();
        }
    }

    fn io(&self) -> Result<&DiskIo> {
        match &self.io {
            Some(io) if !io.is_fatal() => Ok(io),
            Some(_) => Err(Error::DiskIo("a disk worker failed")),
            None => Err(Error::Unsupported("storage engine not started")),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn allocator(&self) -> &SegmentAllocator {
        &self.allocator
    }

    pub fn restore_stats(&self) -> RestoreStats {
        self.restore_stats
    }

    pub fn successfully_restored_from_disk(&self) -> bool {
        self.restored_from_disk
    }

    pub fn next_custody_id_for_next_hop_cteb(&mut self, node_id: u64) -> u64 {
        self.custody_ids.next_custody_id_for_next_hop_cteb(node_id)
    }

    /// Reserves the segment chain for a new bundle and primes the write
    /// session. Returns the chain length, or `Ok(0)` when the allocator
    /// cannot satisfy it (the caller rejects the bundle; nothing is
    /// reserved).
    pub fn push(
        &mut self,
        session: &mut WriteSession,
        primary: &PrimaryFields,
        custody_id: u64,
        bundle_size: u64,
    ) -> Result<u64> {
        debug_assert!(session.entry.is_none(), "write session already in use");
        if bundle_size == 0 {
            return Ok(0);
        }
        let total_segments = segments_required(bundle_size);
        let Some(chain) = self.allocator.alloc_chain(total_segments)? else {
            log::warn!(
                "allocator exhausted: {total_segments} segments for {} to {}",
                bundle_size,
                primary.dest
            );
            return Ok(0);
        };

        session.entry = Some(CatalogEntry {
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
        session.next_logical_segment = 0;
        Ok(total_segments)
    }

    /// Writes one logical segment of the bundle primed by [`push`]. The
    /// payload must be exactly `PAYLOAD_PER_SEGMENT` bytes except for the
    /// tail. Enqueueing the tail commits the bundle to the catalog.
    ///
    /// [`push`]: Self::push
    pub fn push_segment(&mut self, session: &mut WriteSession, payload: &[u8]) -> Result<()> {
        let (segment_id, bundle_size, next_segment, is_tail, expected_len) = {
            let entry = session
                .entry
                .as_ref()
                .ok_or(Error::Unsupported("push_segment without a pushed bundle"))?;
            let index = session.next_logical_segment;
            if index >= entry.chain.len() {
                return Err(Error::Unsupported("bundle already fully pushed"));
            }
            let is_tail = index + 1 == entry.chain.len();
            (
                entry.chain[index],
                if index == 0 {
                    entry.bundle_size
                } else {
                    BUNDLE_SIZE_NON_HEAD
                },
                if is_tail {
                    SEGMENT_ID_NONE
                } else {
                    entry.chain[index + 1]
                },
                is_tail,
                if is_tail {
                    tail_payload_len(entry.bundle_size)
                } else {
                    PAYLOAD_PER_SEGMENT
                },
            )
        };
        if payload.len() != expected_len {
            return Err(Error::Unsupported("segment payload length mismatch"));
        }

        let io = self.io()?;
        let mut buf = io.take_buffer(segment_id)?;
        SegmentHeader {
            bundle_size,
            next_segment,
        }
        .write_to(&mut buf)?;
        let data_end = SEGMENT_RESERVED_SPACE + payload.len();
        buf[SEGMENT_RESERVED_SPACE..data_end].copy_from_slice(payload);
        buf[data_end..].fill(0);
        io.submit(SegmentOp::Write {
            segment_id,
            buf,
        })?;
        session.next_logical_segment += 1;

        if is_tail {
            let entry = session.entry.take().expect("entry checked above");
            log::debug!(
                "committed bundle custody_id={} dest={} segs={} head={}",
                entry.custody_id,
                entry.dest,
                entry.chain.len(),
                entry.chain[0]
            );
            self.catalog.insert(entry);
        }
        Ok(())
    }

    /// Abandons a write session whose bundle will not be completed,
    /// releasing its chain. If the head was already submitted it is
    /// destroyed on disk first so a later restore cannot resurrect the
    /// partial bundle.
    pub fn abort_write(&mut self, session: &mut WriteSession) {
        let Some(entry) = session.entry.take() else {
            return;
        };
        if session.next_logical_segment > 0 {
            if let Err(err) = self.destroy_and_free(entry) {
                log::error!("could not abort partial write: {err}");
            }
        } else {
            match self.allocator.free_chain(&entry.chain) {
                Ok(true) => {}
                Ok(false) => log::error!("could not release chain of aborted write"),
                Err(err) => log::error!("could not release chain of aborted write: {err}"),
            }
        }
        session.next_logical_segment = 0;
    }

    /// Pushes a whole serialized bundle in one call; returns the byte count
    /// written. `Err(ResourceExhausted)` reserves nothing.
    pub fn push_all_segments(
        &mut self,
        session: &mut WriteSession,
        primary: &PrimaryFields,
        custody_id: u64,
        bundle: &[u8],
    ) -> Result<u64> {
        let total_segments = self.push(session, primary, custody_id, bundle.len() as u64)?;
        if total_segments == 0 {
            return Err(Error::ResourceExhausted);
        }
        for chunk in bundle.chunks(PAYLOAD_PER_SEGMENT) {
            self.push_segment(session, chunk)?;
        }
        Ok(bundle.len() as u64)
    }

    /// Selects the next bundle to release among `dests` and moves it into
    /// the session. Returns the bundle size, or 0 when nothing is eligible.
    pub fn pop_top(&mut self, session: &mut ReadSession, dests: &[Eid]) -> u64 {
        debug_assert!(session.entry.is_none(), "read session already holds a bundle");
        session.reset_cursors(self.config.read_cache_segments_per_session);
        match self.catalog.pop_top(dests) {
            Some(entry) => {
                let bundle_size = entry.bundle_size;
                session.entry = Some(entry);
                bundle_size
            }
            None => 0,
        }
    }

    /// Puts the held bundle back into the catalog unread.
    pub fn return_top(&mut self, session: &mut ReadSession) -> Result<()> {
        let entry = session
            .entry
            .take()
            .ok_or(Error::Unsupported("no bundle held by read session"))?;
        self.catalog.return_top(entry);
        Ok(())
    }

    /// Copies the next logical segment's payload into `out`, keeping the
    /// read-ahead pipeline full behind it. Returns the payload length.
    pub fn top_segment(&mut self, session: &mut ReadSession, out: &mut [u8]) -> Result<usize> {
        let (bundle_size, chain_len, custody_id, dest, head) = {
            let entry = session
                .entry
                .as_ref()
                .ok_or(Error::Unsupported("no bundle held by read session"))?;
            (
                entry.bundle_size,
                entry.chain.len(),
                entry.custody_id,
                entry.dest,
                entry.chain[0],
            )
        };
        if session.next_logical_segment >= chain_len {
            return Err(Error::Unsupported("bundle already fully read"));
        }

        // Keep up to the cache depth of reads in flight ahead of the cursor.
        let depth = session.read_cache.len();
        while session.next_logical_segment_to_cache - session.next_logical_segment < depth
            && session.next_logical_segment_to_cache < chain_len
        {
            let segment_id =
                session.entry.as_ref().expect("entry checked above").chain
                    [session.next_logical_segment_to_cache];
            let slot = Arc::clone(&session.read_cache[session.cache_write_index]);
            slot.arm();
            self.io()?.submit(SegmentOp::Read {
                segment_id,
                slot,
            })?;
            session.cache_write_index = (session.cache_write_index + 1) % depth;
            session.next_logical_segment_to_cache += 1;
        }

        let slot = Arc::clone(&session.read_cache[session.cache_read_index]);
        while !slot.is_ready() {
            self.io()?.wait_for_progress()?;
        }

        let index = session.next_logical_segment;
        let is_tail = index + 1 == chain_len;
        let expected_next = if is_tail {
            SEGMENT_ID_NONE
        } else {
            session.entry.as_ref().expect("entry checked above").chain[index + 1]
        };
        let expected_size = if index == 0 {
            bundle_size
        } else {
            BUNDLE_SIZE_NON_HEAD
        };
        let payload_len = if is_tail {
            tail_payload_len(bundle_size)
        } else {
            PAYLOAD_PER_SEGMENT
        };

        let verified = slot.with_data(|data| -> Result<()> {
            let header = SegmentHeader::read_from(data)?;
            if header.bundle_size != expected_size {
                return Err(Error::Corrupt("segment bundle-size field mismatch"));
            }
            if header.next_segment != expected_next {
                return Err(Error::Corrupt("segment chain link mismatch"));
            }
            out[..payload_len].copy_from_slice(
                &data[SEGMENT_RESERVED_SPACE..SEGMENT_RESERVED_SPACE + payload_len],
            );
            Ok(())
        })?;
        if let Err(err) = verified {
            log::error!(
                "read error on segment {index} of bundle custody_id={custody_id} \
                 dest={dest} head={head}: {err}"
            );
            return Err(err);
        }

        session.next_logical_segment += 1;
        session.cache_read_index = (session.cache_read_index + 1) % depth;
        Ok(payload_len)
    }

    /// Streams the whole held bundle into `out` via the read-ahead cache.
    pub fn read_all_segments(&mut self, session: &mut ReadSession, out: &mut Vec<u8>) -> Result<()> {
        let bundle_size = session.bundle_size() as usize;
        let chain_len = session.chain_len();
        out.clear();
        out.resize(bundle_size, 0);
        let mut offset = 0;
        for _ in 0..chain_len {
            let read = self.top_segment(session, &mut out[offset..])?;
            offset += read;
        }
        if offset != bundle_size {
            return Err(Error::Corrupt("segment payloads disagree with bundle size"));
        }
        Ok(())
    }

    /// Destroys the held bundle on disk and frees its chain. Refused while
    /// the chain is not fully consumed unless `force_remove` is set (the
    /// corruption path forces it).
    pub fn remove_read_bundle_from_disk(
        &mut self,
        session: &mut ReadSession,
        force_remove: bool,
    ) -> Result<()> {
        if !force_remove && !session.fully_consumed() {
            return Err(Error::Unsupported("bundle not fully read before removal"));
        }
        let entry = session
            .entry
            .take()
            .ok_or(Error::Unsupported("no bundle held by read session"))?;
        self.destroy_and_free(entry)
    }

    /// Parks the held bundle until egress acknowledges it; returns the
    /// custody id the acknowledgement will carry.
    pub fn mark_released(&mut self, session: &mut ReadSession) -> Result<u64> {
        let entry = session
            .entry
            .take()
            .ok_or(Error::Unsupported("no bundle held by read session"))?;
        let custody_id = entry.custody_id;
        if !self.catalog.mark_released(entry) {
            return Err(Error::Corrupt("duplicate custody id in awaiting-ack map"));
        }
        Ok(custody_id)
    }

    /// Deletes a released bundle identified by the custody id an egress
    /// acknowledgement carried.
    pub fn remove_by_custody_id(&mut self, custody_id: u64) -> Result<()> {
        let entry = self
            .catalog
            .take_awaiting_ack(custody_id)
            .ok_or(Error::Unsupported("unknown custody id"))?;
        self.destroy_and_free(entry)
    }

    /// Deletes a released bundle named by an inbound custody-signal admin
    /// record: (source eid, creation time, sequence).
    pub fn remove_by_custody_signal(
        &mut self,
        src: Eid,
        creation: u64,
        sequence: u64,
    ) -> Result<()> {
        let custody_id = self
            .catalog
            .custody_id_for_uuid(&(src, creation, sequence))
            .ok_or(Error::Unsupported("custody signal names no stored bundle"))?;
        self.remove_by_custody_id(custody_id)
    }

    /// Enqueues the head-destruction write, then frees the chain. A crash
    /// between the two re-surfaces at most this one bundle on restart.
    fn destroy_and_free(&mut self, entry: CatalogEntry) -> Result<()> {
        let head: SegmentId = entry.chain[0];
        let io = self.io()?;
        let mut buf = io.take_buffer(head)?;
        buf.fill(0);
        SegmentHeader {
            bundle_size: BUNDLE_SIZE_NON_HEAD,
            next_segment: SEGMENT_ID_NONE,
        }
        .write_to(&mut buf)?;
        io.submit(SegmentOp::Write {
            segment_id: head,
            buf,
        })?;

        if !self.allocator.free_chain(&entry.chain)? {
            log::error!(
                "double free of chain for custody_id={} dest={} head={head}",
                entry.custody_id,
                entry.dest
            );
            return Err(Error::Corrupt("segment chain already free"));
        }
        log::debug!(
            "erased bundle custody_id={} dest={} segs={} head={head}",
            entry.custody_id,
            entry.dest,
            entry.chain.len()
        );
        Ok(())
    }
}

impl Drop for BundleStorageManager {
    fn drop(&mut self) {
        self.stop();
    }
}
