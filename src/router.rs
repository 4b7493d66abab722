//! Storage router: the only component that talks to the message fabric.
//!
//! One thread runs [`StorageRouter::run`], which owns the engine, the
//! catalog-facing sessions, the custody bookkeeping, and the released-
//! destination set. Inbound frames (STORE, EGRESS_ACK, IRELSTART/STOP) are
//! dispatched between pump passes that stream eligible bundles to egress.
//!
//! The poll timeout adapts the way the release loop needs it to: 0 while a
//! bundle was just fed to egress (keep feeding), 1 ms while data exists
//! only for clogged links (we are waiting on acks), 250 ms when idle.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::primary::{parse_primary, PrimaryFields};
use crate::custody::{CustodyBookkeeping, CustodyManager, CustodySignalBundle};
use crate::eid::Eid;
use crate::engine::BundleStorageManager;
use crate::messages::{
    frame_type, EgressAckHdr, IreleaseHdr, StorageAckHdr, ToEgressHdr, ToStorageHdr,
    MSG_TYPE_EGRESS_ACK, MSG_TYPE_IRELSTART, MSG_TYPE_IRELSTOP, MSG_TYPE_SHUTDOWN,
    MSG_TYPE_STORE, TO_STORAGE_HDR_SIZE,
};
use crate::session::{ReadSession, WriteSession};
use crate::{Error, Result};

const DEFAULT_POLL: Duration = Duration::from_millis(250);
/// Shortest backoff while waiting on egress acks for clogged links.
const ACK_WAIT_POLL: Duration = Duration::from_millis(1);

/// The zero-copy IPC fabric, as seen from the router. Implementations
/// carry frames; the router never sees sockets.
pub trait MessageFabric: Send {
    /// Next inbound frame from ingress or egress, waiting at most `timeout`.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
    /// Ships a released bundle frame (ToEgressHdr ++ bundle) to egress.
    fn send_to_egress(&mut self, frame: Vec<u8>) -> Result<()>;
    /// Ships a storage ack frame to ingress.
    fn send_to_ingress(&mut self, frame: Vec<u8>) -> Result<()>;
}

/// Channel-backed fabric for tests and single-process nodes.
pub struct InprocFabric {
    inbound: mpsc::Receiver<Vec<u8>>,
    to_egress: mpsc::Sender<Vec<u8>>,
    to_ingress: mpsc::Sender<Vec<u8>>,
}

/// The far ends of an [`InprocFabric`], held by the ingress/egress side.
pub struct InprocPeer {
    pub to_storage: mpsc::Sender<Vec<u8>>,
    pub from_storage_to_egress: mpsc::Receiver<Vec<u8>>,
    pub from_storage_to_ingress: mpsc::Receiver<Vec<u8>>,
}

pub fn inproc_fabric() -> (InprocFabric, InprocPeer) {
    let (to_storage, inbound) = mpsc::channel();
    let (to_egress, from_storage_to_egress) = mpsc::channel();
    let (to_ingress, from_storage_to_ingress) = mpsc::channel();
    (
        InprocFabric {
            inbound,
            to_egress,
            to_ingress,
        },
        InprocPeer {
            to_storage,
            from_storage_to_egress,
            from_storage_to_ingress,
        },
    )
}

impl MessageFabric for InprocFabric {
    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self.inbound.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            // A vanished peer is quiet, not fatal; stop arrives separately.
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    fn send_to_egress(&mut self, frame: Vec<u8>) -> Result<()> {
        self.to_egress
            .send(frame)
            .map_err(|_| Error::Unsupported("egress side of fabric is gone"))
    }

    fn send_to_ingress(&mut self, frame: Vec<u8>) -> Result<()> {
        self.to_ingress
            .send(frame)
            .map_err(|_| Error::Unsupported("ingress side of fabric is gone"))
    }
}

pub struct StorageRouter<F: MessageFabric, C: CustodyManager> {
    engine: BundleStorageManager,
    fabric: F,
    custody: C,
    bookkeeping: CustodyBookkeeping,
    released: BTreeSet<Eid>,
    write_session: WriteSession,
    read_session: ReadSession,
    running: Arc<AtomicBool>,
    clock: quanta::Clock,
    acs_deadline: quanta::Instant,
    total_bundles_sent_to_egress: u64,
    total_bundles_erased_from_storage: u64,
}

impl<F: MessageFabric, C: CustodyManager> StorageRouter<F, C> {
    pub fn new(engine: BundleStorageManager, fabric: F, custody: C) -> Self {
        let cap = engine.config().max_outstanding_bundles_per_dest;
        let clock = quanta::Clock::new();
        let acs_deadline = clock.now() + engine.config().acs_send_period;
        Self {
            engine,
            fabric,
            custody,
            bookkeeping: CustodyBookkeeping::new(cap),
            released: BTreeSet::new(),
            write_session: WriteSession::new(),
            read_session: ReadSession::new(),
            running: Arc::new(AtomicBool::new(true)),
            clock,
            acs_deadline,
            total_bundles_sent_to_egress: 0,
            total_bundles_erased_from_storage: 0,
        }
    }

    /// Flag another thread may clear to stop the router.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn total_bundles_sent_to_egress(&self) -> u64 {
        self.total_bundles_sent_to_egress
    }

    pub fn total_bundles_erased_from_storage(&self) -> u64 {
        self.total_bundles_erased_from_storage
    }

    /// Hands the engine back once the loop has exited.
    pub fn into_engine(self) -> BundleStorageManager {
        self.engine
    }

    /// Receive/dispatch/pump loop. Fails if the disk workers cannot start;
    /// otherwise returns when the stop flag clears or a SHUTDOWN frame
    /// arrives. The engine keeps running until dropped.
    pub fn run(&mut self) -> Result<()> {
        log::info!("storage router starting");
        self.engine.start()?;
        let mut poll_timeout = DEFAULT_POLL;
        while self.running.load(Ordering::Acquire) {
            match self.fabric.recv(poll_timeout) {
                Ok(Some(frame)) => {
                    if !self.dispatch(&frame) {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => log::warn!("fabric receive error: {err}"),
            }

            self.maybe_emit_acs();
            poll_timeout = self.pump_release();
        }
        log::info!(
            "storage router stopping: sent {} erased {}",
            self.total_bundles_sent_to_egress,
            self.total_bundles_erased_from_storage
        );
        self.engine.stop();
        Ok(())
    }

    /// Returns false when the frame asks the loop to exit.
    fn dispatch(&mut self, frame: &[u8]) -> bool {
        match frame_type(frame) {
            Ok(MSG_TYPE_STORE) => self.handle_store(frame),
            Ok(MSG_TYPE_EGRESS_ACK) => self.handle_egress_ack(frame),
            Ok(MSG_TYPE_IRELSTART) | Ok(MSG_TYPE_IRELSTOP) => self.handle_release_toggle(frame),
            Ok(MSG_TYPE_SHUTDOWN) => return false,
            Ok(other) => log::warn!("dropping frame of unknown type {other}"),
            Err(err) => log::warn!("dropping malformed frame: {err}"),
        }
        true
    }

    fn handle_store(&mut self, frame: &[u8]) {
        let hdr = match ToStorageHdr::from_bytes(frame) {
            Ok(hdr) => hdr,
            Err(err) => {
                log::warn!("dropping malformed store frame: {err}");
                return;
            }
        };
        let bundle = &frame[TO_STORAGE_HDR_SIZE..];

        let primary = match parse_primary(bundle) {
            Ok(primary) => Some(primary),
            Err(err) => {
                log::warn!(
                    "rejecting malformed bundle {}: {err}",
                    hdr.ingress_unique_id
                );
                None
            }
        };
        let error = match &primary {
            None => 1,
            Some(primary) => match self.store_bundle(bundle, primary) {
                Ok(()) => 0,
                Err(Error::ResourceExhausted) => {
                    log::warn!("rejecting bundle {}: out of space", hdr.ingress_unique_id);
                    1
                }
                Err(err) => {
                    log::warn!("rejecting bundle {}: {err}", hdr.ingress_unique_id);
                    1
                }
            },
        };

        let ack = StorageAckHdr {
            final_dest_eid: primary.map_or(Eid::new(0, 0), |primary| primary.dest),
            ingress_unique_id: hdr.ingress_unique_id,
            error,
        };
        if let Err(err) = self.fabric.send_to_ingress(ack.to_bytes().to_vec()) {
            log::error!("could not ack ingress: {err}");
        }
    }

    /// Stores one inbound bundle, running custody transfer first when the
    /// bundle requests it.
    fn store_bundle(&mut self, bundle: &[u8], primary: &PrimaryFields) -> Result<()> {
        let custody_id = self
            .engine
            .next_custody_id_for_next_hop_cteb(primary.src.node_id);

        if primary.custody_requested() {
            match self.custody.process_custody(bundle, primary, custody_id) {
                Ok(Some(signal)) => self.store_generated_bundle(&signal),
                Ok(None) => {}
                Err(err) => log::error!("unable to process custody: {err}"),
            }
        }

        let result = self
            .engine
            .push_all_segments(&mut self.write_session, primary, custody_id, bundle);
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                self.engine.abort_write(&mut self.write_session);
                Err(err)
            }
        }
    }

    /// Stores a custody-signal or ACS bundle this node generated.
    fn store_generated_bundle(&mut self, signal: &CustodySignalBundle) {
        let custody_id = self
            .engine
            .next_custody_id_for_next_hop_cteb(signal.primary.src.node_id);
        let result = self.engine.push_all_segments(
            &mut self.write_session,
            &signal.primary,
            custody_id,
            &signal.serialized,
        );
        if let Err(err) = result {
            self.engine.abort_write(&mut self.write_session);
            log::error!("out of space for custody signal: {err}");
        }
    }

    fn handle_egress_ack(&mut self, frame: &[u8]) {
        let ack = match EgressAckHdr::from_bytes(frame) {
            Ok(ack) => ack,
            Err(err) => {
                log::warn!("dropping malformed egress ack: {err}");
                return;
            }
        };
        if !self.bookkeeping.remove(ack.final_dest_eid, ack.custody_id) {
            log::warn!(
                "egress ack for unknown custody id {} to {}",
                ack.custody_id,
                ack.final_dest_eid
            );
            return;
        }
        if ack.delete_now {
            // No custody was taken, so nothing else will confirm delivery.
            match self.engine.remove_by_custody_id(ack.custody_id) {
                Ok(()) => self.total_bundles_erased_from_storage += 1,
                Err(err) => log::error!(
                    "error freeing bundle custody_id={} from disk: {err}",
                    ack.custody_id
                ),
            }
        }
    }

    fn handle_release_toggle(&mut self, frame: &[u8]) {
        let hdr = match IreleaseHdr::from_bytes(frame) {
            Ok(hdr) => hdr,
            Err(err) => {
                log::warn!("dropping malformed release toggle: {err}");
                return;
            }
        };
        if hdr.start {
            self.released.insert(hdr.final_dest_eid);
            log::info!("{} will be released from storage", hdr.final_dest_eid);
        } else {
            self.released.remove(&hdr.final_dest_eid);
            log::info!("{} will stop being released from storage", hdr.final_dest_eid);
        }
    }

    fn maybe_emit_acs(&mut self) {
        let now = self.clock.now();
        let fill = self.custody.acs_fill_count();
        if now < self.acs_deadline && fill <= self.engine.config().acs_fill_threshold {
            return;
        }
        for signal in self.custody.drain_acs_bundles() {
            self.store_generated_bundle(&signal);
        }
        self.acs_deadline = now + self.engine.config().acs_send_period;
    }

    /// One release pass; the return value is the next poll timeout.
    fn pump_release(&mut self) -> Duration {
        if self.released.is_empty() {
            return DEFAULT_POLL;
        }
        let dests: Vec<Eid> = self.released.iter().copied().collect();
        let (ready, clogged) = self.bookkeeping.partition(&dests);
        if ready.is_empty() {
            // every released link is waiting on acks
            return ACK_WAIT_POLL;
        }
        if self.release_one(&ready) {
            // keep feeding egress without waiting
            return Duration::ZERO;
        }
        if self.peek_one(&clogged) {
            return ACK_WAIT_POLL;
        }
        DEFAULT_POLL
    }

    /// Streams at most one bundle to egress. True when progress was made.
    fn release_one(&mut self, dests: &[Eid]) -> bool {
        let bundle_size = self.engine.pop_top(&mut self.read_session, dests);
        if bundle_size == 0 {
            return false;
        }
        if bundle_size > self.engine.config().max_bundle_size_to_read {
            log::error!("bundle of {bundle_size} bytes is too large to release right now");
            let _ = self.engine.return_top(&mut self.read_session);
            return false;
        }
        let entry = self.read_session.entry().expect("pop_top returned a size");
        let hdr = ToEgressHdr {
            final_dest_eid: entry.dest,
            has_custody: entry.has_custody,
            is_cut_through_from_ingress: false,
            custody_id: entry.custody_id,
        };
        let dest = entry.dest;

        let mut frame = hdr.to_bytes().to_vec();
        frame.reserve(bundle_size as usize);
        let mut bundle = Vec::new();
        if let Err(err) = self.engine.read_all_segments(&mut self.read_session, &mut bundle) {
            // The stored image is inconsistent; drop the bundle rather than
            // hand corrupt bytes to egress.
            log::error!("dropping unreadable bundle custody_id={}: {err}", hdr.custody_id);
            if let Err(err) = self
                .engine
                .remove_read_bundle_from_disk(&mut self.read_session, true)
            {
                log::error!("could not remove unreadable bundle: {err}");
            }
            return true;
        }
        frame.extend_from_slice(&bundle);

        if let Err(err) = self.fabric.send_to_egress(frame) {
            log::warn!("egress send failed, returning bundle to catalog: {err}");
            let _ = self.engine.return_top(&mut self.read_session);
            return false;
        }

        match self.engine.mark_released(&mut self.read_session) {
            Ok(custody_id) => {
                if self.bookkeeping.insert(dest, custody_id) {
                    self.total_bundles_sent_to_egress += 1;
                } else {
                    log::error!("custody id {custody_id} already outstanding for {dest}");
                }
                true
            }
            Err(err) => {
                log::error!("could not track released bundle: {err}");
                false
            }
        }
    }

    /// True when some clogged destination still has data queued.
    fn peek_one(&mut self, dests: &[Eid]) -> bool {
        if dests.is_empty() {
            return false;
        }
        let bundle_size = self.engine.pop_top(&mut self.read_session, dests);
        if bundle_size == 0 {
            return false;
        }
        let _ = self.engine.return_top(&mut self.read_session);
        true
    }
}
