//! Per-disk I/O pipelines.
//!
//! Each disk owns a bounded SPSC ring of operation descriptors and a pool
//! of segment-sized write buffers. The single producer (the engine, driven
//! by the router thread) reserves a ring slot, deposits a descriptor, and
//! commits; a worker drains descriptors strictly in submission order, so
//! within one disk the tail of a bundle is durable once its descriptor has
//! been executed.
//!
//! Reads complete into shared [`ReadCacheSlot`]s owned by the reading
//! session: the worker fills a slot only while its ready flag is false, and
//! the session's read cursor only advances after observing ready=true, so
//! the two sides never race on the buffer.
//!
//! Two backends drive the rings: one blocking thread per disk, or a single
//! reactor thread serving every ring in turn. All waiting is on condvars
//! with a bounded timeout so shutdown cannot deadlock. Failures never
//! panic across threads: a fatal I/O error or a poisoned lock halts the
//! workers, and producers get `Err` back instead of a hung ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::StorageImplementation;
use crate::ring::{IndexRing, RING_SLOTS};
use crate::segment::{SegmentId, SEGMENT_SIZE};
use crate::store::SegmentStore;
use crate::{Error, Result};

/// Bounded wait used everywhere a thread parks waiting for ring progress.
pub const IO_WAIT: Duration = Duration::from_millis(10);

/// Completion target of one read: a segment-sized buffer plus a ready flag.
#[derive(Debug)]
pub struct ReadCacheSlot {
    ready: AtomicBool,
    buf: Mutex<Box<[u8]>>,
}

impl ReadCacheSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(false),
            buf: Mutex::new(vec![0u8; SEGMENT_SIZE].into_boxed_slice()),
        })
    }

    /// Clears the ready flag before the slot is handed to a worker.
    pub fn arm(&self) {
        self.ready.store(false, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Reads the completed segment. Call only after `is_ready()`.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let buf = self
            .buf
            .lock()
            .map_err(|_| Error::Corrupt("read slot lock poisoned"))?;
        Ok(f(&buf))
    }

    fn fill_from(&self, store: &SegmentStore, segment_id: SegmentId) -> Result<()> {
        let mut buf = self
            .buf
            .lock()
            .map_err(|_| Error::Corrupt("read slot lock poisoned"))?;
        store.read_segment(segment_id, &mut buf)?;
        drop(buf);
        self.ready.store(true, Ordering::Release);
        Ok(())
    }
}

/// One descriptor in a disk ring.
#[derive(Debug)]
pub enum SegmentOp {
    Write {
        segment_id: SegmentId,
        buf: Box<[u8]>,
    },
    Read {
        segment_id: SegmentId,
        slot: Arc<ReadCacheSlot>,
    },
}

#[derive(Debug, Default)]
struct Signal {
    mutex: Mutex<()>,
    cv: Condvar,
}

impl Signal {
    fn wait(&self) -> Result<()> {
        let guard = self
            .mutex
            .lock()
            .map_err(|_| Error::Corrupt("io signal lock poisoned"))?;
        let _ = self
            .cv
            .wait_timeout(guard, IO_WAIT)
            .map_err(|_| Error::Corrupt("io signal lock poisoned"))?;
        Ok(())
    }

    fn notify(&self) {
        self.cv.notify_all();
    }
}

#[derive(Debug)]
struct DiskQueue {
    ring: IndexRing,
    slots: Vec<Mutex<Option<SegmentOp>>>,
    /// Wakes this disk's worker when work arrives.
    work: Signal,
    /// Recycled write buffers; stands in for a shared block-data arena.
    pool: Mutex<Vec<Box<[u8]>>>,
}

impl DiskQueue {
    fn new() -> Self {
        Self {
            ring: IndexRing::new(RING_SLOTS),
            slots: (0..RING_SLOTS).map(|_| Mutex::new(None)).collect(),
            work: Signal::default(),
            pool: Mutex::new(Vec::new()),
        }
    }
}

#[derive(Debug)]
struct IoShared {
    store: Arc<SegmentStore>,
    queues: Vec<DiskQueue>,
    /// Wakes producers after any descriptor completes.
    progress: Signal,
    /// Wakes the reactor backend, which serves every ring.
    reactor_work: Signal,
    running: AtomicBool,
    fatal: AtomicBool,
}

impl IoShared {
    /// Marks the engine failed and wakes any blocked producer so it
    /// observes the stop instead of waiting on a ring nothing drains.
    fn halt(&self) {
        self.fatal.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
        self.progress.notify();
    }

    /// Executes the next descriptor of one disk's ring, if any. `Err`
    /// means the worker itself can no longer make progress.
    fn serve_one(&self, disk: usize) -> Result<bool> {
        let queue = &self.queues[disk];
        let Some(index) = queue.ring.read_slot() else {
            return Ok(false);
        };
        let op = queue.slots[index as usize]
            .lock()
            .map_err(|_| Error::Corrupt("ring slot lock poisoned"))?
            .take()
            .ok_or(Error::Corrupt("committed ring slot was empty"))?;

        let result = match op {
            SegmentOp::Write { segment_id, buf } => {
                let result = self.store.write_segment(segment_id, &buf);
                queue
                    .pool
                    .lock()
                    .map_err(|_| Error::Corrupt("buffer pool lock poisoned"))?
                    .push(buf);
                result
            }
            SegmentOp::Read { segment_id, slot } => slot.fill_from(&self.store, segment_id),
        };
        if let Err(err) = result {
            // Short segment I/O is fatal; stop accepting work.
            log::error!("disk {disk} worker stopping: {err}");
            self.halt();
        }

        queue.ring.commit_read();
        self.progress.notify();
        Ok(true)
    }

    fn worker_loop(&self, disk: usize) {
        loop {
            match self.serve_one(disk) {
                Ok(true) => continue,
                Ok(false) => {
                    // Drain once more after stop so pending head
                    // destructions commit.
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(err) = self.queues[disk].work.wait() {
                        log::error!("disk {disk} worker stopping: {err}");
                        self.halt();
                        break;
                    }
                }
                Err(err) => {
                    log::error!("disk {disk} worker stopping: {err}");
                    self.halt();
                    break;
                }
            }
        }
    }

    fn reactor_loop(&self) {
        let num_disks = self.queues.len();
        loop {
            let mut served = false;
            for disk in 0..num_disks {
                loop {
                    match self.serve_one(disk) {
                        Ok(true) => served = true,
                        Ok(false) => break,
                        Err(err) => {
                            log::error!("io reactor stopping: {err}");
                            self.halt();
                            return;
                        }
                    }
                }
            }
            if served {
                continue;
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            if let Err(err) = self.reactor_work.wait() {
                log::error!("io reactor stopping: {err}");
                self.halt();
                return;
            }
        }
    }
}

/// Handle over all disk workers. Owned by the storage engine.
#[derive(Debug)]
pub struct DiskIo {
    shared: Arc<IoShared>,
    threads: Vec<JoinHandle<()>>,
}

impl DiskIo {
    pub fn start(store: Arc<SegmentStore>, implementation: StorageImplementation) -> Result<Self> {
        let num_disks = store.num_disks() as usize;
        let shared = Arc::new(IoShared {
            store,
            queues: (0..num_disks).map(|_| DiskQueue::new()).collect(),
            progress: Signal::default(),
            reactor_work: Signal::default(),
            running: AtomicBool::new(true),
            fatal: AtomicBool::new(false),
        });

        let mut io = Self {
            shared,
            threads: Vec::with_capacity(num_disks),
        };
        if let Err(err) = io.spawn_workers(implementation, num_disks) {
            // Joins whatever did start before reporting the failure.
            io.stop();
            return Err(err);
        }
        Ok(io)
    }

    fn spawn_workers(
        &mut self,
        implementation: StorageImplementation,
        num_disks: usize,
    ) -> Result<()> {
        match implementation {
            StorageImplementation::ThreadPerDisk => {
                for disk in 0..num_disks {
                    let shared = Arc::clone(&self.shared);
                    let handle = std::thread::Builder::new()
                        .name(format!("bundlestore-disk{disk}"))
                        .spawn(move || shared.worker_loop(disk))
                        .map_err(Error::Io)?;
                    self.threads.push(handle);
                }
            }
            StorageImplementation::SingleThreadedReactor => {
                let shared = Arc::clone(&self.shared);
                let handle = std::thread::Builder::new()
                    .name("bundlestore-io".to_string())
                    .spawn(move || shared.reactor_loop())
                    .map_err(Error::Io)?;
                self.threads.push(handle);
            }
        }
        Ok(())
    }

    /// True after a worker hit a fatal disk error or halted.
    pub fn is_fatal(&self) -> bool {
        self.shared.fatal.load(Ordering::Acquire)
    }

    /// Takes a recycled (or fresh) write buffer for the disk that will
    /// receive `segment_id`.
    pub fn take_buffer(&self, segment_id: SegmentId) -> Result<Box<[u8]>> {
        let disk = self.shared.store.disk_of(segment_id) as usize;
        let mut pool = self.shared.queues[disk]
            .pool
            .lock()
            .map_err(|_| Error::Corrupt("buffer pool lock poisoned"))?;
        Ok(pool
            .pop()
            .unwrap_or_else(|| vec![0u8; SEGMENT_SIZE].into_boxed_slice()))
    }

    /// Enqueues one descriptor on its disk's ring, waiting (bounded) while
    /// the ring is full. Fails only once the engine is stopping.
    pub fn submit(&self, op: SegmentOp) -> Result<()> {
        let segment_id = match &op {
            SegmentOp::Write { segment_id, .. } | SegmentOp::Read { segment_id, .. } => *segment_id,
        };
        let disk = self.shared.store.disk_of(segment_id) as usize;
        let queue = &self.shared.queues[disk];

        let mut op = Some(op);
        loop {
            if !self.shared.running.load(Ordering::Acquire) {
                return Err(Error::Unsupported("storage engine is stopped"));
            }
            if let Some(index) = queue.ring.write_slot() {
                *queue.slots[index as usize]
                    .lock()
                    .map_err(|_| Error::Corrupt("ring slot lock poisoned"))? = op.take();
                queue.ring.commit_write();
                queue.work.notify();
                self.shared.reactor_work.notify();
                return Ok(());
            }
            self.shared.progress.wait()?;
        }
    }

    /// Parks the caller briefly until a worker reports progress. Used while
    /// waiting for a read-cache slot to become ready.
    pub fn wait_for_progress(&self) -> Result<()> {
        self.shared.progress.wait()
    }

    /// Stops the workers, draining every ring first.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        for queue in &self.shared.queues {
            queue.work.notify();
        }
        self.shared.reactor_work.notify();
        self.shared.progress.notify();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for DiskIo {
    fn drop(&mut self) {
        self.stop();
    }
}
