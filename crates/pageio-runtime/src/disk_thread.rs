//! Disk access threads
//!
//! One OS thread per partition. Each owns an `IoEngine` and two input
//! queues, normal and low priority. A round:
//!
//! ```text
//!   fetch up to io_batch normal requests, attach newly opened files
//!   submit them to the engine
//!   normal queue still busy?  drop up to low_prio_batch low-priority requests
//!   otherwise                 submit up to low_prio_batch of them
//!   flush the engine when a batch is full, the queue drained, or
//!     another thread called flush_requests()
//!   poll completions, hand them to each request's sink
//! ```
//!
//! Dropping low-priority work while the normal queue is saturated is
//! deliberate; the requester gets the request back as `IoStatus::Dropped`.
//!
//! An idle thread blocks on its normal queue: `busy_poll` while the
//! engine has I/O in flight, `park_timeout` otherwise.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use pageio_core::error::{IoError, Result};
use pageio_core::{
    kdebug, kerror, kinfo, CompletionSink, FileId, IoEngine, IoStatus, MsgQueue, Request, SpinLock,
};

use crate::config::IoConfig;
use crate::engine::create_engine;

/// Counter snapshot of one disk thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskStats {
    /// Normal-priority requests submitted to the engine
    pub accesses: u64,
    /// Low-priority requests submitted to the engine
    pub low_prio_accesses: u64,
    /// Low-priority requests dropped
    pub ignored_low_prio: u64,
    pub completed: u64,
    pub io_errors: u64,
    pub flushes: u64,
}

impl std::ops::AddAssign for DiskStats {
    fn add_assign(&mut self, o: Self) {
        self.accesses += o.accesses;
        self.low_prio_accesses += o.low_prio_accesses;
        self.ignored_low_prio += o.ignored_low_prio;
        self.completed += o.completed;
        self.io_errors += o.io_errors;
        self.flushes += o.flushes;
    }
}

#[derive(Default)]
struct StatCounters {
    accesses: AtomicU64,
    low_prio_accesses: AtomicU64,
    ignored_low_prio: AtomicU64,
    completed: AtomicU64,
    io_errors: AtomicU64,
    flushes: AtomicU64,
}

impl StatCounters {
    #[inline]
    fn bump(c: &AtomicU64, n: u64) {
        c.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DiskStats {
        DiskStats {
            accesses: self.accesses.load(Ordering::Relaxed),
            low_prio_accesses: self.low_prio_accesses.load(Ordering::Relaxed),
            ignored_low_prio: self.ignored_low_prio.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

/// State shared between a disk thread and its handles
struct DiskShared {
    index: usize,
    node_id: usize,
    queue: Arc<MsgQueue<Request>>,
    low_prio_queue: Arc<MsgQueue<Request>>,
    pending_opens: SpinLock<Vec<(FileId, PathBuf)>>,
    files: SpinLock<HashMap<FileId, String>>,
    flush_counter: AtomicU64,
    shutdown: AtomicBool,
    thread: OnceLock<ThreadId>,
    stats: StatCounters,
}

impl DiskShared {
    fn new(index: usize, node_id: usize, config: &IoConfig) -> Self {
        DiskShared {
            index,
            node_id,
            queue: Arc::new(MsgQueue::new(
                format!("disk-{}", index),
                node_id,
                config.queue_capacity,
                false,
            )),
            low_prio_queue: Arc::new(MsgQueue::new(
                format!("disk-{}-low", index),
                node_id,
                config.low_prio_queue_capacity,
                false,
            )),
            pending_opens: SpinLock::new(Vec::new()),
            files: SpinLock::new(HashMap::new()),
            flush_counter: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            thread: OnceLock::new(),
            stats: StatCounters::default(),
        }
    }
}

/// Cloneable handle for talking to a disk thread.
#[derive(Clone)]
pub struct DiskThreadHandle {
    shared: Arc<DiskShared>,
}

impl DiskThreadHandle {
    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn node_id(&self) -> usize {
        self.shared.node_id
    }

    /// Normal-priority input queue
    pub fn queue(&self) -> &Arc<MsgQueue<Request>> {
        &self.shared.queue
    }

    pub fn low_prio_queue(&self) -> &Arc<MsgQueue<Request>> {
        &self.shared.low_prio_queue
    }

    /// Attach a file while the thread runs.
    ///
    /// Takes effect before the thread looks at any request queued after
    /// this call returns.
    pub fn open_file(&self, id: FileId, path: &Path) {
        self.shared.pending_opens.lock().push((id, path.to_path_buf()));
        self.shared.queue.wakeup();
    }

    /// Make the thread flush whatever its engine has buffered.
    ///
    /// # Panics
    ///
    /// When called from the disk thread itself.
    pub fn flush_requests(&self) {
        if let Some(owner) = self.shared.thread.get() {
            assert_ne!(
                *owner,
                thread::current().id(),
                "flush_requests called from disk thread {}",
                self.shared.index
            );
        }
        self.shared.flush_counter.fetch_add(1, Ordering::AcqRel);
        self.shared.queue.wakeup();
    }

    /// Name of an attached file
    pub fn file_name(&self, id: FileId) -> Option<String> {
        self.shared.files.lock().get(&id).cloned()
    }

    pub fn stats(&self) -> DiskStats {
        self.shared.stats.snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for DiskThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskThreadHandle")
            .field("index", &self.shared.index)
            .field("node_id", &self.shared.node_id)
            .finish()
    }
}

/// Owner of a running disk thread; stops and joins it on drop.
pub struct DiskAccessThread {
    handle: DiskThreadHandle,
    thread: Option<JoinHandle<()>>,
}

impl DiskAccessThread {
    /// Create the engine and start the thread.
    pub fn spawn(index: usize, node_id: usize, config: &IoConfig) -> Result<Self> {
        let engine = create_engine(config.engine, config.engine_depth)?;
        let shared = Arc::new(DiskShared::new(index, node_id, config));
        let mut disk_loop = DiskLoop::new(Arc::clone(&shared), engine, config);

        let thread = thread::Builder::new()
            .name(format!("pio-disk-{}", index))
            .spawn(move || disk_loop.run())
            .map_err(|_| IoError::ThreadSpawn)?;

        Ok(DiskAccessThread {
            handle: DiskThreadHandle { shared },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> DiskThreadHandle {
        self.handle.clone()
    }

    /// Ask the thread to finish queued and in-flight work, then exit.
    pub fn stop(&self) {
        self.handle.shared.shutdown.store(true, Ordering::Release);
        self.handle.shared.queue.wakeup();
    }

    /// Stop and wait for the thread.
    pub fn join(&mut self) {
        self.stop();
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                kerror!("disk thread {} panicked", self.handle.shared.index);
            }
        }
    }
}

impl Drop for DiskAccessThread {
    fn drop(&mut self) {
        self.join();
    }
}

/// Body of a disk thread.
struct DiskLoop {
    shared: Arc<DiskShared>,
    engine: Box<dyn IoEngine>,
    io_batch: usize,
    low_prio_batch: usize,
    park_timeout: Duration,
    busy_poll: Duration,
    fetched: Vec<Request>,
    done: Vec<Request>,
    seen_flush: u64,
}

impl DiskLoop {
    fn new(shared: Arc<DiskShared>, engine: Box<dyn IoEngine>, config: &IoConfig) -> Self {
        DiskLoop {
            shared,
            engine,
            io_batch: config.io_batch.max(1),
            low_prio_batch: config.low_prio_batch,
            park_timeout: config.park_timeout,
            busy_poll: config.busy_poll,
            fetched: Vec::with_capacity(config.io_batch.max(1)),
            done: Vec::new(),
            seen_flush: 0,
        }
    }

    fn run(&mut self) {
        let _ = self.shared.thread.set(thread::current().id());
        kinfo!(
            "disk thread {} started on node {} ({} engine)",
            self.shared.index,
            self.shared.node_id,
            self.engine.name()
        );

        loop {
            let worked = self.round();
            if self.shared.shutdown.load(Ordering::Acquire) && self.is_drained() {
                break;
            }
            if !worked {
                let timeout = if self.engine.inflight() > 0 {
                    self.busy_poll
                } else {
                    self.park_timeout
                };
                self.shared.queue.wait(Some(timeout));
            }
        }

        self.engine.shutdown();
        self.engine.poll_completions(&mut self.done, usize::MAX);
        self.deliver();
        let stats = self.shared.stats.snapshot();
        kinfo!(
            "disk thread {} stopped: {} accesses, {} low-prio, {} ignored, {} errors",
            self.shared.index,
            stats.accesses,
            stats.low_prio_accesses,
            stats.ignored_low_prio,
            stats.io_errors
        );
    }

    fn is_drained(&self) -> bool {
        self.shared.queue.is_empty()
            && self.shared.low_prio_queue.is_empty()
            && self.engine.pending() == 0
            && self.engine.inflight() == 0
    }

    /// One pass over both queues and the engine; false if nothing moved.
    fn round(&mut self) -> bool {
        let mut worked = false;

        self.fetched.clear();
        let n = self.shared.queue.fetch(&mut self.fetched, self.io_batch);
        // Opens published before these requests are visible now
        self.apply_opens();
        if n > 0 {
            worked = true;
            StatCounters::bump(&self.shared.stats.accesses, n as u64);
            let mut reqs = std::mem::take(&mut self.fetched);
            for req in reqs.drain(..) {
                self.submit(req);
            }
            self.fetched = reqs;
        }

        if self.low_prio_batch > 0 {
            let mut low = Vec::new();
            let got = self.shared.low_prio_queue.fetch(&mut low, self.low_prio_batch);
            if got > 0 {
                worked = true;
                if self.shared.queue.is_empty() {
                    StatCounters::bump(&self.shared.stats.low_prio_accesses, got as u64);
                    for req in low {
                        self.submit(req);
                    }
                } else {
                    StatCounters::bump(&self.shared.stats.ignored_low_prio, got as u64);
                    for mut req in low {
                        req.set_status(IoStatus::Dropped);
                        self.done.push(req);
                    }
                }
            }
        }

        let flush_seq = self.shared.flush_counter.load(Ordering::Acquire);
        let asked = flush_seq != self.seen_flush;
        self.seen_flush = flush_seq;
        let pending = self.engine.pending();
        if pending > 0 && (asked || pending >= self.io_batch || self.shared.queue.is_empty()) {
            self.flush_engine();
        }

        if self.engine.poll_completions(&mut self.done, usize::MAX) > 0 {
            worked = true;
        }
        if !self.done.is_empty() {
            self.deliver();
        }
        worked
    }

    fn apply_opens(&mut self) {
        let opens = std::mem::take(&mut *self.shared.pending_opens.lock());
        for (id, path) in opens {
            match self.engine.open_file(id, &path) {
                Ok(()) => {
                    let name = path.display().to_string();
                    kdebug!("disk thread {}: attached {} as #{}", self.shared.index, name, id.0);
                    self.shared.files.lock().insert(id, name);
                }
                Err(e) => kerror!(
                    "disk thread {}: cannot open {}: {}",
                    self.shared.index,
                    path.display(),
                    e
                ),
            }
        }
    }

    /// Hand `req` to the engine, making room if it is full.
    fn submit(&mut self, mut req: Request) {
        req.inc_ref();
        loop {
            match self.engine.submit(req) {
                Ok(()) => return,
                Err(back) => {
                    req = back;
                    self.flush_engine();
                    if self.engine.poll_completions(&mut self.done, usize::MAX) == 0 {
                        thread::yield_now();
                    }
                    self.deliver();
                }
            }
        }
    }

    fn flush_engine(&mut self) {
        match self.engine.flush() {
            Ok(_) => StatCounters::bump(&self.shared.stats.flushes, 1),
            Err(e) => kerror!("disk thread {}: engine flush failed: {}", self.shared.index, e),
        }
    }

    /// Return finished requests to their sinks, one call per sink.
    fn deliver(&mut self) {
        let mut groups: Vec<(Arc<dyn CompletionSink>, Vec<Request>)> = Vec::new();
        for mut req in self.done.drain(..) {
            if req.ref_count() > 0 {
                req.dec_ref();
            }
            match req.status() {
                IoStatus::Failed(errno) => {
                    StatCounters::bump(&self.shared.stats.io_errors, 1);
                    kdebug!(
                        "disk thread {}: request at {} failed: errno {}",
                        self.shared.index,
                        req.offset(),
                        errno
                    );
                }
                IoStatus::Dropped => {}
                _ => StatCounters::bump(&self.shared.stats.completed, 1),
            }

            let Some(sink) = req.take_sink() else {
                kerror!(
                    "disk thread {}: request at {} has no completion sink",
                    self.shared.index,
                    req.offset()
                );
                if let Some(c) = req.take_compute() {
                    c.release();
                }
                continue;
            };
            let key = Arc::as_ptr(&sink) as *const ();
            match groups.iter_mut().find(|(s, _)| Arc::as_ptr(s) as *const () == key) {
                Some((_, reqs)) => reqs.push(req),
                None => groups.push((sink, vec![req])),
            }
        }
        for (sink, reqs) in groups {
            sink.complete(reqs);
        }
    }
}
