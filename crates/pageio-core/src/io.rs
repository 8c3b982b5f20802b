//! I/O path abstractions.
//!
//! Four seams separate the computation layer from physical I/O:
//!
//! - `IoInterface` - per-thread I/O path a computation layer talks to.
//!   Submits requests (`access`) and drives completions (`wait4complete`).
//! - `IoFactory` - opened dataset; hands out one `IoInterface` per thread.
//! - `IoEngine` - what a disk thread drives: queue requests, kick them to
//!   the kernel, collect completions.
//! - `CompletionSink` - where a disk thread hands finished requests back.
//!
//! # Implementors
//!
//! - `RemoteIo` / `RemoteIoFactory` (pageio-runtime): real path, requests
//!   travel to disk threads through batching senders.
//! - `InMemIo` / `InMemIoFactory` (pageio-runtime): the whole dataset is
//!   resident; every access completes before `access` returns.
//! - `SyncEngine`, `UringEngine` (pageio-runtime): `preadv`/`pwritev` and
//!   io_uring engines.

use std::path::Path;

use crate::compute::ComputeRef;
use crate::error::Result;
use crate::queue::FifoQueue;
use crate::request::Request;

/// Dataset identifier assigned when a file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FileId(pub u32);

/// Outcome of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoStatus {
    #[default]
    Pending,
    /// Bytes transferred; short at end of file
    Done(usize),
    /// Low-priority request skipped while the normal queue was busy
    Dropped,
    /// errno from the engine
    Failed(i32),
}

impl IoStatus {
    #[inline]
    pub fn is_done(self) -> bool {
        matches!(self, IoStatus::Done(_))
    }

    #[inline]
    pub fn is_pending(self) -> bool {
        self == IoStatus::Pending
    }
}

/// What a computation learns about the path it issues requests on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoContext {
    pub file_id: FileId,
    pub node_id: usize,
}

/// Receives requests a disk thread has finished with.
///
/// Called on the disk thread. Must not block.
pub trait CompletionSink: Send + Sync {
    fn complete(&self, reqs: Vec<Request>);
}

/// Per-thread I/O path.
pub trait IoInterface: Send {
    fn context(&self) -> IoContext;

    /// Submit requests. Each request is moved out of `reqs`, leaving an
    /// empty request behind. `status[i]`, when given, reports what is
    /// known about `reqs[i]` on return. Fragment memory of a raw request
    /// must stay valid until the request comes back from `take_completed`.
    fn access(&mut self, reqs: &mut [Request], status: Option<&mut [IoStatus]>);

    /// Process completions until at least `min` requests have completed
    /// or nothing is outstanding; returns the number completed.
    fn wait4complete(&mut self, min: usize) -> usize;

    fn num_pending_ios(&self) -> usize;

    /// Push out anything batched on this path.
    fn flush_requests(&mut self) {}

    /// Move completed requests that carry no computation into `out`.
    fn take_completed(&mut self, out: &mut Vec<Request>) -> usize;
}

/// An opened dataset.
pub trait IoFactory: Send + Sync {
    fn file_id(&self) -> FileId;

    fn file_name(&self) -> &str;

    fn file_size(&self) -> u64;

    /// I/O path for a thread running on `node_id`.
    fn create_io(&self, node_id: usize) -> Result<Box<dyn IoInterface>>;
}

/// Physical I/O driven by one disk thread.
///
/// `submit()` and `flush()` must not wait for I/O to finish on engines
/// that can avoid it; `poll_completions()` never blocks.
pub trait IoEngine: Send {
    fn name(&self) -> &'static str;

    fn open_file(&mut self, id: FileId, path: &Path) -> Result<()>;

    fn has_file(&self, id: FileId) -> bool;

    /// Queue one request; hands it back when the engine is full.
    fn submit(&mut self, req: Request) -> std::result::Result<(), Request>;

    /// Kick queued requests; returns how many were started.
    fn flush(&mut self) -> Result<usize>;

    /// Move up to `max` finished requests, status set, onto `out`.
    fn poll_completions(&mut self, out: &mut Vec<Request>, max: usize) -> usize;

    /// Queued but not yet flushed
    fn pending(&self) -> usize;

    /// Flushed but not yet completed
    fn inflight(&self) -> usize;

    fn capacity(&self) -> usize;

    /// Finish in-flight requests and release resources.
    fn shutdown(&mut self);
}

/// Issue every request `compute` currently wants on `io`.
///
/// Holds one count on `compute` for the duration, so it is reclaimed no
/// earlier than the final release here. Returns the number of requests
/// issued.
pub fn submit_compute(io: &mut dyn IoInterface, compute: &ComputeRef, batch: usize) -> usize {
    let ctx = io.context();
    let mut buf = FifoQueue::new(ctx.node_id, batch.max(1), false);
    let mut reqs = Vec::with_capacity(batch.max(1));
    let mut issued = 0;

    compute.inc_ref();
    while compute.has_requests() {
        let n = compute.fetch_into(&ctx, &mut buf, batch.max(1));
        if n == 0 {
            break;
        }
        reqs.clear();
        reqs.extend(buf.drain());
        io.access(&mut reqs, None);
        issued += n;
    }
    compute.release();
    issued
}
