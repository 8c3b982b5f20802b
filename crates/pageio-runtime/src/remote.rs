//! Real I/O path
//!
//! `RemoteIo` is one thread's view of an opened file. Requests leave
//! through batching senders into the disk threads' queues and come back
//! through the path's own completion queue, which the disk threads fill
//! and only the owning thread drains. Computations are therefore always
//! resumed on the thread that issued them, inside `wait4complete`.
//!
//! # Reference counts
//!
//! `access` takes one count on a request's computation; the count moves
//! with the request to the disk thread and back. After the computation
//! runs, the count either moves onto the ready queue (more requests to
//! issue) or is released.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use pageio_core::error::Result;
use pageio_core::{
    kdebug, kerror, kwarn, BufferByteArray, CompletionSink, ComputeRef, FifoQueue, FileId,
    IoContext, IoFactory, IoInterface, IoStatus, MsgQueue, MsgSender, Priority, Request,
    TrySendError,
};

use crate::config::IoConfig;
use crate::disk_thread::DiskThreadHandle;
use crate::files::{FileLayout, FilePartition};

/// Spin, then yield, then sleep.
fn backoff(spins: &mut u32) {
    if *spins < 64 {
        std::hint::spin_loop();
    } else if *spins < 128 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_micros(50));
    }
    *spins = spins.saturating_add(1);
}

/// First `n` bytes of a request that came with its own buffers.
fn gather(req: &Request, n: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(n);
    for frag in req.fragments() {
        let take = frag.len().min(n - out.len());
        // Safety: the submitter keeps fragments valid until completion
        out.extend_from_slice(unsafe { &frag.as_slice()[..take] });
        if out.len() == n {
            break;
        }
    }
    out
}

/// Completion queue a disk thread writes into.
struct CompletionQueue {
    queue: MsgQueue<Request>,
}

impl CompletionSink for CompletionQueue {
    fn complete(&self, reqs: Vec<Request>) {
        for req in reqs {
            if let Err(mut lost) = self.queue.push_expand(req) {
                kerror!("completion queue {} refused a request", self.queue.name());
                if let Some(c) = lost.take_compute() {
                    c.release();
                }
            }
        }
    }
}

/// An opened file; creates one `RemoteIo` per thread.
pub struct RemoteIoFactory {
    partition: FilePartition,
    name: String,
    disks: Vec<DiskThreadHandle>,
    config: IoConfig,
}

impl RemoteIoFactory {
    pub fn new(partition: FilePartition, disks: Vec<DiskThreadHandle>, config: IoConfig) -> Self {
        RemoteIoFactory {
            name: partition.path().display().to_string(),
            partition,
            disks,
            config,
        }
    }

    pub fn partition(&self) -> &FilePartition {
        &self.partition
    }

    pub fn create_remote_io(&self, node_id: usize) -> RemoteIo {
        RemoteIo::new(&self.partition, &self.disks, &self.config, node_id)
    }
}

impl IoFactory for RemoteIoFactory {
    fn file_id(&self) -> FileId {
        self.partition.id()
    }

    fn file_name(&self) -> &str {
        &self.name
    }

    fn file_size(&self) -> u64 {
        self.partition.size()
    }

    fn create_io(&self, node_id: usize) -> Result<Box<dyn IoInterface>> {
        Ok(Box::new(self.create_remote_io(node_id)))
    }
}

/// Per-thread I/O path to the disk threads.
pub struct RemoteIo {
    ctx: IoContext,
    partition: FilePartition,
    disks: Vec<DiskThreadHandle>,
    /// One per disk thread for striped files, a single one otherwise
    senders: Vec<MsgSender<Request>>,
    sink: Arc<CompletionQueue>,
    ready: FifoQueue<ComputeRef>,
    completed_raw: Vec<Request>,
    received: Vec<Request>,
    pending: usize,
    io_batch: usize,
    wait_timeout: Duration,
    next_low: usize,
}

impl RemoteIo {
    fn new(partition: &FilePartition, disks: &[DiskThreadHandle], config: &IoConfig, node_id: usize) -> Self {
        let senders = match partition.layout() {
            FileLayout::Striped { .. } => disks
                .iter()
                .map(|d| MsgSender::new(config.sender_buf_size, vec![Arc::clone(d.queue())], false))
                .collect(),
            FileLayout::Shared => vec![MsgSender::new(
                config.sender_buf_size,
                disks.iter().map(|d| Arc::clone(d.queue())).collect(),
                false,
            )],
        };
        let sink = Arc::new(CompletionQueue {
            queue: MsgQueue::new(
                format!("completions-{}-{}", partition.id().0, node_id),
                node_id,
                config.completion_queue_capacity,
                true,
            ),
        });
        RemoteIo {
            ctx: IoContext { file_id: partition.id(), node_id },
            partition: partition.clone(),
            disks: disks.to_vec(),
            senders,
            sink,
            ready: FifoQueue::new(node_id, config.io_batch.max(1), true),
            completed_raw: Vec::new(),
            received: Vec::new(),
            pending: 0,
            io_batch: config.io_batch.max(1),
            wait_timeout: config.park_timeout,
            next_low: node_id,
        }
    }

    /// Requests still held by this path's senders
    pub fn num_buffered(&self) -> usize {
        self.buffered()
    }

    /// Computations waiting to issue more requests
    pub fn num_ready(&self) -> usize {
        self.ready.len()
    }

    fn prepare(&self, req: &mut Request) {
        if let Some(c) = req.compute() {
            c.inc_ref();
            req.attach_scratch();
        }
        req.set_sink(Arc::clone(&self.sink) as Arc<dyn CompletionSink>);
    }

    fn send(&mut self, mut req: Request) {
        let idx = match self.partition.map(req.offset()) {
            Some(t) if self.senders.len() > 1 => t,
            _ => 0,
        };
        let mut spins = 0;
        loop {
            match self.senders[idx].send(req) {
                Ok(()) => break,
                Err(TrySendError(back)) => {
                    req = back;
                    backoff(&mut spins);
                }
            }
        }
        self.pending += 1;
    }

    /// Queue `req` straight onto a disk thread's low-priority queue.
    fn send_low_prio(&mut self, mut req: Request) {
        let idx = match self.partition.map(req.offset()) {
            Some(t) => t,
            None => {
                self.next_low = self.next_low.wrapping_add(1);
                self.next_low % self.disks.len()
            }
        };
        let disk = &self.disks[idx];
        let mut spins = 0;
        loop {
            match disk.low_prio_queue().push(req) {
                Ok(()) => break,
                Err(back) => {
                    req = back;
                    backoff(&mut spins);
                }
            }
        }
        // The disk thread blocks on its normal queue only
        disk.queue().wakeup();
        self.pending += 1;
    }

    /// Submit requests that a disk thread may drop while it is busy.
    pub fn access_low_prio(&mut self, reqs: &mut [Request]) {
        for slot in reqs.iter_mut() {
            let mut req = slot.take();
            req.set_priority(Priority::Low);
            self.prepare(&mut req);
            self.send_low_prio(req);
        }
    }

    fn flush_senders(&self) -> usize {
        self.senders.iter().map(|s| s.flush()).sum()
    }

    fn buffered(&self) -> usize {
        self.senders.iter().map(|s| s.num_msgs()).sum()
    }

    fn process_completions(&mut self, block: bool) -> usize {
        let mut received = std::mem::take(&mut self.received);
        let n = if block {
            self.sink.queue.fetch_wait(&mut received, usize::MAX, Some(self.wait_timeout))
        } else {
            self.sink.queue.fetch(&mut received, usize::MAX)
        };
        self.pending = self.pending.saturating_sub(n);
        for req in received.drain(..) {
            self.complete_one(req);
        }
        self.received = received;
        n
    }

    fn complete_one(&mut self, mut req: Request) {
        let Some(compute) = req.take_compute() else {
            self.completed_raw.push(req);
            return;
        };
        match req.status() {
            IoStatus::Done(n) => {
                let gathered;
                let data = match req.scratch() {
                    Some(s) => &s[..n.min(s.len())],
                    None => {
                        gathered = gather(&req, n);
                        &gathered[..]
                    }
                };
                let view = BufferByteArray::new(req.offset(), data);
                compute.with_compute(|c| c.run(&view));
            }
            IoStatus::Failed(errno) => {
                kerror!(
                    "file #{}: read of {} bytes at {} failed: errno {}",
                    self.ctx.file_id.0,
                    req.size(),
                    req.offset(),
                    errno
                );
                compute.with_compute(|c| c.io_failed(req.extent(), errno));
            }
            IoStatus::Dropped => {
                kdebug!("file #{}: low-priority read at {} dropped", self.ctx.file_id.0, req.offset());
                compute.with_compute(|c| c.io_failed(req.extent(), libc::ECANCELED));
            }
            IoStatus::Pending => {
                kerror!("file #{}: request at {} returned unfinished", self.ctx.file_id.0, req.offset());
                compute.with_compute(|c| c.io_failed(req.extent(), libc::EIO));
            }
        }
        self.after_run(compute);
    }

    /// Park `compute` for re-driving, or drop the count its request held.
    fn after_run(&mut self, compute: ComputeRef) {
        if compute.has_requests() && compute.try_mark_queued() {
            if let Err(c) = self.ready.push_expand(compute) {
                c.clear_queued();
                c.release();
            }
        } else {
            compute.release();
        }
    }

    /// Let every ready computation issue what it wants.
    fn drive_ready(&mut self) {
        if self.ready.is_empty() {
            return;
        }
        let mut buf = FifoQueue::new(self.ctx.node_id, self.io_batch, false);
        let mut reqs = Vec::with_capacity(self.io_batch);
        while let Some(compute) = self.ready.pop_front() {
            compute.clear_queued();
            while compute.has_requests() {
                if compute.fetch_into(&self.ctx, &mut buf, self.io_batch) == 0 {
                    break;
                }
                reqs.clear();
                reqs.extend(buf.drain());
                self.access(&mut reqs, None);
            }
            compute.release();
        }
    }
}

impl IoInterface for RemoteIo {
    fn context(&self) -> IoContext {
        self.ctx
    }

    fn access(&mut self, reqs: &mut [Request], mut status: Option<&mut [IoStatus]>) {
        for (i, slot) in reqs.iter_mut().enumerate() {
            let mut req = slot.take();
            self.prepare(&mut req);
            match req.priority() {
                Priority::Normal => self.send(req),
                Priority::Low => self.send_low_prio(req),
            }
            if let Some(st) = status.as_mut() {
                st[i] = IoStatus::Pending;
            }
        }
    }

    fn wait4complete(&mut self, min: usize) -> usize {
        let mut completed = 0;
        let mut spins = 0;
        loop {
            self.flush_senders();
            // Only requests that reached a disk thread can complete
            let out = self.pending.saturating_sub(self.buffered());
            let block = completed < min && out > 0 && self.ready.is_empty();
            let n = self.process_completions(block);
            completed += n;
            self.drive_ready();
            if completed >= min || (self.pending == 0 && self.ready.is_empty()) {
                return completed;
            }
            if n == 0 && !block {
                backoff(&mut spins);
            }
        }
    }

    fn num_pending_ios(&self) -> usize {
        self.pending
    }

    fn flush_requests(&mut self) {
        self.flush_senders();
        for disk in &self.disks {
            disk.flush_requests();
        }
    }

    fn take_completed(&mut self, out: &mut Vec<Request>) -> usize {
        let n = self.completed_raw.len();
        out.append(&mut self.completed_raw);
        n
    }
}

impl Drop for RemoteIo {
    fn drop(&mut self) {
        if self.pending > 0 {
            kwarn!(
                "I/O path for file #{} dropped with {} requests outstanding",
                self.ctx.file_id.0,
                self.pending
            );
        }
        let leftover: VecDeque<Request> = self
            .senders
            .iter()
            .flat_map(|s| s.take_buffered())
            .collect();
        for mut req in leftover {
            if let Some(c) = req.take_compute() {
                c.release();
            }
        }
        while let Some(c) = self.ready.pop_front() {
            c.clear_queued();
            c.release();
        }
    }
}
