//! In-memory substitute path
//!
//! A dataset small enough to preload is read once, through the real
//! path, into page-aligned memory. `InMemIo` then serves the same
//! `IoInterface` synchronously: every request has run, and every
//! computation it resumed has been re-driven, by the time `access`
//! returns. Nothing on this path blocks.

use std::sync::Arc;

use pageio_core::error::{IoError, Result};
use pageio_core::{
    kinfo, Access, ComputeRef, Extent, FifoQueue, FileId, Fragment, IoContext, IoFactory,
    IoInterface, IoStatus, Page, PageByteArray, PageId, PagesByteArray, Request,
};

use crate::config::IoConfig;
use crate::memory::AlignedBuf;

/// Whole file resident in memory.
pub struct InMemImage {
    file_id: FileId,
    name: String,
    size: u64,
    pages: Vec<Page>,
    buf: AlignedBuf,
}

impl InMemImage {
    fn with_buffer(file_id: FileId, name: String, size: u64, buf: AlignedBuf) -> Self {
        let pages = (0..buf.num_pages())
            .filter_map(|i| {
                // Safety: `buf` lives as long as the image and is not
                // written once the image is built
                buf.page_ptr(i).map(|p| unsafe { Page::from_raw(PageId(i as u64), p) })
            })
            .collect();
        InMemImage { file_id, name, size, pages, buf }
    }

    /// Read the file behind `factory` into memory.
    ///
    /// Reads go through `factory`'s own I/O path in pieces of at most
    /// `config.max_load_chunk` bytes.
    pub fn load(factory: &dyn IoFactory, config: &IoConfig) -> Result<Arc<Self>> {
        let size = factory.file_size();
        let len = usize::try_from(size).map_err(|_| IoError::Mmap(usize::MAX))?;
        let mut buf = AlignedBuf::new(len)?;
        if config.pin_image {
            buf.pin();
        }

        let file_id = factory.file_id();
        let mut io = factory.create_io(0)?;
        let chunk = config.max_load_chunk.max(pageio_core::PAGE_SIZE);
        let mut done = Vec::with_capacity(1);
        let mut off = 0usize;
        while off < len {
            let n = chunk.min(len - off);
            // Safety: `off + n <= len`, inside the mapping, which outlives
            // the read
            let frag = unsafe { Fragment::new(buf.as_mut_ptr().add(off), n) };
            let mut reqs = [Request::with_buffer(file_id, off as u64, frag, Access::Read)];
            io.access(&mut reqs, None);

            done.clear();
            while done.is_empty() {
                io.wait4complete(1);
                io.take_completed(&mut done);
                if done.is_empty() && io.num_pending_ios() == 0 {
                    return Err(IoError::Os(libc::EIO));
                }
            }
            match done[0].status() {
                IoStatus::Done(got) if got == n => {}
                IoStatus::Done(got) => {
                    return Err(IoError::ShortRead { offset: off as u64, expected: n, got })
                }
                IoStatus::Failed(errno) => return Err(IoError::Os(errno)),
                IoStatus::Pending | IoStatus::Dropped => return Err(IoError::Os(libc::EIO)),
            }
            off += n;
        }

        kinfo!("loaded {} into memory: {} bytes, {} pages", factory.file_name(), size, buf.num_pages());
        Ok(Arc::new(Self::with_buffer(file_id, factory.file_name().to_string(), size, buf)))
    }

    /// Image holding a copy of `data`.
    pub fn from_bytes(file_id: FileId, name: impl Into<String>, data: &[u8]) -> Result<Arc<Self>> {
        let mut buf = AlignedBuf::new(data.len())?;
        buf.as_mut_slice().copy_from_slice(data);
        Ok(Arc::new(Self::with_buffer(file_id, name.into(), data.len() as u64, buf)))
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// View of `extent`, cut off at the end of the image.
    pub fn byte_array(&self, extent: Extent) -> PagesByteArray<'_> {
        let ext = extent.clamp_to(self.size);
        let first = ext.first_page().0 as usize;
        let pages = self.pages.get(first..).unwrap_or(&[]);
        PagesByteArray::new(pages, ext)
    }

    pub fn create_io_factory(self: &Arc<Self>, config: &IoConfig) -> Arc<InMemIoFactory> {
        Arc::new(InMemIoFactory {
            image: Arc::clone(self),
            batch: config.io_batch.max(1),
        })
    }
}

impl std::fmt::Debug for InMemImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemImage")
            .field("file_id", &self.file_id)
            .field("name", &self.name)
            .field("size", &self.size)
            .finish()
    }
}

pub struct InMemIoFactory {
    image: Arc<InMemImage>,
    batch: usize,
}

impl InMemIoFactory {
    pub fn image(&self) -> &Arc<InMemImage> {
        &self.image
    }
}

impl IoFactory for InMemIoFactory {
    fn file_id(&self) -> FileId {
        self.image.file_id
    }

    fn file_name(&self) -> &str {
        &self.image.name
    }

    fn file_size(&self) -> u64 {
        self.image.size
    }

    fn create_io(&self, node_id: usize) -> Result<Box<dyn IoInterface>> {
        Ok(Box::new(InMemIo::new(Arc::clone(&self.image), node_id, self.batch)))
    }
}

pub struct InMemIo {
    image: Arc<InMemImage>,
    ctx: IoContext,
    batch: usize,
    /// Requests fetched from one computation; grows on demand
    req_buf: FifoQueue<Request>,
    /// Computations with requests to issue
    compute_buf: FifoQueue<ComputeRef>,
    /// Computations that are neither complete nor asking for anything
    incomplete: FifoQueue<ComputeRef>,
    completed_raw: Vec<Request>,
    completed: usize,
}

impl InMemIo {
    pub fn new(image: Arc<InMemImage>, node_id: usize, batch: usize) -> Self {
        let batch = batch.max(1);
        InMemIo {
            ctx: IoContext { file_id: image.file_id, node_id },
            image,
            batch,
            req_buf: FifoQueue::new(node_id, batch, true),
            compute_buf: FifoQueue::new(node_id, batch, true),
            incomplete: FifoQueue::new(node_id, batch, true),
            completed_raw: Vec::new(),
            completed: 0,
        }
    }

    /// Run one request. Its computation, if any, must already be held.
    fn process_req(&mut self, mut req: Request) -> IoStatus {
        self.completed += 1;
        let ext = req.extent().clamp_to(self.image.size);

        let Some(compute) = req.take_compute() else {
            let status = self.copy_raw(&req, ext);
            req.set_status(status);
            self.completed_raw.push(req);
            return status;
        };

        let status = match req.access() {
            Access::Read => {
                let view = self.image.byte_array(ext);
                compute.with_compute(|c| c.run(&view));
                IoStatus::Done(ext.size)
            }
            Access::Write => {
                compute.with_compute(|c| c.io_failed(req.extent(), libc::EROFS));
                IoStatus::Failed(libc::EROFS)
            }
        };
        self.after_run(compute);
        status
    }

    fn copy_raw(&self, req: &Request, ext: Extent) -> IoStatus {
        if req.access() == Access::Write {
            return IoStatus::Failed(libc::EROFS);
        }
        if req.num_fragments() == 0 || req.fragment_bytes() != req.size() {
            return IoStatus::Failed(libc::EINVAL);
        }
        let view = self.image.byte_array(ext);
        let mut pos = 0;
        for frag in req.fragments() {
            // Safety: the submitter keeps fragment memory valid until the
            // request completes, which is now
            let dst = unsafe { frag.as_mut_slice() };
            pos += view.copy_range(pos, dst);
        }
        IoStatus::Done(pos)
    }

    /// Queue a computation that is not done yet, or drop the count its
    /// request held. `settle` parks it on `incomplete` if it has nothing
    /// to ask for.
    fn after_run(&mut self, compute: ComputeRef) {
        if !compute.is_complete() && compute.try_mark_queued() {
            if let Err(c) = self.compute_buf.push_expand(compute) {
                c.clear_queued();
                c.release();
            }
        } else {
            compute.release();
        }
    }

    /// Decide where a computation goes once it has been driven.
    fn settle(&mut self, compute: ComputeRef) {
        if compute.is_complete() || !compute.try_mark_queued() {
            compute.release();
            return;
        }
        let target = if compute.has_requests() {
            &mut self.compute_buf
        } else {
            &mut self.incomplete
        };
        if let Err(c) = target.push_expand(compute) {
            c.clear_queued();
            c.release();
        }
    }

    /// Drive queued computations until none has requests left to issue.
    fn process_computes(&mut self) {
        let mut reqs = Vec::new();
        while let Some(compute) = self.compute_buf.pop_front() {
            compute.clear_queued();
            while compute.has_requests() {
                if self.req_buf.is_full() {
                    let cap = self.req_buf.capacity() * 2;
                    self.req_buf.expand(cap);
                }
                let room = self.req_buf.remaining().min(self.batch);
                if compute.fetch_into(&self.ctx, &mut self.req_buf, room) == 0 {
                    break;
                }
            }
            reqs.extend(self.req_buf.drain());
            for req in &reqs {
                if let Some(c) = req.compute() {
                    c.inc_ref();
                }
            }
            for req in reqs.drain(..) {
                self.process_req(req);
            }
            self.settle(compute);
        }
    }
}

impl IoInterface for InMemIo {
    fn context(&self) -> IoContext {
        self.ctx
    }

    fn access(&mut self, reqs: &mut [Request], mut status: Option<&mut [IoStatus]>) {
        // Hold every computation first: an early request must not
        // reclaim a computation a later request in this batch still names
        for req in reqs.iter() {
            if let Some(c) = req.compute() {
                c.inc_ref();
            }
        }
        for (i, slot) in reqs.iter_mut().enumerate() {
            let st = self.process_req(slot.take());
            if let Some(s) = status.as_mut() {
                s[i] = st;
            }
        }
        self.process_computes();
    }

    fn wait4complete(&mut self, _min: usize) -> usize {
        while let Some(c) = self.incomplete.pop_front() {
            if let Err(c) = self.compute_buf.push_expand(c) {
                c.clear_queued();
                c.release();
            }
        }
        self.process_computes();
        std::mem::take(&mut self.completed)
    }

    fn num_pending_ios(&self) -> usize {
        0
    }

    fn take_completed(&mut self, out: &mut Vec<Request>) -> usize {
        let n = self.completed_raw.len();
        out.append(&mut self.completed_raw);
        n
    }
}

impl Drop for InMemIo {
    fn drop(&mut self) {
        for q in [&mut self.compute_buf, &mut self.incomplete] {
            while let Some(c) = q.pop_front() {
                c.clear_queued();
                c.release();
            }
        }
    }
}
