//! `UringEngine` - io_uring vectored reads and writes.
//!
//! `submit()` pushes an SQE, `flush()` calls `io_uring_enter()`,
//! `poll_completions()` drains the CQ. Nothing here blocks except
//! `shutdown()`, which waits for in-flight requests.
//!
//! Each in-flight request parks in a slot together with its iovec array;
//! the slot index is the SQE's `user_data`.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use io_uring::{opcode, types, IoUring};

use pageio_core::error::{IoError, Result};
use pageio_core::{kdebug, kwarn, Access, FileId, IoEngine, IoStatus, Request};

use super::{check_request, iovecs, status_of};

struct InFlight {
    req: Request,
    /// Read by the kernel until the CQE arrives
    iov: Vec<libc::iovec>,
}

pub struct UringEngine {
    ring: IoUring,
    files: HashMap<FileId, File>,
    slots: Vec<Option<InFlight>>,
    free: Vec<u32>,
    /// Rejected before reaching the ring
    done: VecDeque<Request>,
    pending_submit: usize,
    inflight: usize,
}

// Safety: the iovec pointers refer to request fragments, which are
// `Send`; the engine is only used from its disk thread.
unsafe impl Send for UringEngine {}

impl UringEngine {
    pub fn new(depth: usize) -> Result<Self> {
        let depth = depth.max(1);
        let entries = depth.next_power_of_two() as u32;
        let ring = IoUring::builder()
            .build(entries)
            .map_err(|e| IoError::EngineSetup(e.raw_os_error().unwrap_or(-1)))?;
        Ok(UringEngine {
            ring,
            files: HashMap::new(),
            slots: (0..depth).map(|_| None).collect(),
            free: (0..depth as u32).rev().collect(),
            done: VecDeque::new(),
            pending_submit: 0,
            inflight: 0,
        })
    }

    fn reject(&mut self, mut req: Request, errno: i32) {
        req.set_status(IoStatus::Failed(errno));
        self.done.push_back(req);
    }

    fn reap(&mut self, out: &mut Vec<Request>, max: usize) -> usize {
        let mut count = 0;
        let mut finished = Vec::new();
        {
            let mut cq = self.ring.completion();
            while count < max {
                let Some(cqe) = cq.next() else { break };
                finished.push((cqe.user_data() as usize, cqe.result()));
                count += 1;
            }
        }
        for (idx, res) in finished {
            match self.slots.get_mut(idx).and_then(Option::take) {
                Some(mut f) => {
                    f.req.set_status(status_of(res as i64));
                    out.push(f.req);
                    self.free.push(idx as u32);
                    self.inflight = self.inflight.saturating_sub(1);
                }
                None => kwarn!("uring engine: completion for empty slot {}", idx),
            }
        }
        count
    }
}

impl IoEngine for UringEngine {
    fn name(&self) -> &'static str {
        "uring"
    }

    fn open_file(&mut self, id: FileId, path: &Path) -> Result<()> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(_) => File::open(path)?,
        };
        kdebug!("uring engine: opened {} as #{}", path.display(), id.0);
        self.files.insert(id, file);
        Ok(())
    }

    fn has_file(&self, id: FileId) -> bool {
        self.files.contains_key(&id)
    }

    fn submit(&mut self, req: Request) -> std::result::Result<(), Request> {
        if let Err(errno) = check_request(&req) {
            self.reject(req, errno);
            return Ok(());
        }
        let Some(fd) = self.files.get(&req.file_id()).map(|f| f.as_raw_fd()) else {
            self.reject(req, libc::EBADF);
            return Ok(());
        };
        let Some(idx) = self.free.pop() else {
            return Err(req);
        };

        let iov = iovecs(&req);
        let sqe = match req.access() {
            Access::Read => opcode::Readv::new(types::Fd(fd), iov.as_ptr(), iov.len() as u32)
                .offset(req.offset())
                .build(),
            Access::Write => opcode::Writev::new(types::Fd(fd), iov.as_ptr(), iov.len() as u32)
                .offset(req.offset())
                .build(),
        }
        .user_data(idx as u64);

        // Safety: the iovecs and the buffers they point at stay alive in
        // the slot until the CQE for `idx` is reaped.
        let mut pushed = unsafe { self.ring.submission().push(&sqe).is_ok() };
        if !pushed && self.ring.submit().is_ok() {
            self.inflight += self.pending_submit;
            self.pending_submit = 0;
            pushed = unsafe { self.ring.submission().push(&sqe).is_ok() };
        }
        if !pushed {
            self.free.push(idx);
            return Err(req);
        }
        self.slots[idx as usize] = Some(InFlight { req, iov });
        self.pending_submit += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<usize> {
        if self.pending_submit == 0 {
            return Ok(0);
        }
        let submitted = self
            .ring
            .submit()
            .map_err(|e| IoError::Os(e.raw_os_error().unwrap_or(-1)))?;
        let submitted = submitted.min(self.pending_submit);
        self.inflight += submitted;
        self.pending_submit -= submitted;
        Ok(submitted)
    }

    fn poll_completions(&mut self, out: &mut Vec<Request>, max: usize) -> usize {
        let early = max.min(self.done.len());
        out.extend(self.done.drain(..early));
        early + self.reap(out, max - early)
    }

    fn pending(&self) -> usize {
        self.pending_submit
    }

    fn inflight(&self) -> usize {
        self.inflight
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn shutdown(&mut self) {
        let _ = self.flush();
        let mut sink = Vec::new();
        while self.inflight > 0 {
            if let Err(e) = self.ring.submit_and_wait(1) {
                kwarn!("uring engine: wait during shutdown failed: {}", e);
                break;
            }
            self.reap(&mut sink, usize::MAX);
        }
        if !sink.is_empty() {
            kdebug!("uring engine: {} requests finished during shutdown", sink.len());
        }
        self.done.extend(sink);
        self.files.clear();
    }
}
