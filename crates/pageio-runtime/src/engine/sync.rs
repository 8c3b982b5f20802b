//! `SyncEngine` - blocking vectored I/O on the disk thread.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use pageio_core::error::Result;
use pageio_core::{kdebug, Access, FileId, IoEngine, IoStatus, Request};

use super::{check_request, iovecs, status_of};

/// Most iovecs passed to one call
const MAX_IOV: usize = 1024;

pub struct SyncEngine {
    files: HashMap<FileId, File>,
    queued: VecDeque<Request>,
    done: VecDeque<Request>,
    depth: usize,
}

impl SyncEngine {
    pub fn new(depth: usize) -> Self {
        SyncEngine {
            files: HashMap::new(),
            queued: VecDeque::new(),
            done: VecDeque::new(),
            depth: depth.max(1),
        }
    }

    fn execute(&self, req: &mut Request) {
        if let Err(errno) = check_request(req) {
            req.set_status(IoStatus::Failed(errno));
            return;
        }
        let Some(file) = self.files.get(&req.file_id()) else {
            req.set_status(IoStatus::Failed(libc::EBADF));
            return;
        };
        let status = transfer(file.as_raw_fd(), req);
        req.set_status(status);
    }
}

/// Move `req.size()` bytes, retrying short transfers. Stops early at end
/// of file, which yields a short `Done`.
fn transfer(fd: RawFd, req: &Request) -> IoStatus {
    let mut iov = iovecs(req);
    let mut first = 0;
    let mut moved = 0usize;

    while moved < req.size() {
        let cnt = (iov.len() - first).min(MAX_IOV);
        let off = (req.offset() + moved as u64) as libc::off_t;
        let ptr = iov[first..].as_ptr();
        let n = unsafe {
            match req.access() {
                Access::Read => libc::preadv(fd, ptr, cnt as libc::c_int, off),
                Access::Write => libc::pwritev(fd, ptr, cnt as libc::c_int, off),
            }
        };
        if n < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
            if errno == libc::EINTR {
                continue;
            }
            return status_of(-(errno as i64));
        }
        if n == 0 {
            break;
        }
        let mut n = n as usize;
        moved += n;
        while n > 0 && first < iov.len() {
            let v = &mut iov[first];
            if n >= v.iov_len {
                n -= v.iov_len;
                first += 1;
            } else {
                v.iov_base = unsafe { (v.iov_base as *mut u8).add(n) } as *mut libc::c_void;
                v.iov_len -= n;
                n = 0;
            }
        }
    }
    IoStatus::Done(moved)
}

impl IoEngine for SyncEngine {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn open_file(&mut self, id: FileId, path: &Path) -> Result<()> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(_) => File::open(path)?,
        };
        kdebug!("sync engine: opened {} as #{}", path.display(), id.0);
        self.files.insert(id, file);
        Ok(())
    }

    fn has_file(&self, id: FileId) -> bool {
        self.files.contains_key(&id)
    }

    fn submit(&mut self, req: Request) -> std::result::Result<(), Request> {
        if self.queued.len() + self.done.len() >= self.depth {
            return Err(req);
        }
        self.queued.push_back(req);
        Ok(())
    }

    fn flush(&mut self) -> Result<usize> {
        let mut started = 0;
        while let Some(mut req) = self.queued.pop_front() {
            self.execute(&mut req);
            self.done.push_back(req);
            started += 1;
        }
        Ok(started)
    }

    fn poll_completions(&mut self, out: &mut Vec<Request>, max: usize) -> usize {
        let n = max.min(self.done.len());
        out.extend(self.done.drain(..n));
        n
    }

    fn pending(&self) -> usize {
        self.queued.len()
    }

    fn inflight(&self) -> usize {
        0
    }

    fn capacity(&self) -> usize {
        self.depth
    }

    fn shutdown(&mut self) {
        let _ = self.flush();
        self.files.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageio_core::Fragment;
    use std::io::Write;

    fn data_file(len: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        f.write_all(&data).unwrap();
        f.flush().unwrap();
        f
    }

    fn run_one(engine: &mut SyncEngine, req: Request) -> Request {
        engine.submit(req).unwrap();
        assert_eq!(engine.flush().unwrap(), 1);
        let mut out = Vec::new();
        assert_eq!(engine.poll_completions(&mut out, 8), 1);
        out.pop().unwrap()
    }

    #[test]
    fn test_scatter_read() {
        let file = data_file(10_000);
        let mut engine = SyncEngine::new(4);
        engine.open_file(FileId(1), file.path()).unwrap();

        let mut a = vec![0u8; 3];
        let mut b = vec![0u8; 5000];
        let frags = [unsafe { Fragment::from_slice(&mut a) }, unsafe { Fragment::from_slice(&mut b) }];
        let req = Request::with_fragments(FileId(1), 100, &frags, Access::Read);
        let req = run_one(&mut engine, req);

        assert_eq!(req.status(), IoStatus::Done(5003));
        assert_eq!(a, vec![100, 101, 102]);
        assert_eq!(b[0], 103);
        assert_eq!(b[4999], ((100 + 3 + 4999) % 251) as u8);
    }

    #[test]
    fn test_short_read_at_eof() {
        let file = data_file(1000);
        let mut engine = SyncEngine::new(4);
        engine.open_file(FileId(1), file.path()).unwrap();

        let mut buf = vec![0u8; 200];
        let req = Request::with_buffer(FileId(1), 900, unsafe { Fragment::from_slice(&mut buf) }, Access::Read);
        let req = run_one(&mut engine, req);
        assert_eq!(req.status(), IoStatus::Done(100));
        assert!(req.is_partial());
    }

    #[test]
    fn test_write_then_read_back() {
        let file = data_file(100);
        let mut engine = SyncEngine::new(4);
        engine.open_file(FileId(2), file.path()).unwrap();

        let mut src = *b"hello";
        let req = Request::with_buffer(FileId(2), 10, unsafe { Fragment::from_slice(&mut src) }, Access::Write);
        assert_eq!(run_one(&mut engine, req).status(), IoStatus::Done(5));

        let mut dst = [0u8; 5];
        let req = Request::with_buffer(FileId(2), 10, unsafe { Fragment::from_slice(&mut dst) }, Access::Read);
        run_one(&mut engine, req);
        assert_eq!(&dst, b"hello");
    }

    #[test]
    fn test_rejects_bad_requests() {
        let file = data_file(100);
        let mut engine = SyncEngine::new(4);
        engine.open_file(FileId(1), file.path()).unwrap();

        let req = run_one(&mut engine, Request::new(FileId(1), 0, 10, Access::Read));
        assert_eq!(req.status(), IoStatus::Failed(libc::EINVAL));

        let mut buf = [0u8; 4];
        let req = Request::with_buffer(FileId(9), 0, unsafe { Fragment::from_slice(&mut buf) }, Access::Read);
        assert_eq!(run_one(&mut engine, req).status(), IoStatus::Failed(libc::EBADF));
    }

    #[test]
    fn test_submit_refuses_when_full() {
        let mut engine = SyncEngine::new(2);
        engine.submit(Request::new(FileId(1), 0, 1, Access::Read)).unwrap();
        engine.submit(Request::new(FileId(1), 1, 1, Access::Read)).unwrap();
        let back = engine.submit(Request::new(FileId(1), 2, 1, Access::Read)).unwrap_err();
        assert_eq!(back.offset(), 2);
        assert_eq!(engine.pending(), 2);
    }
}
