//! I/O engines
//!
//! An engine is what a disk thread drives. Two implementations:
//!
//! - `SyncEngine` - `preadv`/`pwritev` issued on `flush()`; portable,
//!   and the default.
//! - `UringEngine` - io_uring `Readv`/`Writev`; Linux only.

mod sync;
pub use sync::SyncEngine;

use pageio_core::error::Result;
use pageio_core::{IoEngine, IoStatus, Request};

use crate::config::EngineKind;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod uring;
        pub use uring::UringEngine;
    }
}

/// Build the engine a disk thread runs.
pub fn create_engine(kind: EngineKind, depth: usize) -> Result<Box<dyn IoEngine>> {
    match kind {
        EngineKind::Sync => Ok(Box::new(SyncEngine::new(depth))),
        EngineKind::Uring => create_uring(depth),
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn create_uring(depth: usize) -> Result<Box<dyn IoEngine>> {
            Ok(Box::new(UringEngine::new(depth)?))
        }
    } else {
        fn create_uring(_depth: usize) -> Result<Box<dyn IoEngine>> {
            Err(pageio_core::IoError::EngineSetup(libc::ENOSYS))
        }
    }
}

/// Reject requests an engine cannot issue; returns the errno.
///
/// A request must carry buffers covering exactly its size.
pub(crate) fn check_request(req: &Request) -> std::result::Result<(), i32> {
    if req.size() == 0 || req.num_fragments() == 0 || req.fragment_bytes() != req.size() {
        return Err(libc::EINVAL);
    }
    Ok(())
}

/// iovec list for a request's fragments.
pub(crate) fn iovecs(req: &Request) -> Vec<libc::iovec> {
    req.fragments()
        .iter()
        .map(|f| libc::iovec {
            iov_base: f.base() as *mut libc::c_void,
            iov_len: f.len(),
        })
        .collect()
}

/// Status for a raw syscall-style result.
pub(crate) fn status_of(res: i64) -> IoStatus {
    if res < 0 {
        IoStatus::Failed((-res) as i32)
    } else {
        IoStatus::Done(res as usize)
    }
}
