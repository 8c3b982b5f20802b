//! # pageio - asynchronous page access for out-of-core graph computation
//!
//! Graph algorithms written against pageio never touch a file. A
//! computation asks for byte ranges, is resumed with each range once it
//! has been read, and reports when it is done. Underneath, requests are
//! batched into per-partition disk threads; for datasets that fit in
//! memory the same computations run against a preloaded image instead.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pageio::{FileLayout, IoConfig, IoSystem, ComputePool, VertexCompute};
//!
//! let system = IoSystem::new(IoConfig::from_env())?;
//! let factory = system.open_file("graph.adj", FileLayout::Shared)?;
//! let mut io = factory.create_io(0)?;
//!
//! let pool = ComputePool::new("bfs", 1 << 16);
//! let c = pool.alloc(Box::new(VertexCompute::new(my_vertex, prog)))?;
//! pageio::submit_compute(&mut *io, &c, 16);
//! while io.num_pending_ios() > 0 {
//!     io.wait4complete(1);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!   caller thread                                disk threads
//! ┌──────────────────────────┐               ┌──────────────────────┐
//! │ UserCompute              │  MsgSender    │ MsgQueue (normal)    │
//! │   fetch_requests ──► access ──batch──►   │ MsgQueue (low prio)  │
//! │                          │               │        │             │
//! │   run ◄── wait4complete ◄─── completions ◄── IoEngine          │
//! └──────────────────────────┘               └──────────────────────┘
//!
//!   InMemIo: access runs every request and resumed computation
//!            against an InMemImage before returning
//! ```

mod system;

pub use system::IoSystem;

pub use pageio_core::{
    env, kprint, submit_compute, Access, BufferByteArray, CompletionSink, ComputePool,
    ComputeRef, ComputeState, ComputeVertex, Extent, FifoQueue, FileId, Fragment, IoContext,
    IoEngine, IoError, IoFactory, IoInterface, IoStatus, MsgQueue, MsgSender, Page,
    PageByteArray, PageId, PagesByteArray, PoolStats, Priority, Request, Result, TrySendError,
    UserCompute, VertexCompute, PAGE_SIZE,
};
pub use pageio_core::{kdebug, kerror, kinfo, kprintln, ktrace, kwarn};

pub use pageio_runtime::{
    AlignedBuf, DiskAccessThread, DiskStats, DiskThreadHandle, EngineKind, FileLayout,
    FilePartition, InMemImage, InMemIo, InMemIoFactory, IoConfig, RemoteIo, RemoteIoFactory,
    SyncEngine,
};

#[cfg(test)]
mod tests;
