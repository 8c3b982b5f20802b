//! # pageio-core
//!
//! Core types and traits for pageio, the asynchronous page-access layer
//! that lets graph computations run on datasets larger than memory.
//!
//! This crate is platform-agnostic and performs no I/O. Disk threads,
//! I/O engines and the in-memory substitute path live in `pageio-runtime`.
//!
//! ## Modules
//!
//! - `request` - I/O request descriptor with inline scatter/gather list
//! - `queue` - Bounded FIFO queues (plain and lock-protected, blocking)
//! - `sender` - Batching sender with randomized load balancing
//! - `compute` - Pending computations, their pool and the vertex bridge
//! - `page` - Pages and byte-array views over requested ranges
//! - `io` - I/O path, factory, engine and completion traits
//! - `error` - Error types
//! - `spinlock` - Internal spinlock primitive
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod kprint;
pub mod env;
pub mod error;
pub mod spinlock;
pub mod request;
pub mod queue;
pub mod sender;
pub mod page;
pub mod compute;
pub mod io;

// Re-exports for convenience
pub use error::{IoError, Result, TrySendError};
pub use spinlock::SpinLock;
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};
pub use request::{Access, Fragment, Priority, Request};
pub use queue::{FifoQueue, MsgQueue};
pub use sender::MsgSender;
pub use page::{BufferByteArray, Extent, Page, PageByteArray, PageId, PagesByteArray};
pub use compute::{
    ComputePool, ComputeRef, ComputeState, ComputeVertex, PoolStats, UserCompute, VertexCompute,
};
pub use io::{
    submit_compute, CompletionSink, FileId, IoContext, IoEngine, IoFactory, IoInterface, IoStatus,
};

/// Constants shared by every I/O path
pub mod constants {
    /// Page size. Both the disk path and the in-memory image address
    /// pages as `offset / PAGE_SIZE`.
    pub const PAGE_SIZE: usize = 4096;

    /// Fragments a request stores without a heap allocation
    pub const INLINE_FRAGMENTS: usize = 4;

    /// Capacity of the first heap fragment array (later growth doubles)
    pub const MIN_HEAP_FRAGMENTS: usize = 16;

    /// Largest single read issued while loading an in-memory image
    pub const MAX_LOAD_CHUNK: usize = 256 * 1024 * 1024;
}

pub use constants::PAGE_SIZE;
