//! # pageio-runtime
//!
//! OS-facing half of pageio.
//!
//! This crate provides:
//! - Configuration from the environment (`IoConfig`)
//! - Page-aligned anonymous memory (mmap)
//! - I/O engines: positional vectored I/O and io_uring
//! - Disk access threads with normal and low-priority queues
//! - The real I/O path (`RemoteIo`) and the in-memory substitute
//!   (`InMemIo`) behind the same `IoInterface`

pub mod config;
pub mod memory;
pub mod engine;
pub mod files;
pub mod disk_thread;
pub mod remote;
pub mod in_mem;

// Re-exports
pub use config::{EngineKind, IoConfig};
pub use memory::AlignedBuf;
pub use engine::{create_engine, SyncEngine};
pub use files::{FileLayout, FilePartition};
pub use disk_thread::{DiskAccessThread, DiskStats, DiskThreadHandle};
pub use remote::{RemoteIo, RemoteIoFactory};
pub use in_mem::{InMemImage, InMemIo, InMemIoFactory};

#[cfg(target_os = "linux")]
pub use engine::UringEngine;
