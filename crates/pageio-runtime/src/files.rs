//! File layout across disk threads
//!
//! A `Striped` file is split into `block_size` stripes assigned round
//! robin, so each stripe has exactly one owning disk thread. A `Shared`
//! file can be read by any disk thread, and requests go to whichever
//! queue has room.

use std::path::{Path, PathBuf};

use pageio_core::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLayout {
    Striped { block_size: u64 },
    Shared,
}

/// Where the requests for one file go.
#[derive(Debug, Clone)]
pub struct FilePartition {
    id: FileId,
    path: PathBuf,
    size: u64,
    layout: FileLayout,
    num_threads: usize,
}

impl FilePartition {
    pub fn new(id: FileId, path: &Path, size: u64, layout: FileLayout, num_threads: usize) -> Self {
        let layout = match layout {
            FileLayout::Striped { block_size } => FileLayout::Striped { block_size: block_size.max(1) },
            FileLayout::Shared => FileLayout::Shared,
        };
        FilePartition {
            id,
            path: path.to_path_buf(),
            size,
            layout,
            num_threads: num_threads.max(1),
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn layout(&self) -> FileLayout {
        self.layout
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Disk thread owning `offset`; `None` when any thread may serve it.
    pub fn map(&self, offset: u64) -> Option<usize> {
        match self.layout {
            FileLayout::Striped { block_size } => {
                Some(((offset / block_size) % self.num_threads as u64) as usize)
            }
            FileLayout::Shared => None,
        }
    }
}
