//! Entry point: owns the disk threads and opens files on them.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use pageio_core::error::{IoError, Result};
use pageio_core::{kinfo, FileId};
use pageio_runtime::{
    DiskAccessThread, DiskStats, DiskThreadHandle, FileLayout, FilePartition, InMemImage,
    InMemIoFactory, IoConfig, RemoteIoFactory,
};

pub struct IoSystem {
    config: IoConfig,
    disks: Vec<DiskAccessThread>,
    next_file: AtomicU32,
}

impl IoSystem {
    /// Start `config.num_io_threads` disk threads, spread round robin
    /// over `config.num_nodes` nodes.
    pub fn new(config: IoConfig) -> Result<Self> {
        config.validate().map_err(IoError::Config)?;
        config.log();
        let disks = (0..config.num_io_threads)
            .map(|i| DiskAccessThread::spawn(i, i % config.num_nodes, &config))
            .collect::<Result<Vec<_>>>()?;
        Ok(IoSystem {
            config,
            disks,
            next_file: AtomicU32::new(1),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(IoConfig::from_env())
    }

    pub fn config(&self) -> &IoConfig {
        &self.config
    }

    pub fn num_io_threads(&self) -> usize {
        self.disks.len()
    }

    pub fn disk(&self, index: usize) -> Option<DiskThreadHandle> {
        self.disks.get(index).map(|d| d.handle())
    }

    /// Attach `path` to every disk thread.
    pub fn open_file(&self, path: impl AsRef<Path>, layout: FileLayout) -> Result<Arc<RemoteIoFactory>> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(IoError::Os(libc::EISDIR));
        }
        // Surface permission errors here rather than on a disk thread
        std::fs::File::open(path)?;

        let id = FileId(self.next_file.fetch_add(1, Ordering::Relaxed));
        let handles: Vec<_> = self.disks.iter().map(|d| d.handle()).collect();
        for h in &handles {
            h.open_file(id, path);
        }
        kinfo!("opened {} as #{} ({} bytes, {:?})", path.display(), id.0, meta.len(), layout);

        let partition = FilePartition::new(id, path, meta.len(), layout, handles.len());
        Ok(Arc::new(RemoteIoFactory::new(partition, handles, self.config.clone())))
    }

    /// Open `path` and preload it into memory.
    pub fn load_in_mem(&self, path: impl AsRef<Path>) -> Result<Arc<InMemIoFactory>> {
        let factory = self.open_file(path, FileLayout::Shared)?;
        let image = InMemImage::load(factory.as_ref(), &self.config)?;
        Ok(image.create_io_factory(&self.config))
    }

    /// Per-thread counters, in thread order
    pub fn stats(&self) -> Vec<DiskStats> {
        self.disks.iter().map(|d| d.handle().stats()).collect()
    }

    pub fn total_stats(&self) -> DiskStats {
        let mut total = DiskStats::default();
        for s in self.stats() {
            total += s;
        }
        total
    }

    /// Drain and stop every disk thread.
    pub fn shutdown(mut self) {
        for d in &self.disks {
            d.stop();
        }
        for d in &mut self.disks {
            d.join();
        }
    }
}
