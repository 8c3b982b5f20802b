//! pageio configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use pageio_runtime::config::{EngineKind, IoConfig};
//!
//! // Defaults with env overrides
//! let config = IoConfig::from_env();
//!
//! // Or customize programmatically
//! let config = IoConfig::from_env()
//!     .num_io_threads(4)
//!     .engine(EngineKind::Uring);
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use pageio_core::env::{env_get, env_get_bool, env_get_ms, env_get_us};
use pageio_core::kinfo;

/// Library defaults
pub mod defaults {
    use pageio_core::constants::{MAX_LOAD_CHUNK, PAGE_SIZE};

    pub const NUM_IO_THREADS: usize = 2;
    pub const NUM_NODES: usize = 1;
    pub const QUEUE_CAPACITY: usize = 1024;
    pub const LOW_PRIO_QUEUE_CAPACITY: usize = 256;
    pub const COMPLETION_QUEUE_CAPACITY: usize = 1024;
    pub const SENDER_BUF_SIZE: usize = 16;
    pub const IO_BATCH: usize = 16;
    pub const LOW_PRIO_BATCH: usize = 4;
    pub const ENGINE_DEPTH: usize = 128;
    pub const PARK_TIMEOUT_MS: u64 = 10;
    pub const BUSY_POLL_US: u64 = 100;
    pub const LOAD_CHUNK: usize = MAX_LOAD_CHUNK;
    pub const STRIPE_BLOCK: u64 = 64 * PAGE_SIZE as u64;
    pub const PIN_IMAGE: bool = false;
}

/// Which `IoEngine` disk threads run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    /// Blocking `preadv`/`pwritev` on the disk thread
    #[default]
    Sync,
    /// io_uring (Linux only)
    Uring,
}

impl FromStr for EngineKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" | "pread" => Ok(EngineKind::Sync),
            "uring" | "io_uring" | "io-uring" => Ok(EngineKind::Uring),
            _ => Err(()),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Sync => write!(f, "sync"),
            EngineKind::Uring => write!(f, "uring"),
        }
    }
}

/// I/O system configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Disk access threads
    pub num_io_threads: usize,
    /// Nodes the threads are spread over (round robin)
    pub num_nodes: usize,
    /// Normal-priority queue capacity per disk thread
    pub queue_capacity: usize,
    /// Low-priority queue capacity per disk thread
    pub low_prio_queue_capacity: usize,
    /// Initial capacity of each I/O path's completion queue (grows)
    pub completion_queue_capacity: usize,
    /// Batching sender buffer size
    pub sender_buf_size: usize,
    /// Requests a disk thread takes from its normal queue per round
    pub io_batch: usize,
    /// Low-priority requests serviced (or dropped) per round
    pub low_prio_batch: usize,
    pub engine: EngineKind,
    /// Requests an engine holds before `submit` refuses
    pub engine_depth: usize,
    /// Idle disk thread wait
    pub park_timeout: Duration,
    /// Idle wait while the engine has I/O in flight
    pub busy_poll: Duration,
    /// Largest read issued while loading an in-memory image
    pub max_load_chunk: usize,
    /// Stripe size for `FileLayout::Striped`
    pub stripe_block: u64,
    /// mlock the in-memory image
    pub pin_image: bool,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl IoConfig {
    /// Library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `PIO_NUM_IO_THREADS`, `PIO_NUM_NODES`
    /// - `PIO_QUEUE_CAPACITY`, `PIO_LOW_PRIO_QUEUE_CAPACITY`,
    ///   `PIO_COMPLETION_QUEUE_CAPACITY`
    /// - `PIO_SENDER_BUF_SIZE`, `PIO_IO_BATCH`, `PIO_LOW_PRIO_BATCH`
    /// - `PIO_ENGINE` (sync|uring), `PIO_ENGINE_DEPTH`
    /// - `PIO_PARK_TIMEOUT_MS`, `PIO_BUSY_POLL_US`
    /// - `PIO_MAX_LOAD_CHUNK`, `PIO_STRIPE_BLOCK`, `PIO_PIN_IMAGE`
    pub fn from_env() -> Self {
        Self {
            num_io_threads: env_get("PIO_NUM_IO_THREADS", defaults::NUM_IO_THREADS),
            num_nodes: env_get("PIO_NUM_NODES", defaults::NUM_NODES),
            queue_capacity: env_get("PIO_QUEUE_CAPACITY", defaults::QUEUE_CAPACITY),
            low_prio_queue_capacity: env_get(
                "PIO_LOW_PRIO_QUEUE_CAPACITY",
                defaults::LOW_PRIO_QUEUE_CAPACITY,
            ),
            completion_queue_capacity: env_get(
                "PIO_COMPLETION_QUEUE_CAPACITY",
                defaults::COMPLETION_QUEUE_CAPACITY,
            ),
            sender_buf_size: env_get("PIO_SENDER_BUF_SIZE", defaults::SENDER_BUF_SIZE),
            io_batch: env_get("PIO_IO_BATCH", defaults::IO_BATCH),
            low_prio_batch: env_get("PIO_LOW_PRIO_BATCH", defaults::LOW_PRIO_BATCH),
            engine: env_get("PIO_ENGINE", EngineKind::default()),
            engine_depth: env_get("PIO_ENGINE_DEPTH", defaults::ENGINE_DEPTH),
            park_timeout: env_get_ms("PIO_PARK_TIMEOUT_MS", defaults::PARK_TIMEOUT_MS),
            busy_poll: env_get_us("PIO_BUSY_POLL_US", defaults::BUSY_POLL_US),
            max_load_chunk: env_get("PIO_MAX_LOAD_CHUNK", defaults::LOAD_CHUNK),
            stripe_block: env_get("PIO_STRIPE_BLOCK", defaults::STRIPE_BLOCK),
            pin_image: env_get_bool("PIO_PIN_IMAGE", defaults::PIN_IMAGE),
        }
    }

    /// Library defaults, ignoring the environment.
    pub fn new() -> Self {
        Self {
            num_io_threads: defaults::NUM_IO_THREADS,
            num_nodes: defaults::NUM_NODES,
            queue_capacity: defaults::QUEUE_CAPACITY,
            low_prio_queue_capacity: defaults::LOW_PRIO_QUEUE_CAPACITY,
            completion_queue_capacity: defaults::COMPLETION_QUEUE_CAPACITY,
            sender_buf_size: defaults::SENDER_BUF_SIZE,
            io_batch: defaults::IO_BATCH,
            low_prio_batch: defaults::LOW_PRIO_BATCH,
            engine: EngineKind::default(),
            engine_depth: defaults::ENGINE_DEPTH,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            busy_poll: Duration::from_micros(defaults::BUSY_POLL_US),
            max_load_chunk: defaults::LOAD_CHUNK,
            stripe_block: defaults::STRIPE_BLOCK,
            pin_image: defaults::PIN_IMAGE,
        }
    }

    // Builder methods

    pub fn num_io_threads(mut self, n: usize) -> Self {
        self.num_io_threads = n;
        self
    }

    pub fn num_nodes(mut self, n: usize) -> Self {
        self.num_nodes = n;
        self
    }

    pub fn queue_capacity(mut self, cap: usize) -> Self {
        self.queue_capacity = cap;
        self
    }

    pub fn low_prio_queue_capacity(mut self, cap: usize) -> Self {
        self.low_prio_queue_capacity = cap;
        self
    }

    pub fn completion_queue_capacity(mut self, cap: usize) -> Self {
        self.completion_queue_capacity = cap;
        self
    }

    pub fn sender_buf_size(mut self, n: usize) -> Self {
        self.sender_buf_size = n;
        self
    }

    pub fn io_batch(mut self, n: usize) -> Self {
        self.io_batch = n;
        self
    }

    pub fn low_prio_batch(mut self, n: usize) -> Self {
        self.low_prio_batch = n;
        self
    }

    pub fn engine(mut self, kind: EngineKind) -> Self {
        self.engine = kind;
        self
    }

    pub fn engine_depth(mut self, n: usize) -> Self {
        self.engine_depth = n;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn busy_poll(mut self, d: Duration) -> Self {
        self.busy_poll = d;
        self
    }

    pub fn max_load_chunk(mut self, n: usize) -> Self {
        self.max_load_chunk = n;
        self
    }

    pub fn stripe_block(mut self, n: u64) -> Self {
        self.stripe_block = n;
        self
    }

    pub fn pin_image(mut self, pin: bool) -> Self {
        self.pin_image = pin;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.num_io_threads == 0 {
            return Err("num_io_threads must be > 0");
        }
        if self.num_io_threads > 256 {
            return Err("num_io_threads must be <= 256");
        }
        if self.num_nodes == 0 {
            return Err("num_nodes must be > 0");
        }
        if self.queue_capacity == 0 || self.low_prio_queue_capacity == 0 {
            return Err("queue capacities must be > 0");
        }
        if self.completion_queue_capacity == 0 {
            return Err("completion_queue_capacity must be > 0");
        }
        if self.sender_buf_size == 0 {
            return Err("sender_buf_size must be > 0");
        }
        if self.io_batch == 0 {
            return Err("io_batch must be > 0");
        }
        if self.engine_depth < self.io_batch {
            return Err("engine_depth must be >= io_batch");
        }
        if self.engine_depth > u32::MAX as usize {
            return Err("engine_depth too large");
        }
        if self.max_load_chunk == 0 || self.max_load_chunk % pageio_core::PAGE_SIZE != 0 {
            return Err("max_load_chunk must be a non-zero multiple of PAGE_SIZE");
        }
        if self.stripe_block == 0 {
            return Err("stripe_block must be > 0");
        }
        Ok(())
    }

    /// Log the configuration at info level
    pub fn log(&self) {
        kinfo!(
            "pageio: {} disk threads on {} nodes, engine {} (depth {})",
            self.num_io_threads,
            self.num_nodes,
            self.engine,
            self.engine_depth
        );
        kinfo!(
            "pageio: queues {}/{} low, sender buf {}, batch {}/{} low",
            self.queue_capacity,
            self.low_prio_queue_capacity,
            self.sender_buf_size,
            self.io_batch,
            self.low_prio_batch
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = IoConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine, EngineKind::Sync);
        assert_eq!(config.max_load_chunk, 256 * 1024 * 1024);
    }

    #[test]
    fn test_builder_and_validate() {
        let config = IoConfig::new().num_io_threads(0);
        assert_eq!(config.validate(), Err("num_io_threads must be > 0"));

        let config = IoConfig::new().io_batch(64).engine_depth(32);
        assert!(config.validate().is_err());

        let config = IoConfig::new().max_load_chunk(1000);
        assert!(config.validate().is_err());

        let config = IoConfig::new().num_io_threads(4).engine(EngineKind::Uring);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_kind_parse() {
        assert_eq!("io_uring".parse::<EngineKind>(), Ok(EngineKind::Uring));
        assert_eq!("SYNC".parse::<EngineKind>(), Ok(EngineKind::Sync));
        assert!("aio".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("PIO_LOW_PRIO_BATCH", "9");
        let config = IoConfig::from_env();
        assert_eq!(config.low_prio_batch, 9);
        std::env::remove_var("PIO_LOW_PRIO_BATCH");
    }
}
