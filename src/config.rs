//! Tunables shared by the library and the binaries.
//!
//! Both structs derive [`clap::Args`] so the binaries can flatten them into
//! their command lines; library users construct them directly.
use clap::Args;

pub const DEFAULT_PORT: u16 = 7182;
pub const DEFAULT_BATCH_CAPACITY: usize = 100_000;
pub const DEFAULT_BATCH_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_PAGE_SIZE: usize = 100_000;
pub const DEFAULT_WORKERS: usize = 15;

/// Smallest page that still makes progress: one row to yield, one to resume from.
pub const MIN_PAGE_SIZE: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ClientConfig {
    /// Commands buffered per table before a flush; 0 sends every command alone
    #[arg(long, default_value_t = DEFAULT_BATCH_CAPACITY)]
    pub batch_capacity: usize,

    /// Encoded bytes buffered per table before a flush
    #[arg(long, default_value_t = DEFAULT_BATCH_BYTES)]
    pub batch_bytes: usize,

    /// Rows requested per round trip by range scans
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            batch_bytes: DEFAULT_BATCH_BYTES,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn with_batch_capacity(mut self, batch_capacity: usize) -> Self {
        self.batch_capacity = batch_capacity;
        self
    }

    pub fn with_batch_bytes(mut self, batch_bytes: usize) -> Self {
        self.batch_bytes = batch_bytes;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Page size clamped to what a scan can make progress with.
    pub fn effective_page_size(&self) -> usize {
        self.page_size.clamp(MIN_PAGE_SIZE, i32::MAX as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ServerConfig {
    /// Worker threads executing requests
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
        }
    }
}
