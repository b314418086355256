//! RefHub capture queue
//!
//! Ingests URLs, renders each one as a full-page screenshot and persists the
//! outcome with durable status tracking for later review and tagging.
//!
//! # Features
//!
//! - **Dedup-protected queue**: one row per (brand, season, item, source URL)
//! - **Atomic claims**: PENDING items flip to PROCESSING in a single transaction
//! - **Partitioned capture**: one render session per (brand, season, item),
//!   partitions run in parallel on a worker-thread pool, URLs inside a
//!   partition run in order with bounded immediate retry
//! - **CDP Backend** (`cdp` feature): headless Chrome via `headless_chrome`
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use refhub::{CaptureConfig, CaptureWorker, NewReference, ReferenceStore, WorkerOptions};
//!
//! # async fn run(engine: Arc<dyn refhub::RenderEngine>) -> refhub::Result<()> {
//! let store = Arc::new(ReferenceStore::open("data/references.db".as_ref())?);
//! store.enqueue(&[NewReference::new("apc-golf", "2026-ss", "tee", "https://example.com")])?;
//!
//! let worker = CaptureWorker::new(
//!     Arc::clone(&store),
//!     engine,
//!     CaptureConfig::default(),
//!     "output".into(),
//!     WorkerOptions::default(),
//! )?;
//! let report = worker.run_batch().await?;
//! println!("success={} failed={}", report.succeeded, report.failed);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

pub mod clock;
pub mod model;
pub mod slug;

mod applier;
pub mod queue;
pub mod store;

pub mod dispatch;
pub mod orchestrator;
pub mod worker;

// Chrome DevTools Protocol backend
#[cfg(feature = "cdp")]
pub mod cdp;

pub use dispatch::CapturePool;
pub use model::{
    CaptureOutcome, CaptureResult, EnqueueReport, ItemEdit, ItemStatus, ListFilter, NewReference,
    PartitionKey, ReferenceItem, StatusCounts, Tags, COLUMNS, TAG_COLUMNS,
};
pub use orchestrator::{partition_batch, CaptureTarget, Orchestrator, Partition};
pub use queue::parse_url_list;
pub use store::ReferenceStore;
pub use worker::{default_stale_after, BatchReport, CaptureWorker, WorkerOptions};

/// Capture configuration shared by every session of a batch
///
/// The defaults match a tall portrait viewport suited to lookbook pages:
/// - 1600×2200 viewport
/// - 30 s render timeout, JPEG quality 85
/// - 2 retries, i.e. up to 3 attempts per URL
///
/// # Examples
///
/// ```
/// let cfg = refhub::CaptureConfig::default();
/// assert_eq!(cfg.max_attempts(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Viewport dimensions for every session
    pub viewport: Viewport,
    /// Timeout for a single render in milliseconds
    pub timeout_ms: u64,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// Additional attempts after the first failed render of a URL
    pub max_retries: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            viewport: Viewport::default(),
            timeout_ms: 30000,
            jpeg_quality: 85,
            max_retries: 2,
        }
    }
}

impl CaptureConfig {
    /// Total render attempts allowed per URL.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Longest a batch of `batch_limit` items can hold its claims when every
    /// render times out on every attempt and partitions run one at a time.
    pub fn worst_case_batch(&self, batch_limit: usize) -> Duration {
        self.timeout()
            .saturating_mul(self.max_attempts())
            .saturating_mul(u32::try_from(batch_limit).unwrap_or(u32::MAX))
    }

    /// Reject configurations no render engine can honour.
    pub fn validate(&self) -> Result<()> {
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(Error::Config(format!(
                "viewport must be non-empty, got {}x{}",
                self.viewport.width, self.viewport.height
            )));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config("timeout_ms must be greater than zero".into()));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(Error::Config(format!(
                "jpeg_quality must be within 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        Ok(())
    }
}

/// Viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1600,
            height: 2200,
        }
    }
}

/// Factory for render sessions.
///
/// Implementations must be shareable across the capture worker threads.
pub trait RenderEngine: Send + Sync {
    /// Open a session (browser context) sized to `viewport`.
    ///
    /// A failure here fails every URL of the partition that asked for it.
    fn open_session(&self, viewport: Viewport) -> Result<Box<dyn RenderSession>>;
}

/// One reusable render session, owned by a single worker thread.
pub trait RenderSession {
    /// Render `url` as a full-page JPEG and return the image bytes.
    fn render(&mut self, url: &str, timeout: Duration, jpeg_quality: u8) -> Result<Vec<u8>>;

    /// Close the session and clean up resources
    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Create the default render engine
///
/// Requires the `cdp` feature (headless Chrome).
#[cfg(feature = "cdp")]
pub fn new_renderer() -> Result<std::sync::Arc<dyn RenderEngine>> {
    Ok(std::sync::Arc::new(cdp::CdpRenderer))
}
