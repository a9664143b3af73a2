use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::BrowserError;
use crate::selector::Locator;

/// The WebDriver key code for Enter, sent as element text.
pub const ENTER_KEY: &str = "\u{E007}";

/// One live page in the remote browser.
///
/// Every method is a single command; retry and fallback policy lives in
/// [`SelectorResolver`](crate::selector::SelectorResolver), not here.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), BrowserError>;

    /// Wait up to `timeout` for the locator to match. `Ok(false)` means the
    /// wait ran out, not that the command failed.
    async fn wait_for(&self, locator: &Locator, timeout: Duration) -> Result<bool, BrowserError>;

    async fn click(&self, locator: &Locator) -> Result<(), BrowserError>;

    /// Send text (or key codes such as [`ENTER_KEY`]) to the matched element.
    async fn type_text(&self, locator: &Locator, text: &str) -> Result<(), BrowserError>;

    /// Number of elements the locator currently matches.
    async fn count(&self, locator: &Locator) -> Result<usize, BrowserError>;

    /// Click the element at `index` (0-based) among the locator's matches.
    async fn click_nth(&self, locator: &Locator, index: usize) -> Result<(), BrowserError>;

    /// PNG snapshot of the current page.
    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError>;

    /// Release the remote session. Closing a released session is a no-op;
    /// a session that failed to close can be closed again.
    async fn close(&self) -> Result<(), BrowserError>;
}

/// A browser reported a finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadEvent {
    pub suggested_name: String,
    /// Where the browser left the file.
    pub source: PathBuf,
}

/// Number of downloads the browser has started but not yet finished.
/// Written by whoever watches the browser, read by the collector.
#[derive(Debug, Clone, Default)]
pub struct InFlightDownloads(Arc<AtomicUsize>);

impl InFlightDownloads {
    pub fn set(&self, count: usize) {
        self.0.store(count, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Finished-download events plus a live count of unfinished ones.
pub struct DownloadFeed {
    pub events: mpsc::Receiver<DownloadEvent>,
    pub in_flight: InFlightDownloads,
}

impl DownloadFeed {
    pub fn new(events: mpsc::Receiver<DownloadEvent>) -> Self {
        Self {
            events,
            in_flight: InFlightDownloads::default(),
        }
    }
}

/// A fresh session together with its downloads.
pub struct OpenedSession {
    pub session: Box<dyn BrowserSession>,
    pub downloads: DownloadFeed,
}

/// Opens browser sessions, one per job.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, job_id: &str) -> Result<OpenedSession, BrowserError>;
}
