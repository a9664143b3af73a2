//! billfetch configuration loaded from `billfetch.toml`.
//!
//! Every field has a default, so a missing file or a partial file is fine.
//! Deployment endpoints and the storage bucket may be overridden from the
//! environment, which takes precedence over the file. Portal passwords are
//! never read from here.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "billfetch.toml";

/// 5 MiB, the single-shot limit and the multi-part chunk size.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BillfetchConfig {
    #[serde(default)]
    pub portal: PortalConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Automation budgets for the portal engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Upper bound on result pages visited per job.
    pub max_pages: u32,
    /// One wait for one locator.
    pub selector_timeout_ms: u64,
    /// Attempts per locator before falling back to the next one.
    pub selector_attempts: u32,
    pub selector_retry_delay_ms: u64,
    /// Stop collecting downloads after this long without a new one, unless
    /// some are still in flight.
    pub download_quiet_ms: u64,
    /// Upper bound on waiting for in-flight downloads.
    pub download_max_wait_ms: u64,
    /// Save page snapshots at checkpoints.
    pub snapshots: bool,
    pub pacing: PacingConfig,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            max_pages: 50,
            selector_timeout_ms: 2_000,
            selector_attempts: 3,
            selector_retry_delay_ms: 2_000,
            download_quiet_ms: 10_000,
            download_max_wait_ms: 300_000,
            snapshots: true,
            pacing: PacingConfig::default(),
        }
    }
}

/// Randomized, human-like timing. Each pair is an inclusive range.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub keystroke_min_ms: u64,
    pub keystroke_max_ms: u64,
    pub page_turn_min_ms: u64,
    pub page_turn_max_ms: u64,
    /// Pause after submitting the username.
    pub username_settle_ms: u64,
    /// Pause after submitting the password, while the portal signs in.
    pub password_settle_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            keystroke_min_ms: 150,
            keystroke_max_ms: 350,
            page_turn_min_ms: 1_000,
            page_turn_max_ms: 3_000,
            username_settle_ms: 2_000,
            password_settle_ms: 5_000,
        }
    }
}

impl PacingConfig {
    /// No delays at all.
    pub fn immediate() -> Self {
        Self {
            keystroke_min_ms: 0,
            keystroke_max_ms: 0,
            page_turn_min_ms: 0,
            page_turn_max_ms: 0,
            username_settle_ms: 0,
            password_settle_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// WebDriver endpoint of the browser-automation service.
    pub webdriver_url: String,
    /// Parent of the per-job artifact directories.
    pub download_root: PathBuf,
    /// Parent of the per-job browser download directories. The browser must
    /// be able to write here, so for a remote browser this is a shared volume.
    pub staging_root: PathBuf,
    pub headless: bool,
    pub watch_interval_ms: u64,
    /// Attempts at releasing the remote session before giving up on it.
    pub close_attempts: u32,
    pub close_retry_delay_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            download_root: PathBuf::from("downloads"),
            staging_root: PathBuf::from("downloads/.staging"),
            headless: true,
            watch_interval_ms: 500,
            close_attempts: 3,
            close_retry_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: Option<String>,
    /// Custom S3-compatible endpoint (MinIO, LocalStack).
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    /// Files up to this size go up in one request; larger files are split
    /// into chunks of this size.
    pub chunk_size_bytes: u64,
    pub max_attempts: u32,
    /// Linear backoff step: attempt `n` waits `n * retry_delay_ms`.
    pub retry_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: None,
            endpoint_url: None,
            force_path_style: false,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            max_attempts: 3,
            retry_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub redis_url: String,
    pub connect_attempts: u32,
    /// Connection attempt `n` waits `initial_backoff_ms * 2^n`.
    pub initial_backoff_ms: u64,
    /// Expire status entries after this many seconds. Kept forever if unset.
    pub ttl_secs: Option<u64>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379/0".to_string(),
            connect_attempts: 5,
            initial_backoff_ms: 1_000,
            ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub max_attempts: u32,
    /// Attempt `n` waits `backoff_base^n` units.
    pub backoff_base: u32,
    pub backoff_unit_ms: u64,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            max_attempts: 3,
            backoff_base: 2,
            backoff_unit_ms: 1_000,
            timeout_secs: 10,
        }
    }
}

impl BillfetchConfig {
    /// Load from `path`, or from `billfetch.toml` in the working directory.
    /// Falls back to defaults if the file does not exist, then applies
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    fn load_with(path: Option<&Path>, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<BillfetchConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env(var)?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var("WEBDRIVER_URL") {
            self.browser.webdriver_url = url;
        }
        if let Some(url) = var("REDIS_URL") {
            self.status.redis_url = url;
        }
        if let Some(url) = var("WEBHOOK_URL") {
            self.notify.webhook_url = Some(url);
        }
        if let Some(bucket) = var("AWS_BUCKET_NAME") {
            self.storage.bucket = bucket;
        }
        if let Some(region) = var("AWS_REGION") {
            self.storage.region = Some(region);
        }
        if let Some(endpoint) = var("S3_ENDPOINT_URL") {
            self.storage.endpoint_url = Some(endpoint);
        }
        if let Some(pages) = var("MAX_PAGES") {
            self.portal.max_pages = pages
                .parse()
                .with_context(|| format!("MAX_PAGES must be a page count, got {pages:?}"))?;
        }
        Ok(())
    }
}
