use std::io;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::pacing::Pacer;
use crate::browser::{
    BrowserError, BrowserSession, DownloadArtifact, DownloadCollector, DownloadFeed, ENTER_KEY, OpenedSession,
    SessionFactory,
};
use crate::error::panic_message;
use crate::carrier::{Credentials, PortalProfile};
use crate::config::PortalConfig;
use crate::retry::{Backoff, RetryPolicy};
use crate::selector::{ResolveError, ResolvePolicy, SelectorChain, SelectorResolver};
use crate::state_machine::{PortalMachine, PortalState, TransitionError};

#[derive(Debug, Error)]
pub enum AutomationCause {
    #[error(transparent)]
    Resolution(#[from] ResolveError),

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error("local filesystem error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("automation panicked: {0}")]
    Panicked(String),
}

impl AutomationCause {
    /// Whether the browser service gave up waiting, as opposed to the page
    /// not matching what the profile expects.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AutomationCause::Browser(err) if err.is_timeout())
    }
}

/// A portal session that could not finish, tagged with the phase it was in.
#[derive(Debug, Error)]
#[error("automation failed during {phase}: {cause}")]
pub struct AutomationError {
    pub phase: PortalState,
    #[source]
    pub cause: AutomationCause,
}

impl AutomationError {
    fn new(phase: PortalState, cause: impl Into<AutomationCause>) -> Self {
        Self {
            phase,
            cause: cause.into(),
        }
    }
}

/// Local directories owned by one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWorkspace {
    pub root: PathBuf,
    /// Validated downloads, and nothing else: this is what gets uploaded.
    pub downloads: PathBuf,
    /// Page snapshots taken at checkpoints.
    pub diagnostics: PathBuf,
}

impl JobWorkspace {
    pub fn new(download_root: &Path, job_id: &str) -> Self {
        let root = download_root.join(job_id);
        Self {
            downloads: root.join("downloads"),
            diagnostics: root.join("diagnostics"),
            root,
        }
    }
}

/// What a finished session left behind.
#[derive(Debug)]
pub struct AutomationRun {
    pub download_dir: PathBuf,
    pub artifacts: Vec<DownloadArtifact>,
    pub pages_visited: u32,
    pub trail: Vec<PortalState>,
}

/// Drives one carrier portal from sign-in to bulk download.
pub struct PortalAutomationEngine {
    profile: PortalProfile,
    resolver: SelectorResolver,
    pacer: Pacer,
    max_pages: u32,
    download_quiet: Duration,
    download_max_wait: Duration,
    snapshots: bool,
}

impl PortalAutomationEngine {
    pub fn new(profile: PortalProfile, config: &PortalConfig) -> Self {
        let resolver = SelectorResolver::new(ResolvePolicy {
            timeout: Duration::from_millis(config.selector_timeout_ms),
            retry: RetryPolicy::new(
                config.selector_attempts,
                Backoff::Fixed(Duration::from_millis(config.selector_retry_delay_ms)),
            ),
        });
        Self {
            profile,
            resolver,
            pacer: Pacer::new(config.pacing.clone()),
            max_pages: config.max_pages,
            download_quiet: Duration::from_millis(config.download_quiet_ms),
            download_max_wait: Duration::from_millis(config.download_max_wait_ms),
            snapshots: config.snapshots,
        }
    }

    pub fn profile(&self) -> &PortalProfile {
        &self.profile
    }

    /// Run one full session. The browser session is closed before this
    /// returns, whichever way it returns.
    pub async fn run(
        &self,
        factory: &dyn SessionFactory,
        job_id: &str,
        credentials: &Credentials,
        workspace: &JobWorkspace,
    ) -> Result<AutomationRun, AutomationError> {
        let mut machine = PortalMachine::new();
        let mut collector = DownloadCollector::create(&workspace.downloads)
            .await
            .map_err(|err| AutomationError::new(machine.fail(), err))?;

        let OpenedSession {
            session,
            mut downloads,
        } = factory
            .open(job_id)
            .await
            .map_err(|err| AutomationError::new(machine.fail(), err))?;
        info!(job_id, carrier = %self.profile.carrier, "browser session opened");

        let outcome = AssertUnwindSafe(self.drive(
            session.as_ref(),
            &mut machine,
            &mut downloads,
            &mut collector,
            credentials,
            workspace,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(AutomationCause::Panicked(panic_message(payload.as_ref()))));

        match session.close().await {
            Ok(()) => info!(job_id, "browser session released"),
            Err(err) => error!(job_id, error = %err, "browser session could not be released"),
        }

        match outcome {
            Ok(pages_visited) => Ok(AutomationRun {
                download_dir: collector.dir().to_path_buf(),
                pages_visited,
                trail: machine.trail(),
                artifacts: collector.into_artifacts(),
            }),
            Err(cause) => {
                let phase = machine.fail();
                error!(job_id, %phase, timeout = cause.is_timeout(), error = %cause, "portal automation failed");
                Err(AutomationError { phase, cause })
            }
        }
    }

    async fn drive(
        &self,
        session: &dyn BrowserSession,
        machine: &mut PortalMachine,
        downloads: &mut DownloadFeed,
        collector: &mut DownloadCollector,
        credentials: &Credentials,
        workspace: &JobWorkspace,
    ) -> Result<u32, AutomationCause> {
        let profile = &self.profile;

        machine.advance(PortalState::NavigateLogin)?;
        info!(phase = %machine.state(), "navigating to sign-in page");
        session.goto(&profile.login_url).await?;

        machine.advance(PortalState::SubmitCredentials)?;
        self.enter_field(session, &profile.username, &credentials.username)
            .await?;
        self.pacer.after_username().await;
        self.enter_field(session, &profile.password, &credentials.password)
            .await?;
        self.pacer.after_password().await;

        machine.advance(PortalState::Authenticated)?;
        info!(phase = %machine.state(), "credentials submitted");

        machine.advance(PortalState::LocateTargetSection)?;
        self.soft_click(session, &profile.nav_toggle).await;
        self.resolver.click(session, &profile.invoices_link).await?;

        machine.advance(PortalState::SelectItems)?;
        self.resolver.click(session, &profile.first_item).await?;
        self.snapshot(session, workspace, "after-first-selection").await;
        self.soft_click(session, &profile.modal_close).await;
        let pages_visited = self.select_all_pages(session).await?;

        machine.advance(PortalState::TriggerDownload)?;
        self.resolver.click(session, &profile.download_button).await?;
        self.soft_click(session, &profile.download_option).await;
        self.resolver.click(session, &profile.confirm_download).await?;
        let handled = collector
            .drain(downloads, self.download_quiet, self.download_max_wait)
            .await;
        info!(
            phase = %machine.state(),
            handled,
            saved = collector.artifacts().len(),
            dropped = collector.dropped(),
            "downloads collected"
        );
        self.snapshot(session, workspace, "final").await;

        machine.advance(PortalState::Done)?;
        Ok(pages_visited)
    }

    /// Type into a field one character at a time, then press Enter.
    async fn enter_field(
        &self,
        session: &dyn BrowserSession,
        chain: &SelectorChain,
        text: &str,
    ) -> Result<(), AutomationCause> {
        let field = self.resolver.resolve(session, chain).await?.locator;
        let mut buf = [0u8; 4];
        for ch in text.chars() {
            session.type_text(&field, ch.encode_utf8(&mut buf)).await?;
            self.pacer.keystroke().await;
        }
        session.type_text(&field, ENTER_KEY).await?;
        debug!(element = chain.target(), "field submitted");
        Ok(())
    }

    /// Click an element that only some layouts show.
    async fn soft_click(&self, session: &dyn BrowserSession, chain: &SelectorChain) -> bool {
        match self.resolver.click(session, chain).await {
            Ok(resolved) => {
                debug!(element = chain.target(), index = resolved.index, "optional element clicked");
                true
            }
            Err(err) => {
                info!(element = chain.target(), error = %err, "optional element absent, skipping");
                false
            }
        }
    }

    /// Select every row on every page, up to the page limit. A missing
    /// next-page control is the normal end of the listing.
    async fn select_all_pages(&self, session: &dyn BrowserSession) -> Result<u32, AutomationCause> {
        let mut visited = 0;
        while visited < self.max_pages {
            // The first row of the first page was already selected.
            self.select_page(session, visited + 1, visited == 0).await?;
            visited += 1;

            if visited == self.max_pages {
                info!(max_pages = self.max_pages, "page limit reached");
                break;
            }
            if let Err(err) = self.resolver.click(session, &self.profile.next_page).await {
                info!(page = visited, "no next page, last page reached");
                debug!(error = %err, "next page lookup");
                break;
            }
            self.pacer.page_turn().await;
        }
        Ok(visited)
    }

    async fn select_page(&self, session: &dyn BrowserSession, page: u32, skip_first: bool) -> Result<(), AutomationCause> {
        let checkbox = &self.profile.item_checkbox;
        let count = session.count(checkbox).await?;
        let mut selected = 0;
        for index in usize::from(skip_first)..count {
            match session.click_nth(checkbox, index).await {
                Ok(()) => selected += 1,
                Err(err) => warn!(page, index, error = %err, "failed to select item"),
            }
        }
        info!(page, count, selected, "page selected");
        Ok(())
    }

    /// Save a page snapshot. Never fails the run.
    async fn snapshot(&self, session: &dyn BrowserSession, workspace: &JobWorkspace, label: &str) {
        if !self.snapshots {
            return;
        }
        let path = workspace.diagnostics.join(format!("{label}.png"));
        let saved = async {
            let png = session.screenshot().await?;
            tokio::fs::create_dir_all(&workspace.diagnostics).await?;
            tokio::fs::write(&path, png).await?;
            Ok::<(), AutomationCause>(())
        }
        .await;
        match saved {
            Ok(()) => debug!(file = %path.display(), "snapshot saved"),
            Err(err) => warn!(label, error = %err, "snapshot failed, continuing"),
        }
    }
}
