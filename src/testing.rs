//! In-process doubles for the browser, object storage and status store seams.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::browser::{BrowserError, BrowserSession, DownloadEvent, DownloadFeed, OpenedSession, SessionFactory};
use crate::carrier::{Carrier, PortalProfile};
use crate::selector::{Locator, SelectorChain};
use crate::state_machine::JobStatus;
use crate::status::{StatusStore, StatusStoreError};
use crate::storage::{CompletedChunk, ObjectStore, StorageError, StorageErrorKind};

/// A profile whose chains each hold one short CSS locator.
pub fn test_profile() -> PortalProfile {
    let chain = |target: &str, raw: &str| SelectorChain::new(target, raw, &[]);
    PortalProfile {
        carrier: Carrier::Ups,
        login_url: "https://portal.test/login".to_string(),
        username: chain("username", "#user"),
        password: chain("password", "#pass"),
        nav_toggle: chain("nav toggle", "#nav"),
        invoices_link: chain("invoices", "#invoices"),
        first_item: chain("first item", "#first"),
        modal_close: chain("modal close", "#modal-close"),
        next_page: chain("next page", "#next"),
        download_button: chain("download", "#download"),
        download_option: chain("download option", "#csv"),
        confirm_download: chain("confirm", "#confirm"),
        item_checkbox: Locator::parse(".row-check"),
    }
}

/// Every element a login-to-download run needs, except the next button.
pub const FULL_PAGE: &[&str] = &[
    "#user",
    "#pass",
    "#nav",
    "#invoices",
    "#first",
    "#modal-close",
    "#download",
    "#csv",
    "#confirm",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Goto(String),
    WaitFor(String),
    Click(String),
    Type(String, String),
    Count(String),
    ClickNth(String, usize),
    Screenshot,
    Close,
}

#[derive(Debug, Default)]
struct Script {
    present: HashSet<String>,
    click_failures: HashMap<String, u32>,
    next_locator: Option<String>,
    page_counts: Vec<usize>,
    page: usize,
    failing_count: bool,
    panicking_count: bool,
    failing_screenshot: bool,
    actions: Vec<Action>,
    closed: bool,
}

impl Script {
    fn next_available(&self, locator: &str) -> bool {
        self.next_locator.as_deref() == Some(locator) && self.page + 1 < self.page_counts.len()
    }

    fn visible(&self, locator: &str) -> bool {
        self.present.contains(locator) || self.next_available(locator)
    }
}

/// A browser session that plays back a fixed page layout.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSession {
    script: Arc<Mutex<Script>>,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_present<'a>(self, locators: impl IntoIterator<Item = &'a str>) -> Self {
        {
            let mut script = self.script.lock().unwrap();
            script.present.extend(locators.into_iter().map(str::to_string));
        }
        self
    }

    /// The first `times` clicks on `locator` fail.
    pub fn with_click_failures(self, locator: &str, times: u32) -> Self {
        self.script
            .lock()
            .unwrap()
            .click_failures
            .insert(locator.to_string(), times);
        self
    }

    /// One entry per result page: how many row checkboxes it shows. `next`
    /// is visible on every page but the last and clicking it turns the page.
    pub fn with_pages(self, next: &str, counts: Vec<usize>) -> Self {
        {
            let mut script = self.script.lock().unwrap();
            script.next_locator = Some(next.to_string());
            script.page_counts = counts;
        }
        self
    }

    pub fn failing_count(self) -> Self {
        self.script.lock().unwrap().failing_count = true;
        self
    }

    /// Counting rows panics, as a bug in a session backend would.
    pub fn panicking_count(self) -> Self {
        self.script.lock().unwrap().panicking_count = true;
        self
    }

    pub fn failing_screenshot(self) -> Self {
        self.script.lock().unwrap().failing_screenshot = true;
        self
    }

    /// A view that stays readable after the session is boxed and moved.
    pub fn observer(&self) -> SessionObserver {
        SessionObserver {
            script: Arc::clone(&self.script),
        }
    }

    fn record(&self, action: Action) -> std::sync::MutexGuard<'_, Script> {
        let mut script = self.script.lock().unwrap();
        script.actions.push(action);
        script
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        self.record(Action::Goto(url.to_string()));
        Ok(())
    }

    async fn wait_for(&self, locator: &Locator, _timeout: Duration) -> Result<bool, BrowserError> {
        let script = self.record(Action::WaitFor(locator.to_string()));
        Ok(script.visible(locator.as_str()))
    }

    async fn click(&self, locator: &Locator) -> Result<(), BrowserError> {
        let mut script = self.record(Action::Click(locator.to_string()));
        let raw = locator.as_str();
        if !script.visible(raw) {
            return Err(BrowserError::NoSuchElement(raw.to_string()));
        }
        if let Some(remaining) = script.click_failures.get_mut(raw)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(BrowserError::Protocol {
                status: 400,
                error: "element click intercepted".into(),
                message: format!("{raw} is covered"),
            });
        }
        if script.next_available(raw) {
            script.page += 1;
        }
        Ok(())
    }

    async fn type_text(&self, locator: &Locator, text: &str) -> Result<(), BrowserError> {
        let script = self.record(Action::Type(locator.to_string(), text.to_string()));
        if !script.visible(locator.as_str()) {
            return Err(BrowserError::NoSuchElement(locator.to_string()));
        }
        Ok(())
    }

    async fn count(&self, locator: &Locator) -> Result<usize, BrowserError> {
        let script = self.record(Action::Count(locator.to_string()));
        if script.panicking_count {
            drop(script);
            panic!("row count overflowed");
        }
        if script.failing_count {
            return Err(BrowserError::Protocol {
                status: 500,
                error: "unknown error".into(),
                message: "renderer crashed".into(),
            });
        }
        Ok(script.page_counts.get(script.page).copied().unwrap_or(0))
    }

    async fn click_nth(&self, locator: &Locator, index: usize) -> Result<(), BrowserError> {
        let script = self.record(Action::ClickNth(locator.to_string(), index));
        let count = script.page_counts.get(script.page).copied().unwrap_or(0);
        if index >= count {
            return Err(BrowserError::IndexOutOfRange {
                locator: locator.to_string(),
                index,
                count,
            });
        }
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        let script = self.record(Action::Screenshot);
        if script.failing_screenshot {
            return Err(BrowserError::SessionClosed);
        }
        Ok(b"\x89PNG\r\n\x1a\n".to_vec())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let mut script = self.record(Action::Close);
        script.closed = true;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionObserver {
    script: Arc<Mutex<Script>>,
}

impl SessionObserver {
    pub fn actions(&self) -> Vec<Action> {
        self.script.lock().unwrap().actions.clone()
    }

    pub fn waits(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::WaitFor(l) => Some(l),
                _ => None,
            })
            .collect()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::Click(l) => Some(l),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.script.lock().unwrap().closed
    }
}

/// Hands out one scripted session. Queued downloads are written to a
/// staging directory and announced as soon as the session opens.
pub struct ScriptedFactory {
    session: Mutex<Option<ScriptedSession>>,
    downloads: Vec<(String, Vec<u8>)>,
    fail_open: bool,
    panic_open: bool,
    staging: TempDir,
}

impl ScriptedFactory {
    pub fn new(session: ScriptedSession) -> Self {
        Self {
            session: Mutex::new(Some(session)),
            downloads: Vec::new(),
            fail_open: false,
            panic_open: false,
            staging: TempDir::new().unwrap(),
        }
    }

    pub fn with_download(mut self, name: &str, contents: &[u8]) -> Self {
        self.downloads.push((name.to_string(), contents.to_vec()));
        self
    }

    pub fn failing_open() -> Self {
        let mut factory = Self::new(ScriptedSession::new());
        factory.fail_open = true;
        factory
    }

    pub fn panicking_open() -> Self {
        let mut factory = Self::new(ScriptedSession::new());
        factory.panic_open = true;
        factory
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn open(&self, _job_id: &str) -> Result<OpenedSession, BrowserError> {
        if self.panic_open {
            panic!("browser pool exhausted");
        }
        if self.fail_open {
            return Err(BrowserError::Protocol {
                status: 500,
                error: "session not created".into(),
                message: "no browser available".into(),
            });
        }
        let session = self
            .session
            .lock()
            .unwrap()
            .take()
            .ok_or(BrowserError::SessionClosed)?;

        let (tx, rx) = mpsc::channel(self.downloads.len().max(1));
        for (name, contents) in &self.downloads {
            let source = self.staging.path().join(name);
            std::fs::write(&source, contents)?;
            tx.send(DownloadEvent {
                suggested_name: name.clone(),
                source,
            })
            .await
            .unwrap();
        }

        Ok(OpenedSession {
            session: Box::new(session),
            downloads: DownloadFeed::new(rx),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Put(String),
    Create(String),
    Part(String, i32),
    Complete(String, Vec<i32>),
    Abort(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FailPoint {
    Put,
    Part(i32),
    Complete,
}

#[derive(Debug, Default)]
struct StoreState {
    calls: Vec<StoreCall>,
    objects: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, BTreeMap<i32, Vec<u8>>>,
    failures: HashMap<(String, FailPoint), VecDeque<StorageErrorKind>>,
    next_upload: u32,
}

impl StoreState {
    fn take_failure(&mut self, key: &str, point: FailPoint) -> Result<(), StorageError> {
        match self
            .failures
            .get_mut(&(key.to_string(), point))
            .and_then(VecDeque::pop_front)
        {
            Some(kind) => Err(StorageError::new(kind, format!("scripted {kind:?} failure"))),
            None => Ok(()),
        }
    }
}

/// An object store held in memory, with scripted failures per call site.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    state: Mutex<StoreState>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `kinds.len()` single-shot puts of `key` fail, in order.
    pub fn fail_put(self, key: &str, kinds: &[StorageErrorKind]) -> Self {
        self.script(key, FailPoint::Put, kinds)
    }

    pub fn fail_part(self, key: &str, part_number: i32, kinds: &[StorageErrorKind]) -> Self {
        self.script(key, FailPoint::Part(part_number), kinds)
    }

    pub fn fail_complete(self, key: &str, kind: StorageErrorKind) -> Self {
        self.script(key, FailPoint::Complete, &[kind])
    }

    fn script(self, key: &str, point: FailPoint, kinds: &[StorageErrorKind]) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry((key.to_string(), point))
            .or_default()
            .extend(kinds.iter().copied());
        self
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().unwrap().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Multi-part sessions neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StoreCall::Put(key.to_string()));
        state.take_failure(key, FailPoint::Put)?;
        state.objects.insert(key.to_string(), body.to_vec());
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> Result<String, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StoreCall::Create(key.to_string()));
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(upload_id.clone(), BTreeMap::new());
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StoreCall::Part(key.to_string(), part_number));
        state.take_failure(key, FailPoint::Part(part_number))?;
        let parts = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::new(StorageErrorKind::Validation, "no such upload"))?;
        parts.insert(part_number, body.to_vec());
        Ok(format!("etag-{part_number}"))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedChunk],
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StoreCall::Complete(
            key.to_string(),
            parts.iter().map(|p| p.part_number).collect(),
        ));
        state.take_failure(key, FailPoint::Complete)?;
        let chunks = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StorageError::new(StorageErrorKind::Validation, "no such upload"))?;
        let body = chunks.into_values().flatten().collect();
        state.objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(StoreCall::Abort(key.to_string()));
        state.uploads.remove(upload_id);
        Ok(())
    }

    fn location(&self, key: &str) -> String {
        format!("memory://test-bucket/{key}")
    }
}

/// Records every status write; optionally every write fails after being
/// recorded.
#[derive(Debug, Default)]
pub struct RecordingStatusStore {
    writes: Mutex<Vec<(String, JobStatus)>>,
    failing: bool,
}

impl RecordingStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn statuses(&self, job_id: &str) -> Vec<JobStatus> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, status)| *status)
            .collect()
    }

    fn unavailable() -> StatusStoreError {
        StatusStoreError::Command(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection reset",
        )))
    }
}

#[async_trait]
impl StatusStore for RecordingStatusStore {
    async fn set(&self, job_id: &str, status: JobStatus) -> Result<(), StatusStoreError> {
        self.writes
            .lock()
            .unwrap()
            .push((job_id.to_string(), status));
        if self.failing {
            return Err(Self::unavailable());
        }
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobStatus>, StatusStoreError> {
        if self.failing {
            return Err(Self::unavailable());
        }
        Ok(self.statuses(job_id).last().copied())
    }

    async fn delete(&self, job_id: &str) -> Result<(), StatusStoreError> {
        if self.failing {
            return Err(Self::unavailable());
        }
        self.writes.lock().unwrap().retain(|(id, _)| id != job_id);
        Ok(())
    }
}
