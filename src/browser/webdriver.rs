//! A W3C WebDriver client for a remote browser-automation service.
//!
//! Only the handful of commands the portal engine needs are implemented.
//! Downloads are observed through the browser's download directory: the
//! factory points Chrome at a per-job staging directory and a watcher task
//! turns finished files into [`DownloadEvent`](super::DownloadEvent)s.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Method, Response};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::download::spawn_staging_watcher;
use super::error::BrowserError;
use super::session::{BrowserSession, DownloadFeed, OpenedSession, SessionFactory};
use crate::config::BrowserConfig;
use crate::retry::{Backoff, RetryPolicy};
use crate::selector::Locator;

/// Key under which W3C WebDriver returns element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52f-4a8e9e7f4e4f";

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct WebDriverSession {
    client: Client,
    base_url: String,
    session_id: String,
    close_policy: RetryPolicy,
    closed: AtomicBool,
}

impl WebDriverSession {
    /// Create a new remote session with the given `alwaysMatch` capabilities.
    pub async fn start(base_url: &str, capabilities: Value) -> Result<Self, BrowserError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;
        let base_url = base_url.trim_end_matches('/').to_string();

        let response = client
            .post(format!("{base_url}/session"))
            .json(&json!({ "capabilities": { "alwaysMatch": capabilities } }))
            .send()
            .await?;
        let value = read_value(response).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::MalformedResponse("new session without sessionId".into()))?
            .to_string();

        info!(%session_id, "webdriver session started");
        Ok(Self {
            client,
            base_url,
            session_id,
            close_policy: RetryPolicy::new(3, Backoff::Fixed(Duration::from_secs(1))),
            closed: AtomicBool::new(false),
        })
    }

    /// Attempts and delay used when releasing the session.
    pub fn with_close_policy(mut self, policy: RetryPolicy) -> Self {
        self.close_policy = policy;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn url(&self, path: &str) -> String {
        if path.is_empty() {
            format!("{}/session/{}", self.base_url, self.session_id)
        } else {
            format!("{}/session/{}/{}", self.base_url, self.session_id, path)
        }
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, BrowserError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrowserError::SessionClosed);
        }
        let mut request = self.client.request(method, self.url(path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        read_value(request.send().await?).await
    }

    async fn find_one(&self, locator: &Locator) -> Result<Option<String>, BrowserError> {
        let query = json!({ "using": locator.strategy(), "value": locator.as_str() });
        match self.command(Method::POST, "element", Some(query)).await {
            Ok(value) => element_id(&value).map(Some),
            Err(BrowserError::Protocol { error, .. }) if error == "no such element" => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn find_all(&self, locator: &Locator) -> Result<Vec<String>, BrowserError> {
        let query = json!({ "using": locator.strategy(), "value": locator.as_str() });
        let value = self.command(Method::POST, "elements", Some(query)).await?;
        let items = value
            .as_array()
            .ok_or_else(|| BrowserError::MalformedResponse("element list is not an array".into()))?;
        items.iter().map(element_id).collect()
    }

    async fn require(&self, locator: &Locator) -> Result<String, BrowserError> {
        self.find_one(locator)
            .await?
            .ok_or_else(|| BrowserError::NoSuchElement(locator.to_string()))
    }

    /// One DELETE of the session. A session the service no longer knows
    /// about is already released.
    async fn delete_session(&self) -> Result<(), BrowserError> {
        let response = self.client.delete(self.url("")).send().await?;
        match read_value(response).await {
            Ok(_) => Ok(()),
            Err(BrowserError::Protocol { error, .. }) if error == "invalid session id" => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn click_element(&self, element: &str) -> Result<(), BrowserError> {
        self.command(Method::POST, &format!("element/{element}/click"), Some(json!({})))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        debug!(url, "navigating");
        self.command(Method::POST, "url", Some(json!({ "url": url })))
            .await?;
        Ok(())
    }

    async fn wait_for(&self, locator: &Locator, timeout: Duration) -> Result<bool, BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.find_one(locator).await?.is_some() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn click(&self, locator: &Locator) -> Result<(), BrowserError> {
        let element = self.require(locator).await?;
        self.click_element(&element).await
    }

    async fn type_text(&self, locator: &Locator, text: &str) -> Result<(), BrowserError> {
        let element = self.require(locator).await?;
        self.command(
            Method::POST,
            &format!("element/{element}/value"),
            Some(json!({ "text": text })),
        )
        .await?;
        Ok(())
    }

    async fn count(&self, locator: &Locator) -> Result<usize, BrowserError> {
        Ok(self.find_all(locator).await?.len())
    }

    async fn click_nth(&self, locator: &Locator, index: usize) -> Result<(), BrowserError> {
        let elements = self.find_all(locator).await?;
        let element = elements.get(index).ok_or_else(|| BrowserError::IndexOutOfRange {
            locator: locator.to_string(),
            index,
            count: elements.len(),
        })?;
        self.click_element(element).await
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        let value = self.command(Method::GET, "screenshot", None).await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| BrowserError::MalformedResponse("screenshot is not a string".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| BrowserError::MalformedResponse(format!("screenshot is not base64: {e}")))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut attempt = 1;
        loop {
            match self.delete_session().await {
                Ok(()) => {
                    self.closed.store(true, Ordering::SeqCst);
                    info!(session_id = %self.session_id, attempt, "webdriver session closed");
                    return Ok(());
                }
                Err(err) if self.close_policy.allows_retry_after(attempt) => {
                    warn!(session_id = %self.session_id, attempt, error = %err, "closing webdriver session failed, retrying");
                    sleep(self.close_policy.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Unwrap the `value` member of a WebDriver response, mapping error
/// payloads to [`BrowserError::Protocol`].
async fn read_value(response: Response) -> Result<Value, BrowserError> {
    let status = response.status();
    let text = response.text().await?;
    let value = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(mut body)) => body.remove("value").unwrap_or(Value::Null),
        Ok(_) => Value::Null,
        Err(_) if status.is_success() => {
            return Err(BrowserError::MalformedResponse(format!("non-JSON body: {text}")));
        }
        Err(_) => {
            return Err(BrowserError::Protocol {
                status: status.as_u16(),
                error: "unknown error".into(),
                message: text,
            });
        }
    };

    if status.is_success() {
        return Ok(value);
    }
    let error = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Err(BrowserError::Protocol {
        status: status.as_u16(),
        error,
        message,
    })
}

fn element_id(value: &Value) -> Result<String, BrowserError> {
    value
        .get(ELEMENT_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BrowserError::MalformedResponse("missing element reference".into()))
}

/// Chrome capabilities that send downloads to `download_dir` without prompting.
pub fn chrome_capabilities(download_dir: &Path, headless: bool) -> Value {
    let mut args = vec![
        "--window-size=1920,1080".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
    ];
    if headless {
        args.push("--headless=new".to_string());
    }
    json!({
        "browserName": "chrome",
        "goog:chromeOptions": {
            "args": args,
            "prefs": {
                "download.default_directory": download_dir.display().to_string(),
                "download.prompt_for_download": false,
                "download.directory_upgrade": true,
                "safebrowsing.enabled": true,
            }
        }
    })
}

/// Opens one WebDriver session per job, each with its own staging directory.
pub struct WebDriverFactory {
    webdriver_url: String,
    staging_root: PathBuf,
    headless: bool,
    watch_interval: Duration,
    close_policy: RetryPolicy,
}

impl WebDriverFactory {
    pub fn new(config: &BrowserConfig) -> Self {
        Self {
            webdriver_url: config.webdriver_url.clone(),
            staging_root: config.staging_root.clone(),
            headless: config.headless,
            watch_interval: Duration::from_millis(config.watch_interval_ms),
            close_policy: RetryPolicy::new(
                config.close_attempts,
                Backoff::Fixed(Duration::from_millis(config.close_retry_delay_ms)),
            ),
        }
    }
}

#[async_trait]
impl SessionFactory for WebDriverFactory {
    async fn open(&self, job_id: &str) -> Result<OpenedSession, BrowserError> {
        let staging = self.staging_root.join(job_id);
        tokio::fs::create_dir_all(&staging).await?;
        let staging = tokio::fs::canonicalize(&staging).await?;

        let session = WebDriverSession::start(&self.webdriver_url, chrome_capabilities(&staging, self.headless))
            .await?
            .with_close_policy(self.close_policy);

        let (tx, rx) = mpsc::channel(64);
        let downloads = DownloadFeed::new(rx);
        spawn_staging_watcher(staging, tx, downloads.in_flight.clone(), self.watch_interval);

        Ok(OpenedSession {
            session: Box::new(session),
            downloads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn server_with_session() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { "sessionId": "s1", "capabilities": {} }
            })))
            .mount(&server)
            .await;
        server
    }

    fn element(id: &str) -> Value {
        json!({ ELEMENT_KEY: id })
    }

    fn no_such_element() -> ResponseTemplate {
        ResponseTemplate::new(404).set_body_json(json!({
            "value": { "error": "no such element", "message": "Unable to locate element", "stacktrace": "" }
        }))
    }

    #[tokio::test]
    async fn start_reads_session_id() {
        let server = server_with_session().await;
        let session = WebDriverSession::start(&server.uri(), json!({})).await.unwrap();
        assert_eq!(session.session_id(), "s1");
    }

    #[tokio::test]
    async fn start_surfaces_session_not_created() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "value": { "error": "session not created", "message": "no free slots" }
            })))
            .mount(&server)
            .await;

        let err = WebDriverSession::start(&server.uri(), json!({})).await.err().unwrap();
        match err {
            BrowserError::Protocol { status, error, message } => {
                assert_eq!(status, 500);
                assert_eq!(error, "session not created");
                assert_eq!(message, "no free slots");
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn goto_posts_url() {
        let server = server_with_session().await;
        Mock::given(method("POST"))
            .and(path("/session/s1/url"))
            .and(body_json(json!({ "url": "https://portal.example/login" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;

        let session = WebDriverSession::start(&server.uri(), json!({})).await.unwrap();
        session.goto("https://portal.example/login").await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_reports_missing_element_as_false() {
        let server = server_with_session().await;
        Mock::given(method("POST"))
            .and(path("/session/s1/element"))
            .respond_with(no_such_element())
            .mount(&server)
            .await;

        let session = WebDriverSession::start(&server.uri(), json!({})).await.unwrap();
        let found = session
            .wait_for(&Locator::parse("#email"), Duration::ZERO)
            .await
            .unwrap();
        assert!(!found);
    }

    #[tokio::test]
    async fn wait_for_sends_strategy_and_finds_element() {
        let server = server_with_session().await;
        Mock::given(method("POST"))
            .and(path("/session/s1/element"))
            .and(body_json(json!({ "using": "xpath", "value": "//input[@id='email']" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": element("e1") })))
            .mount(&server)
            .await;

        let session = WebDriverSession::start(&server.uri(), json!({})).await.unwrap();
        let found = session
            .wait_for(&Locator::parse("//input[@id='email']"), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(found);
    }

    #[tokio::test]
    async fn type_text_sends_value_to_element() {
        let server = server_with_session().await;
        Mock::given(method("POST"))
            .and(path("/session/s1/element"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": element("e7") })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/s1/element/e7/value"))
            .and(body_json(json!({ "text": "a" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;

        let session = WebDriverSession::start(&server.uri(), json!({})).await.unwrap();
        session.type_text(&Locator::parse("#email"), "a").await.unwrap();
    }

    #[tokio::test]
    async fn click_on_missing_element_is_no_such_element() {
        let server = server_with_session().await;
        Mock::given(method("POST"))
            .and(path("/session/s1/element"))
            .respond_with(no_such_element())
            .mount(&server)
            .await;

        let session = WebDriverSession::start(&server.uri(), json!({})).await.unwrap();
        let err = session.click(&Locator::parse(".next")).await.unwrap_err();
        assert!(matches!(err, BrowserError::NoSuchElement(ref l) if l == ".next"));
    }

    #[tokio::test]
    async fn count_and_click_nth() {
        let server = server_with_session().await;
        Mock::given(method("POST"))
            .and(path("/session/s1/elements"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "value": [element("a"), element("b")] })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/s1/element/b/click"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;

        let session = WebDriverSession::start(&server.uri(), json!({})).await.unwrap();
        let rows = Locator::parse("table tbody tr td input[type='checkbox']");
        assert_eq!(session.count(&rows).await.unwrap(), 2);
        session.click_nth(&rows, 1).await.unwrap();

        let err = session.click_nth(&rows, 5).await.unwrap_err();
        assert!(matches!(err, BrowserError::IndexOutOfRange { index: 5, count: 2, .. }));
    }

    #[tokio::test]
    async fn screenshot_is_base64_decoded() {
        let server = server_with_session().await;
        let png = b"\x89PNG\r\n";
        Mock::given(method("GET"))
            .and(path("/session/s1/screenshot"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": base64::engine::general_purpose::STANDARD.encode(png)
            })))
            .mount(&server)
            .await;

        let session = WebDriverSession::start(&server.uri(), json!({})).await.unwrap();
        assert_eq!(session.screenshot().await.unwrap(), png.to_vec());
    }

    #[tokio::test]
    async fn close_deletes_session_once() {
        let server = server_with_session().await;
        Mock::given(method("DELETE"))
            .and(path("/session/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;

        let session = WebDriverSession::start(&server.uri(), json!({})).await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();

        let err = session.goto("https://portal.example").await.unwrap_err();
        assert!(matches!(err, BrowserError::SessionClosed));
    }

    fn quick_close(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Backoff::Fixed(Duration::ZERO))
    }

    fn delete_fails() -> ResponseTemplate {
        ResponseTemplate::new(500).set_body_json(json!({
            "value": { "error": "unknown error", "message": "browser busy" }
        }))
    }

    #[tokio::test]
    async fn close_retries_failed_delete() {
        let server = server_with_session().await;
        Mock::given(method("DELETE"))
            .and(path("/session/s1"))
            .respond_with(delete_fails())
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/session/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;

        let session = WebDriverSession::start(&server.uri(), json!({}))
            .await
            .unwrap()
            .with_close_policy(quick_close(3));
        session.close().await.unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_close_stays_open_for_another_try() {
        let server = server_with_session().await;
        Mock::given(method("DELETE"))
            .and(path("/session/s1"))
            .respond_with(delete_fails())
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/session/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;

        let session = WebDriverSession::start(&server.uri(), json!({}))
            .await
            .unwrap()
            .with_close_policy(quick_close(2));
        let err = session.close().await.unwrap_err();
        assert!(matches!(err, BrowserError::Protocol { status: 500, .. }));

        // The session was not released, so the next close sends another DELETE.
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_of_unknown_session_counts_as_released() {
        let server = server_with_session().await;
        Mock::given(method("DELETE"))
            .and(path("/session/s1"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "value": { "error": "invalid session id", "message": "session deleted" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let session = WebDriverSession::start(&server.uri(), json!({})).await.unwrap();
        session.close().await.unwrap();
    }

    #[test]
    fn chrome_capabilities_route_downloads() {
        let caps = chrome_capabilities(Path::new("/srv/staging/job-1"), true);
        let options = &caps["goog:chromeOptions"];
        assert_eq!(caps["browserName"], "chrome");
        assert_eq!(options["prefs"]["download.default_directory"], "/srv/staging/job-1");
        assert_eq!(options["prefs"]["download.prompt_for_download"], false);
        assert!(options["args"].as_array().unwrap().contains(&json!("--headless=new")));
    }

    #[test]
    fn chrome_capabilities_headed() {
        let caps = chrome_capabilities(Path::new("/tmp/d"), false);
        let args = caps["goog:chromeOptions"]["args"].as_array().unwrap();
        assert!(!args.contains(&json!("--headless=new")));
    }
}
