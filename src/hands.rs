use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Network::CookieParam;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::json;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::CaptureConfig;
use crate::dom;
use crate::session::{LoginDriver, LoginWindow, OriginStorage, SessionState, StoredCookie};
use crate::types::{Perception, parse_http_url};

#[derive(Error, Debug, Clone)]
pub enum ExecutorError {
    #[error("target not found: {0}")]
    TargetNotFound(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("browser failure: {0}")]
    Browser(String),
}

impl ExecutorError {
    /// Element lookups and timeouts are worth another attempt; a dead browser is not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ExecutorError::Browser(_))
    }
}

/// How to find the element an action applies to, in decreasing precision.
#[derive(Debug, Clone, PartialEq)]
pub enum Locator {
    /// CSS selector, normally the `data-eid` marker set by perception.
    Css(String),
    /// Visible label / placeholder text.
    Text(String),
    /// Viewport coordinates (bounding-box centre).
    Point { x: f64, y: f64 },
}

impl Locator {
    pub fn element_id(id: &str) -> Self {
        Locator::Css(format!("[data-eid=\"{}\"]", id))
    }
}

/// Capability interface over one live, task-owned browser context.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn navigate(&mut self, url: &str) -> Result<(), ExecutorError>;
    async fn click(&mut self, locator: &Locator) -> Result<(), ExecutorError>;
    async fn type_text(&mut self, locator: &Locator, text: &str) -> Result<(), ExecutorError>;
    async fn go_back(&mut self) -> Result<(), ExecutorError>;
    /// Wait until the document is loaded and the DOM stopped changing.
    async fn wait_for_settle(&mut self, timeout: Duration) -> Result<(), ExecutorError>;
    /// `Ok(false)` when the text never appeared within `timeout`.
    async fn wait_for_text(&mut self, text: &str, timeout: Duration) -> Result<bool, ExecutorError>;
    async fn screenshot(&mut self) -> Result<Vec<u8>, ExecutorError>;
    async fn extract_state(&mut self) -> Result<Perception, ExecutorError>;
    async fn close(&mut self);
}

/// Creates an isolated browser context pre-loaded with a session.
#[async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn open(&self, session: &SessionState) -> Result<Box<dyn ActionExecutor>, ExecutorError>;
}

/// Browser process plus the tab we drive. The profile directory is private
/// to this context and removed when it drops.
pub struct BrowserSession {
    _browser: Browser,
    pub tab: Arc<Tab>,
    _profile: tempfile::TempDir,
}

impl BrowserSession {
    pub fn launch(chrome_path: Option<PathBuf>, headless: bool) -> Result<Self> {
        let chrome_path = match chrome_path {
            Some(path) => path,
            None => find_chrome()?,
        };
        let profile = tempfile::Builder::new().prefix("capture-profile-").tempdir()?;

        let options = LaunchOptions {
            headless,
            path: Some(chrome_path),
            user_data_dir: Some(profile.path().to_path_buf()),
            window_size: Some((1920, 1080)),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(120),
            ..Default::default()
        };

        debug!(headless, "starting Chrome");
        let browser = Browser::new(options).map_err(|e| anyhow!("Browser launch failed: {}", e))?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;

        Ok(Self {
            _browser: browser,
            tab,
            _profile: profile,
        })
    }

    pub fn restore(&self, session: &SessionState) -> Result<()> {
        let cookies = session
            .cookies
            .iter()
            .map(cookie_param)
            .collect::<Result<Vec<_>>>()?;
        if !cookies.is_empty() {
            self.tab.set_cookies(cookies)?;
        }

        for origin in session.origins.iter().filter(|o| !o.entries.is_empty()) {
            self.tab.navigate_to(&origin.origin)?;
            self.tab.wait_until_navigated()?;
            let script = format!(
                "(() => {{ for (const [k, v] of {}) localStorage.setItem(k, v); return true; }})()",
                serde_json::to_string(&origin.entries)?
            );
            self.tab.evaluate(&script, false)?;
        }
        Ok(())
    }

    pub fn capture_state(&self) -> Result<SessionState> {
        let cookies = self
            .tab
            .get_cookies()?
            .into_iter()
            .filter_map(|c| serde_json::to_value(c).ok())
            .filter_map(|v| serde_json::from_value::<StoredCookie>(v).ok())
            .collect();

        let url = self.tab.get_url();
        let storage = self
            .tab
            .evaluate("JSON.stringify(Object.entries(localStorage))", false)
            .ok()
            .and_then(|r| r.value)
            .and_then(|v| v.as_str().map(String::from))
            .and_then(|s| serde_json::from_str::<Vec<(String, String)>>(&s).ok())
            .unwrap_or_default();
        let origins = url_origin(&url)
            .map(|origin| vec![OriginStorage { origin, entries: storage }])
            .unwrap_or_default();

        Ok(SessionState {
            cookies,
            origins,
            home_url: Some(url),
            saved_at: None,
        })
    }
}

/// CDP wants `CookieParam`; build it through serde so only protocol field
/// names matter.
fn cookie_param(cookie: &StoredCookie) -> Result<CookieParam> {
    let mut value = json!({
        "name": cookie.name,
        "value": cookie.value,
        "domain": cookie.domain,
        "path": cookie.path,
        "secure": cookie.secure,
        "httpOnly": cookie.http_only,
    });
    if let Some(expires) = cookie.expires.filter(|e| *e > 0.0) {
        value["expires"] = json!(expires);
    }
    if let Some(same_site) = &cookie.same_site {
        value["sameSite"] = json!(same_site);
    }
    serde_json::from_value(value).context("cookie could not be converted to CDP form")
}

fn url_origin(url: &str) -> Option<String> {
    parse_http_url(url).map(|u| u.origin().ascii_serialization())
}

/// Host without `www.`, explicit port and path without trailing slash.
/// Scheme, default ports, query and fragment do not identify a page.
fn page_key(url: &Url) -> (String, Option<u16>, String) {
    let host = url.host_str().unwrap_or_default();
    let host = host.strip_prefix("www.").unwrap_or(host).to_string();
    (host, url.port(), url.path().trim_end_matches('/').to_string())
}

/// True when `current` is a real page that is no longer the login page.
pub fn left_login_page(login_url: &str, current: &str) -> bool {
    let Some(current) = parse_http_url(current) else {
        return false;
    };
    match parse_http_url(login_url) {
        Some(login) => page_key(&login) != page_key(&current),
        None => true,
    }
}

/// True when `current` holds a cookie that was absent or different in `baseline`.
pub fn cookies_changed(baseline: &[StoredCookie], current: &[StoredCookie]) -> bool {
    let key = |c: &StoredCookie| (c.domain.clone(), c.name.clone(), c.value.clone());
    let before: HashSet<_> = baseline.iter().map(key).collect();
    current.iter().any(|c| !before.contains(&key(c)))
}

/// Launches a fresh, isolated Chrome per task and per login.
pub struct ChromeLauncher {
    chrome_path: Option<PathBuf>,
    headless: bool,
}

impl ChromeLauncher {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            chrome_path: config.chrome_path.clone(),
            headless: config.headless,
        }
    }
}

#[async_trait]
impl BrowserFactory for ChromeLauncher {
    async fn open(&self, session: &SessionState) -> Result<Box<dyn ActionExecutor>, ExecutorError> {
        let chrome_path = self.chrome_path.clone();
        let headless = self.headless;
        let session = session.clone();
        let browser = tokio::task::spawn_blocking(move || -> Result<BrowserSession> {
            let browser = BrowserSession::launch(chrome_path, headless)?;
            browser.restore(&session)?;
            Ok(browser)
        })
        .await
        .map_err(|e| ExecutorError::Browser(format!("browser launch panicked: {e}")))?
        .map_err(|e| ExecutorError::Browser(format!("{e:#}")))?;
        info!("browser context ready");
        Ok(Box::new(ChromeExecutor { session: Some(browser) }))
    }
}

#[async_trait]
impl LoginDriver for ChromeLauncher {
    async fn open(&self, login_url: &str) -> Result<Box<dyn LoginWindow>, ExecutorError> {
        let chrome_path = self.chrome_path.clone();
        let url = login_url.to_string();
        // A human has to see this window.
        let (browser, baseline) = tokio::task::spawn_blocking(move || -> Result<(BrowserSession, Vec<StoredCookie>)> {
            let browser = BrowserSession::launch(chrome_path, false)?;
            browser.tab.navigate_to(&url)?;
            if let Err(e) = browser.tab.wait_until_navigated() {
                debug!("login page still loading: {}", e);
            }
            let baseline = browser.capture_state().map(|s| s.cookies).unwrap_or_default();
            Ok((browser, baseline))
        })
        .await
        .map_err(|e| ExecutorError::Browser(format!("browser launch panicked: {e}")))?
        .map_err(|e| ExecutorError::Browser(format!("{e:#}")))?;
        info!(login_url, cookies = baseline.len(), "login window opened");
        Ok(Box::new(ChromeLoginWindow {
            session: Some(Arc::new(browser)),
            login_url: login_url.to_string(),
            baseline: Arc::new(baseline),
        }))
    }
}

/// Login completes once the page left the login URL and the cookie jar
/// changed since the window opened.
pub struct ChromeLoginWindow {
    session: Option<Arc<BrowserSession>>,
    login_url: String,
    baseline: Arc<Vec<StoredCookie>>,
}

#[async_trait]
impl LoginWindow for ChromeLoginWindow {
    async fn poll(&mut self) -> Result<Option<SessionState>, ExecutorError> {
        let Some(session) = self.session.clone() else {
            return Err(ExecutorError::Browser("login window already closed".into()));
        };
        let login_url = self.login_url.clone();
        let baseline = self.baseline.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<SessionState>> {
            let current = session.tab.get_url();
            if !left_login_page(&login_url, &current) {
                return Ok(None);
            }
            let state = session.capture_state()?;
            let signed_in = state.is_valid() && cookies_changed(&baseline, &state.cookies);
            Ok(signed_in.then_some(state))
        })
        .await
        .map_err(|e| ExecutorError::Browser(e.to_string()))?
        .map_err(|e| ExecutorError::Browser(format!("{e:#}")))
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = tokio::task::spawn_blocking(move || drop(session)).await;
        }
    }
}

/// [`ActionExecutor`] over a headless_chrome tab. Every CDP call blocks, so
/// each runs on the blocking pool.
pub struct ChromeExecutor {
    session: Option<BrowserSession>,
}

impl ChromeExecutor {
    fn tab(&self) -> Result<Arc<Tab>, ExecutorError> {
        self.session
            .as_ref()
            .map(|s| s.tab.clone())
            .ok_or_else(|| ExecutorError::Browser("browser context closed".into()))
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<Tab>) -> Result<T, ExecutorError> + Send + 'static,
    {
        let tab = self.tab()?;
        tokio::task::spawn_blocking(move || op(&tab))
            .await
            .map_err(|e| ExecutorError::Browser(format!("browser call panicked: {e}")))?
    }
}

fn eval_bool(tab: &Arc<Tab>, script: &str) -> Result<bool, ExecutorError> {
    let result = tab.evaluate(script, false).map_err(|e| ExecutorError::Browser(e.to_string()))?;
    Ok(result.value.and_then(|v| v.as_bool()).unwrap_or(false))
}

fn activate(tab: &Arc<Tab>, locator: &Locator, focus_only: bool) -> Result<(), ExecutorError> {
    match locator {
        Locator::Css(selector) => {
            let element = tab
                .wait_for_element_with_custom_timeout(selector, Duration::from_millis(1500))
                .map_err(|_| ExecutorError::TargetNotFound(selector.clone()))?;
            let _ = element.scroll_into_view();
            element
                .click()
                .map_err(|e| ExecutorError::Timeout(format!("click on {selector}: {e}")))?;
            if focus_only {
                let clear = format!(
                    "(() => {{ const el = document.querySelector({}); if (el && 'value' in el) el.value = ''; return true; }})()",
                    dom::js_string(selector)
                );
                eval_bool(tab, &clear)?;
            }
            Ok(())
        }
        Locator::Text(text) => {
            let script = if focus_only {
                dom::focus_field_by_text_js(text)
            } else {
                dom::click_by_text_js(text)
            };
            if eval_bool(tab, &script)? {
                Ok(())
            } else {
                Err(ExecutorError::TargetNotFound(format!("text \"{text}\"")))
            }
        }
        Locator::Point { x, y } => {
            if eval_bool(tab, &dom::activate_point_js(*x, *y, focus_only))? {
                Ok(())
            } else {
                Err(ExecutorError::TargetNotFound(format!("point ({x:.0}, {y:.0})")))
            }
        }
    }
}

#[async_trait]
impl ActionExecutor for ChromeExecutor {
    async fn navigate(&mut self, url: &str) -> Result<(), ExecutorError> {
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.navigate_to(&url)
                .and_then(|t| t.wait_until_navigated())
                .map(|_| ())
                .map_err(|e| ExecutorError::Timeout(format!("navigation to {url}: {e}")))
        })
        .await
    }

    async fn click(&mut self, locator: &Locator) -> Result<(), ExecutorError> {
        let locator = locator.clone();
        self.blocking(move |tab| activate(tab, &locator, false)).await
    }

    async fn type_text(&mut self, locator: &Locator, text: &str) -> Result<(), ExecutorError> {
        let locator = locator.clone();
        let text = text.to_string();
        self.blocking(move |tab| {
            activate(tab, &locator, true)?;
            tab.type_str(&text)
                .map(|_| ())
                .map_err(|e| ExecutorError::Timeout(format!("typing: {e}")))
        })
        .await
    }

    async fn go_back(&mut self) -> Result<(), ExecutorError> {
        self.blocking(|tab| {
            tab.evaluate("history.back()", false)
                .map(|_| ())
                .map_err(|e| ExecutorError::Browser(e.to_string()))
        })
        .await
    }

    async fn wait_for_settle(&mut self, timeout: Duration) -> Result<(), ExecutorError> {
        self.blocking(move |tab| {
            let started = Instant::now();
            let mut last_nodes = None;
            let mut stable = 0;
            while started.elapsed() < timeout {
                let sample = tab
                    .evaluate(dom::SETTLE_SAMPLE_JS, false)
                    .ok()
                    .and_then(|r| r.value)
                    .and_then(|v| v.as_str().map(String::from))
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok());
                if let Some(sample) = sample {
                    let nodes = sample["nodes"].as_u64();
                    let ready = sample["ready"].as_str() == Some("complete");
                    if ready && nodes.is_some() && nodes == last_nodes {
                        stable += 1;
                        // Two identical samples in a row: quiet enough.
                        if stable >= 2 {
                            return Ok(());
                        }
                    } else {
                        stable = 0;
                    }
                    last_nodes = nodes;
                }
                std::thread::sleep(Duration::from_millis(250));
            }
            Err(ExecutorError::Timeout(format!("page did not settle within {timeout:?}")))
        })
        .await
    }

    async fn wait_for_text(&mut self, text: &str, timeout: Duration) -> Result<bool, ExecutorError> {
        let script = dom::contains_text_js(text);
        self.blocking(move |tab| {
            let started = Instant::now();
            while started.elapsed() < timeout {
                if eval_bool(tab, &script)? {
                    return Ok(true);
                }
                std::thread::sleep(Duration::from_millis(250));
            }
            Ok(false)
        })
        .await
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, ExecutorError> {
        self.blocking(|tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(|e| ExecutorError::Browser(format!("screenshot: {e}")))
        })
        .await
    }

    async fn extract_state(&mut self) -> Result<Perception, ExecutorError> {
        self.blocking(|tab| dom::capture_perception(tab).map_err(|e| ExecutorError::Browser(format!("{e:#}"))))
            .await
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            // Dropping the Browser kills the process; that may block.
            let _ = tokio::task::spawn_blocking(move || drop(session)).await;
            debug!("browser context closed");
        }
    }
}

impl Drop for ChromeExecutor {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!("browser context dropped without close, tearing down");
        }
    }
}

fn find_chrome() -> Result<PathBuf> {
    if let Ok(path) = headless_chrome::browser::default_executable() {
        return Ok(path);
    }

    let mut candidates = vec![
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from("/usr/bin/google-chrome"),
        PathBuf::from("/usr/bin/chromium"),
        PathBuf::from("/usr/bin/chromium-browser"),
    ];
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(local.join("Google").join("Chrome").join("Application").join("chrome.exe"));
    }

    candidates
        .into_iter()
        .find(|p| p.exists())
        .ok_or_else(|| anyhow!("Chrome executable not found. Install Chrome or set CHROME_PATH."))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(name: &str, value: &str) -> StoredCookie {
        StoredCookie {
            name: name.into(),
            value: value.into(),
            domain: ".notion.so".into(),
            path: "/".into(),
            expires: None,
            http_only: false,
            secure: true,
            same_site: None,
        }
    }

    #[test]
    fn detects_leaving_login_page() {
        let login = "https://www.notion.so/login";
        assert!(!left_login_page(login, "https://www.notion.so/login?redirect=1"));
        assert!(!left_login_page(login, "https://www.notion.so/login/"));
        assert!(!left_login_page(login, "about:blank"));
        assert!(left_login_page(login, "https://www.notion.so/my-workspace"));
        assert!(left_login_page(login, "https://notion.so/my-workspace"));
    }

    #[test]
    fn equivalent_login_urls_are_still_the_login_page() {
        let login = "http://www.notion.so/login";
        assert!(!left_login_page(login, "https://notion.so/login"));
        assert!(!left_login_page(login, "https://www.notion.so:443/login#sso"));
        assert!(!left_login_page(login, "http://WWW.Notion.so:80/login/"));
        assert!(left_login_page(login, "https://notion.so:8443/login"));
    }

    #[test]
    fn sign_in_needs_new_or_changed_cookies() {
        let baseline = vec![cookie("csrf", "a"), cookie("tracking", "t")];
        assert!(!cookies_changed(&baseline, &baseline));
        assert!(!cookies_changed(&baseline, &[cookie("csrf", "a")]));
        assert!(cookies_changed(&baseline, &[cookie("csrf", "b"), cookie("tracking", "t")]));
        assert!(cookies_changed(&baseline, &[cookie("csrf", "a"), cookie("token_v2", "s")]));
        assert!(cookies_changed(&[], &[cookie("token_v2", "s")]));
    }

    #[test]
    fn origin_strips_path() {
        assert_eq!(url_origin("https://app.test:8443/a/b?c").as_deref(), Some("https://app.test:8443"));
        assert_eq!(url_origin("chrome://newtab"), None);
    }

    #[test]
    fn element_locator_targets_marker() {
        assert_eq!(Locator::element_id("e4"), Locator::Css("[data-eid=\"e4\"]".into()));
        assert!(ExecutorError::TargetNotFound("x".into()).is_transient());
        assert!(!ExecutorError::Browser("dead".into()).is_transient());
    }
}
