#![allow(dead_code)]

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

use workflow_capture::brain::DecisionPolicy;
use workflow_capture::hands::{ActionExecutor, BrowserFactory, ExecutorError, Locator};
use workflow_capture::session::{
    FileSessionStore, LoginDriver, LoginWindow, SessionManager, SessionState, StoredCookie,
};
use workflow_capture::types::{BoundingBox, Perception, UiElement};
use workflow_capture::{CaptureConfig, TaskSupervisor};

pub const LOGIN_URL: &str = "https://app.test/login";

/// A tiny in-memory web app: pages plus the clicks that link them.
#[derive(Clone, Default)]
pub struct FakeSite {
    pub pages: Vec<Perception>,
    pub links: HashMap<(usize, String), usize>,
}

pub fn element(id: &str, tag: &str, label: &str, slot: usize) -> UiElement {
    UiElement {
        id: id.into(),
        tag: tag.into(),
        role: tag.into(),
        label: label.into(),
        input_type: None,
        value: None,
        bbox: BoundingBox { x: 10.0, y: 10.0 + 30.0 * slot as f64, w: 120.0, h: 24.0 },
    }
}

pub fn page(url: &str, title: &str, dialog_open: bool, elements: Vec<UiElement>) -> Perception {
    Perception {
        url: url.into(),
        title: title.into(),
        elements,
        dialog_open,
        truncated: 0,
    }
}

/// Home → Settings → Invite dialog, with a link back home from Settings.
pub fn team_app() -> FakeSite {
    let pages = vec![
        page(
            "https://app.test/home",
            "Home",
            false,
            vec![element("e0", "button", "Help", 0), element("e1", "a", "Settings", 1)],
        ),
        page(
            "https://app.test/settings",
            "Settings",
            false,
            vec![element("e2", "button", "Invite members", 0), element("e3", "a", "Home", 1)],
        ),
        page(
            "https://app.test/settings",
            "Settings",
            true,
            vec![
                element("e2", "button", "Invite members", 0),
                element("e4", "input", "Email", 1),
                element("e5", "button", "Send invite", 2),
            ],
        ),
    ];
    let mut links = HashMap::new();
    links.insert((0, "e1".to_string()), 1);
    links.insert((1, "e2".to_string()), 2);
    links.insert((1, "e3".to_string()), 0);
    FakeSite { pages, links }
}

/// Counters shared by every fake created by one harness.
#[derive(Default)]
pub struct Counters {
    pub browsers_opened: AtomicUsize,
    pub browsers_closed: AtomicUsize,
    pub clicks: AtomicUsize,
    pub navigations: AtomicUsize,
    pub logins_opened: AtomicUsize,
    /// Remaining click/type/navigate attempts that fail before actions work.
    pub action_failures: AtomicU32,
    /// Task browsers and login windows currently open.
    pub live_browsers: AtomicUsize,
    pub peak_browsers: AtomicUsize,
}

impl Counters {
    fn browser_up(&self) {
        let live = self.live_browsers.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_browsers.fetch_max(live, Ordering::SeqCst);
    }

    fn browser_down(&self) {
        self.live_browsers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Distinct but deterministic screenshot per page.
pub fn screenshot_png(seed: usize) -> Vec<u8> {
    let img = RgbImage::from_fn(96, 64, |x, y| {
        let v = ((x as usize * (seed * 3 + 1) + y as usize * (seed + 2)) % 251) as u8;
        Rgb([v, v.wrapping_mul(3), (seed * 40) as u8])
    });
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

pub struct FakeExecutor {
    site: Arc<FakeSite>,
    counters: Arc<Counters>,
    current: usize,
    back_stack: Vec<usize>,
}

impl FakeExecutor {
    fn resolve(&self, locator: &Locator) -> Option<String> {
        let elements = &self.site.pages[self.current].elements;
        match locator {
            Locator::Css(selector) => {
                let id = selector.split('"').nth(1)?;
                elements.iter().find(|e| e.id == id).map(|e| e.id.clone())
            }
            Locator::Text(label) => elements.iter().find(|e| &e.label == label).map(|e| e.id.clone()),
            Locator::Point { x, y } => elements
                .iter()
                .find(|e| {
                    *x >= e.bbox.x && *x <= e.bbox.x + e.bbox.w && *y >= e.bbox.y && *y <= e.bbox.y + e.bbox.h
                })
                .map(|e| e.id.clone()),
        }
    }

    fn take_failure(&self) -> bool {
        self.counters
            .action_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ActionExecutor for FakeExecutor {
    async fn navigate(&mut self, url: &str) -> Result<(), ExecutorError> {
        if self.take_failure() {
            return Err(ExecutorError::Timeout(format!("navigation to {url}")));
        }
        let index = self
            .site
            .pages
            .iter()
            .position(|p| p.url == url)
            .ok_or_else(|| ExecutorError::TargetNotFound(url.to_string()))?;
        self.counters.navigations.fetch_add(1, Ordering::SeqCst);
        self.back_stack.push(self.current);
        self.current = index;
        Ok(())
    }

    async fn click(&mut self, locator: &Locator) -> Result<(), ExecutorError> {
        if self.take_failure() {
            return Err(ExecutorError::TargetNotFound(format!("{locator:?}")));
        }
        let id = self
            .resolve(locator)
            .ok_or_else(|| ExecutorError::TargetNotFound(format!("{locator:?}")))?;
        self.counters.clicks.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.site.links.get(&(self.current, id)) {
            self.back_stack.push(self.current);
            self.current = *next;
        }
        Ok(())
    }

    async fn type_text(&mut self, locator: &Locator, _text: &str) -> Result<(), ExecutorError> {
        if self.take_failure() {
            return Err(ExecutorError::TargetNotFound(format!("{locator:?}")));
        }
        self.resolve(locator)
            .map(|_| ())
            .ok_or_else(|| ExecutorError::TargetNotFound(format!("{locator:?}")))
    }

    async fn go_back(&mut self) -> Result<(), ExecutorError> {
        if let Some(previous) = self.back_stack.pop() {
            self.current = previous;
        }
        Ok(())
    }

    async fn wait_for_settle(&mut self, _timeout: Duration) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn wait_for_text(&mut self, text: &str, _timeout: Duration) -> Result<bool, ExecutorError> {
        Ok(self.site.pages[self.current].elements.iter().any(|e| e.label.contains(text)))
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, ExecutorError> {
        Ok(screenshot_png(self.current))
    }

    async fn extract_state(&mut self) -> Result<Perception, ExecutorError> {
        Ok(self.site.pages[self.current].clone())
    }

    async fn close(&mut self) {
        self.counters.browsers_closed.fetch_add(1, Ordering::SeqCst);
        self.counters.browser_down();
    }
}

pub struct FakeBrowsers {
    site: Arc<FakeSite>,
    counters: Arc<Counters>,
}

#[async_trait]
impl BrowserFactory for FakeBrowsers {
    async fn open(&self, session: &SessionState) -> Result<Box<dyn ActionExecutor>, ExecutorError> {
        assert!(session.is_valid(), "browser opened without a usable session");
        self.counters.browsers_opened.fetch_add(1, Ordering::SeqCst);
        self.counters.browser_up();
        Ok(Box::new(FakeExecutor {
            site: self.site.clone(),
            counters: self.counters.clone(),
            current: 0,
            back_stack: Vec::new(),
        }))
    }
}

/// Login that completes after `polls_needed` polls, or never.
pub struct FakeLogin {
    counters: Arc<Counters>,
    polls_needed: Option<usize>,
}

struct FakeLoginWindow {
    counters: Arc<Counters>,
    polls: usize,
    polls_needed: Option<usize>,
}

#[async_trait]
impl LoginDriver for FakeLogin {
    async fn open(&self, _login_url: &str) -> Result<Box<dyn LoginWindow>, ExecutorError> {
        self.counters.logins_opened.fetch_add(1, Ordering::SeqCst);
        self.counters.browser_up();
        Ok(Box::new(FakeLoginWindow {
            counters: self.counters.clone(),
            polls: 0,
            polls_needed: self.polls_needed,
        }))
    }
}

#[async_trait]
impl LoginWindow for FakeLoginWindow {
    async fn poll(&mut self) -> Result<Option<SessionState>, ExecutorError> {
        self.polls += 1;
        match self.polls_needed {
            Some(n) if self.polls >= n => Ok(Some(valid_session())),
            _ => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.counters.browser_down();
    }
}

pub fn valid_session() -> SessionState {
    SessionState {
        cookies: vec![StoredCookie {
            name: "sid".into(),
            value: "secret".into(),
            domain: "app.test".into(),
            path: "/".into(),
            expires: None,
            http_only: true,
            secure: true,
            same_site: None,
        }],
        ..SessionState::default()
    }
}

pub struct Harness {
    pub supervisor: Arc<TaskSupervisor>,
    pub counters: Arc<Counters>,
    pub config: CaptureConfig,
    _root: TempDir,
}

impl Harness {
    pub fn screenshots_dir(&self) -> &Path {
        &self.config.screenshots_dir
    }

    pub fn session_file(&self, key: &str) -> PathBuf {
        self.config.sessions_dir.join(key)
    }

    pub fn seed_session(&self, key: &str) {
        self.write_session(key, &valid_session());
    }

    /// Stored session that remembers where the login landed.
    pub fn seed_session_with_home(&self, key: &str, home_url: &str) {
        let session = SessionState { home_url: Some(home_url.into()), ..valid_session() };
        self.write_session(key, &session);
    }

    fn write_session(&self, key: &str, session: &SessionState) {
        let bytes = serde_json::to_vec(session).expect("serialize session");
        std::fs::write(self.session_file(key), bytes).expect("write session");
    }

    /// Directories left under the screenshot root.
    pub fn screenshot_dirs(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.screenshots_dir()) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn opened(&self) -> usize {
        self.counters.browsers_opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.browsers_closed.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> usize {
        self.counters.logins_opened.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> usize {
        self.counters.navigations.load(Ordering::SeqCst)
    }

    pub fn peak_browsers(&self) -> usize {
        self.counters.peak_browsers.load(Ordering::SeqCst)
    }
}

pub struct HarnessBuilder {
    site: FakeSite,
    login_polls_needed: Option<usize>,
    action_failures: u32,
    tweak: Box<dyn FnOnce(CaptureConfig) -> CaptureConfig>,
}

impl HarnessBuilder {
    pub fn new(site: FakeSite) -> Self {
        Self {
            site,
            login_polls_needed: Some(2),
            action_failures: 0,
            tweak: Box::new(|c| c),
        }
    }

    pub fn login_never_completes(mut self) -> Self {
        self.login_polls_needed = None;
        self
    }

    pub fn login_polls(mut self, n: usize) -> Self {
        self.login_polls_needed = Some(n);
        self
    }

    /// The next `n` click, type or navigate attempts fail transiently.
    pub fn action_failures(mut self, n: u32) -> Self {
        self.action_failures = n;
        self
    }

    pub fn config(mut self, tweak: impl FnOnce(CaptureConfig) -> CaptureConfig + 'static) -> Self {
        self.tweak = Box::new(tweak);
        self
    }

    pub fn build(self, policy: Arc<dyn DecisionPolicy>) -> Harness {
        let root = tempfile::tempdir().expect("tempdir");
        let config = CaptureConfig::default()
            .with_screenshots_dir(root.path().join("screenshots"))
            .with_sessions_dir(root.path().join("sessions"))
            .with_fast_timings()
            .with_login_window(Duration::from_millis(300), Duration::from_millis(10));
        let config = (self.tweak)(config);

        let counters = Arc::new(Counters::default());
        counters.action_failures.store(self.action_failures, Ordering::SeqCst);

        let store = Arc::new(FileSessionStore::new(&config.sessions_dir).expect("session store"));
        let login = Arc::new(FakeLogin { counters: counters.clone(), polls_needed: self.login_polls_needed });
        let sessions = Arc::new(SessionManager::new(
            store,
            login,
            config.login_window,
            config.login_poll_interval,
        ));
        let browsers = Arc::new(FakeBrowsers { site: Arc::new(self.site), counters: counters.clone() });
        let supervisor = Arc::new(TaskSupervisor::new(&config, sessions, browsers, policy));

        Harness { supervisor, counters, config, _root: root }
    }
}
