use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// The external caller gives up after 300s; stay well below that.
pub const DEFAULT_TASK_BUDGET_SECS: u64 = 240;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 60;
pub const DEFAULT_MAX_STEPS: u32 = 25;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub bind_addr: String,
    /// Directory served under `/screenshots`.
    pub screenshots_dir: PathBuf,
    /// Directory holding session files. Never served.
    pub sessions_dir: PathBuf,
    pub cors_origin: String,

    pub model_base_url: String,
    pub model_api_key: Option<String>,
    pub model_name: String,
    /// Model asked for the application's base URL when no session home is known.
    pub url_finder_model: String,
    pub model_vision: bool,
    pub policy_timeout: Duration,
    pub policy_max_retries: u32,
    pub policy_retry_base: Duration,

    pub task_budget: Duration,
    pub navigation_budget: Duration,
    pub login_window: Duration,
    pub login_poll_interval: Duration,
    pub settle_timeout: Duration,
    pub recovery_settle_timeout: Duration,
    pub max_steps: u32,
    pub action_retries: u32,
    pub max_consecutive_failures: u32,
    pub stuck_threshold: u32,
    pub dedup_threshold: u32,
    pub highlight_targets: bool,

    pub max_concurrent_tasks: usize,
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            screenshots_dir: PathBuf::from("screenshots"),
            sessions_dir: PathBuf::from("sessions"),
            cors_origin: "http://localhost:3000".to_string(),
            model_base_url: "https://api.openai.com/v1".to_string(),
            model_api_key: None,
            model_name: "gpt-4o".to_string(),
            url_finder_model: "gpt-4o-search-preview".to_string(),
            model_vision: false,
            policy_timeout: Duration::from_secs(45),
            policy_max_retries: 3,
            policy_retry_base: Duration::from_millis(500),
            task_budget: Duration::from_secs(DEFAULT_TASK_BUDGET_SECS),
            navigation_budget: Duration::from_secs(DEFAULT_TASK_BUDGET_SECS - 60),
            login_window: Duration::from_secs(DEFAULT_LOGIN_WINDOW_SECS),
            login_poll_interval: Duration::from_secs(1),
            settle_timeout: Duration::from_secs(5),
            recovery_settle_timeout: Duration::from_secs(10),
            max_steps: DEFAULT_MAX_STEPS,
            action_retries: 2,
            max_consecutive_failures: 3,
            stuck_threshold: 3,
            dedup_threshold: 5,
            highlight_targets: true,
            max_concurrent_tasks: 2,
            headless: true,
            chrome_path: None,
        }
    }
}

impl CaptureConfig {
    /// Defaults overridden by `CAPTURE_*` and `OPENAI_*` variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = env::var("CAPTURE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(dir) = env::var("CAPTURE_SCREENSHOTS_DIR") {
            config.screenshots_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var("CAPTURE_SESSIONS_DIR") {
            config.sessions_dir = PathBuf::from(dir);
        }
        if let Ok(origin) = env::var("CAPTURE_CORS_ORIGIN") {
            config.cors_origin = origin;
        }
        if let Ok(url) = env::var("OPENAI_BASE_URL") {
            config.model_base_url = url;
        }
        config.model_api_key = env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
        if let Ok(model) = env::var("CAPTURE_MODEL") {
            config.model_name = model;
        }
        if let Ok(model) = env::var("CAPTURE_URL_FINDER_MODEL") {
            config.url_finder_model = model;
        }
        config.model_vision = env_flag("CAPTURE_MODEL_VISION").unwrap_or(config.model_vision);
        config.headless = env_flag("CAPTURE_HEADLESS").unwrap_or(config.headless);
        config.highlight_targets = env_flag("CAPTURE_HIGHLIGHT").unwrap_or(config.highlight_targets);
        config.chrome_path = env::var("CHROME_PATH").ok().map(PathBuf::from);

        if let Some(secs) = env_parse::<u64>("CAPTURE_TASK_BUDGET_SECS") {
            config.task_budget = Duration::from_secs(secs);
            config.navigation_budget = Duration::from_secs(secs.saturating_sub(60).max(secs / 2));
        }
        if let Some(secs) = env_parse::<u64>("CAPTURE_POLICY_TIMEOUT_SECS") {
            config.policy_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("CAPTURE_SETTLE_TIMEOUT_MS") {
            config.settle_timeout = Duration::from_millis(ms);
        }
        config.policy_max_retries =
            env_parse("CAPTURE_POLICY_MAX_RETRIES").unwrap_or(config.policy_max_retries);
        config.max_steps = env_parse("CAPTURE_MAX_STEPS").unwrap_or(config.max_steps);
        config.stuck_threshold = env_parse("CAPTURE_STUCK_THRESHOLD").unwrap_or(config.stuck_threshold);
        config.dedup_threshold = env_parse("CAPTURE_DEDUP_THRESHOLD").unwrap_or(config.dedup_threshold);
        config.max_concurrent_tasks = env_parse::<usize>("CAPTURE_MAX_CONCURRENT_TASKS")
            .unwrap_or(config.max_concurrent_tasks)
            .max(1);

        config
    }

    pub fn with_screenshots_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.screenshots_dir = dir.into();
        self
    }

    pub fn with_sessions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sessions_dir = dir.into();
        self
    }

    pub fn with_login_window(mut self, window: Duration, poll_interval: Duration) -> Self {
        self.login_window = window;
        self.login_poll_interval = poll_interval;
        self
    }

    pub fn with_task_budget(mut self, budget: Duration) -> Self {
        self.task_budget = budget;
        self.navigation_budget = budget;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Shrink every wait so fake executors run instantly.
    pub fn with_fast_timings(mut self) -> Self {
        self.settle_timeout = Duration::from_millis(20);
        self.recovery_settle_timeout = Duration::from_millis(40);
        self.policy_retry_base = Duration::from_millis(5);
        self.policy_timeout = Duration::from_secs(2);
        self
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budget_stays_under_caller_timeout() {
        let config = CaptureConfig::default();
        assert!(config.task_budget < Duration::from_secs(300));
        assert!(config.navigation_budget < config.task_budget);
        assert_eq!(config.login_window, Duration::from_secs(60));
        assert_eq!(config.action_retries, 2);
    }
}
