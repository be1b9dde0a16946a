use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::brain::{DecisionContext, DecisionPolicy, RetryPolicy, decide_with_retry};
use crate::config::CaptureConfig;
use crate::error::CaptureError;
use crate::hands::{ActionExecutor, ExecutorError, Locator};
use crate::recorder::{StepRecorder, UiSnapshot};
use crate::types::{Action, BoundingBox, HistoryEntry, Perception, WaitCondition, parse_http_url};

#[derive(Debug, Clone, Copy)]
pub struct NavigatorLimits {
    pub max_steps: u32,
    pub budget: Duration,
    pub max_consecutive_failures: u32,
    pub action_retries: u32,
    pub stuck_threshold: u32,
    pub dedup_threshold: u32,
    pub settle_timeout: Duration,
    pub recovery_settle_timeout: Duration,
    pub retry: RetryPolicy,
}

impl NavigatorLimits {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            budget: config.navigation_budget,
            max_consecutive_failures: config.max_consecutive_failures,
            action_retries: config.action_retries,
            stuck_threshold: config.stuck_threshold,
            dedup_threshold: config.dedup_threshold,
            settle_timeout: config.settle_timeout,
            recovery_settle_timeout: config.recovery_settle_timeout,
            retry: RetryPolicy::from_config(config),
        }
    }
}

/// Where the loop currently is. Logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavState {
    Perceive,
    Decide,
    Act,
    Observe,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NavigationOutcome {
    pub reason: String,
    pub actions_taken: u32,
    pub history: Vec<HistoryEntry>,
}

/// An action checked against the current perception and ready to execute.
enum Plan {
    Click { locators: Vec<Locator> },
    Type { locators: Vec<Locator>, text: String },
    Navigate { url: String },
    Wait { condition: WaitCondition },
}

pub struct Navigator<'a> {
    executor: &'a mut dyn ActionExecutor,
    policy: &'a dyn DecisionPolicy,
    recorder: &'a mut StepRecorder,
    limits: NavigatorLimits,
    state: NavState,
}

impl<'a> Navigator<'a> {
    pub fn new(
        executor: &'a mut dyn ActionExecutor,
        policy: &'a dyn DecisionPolicy,
        recorder: &'a mut StepRecorder,
        limits: NavigatorLimits,
    ) -> Self {
        Self {
            executor,
            policy,
            recorder,
            limits,
            state: NavState::Perceive,
        }
    }

    fn transition(&mut self, next: NavState) {
        debug!(from = ?self.state, to = ?next, "navigator transition");
        self.state = next;
    }

    /// Run until the policy finishes, or fail with the first terminal error.
    /// `start_url` is opened first when given, typically the page the user
    /// landed on after logging in. Without one, the policy is asked for the
    /// application's base URL.
    pub async fn run(&mut self, task: &str, start_url: Option<&str>) -> Result<NavigationOutcome, CaptureError> {
        let result = self.drive(task, start_url).await;
        self.transition(if result.is_ok() { NavState::Finished } else { NavState::Failed });
        result
    }

    async fn drive(&mut self, task: &str, start_url: Option<&str>) -> Result<NavigationOutcome, CaptureError> {
        let started = Instant::now();
        let mut history: Vec<HistoryEntry> = Vec::new();
        let mut actions_taken = 0u32;
        let mut consecutive_failures = 0u32;
        let mut unchanged = 0u32;
        let mut recovered = false;

        let start_url = match start_url {
            Some(url) => Some(url.to_string()),
            None => self.discover_start_url(task).await,
        };
        if let Some(url) = start_url {
            info!(url = %url, "opening start page");
            self.act(&Plan::Navigate { url }).await?;
            self.settle(self.limits.settle_timeout).await;
        }

        self.transition(NavState::Perceive);
        let mut current = self.perceive().await?;

        loop {
            if started.elapsed() > self.limits.budget {
                return Err(CaptureError::TimeBudgetExceeded(self.limits.budget.as_secs()));
            }
            self.transition(NavState::Decide);
            let action = {
                let ctx = DecisionContext {
                    task,
                    history: &history,
                    perception: &current.perception,
                    screenshot: Some(current.screenshot.as_slice()),
                };
                decide_with_retry(self.policy, &ctx, self.limits.retry)
                    .await
                    .map_err(|e| CaptureError::DecisionPolicy(e.to_string()))?
            };
            info!(step = actions_taken + 1, action = ?action, "decided");

            match &action {
                Action::Finish { reason } => {
                    self.recorder.record_final(&current, &action)?;
                    return Ok(NavigationOutcome {
                        reason: reason.clone(),
                        actions_taken,
                        history,
                    });
                }
                Action::Fail { reason } => return Err(CaptureError::Abandoned(reason.clone())),
                _ => {}
            }
            if actions_taken >= self.limits.max_steps {
                return Err(CaptureError::StepBudgetExceeded(self.limits.max_steps));
            }
            actions_taken += 1;

            let plan = match plan_action(&action, &current.perception) {
                Ok(plan) => plan,
                Err(problem) => {
                    warn!(action = action.name(), "cannot apply action: {}", problem);
                    history.push(HistoryEntry::failed(action, problem));
                    consecutive_failures += 1;
                    if consecutive_failures >= self.limits.max_consecutive_failures {
                        return Err(CaptureError::TooManyFailures(consecutive_failures));
                    }
                    continue;
                }
            };
            let target = action
                .target()
                .and_then(|id| current.perception.find(&id).cloned())
                .map(|el| (el.label, el.bbox));

            self.transition(NavState::Act);
            let condition_met = self.act(&plan).await?;
            if !condition_met {
                history.push(HistoryEntry::failed(action, "the awaited condition never appeared"));
                consecutive_failures += 1;
                if consecutive_failures >= self.limits.max_consecutive_failures {
                    return Err(CaptureError::TooManyFailures(consecutive_failures));
                }
                continue;
            }
            consecutive_failures = 0;

            self.transition(NavState::Observe);
            self.settle(self.limits.settle_timeout).await;
            self.transition(NavState::Perceive);
            let next = self.perceive().await?;

            self.recorder.record_if_significant(
                &next,
                &action,
                target.as_ref().map(|(label, bbox)| (label.as_str(), *bbox)),
            )?;

            let progressed = !next.fingerprint.is_near(&current.fingerprint, self.limits.dedup_threshold);
            let note = if progressed {
                format!("now on {}", next.perception.url)
            } else {
                "the page did not visibly change".to_string()
            };
            history.push(HistoryEntry::ok(action, note));

            if progressed {
                unchanged = 0;
                recovered = false;
                current = next;
                continue;
            }

            unchanged += 1;
            current = next;
            if unchanged > self.limits.stuck_threshold {
                if recovered {
                    return Err(CaptureError::AgentStuck { iterations: unchanged });
                }
                current = self.recover(&current, unchanged, &mut history).await?;
                recovered = true;
                unchanged = 0;
            }
        }
    }

    /// First usable URL the policy suggests. A failed lookup starts blank.
    async fn discover_start_url(&self, task: &str) -> Option<String> {
        let lookup = tokio::time::timeout(self.limits.retry.timeout, self.policy.start_urls(task)).await;
        match lookup {
            Ok(Ok(urls)) => {
                let url = urls.into_iter().find(|u| parse_http_url(u).is_some());
                if url.is_none() {
                    debug!("no start URL suggested, starting from a blank page");
                }
                url
            }
            Ok(Err(e)) => {
                warn!("start URL lookup failed: {}", e);
                None
            }
            Err(_) => {
                warn!("start URL lookup timed out");
                None
            }
        }
    }

    async fn perceive(&mut self) -> Result<UiSnapshot, CaptureError> {
        let perception = self
            .executor
            .extract_state()
            .await
            .map_err(|e| CaptureError::Internal(format!("perception failed: {e}")))?;
        let screenshot = self
            .executor
            .screenshot()
            .await
            .map_err(|e| CaptureError::Internal(format!("screenshot failed: {e}")))?;
        UiSnapshot::new(perception, screenshot)
    }

    async fn settle(&mut self, timeout: Duration) {
        if let Err(e) = self.executor.wait_for_settle(timeout).await {
            debug!("settle incomplete, continuing: {}", e);
        }
    }

    /// Execute with alternate target resolution on each retry.
    /// Returns `false` only for a `wait` whose condition never held.
    async fn act(&mut self, plan: &Plan) -> Result<bool, CaptureError> {
        let attempts = self.limits.action_retries + 1;
        let mut last_error: Option<ExecutorError> = None;

        for attempt in 0..attempts {
            let result = match plan {
                Plan::Click { locators } => self.executor.click(pick(locators, attempt)).await,
                Plan::Type { locators, text } => self.executor.type_text(pick(locators, attempt), text).await,
                Plan::Navigate { url } => self.executor.navigate(url).await,
                Plan::Wait { condition } => return self.wait(condition).await,
            };
            match result {
                Ok(()) => {
                    if attempt > 0 {
                        info!(attempt = attempt + 1, "action succeeded after retry");
                    }
                    return Ok(true);
                }
                Err(e) if e.is_transient() => {
                    warn!(attempt = attempt + 1, max = attempts, "action failed: {}", e);
                    last_error = Some(e);
                    tokio::time::sleep(Duration::from_millis(150 * u64::from(attempt + 1))).await;
                }
                Err(e) => return Err(CaptureError::Internal(e.to_string())),
            }
        }

        Err(CaptureError::Navigation {
            attempts,
            message: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn wait(&mut self, condition: &WaitCondition) -> Result<bool, CaptureError> {
        match condition {
            WaitCondition::Idle => {
                self.settle(self.limits.settle_timeout).await;
                Ok(true)
            }
            WaitCondition::Duration { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms).min(self.limits.settle_timeout)).await;
                Ok(true)
            }
            WaitCondition::Text { text } => self
                .executor
                .wait_for_text(text, self.limits.settle_timeout)
                .await
                .map_err(|e| CaptureError::Internal(e.to_string())),
        }
    }

    /// Go back and give the page extra time; fail if that changes nothing.
    async fn recover(
        &mut self,
        stuck: &UiSnapshot,
        iterations: u32,
        history: &mut Vec<HistoryEntry>,
    ) -> Result<UiSnapshot, CaptureError> {
        warn!(iterations, url = %stuck.perception.url, "no progress, attempting recovery");
        if let Err(e) = self.executor.go_back().await {
            debug!("recovery navigation failed: {}", e);
        }
        self.settle(self.limits.recovery_settle_timeout).await;
        let after = self.perceive().await?;
        if after.fingerprint.is_near(&stuck.fingerprint, self.limits.dedup_threshold) {
            return Err(CaptureError::AgentStuck { iterations });
        }
        history.push(HistoryEntry::ok(
            Action::Navigate { url: after.perception.url.clone() },
            "went back because the previous actions made no visible progress",
        ));
        Ok(after)
    }
}

fn pick(locators: &[Locator], attempt: u32) -> &Locator {
    let i = (attempt as usize).min(locators.len().saturating_sub(1));
    &locators[i]
}

/// Resolution order: element marker, visible label, bounding-box centre.
fn locators_for(id: &str, label: &str, bbox: BoundingBox) -> Vec<Locator> {
    let mut locators = vec![Locator::element_id(id)];
    if !label.trim().is_empty() {
        locators.push(Locator::Text(label.trim().to_string()));
    }
    if !bbox.is_empty() {
        let (x, y) = bbox.center();
        locators.push(Locator::Point { x, y });
    }
    locators
}

fn plan_action(action: &Action, perception: &Perception) -> Result<Plan, String> {
    // A repeated label would match the wrong twin, so only unique labels
    // become text locators.
    let resolve = |target: &str| {
        perception
            .find(target)
            .map(|el| {
                let unique = perception.elements.iter().filter(|e| e.label == el.label).count() == 1;
                locators_for(&el.id, if unique { &el.label } else { "" }, el.bbox)
            })
            .ok_or_else(|| format!("element {target} is not on the current page"))
    };
    match action {
        Action::Click { target } => Ok(Plan::Click { locators: resolve(target)? }),
        Action::Type { target, text } => Ok(Plan::Type {
            locators: resolve(target)?,
            text: text.clone(),
        }),
        Action::Navigate { url } => match parse_http_url(url) {
            Some(_) => Ok(Plan::Navigate { url: url.trim().to_string() }),
            None => Err(format!("'{}' is not an absolute http(s) URL", url.trim())),
        },
        Action::Wait { condition } => Ok(Plan::Wait { condition: condition.clone() }),
        Action::Finish { .. } | Action::Fail { .. } => Err(format!("{} cannot be executed", action.name())),
    }
}
