use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{Instrument, error, info, info_span};

use crate::brain::DecisionPolicy;
use crate::config::CaptureConfig;
use crate::error::CaptureError;
use crate::hands::BrowserFactory;
use crate::narrator::synthesize;
use crate::navigator::{Navigator, NavigatorLimits};
use crate::recorder::StepRecorder;
use crate::session::{SessionManager, validate_session_key};
use crate::types::{StartTaskRequest, StartTaskResponse, Task, parse_http_url};

/// URL prefix the screenshot directory is served under.
pub const SCREENSHOTS_PREFIX: &str = "screenshots";

/// Runs one capture request end to end under a single time budget. At most
/// `max_concurrent_tasks` browsers are live at once, login windows included.
pub struct TaskSupervisor {
    sessions: Arc<SessionManager>,
    browsers: Arc<dyn BrowserFactory>,
    policy: Arc<dyn DecisionPolicy>,
    permits: Arc<Semaphore>,
    screenshots_dir: PathBuf,
    limits: NavigatorLimits,
    task_budget: std::time::Duration,
    highlight: bool,
}

impl TaskSupervisor {
    pub fn new(
        config: &CaptureConfig,
        sessions: Arc<SessionManager>,
        browsers: Arc<dyn BrowserFactory>,
        policy: Arc<dyn DecisionPolicy>,
    ) -> Self {
        Self {
            sessions,
            browsers,
            policy,
            permits: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
            screenshots_dir: config.screenshots_dir.clone(),
            limits: NavigatorLimits::from_config(config),
            task_budget: config.task_budget,
            highlight: config.highlight_targets,
        }
    }

    pub fn screenshots_dir(&self) -> &std::path::Path {
        &self.screenshots_dir
    }

    /// Validate, then capture the workflow. Either every step and its caption
    /// is returned, or nothing is left on disk.
    pub async fn start_task(&self, request: StartTaskRequest) -> Result<StartTaskResponse, CaptureError> {
        let task = validate(request)?;
        let span = info_span!("task", task_id = %task.task_id, session = %task.session_path);

        async {
            info!(task = %task.description, "task started");
            let result = match tokio::time::timeout(self.task_budget, self.capture(&task)).await {
                Ok(result) => result,
                Err(_) => Err(CaptureError::TimeBudgetExceeded(self.task_budget.as_secs())),
            };
            match &result {
                Ok(response) => info!(steps = response.paths.len(), "task completed"),
                Err(e) => error!(kind = e.kind(), "task failed: {}", e),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn capture(&self, task: &Task) -> Result<StartTaskResponse, CaptureError> {
        // Held across the login too: a login window is a browser.
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CaptureError::Internal("task scheduler is shut down".to_string()))?;

        let session = self
            .sessions
            .acquire_session(&task.session_path, task.login_url.as_deref())
            .await?;

        let mut executor = self
            .browsers
            .open(&session)
            .await
            .map_err(|e| CaptureError::Internal(format!("could not start the browser: {e}")))?;

        let outcome = match StepRecorder::create(
            &self.screenshots_dir,
            SCREENSHOTS_PREFIX,
            &task.task_id,
            self.limits.dedup_threshold,
            self.highlight,
        ) {
            Ok(mut recorder) => {
                let run = Navigator::new(executor.as_mut(), self.policy.as_ref(), &mut recorder, self.limits)
                    .run(&task.description, session.home_url.as_deref())
                    .await;
                run.map(|outcome| (outcome, recorder))
            }
            Err(e) => Err(e),
        };
        executor.close().await;
        let (outcome, recorder) = outcome?;
        info!(actions = outcome.actions_taken, reason = %outcome.reason, "navigation finished");

        let steps = recorder.steps();
        let explanation = synthesize(&task.description, steps);
        let problem = if explanation.len() != steps.len() {
            Some(format!("{} captions for {} screenshots", explanation.len(), steps.len()))
        } else {
            steps
                .iter()
                .enumerate()
                .find(|(position, step)| step.index != *position)
                .map(|(position, step)| format!("step {} recorded at position {}", step.index, position))
        };
        if let Some(message) = problem {
            recorder.discard();
            return Err(CaptureError::Internal(message));
        }
        let paths = recorder.finish().into_iter().map(|step| step.path).collect();
        Ok(StartTaskResponse {
            paths,
            explanation: explanation.render(),
        })
    }
}

fn validate(request: StartTaskRequest) -> Result<Task, CaptureError> {
    let description = request.task.trim().to_string();
    if description.is_empty() {
        return Err(CaptureError::Validation("task must not be empty".to_string()));
    }
    let session_path = request.session_path.trim().to_string();
    if session_path.is_empty() {
        return Err(CaptureError::Validation("session_path must not be empty".to_string()));
    }
    validate_session_key(&session_path).map_err(|e| CaptureError::Validation(e.to_string()))?;
    let task_id = request.task_id.trim().to_string();
    if task_id.is_empty() {
        return Err(CaptureError::Validation("task_id must not be empty".to_string()));
    }
    let login_url = request.login_url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
    if let Some(url) = login_url.as_deref().filter(|u| parse_http_url(u).is_none()) {
        return Err(CaptureError::Validation(format!("login_url '{url}' is not an http(s) URL")));
    }
    Ok(Task {
        task_id,
        description,
        login_url,
        session_path,
    })
}
