use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("no stored session for '{session_path}' and no login URL provided")]
    MissingSession { session_path: String },
    #[error("interactive login not completed within {seconds}s")]
    LoginTimeout { seconds: u64 },
    #[error("navigation failed after {attempts} attempts: {message}")]
    Navigation { attempts: u32, message: String },
    #[error("no visible progress after {iterations} iterations and one recovery attempt")]
    AgentStuck { iterations: u32 },
    #[error("decision policy failed: {0}")]
    DecisionPolicy(String),
    #[error("step budget of {0} actions exhausted")]
    StepBudgetExceeded(u32),
    #[error("time budget of {0}s exhausted")]
    TimeBudgetExceeded(u64),
    #[error("{0} consecutive failed actions")]
    TooManyFailures(u32),
    #[error("navigation agent gave up: {0}")]
    Abandoned(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CaptureError {
    /// Stable kind name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::Validation(_) => "ValidationError",
            CaptureError::MissingSession { .. } => "MissingSessionError",
            CaptureError::LoginTimeout { .. } => "LoginTimeoutError",
            CaptureError::Navigation { .. } => "NavigationError",
            CaptureError::AgentStuck { .. } => "AgentStuckError",
            CaptureError::DecisionPolicy(_) => "DecisionPolicyError",
            CaptureError::StepBudgetExceeded(_) => "StepBudgetExceeded",
            CaptureError::TimeBudgetExceeded(_) => "TimeBudgetExceeded",
            CaptureError::TooManyFailures(_) => "TooManyFailures",
            CaptureError::Abandoned(_) => "AbandonedError",
            CaptureError::Internal(_) => "InternalError",
        }
    }

    /// The single human-readable message returned to callers.
    pub fn detail(&self) -> String {
        match self {
            CaptureError::Validation(msg) => format!("Invalid request: {msg}"),
            CaptureError::MissingSession { session_path } => format!(
                "No saved login session found for '{session_path}'. Provide a login_url to log in once and create the session."
            ),
            CaptureError::LoginTimeout { seconds } => format!(
                "Login was not completed within {seconds} seconds; no session was saved. Please try again."
            ),
            CaptureError::Navigation { message, .. } => {
                format!("The agent could not perform a step in the application: {message}")
            }
            CaptureError::AgentStuck { .. } => {
                "The agent stopped making progress in the application and gave up.".to_string()
            }
            CaptureError::DecisionPolicy(msg) => {
                format!("The reasoning service failed to choose the next step: {msg}")
            }
            CaptureError::StepBudgetExceeded(max) => {
                format!("The workflow needed more than {max} steps and was stopped.")
            }
            CaptureError::TimeBudgetExceeded(secs) => {
                format!("The workflow did not finish within {secs} seconds.")
            }
            CaptureError::TooManyFailures(count) => {
                format!("The agent failed {count} times in a row and was stopped.")
            }
            CaptureError::Abandoned(reason) => format!("The agent could not complete the task: {reason}"),
            CaptureError::Internal(msg) => format!("Task execution failed: {msg}"),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            CaptureError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CaptureError::MissingSession { .. } => StatusCode::BAD_REQUEST,
            CaptureError::LoginTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            CaptureError::TimeBudgetExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            CaptureError::Navigation { .. }
            | CaptureError::AgentStuck { .. }
            | CaptureError::DecisionPolicy(_)
            | CaptureError::StepBudgetExceeded(_)
            | CaptureError::TooManyFailures(_)
            | CaptureError::Abandoned(_) => StatusCode::BAD_GATEWAY,
            CaptureError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "detail": self.detail() }))).into_response()
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Internal(err.to_string())
    }
}
