pub mod brain;
pub mod config;
pub mod dom;
pub mod error;
pub mod face;
pub mod hands;
pub mod narrator;
pub mod navigator;
pub mod recorder;
pub mod session;
pub mod supervisor;
pub mod types;

pub use config::CaptureConfig;
pub use error::CaptureError;
pub use supervisor::TaskSupervisor;
pub use types::{StartTaskRequest, StartTaskResponse};
