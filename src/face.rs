use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::CaptureError;
use crate::supervisor::{SCREENSHOTS_PREFIX, TaskSupervisor};
use crate::types::{StartTaskRequest, StartTaskResponse};

/// How many ports after the configured one are tried before giving up.
const PORT_FALLBACK_ATTEMPTS: u16 = 10;

pub fn router(supervisor: Arc<TaskSupervisor>, cors_origin: &str) -> Router {
    let screenshots = ServeDir::new(supervisor.screenshots_dir());
    Router::new()
        .route("/", get(health))
        .route("/tasks/start", post(start_task))
        .nest_service(&format!("/{SCREENSHOTS_PREFIX}"), screenshots)
        .layer(cors(cors_origin))
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

fn cors(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);
    match origin.parse::<HeaderValue>() {
        Ok(value) if origin != "*" => layer.allow_origin(value),
        _ => layer.allow_origin(Any),
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn start_task(
    State(supervisor): State<Arc<TaskSupervisor>>,
    payload: Result<Json<StartTaskRequest>, JsonRejection>,
) -> Result<Json<StartTaskResponse>, CaptureError> {
    let Json(request) = payload.map_err(|e| CaptureError::Validation(e.body_text()))?;
    info!(task_id = %request.task_id, "POST /tasks/start");
    supervisor.start_task(request).await.map(Json)
}

/// Bind `addr`, moving on to the next ports while the address is taken.
pub async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    let base: SocketAddr = addr.parse()?;
    let mut last_error = None;
    for offset in 0..PORT_FALLBACK_ATTEMPTS {
        let candidate = SocketAddr::new(base.ip(), base.port().saturating_add(offset));
        match TcpListener::bind(candidate).await {
            Ok(listener) => {
                if offset > 0 {
                    warn!(requested = %base, bound = %candidate, "requested port busy, using fallback");
                }
                return Ok(listener);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(anyhow::anyhow!(
        "could not bind any port from {} ({} attempts): {}",
        base,
        PORT_FALLBACK_ATTEMPTS,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    ))
}

pub async fn serve(listener: TcpListener, app: Router) -> anyhow::Result<()> {
    info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
