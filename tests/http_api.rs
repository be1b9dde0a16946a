mod common;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

use common::{HarnessBuilder, team_app};
use workflow_capture::brain::ScriptedPolicy;
use workflow_capture::face::router;
use workflow_capture::types::Action;

fn post_start(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/tasks/start")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn start_task_returns_paths_and_explanation() {
    let h = HarnessBuilder::new(team_app()).build(Arc::new(ScriptedPolicy::new([
        Action::Click { target: "e1".into() },
        Action::Finish { reason: "settings reached".into() },
    ])));
    h.seed_session("team.json");
    let app = router(h.supervisor.clone(), "http://localhost:3000");

    let response = app
        .clone()
        .oneshot(post_start(json!({
            "login_url": null,
            "session_path": "team.json",
            "task": "Where are the workspace settings?",
            "task_id": "http-ok"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let paths = body["paths"].as_array().unwrap();
    assert_eq!(paths.len(), 1);
    assert!(body["explanation"].as_str().unwrap().starts_with("1)"));

    let screenshot = app
        .oneshot(
            Request::builder()
                .uri(format!("/{}", paths[0].as_str().unwrap()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(screenshot.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_session_maps_to_400_with_detail() {
    let h = HarnessBuilder::new(team_app()).build(Arc::new(ScriptedPolicy::new(Vec::<Action>::new())));
    let app = router(h.supervisor.clone(), "http://localhost:3000");

    let response = app
        .oneshot(post_start(json!({
            "session_path": "absent.json",
            "task": "How do I invite a teammate?",
            "task_id": "2024-01-01T00:00:00.000Z"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.contains("absent.json"));
    assert!(detail.contains("login_url"));
    assert_eq!(h.opened(), 0);
}

#[tokio::test]
async fn malformed_bodies_are_validation_errors() {
    let h = HarnessBuilder::new(team_app()).build(Arc::new(ScriptedPolicy::new(Vec::<Action>::new())));
    let app = router(h.supervisor.clone(), "*");

    let empty_task = app
        .clone()
        .oneshot(post_start(json!({"session_path": "team.json", "task": "", "task_id": "x"})))
        .await
        .unwrap();
    assert_eq!(empty_task.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(json_body(empty_task).await["detail"].is_string());

    let missing_field = app
        .oneshot(post_start(json!({"task": "x"})))
        .await
        .unwrap();
    assert_eq!(missing_field.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn health_reports_service() {
    let h = HarnessBuilder::new(team_app()).build(Arc::new(ScriptedPolicy::new(Vec::<Action>::new())));
    let response = router(h.supervisor.clone(), "http://localhost:3000")
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "running");
}
