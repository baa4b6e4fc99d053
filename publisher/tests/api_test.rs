//! Publisher API Integration Tests
//!
//! Full HTTP request/response cycles through the router, without a network.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use publisher::api;
use publisher::config::Config;
use publisher::AppState;

fn setup_test_app() -> (axum::Router, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let config = Config::with_base_dir(temp_dir.path().join("hostedBots"));
    let app = api::router().with_state(AppState::new(config));
    (app, temp_dir)
}

async fn json_response(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.expect("Request failed");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    let value: Value = serde_json::from_slice(&body).expect("Invalid JSON response");
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let (app, _temp_dir) = setup_test_app();
    let (status, body) = json_response(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_status_of_unknown_bot_is_404() {
    let (app, _temp_dir) = setup_test_app();
    let (status, body) = json_response(&app, get("/bots/ghost/status")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);
    assert!(body["result"].get("endpointURL").is_none());
}

#[tokio::test]
async fn test_publish_with_incomplete_custom_runtime() {
    let (app, _temp_dir) = setup_test_app();
    let req = post_json(
        "/bots/bot1/publish",
        json!({
            "fullSettings": { "runtime": { "customRuntime": true, "path": "/nowhere" } },
            "project": { "dataDir": "/nowhere" }
        }),
    );

    let (status, body) = json_response(&app, req).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], 500);
    assert_eq!(body["result"]["version"], "default");
    assert!(body["result"]["message"]
        .as_str()
        .unwrap()
        .ends_with("Please specify path and command."));

    let (status, body) = json_response(&app, get("/bots/bot1/status")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], 500);

    let (_, bots) = json_response(&app, get("/bots")).await;
    assert_eq!(bots[0]["botId"], "bot1");
    assert_eq!(bots[0]["state"], "failed");
}

#[tokio::test]
async fn test_stop_unknown_bot_succeeds() {
    let (app, _temp_dir) = setup_test_app();
    let (status, body) = json_response(&app, post_json("/bots/ghost/stop", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");
}

#[tokio::test]
async fn test_history_of_unknown_bot_is_empty() {
    let (app, _temp_dir) = setup_test_app();
    let (status, body) = json_response(&app, get("/bots/ghost/history")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_rollback_without_installation_fails() {
    let (app, _temp_dir) = setup_test_app();
    let req = post_json("/bots/ghost/rollback", json!({ "version": "v1" }));
    let (status, body) = json_response(&app, req).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["result"]["version"], "v1");
}

#[tokio::test]
async fn test_remove_runtime_of_unknown_bot_is_404() {
    let (app, _temp_dir) = setup_test_app();
    let req = Request::builder()
        .method("DELETE")
        .uri("/bots/ghost/runtime")
        .body(Body::empty())
        .unwrap();
    let (status, body) = json_response(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn test_remove_runtime_deletes_bot_dir() {
    let (app, temp_dir) = setup_test_app();
    let bot_dir = temp_dir.path().join("hostedBots").join("bot1");
    std::fs::create_dir_all(bot_dir.join("runtime")).unwrap();

    let req = Request::builder()
        .method("DELETE")
        .uri("/bots/bot1/runtime")
        .body(Body::empty())
        .unwrap();
    let (status, body) = json_response(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["msg"], "Successfully removed runtime data for bot1");
    assert!(!bot_dir.exists());
}

#[tokio::test]
async fn test_remove_runtime_rejects_encoded_traversal() {
    let (app, temp_dir) = setup_test_app();
    let outside = temp_dir.path().join("outside");
    std::fs::create_dir_all(&outside).unwrap();
    std::fs::write(outside.join("precious.txt"), "keep me").unwrap();

    let req = Request::builder()
        .method("DELETE")
        .uri("/bots/..%2Foutside/runtime")
        .body(Body::empty())
        .unwrap();
    let (status, _) = json_response(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(outside.join("precious.txt").is_file());

    let (status, _) = json_response(&app, get("/bots/..%2Foutside/history")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}
