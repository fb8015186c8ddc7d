//! Integration tests for the HTTP front end

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{Harness, ScriptedFirmware};
use gantry_host::web::api::create_router;
use http_body_util::BodyExt; // for .collect().await
use serde_json::json;
use tower::util::ServiceExt; // for `oneshot`

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn gcode_request(code: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/gcode")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "code": code }).to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_status_reports_machine_and_job() {
    let harness = Harness::new(ScriptedFirmware::default());
    let app = create_router(harness.handler.clone());
    let request = Request::builder().uri("/api/v1/status").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "starting");
    assert_eq!(json["name"], "gantry-01");
    assert!(json.get("job").is_some());
}

#[tokio::test]
async fn test_local_code_result() {
    let harness = Harness::new(ScriptedFirmware::default());
    harness.write("gcodes/a.g", "G28\n");
    let app = create_router(harness.handler.clone());

    let response = app.oneshot(gcode_request("M20 S2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["kind"], "success");
    let listing: serde_json::Value = serde_json::from_str(json["text"].as_str().unwrap()).unwrap();
    assert_eq!(listing["files"], json!(["a.g"]));
    assert!(harness.firmware.calls().is_empty());
}

#[tokio::test]
async fn test_forwarded_code_result() {
    let harness = Harness::new(ScriptedFirmware::default());
    let app = create_router(harness.handler.clone());
    let response = app.oneshot(gcode_request("G28 X")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(harness.firmware.calls(), vec!["execute G28 X"]);
}

#[tokio::test]
async fn test_unsupported_and_malformed_codes() {
    let harness = Harness::new(ScriptedFirmware::default());
    let app = create_router(harness.handler.clone());

    let response = app.clone().oneshot(gcode_request("M10000")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let response = app.oneshot(gcode_request("")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await.get("error").is_some());
}

#[tokio::test]
async fn test_model_serves_only_host_namespaces() {
    let harness = Harness::new(ScriptedFirmware::default());
    let app = create_router(harness.handler.clone());

    let request = Request::builder().uri("/api/v1/model/network.name").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!("gantry-01"));

    let request = Request::builder().uri("/api/v1/model/heat").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_termination_cancels_codes_in_flight() {
    let harness = Harness::new(ScriptedFirmware {
        execute_delay: std::time::Duration::from_secs(60),
        ..ScriptedFirmware::default()
    });
    let app = create_router(harness.handler.clone());
    let pending = tokio::spawn(app.oneshot(gcode_request("G1 X10")));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    harness.handler.lifecycle().schedule_termination(1, "Shutting down");
    let response = tokio::time::timeout(std::time::Duration::from_secs(5), pending)
        .await
        .expect("code should not outlive the host")
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(harness.firmware.calls().is_empty());
}
