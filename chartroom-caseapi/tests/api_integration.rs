//! End-to-end tests for the case-update API: real router, real store,
//! bearer auth, and the conflict scenarios that make optimistic
//! concurrency worth having.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use chartroom_caseapi::{router, AppState, CaseStore, CaseStoreConfig};
use chartroom_collab::docsync::EngineConfig;
use chartroom_collab::{
    CollabGateway, DocumentEngine, FanoutBus, GatewayConfig, IdentityVerifier,
};

const SECRET: &[u8] = b"caseapi-test-secret";

fn test_state(dir: &tempfile::TempDir) -> (AppState, Arc<FanoutBus>) {
    let store = Arc::new(
        CaseStore::open(CaseStoreConfig::for_testing(dir.path().join("cases"))).unwrap(),
    );
    let verifier = Arc::new(IdentityVerifier::new(SECRET));
    let bus = Arc::new(FanoutBus::new(16));
    let engine = Arc::new(DocumentEngine::new(
        Uuid::new_v4(),
        bus.clone(),
        None,
        EngineConfig::default(),
    ));
    let gateway = CollabGateway::new(GatewayConfig::default(), verifier.clone(), bus.clone(), engine);
    let state = AppState {
        store,
        verifier,
        health: gateway.health_handle(),
    };
    (state, bus)
}

fn token() -> String {
    IdentityVerifier::new(SECRET)
        .mint(Uuid::new_v4(), "Dr. Osei", "physician", 3600)
        .unwrap()
}

fn patch(case_id: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("PATCH")
        .uri(format!("/case/{case_id}"))
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(path: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_patch_creates_case_at_version_one() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _bus) = test_state(&dir);
    let app = router(state);
    let token = token();

    let response = app
        .oneshot(patch(
            "case-42",
            &token,
            json!({"section": "status", "data": "admitted", "version": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["version"], 1);
    assert_eq!(body["sections"]["status"], "admitted");
}

#[tokio::test]
async fn test_missing_token_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _bus) = test_state(&dir);
    let app = router(state);

    let request = Request::builder()
        .method("PATCH")
        .uri("/case/case-42")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"section": "status", "data": "x", "version": 0}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_garbage_token_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _bus) = test_state(&dir);
    let app = router(state);

    let response = app
        .oneshot(patch(
            "case-42",
            "not-a-token",
            json!({"section": "status", "data": "x", "version": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_stale_version_returns_conflict_with_current_state() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _bus) = test_state(&dir);
    let app = router(state);
    let token = token();

    for (data, version) in [("admitted", 0), ("discharged", 1)] {
        let response = app
            .clone()
            .oneshot(patch(
                "case-42",
                &token,
                json!({"section": "status", "data": data, "version": version}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // A writer holding version 1 is now stale.
    let response = app
        .oneshot(patch(
            "case-42",
            &token,
            json!({"section": "status", "data": "transferred", "version": 1}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let body = body_json(response).await;
    assert_eq!(body["current"]["version"], 2);
    assert_eq!(body["current"]["sections"]["status"], "discharged");
}

#[tokio::test]
async fn test_stale_version_conflicts_both_times() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _bus) = test_state(&dir);
    let app = router(state);
    let token = token();

    app.clone()
        .oneshot(patch("case-42", &token, json!({"section": "s", "data": 1, "version": 0})))
        .await
        .unwrap();
    app.clone()
        .oneshot(patch("case-42", &token, json!({"section": "s", "data": 2, "version": 1})))
        .await
        .unwrap();

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(patch("case-42", &token, json!({"section": "s", "data": 3, "version": 1})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}

#[tokio::test]
async fn test_concurrent_updates_exactly_one_wins() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _bus) = test_state(&dir);
    let app = router(state);
    let token = token();

    // Seed to version 3.
    for (v, known) in [(1, 0), (2, 1), (3, 2)] {
        app.clone()
            .oneshot(patch(
                "case-42",
                &token,
                json!({"section": "treatmentPlan", "data": v, "version": known}),
            ))
            .await
            .unwrap();
    }

    let a = app.clone().oneshot(patch(
        "case-42",
        &token,
        json!({"section": "treatmentPlan", "data": {"drug": "metformin"}, "version": 3}),
    ));
    let b = app.clone().oneshot(patch(
        "case-42",
        &token,
        json!({"section": "treatmentPlan", "data": {"drug": "insulin"}, "version": 3}),
    ));
    let (ra, rb) = tokio::join!(a, b);
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    let statuses = [ra.status(), rb.status()];
    assert!(statuses.contains(&StatusCode::OK));
    assert!(statuses.contains(&StatusCode::CONFLICT));

    let conflicted = if ra.status() == StatusCode::CONFLICT { ra } else { rb };
    let body = body_json(conflicted).await;
    assert_eq!(body["current"]["version"], 4);
}

#[tokio::test]
async fn test_empty_section_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _bus) = test_state(&dir);
    let app = router(state);

    let response = app
        .oneshot(patch(
            "case-42",
            &token(),
            json!({"section": "  ", "data": "x", "version": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_case_with_nonzero_version_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _bus) = test_state(&dir);
    let app = router(state);

    let response = app
        .oneshot(patch(
            "case-404",
            &token(),
            json!({"section": "status", "data": "x", "version": 7}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_get_case() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _bus) = test_state(&dir);
    let app = router(state);
    let token = token();

    app.clone()
        .oneshot(patch(
            "case-42",
            &token,
            json!({"section": "priority", "data": "high", "version": 0}),
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(get("/case/case-42", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["case_id"], "case-42");
    assert_eq!(body["sections"]["priority"], "high");

    let response = app.oneshot(get("/case/case-404", &token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_healthz_reports_bus_state() {
    let dir = tempfile::tempdir().unwrap();
    let (state, bus) = test_state(&dir);
    let app = router(state);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["bus_healthy"], true);

    // A degraded bus is surfaced, not hidden.
    bus.set_connected(false);
    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["bus_healthy"], false);
}
