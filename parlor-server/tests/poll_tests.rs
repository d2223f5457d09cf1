//! Tests for long-poll delivery: immediate queue drains, suspension and
//! flush, coalescing, client abort, and the explicit timeout.

use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use parlor_server::api::{create_api_routes, ApiState};
use parlor_server::config::ServerConfig;

fn create_test_state() -> (Router, ApiState) {
    let mut config = ServerConfig::default();
    config.session.poll_timeout_secs = 1;
    let state = ApiState::new(config).expect("store init");
    (create_api_routes().with_state(state.clone()), state)
}

async fn make_request(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        request = request.header("authorization", format!("Bearer {token}"));
    }
    let request = if let Some(body) = body {
        request.body(Body::from(body.to_string()))
    } else {
        request.body(Body::empty())
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));
    (status, json)
}

async fn new_player(app: &Router) -> String {
    let (status, response) =
        make_request(app, Method::POST, "/api/player/new", None, Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    response["accessToken"].as_str().unwrap().to_string()
}

/// Owner creates and joins a room; a second member session joins too.
/// Returns `(owner_token, member_token, room_id)`.
async fn room_with_two_members(app: &Router) -> (String, String, String) {
    let owner = new_player(app).await;
    let (status, room) =
        make_request(app, Method::POST, "/api/room/new", Some(&owner), None).await;
    assert_eq!(status, StatusCode::OK);
    let room_id = room["id"].as_str().unwrap().to_string();
    let join = json!({"roomId": room_id});
    let (status, _) = make_request(
        app,
        Method::POST,
        "/api/join",
        Some(&owner),
        Some(join.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let member = new_player(app).await;
    let (status, _) =
        make_request(app, Method::POST, "/api/join", Some(&member), Some(join)).await;
    assert_eq!(status, StatusCode::OK);
    (owner, member, room_id)
}

fn poll_request(token: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri("/api/poll")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn queued_changes_are_delivered_immediately() {
    let (app, _state) = create_test_state();
    let (owner, member, room_id) = room_with_two_members(&app).await;

    // A room edit lands in the member's queue.
    make_request(
        &app,
        Method::PUT,
        "/api/room",
        Some(&owner),
        Some(json!({"state": "play"})),
    )
    .await;

    let (status, records) = make_request(&app, Method::GET, "/api/poll", Some(&member), None).await;
    assert_eq!(status, StatusCode::OK);
    let records = records.as_array().unwrap().clone();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["type"], json!("room"));
    assert_eq!(records[0]["entity"]["id"].as_str(), Some(room_id.as_str()));
    assert_eq!(records[0]["entity"]["state"], json!("play"));

    // The queue is spent; the next poll suspends and times out.
    let (status, body) = make_request(&app, Method::GET, "/api/poll", Some(&member), None).await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(body["status"], json!("retry"));
}

#[tokio::test]
async fn successive_changes_coalesce_to_the_latest_snapshot() {
    let (app, _state) = create_test_state();
    let (owner, member, _room_id) = room_with_two_members(&app).await;

    make_request(
        &app,
        Method::PUT,
        "/api/room",
        Some(&owner),
        Some(json!({"state": "play"})),
    )
    .await;
    make_request(
        &app,
        Method::PUT,
        "/api/room",
        Some(&owner),
        Some(json!({"state": "conclude"})),
    )
    .await;

    // One record per entity, holding the latest snapshot.
    let (status, records) = make_request(&app, Method::GET, "/api/poll", Some(&member), None).await;
    assert_eq!(status, StatusCode::OK);
    let records = records.as_array().unwrap().clone();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["entity"]["state"], json!("conclude"));
}

#[tokio::test]
async fn a_suspended_poll_resolves_when_the_room_changes() {
    let (app, _state) = create_test_state();
    let (owner, member, _room_id) = room_with_two_members(&app).await;

    let poll_app = app.clone();
    let request = poll_request(&member);
    let suspended = tokio::spawn(async move { poll_app.oneshot(request).await.unwrap() });
    // Let the poll attach before mutating.
    tokio::time::sleep(Duration::from_millis(50)).await;

    make_request(
        &app,
        Method::PUT,
        "/api/room",
        Some(&owner),
        Some(json!({"state": "play"})),
    )
    .await;

    let response = suspended.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let records: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(records.as_array().unwrap().len(), 1);
    assert_eq!(records[0]["entity"]["state"], json!("play"));
}

#[tokio::test]
async fn a_second_poll_on_the_same_session_conflicts() {
    let (app, _state) = create_test_state();
    let (owner, member, _room_id) = room_with_two_members(&app).await;

    let poll_app = app.clone();
    let request = poll_request(&member);
    let suspended = tokio::spawn(async move { poll_app.oneshot(request).await.unwrap() });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, _) = make_request(&app, Method::GET, "/api/poll", Some(&member), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // The first poll stays suspended and still resolves on a mutation.
    make_request(
        &app,
        Method::PUT,
        "/api/room",
        Some(&owner),
        Some(json!({"state": "play"})),
    )
    .await;

    let response = suspended.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let records: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(records.as_array().unwrap().len(), 1);
    assert_eq!(records[0]["entity"]["state"], json!("play"));
}

#[tokio::test]
async fn an_aborted_poll_detaches_and_keeps_the_queue() {
    let (app, state) = create_test_state();
    let (owner, member, _room_id) = room_with_two_members(&app).await;

    let member_session = member.clone();
    let poll_app = app.clone();
    let request = poll_request(&member);
    let suspended = tokio::spawn(async move { poll_app.oneshot(request).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(state.hub.has_pending(&member_session));

    // Client goes away mid-poll.
    suspended.abort();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!state.hub.has_pending(&member_session));

    // A change arriving now stays queued for the next poll.
    make_request(
        &app,
        Method::PUT,
        "/api/room",
        Some(&owner),
        Some(json!({"state": "play"})),
    )
    .await;
    let (status, records) = make_request(&app, Method::GET, "/api/poll", Some(&member), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(records.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn an_uneventful_poll_times_out_with_the_retry_status() {
    let (app, _state) = create_test_state();
    let token = new_player(&app).await;

    let started = std::time::Instant::now();
    let (status, body) = make_request(&app, Method::GET, "/api/poll", Some(&token), None).await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(body["status"], json!("retry"));
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn room_removal_delivers_a_null_entity_farewell() {
    let (app, state) = create_test_state();
    let (_owner, member, room_id) = room_with_two_members(&app).await;

    let poll_app = app.clone();
    let request = poll_request(&member);
    let suspended = tokio::spawn(async move { poll_app.oneshot(request).await.unwrap() });
    tokio::time::sleep(Duration::from_millis(50)).await;

    {
        let mut store = state.store.lock().await;
        store.remove_entity("room", &room_id).unwrap();
    }

    let response = suspended.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let records: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(records.as_array().unwrap().len(), 1);
    assert_eq!(records[0]["type"], json!("room"));
    assert!(records[0]["entity"].is_null());
}

#[tokio::test]
async fn destroying_the_session_resolves_the_poll_as_unauthorized() {
    let (app, _state) = create_test_state();
    let (_owner, member, _room_id) = room_with_two_members(&app).await;

    let poll_app = app.clone();
    let request = poll_request(&member);
    let suspended = tokio::spawn(async move { poll_app.oneshot(request).await.unwrap() });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, _) =
        make_request(&app, Method::POST, "/api/player/logout", Some(&member), None).await;
    assert_eq!(status, StatusCode::OK);

    let response = suspended.await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
