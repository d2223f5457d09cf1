//! HTTP API: routing, bearer-token auth, and request handlers.
//!
//! All store access goes through one async mutex in shared state, so
//! concurrent requests interleave only between store operations, never
//! inside one. The poll handler is the single place a request spans
//! multiple events; see [`crate::poll`].

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use parlor_core::{entity_id, id, Entity, Patch, SliceDef, Store, StoreError};

use crate::config::ServerConfig;
use crate::poll::{PollGuard, PollHub};
use crate::room::{self, RoomSlice};
use crate::session::{self, SessionSlice};
use crate::user::{self, UserSlice};
use crate::vote::{self, VoteSlice};

/// Shared application state.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<Mutex<Store>>,
    pub hub: Arc<PollHub>,
    pub config: Arc<ServerConfig>,
}

impl ApiState {
    /// Build the store with its four slices and wrap it for sharing.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let hub = Arc::new(PollHub::new());
        let store = Store::init(vec![
            SliceDef::with_schema("user", Arc::new(UserSlice)),
            SliceDef::with_schema("room", Arc::new(RoomSlice)),
            SliceDef::with_schema("vote", Arc::new(VoteSlice)),
            SliceDef::with_schema("session", Arc::new(SessionSlice::new(Arc::clone(&hub)))),
        ])?;
        Ok(Self {
            store: Arc::new(Mutex::new(store)),
            hub,
            config: Arc::new(config),
        })
    }
}

/// The API route table. State is attached by the caller.
pub fn create_api_routes() -> Router<ApiState> {
    Router::new()
        .route("/api/time", get(get_time))
        .route("/api/player/new", post(new_player))
        .route("/api/player/login", post(login))
        .route("/api/player/logout", post(logout))
        .route("/api/player", delete(delete_player))
        .route("/api/room/new", post(new_room))
        .route("/api/room", get(get_room).put(put_room))
        .route("/api/join", post(join))
        .route("/api/leave", post(leave))
        .route("/api/improvement", post(post_improvement))
        .route("/api/vote", post(post_vote))
        .route("/api/election", get(get_election))
        .route("/api/poll", get(poll))
}

/* Errors.
 ******************************************************************/

/// Wire-level error for every handler.
#[derive(Debug)]
pub enum ApiError {
    /// Missing or stale bearer token.
    Unauthorized,
    /// Authenticated but not allowed to do this.
    Forbidden,
    /// Missing resource.
    NotFound(String),
    /// Malformed or rejected input.
    BadRequest(String),
    /// Duplicate poll, id collision, unique-field collision.
    Conflict(String),
    /// A suspended poll ran out its window; the client should retry
    /// immediately rather than back off.
    PollTimeout,
    /// Programming or setup mistake surfaced at request time.
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Configuration(message) => Self::Internal(message),
            StoreError::NotFound { slice, id } => Self::NotFound(format!("{slice} '{id}'")),
            StoreError::Validation(message) => Self::BadRequest(message),
            StoreError::Conflict(message) => Self::Conflict(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", String::new()),
            Self::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", String::new()),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, "NOT_FOUND", message),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", message),
            Self::Conflict(message) => (StatusCode::CONFLICT, "CONFLICT", message),
            Self::PollTimeout => {
                // Distinguished status: "nothing happened, poll again now".
                let body = json!({"status": "retry"});
                return (StatusCode::REQUEST_TIMEOUT, Json(body)).into_response();
            }
            Self::Internal(message) => {
                tracing::error!(%message, "internal error at request boundary");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    String::new(),
                )
            }
        };
        let body = json!({"error": {"code": code, "message": message}});
        (status, Json(body)).into_response()
    }
}

/* Authentication.
 ******************************************************************/

struct Auth {
    session_id: String,
    user_id: String,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let authorization = headers.get("authorization")?.to_str().ok()?;
    let (method, token) = authorization.trim().split_once(' ')?;
    if !method.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Resolve the bearer token to a live session, refreshing its expiry.
async fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<Auth, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    let mut store = state.store.lock().await;
    let session = store
        .get_entity("session", token)
        .cloned()
        .ok_or(ApiError::Unauthorized)?;
    session::touch_session(&mut store, token)?;
    Ok(Auth {
        session_id: token.to_string(),
        user_id: session
            .get("userId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

/// The session's current room id, or the explicit override. Hand-entered
/// room ids get normalized before lookup.
fn room_id_for(session: &Entity, explicit: Option<&str>) -> Result<String, ApiError> {
    if let Some(room_id) = explicit {
        return Ok(id::normalize_id(room_id));
    }
    session
        .get("roomId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ApiError::Conflict("session is not in a room".into()))
}

/* Player endpoints.
 ******************************************************************/

#[derive(Debug, Deserialize)]
struct NewPlayerRequest {
    name: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    name: String,
    password: Option<String>,
}

/// Create a user (persistent when a password is given) plus a session.
async fn new_player(
    State(state): State<ApiState>,
    Json(request): Json<NewPlayerRequest>,
) -> Result<Json<Value>, ApiError> {
    if let Some(name) = request.name.as_deref() {
        if !user::validate_user_name(name) {
            return Err(ApiError::BadRequest("invalid user name".into()));
        }
    }
    if let Some(password) = request.password.as_deref() {
        if !user::validate_new_password(password) {
            return Err(ApiError::BadRequest("invalid password".into()));
        }
    }

    let mut store = state.store.lock().await;
    let created = match &request.name {
        Some(name) => {
            if user::user_by_name(&store, name).is_some() {
                return Err(ApiError::Conflict(format!("name '{name}' in use")));
            }
            let mut user = Entity::new();
            user.insert("name".into(), Value::String(name.clone()));
            store.add_entity("user", Some(user))?
        }
        // Anonymous path: the constructor hook picks a free name.
        None => store.add_entity("user", None)?,
    };
    open_session(&mut store, &created, request.password.as_deref())
}

/// Log an existing user in.
async fn login(
    State(state): State<ApiState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut store = state.store.lock().await;
    let user = user::user_by_name_and_password(&store, &request.name, request.password.as_deref())
        .ok_or(ApiError::Forbidden)?;
    open_session(&mut store, &user, None)
}

/// Create the session for a user, optionally setting a first password.
fn open_session(
    store: &mut Store,
    user: &Entity,
    new_password: Option<&str>,
) -> Result<Json<Value>, ApiError> {
    let user_id = entity_id(user)
        .ok_or_else(|| ApiError::Internal("user entity lost its id".into()))?
        .to_string();
    if let Some(password) = new_password {
        if user.get("hash").is_none() {
            user::change_password(store, &user_id, None, password)?;
        }
    }
    let session = store.add_entity("session", None)?;
    let session_id = entity_id(&session)
        .ok_or_else(|| ApiError::Internal("session entity lost its id".into()))?
        .to_string();
    if let Err(error) =
        store.update_entity("session", &session_id, &Patch::new().set("userId", &*user_id))
    {
        // Roll the blank session back rather than leak it.
        let _ = store.remove_entity("session", &session_id);
        return Err(error.into());
    }
    let name = user.get("name").cloned().unwrap_or(Value::Null);
    Ok(Json(json!({
        "accessToken": session_id,
        "userId": user_id,
        "name": name,
    })))
}

async fn logout(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let mut store = state.store.lock().await;
    store.remove_entity("session", &auth.session_id)?;
    Ok(StatusCode::OK)
}

async fn delete_player(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let mut store = state.store.lock().await;
    store.remove_entity("session", &auth.session_id)?;
    if !auth.user_id.is_empty() {
        store.remove_entity("user", &auth.user_id)?;
    }
    Ok(StatusCode::OK)
}

/* Room endpoints.
 ******************************************************************/

#[derive(Debug, Deserialize)]
struct RoomQuery {
    #[serde(rename = "roomId")]
    room_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    #[serde(rename = "roomId")]
    room_id: String,
}

async fn get_time() -> String {
    chrono::Utc::now().to_rfc3339()
}

async fn new_room(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let mut store = state.store.lock().await;
    let room = room::create_room(&mut store, &auth.user_id)?;
    Ok(Json(Value::Object(room)))
}

async fn get_room(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<RoomQuery>,
) -> Result<Json<Value>, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let store = state.store.lock().await;
    let session = store
        .get_entity("session", &auth.session_id)
        .ok_or(ApiError::Unauthorized)?;
    let room_id = room_id_for(session, query.room_id.as_deref())?;
    let room = store
        .get_entity("room", &room_id)
        .ok_or_else(|| ApiError::NotFound(format!("room '{room_id}'")))?;
    Ok(Json(Value::Object(room.clone())))
}

async fn put_room(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let Value::Object(mut incoming) = body else {
        return Err(ApiError::BadRequest("room update must be an object".into()));
    };
    // The id comes from the session, never the body.
    incoming.remove("id");

    let mut store = state.store.lock().await;
    let session = store
        .get_entity("session", &auth.session_id)
        .cloned()
        .ok_or(ApiError::Unauthorized)?;
    let room_id = room_id_for(&session, None)?;
    let room = store
        .get_entity("room", &room_id)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("room '{room_id}'")))?;
    if !room::user_may_edit_room(&auth.user_id, &room) {
        return Err(ApiError::Forbidden);
    }
    let updated = store.update_entity("room", &room_id, &Patch::from_entity(&incoming))?;
    Ok(Json(Value::Object(updated)))
}

async fn join(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<JoinRequest>,
) -> Result<Json<Value>, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    // Join codes arrive hand-typed; fold confusable characters first.
    let room_id = id::normalize_id(&request.room_id);
    let mut store = state.store.lock().await;
    let room = room::join_room(&mut store, &auth.session_id, &room_id)?;
    Ok(Json(Value::Object(room)))
}

async fn leave(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let mut store = state.store.lock().await;
    let session = store
        .get_entity("session", &auth.session_id)
        .cloned()
        .ok_or(ApiError::Unauthorized)?;
    let room_id = room_id_for(&session, None)?;
    room::leave_room(&mut store, &auth.session_id, &room_id)?;
    Ok(StatusCode::OK)
}

/* Improvements and elections.
 ******************************************************************/

#[derive(Debug, Deserialize)]
struct ImprovementRequest {
    serial: Value,
}

#[derive(Debug, Deserialize)]
struct VoteRequest {
    target: String,
}

async fn post_improvement(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<ImprovementRequest>,
) -> Result<Json<Value>, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let mut store = state.store.lock().await;
    let session = store
        .get_entity("session", &auth.session_id)
        .cloned()
        .ok_or(ApiError::Unauthorized)?;
    let room_id = room_id_for(&session, None)?;
    let room =
        room::register_improvement(&mut store, &room_id, &auth.user_id, request.serial)?;
    Ok(Json(Value::Object(room)))
}

async fn post_vote(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<VoteRequest>,
) -> Result<Json<Value>, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let mut store = state.store.lock().await;
    let session = store
        .get_entity("session", &auth.session_id)
        .cloned()
        .ok_or(ApiError::Unauthorized)?;
    let room_id = room_id_for(&session, None)?;
    let election = vote::cast_vote(&mut store, &room_id, &auth.user_id, &request.target)?;
    Ok(Json(election))
}

async fn get_election(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let store = state.store.lock().await;
    let session = store
        .get_entity("session", &auth.session_id)
        .ok_or(ApiError::Unauthorized)?;
    let room_id = room_id_for(session, None)?;
    let election = vote::get_election_for_room(&store, &room_id)
        .ok_or_else(|| ApiError::NotFound("no election is running".into()))?;
    Ok(Json(election))
}

/* Long poll.
 ******************************************************************/

/// The long-poll endpoint. Delivers the session's queued change records,
/// immediately when the queue is non-empty, otherwise after suspension.
/// The delivered array is never empty; an uneventful window resolves with
/// the distinguished retry status instead.
async fn poll(State(state): State<ApiState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let auth = authenticate(&state, &headers).await?;

    // Queue check and suspension happen under one store lock: a mutation
    // cannot slip between "queue is empty" and "continuation attached".
    let mut rx = {
        let mut store = state.store.lock().await;
        let session = store
            .get_entity("session", &auth.session_id)
            .cloned()
            .ok_or(ApiError::Unauthorized)?;
        let changes = session
            .get("changes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if !changes.is_empty() {
            store.update_entity(
                "session",
                &auth.session_id,
                &Patch::new().set("changes", Vec::<Value>::new()),
            )?;
            return Ok(Json(Value::Array(changes)).into_response());
        }
        state
            .hub
            .attach(&auth.session_id)
            .map_err(|conflict| ApiError::Conflict(conflict.to_string()))?
    };

    // From here the request spans multiple events; the guard detaches the
    // continuation if the client aborts mid-await.
    let mut guard = PollGuard::new(Arc::clone(&state.hub), auth.session_id.clone());
    match tokio::time::timeout(state.config.poll_timeout(), &mut rx).await {
        Ok(Ok(records)) => {
            guard.disarm();
            Ok(Json(Value::Array(records)).into_response())
        }
        Ok(Err(_closed)) => {
            // Sender dropped without a flush: the session was destroyed
            // while we were suspended.
            guard.disarm();
            Err(ApiError::Unauthorized)
        }
        Err(_elapsed) => {
            guard.disarm();
            state.hub.detach(&auth.session_id);
            // A flush may have won the race against the timer.
            if let Ok(records) = rx.try_recv() {
                return Ok(Json(Value::Array(records)).into_response());
            }
            Err(ApiError::PollTimeout)
        }
    }
}
