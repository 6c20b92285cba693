use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::docker::DockerApi;
use crate::error::InstancerError;
use crate::orchestrator::Orchestrator;

/// Thin plumbing over the orchestrator. The host platform fronts these
/// routes and is trusted to pass authenticated identity along, so the
/// `user`/`admin` parameters are taken at face value.
pub type AppState = Arc<Orchestrator<DockerApi>>;

fn ok(data: Value) -> (StatusCode, Json<Value>) {
    (StatusCode::OK, json!({ "status": "ok", "data": data }).into())
}

fn fail(e: InstancerError) -> (StatusCode, Json<Value>) {
    (
        e.status_code(),
        json!({ "status": "error", "message": e.to_string() }).into(),
    )
}

#[derive(Deserialize)]
struct PairQuery {
    user: i32,
    exercise: i32,
}

// POST /instance/start?user=&exercise=
async fn start(
    State(state): State<AppState>,
    Query(q): Query<PairQuery>,
) -> (StatusCode, Json<Value>) {
    match state.start(q.user, q.exercise).await {
        Ok(info) => ok(json!(info)),
        Err(e) => fail(e),
    }
}

// GET /instance/status?user=&exercise=
async fn status(
    State(state): State<AppState>,
    Query(q): Query<PairQuery>,
) -> (StatusCode, Json<Value>) {
    match state.status(q.user, q.exercise) {
        Some(info) => ok(json!({ "active": true, "instance": info })),
        None => ok(json!({ "active": false })),
    }
}

#[derive(Deserialize)]
struct StopQuery {
    instance: i32,
    user: i32,
    #[serde(default)]
    admin: bool,
}

// POST /instance/stop?instance=&user=&admin=
async fn stop(
    State(state): State<AppState>,
    Query(q): Query<StopQuery>,
) -> (StatusCode, Json<Value>) {
    match state.stop(q.instance, q.user, q.admin).await {
        Ok(()) => ok(json!({ "success": true })),
        Err(e) => fail(e),
    }
}

// POST /instance/solved?user=&exercise=
async fn solved(
    State(state): State<AppState>,
    Query(q): Query<PairQuery>,
) -> (StatusCode, Json<Value>) {
    state.solved(q.user, q.exercise).await;
    ok(json!({ "success": true }))
}

fn instance_router(state: AppState) -> Router {
    Router::new()
        .route("/start", post(start))
        .route("/status", get(status))
        .route("/stop", post(stop))
        .route("/solved", post(solved))
        .with_state(state)
}

#[derive(Deserialize)]
struct NewServerQuery {
    name: String,
    addr: String,
    port: u16,
}

// POST /admin/servers?name=&addr=&port=
async fn register_server(
    State(state): State<AppState>,
    Query(q): Query<NewServerQuery>,
) -> (StatusCode, Json<Value>) {
    match state.register_server(&q.name, &q.addr, q.port).await {
        Ok(server) => ok(json!(server)),
        Err(e) => fail(e),
    }
}

// GET /admin/servers
async fn servers(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    ok(json!(state.list_servers()))
}

// POST /admin/servers/:id/refresh
async fn refresh_images(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> (StatusCode, Json<Value>) {
    match state.refresh_images(id).await {
        Ok(images) => ok(json!(images)),
        Err(e) => fail(e),
    }
}

// GET /admin/instances
async fn instances(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    ok(json!(state.list_instances()))
}

#[derive(Deserialize)]
struct BindQuery {
    exercise: i32,
    server: i32,
    image: String,
}

// POST /admin/exercises?exercise=&server=&image=
async fn bind_exercise(
    State(state): State<AppState>,
    Query(q): Query<BindQuery>,
) -> (StatusCode, Json<Value>) {
    match state.bind_exercise(q.exercise, q.server, &q.image) {
        Ok(binding) => ok(json!(binding)),
        Err(e) => fail(e),
    }
}

// DELETE /admin/exercises/:id
async fn delete_exercise(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> (StatusCode, Json<Value>) {
    state.delete_exercise(id).await;
    ok(json!({ "success": true }))
}

fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/servers", post(register_server).get(servers))
        .route("/servers/:id/refresh", post(refresh_images))
        .route("/instances", get(instances))
        .route("/exercises", post(bind_exercise))
        .route("/exercises/:id", delete(delete_exercise))
        .with_state(state)
}

pub async fn run(addr: std::net::SocketAddr, state: AppState) {
    let app = Router::new()
        .route("/ping", get(|| async { (StatusCode::OK, "pong") }))
        .nest("/instance", instance_router(Arc::clone(&state)))
        .nest("/admin", admin_router(state))
        .layer(CorsLayer::new().allow_methods(Any).allow_origin(Any));

    tracing::info!("webserver started on {addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .unwrap();
}
